// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nms.rs - 非极大值抑制
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use tracing::debug;

use crate::decode::RawDetection;
use crate::geometry::NormBox;

/// 计算两个左上角格式边界框的 IoU，并集面积为 0 时返回 0
pub fn iou(a: &NormBox, b: &NormBox) -> f32 {
  let x1 = a.x.max(b.x);
  let y1 = a.y.max(b.y);
  let x2 = (a.x + a.w).min(b.x + b.w);
  let y2 = (a.y + a.h).min(b.y + b.h);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = a.w * a.h + b.w * b.h - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 按原始顺序的贪心抑制，只比较同一标签的检测
///
/// 置信度相同时保留靠前的一个。输出保持幸存者的相对顺序。
pub fn suppress(detections: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
  let size = detections.len();
  let boxes = detections
    .iter()
    .map(RawDetection::top_left)
    .collect::<Vec<_>>();
  let mut keep = vec![true; size];

  for i in 0..size {
    if !keep[i] {
      continue;
    }

    for j in (i + 1)..size {
      if !keep[j] || detections[i].label != detections[j].label {
        continue;
      }

      if iou(&boxes[i], &boxes[j]) > threshold {
        if detections[i].confidence >= detections[j].confidence {
          keep[j] = false;
        } else {
          keep[i] = false;
          break;
        }
      }
    }
  }

  let result = detections
    .into_iter()
    .zip(keep)
    .filter_map(|(det, keep)| keep.then_some(det))
    .collect::<Vec<_>>();

  debug!("NMS: {} -> {} 个检测", size, result.len());
  result
}
