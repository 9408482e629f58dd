// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detection.rs - 最终检测结果
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

use serde::Serialize;
use tracing::debug;

use crate::decode::RawDetection;
use crate::geometry::GeometryParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
  pub width: u32,
  pub height: u32,
}

/// 原图像素坐标，左上角 + 尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelBox {
  pub x: u32,
  pub y: u32,
  pub w: u32,
  pub h: u32,
}

/// 相对原图的归一化中心格式
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct YoloBox {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalDetection {
  pub index: Option<u32>,
  pub image: ImageSize,
  pub label: String,
  pub class_id: usize,
  pub confidence: f32,
  pub bbox_pixels: PixelBox,
  pub bbox_yolo: YoloBox,
}

/// 把抑制后的候选检测映射回原图坐标
///
/// 逆映射无效（落在填充带）或裁剪后面积为零的检测被丢弃。
pub fn finalize(
  detections: Vec<RawDetection>,
  geometry: &GeometryParams,
  index: Option<u32>,
) -> Vec<FinalDetection> {
  let (width, height) = geometry.source_size();
  let (fw, fh) = (width as f64, height as f64);

  detections
    .into_iter()
    .filter_map(|det| {
      let Some(b) = geometry.to_source(det.top_left()) else {
        debug!("检测 {} 落在填充区域，丢弃", det.ref_id);
        return None;
      };

      let mut x = b.x as f64 * fw;
      let mut y = b.y as f64 * fh;
      let mut w = b.w as f64 * fw;
      let mut h = b.h as f64 * fh;

      if x < 0.0 {
        w += x;
        x = 0.0;
      }
      if y < 0.0 {
        h += y;
        y = 0.0;
      }
      if x + w > fw {
        w = fw - x;
      }
      if y + h > fh {
        h = fh - y;
      }

      let bbox_pixels = PixelBox {
        x: x as u32,
        y: y as u32,
        w: w.max(0.0) as u32,
        h: h.max(0.0) as u32,
      };
      if bbox_pixels.w == 0
        || bbox_pixels.h == 0
        || bbox_pixels.x >= width
        || bbox_pixels.y >= height
      {
        debug!("检测 {} 裁剪后为空，丢弃", det.ref_id);
        return None;
      }

      let bbox_yolo = YoloBox {
        x: ((x + w / 2.0) / fw) as f32,
        y: ((y + h / 2.0) / fh) as f32,
        w: (w / fw) as f32,
        h: (h / fh) as f32,
      };

      Some(FinalDetection {
        index,
        image: ImageSize { width, height },
        label: det.label.to_string(),
        class_id: det.class_id,
        confidence: det.confidence,
        bbox_pixels,
        bbox_yolo,
      })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::ScaleMode;
  use approx::assert_abs_diff_eq;
  use std::sync::Arc;

  fn raw(cx: f32, cy: f32, w: f32, h: f32) -> RawDetection {
    RawDetection {
      ref_id: 0,
      timestamp_ms: 0,
      cx,
      cy,
      w,
      h,
      objectness: 0.9,
      class_id: 2,
      confidence: 0.8,
      label: Arc::from("car"),
    }
  }

  #[test]
  fn letterboxed_detection_maps_to_original_pixels() {
    let g = GeometryParams::compute(ScaleMode::Letterbox, 1920, 1080, 640, 640);
    // 原图 (960, 540) 为中心、300x150 的框：模型中心 (320, 320)，尺寸 100x50
    let det = raw(0.5, 0.5, 100.0 / 640.0, 50.0 / 640.0);
    let out = finalize(vec![det], &g, Some(4));
    assert_eq!(out.len(), 1);

    let d = &out[0];
    assert_eq!(d.index, Some(4));
    assert_eq!(d.image, ImageSize { width: 1920, height: 1080 });
    assert_eq!(d.label, "car");
    assert_eq!(d.class_id, 2);
    assert!((d.bbox_pixels.x as i64 - 810).abs() <= 1);
    assert!((d.bbox_pixels.y as i64 - 465).abs() <= 1);
    assert!((d.bbox_pixels.w as i64 - 300).abs() <= 1);
    assert!((d.bbox_pixels.h as i64 - 150).abs() <= 1);
    assert_abs_diff_eq!(d.bbox_yolo.x, 0.5, epsilon = 1e-3);
    assert_abs_diff_eq!(d.bbox_yolo.y, 0.5, epsilon = 1e-3);
    assert_abs_diff_eq!(d.bbox_yolo.w, 300.0 / 1920.0, epsilon = 1e-3);
  }

  #[test]
  fn detection_in_padding_is_dropped() {
    let g = GeometryParams::compute(ScaleMode::Letterbox, 1920, 1080, 640, 640);
    let det = raw(0.5, 0.05, 0.1, 0.05);
    assert!(finalize(vec![det], &g, None).is_empty());
  }

  #[test]
  fn boxes_are_clamped_inside_image() {
    let g = GeometryParams::compute(ScaleMode::Stretch, 200, 100, 640, 640);
    // 右下角伸出图像
    let det = raw(0.95, 0.95, 0.3, 0.3);
    let out = finalize(vec![det], &g, None);
    assert_eq!(out.len(), 1);
    let b = out[0].bbox_pixels;
    assert!(b.x < 200 && b.y < 100);
    assert!(b.x + b.w <= 200);
    assert!(b.y + b.h <= 100);
    assert_eq!(b.x, 160);
    assert_eq!(b.w, 40);
  }

  #[test]
  fn serializes_with_api_field_names() {
    let g = GeometryParams::identity(640, 640);
    let out = finalize(vec![raw(0.5, 0.5, 0.25, 0.25)], &g, None);
    let json = serde_json::to_value(&out).unwrap();
    let first = &json[0];
    assert_eq!(first["label"], "car");
    assert_eq!(first["index"], serde_json::Value::Null);
    assert_eq!(first["bbox_pixels"]["x"], 240);
    assert_eq!(first["bbox_pixels"]["w"], 160);
    assert_eq!(first["image"]["width"], 640);
  }
}
