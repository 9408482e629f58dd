// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode.rs - 模型输出解码
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

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::geometry::NormBox;
use crate::label::LabelSet;

/// 每个框的固定字段数：x, y, w, h, objectness
pub const BOX_FIELDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
  pub scale: f32,
  pub zero_point: i32,
}

impl Default for Quantization {
  fn default() -> Self {
    Self {
      scale: 1.0,
      zero_point: 0,
    }
  }
}

impl Quantization {
  pub fn new(scale: f32, zero_point: i32) -> Self {
    Self { scale, zero_point }
  }

  #[inline]
  pub fn dequantize(&self, raw: i32) -> f32 {
    (raw - self.zero_point) as f32 * self.scale
  }

  #[inline]
  pub fn quantize(&self, value: f32) -> i32 {
    (value / self.scale).round() as i32 + self.zero_point
  }

  pub fn quantize_u8(&self, value: f32) -> u8 {
    self.quantize(value).clamp(u8::MIN as i32, u8::MAX as i32) as u8
  }

  pub fn quantize_i8(&self, value: f32) -> i8 {
    self.quantize(value).clamp(i8::MIN as i32, i8::MAX as i32) as i8
  }
}

/// 模型输出张量的排布：`boxes × (5 + classes)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLayout {
  pub boxes: usize,
  pub classes: usize,
}

impl OutputLayout {
  pub fn stride(&self) -> usize {
    BOX_FIELDS + self.classes
  }

  pub fn len(&self) -> usize {
    self.boxes * self.stride()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 推理引擎返回的输出缓冲区
#[derive(Debug, Clone)]
pub enum OutputTensor {
  Float(Box<[f32]>),
  UInt8 {
    data: Box<[u8]>,
    quantization: Quantization,
  },
  Int8 {
    data: Box<[i8]>,
    quantization: Quantization,
  },
}

impl OutputTensor {
  pub fn len(&self) -> usize {
    match self {
      OutputTensor::Float(data) => data.len(),
      OutputTensor::UInt8 { data, .. } => data.len(),
      OutputTensor::Int8 { data, .. } => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[inline]
  pub fn value(&self, index: usize) -> f32 {
    match self {
      OutputTensor::Float(data) => data[index],
      OutputTensor::UInt8 { data, quantization } => quantization.dequantize(data[index] as i32),
      OutputTensor::Int8 { data, quantization } => quantization.dequantize(data[index] as i32),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("输出大小不匹配: 期望 {expected} 个值 ({boxes} 框 x {stride}), 实际 {actual}")]
  ShapeMismatch {
    expected: usize,
    actual: usize,
    boxes: usize,
    stride: usize,
  },
}

/// 候选检测，坐标为模型网格上的归一化中心格式
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
  pub ref_id: u64,
  pub timestamp_ms: i64,
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
  pub objectness: f32,
  pub class_id: usize,
  pub confidence: f32,
  pub label: Arc<str>,
}

impl RawDetection {
  /// 转为左上角格式
  pub fn top_left(&self) -> NormBox {
    NormBox {
      x: self.cx - self.w / 2.0,
      y: self.cy - self.h / 2.0,
      w: self.w,
      h: self.h,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
  #[serde(default = "Thresholds::default_objectness")]
  pub objectness: f32,
  #[serde(default = "Thresholds::default_confidence")]
  pub confidence: f32,
  #[serde(default = "Thresholds::default_nms")]
  pub nms: f32,
}

impl Thresholds {
  fn default_objectness() -> f32 {
    0.25
  }

  fn default_confidence() -> f32 {
    0.30
  }

  fn default_nms() -> f32 {
    0.05
  }
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      objectness: Self::default_objectness(),
      confidence: Self::default_confidence(),
      nms: Self::default_nms(),
    }
  }
}

pub struct Decoder {
  layout: OutputLayout,
  objectness_threshold: f32,
  confidence_threshold: f32,
  next_ref_id: AtomicU64,
}

impl Decoder {
  pub fn new(layout: OutputLayout, thresholds: &Thresholds) -> Self {
    Self {
      layout,
      objectness_threshold: thresholds.objectness,
      confidence_threshold: thresholds.confidence,
      next_ref_id: AtomicU64::new(0),
    }
  }

  pub fn layout(&self) -> OutputLayout {
    self.layout
  }

  /// 解码一次推理的输出
  ///
  /// objectness 低于阈值的框直接丢弃；其余框取 `类别分数 × objectness`
  /// 最大的类别（并列时取编号最小者），仅当该值严格大于置信度阈值时输出。
  pub fn decode(
    &self,
    output: &OutputTensor,
    labels: &LabelSet,
  ) -> Result<Vec<RawDetection>, DecodeError> {
    let stride = self.layout.stride();
    let expected = self.layout.len();
    if output.len() != expected {
      return Err(DecodeError::ShapeMismatch {
        expected,
        actual: output.len(),
        boxes: self.layout.boxes,
        stride,
      });
    }

    let timestamp_ms = chrono::Utc::now().timestamp_millis();
    let mut detections = Vec::new();

    for i in 0..self.layout.boxes {
      let base = i * stride;

      let objectness = output.value(base + 4);
      if objectness < self.objectness_threshold {
        continue;
      }

      let cx = output.value(base);
      let cy = output.value(base + 1);
      let w = output.value(base + 2);
      let h = output.value(base + 3);

      let mut best: Option<(usize, f32)> = None;
      for c in 0..self.layout.classes {
        let confidence = output.value(base + BOX_FIELDS + c) * objectness;
        if best.is_none_or(|(_, max)| confidence > max) {
          best = Some((c, confidence));
        }
      }

      let Some((class_id, confidence)) = best else {
        continue;
      };
      if confidence <= self.confidence_threshold {
        continue;
      }

      detections.push(RawDetection {
        ref_id: self.next_ref_id.fetch_add(1, Ordering::Relaxed),
        timestamp_ms,
        cx,
        cy,
        w,
        h,
        objectness,
        class_id,
        confidence,
        label: labels.get(class_id),
      });
    }

    debug!("NMS 前检测到 {} 个物体", detections.len());
    Ok(detections)
  }
}
