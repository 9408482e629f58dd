// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/replay.rs - 回放录制的模型输出
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

use std::path::Path;

use tracing::{debug, info};
use url::Url;

use super::{EngineError, InferenceEngine, ModelInfo, decoded_path, query_map, query_value};
use crate::decode::{OutputLayout, OutputTensor, Quantization};
use crate::frame::{AsNhwcFrame, RgbNhwcFrame};
use crate::{FromUrl, FromUrlWithScheme};

const REPLAY_SCHEME: &str = "replay";

/// 录制输出的元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDtype {
  F32,
  U8,
  I8,
}

impl ReplayDtype {
  fn parse(s: &str) -> Result<Self, EngineError> {
    match s {
      "f32" | "float" => Ok(ReplayDtype::F32),
      "u8" | "uint8" => Ok(ReplayDtype::U8),
      "i8" | "int8" => Ok(ReplayDtype::I8),
      _ => Err(EngineError::Config(format!("不支持的数据类型: {}", s))),
    }
  }

  fn element_size(&self) -> usize {
    match self {
      ReplayDtype::F32 => 4,
      ReplayDtype::U8 | ReplayDtype::I8 => 1,
    }
  }
}

/// 对任何输入都返回同一份录制输出的引擎，用于无硬件环境
///
/// URL 形如 `replay:///path/output.bin?width=640&height=640&boxes=25200&classes=80&dtype=u8&scale=0.0039&zero_point=0`，
/// 浮点数据按小端序存储。
pub struct ReplayEngine {
  info: ModelInfo,
  output: OutputTensor,
}

impl FromUrl for ReplayEngine {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != REPLAY_SCHEME {
      return Err(EngineError::SchemeMismatch);
    }

    let query = query_map(url);
    let info = ModelInfo {
      width: query_value(&query, "width", 640)?,
      height: query_value(&query, "height", 640)?,
      layout: OutputLayout {
        boxes: query_value(&query, "boxes", 25200)?,
        classes: query_value(&query, "classes", 80)?,
      },
    };
    let dtype = match query.get("dtype") {
      Some(s) => ReplayDtype::parse(s)?,
      None => ReplayDtype::U8,
    };
    let quantization = Quantization::new(
      query_value(&query, "scale", 1.0 / 255.0)?,
      query_value(&query, "zero_point", 0)?,
    );

    let path = decoded_path(url)?;
    Self::load(path, info, dtype, quantization)
  }
}

impl FromUrlWithScheme for ReplayEngine {
  const SCHEME: &'static str = REPLAY_SCHEME;
}

impl ReplayEngine {
  pub fn new(info: ModelInfo, output: OutputTensor) -> Result<Self, EngineError> {
    let expected = info.layout.len();
    if output.len() != expected {
      return Err(EngineError::Config(format!(
        "录制输出包含 {} 个值, 期望 {}",
        output.len(),
        expected
      )));
    }
    Ok(Self { info, output })
  }

  pub fn load(
    path: impl AsRef<Path>,
    info: ModelInfo,
    dtype: ReplayDtype,
    quantization: Quantization,
  ) -> Result<Self, EngineError> {
    let path = path.as_ref();
    info!("加载录制输出: {}", path.display());
    let bytes = std::fs::read(path)?;

    let expected = info.layout.len() * dtype.element_size();
    if bytes.len() != expected {
      return Err(EngineError::Config(format!(
        "录制文件大小为 {} 字节, 期望 {} 字节",
        bytes.len(),
        expected
      )));
    }

    let output = match dtype {
      ReplayDtype::F32 => OutputTensor::Float(
        bytes
          .chunks_exact(4)
          .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
          .collect(),
      ),
      ReplayDtype::U8 => OutputTensor::UInt8 {
        data: bytes.into_boxed_slice(),
        quantization,
      },
      ReplayDtype::I8 => OutputTensor::Int8 {
        data: bytes.into_iter().map(|b| b as i8).collect(),
        quantization,
      },
    };

    debug!(
      "录制输出: {} 框, {} 类, {:?}",
      info.layout.boxes, info.layout.classes, dtype
    );
    Self::new(info, output)
  }
}

impl InferenceEngine for ReplayEngine {
  fn model_info(&self) -> ModelInfo {
    self.info
  }

  fn run(&mut self, input: &RgbNhwcFrame) -> Result<OutputTensor, EngineError> {
    let expected = self.info.input_len();
    let actual = input.as_nhwc().len();
    if actual != expected {
      return Err(EngineError::InputMismatch { expected, actual });
    }
    Ok(self.output.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn small_info() -> ModelInfo {
    ModelInfo {
      width: 4,
      height: 4,
      layout: OutputLayout { boxes: 2, classes: 1 },
    }
  }

  #[test]
  fn loads_float_recording_from_url() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let values = [0.5f32, 0.5, 0.2, 0.2, 0.9, 0.8, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    for v in values {
      file.write_all(&v.to_le_bytes()).unwrap();
    }

    let url = Url::parse(&format!(
      "replay://{}?width=4&height=4&boxes=2&classes=1&dtype=f32",
      file.path().display()
    ))
    .unwrap();
    let mut engine = ReplayEngine::from_url(&url).unwrap();
    assert_eq!(engine.model_info(), small_info());

    let output = engine.run(&RgbNhwcFrame::with_shape(4, 4)).unwrap();
    assert_eq!(output.len(), 12);
    assert_eq!(output.value(4), 0.9);
  }

  #[test]
  fn quantized_recording_keeps_parameters() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[10u8; 12]).unwrap();
    let engine = ReplayEngine::load(
      file.path(),
      small_info(),
      ReplayDtype::U8,
      Quantization::new(0.5, 10),
    )
    .unwrap();
    assert_eq!(engine.output.value(0), 0.0);
  }

  #[test]
  fn wrong_file_size_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 11]).unwrap();
    let result = ReplayEngine::load(
      file.path(),
      small_info(),
      ReplayDtype::U8,
      Quantization::default(),
    );
    assert!(matches!(result, Err(EngineError::Config(_))));
  }

  #[test]
  fn input_size_is_checked() {
    let output = OutputTensor::Float(vec![0.0; 12].into_boxed_slice());
    let mut engine = ReplayEngine::new(small_info(), output).unwrap();
    let result = engine.run(&RgbNhwcFrame::with_shape(3, 4));
    assert!(matches!(
      result,
      Err(EngineError::InputMismatch { expected: 48, actual: 36 })
    ));
  }
}
