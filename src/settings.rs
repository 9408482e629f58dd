// 该文件是 Shanan （山南西风） 项目的一部分。
// src/settings.rs - 运行参数
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::decode::Thresholds;
use crate::engine::RetryPolicy;
use crate::geometry::ScaleMode;

/// 压缩图像请求体的默认上限（10 MiB）
pub const DEFAULT_MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SettingsError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("阈值 {name} 超出范围 [0, 1]: {value}")]
  ThresholdOutOfRange { name: &'static str, value: f32 },
  #[error("请求体上限不能为 0")]
  ZeroImageSize,
}

/// 例：
///
/// ```json
/// {"model": {"objectness": 0.25, "confidence": 0.30, "nms": 0.05}, "scale_mode": "letterbox"}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Settings {
  #[serde(default)]
  pub model: Thresholds,
  #[serde(default)]
  pub scale_mode: ScaleMode,
  #[serde(default = "Settings::default_max_image_size")]
  pub max_image_size: usize,
  #[serde(default)]
  pub retry: RetryPolicy,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      model: Thresholds::default(),
      scale_mode: ScaleMode::default(),
      max_image_size: DEFAULT_MAX_IMAGE_SIZE,
      retry: RetryPolicy::default(),
    }
  }
}

impl Settings {
  fn default_max_image_size() -> usize {
    DEFAULT_MAX_IMAGE_SIZE
  }

  pub fn from_json_str(text: &str) -> Result<Self, SettingsError> {
    let settings: Settings = serde_json::from_str(text)?;
    settings.validate()?;
    Ok(settings)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let settings = Self::from_json_str(&text)?;
    info!(
      "从 {} 加载配置: objectness={}, confidence={}, nms={}, 缩放模式={}",
      path.display(),
      settings.model.objectness,
      settings.model.confidence,
      settings.model.nms,
      settings.scale_mode
    );
    Ok(settings)
  }

  pub fn validate(&self) -> Result<(), SettingsError> {
    for (name, value) in [
      ("objectness", self.model.objectness),
      ("confidence", self.model.confidence),
      ("nms", self.model.nms),
    ] {
      if !(0.0..=1.0).contains(&value) {
        return Err(SettingsError::ThresholdOutOfRange { name, value });
      }
    }
    if self.max_image_size == 0 {
      return Err(SettingsError::ZeroImageSize);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn empty_object_gives_defaults() {
    let settings = Settings::from_json_str("{}").unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.model.objectness, 0.25);
    assert_eq!(settings.model.confidence, 0.30);
    assert_eq!(settings.model.nms, 0.05);
    assert_eq!(settings.scale_mode, ScaleMode::Letterbox);
    assert_eq!(settings.max_image_size, 10 * 1024 * 1024);
  }

  #[test]
  fn partial_model_section_and_alias() {
    let settings =
      Settings::from_json_str(r#"{"model": {"confidence": 0.5}, "scale_mode": "center-crop"}"#)
        .unwrap();
    assert_eq!(settings.model.confidence, 0.5);
    assert_eq!(settings.model.objectness, 0.25);
    assert_eq!(settings.scale_mode, ScaleMode::Crop);
  }

  #[test]
  fn unknown_scale_mode_is_an_error() {
    assert!(matches!(
      Settings::from_json_str(r#"{"scale_mode": "fisheye"}"#),
      Err(SettingsError::ParseError(_))
    ));
  }

  #[test]
  fn out_of_range_threshold_is_rejected() {
    assert!(matches!(
      Settings::from_json_str(r#"{"model": {"nms": 1.5}}"#),
      Err(SettingsError::ThresholdOutOfRange { name: "nms", .. })
    ));
  }

  #[test]
  fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
      file,
      r#"{{"scale_mode": "stretch", "retry": {{"max_attempts": 3}}}}"#
    )
    .unwrap();
    let settings = Settings::from_json_file(file.path()).unwrap();
    assert_eq!(settings.scale_mode, ScaleMode::Stretch);
    assert_eq!(settings.retry.max_attempts, 3);
    assert_eq!(settings.retry.delay_step_ms, 250);
  }
}
