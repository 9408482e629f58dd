// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine.rs - 推理引擎
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

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::FromUrl;
use crate::decode::{OutputLayout, OutputTensor};
use crate::frame::{RGB_CHANNELS, RgbNhwcFrame};

mod replay;
pub use self::replay::ReplayEngine;

#[cfg(feature = "rknpu_engine")]
mod rknpu;
#[cfg(feature = "rknpu_engine")]
pub use self::rknpu::RknnEngine;

/// 模型输入网格与输出排布
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
  pub width: u32,
  pub height: u32,
  pub layout: OutputLayout,
}

impl ModelInfo {
  /// 原始张量输入所需的字节数 `W × H × 3`
  pub fn input_len(&self) -> usize {
    RgbNhwcFrame::byte_len(self.width as usize, self.height as usize)
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }
}

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("推理引擎暂时不可用")]
  Busy,
  #[error("推理引擎在 {0} 次尝试后仍不可用")]
  RetriesExhausted(u32),
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("输入大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  InputMismatch { expected: usize, actual: usize },
  #[error("模型配置错误: {0}")]
  Config(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

impl EngineError {
  /// 只有 `Busy` 值得重试
  pub fn is_transient(&self) -> bool {
    matches!(self, EngineError::Busy)
  }

  /// 按后端错误信息归类：超时、设备忙或不可用视为暂时性错误
  pub fn from_backend_message(message: String) -> Self {
    let lower = message.to_ascii_lowercase();
    if ["timeout", "timed out", "busy", "unavailable"]
      .iter()
      .any(|hint| lower.contains(hint))
    {
      EngineError::Busy
    } else {
      EngineError::Backend(message)
    }
  }
}

/// 推理引擎；不可重入，由工作线程独占
pub trait InferenceEngine {
  fn model_info(&self) -> ModelInfo;
  fn run(&mut self, input: &RgbNhwcFrame) -> Result<OutputTensor, EngineError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  fn model_info(&self) -> ModelInfo {
    (**self).model_info()
  }

  fn run(&mut self, input: &RgbNhwcFrame) -> Result<OutputTensor, EngineError> {
    (**self).run(input)
  }
}

/// 暂时性错误的重试策略，第 n 次重试前等待 `n × delay_step_ms`（不超过上限）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  #[serde(default = "RetryPolicy::default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "RetryPolicy::default_delay_step_ms")]
  pub delay_step_ms: u64,
  #[serde(default = "RetryPolicy::default_max_delay_ms")]
  pub max_delay_ms: u64,
}

impl RetryPolicy {
  fn default_max_attempts() -> u32 {
    50
  }

  fn default_delay_step_ms() -> u64 {
    250
  }

  fn default_max_delay_ms() -> u64 {
    2000
  }

  pub fn delay(&self, retry: u32) -> Duration {
    let ms = self.delay_step_ms.saturating_mul(retry as u64);
    Duration::from_millis(ms.min(self.max_delay_ms))
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: Self::default_max_attempts(),
      delay_step_ms: Self::default_delay_step_ms(),
      max_delay_ms: Self::default_max_delay_ms(),
    }
  }
}

/// 执行推理，遇到暂时性错误按策略等待后重试
pub fn run_with_retry<E: InferenceEngine + ?Sized>(
  engine: &mut E,
  input: &RgbNhwcFrame,
  policy: &RetryPolicy,
) -> Result<OutputTensor, EngineError> {
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 1;
  loop {
    match engine.run(input) {
      Ok(output) => return Ok(output),
      Err(e) if e.is_transient() => {
        if attempt >= max_attempts {
          error!("推理引擎在 {} 次尝试后仍不可用", attempt);
          return Err(EngineError::RetriesExhausted(attempt));
        }
        let delay = policy.delay(attempt);
        warn!("推理引擎暂时不可用，第 {} 次重试，等待 {:.2?}", attempt, delay);
        std::thread::sleep(delay);
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

/// 读取 URL 查询参数中的数值选项
pub(crate) fn query_value<T: std::str::FromStr>(
  query: &HashMap<String, String>,
  key: &str,
  default: T,
) -> Result<T, EngineError> {
  match query.get(key) {
    Some(value) => value
      .parse()
      .map_err(|_| EngineError::Config(format!("参数 {} 的值无效: {}", key, value))),
    None => Ok(default),
  }
}

pub(crate) fn query_map(url: &Url) -> HashMap<String, String> {
  url
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect()
}

/// URL 路径按百分号编码解码后的本地路径
pub(crate) fn decoded_path(url: &Url) -> Result<String, EngineError> {
  urlencoding::decode(url.path())
    .map(|path| path.into_owned())
    .map_err(|e| EngineError::Config(format!("路径解码失败: {}", e)))
}

/// 由 URL scheme 选择的推理后端
pub enum EngineWrapper {
  Replay(ReplayEngine),
  #[cfg(feature = "rknpu_engine")]
  Rknn(RknnEngine),
}

impl FromUrl for EngineWrapper {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    if url.scheme() == ReplayEngine::SCHEME {
      return Ok(EngineWrapper::Replay(ReplayEngine::from_url(url)?));
    }
    #[cfg(feature = "rknpu_engine")]
    {
      if url.scheme() == RknnEngine::SCHEME {
        return Ok(EngineWrapper::Rknn(RknnEngine::from_url(url)?));
      }
    }
    error!("不支持的推理后端: {}", url.scheme());
    Err(EngineError::SchemeMismatch)
  }
}

impl InferenceEngine for EngineWrapper {
  fn model_info(&self) -> ModelInfo {
    match self {
      EngineWrapper::Replay(engine) => engine.model_info(),
      #[cfg(feature = "rknpu_engine")]
      EngineWrapper::Rknn(engine) => engine.model_info(),
    }
  }

  fn run(&mut self, input: &RgbNhwcFrame) -> Result<OutputTensor, EngineError> {
    match self {
      EngineWrapper::Replay(engine) => engine.run(input),
      #[cfg(feature = "rknpu_engine")]
      EngineWrapper::Rknn(engine) => engine.run(input),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Flaky {
    busy_left: u32,
    calls: u32,
  }

  impl InferenceEngine for Flaky {
    fn model_info(&self) -> ModelInfo {
      ModelInfo {
        width: 2,
        height: 2,
        layout: OutputLayout { boxes: 1, classes: 1 },
      }
    }

    fn run(&mut self, _input: &RgbNhwcFrame) -> Result<OutputTensor, EngineError> {
      self.calls += 1;
      if self.busy_left > 0 {
        self.busy_left -= 1;
        return Err(EngineError::Busy);
      }
      Ok(OutputTensor::Float(vec![0.0; 6].into_boxed_slice()))
    }
  }

  fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      delay_step_ms: 1,
      max_delay_ms: 2,
    }
  }

  #[test]
  fn delay_grows_then_caps() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay(1), Duration::from_millis(250));
    assert_eq!(policy.delay(4), Duration::from_millis(1000));
    assert_eq!(policy.delay(40), Duration::from_millis(2000));
    assert_eq!(policy.max_attempts, 50);
  }

  #[test]
  fn busy_is_retried_until_success() {
    let mut engine = Flaky { busy_left: 3, calls: 0 };
    let frame = RgbNhwcFrame::with_shape(2, 2);
    let output = run_with_retry(&mut engine, &frame, &fast_policy(50)).unwrap();
    assert_eq!(output.len(), 6);
    assert_eq!(engine.calls, 4);
  }

  #[test]
  fn busy_becomes_fatal_after_max_attempts() {
    let mut engine = Flaky { busy_left: 100, calls: 0 };
    let frame = RgbNhwcFrame::with_shape(2, 2);
    let err = run_with_retry(&mut engine, &frame, &fast_policy(5)).unwrap_err();
    assert!(matches!(err, EngineError::RetriesExhausted(5)));
    assert!(!err.is_transient());
    assert_eq!(engine.calls, 5);
  }

  #[test]
  fn backend_timeout_is_transient() {
    let err =
      EngineError::from_backend_message("RKNN_ERR_TIMEOUT: rknn_run timed out".to_string());
    assert!(err.is_transient());
    let err = EngineError::from_backend_message("NPU device unavailable".to_string());
    assert!(err.is_transient());

    let err = EngineError::from_backend_message("RKNN_ERR_MODEL_INVALID".to_string());
    assert!(!err.is_transient());
    assert!(matches!(err, EngineError::Backend(m) if m == "RKNN_ERR_MODEL_INVALID"));
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("onnx:///tmp/model.onnx").unwrap();
    assert!(matches!(
      EngineWrapper::from_url(&url),
      Err(EngineError::SchemeMismatch)
    ));
  }
}
