// 该文件是 Shanan （山南西风） 项目的一部分。
// src/dispatch/request.rs - 推理请求与结果
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

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use thiserror::Error;

use crate::detection::FinalDetection;

/// 请求体的内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
  /// 压缩图像（JPEG/PNG 等），在工作线程上解码与重采样
  CompressedImage,
  /// 已是模型分辨率的 RGB 张量（NHWC, u8）
  RawTensor,
}

impl ContentKind {
  pub fn from_mime(mime: &str) -> Result<Self, ValidationError> {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    match essence.to_ascii_lowercase().as_str() {
      "image/jpeg" | "image/jpg" | "image/png" => Ok(ContentKind::CompressedImage),
      "application/octet-stream" => Ok(ContentKind::RawTensor),
      _ => Err(ValidationError::UnsupportedContent(mime.to_string())),
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ContentKind::CompressedImage => "compressed-image",
      ContentKind::RawTensor => "raw-tensor",
    }
  }
}

impl fmt::Display for ContentKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 入队前的校验失败；不计入失败统计
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
  #[error("请求体为空")]
  EmptyBody,
  #[error("请求体过大: {size} 字节, 上限 {limit} 字节")]
  TooLarge { size: usize, limit: usize },
  #[error("无法解析图像: {0}")]
  Undecodable(String),
  #[error("张量大小错误: 期望 {expected} 字节 ({width}x{height}x3), 实际 {actual} 字节")]
  TensorSize {
    expected: usize,
    actual: usize,
    width: u32,
    height: u32,
  },
  #[error("不支持的内容类型: {0}")]
  UnsupportedContent(String),
}

/// 已通过校验、可以提交的请求
#[derive(Debug, Clone)]
pub struct Request {
  pub(crate) kind: ContentKind,
  pub(crate) bytes: Arc<[u8]>,
  pub(crate) width: u32,
  pub(crate) height: u32,
  pub(crate) index: Option<u32>,
}

impl Request {
  pub fn kind(&self) -> ContentKind {
    self.kind
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  /// 声明的原图尺寸（原始张量即模型尺寸）
  pub fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  pub fn index(&self) -> Option<u32> {
    self.index
  }
}

/// 请求的处理结果，每个已接收的请求恰好得到一个
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
  Detections(Vec<FinalDetection>),
  /// 工作线程上发现输入无效（例如图像解码失败）
  ValidationFailed(String),
  /// 内部错误，细节只记录在日志中
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
  Ok,
  NoContent,
  BadRequest,
  InternalError,
}

impl RequestStatus {
  pub fn code(&self) -> u16 {
    match self {
      RequestStatus::Ok => 200,
      RequestStatus::NoContent => 204,
      RequestStatus::BadRequest => 400,
      RequestStatus::InternalError => 500,
    }
  }
}

impl InferenceOutcome {
  pub fn status(&self) -> RequestStatus {
    match self {
      InferenceOutcome::Detections(d) if d.is_empty() => RequestStatus::NoContent,
      InferenceOutcome::Detections(_) => RequestStatus::Ok,
      InferenceOutcome::ValidationFailed(_) => RequestStatus::BadRequest,
      InferenceOutcome::Failed => RequestStatus::InternalError,
    }
  }

  pub fn detections(&self) -> Option<&[FinalDetection]> {
    match self {
      InferenceOutcome::Detections(d) => Some(d),
      _ => None,
    }
  }
}

/// 单个请求的完成信号
#[derive(Debug, Default)]
pub(crate) struct Completion {
  slot: Mutex<Option<InferenceOutcome>>,
  done: Condvar,
}

impl Completion {
  pub(crate) fn complete(&self, outcome: InferenceOutcome) {
    let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(outcome);
    self.done.notify_one();
  }

  fn wait(&self) -> InferenceOutcome {
    let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
      if let Some(outcome) = slot.take() {
        return outcome;
      }
      slot = self
        .done
        .wait(slot)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }
}

/// 队列中的一项：请求本身和它的完成信号
pub(crate) struct Job {
  pub(crate) request: Request,
  pub(crate) completion: Arc<Completion>,
}

impl Job {
  pub(crate) fn new(request: Request) -> (Self, PendingRequest) {
    let completion = Arc::new(Completion::default());
    let pending = PendingRequest {
      completion: completion.clone(),
    };
    (
      Job {
        request,
        completion,
      },
      pending,
    )
  }
}

/// 已入队请求的句柄；`wait` 阻塞到该请求处理完成，无超时
#[must_use]
pub struct PendingRequest {
  completion: Arc<Completion>,
}

impl PendingRequest {
  pub fn wait(self) -> InferenceOutcome {
    self.completion.wait()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;
  use std::time::Duration;

  #[test]
  fn mime_mapping() {
    assert_eq!(
      ContentKind::from_mime("image/jpeg").unwrap(),
      ContentKind::CompressedImage
    );
    assert_eq!(
      ContentKind::from_mime("Application/Octet-Stream").unwrap(),
      ContentKind::RawTensor
    );
    assert_eq!(
      ContentKind::from_mime("image/jpeg; charset=binary").unwrap(),
      ContentKind::CompressedImage
    );
    assert!(matches!(
      ContentKind::from_mime("text/plain"),
      Err(ValidationError::UnsupportedContent(_))
    ));
  }

  #[test]
  fn status_codes() {
    assert_eq!(InferenceOutcome::Detections(vec![]).status().code(), 204);
    assert_eq!(
      InferenceOutcome::ValidationFailed("x".into()).status().code(),
      400
    );
    assert_eq!(InferenceOutcome::Failed.status().code(), 500);
  }

  #[test]
  fn waiter_is_released_by_completion() {
    let request = Request {
      kind: ContentKind::RawTensor,
      bytes: Arc::from(&[0u8; 3][..]),
      width: 1,
      height: 1,
      index: Some(9),
    };
    let (job, pending) = Job::new(request);

    let waiter = thread::spawn(move || pending.wait());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(job.request.index(), Some(9));
    job.completion.complete(InferenceOutcome::Failed);

    assert_eq!(waiter.join().unwrap(), InferenceOutcome::Failed);
  }
}
