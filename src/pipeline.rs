// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 工作线程上的单次推理流程
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
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{CodecError, ImageCodec};
use crate::decode::{DecodeError, Decoder};
use crate::detection::{FinalDetection, finalize};
use crate::dispatch::{ContentKind, Request};
use crate::engine::{EngineError, InferenceEngine, ModelInfo, RetryPolicy, run_with_retry};
use crate::frame::{FrameSizeMismatch, RgbNhwcFrame};
use crate::geometry::{GeometryParams, ScaleMode};
use crate::label::LabelSet;
use crate::nms;
use crate::settings::Settings;

const ASPECT_TOLERANCE: std::ops::RangeInclusive<f32> = 0.9..=1.1;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("图像解码失败: {0}")]
  Codec(#[from] CodecError),
  #[error("输入张量错误: {0}")]
  Input(#[from] FrameSizeMismatch),
  #[error("推理失败: {0}")]
  Engine(#[from] EngineError),
  #[error("输出解码失败: {0}")]
  Decode(#[from] DecodeError),
}

impl PipelineError {
  /// 输入本身无效，而不是服务内部故障
  pub fn is_invalid_input(&self) -> bool {
    matches!(self, PipelineError::Codec(_))
  }
}

/// 由工作线程独占的推理流程：引擎、解码器和预分配的模型输入缓冲区
pub struct Pipeline<E> {
  engine: E,
  model: ModelInfo,
  codec: Arc<dyn ImageCodec>,
  labels: Arc<LabelSet>,
  decoder: Decoder,
  scale_mode: ScaleMode,
  nms_threshold: f32,
  retry: RetryPolicy,
  frame: RgbNhwcFrame,
}

impl<E: InferenceEngine> Pipeline<E> {
  pub fn new(
    engine: E,
    settings: &Settings,
    labels: Arc<LabelSet>,
    codec: Arc<dyn ImageCodec>,
  ) -> Self {
    let model = engine.model_info();
    if labels.len() != model.layout.classes {
      warn!(
        "标签数量 ({}) 与模型类别数 ({}) 不一致",
        labels.len(),
        model.layout.classes
      );
    }

    Self {
      decoder: Decoder::new(model.layout, &settings.model),
      frame: RgbNhwcFrame::with_shape(model.height as usize, model.width as usize),
      engine,
      model,
      codec,
      labels,
      scale_mode: settings.scale_mode,
      nms_threshold: settings.model.nms,
      retry: settings.retry,
    }
  }

  pub fn model_info(&self) -> ModelInfo {
    self.model
  }

  /// 准备模型输入，返回本次使用的几何参数
  fn prepare_input(&mut self, request: &Request) -> Result<GeometryParams, PipelineError> {
    match request.kind() {
      ContentKind::CompressedImage => {
        let image = self.codec.decode(request.bytes())?;
        let (width, height) = image.dimensions();

        let aspect = width as f32 / height as f32;
        if !ASPECT_TOLERANCE.contains(&aspect) {
          warn!(
            "非正方形输入 {}x{} (宽高比 {:.2})，按 {} 模式缩放",
            width, height, aspect, self.scale_mode
          );
        }

        let geometry = GeometryParams::compute(
          self.scale_mode,
          width,
          height,
          self.model.width,
          self.model.height,
        );
        geometry.resample(&image, &mut self.frame);
        Ok(geometry)
      }
      ContentKind::RawTensor => {
        self.frame.copy_from(request.bytes())?;
        Ok(GeometryParams::identity(self.model.width, self.model.height))
      }
    }
  }

  pub fn process(&mut self, request: &Request) -> Result<Vec<FinalDetection>, PipelineError> {
    let start = Instant::now();
    let geometry = self.prepare_input(request)?;
    let prepared = start.elapsed();

    let output = run_with_retry(&mut self.engine, &self.frame, &self.retry)?;
    let inferred = start.elapsed();

    let candidates = self.decoder.decode(&output, &self.labels)?;
    let kept = nms::suppress(candidates, self.nms_threshold);
    let detections = finalize(kept, &geometry, request.index());

    debug!(
      "预处理 {:.2?}, 推理 {:.2?}, 后处理 {:.2?}, {} 个检测",
      prepared,
      inferred - prepared,
      start.elapsed() - inferred,
      detections.len()
    );
    Ok(detections)
  }
}
