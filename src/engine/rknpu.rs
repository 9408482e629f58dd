// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/rknpu.rs - RKNPU 推理后端
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

use ::rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};
use url::Url;

use super::{EngineError, InferenceEngine, ModelInfo, decoded_path, query_map, query_value};
use crate::decode::{OutputLayout, OutputTensor};
use crate::frame::{AsNhwcFrame, RgbNhwcFrame};
use crate::{FromUrl, FromUrlWithScheme};

const RKNN_SCHEME: &str = "rknn";
const RKNN_NUM_INPUTS: u32 = 1;

impl From<::rknpu::Error> for EngineError {
  fn from(err: ::rknpu::Error) -> Self {
    // rknpu 只暴露错误信息，超时与设备忙需从信息中识别
    EngineError::from_backend_message(err.to_string())
  }
}

/// 单输入、单输出（`boxes × (5 + classes)`，反量化为 f32）的 RKNN 模型
///
/// URL 形如 `rknn:///path/model.rknn?width=640&height=640&boxes=25200&classes=80`。
pub struct RknnEngine {
  context: Context,
  info: ModelInfo,
}

impl FromUrl for RknnEngine {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != RKNN_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        RKNN_SCHEME,
        url.scheme()
      );
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

    let path = decoded_path(url)?;
    Self::load(&path, info, InitFlags::default())
  }
}

impl FromUrlWithScheme for RknnEngine {
  const SCHEME: &'static str = RKNN_SCHEME;
}

impl RknnEngine {
  pub fn load(path: &str, info: ModelInfo, flags: InitFlags) -> Result<Self, EngineError> {
    info!("加载模型文件: {}", path);
    let model_data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, flags)?;

    let num_inputs = context.num_inputs()?;
    if num_inputs != RKNN_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNN_NUM_INPUTS, num_inputs
      );
      return Err(EngineError::Config(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNN_NUM_INPUTS, num_inputs
      )));
    }
    debug!("模型输出数量: {}", context.num_outputs()?);
    info!("模型加载完成");

    Ok(Self { context, info })
  }
}

impl InferenceEngine for RknnEngine {
  fn model_info(&self) -> ModelInfo {
    self.info
  }

  fn run(&mut self, input: &RgbNhwcFrame) -> Result<OutputTensor, EngineError> {
    let data = input.as_nhwc();
    let expected = self.info.input_len();
    if data.len() != expected {
      return Err(EngineError::InputMismatch {
        expected,
        actual: data.len(),
      });
    }

    self
      .context
      .set_input(0, data, TensorFormat::NHWC, TensorType::UInt8)?;
    self.context.run()?;

    let outputs = self.context.get_outputs()?;
    let values = outputs.get_f32(0)?;
    Ok(OutputTensor::Float(values.iter().copied().collect()))
  }
}
