// 该文件是 Shanan （山南西风） 项目的一部分。
// src/report.rs - 健康状态与能力描述
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

use crate::dispatch::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RequestCounts {
  pub total_requests: u64,
  pub successful: u64,
  pub failed: u64,
  pub busy: u64,
  /// 百分比
  pub success_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Timing {
  pub average_ms: f64,
  pub min_ms: f64,
  pub max_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Health {
  pub running: bool,
  pub queue_size: usize,
  pub queue_full: bool,
  pub statistics: RequestCounts,
  pub timing: Timing,
}

impl Health {
  pub fn collect(dispatcher: &Dispatcher) -> Self {
    let stats = dispatcher.stats();
    Self {
      running: dispatcher.is_running(),
      queue_size: dispatcher.queue_size(),
      queue_full: dispatcher.is_queue_full(),
      statistics: RequestCounts {
        total_requests: stats.total_requests,
        successful: stats.successful_requests,
        failed: stats.failed_requests,
        busy: stats.queue_full_rejections,
        success_rate: stats.success_rate(),
      },
      timing: Timing {
        average_ms: stats.average_inference_ms,
        min_ms: stats.min_inference_ms,
        max_ms: stats.max_inference_ms,
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputFormat {
  pub kind: &'static str,
  pub content_type: &'static str,
  pub description: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_size_bytes: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub exact_size_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassEntry {
  pub id: usize,
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCapabilities {
  pub input_width: u32,
  pub input_height: u32,
  pub channels: usize,
  pub boxes: usize,
  pub preprocessing: &'static str,
  pub input_formats: Vec<InputFormat>,
  pub classes: Vec<ClassEntry>,
  pub max_queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capabilities {
  pub model: ModelCapabilities,
  pub server: &'static str,
  pub version: &'static str,
}

impl Capabilities {
  pub fn collect(dispatcher: &Dispatcher) -> Self {
    let model = dispatcher.model_info();
    let settings = dispatcher.settings();
    let tensor_len = model.input_len();

    let input_formats = vec![
      InputFormat {
        kind: "compressed-image",
        content_type: "image/jpeg",
        description: format!(
          "JPEG/PNG 图像，任意分辨率，按 {} 模式缩放",
          settings.scale_mode
        ),
        max_size_bytes: Some(settings.max_image_size),
        exact_size_bytes: None,
      },
      InputFormat {
        kind: "raw-tensor",
        content_type: "application/octet-stream",
        description: format!(
          "RGB 交错排列的原始张量，必须恰好为 {} x {} x 3 = {} 字节",
          model.width, model.height, tensor_len
        ),
        max_size_bytes: None,
        exact_size_bytes: Some(tensor_len),
      },
    ];

    let classes = dispatcher
      .labels()
      .iter()
      .enumerate()
      .map(|(id, name)| ClassEntry {
        id,
        name: name.to_string(),
      })
      .collect();

    Self {
      model: ModelCapabilities {
        input_width: model.width,
        input_height: model.height,
        channels: model.channels(),
        boxes: model.layout.boxes,
        preprocessing: settings.scale_mode.as_str(),
        input_formats,
        classes,
        max_queue_size: dispatcher.queue_capacity(),
      },
      server: env!("CARGO_PKG_NAME"),
      version: env!("CARGO_PKG_VERSION"),
    }
  }
}
