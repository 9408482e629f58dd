// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/detect_oneshot.rs - 单张图像推理
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::info;
use url::Url;

use shanan_dispatch::{
  ContentKind, Dispatcher, DispatcherConfig, EngineWrapper, FromUrl, InferenceOutcome, Settings,
  geometry::ScaleMode, label::LabelSet,
};

/// 通过调度器对单张图像或原始张量做一次推理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理后端，例如 replay:///path/output.bin?boxes=25200 或 rknn:///path/model.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 标签文件，每行一个类别名
  #[arg(long, value_name = "LABELS")]
  pub labels: Option<PathBuf>,
  /// JSON 配置文件
  #[arg(long, value_name = "SETTINGS")]
  pub settings: Option<PathBuf>,
  /// 输入文件
  #[arg(long, value_name = "INPUT")]
  pub input: PathBuf,
  /// 输入为模型分辨率的原始 RGB 张量
  #[arg(long)]
  pub raw: bool,
  /// 数据集索引，原样写入结果
  #[arg(long)]
  pub index: Option<u32>,

  #[arg(long)]
  pub objectness: Option<f32>,
  #[arg(long)]
  pub confidence: Option<f32>,
  #[arg(long)]
  pub nms: Option<f32>,
  #[arg(long, value_name = "MODE")]
  pub scale_mode: Option<ScaleMode>,
}

fn load_settings(args: &Args) -> Result<Settings> {
  let mut settings = match &args.settings {
    Some(path) => Settings::from_json_file(path)?,
    None => Settings::default(),
  };
  if let Some(v) = args.objectness {
    settings.model.objectness = v;
  }
  if let Some(v) = args.confidence {
    settings.model.confidence = v;
  }
  if let Some(v) = args.nms {
    settings.model.nms = v;
  }
  if let Some(mode) = args.scale_mode {
    settings.scale_mode = mode;
  }
  settings.validate()?;
  Ok(settings)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("推理后端: {}", args.model);
  info!("输入文件: {}", args.input.display());

  let settings = load_settings(&args)?;
  let labels = match &args.labels {
    Some(path) => LabelSet::from_file(path)?,
    None => LabelSet::default(),
  };

  let model_url = args.model.clone();
  let dispatcher = Dispatcher::start(DispatcherConfig::new(settings, labels), move || {
    EngineWrapper::from_url(&model_url)
  })?;

  let bytes = std::fs::read(&args.input)?;
  let kind = if args.raw {
    ContentKind::RawTensor
  } else {
    ContentKind::CompressedImage
  };

  let now = std::time::Instant::now();
  let request = dispatcher.prepare(kind, bytes, args.index)?;
  let outcome = dispatcher.infer(request)?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());

  let status = outcome.status();
  let body = match &outcome {
    InferenceOutcome::Detections(detections) => json!({ "detections": detections }),
    InferenceOutcome::ValidationFailed(message) => json!({ "error": message }),
    InferenceOutcome::Failed => json!({ "error": "内部错误" }),
  };
  println!(
    "{}",
    serde_json::to_string_pretty(&json!({ "status": status.code(), "body": body }))?
  );

  info!("{}", serde_json::to_string(&dispatcher.health())?);
  dispatcher.shutdown();
  Ok(())
}
