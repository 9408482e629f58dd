// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/detect_burst.rs - 多线程并发提交
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
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use shanan_dispatch::{
  DispatchError, Dispatcher, DispatcherConfig, EngineWrapper, FromUrl, Settings, label::LabelSet,
};

/// 从多个线程同时提交同一张图像，观察准入控制
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理后端
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 标签文件
  #[arg(long, value_name = "LABELS")]
  pub labels: Option<PathBuf>,
  /// JSON 配置文件
  #[arg(long, value_name = "SETTINGS")]
  pub settings: Option<PathBuf>,
  /// 输入图像
  #[arg(long, value_name = "IMAGE")]
  pub image: PathBuf,
  /// 提交线程数
  #[arg(long, default_value_t = 8)]
  pub threads: usize,
  /// 每个线程的提交次数
  #[arg(long, default_value_t = 16)]
  pub rounds: usize,
  /// 被拒绝后重试前的等待（毫秒）
  #[arg(long, default_value_t = 20)]
  pub backoff_ms: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let settings = match &args.settings {
    Some(path) => Settings::from_json_file(path)?,
    None => Settings::default(),
  };
  let labels = match &args.labels {
    Some(path) => LabelSet::from_file(path)?,
    None => LabelSet::default(),
  };

  let model_url = args.model.clone();
  let dispatcher = Arc::new(Dispatcher::start(
    DispatcherConfig::new(settings, labels),
    move || EngineWrapper::from_url(&model_url),
  )?);

  let image: Arc<[u8]> = Arc::from(std::fs::read(&args.image)?);
  // 先校验一次，后续提交复用同一份数据
  dispatcher.prepare_mime("image/jpeg", image.clone(), None)?;

  let stop = Arc::new(AtomicBool::new(false));
  {
    let stop = stop.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，停止提交");
      stop.store(true, Ordering::SeqCst);
    })?;
  }

  let rejected = Arc::new(AtomicU64::new(0));
  let start = std::time::Instant::now();
  let handles = (0..args.threads)
    .map(|t| {
      let dispatcher = dispatcher.clone();
      let image = image.clone();
      let stop = stop.clone();
      let rejected = rejected.clone();
      let rounds = args.rounds;
      let backoff = Duration::from_millis(args.backoff_ms);
      thread::Builder::new()
        .name(format!("submitter-{}", t))
        .spawn(move || -> Result<()> {
          for round in 0..rounds {
            if stop.load(Ordering::SeqCst) {
              break;
            }
            let index = (t * rounds + round) as u32;
            let request = dispatcher.prepare_mime("image/jpeg", image.clone(), Some(index))?;
            match dispatcher.submit(request) {
              Ok(pending) => {
                let outcome = pending.wait();
                info!("请求 {} 完成: {}", index, outcome.status().code());
              }
              Err(DispatchError::QueueFull) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                thread::sleep(backoff);
              }
              Err(e) => return Err(e.into()),
            }
          }
          Ok(())
        })
    })
    .collect::<Result<Vec<_>, _>>()?;

  for handle in handles {
    match handle.join() {
      Ok(result) => result?,
      Err(_) => warn!("提交线程异常退出"),
    }
  }
  info!(
    "全部提交完成，耗时 {:.2?}，被拒绝 {} 次",
    start.elapsed(),
    rejected.load(Ordering::Relaxed)
  );

  let snapshot = dispatcher.latest().map(|s| {
    json!({
      "timestamp": s.timestamp.to_rfc3339(),
      "image_bytes": s.image.len(),
      "detections": serde_json::from_str::<serde_json::Value>(&s.detections_json).ok(),
    })
  });
  println!(
    "{}",
    serde_json::to_string_pretty(&json!({
      "health": dispatcher.health(),
      "capabilities": dispatcher.capabilities(),
      "latest": snapshot,
    }))?
  );

  dispatcher.shutdown();
  Ok(())
}
