// 该文件是 Shanan （山南西风） 项目的一部分。
// src/dispatch.rs - 请求调度：准入控制与单工作线程
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

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::{ImageCodec, ImageCrateCodec};
use crate::engine::{EngineError, InferenceEngine, ModelInfo};
use crate::label::LabelSet;
use crate::pipeline::Pipeline;
use crate::report::{Capabilities, Health};
use crate::settings::Settings;
use crate::stats::{LatestSnapshot, ServerStats, Snapshot, StatsTracker};

mod queue;
mod request;

pub use self::queue::QUEUE_CAPACITY;
pub use self::request::{
  ContentKind, InferenceOutcome, PendingRequest, Request, RequestStatus, ValidationError,
};

use self::queue::JobQueue;
use self::request::Job;

const WORKER_THREAD_NAME: &str = "inference-worker";

#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("请求无效: {0}")]
  Validation(#[from] ValidationError),
  #[error("队列已满，请稍后重试")]
  QueueFull,
  #[error("调度器正在关闭")]
  ShuttingDown,
  #[error("推理引擎初始化失败: {0}")]
  EngineInit(#[from] EngineError),
  #[error("工作线程启动失败: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("工作线程在初始化期间退出")]
  WorkerExited,
}

/// 调度器的静态配置
#[derive(Clone)]
pub struct DispatcherConfig {
  pub settings: Settings,
  pub labels: Arc<LabelSet>,
  pub codec: Arc<dyn ImageCodec>,
}

impl DispatcherConfig {
  pub fn new(settings: Settings, labels: LabelSet) -> Self {
    Self {
      settings,
      labels: Arc::new(labels),
      codec: Arc::new(ImageCrateCodec),
    }
  }

  pub fn codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
    self.codec = codec;
    self
  }
}

/// 提交者与工作线程共享的状态
struct Shared {
  queue: JobQueue,
  stats: StatsTracker,
  snapshot: LatestSnapshot,
}

/// 推理请求调度器
///
/// 多个提交线程、一个工作线程。队列满时立即拒绝；
/// 已接收的请求严格按 FIFO 顺序处理，调用者阻塞等待自己的结果。
pub struct Dispatcher {
  shared: Arc<Shared>,
  model: ModelInfo,
  settings: Settings,
  labels: Arc<LabelSet>,
  codec: Arc<dyn ImageCodec>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
  /// 启动工作线程
  ///
  /// 引擎由 `engine_factory` 在工作线程上创建并一直归其所有；
  /// 创建失败时返回错误，不会留下线程。
  pub fn start<F, E>(config: DispatcherConfig, engine_factory: F) -> Result<Self, DispatchError>
  where
    F: FnOnce() -> Result<E, EngineError> + Send + 'static,
    E: InferenceEngine + 'static,
  {
    let DispatcherConfig {
      settings,
      labels,
      codec,
    } = config;

    let shared = Arc::new(Shared {
      queue: JobQueue::new(QUEUE_CAPACITY),
      stats: StatsTracker::new(),
      snapshot: LatestSnapshot::new(),
    });

    let (init_tx, init_rx) = mpsc::sync_channel::<Result<ModelInfo, EngineError>>(1);
    let worker = {
      let shared = shared.clone();
      let labels = labels.clone();
      let codec = codec.clone();
      std::thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
          let engine = match engine_factory() {
            Ok(engine) => engine,
            Err(e) => {
              let _ = init_tx.send(Err(e));
              return;
            }
          };
          let pipeline = Pipeline::new(engine, &settings, labels, codec);
          let _ = init_tx.send(Ok(pipeline.model_info()));
          worker_loop(&shared, pipeline);
        })?
    };

    let model = match init_rx.recv() {
      Ok(Ok(model)) => model,
      Ok(Err(e)) => {
        error!("推理引擎初始化失败: {}", e);
        let _ = worker.join();
        return Err(DispatchError::EngineInit(e));
      }
      Err(_) => {
        let _ = worker.join();
        return Err(DispatchError::WorkerExited);
      }
    };

    info!(
      "调度器已启动: 模型输入 {}x{}, {} 框 x {} 类, 缩放模式 {}, 队列容量 {}",
      model.width,
      model.height,
      model.layout.boxes,
      model.layout.classes,
      settings.scale_mode,
      QUEUE_CAPACITY
    );

    Ok(Self {
      shared,
      model,
      settings,
      labels,
      codec,
      worker: Mutex::new(Some(worker)),
    })
  }

  /// 校验请求体；失败的请求不会进入队列，也不计入统计
  pub fn prepare(
    &self,
    kind: ContentKind,
    bytes: impl Into<Arc<[u8]>>,
    index: Option<u32>,
  ) -> Result<Request, ValidationError> {
    let bytes: Arc<[u8]> = bytes.into();
    if bytes.is_empty() {
      return Err(ValidationError::EmptyBody);
    }

    let (width, height) = match kind {
      ContentKind::CompressedImage => {
        let limit = self.settings.max_image_size;
        if bytes.len() > limit {
          return Err(ValidationError::TooLarge {
            size: bytes.len(),
            limit,
          });
        }
        self
          .codec
          .dimensions(&bytes)
          .map_err(|e| ValidationError::Undecodable(e.to_string()))?
      }
      ContentKind::RawTensor => {
        let expected = self.model.input_len();
        if bytes.len() != expected {
          return Err(ValidationError::TensorSize {
            expected,
            actual: bytes.len(),
            width: self.model.width,
            height: self.model.height,
          });
        }
        (self.model.width, self.model.height)
      }
    };

    Ok(Request {
      kind,
      bytes,
      width,
      height,
      index,
    })
  }

  /// 按 MIME 类型校验请求体
  pub fn prepare_mime(
    &self,
    content_type: &str,
    bytes: impl Into<Arc<[u8]>>,
    index: Option<u32>,
  ) -> Result<Request, ValidationError> {
    let kind = ContentKind::from_mime(content_type)?;
    self.prepare(kind, bytes, index)
  }

  /// 提交请求，不等待：队列满时立即返回 `QueueFull`
  pub fn submit(&self, request: Request) -> Result<PendingRequest, DispatchError> {
    let (job, pending) = Job::new(request);
    match self
      .shared
      .queue
      .try_push(job, || self.shared.stats.record_admission())
    {
      Ok(()) => Ok(pending),
      Err(DispatchError::QueueFull) => {
        self.shared.stats.record_rejection();
        warn!("队列已满 ({}), 拒绝请求", QUEUE_CAPACITY);
        Err(DispatchError::QueueFull)
      }
      Err(e) => Err(e),
    }
  }

  /// 提交并阻塞等待结果
  pub fn infer(&self, request: Request) -> Result<InferenceOutcome, DispatchError> {
    Ok(self.submit(request)?.wait())
  }

  /// 校验、提交、等待
  pub fn infer_body(
    &self,
    content_type: &str,
    bytes: impl Into<Arc<[u8]>>,
    index: Option<u32>,
  ) -> Result<InferenceOutcome, DispatchError> {
    let request = self.prepare_mime(content_type, bytes, index)?;
    self.infer(request)
  }

  pub fn model_info(&self) -> ModelInfo {
    self.model
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn labels(&self) -> &LabelSet {
    &self.labels
  }

  /// 排队中与正在处理的请求数
  pub fn queue_size(&self) -> usize {
    self.shared.queue.occupancy()
  }

  pub fn queue_capacity(&self) -> usize {
    self.shared.queue.capacity()
  }

  pub fn is_queue_full(&self) -> bool {
    self.queue_size() >= self.queue_capacity()
  }

  pub fn is_running(&self) -> bool {
    self.shared.queue.is_running()
  }

  pub fn stats(&self) -> ServerStats {
    self.shared.stats.snapshot()
  }

  pub fn latest(&self) -> Option<Snapshot> {
    self.shared.snapshot.latest()
  }

  pub fn health(&self) -> Health {
    Health::collect(self)
  }

  pub fn capabilities(&self) -> Capabilities {
    Capabilities::collect(self)
  }

  /// 停止工作线程；正在处理的请求会完成，仍在排队的请求以失败结束
  ///
  /// 可重复调用。
  pub fn shutdown(&self) {
    let worker = self
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    let Some(worker) = worker else {
      return;
    };

    info!("正在关闭调度器");
    self.shared.queue.close();
    if worker.join().is_err() {
      error!("工作线程异常退出");
    }

    let leftovers = self.shared.queue.drain();
    if !leftovers.is_empty() {
      warn!("{} 个排队中的请求未被处理", leftovers.len());
    }
    for job in leftovers {
      self.shared.stats.record_failure();
      job.completion.complete(InferenceOutcome::Failed);
    }
    info!("调度器已关闭");
  }
}

impl Drop for Dispatcher {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn worker_loop<E: InferenceEngine>(shared: &Shared, mut pipeline: Pipeline<E>) {
  debug!("工作线程开始处理请求");

  while let Some(job) = shared.queue.pop() {
    let start = Instant::now();
    let processed = panic::catch_unwind(AssertUnwindSafe(|| pipeline.process(&job.request)));
    let outcome = match processed {
      Err(_) => {
        error!("请求 {:?} 处理时发生 panic", job.request.index());
        shared.stats.record_failure();
        InferenceOutcome::Failed
      }
      Ok(Ok(detections)) => {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        shared.stats.record_success(elapsed_ms);

        if job.request.kind() == ContentKind::CompressedImage {
          match serde_json::to_string(&detections) {
            Ok(json) => shared.snapshot.store(job.request.bytes.clone(), json),
            Err(e) => warn!("无法序列化检测结果: {}", e),
          }
        }
        InferenceOutcome::Detections(detections)
      }
      Ok(Err(e)) if e.is_invalid_input() => {
        warn!("请求 {:?} 输入无效: {}", job.request.index(), e);
        shared.stats.record_failure();
        InferenceOutcome::ValidationFailed(e.to_string())
      }
      Ok(Err(e)) => {
        error!("请求 {:?} 处理失败: {}", job.request.index(), e);
        shared.stats.record_failure();
        InferenceOutcome::Failed
      }
    };

    // 先释放占用，再唤醒调用者
    shared.queue.finish();
    job.completion.complete(outcome);
  }

  debug!("工作线程退出");
}
