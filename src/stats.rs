// 该文件是 Shanan （山南西风） 项目的一部分。
// src/stats.rs - 运行统计与最近快照
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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Default)]
struct Timing {
  total_ms: f64,
  count: u64,
  min_ms: f64,
  max_ms: f64,
}

/// 请求计数器
///
/// 计数为原子量；耗时的最小/最大/平均值需要一起更新，放在锁后面。
#[derive(Debug, Default)]
pub struct StatsTracker {
  total: AtomicU64,
  succeeded: AtomicU64,
  failed: AtomicU64,
  rejected: AtomicU64,
  timing: Mutex<Timing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ServerStats {
  pub total_requests: u64,
  pub successful_requests: u64,
  pub failed_requests: u64,
  pub queue_full_rejections: u64,
  pub average_inference_ms: f64,
  pub min_inference_ms: f64,
  pub max_inference_ms: f64,
}

impl ServerStats {
  /// 成功率（百分比），无请求时为 0
  pub fn success_rate(&self) -> f64 {
    if self.total_requests == 0 {
      0.0
    } else {
      self.successful_requests as f64 * 100.0 / self.total_requests as f64
    }
  }
}

impl StatsTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_admission(&self) {
    self.total.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_rejection(&self) {
    self.rejected.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_failure(&self) {
    self.failed.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_success(&self, elapsed_ms: f64) {
    self.succeeded.fetch_add(1, Ordering::Relaxed);

    let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
    if timing.count == 0 {
      timing.min_ms = elapsed_ms;
      timing.max_ms = elapsed_ms;
    } else {
      timing.min_ms = timing.min_ms.min(elapsed_ms);
      timing.max_ms = timing.max_ms.max(elapsed_ms);
    }
    timing.total_ms += elapsed_ms;
    timing.count += 1;
  }

  pub fn snapshot(&self) -> ServerStats {
    let timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
    let average = if timing.count > 0 {
      timing.total_ms / timing.count as f64
    } else {
      0.0
    };

    ServerStats {
      total_requests: self.total.load(Ordering::Relaxed),
      successful_requests: self.succeeded.load(Ordering::Relaxed),
      failed_requests: self.failed.load(Ordering::Relaxed),
      queue_full_rejections: self.rejected.load(Ordering::Relaxed),
      average_inference_ms: average,
      min_inference_ms: timing.min_ms,
      max_inference_ms: timing.max_ms,
    }
  }
}

/// 最近一次成功处理的压缩图像及其检测结果
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub image: Arc<[u8]>,
  pub detections_json: String,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LatestSnapshot {
  inner: Mutex<Option<Snapshot>>,
}

impl LatestSnapshot {
  pub fn new() -> Self {
    Self::default()
  }

  /// 整体替换
  pub fn store(&self, image: Arc<[u8]>, detections_json: String) {
    let snapshot = Snapshot {
      image,
      detections_json,
      timestamp: Utc::now(),
    };
    *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
  }

  /// 时间点副本；图像数据共享，不拷贝
  pub fn latest(&self) -> Option<Snapshot> {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}
