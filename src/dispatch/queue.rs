// 该文件是 Shanan （山南西风） 项目的一部分。
// src/dispatch/queue.rs - 有界请求队列
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

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::DispatchError;
use super::request::Job;

/// 队列容量：排队中与正在处理的请求总数上限
pub const QUEUE_CAPACITY: usize = 3;

struct QueueState {
  jobs: VecDeque<Job>,
  in_flight: usize,
  running: bool,
}

impl QueueState {
  fn occupancy(&self) -> usize {
    self.jobs.len() + self.in_flight
  }
}

/// 多生产者、单消费者的 FIFO 队列
///
/// 入队从不等待：满时立即拒绝。工作线程在队列为空时阻塞。
pub(crate) struct JobQueue {
  state: Mutex<QueueState>,
  available: Condvar,
  capacity: usize,
}

impl JobQueue {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      state: Mutex::new(QueueState {
        jobs: VecDeque::with_capacity(capacity),
        in_flight: 0,
        running: true,
      }),
      available: Condvar::new(),
      capacity,
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  /// 尝试入队；`on_admit` 在持锁期间调用，保证计数先于处理
  pub(crate) fn try_push(&self, job: Job, on_admit: impl FnOnce()) -> Result<(), DispatchError> {
    let mut state = self.lock();
    if !state.running {
      return Err(DispatchError::ShuttingDown);
    }
    if state.occupancy() >= self.capacity {
      return Err(DispatchError::QueueFull);
    }
    on_admit();
    state.jobs.push_back(job);
    self.available.notify_one();
    Ok(())
  }

  /// 阻塞直到有请求可取或队列关闭；关闭后返回 `None`，不再取出剩余请求
  pub(crate) fn pop(&self) -> Option<Job> {
    let mut state = self.lock();
    loop {
      if !state.running {
        return None;
      }
      if let Some(job) = state.jobs.pop_front() {
        state.in_flight += 1;
        return Some(job);
      }
      state = self
        .available
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  /// 当前请求处理完毕，释放占用
  pub(crate) fn finish(&self) {
    let mut state = self.lock();
    state.in_flight = state.in_flight.saturating_sub(1);
  }

  pub(crate) fn occupancy(&self) -> usize {
    self.lock().occupancy()
  }

  pub(crate) fn is_running(&self) -> bool {
    self.lock().running
  }

  /// 停止接收新请求并唤醒工作线程
  pub(crate) fn close(&self) {
    let mut state = self.lock();
    state.running = false;
    self.available.notify_all();
  }

  /// 取出所有尚未处理的请求
  pub(crate) fn drain(&self) -> Vec<Job> {
    self.lock().jobs.drain(..).collect()
  }
}
