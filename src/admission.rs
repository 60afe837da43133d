// 该文件是 Dapur Vision 项目的一部分。
// src/admission.rs - 推理并发准入控制
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

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
  #[error("Admission capacity must be at least 1")]
  ZeroCapacity,
  #[error("Timed out after {0:?} waiting for a detection slot")]
  QueueTimeout(Duration),
  #[error("Service is shutting down")]
  Closed,
}

/// 固定容量的许可池
///
/// 同时持有的许可数永远不超过 `capacity`。等待者按 FIFO 排队，
/// 等待只挂起当前请求，不阻塞其他请求。
#[derive(Clone)]
pub struct AdmissionController {
  semaphore: Arc<Semaphore>,
  capacity: usize,
  waiting: Arc<AtomicUsize>,
  queue_timeout: Option<Duration>,
}

impl AdmissionController {
  pub fn new(capacity: usize) -> Result<Self, AdmissionError> {
    if capacity == 0 {
      return Err(AdmissionError::ZeroCapacity);
    }

    Ok(Self {
      semaphore: Arc::new(Semaphore::new(capacity)),
      capacity,
      waiting: Arc::new(AtomicUsize::new(0)),
      queue_timeout: None,
    })
  }

  /// 等待许可的最长时间，`None` 表示无限等待
  pub fn with_queue_timeout(mut self, queue_timeout: Option<Duration>) -> Self {
    self.queue_timeout = queue_timeout;
    self
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn in_use(&self) -> usize {
    self.capacity - self.semaphore.available_permits()
  }

  pub fn waiting(&self) -> usize {
    self.waiting.load(Ordering::Acquire)
  }

  pub fn queue_timeout(&self) -> Option<Duration> {
    self.queue_timeout
  }

  pub async fn acquire(&self) -> Result<AdmissionSlot, AdmissionError> {
    match self.semaphore.clone().try_acquire_owned() {
      Ok(permit) => return Ok(AdmissionSlot::new(permit)),
      Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
      Err(TryAcquireError::NoPermits) => {}
    }

    let _waiting = WaitingGuard::enter(&self.waiting);
    let acquire = self.semaphore.clone().acquire_owned();
    let permit = match self.queue_timeout {
      Some(limit) => tokio::time::timeout(limit, acquire)
        .await
        .map_err(|_| AdmissionError::QueueTimeout(limit))?,
      None => acquire.await,
    }
    .map_err(|_| AdmissionError::Closed)?;

    Ok(AdmissionSlot::new(permit))
  }

  /// 拒绝后续的 acquire，已持有的许可不受影响
  pub fn close(&self) {
    self.semaphore.close();
  }
}

/// 一个推理许可，drop 时归还
#[derive(Debug)]
pub struct AdmissionSlot {
  _permit: OwnedSemaphorePermit,
  acquired_at: Instant,
}

impl AdmissionSlot {
  fn new(permit: OwnedSemaphorePermit) -> Self {
    Self {
      _permit: permit,
      acquired_at: Instant::now(),
    }
  }

  pub fn held_for(&self) -> Duration {
    self.acquired_at.elapsed()
  }

  pub fn release(self) {
    drop(self);
  }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::AcqRel);
    WaitingGuard(counter)
  }
}

impl Drop for WaitingGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::AcqRel);
  }
}
