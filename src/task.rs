// 该文件是 Dapur Vision 项目的一部分。
// src/task.rs - 推理任务执行器
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
  any::Any,
  panic::{self, AssertUnwindSafe},
  sync::Arc,
  time::{Duration, Instant},
};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{
  admission::AdmissionSlot,
  engine::EngineHandle,
  input::DecodedImage,
  model::{DetectResult, Model, ModelError},
};

#[derive(Error, Debug)]
pub enum TaskError {
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error("Failed to build inference worker pool: {0}")]
  PoolBuild(#[from] rayon::ThreadPoolBuildError),
  #[error("Inference worker panicked: {0}")]
  WorkerPanicked(String),
  #[error("Inference worker exited without a result")]
  WorkerGone,
  #[error("Inference did not finish within {0:?}")]
  Timeout(Duration),
}

/// 推理结果与耗时
#[derive(Debug)]
pub struct TaskOutcome<T> {
  pub result: DetectResult<T>,
  pub elapsed: Duration,
}

enum WorkerReply<T> {
  Finished(Result<DetectResult<T>, ModelError>, Duration),
  Panicked(String),
}

/// 在独立线程池中执行阻塞推理，不占用请求调度线程
pub struct InferenceExecutor {
  pool: rayon::ThreadPool,
  timeout: Option<Duration>,
}

impl InferenceExecutor {
  pub fn new(workers: usize) -> Result<Self, TaskError> {
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(workers.max(1))
      .thread_name(|index| format!("inference-{}", index))
      .build()?;

    Ok(Self {
      pool,
      timeout: None,
    })
  }

  /// 推理超时只让请求提前返回；许可随工作线程一起释放
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn workers(&self) -> usize {
    self.pool.current_num_threads()
  }

  /// 提交一次推理
  ///
  /// `slot` 随任务进入工作线程，在模型调用返回后、结果送回之前释放，
  /// 因此无论成功、失败还是 panic，调用方拿到结果时许可都已归还。
  pub async fn run<M: Model>(
    &self,
    engine: Arc<EngineHandle<M>>,
    image: DecodedImage,
    slot: AdmissionSlot,
  ) -> Result<TaskOutcome<M::Label>, TaskError> {
    let (tx, rx) = oneshot::channel::<WorkerReply<M::Label>>();
    let started = Instant::now();

    self.pool.spawn(move || {
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.infer(&image)));
      let elapsed = started.elapsed();
      debug!("推理线程返回，许可占用 {:.2?}", slot.held_for());
      slot.release();
      drop(image);

      let reply = match outcome {
        Ok(result) => WorkerReply::Finished(result, elapsed),
        Err(payload) => WorkerReply::Panicked(panic_message(payload.as_ref())),
      };
      if tx.send(reply).is_err() {
        warn!("推理结果无人接收，请求可能已取消或超时");
      }
    });

    let received = match self.timeout {
      Some(limit) => tokio::time::timeout(limit, rx)
        .await
        .map_err(|_| TaskError::Timeout(limit))?,
      None => rx.await,
    };

    match received.map_err(|_| TaskError::WorkerGone)? {
      WorkerReply::Finished(result, elapsed) => Ok(TaskOutcome {
        result: result?,
        elapsed,
      }),
      WorkerReply::Panicked(message) => {
        error!("推理线程 panic: {}", message);
        Err(TaskError::WorkerPanicked(message))
      }
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
