// 该文件是 Dapur Vision 项目的一部分。
// src/lifecycle.rs - 服务生命周期与健康检查
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
  fmt,
  sync::{
    Arc, Mutex, OnceLock,
    atomic::{AtomicU8, Ordering},
  },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
  engine::{EngineHandle, EngineSettings},
  model::{Model, ModelError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
  Starting = 0,
  Loading = 1,
  Ready = 2,
  Failed = 3,
  Stopping = 4,
}

impl LifecycleState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => LifecycleState::Starting,
      1 => LifecycleState::Loading,
      2 => LifecycleState::Ready,
      3 => LifecycleState::Failed,
      _ => LifecycleState::Stopping,
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      LifecycleState::Starting => "starting",
      LifecycleState::Loading => "loading",
      LifecycleState::Ready => "ready",
      LifecycleState::Failed => "failed",
      LifecycleState::Stopping => "stopping",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
  pub status: HealthStatus,
  pub model_loaded: bool,
  pub model_path: String,
  pub device: String,
}

/// 管理模型加载与服务状态
///
/// `loading -> ready` 只发生一次；加载失败后不会自动重试。
pub struct Lifecycle<M> {
  engine: Arc<EngineHandle<M>>,
  state: AtomicU8,
  started_at: DateTime<Utc>,
  ready_at: OnceLock<DateTime<Utc>>,
  failure: Mutex<Option<String>>,
}

impl<M: Model> Lifecycle<M> {
  pub fn new(settings: EngineSettings) -> Self {
    Self::with_engine(Arc::new(EngineHandle::new(settings)))
  }

  pub fn with_engine(engine: Arc<EngineHandle<M>>) -> Self {
    let state = if engine.is_loaded() {
      LifecycleState::Ready
    } else {
      LifecycleState::Starting
    };
    let lifecycle = Self {
      engine,
      state: AtomicU8::new(state as u8),
      started_at: Utc::now(),
      ready_at: OnceLock::new(),
      failure: Mutex::new(None),
    };
    if state == LifecycleState::Ready {
      let _ = lifecycle.ready_at.set(lifecycle.started_at);
    }
    lifecycle
  }

  /// 同步加载模型，必须在开始接受 `/detect` 之前调用
  pub fn start<F>(&self, loader: F) -> Result<(), ModelError>
  where
    F: FnOnce(&EngineSettings) -> Result<M, ModelError>,
  {
    match self.state() {
      LifecycleState::Ready => return Ok(()),
      LifecycleState::Failed => {
        let message = self
          .failure
          .lock()
          .ok()
          .and_then(|failure| failure.clone())
          .unwrap_or_else(|| "previous load failed".to_string());
        return Err(ModelError::Load(message));
      }
      LifecycleState::Stopping => {
        return Err(ModelError::Load("service is stopping".to_string()));
      }
      LifecycleState::Starting | LifecycleState::Loading => {}
    }

    self.set_state(LifecycleState::Loading);
    match self.engine.load_with(loader) {
      Ok(()) => {
        let _ = self.ready_at.set(Utc::now());
        self.set_state(LifecycleState::Ready);
        info!("服务就绪，模型: {}", self.engine.settings().model_path());
        Ok(())
      }
      Err(err) => {
        error!("模型加载失败: {}", err);
        if let Ok(mut failure) = self.failure.lock() {
          *failure = Some(err.to_string());
        }
        self.set_state(LifecycleState::Failed);
        Err(err)
      }
    }
  }

  /// 进入停止状态，健康检查随之报告 unhealthy
  pub fn shutdown(&self) {
    info!("服务停止中 (状态: {})", self.state());
    self.set_state(LifecycleState::Stopping);
  }

  pub fn state(&self) -> LifecycleState {
    LifecycleState::from_u8(self.state.load(Ordering::Acquire))
  }

  pub fn is_ready(&self) -> bool {
    self.state() == LifecycleState::Ready
  }

  pub fn engine(&self) -> &Arc<EngineHandle<M>> {
    &self.engine
  }

  pub fn started_at(&self) -> DateTime<Utc> {
    self.started_at
  }

  pub fn ready_at(&self) -> Option<DateTime<Utc>> {
    self.ready_at.get().copied()
  }

  pub fn health(&self) -> HealthReport {
    let settings = self.engine.settings();
    let status = if self.is_ready() && self.engine.is_loaded() {
      HealthStatus::Healthy
    } else {
      HealthStatus::Unhealthy
    };

    HealthReport {
      status,
      model_loaded: self.engine.is_loaded(),
      model_path: settings.model_path().to_string(),
      device: settings.device().to_string(),
    }
  }

  fn set_state(&self, state: LifecycleState) {
    self.state.store(state as u8, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    input::DecodedImage,
    model::{CocoLabel, DetectResult},
  };
  use std::sync::atomic::AtomicUsize;

  struct Nothing;

  impl Model for Nothing {
    type Label = CocoLabel;

    fn infer(&self, _input: &DecodedImage) -> Result<DetectResult<CocoLabel>, ModelError> {
      Ok(DetectResult::empty())
    }
  }

  fn lifecycle() -> Lifecycle<Nothing> {
    Lifecycle::new(EngineSettings::fixed().unwrap())
  }

  #[test]
  fn health_is_unhealthy_before_load() {
    let lifecycle = lifecycle();
    assert_eq!(lifecycle.state(), LifecycleState::Starting);

    let health = lifecycle.health();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(!health.model_loaded);
    assert_eq!(health.model_path, "yolo11n.onnx");
    assert_eq!(health.device, "cpu");
  }

  #[test]
  fn successful_start_becomes_ready_once() {
    let lifecycle = lifecycle();
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
      lifecycle
        .start(|_| {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(Nothing)
        })
        .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(lifecycle.is_ready());
    assert!(lifecycle.ready_at().is_some());
    let health = lifecycle.health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.model_loaded);
  }

  #[test]
  fn failed_start_is_sticky() {
    let lifecycle = lifecycle();
    let err = lifecycle
      .start(|_| Err(ModelError::Load("weights not found".to_string())))
      .unwrap_err();
    assert!(err.to_string().contains("weights not found"));
    assert_eq!(lifecycle.state(), LifecycleState::Failed);

    let again = lifecycle.start(|_| Ok(Nothing)).unwrap_err();
    assert!(again.to_string().contains("weights not found"));
    assert!(!lifecycle.engine().is_loaded());
    assert_eq!(lifecycle.health().status, HealthStatus::Unhealthy);
  }

  #[test]
  fn shutdown_reports_unhealthy() {
    let lifecycle = lifecycle();
    lifecycle.start(|_| Ok(Nothing)).unwrap();
    lifecycle.shutdown();

    let health = lifecycle.health();
    assert_eq!(lifecycle.state(), LifecycleState::Stopping);
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.model_loaded);
  }

  #[test]
  fn start_after_shutdown_stays_stopping() {
    let lifecycle = lifecycle();
    lifecycle.start(|_| Ok(Nothing)).unwrap();
    lifecycle.shutdown();

    let err = lifecycle.start(|_| Ok(Nothing)).unwrap_err();
    assert!(err.to_string().contains("stopping"));
    assert_eq!(lifecycle.state(), LifecycleState::Stopping);
    assert_eq!(lifecycle.health().status, HealthStatus::Unhealthy);
  }

  #[test]
  fn preloaded_engine_starts_ready() {
    let engine = Arc::new(EngineHandle::loaded(EngineSettings::fixed().unwrap(), Nothing));
    let lifecycle = Lifecycle::with_engine(engine);
    assert!(lifecycle.is_ready());
  }

  #[test]
  fn health_serializes_lowercase_status() {
    let value = serde_json::to_value(lifecycle().health()).unwrap();
    assert_eq!(value["status"], "unhealthy");
    assert_eq!(value["model_loaded"], false);
  }
}
