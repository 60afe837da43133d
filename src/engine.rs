// 该文件是 Dapur Vision 项目的一部分。
// src/engine.rs - 推理引擎句柄
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
  str::FromStr,
  sync::{Mutex, OnceLock},
};

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  input::DecodedImage,
  model::{DetectResult, Model, ModelError},
};

/// 部署使用的模型（固定，不从环境读取）
pub const MODEL_URL: &str = "onnx:yolo11n.onnx";
/// 置信度阈值
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;
/// 推理设备
pub const DEVICE: Device = Device::Cpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
  Cpu,
  Cuda(u32),
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(id) => write!(f, "cuda:{}", id),
    }
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown device '{0}', expected 'cpu' or 'cuda:<id>'")]
pub struct DeviceParseError(String);

impl FromStr for Device {
  type Err = DeviceParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_ascii_lowercase();
    match lower.as_str() {
      "cpu" => Ok(Device::Cpu),
      "cuda" => Ok(Device::Cuda(0)),
      other => other
        .strip_prefix("cuda:")
        .and_then(|id| id.parse().ok())
        .map(Device::Cuda)
        .ok_or_else(|| DeviceParseError(s.to_string())),
    }
  }
}

/// 模型提供方凭据，允许为空，调试输出时隐藏
///
/// 只供需要远程提供方的后端使用；`onnx:` 后端读取本地模型文件，不使用该凭据。
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
  pub fn new(value: impl Into<String>) -> Self {
    Credential(value.into())
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn expose(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for Credential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.0.is_empty() {
      write!(f, "Credential(<empty>)")
    } else {
      write!(f, "Credential(<redacted>)")
    }
  }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
  model_url: Url,
  device: Device,
  confidence_threshold: f32,
  credential: Credential,
  sessions: usize,
}

impl EngineSettings {
  pub fn new(model_url: Url, device: Device, confidence_threshold: f32) -> Self {
    Self {
      model_url,
      device,
      confidence_threshold,
      credential: Credential::default(),
      sessions: 1,
    }
  }

  /// 部署配置：模型、阈值、设备均为常量
  pub fn fixed() -> Result<Self, url::ParseError> {
    Ok(Self::new(
      Url::parse(MODEL_URL)?,
      DEVICE,
      CONFIDENCE_THRESHOLD,
    ))
  }

  pub fn credential(mut self, credential: Credential) -> Self {
    self.credential = credential;
    self
  }

  /// 后端可同时运行的会话数量，通常与并发上限一致
  pub fn with_sessions(mut self, sessions: usize) -> Self {
    self.sessions = sessions.max(1);
    self
  }

  pub fn model_url(&self) -> &Url {
    &self.model_url
  }

  /// 对外报告的模型标识
  pub fn model_path(&self) -> &str {
    self.model_url.path()
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  /// 随设置一起交给加载器，ONNX 后端忽略
  pub fn provider_credential(&self) -> &Credential {
    &self.credential
  }

  pub fn sessions(&self) -> usize {
    self.sessions
  }
}

/// 进程级模型句柄
///
/// 加载只发生一次，加载后模型不可变，可被多个工作线程并发调用。
pub struct EngineHandle<M> {
  settings: EngineSettings,
  model: OnceLock<M>,
  load_lock: Mutex<()>,
}

impl<M: Model> EngineHandle<M> {
  pub fn new(settings: EngineSettings) -> Self {
    Self {
      settings,
      model: OnceLock::new(),
      load_lock: Mutex::new(()),
    }
  }

  /// 以已经构造好的模型创建句柄
  pub fn loaded(settings: EngineSettings, model: M) -> Self {
    let handle = Self::new(settings);
    let _ = handle.model.set(model);
    handle
  }

  pub fn settings(&self) -> &EngineSettings {
    &self.settings
  }

  pub fn is_loaded(&self) -> bool {
    self.model.get().is_some()
  }

  pub fn load_with<F>(&self, loader: F) -> Result<(), ModelError>
  where
    F: FnOnce(&EngineSettings) -> Result<M, ModelError>,
  {
    let _guard = self
      .load_lock
      .lock()
      .map_err(|_| ModelError::Load("engine load lock poisoned".to_string()))?;

    if self.is_loaded() {
      warn!("模型已加载，忽略重复加载: {}", self.settings.model_path());
      return Ok(());
    }

    info!(
      "加载模型: {} (设备: {}, 置信度阈值: {})",
      self.settings.model_path(),
      self.settings.device,
      self.settings.confidence_threshold
    );
    let model = loader(&self.settings)?;
    // 持有 load_lock，set 不会失败
    let _ = self.model.set(model);
    info!("模型加载完成，设备: {}", self.settings.device);
    Ok(())
  }

  pub fn infer(&self, image: &DecodedImage) -> Result<DetectResult<M::Label>, ModelError> {
    let model = self.model.get().ok_or(ModelError::NotLoaded)?;
    model.infer(image)
  }
}
