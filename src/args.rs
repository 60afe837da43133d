// 该文件是 Dapur Vision 项目的一部分。
// src/args.rs - 服务参数配置
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

use std::{num::NonZeroUsize, time::Duration};

use clap::{Parser, ValueEnum};

use dapur_vision::{
  auth::{self, AuthError, AuthPolicy},
  engine::Credential,
  pipeline::PipelineOptions,
  server::DEFAULT_MAX_UPLOAD_BYTES,
};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
  /// 不做校验（内部服务）
  AlwaysAllow,
  /// 校验 `Authorization: Bearer <token>`
  BearerToken,
  /// 仅允许指定网段
  NetworkAcl,
}

/// Dapur Vision 检测服务参数配置
///
/// 所有参数均可通过同名环境变量设置。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 日志级别或 tracing 过滤表达式
  #[arg(long, env = "LOG_LEVEL", default_value = "info")]
  pub log_level: String,

  /// 同时进行的推理数量上限
  #[arg(long, env = "MAX_CONCURRENT_DETECTIONS", default_value = "2")]
  pub max_concurrent_detections: NonZeroUsize,

  /// 监听地址
  #[arg(long, env = "YOLO_SERVICE_HOST", default_value = "0.0.0.0")]
  pub host: String,

  /// 监听端口
  #[arg(long, env = "YOLO_SERVICE_PORT", default_value = "8001")]
  pub port: u16,

  /// 模型提供方凭据，可为空
  #[arg(long, env = "MODEL_PROVIDER_API_KEY", default_value = "", hide_env_values = true)]
  pub model_provider_api_key: String,

  /// 上传文件大小上限（字节）
  #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
  pub max_upload_bytes: usize,

  /// 等待推理许可的最长时间（毫秒），不设置则无限等待
  #[arg(long, env = "QUEUE_TIMEOUT_MS", value_name = "MILLIS")]
  pub queue_timeout_ms: Option<u64>,

  /// 单次推理的最长时间（毫秒），不设置则不限制
  #[arg(long, env = "INFERENCE_TIMEOUT_MS", value_name = "MILLIS")]
  pub inference_timeout_ms: Option<u64>,

  /// 请求校验方式
  #[arg(long, env = "AUTH_MODE", value_enum, default_value_t = AuthMode::AlwaysAllow)]
  pub auth_mode: AuthMode,

  /// bearer-token 模式使用的令牌
  #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
  pub auth_token: Option<String>,

  /// network-acl 模式允许的网段，逗号分隔
  #[arg(long, env = "AUTH_ALLOWED_NETWORKS", value_name = "CIDRS")]
  pub auth_allowed_networks: Option<String>,
}

impl Args {
  pub fn bind_addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  pub fn credential(&self) -> Credential {
    Credential::new(self.model_provider_api_key.clone())
  }

  pub fn pipeline_options(&self) -> PipelineOptions {
    PipelineOptions {
      max_concurrent: self.max_concurrent_detections,
      queue_timeout: self.queue_timeout_ms.map(Duration::from_millis),
      inference_timeout: self.inference_timeout_ms.map(Duration::from_millis),
    }
  }

  pub fn auth_policy(&self) -> Result<AuthPolicy, AuthError> {
    match self.auth_mode {
      AuthMode::AlwaysAllow => Ok(AuthPolicy::AlwaysAllow),
      AuthMode::BearerToken => AuthPolicy::bearer(Credential::new(
        self.auth_token.clone().unwrap_or_default(),
      )),
      AuthMode::NetworkAcl => {
        let networks = auth::parse_networks(self.auth_allowed_networks.as_deref().unwrap_or(""))?;
        if networks.is_empty() {
          return Err(AuthError::InvalidNetwork("<empty>".to_string()));
        }
        Ok(AuthPolicy::NetworkAcl(networks))
      }
    }
  }
}
