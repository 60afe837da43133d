// 该文件是 Dapur Vision 项目的一部分。
// src/main.rs - 检测服务主程序
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

mod args;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dapur_vision::{
  auth::AuthPolicy,
  engine::EngineSettings,
  lifecycle::Lifecycle,
  model::{Model, ModelWrapper},
  pipeline::DetectionPipeline,
  server::{AppState, SERVICE_NAME, create_router},
};

#[tokio::main]
async fn main() -> Result<()> {
  let args = args::Args::parse();

  let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  info!("启动 {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

  let options = args.pipeline_options();
  let settings = EngineSettings::fixed()?
    .credential(args.credential())
    .with_sessions(options.max_concurrent.get());
  if !settings.provider_credential().is_empty() {
    info!("已配置模型提供方凭据");
  }

  let lifecycle = Arc::new(Lifecycle::<ModelWrapper>::new(settings));
  let loader = lifecycle.clone();
  tokio::task::spawn_blocking(move || loader.start(ModelWrapper::load))
    .await
    .context("模型加载任务异常退出")?
    .context("模型加载失败")?;

  let auth = args.auth_policy().context("无效的请求校验配置")?;
  match &auth {
    AuthPolicy::AlwaysAllow => warn!("请求校验: {}，所有请求都会被接受", auth.name()),
    other => info!("请求校验: {}", other.name()),
  }

  let pipeline = DetectionPipeline::new(lifecycle, options)?;
  let state = Arc::new(AppState::new(pipeline, auth).with_max_upload_bytes(args.max_upload_bytes));
  let router = create_router(state.clone());

  let bind_addr = args.bind_addr();
  let listener = TcpListener::bind(&bind_addr)
    .await
    .with_context(|| format!("无法监听 {}", bind_addr))?;
  info!("服务监听: http://{}", bind_addr);

  axum::serve(
    listener,
    router.into_make_service_with_connect_info::<SocketAddr>(),
  )
  .with_graceful_shutdown(shutdown_signal(state))
  .await?;

  info!("服务已停止");
  Ok(())
}

async fn shutdown_signal<M: Model>(state: Arc<AppState<M>>) {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      warn!("无法监听 Ctrl+C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut term) => {
        term.recv().await;
      }
      Err(e) => {
        warn!("无法监听 SIGTERM: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }

  info!("收到停止信号，等待处理中的请求完成");
  state.pipeline.shutdown();
}
