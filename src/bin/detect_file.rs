// 该文件是 Dapur Vision 项目的一部分。
// src/bin/detect_file.rs - 离线检测单个图像文件
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

use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing::info;
use url::Url;

use dapur_vision::{
  engine::{Device, EngineSettings, MODEL_URL},
  input::ContentType,
  lifecycle::Lifecycle,
  model::ModelWrapper,
  pipeline::{DetectRequest, DetectionPipeline, PipelineOptions},
};

/// 使用与服务相同的流程检测一个图像文件，并输出 JSON 结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址
  #[arg(long, value_name = "MODEL", default_value = MODEL_URL)]
  pub model: Url,
  /// 推理设备
  #[arg(long, default_value = "cpu")]
  pub device: Device,
  /// 置信度阈值
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// 输出格式化的 JSON
  #[arg(long)]
  pub pretty: bool,
  /// 图像文件 (jpg, png, webp)
  #[arg(value_name = "IMAGE")]
  pub image: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("图像文件: {}", args.image.display());

  let content_type = args
    .image
    .extension()
    .and_then(|ext| ext.to_str())
    .and_then(ContentType::from_extension)
    .with_context(|| format!("无法识别图像类型: {}", args.image.display()))?;
  let bytes = tokio::fs::read(&args.image)
    .await
    .with_context(|| format!("无法读取文件: {}", args.image.display()))?;

  let settings = EngineSettings::new(args.model, args.device, args.confidence);
  let lifecycle = Arc::new(Lifecycle::<ModelWrapper>::new(settings));
  lifecycle.start(ModelWrapper::load)?;

  let pipeline = DetectionPipeline::new(
    lifecycle,
    PipelineOptions {
      max_concurrent: NonZeroUsize::MIN,
      ..PipelineOptions::default()
    },
  )?;

  let request = DetectRequest::new(
    args
      .image
      .file_name()
      .map(|name| name.to_string_lossy().into_owned()),
    Some(content_type.mime().to_string()),
    Bytes::from(bytes),
  );
  let response = pipeline.detect(request).await?;

  let json = if args.pretty {
    serde_json::to_string_pretty(&response)?
  } else {
    serde_json::to_string(&response)?
  };
  println!("{}", json);

  Ok(())
}
