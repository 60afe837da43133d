// 该文件是 Dapur Vision 项目的一部分。
// src/pipeline.rs - 单次检测请求的处理流程
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

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::{
  admission::{AdmissionController, AdmissionError},
  input::{self, InputError},
  lifecycle::Lifecycle,
  model::{Model, ModelError},
  output::{self, DetectionResponse, ErrorCode, ErrorPayload},
  task::{InferenceExecutor, TaskError},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error(transparent)]
  Input(#[from] InputError),
  #[error(transparent)]
  Admission(#[from] AdmissionError),
  #[error(transparent)]
  Task(#[from] TaskError),
  #[error("Model not loaded")]
  NotReady,
}

impl PipelineError {
  pub fn code(&self) -> ErrorCode {
    match self {
      PipelineError::Input(InputError::UnsupportedMediaType { .. }) => ErrorCode::InvalidFileType,
      PipelineError::Input(_) => ErrorCode::DetectionFailed,
      PipelineError::Admission(AdmissionError::QueueTimeout(_)) => ErrorCode::QueueTimeout,
      PipelineError::Admission(AdmissionError::Closed) => ErrorCode::ModelNotLoaded,
      PipelineError::Admission(AdmissionError::ZeroCapacity) => ErrorCode::DetectionFailed,
      PipelineError::Task(TaskError::Model(ModelError::NotLoaded)) => ErrorCode::ModelNotLoaded,
      PipelineError::Task(_) => ErrorCode::DetectionFailed,
      PipelineError::NotReady => ErrorCode::ModelNotLoaded,
    }
  }

  pub fn to_payload(&self) -> ErrorPayload {
    let code = self.code();
    let message = match code {
      ErrorCode::DetectionFailed => format!("Failed to process image: {}", self),
      _ => self.to_string(),
    };
    output::to_error_response(code, message)
  }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
  pub max_concurrent: NonZeroUsize,
  pub queue_timeout: Option<Duration>,
  pub inference_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      max_concurrent: NonZeroUsize::new(2).unwrap_or(NonZeroUsize::MIN),
      queue_timeout: None,
      inference_timeout: None,
    }
  }
}

/// 一次上传的检测请求
#[derive(Debug, Clone)]
pub struct DetectRequest {
  pub request_id: String,
  pub file_name: Option<String>,
  pub content_type: Option<String>,
  pub bytes: Bytes,
}

impl DetectRequest {
  pub fn new(file_name: Option<String>, content_type: Option<String>, bytes: Bytes) -> Self {
    Self {
      request_id: Uuid::new_v4().to_string(),
      file_name,
      content_type,
      bytes,
    }
  }
}

/// 解码 -> 准入 -> 推理 -> 映射
///
/// 准入许可数与推理线程数使用同一个上限。
pub struct DetectionPipeline<M> {
  lifecycle: Arc<Lifecycle<M>>,
  admission: AdmissionController,
  executor: InferenceExecutor,
}

impl<M: Model> DetectionPipeline<M> {
  pub fn new(lifecycle: Arc<Lifecycle<M>>, options: PipelineOptions) -> Result<Self, PipelineError> {
    let cap = options.max_concurrent.get();
    let admission = AdmissionController::new(cap)?.with_queue_timeout(options.queue_timeout);
    let executor = InferenceExecutor::new(cap)?.with_timeout(options.inference_timeout);
    info!("检测并发上限: {}", cap);

    Ok(Self {
      lifecycle,
      admission,
      executor,
    })
  }

  pub fn lifecycle(&self) -> &Arc<Lifecycle<M>> {
    &self.lifecycle
  }

  pub fn admission(&self) -> &AdmissionController {
    &self.admission
  }

  #[instrument(skip_all, fields(request_id = %request.request_id))]
  pub async fn detect(&self, request: DetectRequest) -> Result<DetectionResponse, PipelineError> {
    let request_id = request.request_id.clone();
    let result = self.run(request).await;
    if let Err(err) = &result {
      error!("[{}] 检测失败: {}", request_id, err);
    }
    result
  }

  async fn run(&self, request: DetectRequest) -> Result<DetectionResponse, PipelineError> {
    let DetectRequest {
      request_id,
      file_name,
      content_type,
      bytes,
    } = request;

    let image = input::decode(&bytes, content_type.as_deref())?;
    drop(bytes);
    info!(
      "[{}] 处理图像: {}, 尺寸: {}x{}",
      request_id,
      file_name.as_deref().unwrap_or("<unnamed>"),
      image.width(),
      image.height()
    );

    let engine = self.lifecycle.engine();
    if !engine.is_loaded() {
      return Err(PipelineError::NotReady);
    }

    let slot = self.admission.acquire().await?;
    debug!(
      "[{}] 进入检测准入 ({}/{})",
      request_id,
      self.admission.in_use(),
      self.admission.capacity()
    );

    let outcome = self.executor.run(engine.clone(), image, slot).await?;
    let response = output::to_response(&request_id, &outcome.result, outcome.elapsed);
    info!(
      "[{}] 检测完成: {} 个目标，用时 {:.2}ms",
      request_id, response.detection_count, response.processing_time_ms
    );
    Ok(response)
  }

  /// 停止接受新的准入请求
  pub fn close(&self) {
    self.admission.close();
  }

  /// 进入停止状态并拒绝新的检测，处理中的请求继续完成
  pub fn shutdown(&self) {
    self.lifecycle.shutdown();
    self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    engine::{EngineHandle, EngineSettings},
    input::DecodedImage,
    model::{CocoLabel, DetectItem, DetectResult, WithLabel},
  };
  use image::{DynamicImage, ImageFormat, RgbImage};
  use std::io::Cursor;

  struct Bowl;

  impl Model for Bowl {
    type Label = CocoLabel;

    fn infer(&self, input: &DecodedImage) -> Result<DetectResult<CocoLabel>, ModelError> {
      Ok(
        vec![DetectItem {
          kind: CocoLabel::from_label_id(45),
          score: 0.66666,
          bbox: [0.0, 0.0, input.width() as f32, input.height() as f32],
        }]
        .into(),
      )
    }
  }

  fn png(width: u32, height: u32) -> Bytes {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
      .write_to(&mut buffer, ImageFormat::Png)
      .unwrap();
    Bytes::from(buffer.into_inner())
  }

  fn pipeline(loaded: bool) -> DetectionPipeline<Bowl> {
    let settings = EngineSettings::fixed().unwrap();
    let engine = if loaded {
      EngineHandle::loaded(settings, Bowl)
    } else {
      EngineHandle::new(settings)
    };
    let lifecycle = Arc::new(Lifecycle::with_engine(Arc::new(engine)));
    DetectionPipeline::new(lifecycle, PipelineOptions::default()).unwrap()
  }

  fn request(content_type: &str, bytes: Bytes) -> DetectRequest {
    DetectRequest::new(
      Some("bowl.png".to_string()),
      Some(content_type.to_string()),
      bytes,
    )
  }

  #[tokio::test]
  async fn detects_and_maps_in_source_pixels() {
    let pipeline = pipeline(true);
    let request = request("image/png", png(40, 30));
    let request_id = request.request_id.clone();

    let response = pipeline.detect(request).await.unwrap();
    assert_eq!(response.request_id, request_id);
    assert_eq!(response.detection_count, 1);
    assert_eq!(response.detections[0].class_name, "bowl");
    assert_eq!(response.detections[0].confidence, 0.6667);
    assert_eq!(response.detections[0].bbox.x2, 40.0);
    assert_eq!(response.detections[0].bbox.y2, 30.0);
    assert_eq!(pipeline.admission().in_use(), 0);
  }

  #[tokio::test]
  async fn unsupported_type_is_invalid_file_type() {
    let err = pipeline(true)
      .detect(request("image/gif", png(4, 4)))
      .await
      .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidFileType);
    assert!(err.to_payload().message.contains("image/gif"));
  }

  #[tokio::test]
  async fn corrupt_bytes_are_detection_failed() {
    let err = pipeline(true)
      .detect(request("image/jpeg", Bytes::from_static(b"not a jpeg")))
      .await
      .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DetectionFailed);
    assert!(err.to_payload().message.starts_with("Failed to process image"));
  }

  #[tokio::test]
  async fn unloaded_engine_is_rejected_without_a_slot() {
    let pipeline = pipeline(false);
    let err = pipeline
      .detect(request("image/png", png(4, 4)))
      .await
      .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelNotLoaded);
    assert_eq!(pipeline.admission().in_use(), 0);
  }

  #[tokio::test]
  async fn closed_pipeline_refuses_new_work() {
    let pipeline = pipeline(true);
    pipeline.close();
    let err = pipeline
      .detect(request("image/png", png(4, 4)))
      .await
      .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelNotLoaded);
  }

  #[tokio::test]
  async fn shutdown_refuses_new_work_and_reports_unhealthy() {
    let pipeline = pipeline(true);
    pipeline.shutdown();

    let err = pipeline
      .detect(request("image/png", png(4, 4)))
      .await
      .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ModelNotLoaded);
    assert_eq!(err.to_payload().message, "Service is shutting down");
    assert_eq!(
      pipeline.lifecycle().health().status,
      crate::lifecycle::HealthStatus::Unhealthy
    );
    assert_eq!(pipeline.admission().in_use(), 0);
  }

  #[test]
  fn error_codes_follow_taxonomy() {
    assert_eq!(
      PipelineError::from(AdmissionError::QueueTimeout(Duration::from_secs(1))).code(),
      ErrorCode::QueueTimeout
    );
    assert_eq!(
      PipelineError::from(TaskError::WorkerPanicked("boom".to_string())).code(),
      ErrorCode::DetectionFailed
    );
    assert_eq!(
      PipelineError::from(TaskError::Model(ModelError::Inference("oom".to_string()))).code(),
      ErrorCode::DetectionFailed
    );
    assert_eq!(
      PipelineError::from(InputError::Empty).code(),
      ErrorCode::DetectionFailed
    );
  }
}
