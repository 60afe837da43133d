// 该文件是 Dapur Vision 项目的一部分。
// src/server.rs - HTTP 接口
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

use std::{net::SocketAddr, sync::Arc};

use axum::{
  Json, Router,
  extract::{
    ConnectInfo, DefaultBodyLimit, Multipart, Request, State,
    multipart::{MultipartError, MultipartRejection},
  },
  http::{Method, StatusCode, header},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::{get, post},
};
use bytes::BytesMut;
use serde_json::{Value, json};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};
use tracing::warn;

use crate::{
  auth::AuthPolicy,
  input::ContentType,
  lifecycle::HealthReport,
  model::Model,
  output::{self, DetectionResponse, ErrorCode, ErrorPayload},
  pipeline::{DetectRequest, DetectionPipeline, PipelineError},
};

pub const SERVICE_NAME: &str = "Dapur Vision";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
/// multipart 边界与字段头的额外空间
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;
const FILE_FIELD: &str = "file";

pub struct AppState<M> {
  pub pipeline: DetectionPipeline<M>,
  pub auth: AuthPolicy,
  pub max_upload_bytes: usize,
}

impl<M: Model> AppState<M> {
  pub fn new(pipeline: DetectionPipeline<M>, auth: AuthPolicy) -> Self {
    Self {
      pipeline,
      auth,
      max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
    }
  }

  pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
    self.max_upload_bytes = max_upload_bytes;
    self
  }
}

/// 请求级错误，统一渲染为 `{error, message}`
#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  payload: ErrorPayload,
}

impl ApiError {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      status: status_for(code),
      payload: output::to_error_response(code, message),
    }
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }

  fn with_status(mut self, status: StatusCode) -> Self {
    self.status = status;
    self
  }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
  match code {
    ErrorCode::InvalidFileType => StatusCode::BAD_REQUEST,
    ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
    ErrorCode::InvalidRequest => StatusCode::UNPROCESSABLE_ENTITY,
    ErrorCode::DetectionFailed => StatusCode::INTERNAL_SERVER_ERROR,
    ErrorCode::ModelNotLoaded | ErrorCode::QueueTimeout => StatusCode::SERVICE_UNAVAILABLE,
  }
}

impl From<PipelineError> for ApiError {
  fn from(err: PipelineError) -> Self {
    let payload = err.to_payload();
    Self {
      status: status_for(payload.error),
      payload,
    }
  }
}

impl From<MultipartRejection> for ApiError {
  fn from(rejection: MultipartRejection) -> Self {
    ApiError::new(ErrorCode::InvalidRequest, rejection.body_text())
  }
}

impl From<MultipartError> for ApiError {
  fn from(err: MultipartError) -> Self {
    let api = ApiError::new(ErrorCode::InvalidRequest, err.body_text());
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
      api.with_status(StatusCode::PAYLOAD_TOO_LARGE)
    } else {
      api
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(self.payload)).into_response()
  }
}

pub fn create_router<M: Model>(state: Arc<AppState<M>>) -> Router {
  let max_upload_bytes = state.max_upload_bytes;

  let public_routes = Router::new()
    .route("/", get(root::<M>))
    .route("/health", get(health::<M>));

  let protected_routes = Router::new()
    .route("/detect", post(detect::<M>))
    .layer(DefaultBodyLimit::max(
      max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES),
    ))
    .layer(middleware::from_fn_with_state(state.clone(), verify::<M>));

  let cors = CorsLayer::new()
    .allow_origin(Any)
    .allow_methods([Method::GET, Method::POST])
    .allow_headers(Any);

  public_routes
    .merge(protected_routes)
    .with_state(state)
    .layer(cors)
    .layer(TraceLayer::new_for_http())
}

async fn root<M: Model>(State(state): State<Arc<AppState<M>>>) -> Json<Value> {
  Json(json!({
    "service": SERVICE_NAME,
    "version": env!("CARGO_PKG_VERSION"),
    "endpoints": {
      "health": "GET /health",
      "detect": "POST /detect",
    },
    "started_at": state.pipeline.lifecycle().started_at().to_rfc3339(),
  }))
}

async fn health<M: Model>(State(state): State<Arc<AppState<M>>>) -> Json<HealthReport> {
  Json(state.pipeline.lifecycle().health())
}

async fn verify<M: Model>(
  State(state): State<Arc<AppState<M>>>,
  request: Request,
  next: Next,
) -> Result<Response, ApiError> {
  let authorization = request
    .headers()
    .get(header::AUTHORIZATION)
    .and_then(|value| value.to_str().ok());
  let peer = request
    .extensions()
    .get::<ConnectInfo<SocketAddr>>()
    .map(|ConnectInfo(addr)| addr.ip());

  if let Err(err) = state.auth.verify(authorization, peer) {
    warn!("拒绝请求 ({}): {}", state.auth.name(), err);
    return Err(ApiError::new(ErrorCode::Unauthorized, err.to_string()));
  }

  Ok(next.run(request).await)
}

async fn detect<M: Model>(
  State(state): State<Arc<AppState<M>>>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, ApiError> {
  let request = read_upload(multipart?, state.max_upload_bytes)
    .await
    .inspect_err(|err| {
      warn!("无效的上传请求: {}", err.payload.message);
    })?;

  let response = state.pipeline.detect(request).await?;
  Ok(Json(response))
}

/// 读取 `file` 字段
///
/// 声明类型在读取文件内容之前检查，大小上限按文件内容计算。
async fn read_upload(mut multipart: Multipart, max_upload_bytes: usize) -> Result<DetectRequest, ApiError> {
  while let Some(mut field) = multipart.next_field().await? {
    if field.name() != Some(FILE_FIELD) {
      continue;
    }

    let file_name = field.file_name().map(str::to_string);
    let content_type = field.content_type().map(str::to_string);
    ContentType::from_declared(content_type.as_deref()).map_err(PipelineError::from)?;

    let mut buffer = BytesMut::new();
    while let Some(chunk) = field.chunk().await? {
      if buffer.len() + chunk.len() > max_upload_bytes {
        return Err(
          ApiError::new(
            ErrorCode::InvalidRequest,
            format!("Upload exceeds the limit of {} bytes", max_upload_bytes),
          )
          .with_status(StatusCode::PAYLOAD_TOO_LARGE),
        );
      }
      buffer.extend_from_slice(&chunk);
    }
    return Ok(DetectRequest::new(file_name, content_type, buffer.freeze()));
  }

  Err(ApiError::new(
    ErrorCode::InvalidRequest,
    format!("Missing multipart field '{}'", FILE_FIELD),
  ))
}
