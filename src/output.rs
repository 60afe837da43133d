// 该文件是 Dapur Vision 项目的一部分。
// src/output.rs - 检测结果输出格式
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

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{DetectItem, DetectResult, WithLabel};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl From<[f32; 4]> for BBox {
  fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
    BBox { x1, y1, x2, y2 }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub id: String,
  pub class_name: String,
  pub confidence: f64,
  pub bbox: BBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
  pub success: bool,
  pub request_id: String,
  pub processing_time_ms: f64,
  pub detections: Vec<Detection>,
  pub detection_count: usize,
}

/// 机器可读的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
  InvalidFileType,
  DetectionFailed,
  Unauthorized,
  InvalidRequest,
  ModelNotLoaded,
  QueueTimeout,
}

impl ErrorCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorCode::InvalidFileType => "invalid_file_type",
      ErrorCode::DetectionFailed => "detection_failed",
      ErrorCode::Unauthorized => "unauthorized",
      ErrorCode::InvalidRequest => "invalid_request",
      ErrorCode::ModelNotLoaded => "model_not_loaded",
      ErrorCode::QueueTimeout => "queue_timeout",
    }
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
  pub error: ErrorCode,
  pub message: String,
}

fn round_to(value: f64, decimals: i32) -> f64 {
  let factor = 10f64.powi(decimals);
  (value * factor).round() / factor
}

fn to_detection<T: WithLabel>(item: &DetectItem<T>) -> Detection {
  Detection {
    id: Uuid::new_v4().to_string(),
    class_name: item.kind.to_label_str(),
    confidence: round_to(f64::from(item.score), 4),
    bbox: BBox::from(item.bbox),
  }
}

/// 将模型输出转换为响应，保持模型输出顺序，坐标原样保留
pub fn to_response<T: WithLabel>(
  request_id: &str,
  result: &DetectResult<T>,
  elapsed: Duration,
) -> DetectionResponse {
  let detections: Vec<Detection> = result.iter().map(to_detection).collect();

  DetectionResponse {
    success: true,
    request_id: request_id.to_string(),
    processing_time_ms: round_to(elapsed.as_secs_f64() * 1000.0, 2),
    detection_count: detections.len(),
    detections,
  }
}

pub fn to_error_response(code: ErrorCode, message: impl Into<String>) -> ErrorPayload {
  ErrorPayload {
    error: code,
    message: message.into(),
  }
}
