// 该文件是 Dapur Vision 项目的一部分。
// tests/common/mod.rs - 集成测试公共工具
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

#![allow(dead_code)]

use std::{
  io::Cursor,
  num::NonZeroUsize,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use axum::{
  Router,
  body::{Body, to_bytes},
  http::{Request, Response, header},
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;

use dapur_vision::{
  auth::AuthPolicy,
  engine::{EngineHandle, EngineSettings},
  input::DecodedImage,
  lifecycle::Lifecycle,
  model::{CocoLabel, DetectItem, DetectResult, Model, ModelError, WithLabel},
  pipeline::{DetectionPipeline, PipelineOptions},
  server::{AppState, DEFAULT_MAX_UPLOAD_BYTES, create_router},
};

pub const BOUNDARY: &str = "dapur-vision-test-boundary";

#[derive(Clone, Copy)]
pub enum Script {
  /// 返回覆盖整幅图像的一个碗和一个勺子
  Detect,
  Nothing,
  Fail,
  Panic,
}

/// 记录同时在途调用数量的测试模型
pub struct ScriptedModel {
  script: Script,
  delay: Duration,
  in_flight: AtomicUsize,
  peak: Arc<AtomicUsize>,
  calls: Arc<AtomicUsize>,
}

impl ScriptedModel {
  pub fn new(script: Script) -> Self {
    Self {
      script,
      delay: Duration::ZERO,
      in_flight: AtomicUsize::new(0),
      peak: Arc::new(AtomicUsize::new(0)),
      calls: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn peak(&self) -> Arc<AtomicUsize> {
    self.peak.clone()
  }

  pub fn calls(&self) -> Arc<AtomicUsize> {
    self.calls.clone()
  }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl Model for ScriptedModel {
  type Label = CocoLabel;

  fn infer(&self, input: &DecodedImage) -> Result<DetectResult<CocoLabel>, ModelError> {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    let _in_flight = InFlight(&self.in_flight);
    self.peak.fetch_max(now, Ordering::SeqCst);
    self.calls.fetch_add(1, Ordering::SeqCst);

    if !self.delay.is_zero() {
      std::thread::sleep(self.delay);
    }

    let (width, height) = (input.width() as f32, input.height() as f32);
    match self.script {
      Script::Detect => Ok(
        vec![
          DetectItem {
            kind: CocoLabel::from_label_id(45),
            score: 0.91234,
            bbox: [0.0, 0.0, width, height],
          },
          DetectItem {
            kind: CocoLabel::from_label_id(44),
            score: 0.55555,
            bbox: [width / 4.0, height / 4.0, width / 2.0, height / 2.0],
          },
        ]
        .into(),
      ),
      Script::Nothing => Ok(DetectResult::empty()),
      Script::Fail => Err(ModelError::Inference("device out of memory".to_string())),
      Script::Panic => panic!("corrupt tensor shape"),
    }
  }
}

pub struct TestApp {
  pub router: Router,
  pub state: Arc<AppState<ScriptedModel>>,
}

pub fn app(model: ScriptedModel, cap: usize) -> TestApp {
  app_with(Some(model), cap, AuthPolicy::AlwaysAllow, PipelineOptions::default())
}

pub fn app_with(
  model: Option<ScriptedModel>,
  cap: usize,
  auth: AuthPolicy,
  options: PipelineOptions,
) -> TestApp {
  app_with_upload_limit(model, cap, auth, options, DEFAULT_MAX_UPLOAD_BYTES)
}

pub fn app_with_upload_limit(
  model: Option<ScriptedModel>,
  cap: usize,
  auth: AuthPolicy,
  options: PipelineOptions,
  max_upload_bytes: usize,
) -> TestApp {
  let settings = EngineSettings::fixed().unwrap();
  let engine = match model {
    Some(model) => EngineHandle::loaded(settings, model),
    None => EngineHandle::new(settings),
  };
  let lifecycle = Arc::new(Lifecycle::with_engine(Arc::new(engine)));
  let options = PipelineOptions {
    max_concurrent: NonZeroUsize::new(cap).unwrap(),
    ..options
  };
  let pipeline = DetectionPipeline::new(lifecycle, options).unwrap();
  let state = Arc::new(AppState::new(pipeline, auth).with_max_upload_bytes(max_upload_bytes));
  TestApp {
    router: create_router(state.clone()),
    state,
  }
}

pub fn encode(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
  let image = RgbImage::from_fn(width, height, |x, y| {
    Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128])
  });
  let mut buffer = Cursor::new(Vec::new());
  DynamicImage::ImageRgb8(image)
    .write_to(&mut buffer, format)
    .unwrap();
  buffer.into_inner()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
  encode(ImageFormat::Png, width, height)
}

/// 构造只含一个字段的 multipart 请求体
pub fn multipart_body(field: &str, file_name: &str, content_type: Option<&str>, bytes: &[u8]) -> Vec<u8> {
  let mut body = Vec::new();
  body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
  body.extend_from_slice(
    format!(
      "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
      field, file_name
    )
    .as_bytes(),
  );
  if let Some(content_type) = content_type {
    body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
  }
  body.extend_from_slice(b"\r\n");
  body.extend_from_slice(bytes);
  body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
  body
}

pub fn detect_request(content_type: Option<&str>, bytes: &[u8]) -> Request<Body> {
  detect_request_with(multipart_body("file", "upload.bin", content_type, bytes), None)
}

pub fn detect_request_with(body: Vec<u8>, authorization: Option<&str>) -> Request<Body> {
  let mut builder = Request::builder()
    .method("POST")
    .uri("/detect")
    .header(
      header::CONTENT_TYPE,
      format!("multipart/form-data; boundary={}", BOUNDARY),
    );
  if let Some(authorization) = authorization {
    builder = builder.header(header::AUTHORIZATION, authorization);
  }
  builder.body(Body::from(body)).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
  Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
  let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
  serde_json::from_slice(&bytes).unwrap()
}
