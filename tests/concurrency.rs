// 该文件是 Dapur Vision 项目的一部分。
// tests/concurrency.rs - 并发上限测试
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

mod common;

use std::{sync::atomic::Ordering, time::Duration};

use axum::http::StatusCode;
use tokio::task::JoinSet;
use tower::ServiceExt;

use common::*;

async fn burst(app: &TestApp, requests: usize) -> Vec<StatusCode> {
  let body = png(32, 32);
  let mut tasks = JoinSet::new();
  for _ in 0..requests {
    let router = app.router.clone();
    let request = detect_request(Some("image/png"), &body);
    tasks.spawn(async move { router.oneshot(request).await.unwrap().status() });
  }

  let mut statuses = Vec::with_capacity(requests);
  while let Some(status) = tasks.join_next().await {
    statuses.push(status.unwrap());
  }
  statuses
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_inference_never_exceeds_cap() {
  let cap = 2;
  let model = ScriptedModel::new(Script::Detect).with_delay(Duration::from_millis(40));
  let peak = model.peak();
  let calls = model.calls();
  let app = app(model, cap);

  let statuses = burst(&app, 10).await;

  assert_eq!(statuses.len(), 10);
  assert!(statuses.iter().all(|status| *status == StatusCode::OK));
  assert_eq!(calls.load(Ordering::SeqCst), 10);
  let peak = peak.load(Ordering::SeqCst);
  assert_eq!(peak, cap, "peak in-flight was {}", peak);
  assert_eq!(app.state.pipeline.admission().in_use(), 0);
  assert_eq!(app.state.pipeline.admission().waiting(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cap_of_one_serialises_inference() {
  let model = ScriptedModel::new(Script::Detect).with_delay(Duration::from_millis(10));
  let peak = model.peak();
  let app = app(model, 1);

  let statuses = burst(&app, 6).await;

  assert!(statuses.iter().all(|status| *status == StatusCode::OK));
  assert_eq!(peak.load(Ordering::SeqCst), 1);
  assert_eq!(app.state.pipeline.admission().in_use(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_engine_does_not_leak_slots() {
  let model = ScriptedModel::new(Script::Fail).with_delay(Duration::from_millis(5));
  let calls = model.calls();
  let app = app(model, 2);

  let statuses = burst(&app, 8).await;

  assert!(
    statuses
      .iter()
      .all(|status| *status == StatusCode::INTERNAL_SERVER_ERROR)
  );
  assert_eq!(calls.load(Ordering::SeqCst), 8);
  assert_eq!(app.state.pipeline.admission().in_use(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_engine_does_not_leak_slots() {
  let model = ScriptedModel::new(Script::Panic);
  let calls = model.calls();
  let app = app(model, 2);

  let statuses = burst(&app, 6).await;

  assert!(
    statuses
      .iter()
      .all(|status| *status == StatusCode::INTERNAL_SERVER_ERROR)
  );
  assert_eq!(calls.load(Ordering::SeqCst), 6);
  assert_eq!(app.state.pipeline.admission().in_use(), 0);

  // 服务在 panic 之后仍可继续处理请求
  let statuses = burst(&app, 2).await;
  assert_eq!(statuses.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_inference_does_not_block_health() {
  let model = ScriptedModel::new(Script::Detect).with_delay(Duration::from_millis(500));
  let app = app(model, 1);

  let router = app.router.clone();
  let slow = tokio::spawn(async move {
    router
      .oneshot(detect_request(Some("image/png"), &png(8, 8)))
      .await
      .unwrap()
      .status()
  });
  tokio::time::sleep(Duration::from_millis(50)).await;

  let started = std::time::Instant::now();
  let health = app.router.clone().oneshot(get("/health")).await.unwrap();
  assert_eq!(health.status(), StatusCode::OK);
  assert!(started.elapsed() < Duration::from_millis(250));

  assert_eq!(slow.await.unwrap(), StatusCode::OK);
}
