// 该文件是 Dapur Vision 项目的一部分。
// src/model/yolo.rs - ONNX Runtime YOLO 检测后端
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
  path::PathBuf,
  sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicUsize, Ordering},
  },
};

use image::{Rgb, RgbImage, imageops};
use ndarray::Array4;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::TensorRef,
};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  engine::Device,
  input::DecodedImage,
  model::{CocoLabel, DetectItem, DetectResult, Model, ModelError, WithLabel},
};

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_BOX_DIMS: usize = 4;
const YOLO_DEFAULT_CONFIDENCE: f32 = 0.5;
const YOLO_DEFAULT_IOU: f32 = 0.45;

pub struct OnnxYoloBuilder {
  model_path: PathBuf,
  device: Device,
  confidence: f32,
  iou: f32,
  sessions: usize,
  intra_threads: usize,
}

impl FromUrl for OnnxYoloBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::Load(format!(
        "model url must use the '{}' scheme, got '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(OnnxYoloBuilder {
      model_path: PathBuf::from(url.path()),
      device: Device::Cpu,
      confidence: YOLO_DEFAULT_CONFIDENCE,
      iou: YOLO_DEFAULT_IOU,
      sessions: 1,
      intra_threads: 1,
    })
  }
}

impl FromUrlWithScheme for OnnxYoloBuilder {
  const SCHEME: &'static str = "onnx";
}

impl OnnxYoloBuilder {
  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn iou(mut self, iou: f32) -> Self {
    self.iou = iou;
    self
  }

  /// 会话数量，每个会话同一时间只能服务一个推理
  pub fn sessions(mut self, sessions: usize) -> Self {
    self.sessions = sessions.max(1);
    self
  }

  pub fn intra_threads(mut self, threads: usize) -> Self {
    self.intra_threads = threads.max(1);
    self
  }

  pub fn build(self) -> Result<OnnxYolo, ModelError> {
    if !self.model_path.exists() {
      return Err(ModelError::Load(format!(
        "model file not found: {}",
        self.model_path.display()
      )));
    }

    info!(
      "加载 ONNX 模型: {} ({} 个会话, 设备: {})",
      self.model_path.display(),
      self.sessions,
      self.device
    );
    let sessions = (0..self.sessions)
      .map(|_| self.session().map(Mutex::new))
      .collect::<Result<Vec<_>, _>>()?;

    let (input_name, output_name) = {
      let session = lock(&sessions[0]);
      let input = session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .ok_or_else(|| ModelError::Load("model has no inputs".to_string()))?;
      let output = session
        .outputs
        .first()
        .map(|output| output.name.clone())
        .ok_or_else(|| ModelError::Load("model has no outputs".to_string()))?;
      (input, output)
    };
    debug!("模型输入: {}, 输出: {}", input_name, output_name);

    Ok(OnnxYolo {
      sessions,
      next: AtomicUsize::new(0),
      input_name,
      output_name,
      confidence: self.confidence,
      iou: self.iou,
    })
  }

  fn session(&self) -> Result<Session, ModelError> {
    #[allow(unused_mut)]
    let mut builder = Session::builder().map_err(load_error)?;
    match self.device {
      Device::Cpu => {}
      #[cfg(feature = "cuda")]
      Device::Cuda(id) => {
        use ort::execution_providers::CUDAExecutionProvider;
        builder = builder
          .with_execution_providers([CUDAExecutionProvider::default()
            .with_device_id(id as i32)
            .build()
            .error_on_failure()])
          .map_err(load_error)?;
      }
      #[cfg(not(feature = "cuda"))]
      Device::Cuda(_) => {
        return Err(ModelError::Load(format!(
          "device '{}' requires the 'cuda' feature",
          self.device
        )));
      }
    }

    builder
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(load_error)?
      .with_intra_threads(self.intra_threads)
      .map_err(load_error)?
      .commit_from_file(&self.model_path)
      .map_err(load_error)
  }
}

/// Ultralytics YOLO (v8/11) ONNX 导出模型
pub struct OnnxYolo {
  sessions: Vec<Mutex<Session>>,
  next: AtomicUsize,
  input_name: String,
  output_name: String,
  confidence: f32,
  iou: f32,
}

fn load_error(e: impl fmt::Display) -> ModelError {
  ModelError::Load(e.to_string())
}

fn inference_error(e: impl fmt::Display) -> ModelError {
  ModelError::Inference(e.to_string())
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
  session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OnnxYolo {
  /// 优先取空闲会话，全部繁忙时轮转等待
  fn checkout(&self) -> MutexGuard<'_, Session> {
    let start = self.next.fetch_add(1, Ordering::Relaxed);
    let count = self.sessions.len();
    for offset in 0..count {
      if let Ok(guard) = self.sessions[(start + offset) % count].try_lock() {
        return guard;
      }
    }
    lock(&self.sessions[start % count])
  }
}

impl Model for OnnxYolo {
  type Label = CocoLabel;

  fn infer(&self, input: &DecodedImage) -> Result<DetectResult<CocoLabel>, ModelError> {
    let (tensor, letterbox) = preprocess(input.as_rgb(), YOLO_INPUT_SIZE);
    let contiguous = tensor.as_standard_layout();

    let (shape, data) = {
      let mut session = self.checkout();
      let input_tensor = TensorRef::from_array_view(&contiguous).map_err(inference_error)?;
      let outputs = session
        .run(ort::inputs![&self.input_name => input_tensor])
        .map_err(inference_error)?;
      let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
        ModelError::Inference(format!("output '{}' not found", self.output_name))
      })?;
      let (shape, data) = output.try_extract_tensor::<f32>().map_err(inference_error)?;
      let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
      (shape, data.to_vec())
    };

    let items = postprocess(&data, &shape, self.confidence, self.iou, &letterbox)?;
    debug!("检测到 {} 个目标", items.len());
    Ok(items.into())
  }
}

/// 缩放与填充参数，用于把检测框映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
  width: f32,
  height: f32,
}

impl Letterbox {
  fn new(width: u32, height: u32, target: u32) -> Self {
    let scale = (target as f32 / width.max(1) as f32).min(target as f32 / height.max(1) as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, target);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, target);
    Self {
      scale,
      pad_x: ((target - new_w) / 2) as f32,
      pad_y: ((target - new_h) / 2) as f32,
      width: width as f32,
      height: height as f32,
    }
  }

  fn resized(&self) -> (u32, u32) {
    (
      ((self.width * self.scale).round() as u32).max(1),
      ((self.height * self.scale).round() as u32).max(1),
    )
  }

  /// 网络坐标 -> 原图坐标，并裁剪到图像范围
  fn restore(&self, [x1, y1, x2, y2]: [f32; 4]) -> [f32; 4] {
    let x = |v: f32| ((v - self.pad_x) / self.scale).clamp(0.0, self.width);
    let y = |v: f32| ((v - self.pad_y) / self.scale).clamp(0.0, self.height);
    let (x1, x2) = (x(x1), x(x2));
    let (y1, y2) = (y(y1), y(y2));
    [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)]
  }
}

fn preprocess(image: &RgbImage, target: u32) -> (Array4<f32>, Letterbox) {
  let letterbox = Letterbox::new(image.width(), image.height(), target);
  let (new_w, new_h) = letterbox.resized();
  let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

  let mut canvas = RgbImage::from_pixel(target, target, Rgb([YOLO_PAD_VALUE; 3]));
  imageops::replace(
    &mut canvas,
    &resized,
    letterbox.pad_x as i64,
    letterbox.pad_y as i64,
  );

  let size = target as usize;
  let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
    canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
  });
  (tensor, letterbox)
}

/// 解析 `[1, 4 + 类别数, 锚点数]` 输出（也接受转置布局）
pub(crate) fn postprocess(
  data: &[f32],
  shape: &[usize],
  confidence: f32,
  iou: f32,
  letterbox: &Letterbox,
) -> Result<Vec<DetectItem<CocoLabel>>, ModelError> {
  let (rows, cols) = match shape {
    [1, rows, cols] | [rows, cols] => (*rows, *cols),
    other => {
      return Err(ModelError::Inference(format!(
        "unexpected output shape {:?}",
        other
      )));
    }
  };
  if data.len() != rows * cols {
    return Err(ModelError::Inference(format!(
      "output has {} values, shape {:?} needs {}",
      data.len(),
      shape,
      rows * cols
    )));
  }

  // 特征维总是小于锚点数
  let transposed = rows > cols;
  let (features, anchors) = if transposed { (cols, rows) } else { (rows, cols) };
  if features <= YOLO_BOX_DIMS {
    return Err(ModelError::Inference(format!(
      "output shape {:?} has no class scores",
      shape
    )));
  }
  let at = |feature: usize, anchor: usize| {
    if transposed {
      data[anchor * features + feature]
    } else {
      data[feature * anchors + anchor]
    }
  };

  let mut candidates = Vec::new();
  for anchor in 0..anchors {
    let (class_id, score) = (YOLO_BOX_DIMS..features)
      .map(|feature| (feature - YOLO_BOX_DIMS, at(feature, anchor)))
      .fold((0, f32::MIN), |best, current| {
        if current.1 > best.1 { current } else { best }
      });
    if score < confidence {
      continue;
    }

    let (cx, cy, w, h) = (
      at(0, anchor),
      at(1, anchor),
      at(2, anchor),
      at(3, anchor),
    );
    let bbox = letterbox.restore([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
    candidates.push(DetectItem {
      kind: CocoLabel::from_label_id(class_id as u32),
      score,
      bbox,
    });
  }

  Ok(nms(candidates, iou))
}

/// 按类别的非极大值抑制，结果按置信度降序
pub(crate) fn nms(mut items: Vec<DetectItem<CocoLabel>>, threshold: f32) -> Vec<DetectItem<CocoLabel>> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem<CocoLabel>> = Vec::new();
  for item in items {
    let suppressed = kept
      .iter()
      .any(|best| best.kind == item.kind && iou(&best.bbox, &item.bbox) >= threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}
