// 该文件是 Dapur Vision 项目的一部分。
// src/model.rs - 模型
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

use thiserror::Error;

use crate::{engine::EngineSettings, input::DecodedImage};

/// 检测模型能力
///
/// `infer` 是 (模型, 图像) 的纯函数，调用之间不积累任何状态，
/// 因此实现必须可以被多个工作线程同时调用。
pub trait Model: Send + Sync + 'static {
  type Label: WithLabel;

  fn infer(&self, input: &DecodedImage) -> Result<DetectResult<Self::Label>, ModelError>;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("Failed to load model: {0}")]
  Load(String),
  #[error("Inference failed: {0}")]
  Inference(String),
  #[error("Model not loaded")]
  NotLoaded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem<T> {
  pub kind: T,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，原图像素坐标
}

#[derive(Debug, Clone)]
pub struct DetectResult<T> {
  pub items: Box<[DetectItem<T>]>,
}

impl<T> DetectResult<T> {
  pub fn empty() -> Self {
    Self {
      items: Box::new([]),
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem<T>> {
    self.items.iter()
  }
}

impl<T> From<Vec<DetectItem<T>>> for DetectResult<T> {
  fn from(items: Vec<DetectItem<T>>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

pub trait WithLabel: Sized + std::fmt::Debug + Send + 'static {
  fn to_label_str(&self) -> String;
  fn from_label_id(id: u32) -> Self;
}

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CocoLabel(u32);

impl CocoLabel {
  pub fn id(&self) -> u32 {
    self.0
  }
}

impl WithLabel for CocoLabel {
  fn to_label_str(&self) -> String {
    match COCO_CLASSES.get(self.0 as usize) {
      Some(name) => name.to_string(),
      None => format!("class_{}", self.0),
    }
  }

  fn from_label_id(id: u32) -> Self {
    CocoLabel(id)
  }
}

#[cfg(feature = "model_onnx")]
mod yolo;
#[cfg(feature = "model_onnx")]
pub use self::yolo::{OnnxYolo, OnnxYoloBuilder};

/// 按模型 URL 方案选择的推理后端
pub enum ModelWrapper {
  #[cfg(feature = "model_onnx")]
  OnnxYolo(OnnxYolo),
}

impl ModelWrapper {
  /// 按 URL 方案构建后端；提供方凭据不参与本地 ONNX 模型加载
  pub fn load(settings: &EngineSettings) -> Result<Self, ModelError> {
    let scheme = settings.model_url().scheme();

    #[cfg(feature = "model_onnx")]
    {
      use crate::{FromUrl, FromUrlWithScheme};

      if scheme == OnnxYoloBuilder::SCHEME {
        let model = OnnxYoloBuilder::from_url(settings.model_url())?
          .device(settings.device())
          .confidence(settings.confidence_threshold())
          .sessions(settings.sessions())
          .build()?;
        return Ok(ModelWrapper::OnnxYolo(model));
      }
    }

    Err(ModelError::Load(format!(
      "no inference backend for model scheme '{}'",
      scheme
    )))
  }
}

impl Model for ModelWrapper {
  type Label = CocoLabel;

  fn infer(&self, input: &DecodedImage) -> Result<DetectResult<Self::Label>, ModelError> {
    match self {
      #[cfg(feature = "model_onnx")]
      ModelWrapper::OnnxYolo(model) => model.infer(input),
      #[allow(unreachable_patterns)]
      _ => {
        let _ = input;
        Err(ModelError::NotLoaded)
      }
    }
  }
}
