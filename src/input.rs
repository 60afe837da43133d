// 该文件是 Dapur Vision 项目的一部分。
// src/input.rs - 上传图像解码
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

use std::io::Cursor;

use image::{DynamicImage, ImageReader, RgbImage};
use thiserror::Error;
use tracing::debug;

pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("File type '{declared}' not supported. Allowed: [{allowed}]")]
  UnsupportedMediaType { declared: String, allowed: String },
  #[error("Empty image payload")]
  Empty,
  #[error("Image decoding error: {0}")]
  Decode(#[from] image::ImageError),
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl InputError {
  fn unsupported(declared: Option<&str>) -> Self {
    InputError::UnsupportedMediaType {
      declared: declared.unwrap_or("None").to_string(),
      allowed: ALLOWED_CONTENT_TYPES.join(", "),
    }
  }
}

/// 客户端声明的内容类型，只检查声明值，不嗅探数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
  Jpeg,
  Png,
  Webp,
}

impl ContentType {
  pub fn from_declared(declared: Option<&str>) -> Result<Self, InputError> {
    let essence = declared
      .and_then(|value| value.split(';').next())
      .map(|value| value.trim().to_ascii_lowercase());

    match essence.as_deref() {
      Some("image/jpeg") => Ok(ContentType::Jpeg),
      Some("image/png") => Ok(ContentType::Png),
      Some("image/webp") => Ok(ContentType::Webp),
      _ => Err(InputError::unsupported(declared)),
    }
  }

  pub fn mime(&self) -> &'static str {
    match self {
      ContentType::Jpeg => "image/jpeg",
      ContentType::Png => "image/png",
      ContentType::Webp => "image/webp",
    }
  }

  /// 根据文件扩展名推断（离线工具使用）
  pub fn from_extension(extension: &str) -> Option<Self> {
    match extension.to_ascii_lowercase().as_str() {
      "jpg" | "jpeg" => Some(ContentType::Jpeg),
      "png" => Some(ContentType::Png),
      "webp" => Some(ContentType::Webp),
      _ => None,
    }
  }
}

/// 解码后的 RGB 图像，尺寸与源图一致
#[derive(Debug, Clone)]
pub struct DecodedImage {
  image: RgbImage,
}

impl From<RgbImage> for DecodedImage {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl DecodedImage {
  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }

  pub fn as_rgb(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_rgb(self) -> RgbImage {
    self.image
  }
}

/// 校验声明类型并将字节解码为 RGB 图像
pub fn decode(bytes: &[u8], declared: Option<&str>) -> Result<DecodedImage, InputError> {
  let content_type = ContentType::from_declared(declared)?;
  if bytes.is_empty() {
    return Err(InputError::Empty);
  }

  let image = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()?
    .decode()?;

  let image = match image {
    DynamicImage::ImageRgb8(rgb) => rgb,
    other => {
      debug!(
        "图像颜色模式为 {:?}，转换为 RGB (声明类型: {})",
        other.color(),
        content_type.mime()
      );
      other.into_rgb8()
    }
  };

  Ok(DecodedImage { image })
}
