// 该文件是 Shanan （山南西风） 项目的一部分。
// src/codec.rs - 压缩图像解码
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("无法识别的图像格式")]
  UnknownFormat,
  #[error("图像尺寸为零")]
  EmptyImage,
}

/// 压缩图像解码器
///
/// `dimensions` 只读取文件头，用于入队前的快速校验；
/// 完整解码在工作线程上进行。
pub trait ImageCodec: Send + Sync {
  fn decode(&self, bytes: &[u8]) -> Result<RgbImage, CodecError>;
  fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), CodecError>;
}

/// 基于 `image` crate 的解码器，格式由内容猜测
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateCodec;

impl ImageCrateCodec {
  fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, CodecError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    if reader.format().is_none() {
      return Err(CodecError::UnknownFormat);
    }
    Ok(reader)
  }
}

impl ImageCodec for ImageCrateCodec {
  fn decode(&self, bytes: &[u8]) -> Result<RgbImage, CodecError> {
    let image = Self::reader(bytes)?.decode()?.to_rgb8();
    if image.width() == 0 || image.height() == 0 {
      return Err(CodecError::EmptyImage);
    }
    debug!("解码图像: {}x{}", image.width(), image.height());
    Ok(image)
  }

  fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), CodecError> {
    let (width, height) = Self::reader(bytes)?.into_dimensions()?;
    if width == 0 || height == 0 {
      return Err(CodecError::EmptyImage);
    }
    Ok((width, height))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb};

  fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, format).unwrap();
    bytes.into_inner()
  }

  #[test]
  fn probes_and_decodes_jpeg() {
    let image = RgbImage::from_pixel(48, 32, Rgb([120, 60, 30]));
    let bytes = encode(&image, ImageFormat::Jpeg);
    let codec = ImageCrateCodec;

    assert_eq!(codec.dimensions(&bytes).unwrap(), (48, 32));
    let decoded = codec.decode(&bytes).unwrap();
    assert_eq!(decoded.dimensions(), (48, 32));
  }

  #[test]
  fn decodes_png_exactly() {
    let mut image = RgbImage::new(3, 2);
    image.put_pixel(2, 1, Rgb([9, 8, 7]));
    let bytes = encode(&image, ImageFormat::Png);
    let decoded = ImageCrateCodec.decode(&bytes).unwrap();
    assert_eq!(decoded.get_pixel(2, 1).0, [9, 8, 7]);
  }

  #[test]
  fn garbage_is_rejected() {
    let codec = ImageCrateCodec;
    assert!(codec.dimensions(b"definitely not an image").is_err());
    assert!(codec.decode(&[0xff, 0xd8, 0xff, 0x00]).is_err());
  }
}
