// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - NHWC 模型输入帧定义
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

pub const RGB_CHANNELS: usize = 3;

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

/// 模型输入缓冲区（RGB 交错排列，HWC）
///
/// 工作线程在启动时按模型分辨率分配一次，之后每个请求复用。
#[derive(Debug, Clone)]
pub struct RgbNhwcFrame {
  width: usize,
  height: usize,
  data: Box<[u8]>,
}

impl RgbNhwcFrame {
  pub fn with_shape(height: usize, width: usize) -> Self {
    let size = RGB_CHANNELS * width * height;
    Self {
      width,
      height,
      data: vec![0u8; size].into_boxed_slice(),
    }
  }

  /// 给定分辨率下一帧应有的字节数
  pub fn byte_len(width: usize, height: usize) -> usize {
    RGB_CHANNELS * width * height
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 用背景色填满整帧
  pub fn fill(&mut self, value: u8) {
    self.data.fill(value);
  }

  /// 整帧拷贝，长度必须与帧大小一致
  pub fn copy_from(&mut self, bytes: &[u8]) -> Result<(), FrameSizeMismatch> {
    if bytes.len() != self.data.len() {
      return Err(FrameSizeMismatch {
        expected: self.data.len(),
        actual: bytes.len(),
      });
    }
    self.data.copy_from_slice(bytes);
    Ok(())
  }

  pub fn put_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
    let index = (y * self.width + x) * RGB_CHANNELS;
    self.data[index..index + RGB_CHANNELS].copy_from_slice(&rgb);
  }

  pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
    let index = (y * self.width + x) * RGB_CHANNELS;
    [self.data[index], self.data[index + 1], self.data[index + 2]]
  }
}

impl AsMut<[u8]> for RgbNhwcFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl AsNhwcFrame for RgbNhwcFrame {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameSizeMismatch {
  pub expected: usize,
  pub actual: usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn copy_requires_exact_length() {
    let mut frame = RgbNhwcFrame::with_shape(2, 3);
    assert_eq!(frame.as_nhwc().len(), 18);

    let err = frame.copy_from(&[1u8; 17]).unwrap_err();
    assert_eq!(err.expected, 18);
    assert_eq!(err.actual, 17);

    frame.copy_from(&[7u8; 18]).unwrap();
    assert!(frame.as_nhwc().iter().all(|&v| v == 7));
  }

  #[test]
  fn pixels_are_interleaved_row_major() {
    let mut frame = RgbNhwcFrame::with_shape(2, 2);
    frame.put_pixel(1, 1, [10, 20, 30]);
    assert_eq!(&frame.as_nhwc()[9..12], &[10, 20, 30]);
    assert_eq!(frame.pixel(1, 1), [10, 20, 30]);
    assert_eq!(frame.pixel(0, 0), [0, 0, 0]);
  }
}
