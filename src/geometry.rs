// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 输入图像与模型输入网格之间的几何映射
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

use std::fmt;
use std::str::FromStr;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::frame::RgbNhwcFrame;

/// 填充区域的背景色（黑色）
pub const LETTERBOX_FILL: u8 = 0;

/// 缩放模式，在配置时选定一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ScaleMode {
  /// 直接拉伸到模型分辨率（可能变形）
  Stretch,
  /// 居中裁剪出与模型宽高比一致的区域（丢失边缘）
  Crop,
  /// 保持宽高比缩放，黑边填充
  #[default]
  Letterbox,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知的缩放模式: {0}")]
pub struct UnknownScaleMode(pub String);

impl FromStr for ScaleMode {
  type Err = UnknownScaleMode;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "stretch" | "balanced" | "0" => Ok(ScaleMode::Stretch),
      "crop" | "center-crop" | "1" => Ok(ScaleMode::Crop),
      "letterbox" | "pad" | "2" => Ok(ScaleMode::Letterbox),
      _ => Err(UnknownScaleMode(s.to_string())),
    }
  }
}

impl TryFrom<String> for ScaleMode {
  type Error = UnknownScaleMode;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl ScaleMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ScaleMode::Stretch => "stretch",
      ScaleMode::Crop => "crop",
      ScaleMode::Letterbox => "letterbox",
    }
  }
}

impl fmt::Display for ScaleMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 像素矩形（左上角 + 尺寸）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
  pub x: u32,
  pub y: u32,
  pub w: u32,
  pub h: u32,
}

/// 归一化的左上角格式边界框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormBox {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

impl NormBox {
  pub fn center(&self) -> (f32, f32) {
    (self.x + self.w / 2.0, self.y + self.h / 2.0)
  }
}

/// 单次预处理的几何参数
///
/// 源图中的 `region` 被映射到模型网格中的 `content`：
/// - stretch: 整幅源图 -> 整个网格
/// - crop: 居中裁剪区域 -> 整个网格
/// - letterbox: 整幅源图 -> 网格中居中的缩放区域，其余为填充
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryParams {
  mode: ScaleMode,
  source: (u32, u32),
  model: (u32, u32),
  region: PixelRect,
  content: PixelRect,
}

impl GeometryParams {
  pub fn compute(
    mode: ScaleMode,
    source_width: u32,
    source_height: u32,
    model_width: u32,
    model_height: u32,
  ) -> Self {
    let (sw, sh) = (source_width.max(1), source_height.max(1));
    let (mw, mh) = (model_width.max(1), model_height.max(1));

    let full_source = PixelRect { x: 0, y: 0, w: sw, h: sh };
    let full_model = PixelRect { x: 0, y: 0, w: mw, h: mh };

    let (region, content) = match mode {
      ScaleMode::Stretch => (full_source, full_model),
      ScaleMode::Crop => {
        let ratio = mw as f32 / mh as f32;
        let mut crop_w = sw as f32;
        let mut crop_h = crop_w / ratio;
        if crop_h > sh as f32 {
          crop_h = sh as f32;
          crop_w = crop_h * ratio;
        }
        let crop_w = (crop_w as u32).clamp(1, sw);
        let crop_h = (crop_h as u32).clamp(1, sh);
        let region = PixelRect {
          x: (sw - crop_w) / 2,
          y: (sh - crop_h) / 2,
          w: crop_w,
          h: crop_h,
        };
        (region, full_model)
      }
      ScaleMode::Letterbox => {
        let scale = (mw as f32 / sw as f32).min(mh as f32 / sh as f32);
        let scaled_w = ((sw as f32 * scale).round() as u32).clamp(1, mw);
        let scaled_h = ((sh as f32 * scale).round() as u32).clamp(1, mh);
        let content = PixelRect {
          x: (mw - scaled_w) / 2,
          y: (mh - scaled_h) / 2,
          w: scaled_w,
          h: scaled_h,
        };
        (full_source, content)
      }
    };

    debug!(
      "几何参数: {} {}x{} -> {}x{}, 源区域 {:?}, 内容区域 {:?}",
      mode, sw, sh, mw, mh, region, content
    );

    Self {
      mode,
      source: (sw, sh),
      model: (mw, mh),
      region,
      content,
    }
  }

  /// 原始张量输入：源图即模型网格，无任何变换
  pub fn identity(model_width: u32, model_height: u32) -> Self {
    Self::compute(
      ScaleMode::Stretch,
      model_width,
      model_height,
      model_width,
      model_height,
    )
  }

  pub fn mode(&self) -> ScaleMode {
    self.mode
  }

  pub fn source_size(&self) -> (u32, u32) {
    self.source
  }

  pub fn model_size(&self) -> (u32, u32) {
    self.model
  }

  /// 源图中被采样的区域（crop 模式下即裁剪框）
  pub fn source_region(&self) -> PixelRect {
    self.region
  }

  /// 模型网格中承载图像内容的区域（letterbox 模式下不含填充）
  pub fn content_rect(&self) -> PixelRect {
    self.content
  }

  /// 模型像素 / 源像素
  pub fn scale(&self) -> (f32, f32) {
    (
      self.content.w as f32 / self.region.w as f32,
      self.content.h as f32 / self.region.h as f32,
    )
  }

  fn is_letterbox(&self) -> bool {
    self.mode == ScaleMode::Letterbox
  }

  /// 最近邻重采样，把源图按本参数写入模型输入缓冲区
  pub fn resample(&self, image: &RgbImage, frame: &mut RgbNhwcFrame) {
    let PixelRect { x: rx, y: ry, w: rw, h: rh } = self.region;
    let PixelRect { x: cx, y: cy, w: cw, h: ch } = self.content;

    if self.is_letterbox() {
      frame.fill(LETTERBOX_FILL);
    }

    let max_x = image.width().saturating_sub(1);
    let max_y = image.height().saturating_sub(1);

    for dy in 0..ch {
      let src_y = (ry + (dy as u64 * rh as u64 / ch as u64) as u32).min(max_y);
      for dx in 0..cw {
        let src_x = (rx + (dx as u64 * rw as u64 / cw as u64) as u32).min(max_x);
        let pixel = image.get_pixel(src_x, src_y);
        frame.put_pixel((cx + dx) as usize, (cy + dy) as usize, pixel.0);
      }
    }
  }

  /// 正向映射：源图归一化框 -> 模型网格归一化框
  pub fn to_model(&self, b: NormBox) -> NormBox {
    let (sw, sh) = (self.source.0 as f32, self.source.1 as f32);
    let (mw, mh) = (self.model.0 as f32, self.model.1 as f32);
    let (scale_x, scale_y) = self.scale();

    let x = (self.content.x as f32 + (b.x * sw - self.region.x as f32) * scale_x) / mw;
    let y = (self.content.y as f32 + (b.y * sh - self.region.y as f32) * scale_y) / mh;

    NormBox {
      x,
      y,
      w: b.w * sw * scale_x / mw,
      h: b.h * sh * scale_y / mh,
    }
  }

  /// 逆映射：模型网格归一化框 -> 源图归一化框
  ///
  /// letterbox 模式下中心落在填充带内的框无效，返回 `None`；
  /// 伸出内容区域的部分会被裁掉，裁剪后宽或高不为正时同样无效。
  pub fn to_source(&self, b: NormBox) -> Option<NormBox> {
    let (sw, sh) = (self.source.0 as f32, self.source.1 as f32);
    let (mw, mh) = (self.model.0 as f32, self.model.1 as f32);
    let (scale_x, scale_y) = self.scale();

    if self.is_letterbox() {
      let pad_x = self.content.x as f32 / mw;
      let pad_y = self.content.y as f32 / mh;
      let frac_x = self.content.w as f32 / mw;
      let frac_y = self.content.h as f32 / mh;

      let (center_x, center_y) = b.center();
      if center_x < pad_x
        || center_x > pad_x + frac_x
        || center_y < pad_y
        || center_y > pad_y + frac_y
      {
        return None;
      }
    }

    let mut x = (self.region.x as f32 + (b.x * mw - self.content.x as f32) / scale_x) / sw;
    let mut y = (self.region.y as f32 + (b.y * mh - self.content.y as f32) / scale_y) / sh;
    let mut w = b.w * mw / scale_x / sw;
    let mut h = b.h * mh / scale_y / sh;

    if self.is_letterbox() {
      if x < 0.0 {
        w += x;
        x = 0.0;
      }
      if y < 0.0 {
        h += y;
        y = 0.0;
      }
      if x + w > 1.0 {
        w = 1.0 - x;
      }
      if y + h > 1.0 {
        h = 1.0 - y;
      }
      if w <= 0.0 || h <= 0.0 {
        return None;
      }
    }

    Some(NormBox { x, y, w, h })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use image::Rgb;

  const EPS: f32 = 1e-4;

  fn assert_box_eq(a: NormBox, b: NormBox) {
    assert_abs_diff_eq!(a.x, b.x, epsilon = EPS);
    assert_abs_diff_eq!(a.y, b.y, epsilon = EPS);
    assert_abs_diff_eq!(a.w, b.w, epsilon = EPS);
    assert_abs_diff_eq!(a.h, b.h, epsilon = EPS);
  }

  #[test]
  fn scale_mode_aliases() {
    assert_eq!("stretch".parse::<ScaleMode>().unwrap(), ScaleMode::Stretch);
    assert_eq!("Balanced".parse::<ScaleMode>().unwrap(), ScaleMode::Stretch);
    assert_eq!("center-crop".parse::<ScaleMode>().unwrap(), ScaleMode::Crop);
    assert_eq!("1".parse::<ScaleMode>().unwrap(), ScaleMode::Crop);
    assert_eq!("PAD".parse::<ScaleMode>().unwrap(), ScaleMode::Letterbox);
    assert!("fisheye".parse::<ScaleMode>().is_err());
  }

  #[test]
  fn letterbox_wide_input_pads_top_and_bottom() {
    let g = GeometryParams::compute(ScaleMode::Letterbox, 1920, 1080, 640, 640);
    let (scale_x, scale_y) = g.scale();
    assert_abs_diff_eq!(scale_x, 1.0 / 3.0, epsilon = 1e-3);
    assert_abs_diff_eq!(scale_y, 1.0 / 3.0, epsilon = 1e-3);
    assert_eq!(
      g.content_rect(),
      PixelRect { x: 0, y: 140, w: 640, h: 360 }
    );
  }

  #[test]
  fn letterbox_round_trip_recovers_visible_box() {
    let g = GeometryParams::compute(ScaleMode::Letterbox, 1920, 1080, 640, 640);
    let original = NormBox {
      x: 800.0 / 1920.0,
      y: 400.0 / 1080.0,
      w: 320.0 / 1920.0,
      h: 280.0 / 1080.0,
    };
    let model = g.to_model(original);
    // 内容区域在 y 方向从 140/640 开始
    assert!(model.y > 140.0 / 640.0);
    let back = g.to_source(model).unwrap();
    assert_box_eq(back, original);
  }

  #[test]
  fn letterbox_box_in_padding_band_is_invalid() {
    let g = GeometryParams::compute(ScaleMode::Letterbox, 1920, 1080, 640, 640);
    let in_top_band = NormBox {
      x: 0.4,
      y: 10.0 / 640.0,
      w: 0.1,
      h: 60.0 / 640.0,
    };
    assert!(g.to_source(in_top_band).is_none());

    let in_bottom_band = NormBox {
      x: 0.4,
      y: 600.0 / 640.0,
      w: 0.1,
      h: 30.0 / 640.0,
    };
    assert!(g.to_source(in_bottom_band).is_none());
  }

  #[test]
  fn letterbox_box_overhanging_padding_is_clipped() {
    let g = GeometryParams::compute(ScaleMode::Letterbox, 1920, 1080, 640, 640);
    // 中心在内容区内，但上缘伸入填充带
    let b = NormBox {
      x: 0.25,
      y: 100.0 / 640.0,
      w: 0.5,
      h: 100.0 / 640.0,
    };
    let back = g.to_source(b).unwrap();
    assert_abs_diff_eq!(back.y, 0.0, epsilon = EPS);
    assert_abs_diff_eq!(back.h, 60.0 / 360.0, epsilon = EPS);
    assert_abs_diff_eq!(back.x, 0.25, epsilon = EPS);
    assert_abs_diff_eq!(back.w, 0.5, epsilon = EPS);
  }

  #[test]
  fn crop_maps_back_into_centered_region() {
    let g = GeometryParams::compute(ScaleMode::Crop, 1920, 1080, 640, 640);
    assert_eq!(
      g.source_region(),
      PixelRect { x: 420, y: 0, w: 1080, h: 1080 }
    );

    let b = NormBox { x: 0.45, y: 0.45, w: 0.1, h: 0.1 };
    let back = g.to_source(b).unwrap();
    assert_abs_diff_eq!(back.x, (420.0 + 0.45 * 1080.0) / 1920.0, epsilon = EPS);
    assert_abs_diff_eq!(back.y, 0.45, epsilon = EPS);
    assert_abs_diff_eq!(back.w, 108.0 / 1920.0, epsilon = EPS);
    assert_abs_diff_eq!(back.h, 0.1, epsilon = EPS);
  }

  #[test]
  fn crop_tall_input_crops_vertically() {
    let g = GeometryParams::compute(ScaleMode::Crop, 480, 960, 320, 320);
    assert_eq!(
      g.source_region(),
      PixelRect { x: 0, y: 240, w: 480, h: 480 }
    );
  }

  #[test]
  fn stretch_is_identity_in_normalized_space() {
    let g = GeometryParams::compute(ScaleMode::Stretch, 1920, 1080, 640, 640);
    let b = NormBox { x: 0.1, y: 0.2, w: 0.3, h: 0.4 };
    assert_box_eq(g.to_source(b).unwrap(), b);
    assert_box_eq(g.to_model(b), b);
  }

  #[test]
  fn letterbox_resample_fills_padding_black() {
    let image = RgbImage::from_pixel(4, 2, Rgb([200, 100, 50]));
    let g = GeometryParams::compute(ScaleMode::Letterbox, 4, 2, 4, 4);
    assert_eq!(g.content_rect(), PixelRect { x: 0, y: 1, w: 4, h: 2 });

    let mut frame = RgbNhwcFrame::with_shape(4, 4);
    frame.fill(77);
    g.resample(&image, &mut frame);

    for x in 0..4 {
      assert_eq!(frame.pixel(x, 0), [0, 0, 0]);
      assert_eq!(frame.pixel(x, 1), [200, 100, 50]);
      assert_eq!(frame.pixel(x, 2), [200, 100, 50]);
      assert_eq!(frame.pixel(x, 3), [0, 0, 0]);
    }
  }

  #[test]
  fn stretch_resample_uses_nearest_neighbour() {
    let mut image = RgbImage::new(2, 2);
    image.put_pixel(0, 0, Rgb([1, 1, 1]));
    image.put_pixel(1, 0, Rgb([2, 2, 2]));
    image.put_pixel(0, 1, Rgb([3, 3, 3]));
    image.put_pixel(1, 1, Rgb([4, 4, 4]));

    let g = GeometryParams::compute(ScaleMode::Stretch, 2, 2, 4, 4);
    let mut frame = RgbNhwcFrame::with_shape(4, 4);
    g.resample(&image, &mut frame);

    assert_eq!(frame.pixel(0, 0), [1, 1, 1]);
    assert_eq!(frame.pixel(1, 1), [1, 1, 1]);
    assert_eq!(frame.pixel(2, 0), [2, 2, 2]);
    assert_eq!(frame.pixel(0, 3), [3, 3, 3]);
    assert_eq!(frame.pixel(3, 3), [4, 4, 4]);
  }
}
