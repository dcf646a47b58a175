// 该文件是 Qianli （千里眼） 项目的一部分。
// src/convert.rs - YUV 4:2:0 到 RGBA 的颜色空间转换
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

use image::RgbaImage;
use thiserror::Error;
use tracing::debug;

use crate::frame::{Plane, SensorFrame};

// 2^18 - 1，右移 10 位前用于截断
const MAX_CHANNEL_VALUE: i32 = 262_143;
const OPAQUE: u8 = 0xff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
  #[error("空帧: {width}x{height}")]
  EmptyFrame { width: u32, height: u32 },
  #[error("{plane} 平面步长无效: 行步长 {row_stride}, 像素步长 {pixel_stride}")]
  InvalidStride {
    plane: &'static str,
    row_stride: usize,
    pixel_stride: usize,
  },
  #[error("{plane} 平面数据不足: 需要 {required} 字节, 实际 {actual} 字节")]
  PlaneTooSmall {
    plane: &'static str,
    required: usize,
    actual: usize,
  },
}

/// 定点 BT.601 YUV 转 RGB
///
/// 浮点等价形式为 R = 1.164Y' + 1.596V', G = 1.164Y' - 0.813V' - 0.391U',
/// B = 1.164Y' + 2.018U'，系数放大 1024 倍。
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let y = (y as i32 - 16).max(0);
  let u = u as i32 - 128;
  let v = v as i32 - 128;

  let r = (1192 * y + 1634 * v).clamp(0, MAX_CHANNEL_VALUE);
  let g = (1192 * y - 833 * v - 400 * u).clamp(0, MAX_CHANNEL_VALUE);
  let b = (1192 * y + 2066 * u).clamp(0, MAX_CHANNEL_VALUE);

  [(r >> 10) as u8, (g >> 10) as u8, (b >> 10) as u8]
}

/// 打包为 0xAARRGGBB，alpha 恒为不透明
pub fn yuv_to_argb(y: u8, u: u8, v: u8) -> u32 {
  let [r, g, b] = yuv_to_rgb(y, u, v);
  u32::from_be_bytes([OPAQUE, r, g, b])
}

/// 整数 BT.601 RGB 转 YUV，供合成帧和图像文件输入使用
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
  let (r, g, b) = (r as i32, g as i32, b as i32);
  let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
  let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
  let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
  [
    y.clamp(0, 255) as u8,
    u.clamp(0, 255) as u8,
    v.clamp(0, 255) as u8,
  ]
}

/// YUV420 紧凑存储所需的字节数
///
/// 亮度每像素 1 字节；色度按 2x2 块编码，每块 U、V 各 1 字节，奇数尺寸向上取整。
pub fn yuv420_byte_size(width: usize, height: usize) -> usize {
  let y_size = width * height;
  let uv_size = width.div_ceil(2) * height.div_ceil(2) * 2;
  y_size + uv_size
}

fn check_plane(
  name: &'static str,
  data_len: usize,
  row_stride: usize,
  pixel_stride: usize,
  (columns, rows): (usize, usize),
) -> Result<(), ConvertError> {
  let row_span = (columns - 1) * pixel_stride + 1;
  if pixel_stride == 0 || (rows > 1 && row_stride < row_span) {
    return Err(ConvertError::InvalidStride {
      plane: name,
      row_stride,
      pixel_stride,
    });
  }

  let required = row_stride * (rows - 1) + row_span;
  if data_len < required {
    return Err(ConvertError::PlaneTooSmall {
      plane: name,
      required,
      actual: data_len,
    });
  }
  Ok(())
}

/// YUV 4:2:0 平面帧到 RGBA 图像的转换器
///
/// 输出缓冲区只在帧尺寸变化时重新分配。
#[derive(Debug, Clone)]
pub struct YuvConverter {
  output: RgbaImage,
}

impl YuvConverter {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      output: RgbaImage::new(width, height),
    }
  }

  pub fn output(&self) -> &RgbaImage {
    &self.output
  }

  /// 校验平面布局是否能覆盖整帧
  pub fn validate(frame: &SensorFrame) -> Result<(), ConvertError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
      return Err(ConvertError::EmptyFrame { width, height });
    }

    let luma = (width as usize, height as usize);
    let chroma = (luma.0.div_ceil(2), luma.1.div_ceil(2));

    let y_plane = frame.y_plane();
    check_plane("Y", y_plane.data.len(), y_plane.row_stride, 1, luma)?;

    // U、V 平面共用 U 平面的步长
    let Plane {
      row_stride,
      pixel_stride,
      ..
    } = *frame.u_plane();
    check_plane("U", frame.u_plane().data.len(), row_stride, pixel_stride, chroma)?;
    check_plane("V", frame.v_plane().data.len(), row_stride, pixel_stride, chroma)?;
    Ok(())
  }

  /// 转换一帧，返回内部输出缓冲区
  pub fn convert(&mut self, frame: &SensorFrame) -> Result<&RgbaImage, ConvertError> {
    Self::validate(frame)?;

    let (width, height) = frame.dimensions();
    if self.output.dimensions() != (width, height) {
      debug!(
        "转换输出尺寸变化: {:?} -> {}x{}",
        self.output.dimensions(),
        width,
        height
      );
      self.output = RgbaImage::new(width, height);
    }

    let y_plane = frame.y_plane();
    let u_data = &frame.u_plane().data;
    let v_data = &frame.v_plane().data;
    let uv_row_stride = frame.u_plane().row_stride;
    let uv_pixel_stride = frame.u_plane().pixel_stride;

    let width = width as usize;
    let out: &mut [u8] = &mut self.output;
    for (y, row) in out.chunks_exact_mut(width * 4).enumerate() {
      let luma = &y_plane.data[y_plane.row_stride * y..];
      let uv_row_start = uv_row_stride * (y >> 1);

      for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
        let uv_offset = uv_row_start + (x >> 1) * uv_pixel_stride;
        let [r, g, b] = yuv_to_rgb(luma[x], u_data[uv_offset], v_data[uv_offset]);
        pixel.copy_from_slice(&[r, g, b, OPAQUE]);
      }
    }

    Ok(&self.output)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn planar_frame(width: u32, height: u32, y: Vec<u8>, u: Vec<u8>, v: Vec<u8>) -> SensorFrame {
    let chroma_stride = (width as usize).div_ceil(2);
    SensorFrame::new(
      [
        Plane::new(y, width as usize, 1),
        Plane::new(u, chroma_stride, 1),
        Plane::new(v, chroma_stride, 1),
      ],
      width,
      height,
    )
  }

  #[test]
  fn golden_pixels() {
    assert_eq!(yuv_to_argb(16, 128, 128), 0xff00_0000);
    assert_eq!(yuv_to_argb(0, 128, 128), 0xff00_0000);
    assert_eq!(yuv_to_argb(235, 128, 128), 0xfffe_fefe);
    assert_eq!(yuv_to_argb(255, 128, 128), 0xffff_ffff);
    assert_eq!(yuv_to_rgb(81, 90, 240), [254, 0, 0]);
    assert_eq!(yuv_to_rgb(145, 54, 34), [0, 255, 0]);
    assert_eq!(yuv_to_rgb(41, 240, 110), [0, 0, 255]);
  }

  #[test]
  fn two_by_two_block_shares_chroma() {
    let frame = planar_frame(2, 2, vec![16, 235, 128, 100], vec![128], vec![128]);
    let mut converter = YuvConverter::new(2, 2);
    let image = converter.convert(&frame).unwrap();

    let grays: Vec<u8> = image.pixels().map(|p| p[0]).collect();
    assert_eq!(grays, vec![0, 254, 130, 97]);
    for pixel in image.pixels() {
      assert_eq!(pixel[0], pixel[1]);
      assert_eq!(pixel[1], pixel[2]);
      assert_eq!(pixel[3], 0xff);
    }
  }

  #[test]
  fn chroma_follows_subsampling_with_padded_strides() {
    // 4x2 帧，两个色度块；行末带填充字节
    let y = vec![81, 81, 145, 145, 0xAA, 0xAA, 81, 81, 145, 145, 0xAA, 0xAA];
    let u = vec![90, 54, 0xAA, 0xAA];
    let v = vec![240, 34, 0xAA, 0xAA];
    let frame = SensorFrame::new(
      [Plane::new(y, 6, 1), Plane::new(u, 4, 1), Plane::new(v, 4, 1)],
      4,
      2,
    );

    let mut converter = YuvConverter::new(4, 2);
    let image = converter.convert(&frame).unwrap();
    for row in 0..2 {
      assert_eq!(image.get_pixel(0, row).0, [254, 0, 0, 255]);
      assert_eq!(image.get_pixel(1, row).0, [254, 0, 0, 255]);
      assert_eq!(image.get_pixel(2, row).0, [0, 255, 0, 255]);
      assert_eq!(image.get_pixel(3, row).0, [0, 255, 0, 255]);
    }
  }

  #[test]
  fn interleaved_chroma_uses_pixel_stride() {
    // 半平面布局：U 平面为 [u0 v0 u1 v1]，V 平面从 v0 开始
    let y = vec![41, 41, 41, 41];
    let uv = vec![240u8, 110, 90, 240];
    let frame = SensorFrame::new(
      [
        Plane::new(y, 4, 1),
        Plane::new(uv.clone(), 4, 2),
        Plane::new(uv[1..].to_vec(), 4, 2),
      ],
      4,
      1,
    );

    let mut converter = YuvConverter::new(4, 1);
    let image = converter.convert(&frame).unwrap();
    assert_eq!(&image.get_pixel(0, 0).0[..3], &yuv_to_rgb(41, 240, 110));
    assert_eq!(&image.get_pixel(3, 0).0[..3], &yuv_to_rgb(41, 90, 240));
  }

  #[test]
  fn channels_stay_in_range_and_alpha_is_opaque() {
    for y in (0..=255u16).step_by(5) {
      for u in (0..=255u16).step_by(5) {
        for v in (0..=255u16).step_by(5) {
          let argb = yuv_to_argb(y as u8, u as u8, v as u8);
          assert_eq!(argb >> 24, 0xff);
        }
      }
    }
  }

  #[test]
  fn output_buffer_is_reused_between_frames() {
    let mut converter = YuvConverter::new(2, 2);
    let first = converter
      .convert(&planar_frame(2, 2, vec![16; 4], vec![128], vec![128]))
      .unwrap()
      .as_ptr();
    let second = converter
      .convert(&planar_frame(2, 2, vec![200; 4], vec![128], vec![128]))
      .unwrap()
      .as_ptr();
    assert_eq!(first, second);
  }

  #[test]
  fn rejects_malformed_frames() {
    let empty = planar_frame(0, 2, vec![], vec![], vec![]);
    assert!(matches!(
      YuvConverter::validate(&empty),
      Err(ConvertError::EmptyFrame { .. })
    ));

    let short = planar_frame(4, 4, vec![0; 15], vec![0; 4], vec![0; 4]);
    assert!(matches!(
      YuvConverter::validate(&short),
      Err(ConvertError::PlaneTooSmall { plane: "Y", .. })
    ));

    let short_chroma = planar_frame(4, 4, vec![0; 16], vec![0; 4], vec![0; 3]);
    assert!(matches!(
      YuvConverter::validate(&short_chroma),
      Err(ConvertError::PlaneTooSmall { plane: "V", .. })
    ));
  }

  #[test]
  fn packed_size_rounds_odd_dimensions_up() {
    assert_eq!(yuv420_byte_size(4, 4), 16 + 8);
    assert_eq!(yuv420_byte_size(3, 3), 9 + 8);
  }

  #[test]
  fn round_trip_through_yuv_is_close() {
    for &(r, g, b) in &[(200u8, 30u8, 40u8), (10, 220, 90), (128, 128, 128)] {
      let [y, u, v] = rgb_to_yuv(r, g, b);
      let [r2, g2, b2] = yuv_to_rgb(y, u, v);
      assert!((r as i32 - r2 as i32).abs() <= 4, "r {} vs {}", r, r2);
      assert!((g as i32 - g2 as i32).abs() <= 4, "g {} vs {}", g, g2);
      assert!((b as i32 - b2 as i32).abs() <= 4, "b {} vs {}", b, b2);
    }
  }
}
