// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - 传感器帧与模型输入帧定义
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

use image::RgbaImage;

const RGB_CHANNELS: usize = 3;
const RGBA_CHANNELS: usize = 4;

/// 以 90 度为单位的旋转
///
/// 同时用来表示显示方向（编码 0..=3）和传感器方向（角度）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  /// 从四分之一圈数构造，任意整数都会被规整到 [0, 4)
  pub fn from_quarter_turns(turns: i32) -> Self {
    match turns.rem_euclid(4) {
      0 => Rotation::Deg0,
      1 => Rotation::Deg90,
      2 => Rotation::Deg180,
      _ => Rotation::Deg270,
    }
  }

  /// 从角度构造，角度必须是 90 的整数倍
  pub fn from_degrees(degrees: i32) -> Option<Self> {
    if degrees % 90 != 0 {
      return None;
    }
    Some(Self::from_quarter_turns(degrees / 90))
  }

  pub fn quarter_turns(self) -> i32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 1,
      Rotation::Deg180 => 2,
      Rotation::Deg270 => 3,
    }
  }

  pub fn degrees(self) -> i32 {
    self.quarter_turns() * 90
  }

  /// 叠加一个角度偏移（可为负数）
  pub fn offset(self, degrees: i32) -> Self {
    Self::from_quarter_turns(self.quarter_turns() + degrees.div_euclid(90))
  }
}

impl fmt::Display for Rotation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}°", self.degrees())
  }
}

impl FromStr for Rotation {
  type Err = String;

  /// 解析角度，例如 `90`、`270` 或 `-90`
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let degrees: i32 = s
      .trim()
      .trim_end_matches('°')
      .parse()
      .map_err(|_| format!("无效的角度: {}", s))?;
    Self::from_degrees(degrees).ok_or_else(|| format!("角度必须是 90 的整数倍: {}", s))
  }
}

/// 平面图像中的一个平面
#[derive(Debug, Clone, Default)]
pub struct Plane {
  pub data: Vec<u8>,
  pub row_stride: usize,
  pub pixel_stride: usize,
}

impl Plane {
  pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
    Self {
      data,
      row_stride,
      pixel_stride,
    }
  }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// 相机传感器输出的 YUV 4:2:0 平面帧
///
/// 帧必须被释放且只释放一次。`release` 显式释放，
/// 未显式释放的帧在 drop 时释放，所有权保证不会重复释放。
pub struct SensorFrame {
  planes: [Plane; 3],
  width: u32,
  height: u32,
  rotation: Rotation,
  index: u64,
  release_hook: Option<ReleaseHook>,
}

impl SensorFrame {
  /// planes 顺序为 [Y, U, V]
  pub fn new(planes: [Plane; 3], width: u32, height: u32) -> Self {
    Self {
      planes,
      width,
      height,
      rotation: Rotation::Deg0,
      index: 0,
      release_hook: None,
    }
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn with_index(mut self, index: u64) -> Self {
    self.index = index;
    self
  }

  /// 设置释放回调，帧归还给相机子系统时调用
  pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
    self.release_hook = Some(Box::new(hook));
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn planes(&self) -> &[Plane; 3] {
    &self.planes
  }

  pub fn y_plane(&self) -> &Plane {
    &self.planes[0]
  }

  pub fn u_plane(&self) -> &Plane {
    &self.planes[1]
  }

  pub fn v_plane(&self) -> &Plane {
    &self.planes[2]
  }

  /// 将帧归还给相机子系统
  pub fn release(mut self) {
    self.run_release_hook();
  }

  fn run_release_hook(&mut self) {
    if let Some(hook) = self.release_hook.take() {
      hook();
    }
  }
}

impl Drop for SensorFrame {
  fn drop(&mut self) {
    self.run_release_hook();
  }
}

impl fmt::Debug for SensorFrame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SensorFrame")
      .field("index", &self.index)
      .field("width", &self.width)
      .field("height", &self.height)
      .field("rotation", &self.rotation)
      .field("plane_sizes", &self.planes.each_ref().map(|p| p.data.len()))
      .finish()
  }
}

/// 模型输入帧
///
/// 同时持有裁剪缩放后的 RGBA 图像和归一化到 [-1, 1] 的 NHWC 张量，
/// 由流水线预先分配并逐帧原地复用。
#[derive(Debug, Clone)]
pub struct RectifiedImage {
  image: RgbaImage,
  tensor: Box<[f32]>,
}

impl RectifiedImage {
  pub fn new(size: u32) -> Self {
    let pixels = size as usize * size as usize;
    Self {
      image: RgbaImage::new(size, size),
      tensor: vec![0.0f32; pixels * RGB_CHANNELS].into_boxed_slice(),
    }
  }

  pub fn size(&self) -> u32 {
    self.image.width()
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn image(&self) -> &RgbaImage {
    &self.image
  }

  pub fn image_mut(&mut self) -> &mut RgbaImage {
    &mut self.image
  }

  pub fn tensor(&self) -> &[f32] {
    &self.tensor
  }

  /// 按 `2 * (c / 255) - 1` 将 RGB 通道写入张量，丢弃 alpha
  pub fn normalize(&mut self) {
    let pixels: &[u8] = &self.image;
    for (rgb, rgba) in self
      .tensor
      .chunks_exact_mut(RGB_CHANNELS)
      .zip(pixels.chunks_exact(RGBA_CHANNELS))
    {
      for (value, &channel) in rgb.iter_mut().zip(rgba) {
        *value = 2.0 * (channel as f32 / 255.0) - 1.0;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use image::Rgba;

  use super::*;

  fn counted_frame(counter: &Arc<AtomicUsize>) -> SensorFrame {
    let counter = Arc::clone(counter);
    let planes = [
      Plane::new(vec![16; 4], 2, 1),
      Plane::new(vec![128; 1], 1, 1),
      Plane::new(vec![128; 1], 1, 1),
    ];
    SensorFrame::new(planes, 2, 2).on_release(move || {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn rotation_parses_degrees() {
    assert_eq!("90".parse::<Rotation>(), Ok(Rotation::Deg90));
    assert_eq!("-90".parse::<Rotation>(), Ok(Rotation::Deg270));
    assert_eq!("180°".parse::<Rotation>(), Ok(Rotation::Deg180));
    assert!("45".parse::<Rotation>().is_err());
    assert!("up".parse::<Rotation>().is_err());
  }

  #[test]
  fn explicit_release_runs_hook_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    counted_frame(&counter).release();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn dropped_frame_is_released() {
    let counter = Arc::new(AtomicUsize::new(0));
    drop(counted_frame(&counter));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn rotation_normalizes_degrees() {
    assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Deg270));
    assert_eq!(Rotation::from_degrees(360), Some(Rotation::Deg0));
    assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
    assert_eq!(Rotation::from_degrees(45), None);
    assert_eq!(Rotation::Deg90.offset(-90), Rotation::Deg0);
    assert_eq!(Rotation::Deg270.offset(180), Rotation::Deg90);
  }

  #[test]
  fn normalize_maps_channels_to_unit_range() {
    let mut rectified = RectifiedImage::new(2);
    rectified.image_mut().put_pixel(0, 0, Rgba([0, 255, 51, 255]));
    rectified.normalize();

    let tensor = rectified.tensor();
    assert_eq!(tensor.len(), 2 * 2 * 3);
    assert_eq!(tensor[0], -1.0);
    assert_eq!(tensor[1], 1.0);
    assert!((tensor[2] - (2.0 * 0.2 - 1.0)).abs() < 1e-6);
    // 未写入的像素为 0
    assert_eq!(tensor[3], -1.0);
  }
}
