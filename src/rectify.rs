// 该文件是 Qianli （千里眼） 项目的一部分。
// src/rectify.rs - 模型输入的裁剪、缩放与旋转，以及预览显示变换
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

use image::{Rgba, RgbaImage};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use thiserror::Error;
use tracing::debug;

use crate::frame::Rotation;

const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RectifyError {
  #[error("源图像为空: {width}x{height}")]
  EmptySource { width: u32, height: u32 },
  #[error("目标图像为空: {width}x{height}")]
  EmptyDestination { width: u32, height: u32 },
  #[error("目标图像必须为正方形: {width}x{height}")]
  NotSquare { width: u32, height: u32 },
  #[error("预览视图尺寸无效: 视图 {view:?}, 预览 {preview:?}")]
  EmptyView {
    view: (u32, u32),
    preview: (u32, u32),
  },
  #[error("变换矩阵不可逆")]
  SingularTransform,
}

/// 预处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RectifyMode {
  /// 取中心正方形后缩放
  #[default]
  CenterCrop,
  /// 整幅图像拉伸到正方形
  Stretch,
}

impl std::str::FromStr for RectifyMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "crop" | "center-crop" => Ok(RectifyMode::CenterCrop),
      "stretch" => Ok(RectifyMode::Stretch),
      _ => Err(format!("未知的预处理方式: {}", s)),
    }
  }
}

/// 精确的四分之一圈顺时针旋转（y 轴向下）
fn quarter_turn(turns: i32) -> Result<Projection, RectifyError> {
  let (c, s) = match turns.rem_euclid(4) {
    0 => (1.0, 0.0),
    1 => (0.0, 1.0),
    2 => (-1.0, 0.0),
    _ => (0.0, -1.0),
  };
  #[rustfmt::skip]
  let matrix = [
    c,   -s,  0.0,
    s,   c,   0.0,
    0.0, 0.0, 1.0,
  ];
  Projection::from_matrix(matrix).ok_or(RectifyError::SingularTransform)
}

/// 绕 (cx, cy) 旋转
fn rotate_about(turns: i32, cx: f32, cy: f32) -> Result<Projection, RectifyError> {
  Ok(
    Projection::translate(-cx, -cy)
      .and_then(quarter_turn(turns)?)
      .and_then(Projection::translate(cx, cy)),
  )
}

fn check_source(width: u32, height: u32) -> Result<(), RectifyError> {
  if width == 0 || height == 0 {
    return Err(RectifyError::EmptySource { width, height });
  }
  Ok(())
}

fn check_destination(width: u32, height: u32) -> Result<u32, RectifyError> {
  if width == 0 || height == 0 {
    return Err(RectifyError::EmptyDestination { width, height });
  }
  if width != height {
    return Err(RectifyError::NotSquare { width, height });
  }
  Ok(width)
}

fn rotate_in_destination(
  projection: Projection,
  size: u32,
  rotation: Rotation,
) -> Result<Projection, RectifyError> {
  if rotation == Rotation::Deg0 {
    return Ok(projection);
  }
  let half = size as f32 / 2.0;
  Ok(projection.and_then(rotate_about(rotation.quarter_turns(), half, half)?))
}

/// 中心裁剪缩放的连续坐标变换：平移、缩放，再绕目标中心旋转
pub fn crop_and_rescale_transform(
  (width, height): (u32, u32),
  size: u32,
  rotation: Rotation,
) -> Result<Projection, RectifyError> {
  check_source(width, height)?;
  check_destination(size, size)?;

  let side = width.min(height) as f32;
  let dx = ((width as f32 - side) / 2.0).max(0.0);
  let dy = ((height as f32 - side) / 2.0).max(0.0);
  let factor = size as f32 / side;

  let projection = Projection::translate(-dx, -dy).and_then(Projection::scale(factor, factor));
  rotate_in_destination(projection, size, rotation)
}

/// 整幅拉伸的连续坐标变换
pub fn rescale_transform(
  (width, height): (u32, u32),
  size: u32,
  rotation: Rotation,
) -> Result<Projection, RectifyError> {
  check_source(width, height)?;
  check_destination(size, size)?;

  let projection = Projection::scale(size as f32 / width as f32, size as f32 / height as f32);
  rotate_in_destination(projection, size, rotation)
}

/// 以像素中心采样的最近邻绘制
fn draw_unfiltered(source: &RgbaImage, destination: &mut RgbaImage, projection: Projection) {
  let centered = Projection::translate(0.5, 0.5)
    .and_then(projection)
    .and_then(Projection::translate(-0.5, -0.5));
  warp_into(
    source,
    &centered,
    Interpolation::Nearest,
    BACKGROUND,
    destination,
  );
}

/// 中心裁剪为正方形，缩放到目标尺寸，并按 `rotation` 绕目标中心旋转
pub fn crop_and_rescale(
  source: &RgbaImage,
  destination: &mut RgbaImage,
  rotation: Rotation,
) -> Result<(), RectifyError> {
  let size = check_destination(destination.width(), destination.height())?;
  let projection = crop_and_rescale_transform(source.dimensions(), size, rotation)?;
  draw_unfiltered(source, destination, projection);
  Ok(())
}

/// 不裁剪，整幅拉伸到目标正方形
pub fn rescale(
  source: &RgbaImage,
  destination: &mut RgbaImage,
  rotation: Rotation,
) -> Result<(), RectifyError> {
  let size = check_destination(destination.width(), destination.height())?;
  let projection = rescale_transform(source.dimensions(), size, rotation)?;
  draw_unfiltered(source, destination, projection);
  Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rectifier {
  mode: RectifyMode,
}

impl Rectifier {
  pub fn new(mode: RectifyMode) -> Self {
    Self { mode }
  }

  pub fn mode(&self) -> RectifyMode {
    self.mode
  }

  pub fn rectify(
    &self,
    source: &RgbaImage,
    destination: &mut RgbaImage,
    rotation: Rotation,
  ) -> Result<(), RectifyError> {
    debug!(
      "预处理 {:?}: {:?} -> {:?}, 旋转 {}",
      self.mode,
      source.dimensions(),
      destination.dimensions(),
      rotation
    );
    match self.mode {
      RectifyMode::CenterCrop => crop_and_rescale(source, destination, rotation),
      RectifyMode::Stretch => rescale(source, destination, rotation),
    }
  }
}

/// 预览缓冲区到显示视图的变换
///
/// `display` 为显示方向（0/90/180/270 对应编码 0..=3）。
/// 横屏方向（90/270）时先把视图矩形映射到中心对齐且宽高互换的缓冲区矩形，
/// 再以中心为原点按 `max(viewH/previewH, viewW/previewW)` 缩放，
/// 最后绕中心旋转 `90 * (code - 2)` 度。180 度只绕中心旋转半圈，0 度为恒等变换。
pub fn preview_transform(
  view: (u32, u32),
  preview: (u32, u32),
  display: Rotation,
) -> Result<Projection, RectifyError> {
  let (view_w, view_h) = view;
  let (preview_w, preview_h) = preview;
  if view_w == 0 || view_h == 0 || preview_w == 0 || preview_h == 0 {
    return Err(RectifyError::EmptyView { view, preview });
  }

  let (view_w, view_h) = (view_w as f32, view_h as f32);
  let (preview_w, preview_h) = (preview_w as f32, preview_h as f32);
  let (cx, cy) = (view_w / 2.0, view_h / 2.0);

  match display {
    Rotation::Deg0 => Ok(Projection::translate(0.0, 0.0)),
    Rotation::Deg180 => rotate_about(2, cx, cy),
    Rotation::Deg90 | Rotation::Deg270 => {
      // 缓冲区矩形宽高互换，中心与视图对齐
      let (buffer_w, buffer_h) = (preview_h, preview_w);
      let buffer_left = cx - buffer_w / 2.0;
      let buffer_top = cy - buffer_h / 2.0;

      let fill = Projection::scale(buffer_w / view_w, buffer_h / view_h)
        .and_then(Projection::translate(buffer_left, buffer_top));

      let factor = (view_h / preview_h).max(view_w / preview_w);
      let zoom = Projection::translate(-cx, -cy)
        .and_then(Projection::scale(factor, factor))
        .and_then(Projection::translate(cx, cy));

      let turns = display.quarter_turns() - 2;
      Ok(fill.and_then(zoom).and_then(rotate_about(turns, cx, cy)?))
    }
  }
}
