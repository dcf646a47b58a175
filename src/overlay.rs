// 该文件是 Qianli （千里眼） 项目的一部分。
// src/overlay.rs - 检测框叠加层
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

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ab_glyph::FontArc;
use image::{Rgba, RgbaImage};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::Detection;
use crate::palette::paint_for_index;

pub mod draw;

#[cfg(feature = "directory_record")]
mod image_surface;
#[cfg(feature = "directory_record")]
pub use self::image_surface::{ImageSurface, RecordMode};

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Error, Debug)]
pub enum SurfaceError {
  #[error("绘制表面不可用")]
  Unavailable,
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("字体加载错误: {0}")]
  Font(String),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 绘制目标，例如屏幕上的透明叠加层
pub trait RenderSurface: Send {
  /// 获取画布；失败时本帧不绘制
  fn lock_canvas(&mut self) -> Result<&mut RgbaImage, SurfaceError>;

  /// 提交画布
  fn unlock_and_post(&mut self, detections: &[Detection]) -> Result<(), SurfaceError>;

  /// 叠加层下方的画面，屏幕表面通常由相机预览直接提供
  fn underlay(&mut self, _image: &RgbaImage) {}
}

/// 叠加层坐标中的矩形
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayRect {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

/// 叠加层几何
///
/// 检测框区域是目标（相机预览）区域内的最大正方形，居中放置在叠加表面上。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OverlayGeometry {
  surface: (u32, u32),
  target: (u32, u32),
  side: f32,
  x_offset: f32,
  y_offset: f32,
}

impl OverlayGeometry {
  pub fn new(surface: (u32, u32), target: (u32, u32)) -> Self {
    let mut geometry = Self {
      surface,
      target,
      ..Default::default()
    };
    geometry.update();
    geometry
  }

  fn update(&mut self) {
    let (sw, sh) = (self.surface.0 as f32, self.surface.1 as f32);
    let (tw, th) = (self.target.0 as f32, self.target.1 as f32);
    self.side = tw.min(th);
    self.x_offset = (sw - tw) / 2.0 + (tw - self.side) / 2.0;
    self.y_offset = (sh - th) / 2.0 + (th - self.side) / 2.0;
  }

  pub fn set_surface(&mut self, width: u32, height: u32) {
    self.surface = (width, height);
    self.update();
  }

  pub fn set_target(&mut self, width: u32, height: u32) {
    self.target = (width, height);
    self.update();
  }

  pub fn surface(&self) -> (u32, u32) {
    self.surface
  }

  pub fn target(&self) -> (u32, u32) {
    self.target
  }

  pub fn side(&self) -> f32 {
    self.side
  }

  pub fn offset(&self) -> (f32, f32) {
    (self.x_offset, self.y_offset)
  }

  /// 归一化坐标映射到叠加层像素，每条边截断到 [offset, side + offset]
  pub fn map(&self, detection: &Detection) -> OverlayRect {
    let x = |v: f32| (v * self.side + self.x_offset).clamp(self.x_offset, self.side + self.x_offset);
    let y = |v: f32| (v * self.side + self.y_offset).clamp(self.y_offset, self.side + self.y_offset);
    OverlayRect {
      left: x(detection.left),
      top: y(detection.top),
      right: x(detection.right),
      bottom: y(detection.bottom),
    }
  }
}

/// 叠加层样式，未配置字体时不绘制标签文字
#[derive(Clone, Default)]
pub struct OverlayStyle {
  pub font: Option<FontArc>,
}

impl OverlayStyle {
  pub fn with_font_file(path: impl AsRef<Path>) -> Result<Self, SurfaceError> {
    let path = path.as_ref();
    info!("加载字体文件: {}", path.display());
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data).map_err(|e| SurfaceError::Font(e.to_string()))?;
    Ok(Self { font: Some(font) })
  }
}

impl std::fmt::Debug for OverlayStyle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OverlayStyle")
      .field("font", &self.font.is_some())
      .finish()
  }
}

/// 叠加层绘制器
///
/// 几何由 UI 线程更新，由流水线线程读取；两者共用一个锁，
/// 绘制时只在读取快照期间持有。
pub struct OverlayRenderer<S> {
  geometry: Mutex<OverlayGeometry>,
  surface: Mutex<S>,
  style: OverlayStyle,
}

impl<S: RenderSurface> OverlayRenderer<S> {
  pub fn new(surface: S, style: OverlayStyle) -> Self {
    Self {
      geometry: Mutex::new(OverlayGeometry::default()),
      surface: Mutex::new(surface),
      style,
    }
  }

  fn lock_geometry(&self) -> MutexGuard<'_, OverlayGeometry> {
    self.geometry.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 叠加表面尺寸变化
  pub fn surface_dimensions(&self, width: u32, height: u32) {
    self.lock_geometry().set_surface(width, height);
  }

  /// 相机预览区域尺寸变化
  pub fn target_dimensions(&self, width: u32, height: u32) {
    self.lock_geometry().set_target(width, height);
  }

  pub fn geometry(&self) -> OverlayGeometry {
    *self.lock_geometry()
  }

  pub fn surface(&self) -> MutexGuard<'_, S> {
    self.surface.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn into_surface(self) -> S {
    self
      .surface
      .into_inner()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// 绘制一组检测框，返回本帧是否完成绘制
  pub fn draw(&self, detections: &[Detection]) -> bool {
    let geometry = self.geometry();
    let mut surface = self.surface();

    let canvas = match surface.lock_canvas() {
      Ok(canvas) => canvas,
      Err(e) => {
        warn!("无法获取画布，跳过本帧绘制: {}", e);
        return false;
      }
    };

    for pixel in canvas.pixels_mut() {
      *pixel = TRANSPARENT;
    }
    for detection in detections {
      let rect = geometry.map(detection);
      let paint = paint_for_index(detection.class_index);
      draw::draw_box(canvas, &rect, &paint);
      if let Some(font) = &self.style.font {
        let label = format!("{} {:.2}", detection.label, detection.confidence);
        draw::draw_label(canvas, &rect, &paint, font, &label);
      }
    }

    match surface.unlock_and_post(detections) {
      Ok(()) => {
        debug!("绘制 {} 个检测框", detections.len());
        true
      }
      Err(e) => {
        warn!("提交画布失败: {}", e);
        false
      }
    }
  }
}
