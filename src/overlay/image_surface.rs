// 该文件是 Qianli （千里眼） 项目的一部分。
// src/overlay/image_surface.rs - 离屏绘制表面与目录记录
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use image::{RgbaImage, imageops};
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::Detection,
  overlay::{RenderSurface, SurfaceError, draw::Record},
};

// 与模型输入边长一致，叠加层可直接垫在预处理图像上
const DEFAULT_CANVAS_SIZE: u32 = 448;

/// 目录记录方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
  /// 保存叠加后的图像
  Draw,
  /// 同时写出检测结果文本
  Record { label_with_name: bool },
}

impl RecordMode {
  fn from_url(url: &Url) -> Self {
    match url.query_pairs().find(|(k, _)| k == "record") {
      Some((_, v)) if v == "id" => RecordMode::Record {
        label_with_name: false,
      },
      Some(_) => RecordMode::Record {
        label_with_name: true,
      },
      None => RecordMode::Draw,
    }
  }
}

struct Recorder {
  directory: PathBuf,
  mode: RecordMode,
  always: bool,
  frame_counter: u16,
}

impl Recorder {
  fn frame_path(&mut self) -> Result<PathBuf, SurfaceError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    self.frame_counter = self.frame_counter.wrapping_add(1);
    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_counter
    )))
  }
}

/// 内存中的 RGBA 画布，可按 `folder://` URL 把每次提交写入按日期划分的目录
///
/// URL 形如 `folder:///var/qianli?record=name&always`，`record` 取 `name` 或 `id`，
/// 不带 `always` 时跳过没有检测结果的帧。
pub struct ImageSurface {
  canvas: RgbaImage,
  background: Option<RgbaImage>,
  recorder: Option<Recorder>,
  available: bool,
  posted: u64,
  saved: u64,
  last_saved: Option<PathBuf>,
}

impl FromUrlWithScheme for ImageSurface {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ImageSurface {
  type Error = SurfaceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SurfaceError::SchemeMismatch);
    }

    let width = query_dimension(url, "width")?;
    let height = query_dimension(url, "height")?;
    let recorder = Recorder {
      directory: PathBuf::from(url.path()),
      mode: RecordMode::from_url(url),
      always: url.query_pairs().any(|(k, _)| k == "always"),
      frame_counter: 0,
    };
    info!(
      "目录记录输出: {}, 方式 {:?}, 保存空结果 {}",
      recorder.directory.display(),
      recorder.mode,
      recorder.always
    );

    let mut surface = Self::new(
      width.unwrap_or(DEFAULT_CANVAS_SIZE),
      height.unwrap_or(DEFAULT_CANVAS_SIZE),
    );
    surface.recorder = Some(recorder);
    Ok(surface)
  }
}

fn query_dimension(url: &Url, key: &str) -> Result<Option<u32>, SurfaceError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, v)) => v
      .parse()
      .map(Some)
      .map_err(|_| SurfaceError::InvalidParameter {
        key: key.to_string(),
        value: v.to_string(),
      }),
    None => Ok(None),
  }
}

impl ImageSurface {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      canvas: RgbaImage::new(width, height),
      background: None,
      recorder: None,
      available: true,
      posted: 0,
      saved: 0,
      last_saved: None,
    }
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.canvas.dimensions()
  }

  /// 调整画布尺寸，旧内容丢弃
  pub fn resize(&mut self, width: u32, height: u32) {
    if self.canvas.dimensions() != (width, height) {
      self.canvas = RgbaImage::new(width, height);
    }
  }

  /// 保存时垫在叠加层下面的图像
  pub fn set_background(&mut self, background: Option<RgbaImage>) {
    self.background = background;
  }

  /// 模拟表面被销毁或重建
  pub fn set_available(&mut self, available: bool) {
    self.available = available;
  }

  pub fn canvas(&self) -> &RgbaImage {
    &self.canvas
  }

  pub fn posted(&self) -> u64 {
    self.posted
  }

  /// 已写入磁盘的图像数
  pub fn saved(&self) -> u64 {
    self.saved
  }

  pub fn last_saved(&self) -> Option<&Path> {
    self.last_saved.as_deref()
  }

  pub fn background(&self) -> Option<&RgbaImage> {
    self.background.as_ref()
  }

  fn composed(&self) -> RgbaImage {
    match &self.background {
      Some(background) => {
        let mut image = background.clone();
        imageops::overlay(&mut image, &self.canvas, 0, 0);
        image
      }
      None => self.canvas.clone(),
    }
  }
}

impl RenderSurface for ImageSurface {
  fn lock_canvas(&mut self) -> Result<&mut RgbaImage, SurfaceError> {
    if !self.available {
      return Err(SurfaceError::Unavailable);
    }
    Ok(&mut self.canvas)
  }

  fn underlay(&mut self, image: &RgbaImage) {
    match &mut self.background {
      Some(background) if background.dimensions() == image.dimensions() => {
        background.copy_from_slice(image.as_raw());
      }
      _ => self.background = Some(image.clone()),
    }
  }

  fn unlock_and_post(&mut self, detections: &[Detection]) -> Result<(), SurfaceError> {
    self.posted += 1;
    let skip = match &self.recorder {
      Some(recorder) => !recorder.always && detections.is_empty(),
      None => true,
    };
    if skip {
      return Ok(());
    }

    let image = self.composed();
    let Some(recorder) = self.recorder.as_mut() else {
      return Ok(());
    };
    let path = recorder.frame_path()?;
    image.save(&path)?;
    if let RecordMode::Record { label_with_name } = recorder.mode {
      Record { label_with_name }.record(detections, &path)?;
    }
    debug!("保存叠加图像: {}", path.display());
    self.saved += 1;
    self.last_saved = Some(path);
    Ok(())
  }
}
