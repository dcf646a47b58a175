// 该文件是 Qianli （千里眼） 项目的一部分。
// src/source/image_file.rs - 图像文件输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Plane, Rotation, SensorFrame},
  source::{ChromaLayout, FrameSource, SourceError, encode_yuv420, query_param},
};

#[derive(Error, Debug)]
pub enum ImageFileSourceError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(image::ImageError),
}

impl From<std::io::Error> for ImageFileSourceError {
  fn from(err: std::io::Error) -> Self {
    ImageFileSourceError::IoError(err)
  }
}

impl From<image::ImageError> for ImageFileSourceError {
  fn from(err: image::ImageError) -> Self {
    ImageFileSourceError::ImageLoadError(err)
  }
}

/// 把一张静态图片编码为 YUV 4:2:0 帧并重复输出
///
/// URL 形如 `image:///path/photo.jpg?frames=30&layout=planar&rotation=90`，默认只输出一帧。
pub struct ImageFileSource {
  planes: [Plane; 3],
  width: u32,
  height: u32,
  rotation: Rotation,
  frames: u64,
  emitted: u64,
}

impl FromUrlWithScheme for ImageFileSource {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileSource {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SourceError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = url.path();
    info!("读取图像文件: {}", path);
    let image = ImageReader::open(path)
      .map_err(ImageFileSourceError::from)?
      .decode()
      .map_err(ImageFileSourceError::from)?
      .to_rgb8();

    let layout = query_param(url, "layout")?.unwrap_or_default();
    let mut source = Self::from_image(&image, layout)?;
    source.frames = query_param(url, "frames")?.unwrap_or(1);
    if let Some(degrees) = query_param::<i32>(url, "rotation")? {
      source.rotation =
        Rotation::from_degrees(degrees).ok_or_else(|| SourceError::InvalidParameter {
          key: "rotation".to_string(),
          value: degrees.to_string(),
        })?;
    }
    Ok(source)
  }
}

impl ImageFileSource {
  pub fn from_image(image: &RgbImage, layout: ChromaLayout) -> Result<Self, SourceError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(SourceError::InvalidDimensions { width, height });
    }
    let planes = encode_yuv420(width, height, layout, |x, y| image.get_pixel(x, y).0);
    Ok(Self {
      planes,
      width,
      height,
      rotation: Rotation::Deg0,
      frames: 1,
      emitted: 0,
    })
  }

  pub fn with_frames(mut self, frames: u64) -> Self {
    self.frames = frames;
    self
  }
}

impl Iterator for ImageFileSource {
  type Item = SensorFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.emitted >= self.frames {
      return None;
    }
    let index = self.emitted;
    self.emitted += 1;
    Some(
      SensorFrame::new(self.planes.clone(), self.width, self.height)
        .with_index(index)
        .with_rotation(self.rotation),
    )
  }
}

impl FrameSource for ImageFileSource {
  fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }
}
