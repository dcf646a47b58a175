// 该文件是 Qianli （千里眼） 项目的一部分。
// src/source.rs - 传感器帧输入
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

use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  convert::rgb_to_yuv,
  frame::{Plane, SensorFrame},
};

/// 帧来源
pub trait FrameSource: Iterator<Item = SensorFrame> {
  fn dimensions(&self) -> (u32, u32);

  fn fps(&self) -> Option<f64> {
    None
  }
}

/// 色度平面布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaLayout {
  /// U、V 各占一个平面，像素步长 1
  #[default]
  Planar,
  /// U、V 交错存储，像素步长 2
  SemiPlanar,
}

impl FromStr for ChromaLayout {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "planar" | "i420" => Ok(ChromaLayout::Planar),
      "semi-planar" | "nv12" => Ok(ChromaLayout::SemiPlanar),
      _ => Err(format!("未知的色度布局: {}", s)),
    }
  }
}

/// 按 YUV 4:2:0 编码 RGB 像素，色度取每个 2x2 块的均值
pub fn encode_yuv420(
  width: u32,
  height: u32,
  layout: ChromaLayout,
  pixel: impl Fn(u32, u32) -> [u8; 3],
) -> [Plane; 3] {
  let (w, h) = (width as usize, height as usize);
  let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

  let mut luma = vec![0u8; w * h];
  let mut u = vec![0u8; cw * ch];
  let mut v = vec![0u8; cw * ch];
  let mut sums = vec![[0u32; 3]; cw * ch];

  for y in 0..height {
    for x in 0..width {
      let [r, g, b] = pixel(x, y);
      let [yy, uu, vv] = rgb_to_yuv(r, g, b);
      luma[y as usize * w + x as usize] = yy;
      let sum = &mut sums[(y as usize / 2) * cw + x as usize / 2];
      sum[0] += uu as u32;
      sum[1] += vv as u32;
      sum[2] += 1;
    }
  }

  for (i, [su, sv, n]) in sums.into_iter().enumerate() {
    u[i] = (su / n) as u8;
    v[i] = (sv / n) as u8;
  }

  match layout {
    ChromaLayout::Planar => [
      Plane::new(luma, w, 1),
      Plane::new(u, cw, 1),
      Plane::new(v, cw, 1),
    ],
    ChromaLayout::SemiPlanar => {
      let interleaved: Vec<u8> = u.iter().zip(&v).flat_map(|(&a, &b)| [a, b]).collect();
      let shifted = interleaved[1..].to_vec();
      [
        Plane::new(luma, w, 1),
        Plane::new(interleaved, cw * 2, 2),
        Plane::new(shifted, cw * 2, 2),
      ]
    }
  }
}

#[derive(Error, Debug)]
pub enum SourceError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFile(#[from] ImageFileSourceError),
}

/// 读取查询参数，不存在时返回 `None`
pub(crate) fn query_param<T: FromStr>(url: &Url, key: &str) -> Result<Option<T>, SourceError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, value)) => value
      .parse()
      .map(Some)
      .map_err(|_| SourceError::InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
      }),
    None => Ok(None),
  }
}

mod pattern;
pub use self::pattern::PatternSource;

#[cfg(feature = "read_image_file")]
mod image_file;
#[cfg(feature = "read_image_file")]
pub use self::image_file::{ImageFileSource, ImageFileSourceError};

pub enum SourceWrapper {
  Pattern(PatternSource),
  #[cfg(feature = "read_image_file")]
  ImageFile(ImageFileSource),
}

impl FromUrl for SourceWrapper {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() == PatternSource::SCHEME {
      return Ok(SourceWrapper::Pattern(PatternSource::from_url(url)?));
    }
    #[cfg(feature = "read_image_file")]
    {
      if url.scheme() == ImageFileSource::SCHEME {
        return Ok(SourceWrapper::ImageFile(ImageFileSource::from_url(url)?));
      }
    }
    Err(SourceError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl Iterator for SourceWrapper {
  type Item = SensorFrame;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      SourceWrapper::Pattern(source) => source.next(),
      #[cfg(feature = "read_image_file")]
      SourceWrapper::ImageFile(source) => source.next(),
    }
  }
}

impl FrameSource for SourceWrapper {
  fn dimensions(&self) -> (u32, u32) {
    match self {
      SourceWrapper::Pattern(source) => source.dimensions(),
      #[cfg(feature = "read_image_file")]
      SourceWrapper::ImageFile(source) => source.dimensions(),
    }
  }

  fn fps(&self) -> Option<f64> {
    match self {
      SourceWrapper::Pattern(source) => source.fps(),
      #[cfg(feature = "read_image_file")]
      SourceWrapper::ImageFile(source) => source.fps(),
    }
  }
}
