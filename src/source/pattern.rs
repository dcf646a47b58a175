// 该文件是 Qianli （千里眼） 项目的一部分。
// src/source/pattern.rs - 合成彩条帧
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

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Rotation, SensorFrame},
  source::{ChromaLayout, FrameSource, SourceError, encode_yuv420, query_param},
};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const BAR_COUNT: u32 = 8;
// 每帧彩条平移的像素数
const BAR_STEP: u32 = 4;

const BARS: [[u8; 3]; BAR_COUNT as usize] = [
  [255, 255, 255],
  [255, 255, 0],
  [0, 255, 255],
  [0, 255, 0],
  [255, 0, 255],
  [255, 0, 0],
  [0, 0, 255],
  [0, 0, 0],
];

/// 平移彩条测试图
///
/// URL 形如 `pattern://?width=640&height=480&frames=120&fps=30&layout=semi-planar&rotation=90`。
#[derive(Debug)]
pub struct PatternSource {
  width: u32,
  height: u32,
  frames: Option<u64>,
  fps: Option<f64>,
  layout: ChromaLayout,
  rotation: Rotation,
  emitted: u64,
  released: Arc<AtomicU64>,
  last_emit: Option<Instant>,
}

impl FromUrlWithScheme for PatternSource {
  const SCHEME: &'static str = "pattern";
}

impl FromUrl for PatternSource {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SourceError::SchemeMismatch(url.scheme().to_string()));
    }

    let width = query_param(url, "width")?.unwrap_or(DEFAULT_WIDTH);
    let height = query_param(url, "height")?.unwrap_or(DEFAULT_HEIGHT);
    let mut source = PatternSource::new(width, height)?;
    source.frames = query_param(url, "frames")?;
    source.fps = query_param(url, "fps")?;
    source.layout = query_param(url, "layout")?.unwrap_or_default();

    if let Some(degrees) = query_param::<i32>(url, "rotation")? {
      source.rotation =
        Rotation::from_degrees(degrees).ok_or_else(|| SourceError::InvalidParameter {
          key: "rotation".to_string(),
          value: degrees.to_string(),
        })?;
    }

    info!(
      "合成输入: {}x{}, 帧数 {:?}, 帧率 {:?}, 布局 {:?}",
      source.width, source.height, source.frames, source.fps, source.layout
    );
    Ok(source)
  }
}

impl PatternSource {
  pub fn new(width: u32, height: u32) -> Result<Self, SourceError> {
    if width == 0 || height == 0 {
      return Err(SourceError::InvalidDimensions { width, height });
    }
    Ok(Self {
      width,
      height,
      frames: None,
      fps: None,
      layout: ChromaLayout::Planar,
      rotation: Rotation::Deg0,
      emitted: 0,
      released: Arc::new(AtomicU64::new(0)),
      last_emit: None,
    })
  }

  pub fn with_frames(mut self, frames: u64) -> Self {
    self.frames = Some(frames);
    self
  }

  pub fn with_fps(mut self, fps: f64) -> Self {
    self.fps = Some(fps);
    self
  }

  pub fn with_layout(mut self, layout: ChromaLayout) -> Self {
    self.layout = layout;
    self
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn emitted(&self) -> u64 {
    self.emitted
  }

  /// 已被归还的帧数
  pub fn released(&self) -> u64 {
    self.released.load(Ordering::Acquire)
  }

  /// 归还计数器，可在源被消费后继续观察
  pub fn release_counter(&self) -> Arc<AtomicU64> {
    Arc::clone(&self.released)
  }

  fn pace(&mut self) {
    if let (Some(fps), Some(last)) = (self.fps, self.last_emit)
      && fps > 0.0
    {
      let interval = Duration::from_secs_f64(1.0 / fps);
      if let Some(wait) = interval.checked_sub(last.elapsed()) {
        thread::sleep(wait);
      }
    }
    self.last_emit = Some(Instant::now());
  }
}

impl Iterator for PatternSource {
  type Item = SensorFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.frames.is_some_and(|n| self.emitted >= n) {
      debug!("合成输入结束，共 {} 帧", self.emitted);
      return None;
    }
    self.pace();

    let index = self.emitted;
    let shift = (index as u32).wrapping_mul(BAR_STEP);
    let bar_width = self.width.div_ceil(BAR_COUNT).max(1);
    let planes = encode_yuv420(self.width, self.height, self.layout, |x, _| {
      BARS[((x.wrapping_add(shift) / bar_width) % BAR_COUNT) as usize]
    });

    let released = Arc::clone(&self.released);
    self.emitted += 1;
    Some(
      SensorFrame::new(planes, self.width, self.height)
        .with_index(index)
        .with_rotation(self.rotation)
        .on_release(move || {
          released.fetch_add(1, Ordering::AcqRel);
        }),
    )
  }
}

impl FrameSource for PatternSource {
  fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  fn fps(&self) -> Option<f64> {
    self.fps
  }
}
