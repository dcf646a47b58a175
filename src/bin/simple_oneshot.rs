// 该文件是 Qianli （千里眼） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧检测
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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use url::Url;

use qianli::{
  FromUrl,
  frame::Rotation,
  model::{LabelSet, ReplayEngine},
  overlay::{ImageSurface, OverlayRenderer, OverlayStyle},
  pipeline::{Pipeline, PipelineConfig},
  rectify::RectifyMode,
  source::{FrameSource, SourceWrapper},
  task::{OneShotTask, Task},
};
use tracing::info;

/// Qianli 单帧检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 帧来源，例如 image:///path/photo.jpg
  #[arg(long, value_name = "SOURCE")]
  pub source: Url,
  /// 推理引擎，例如 replay:///path/predictions.json
  #[arg(long, value_name = "ENGINE")]
  pub engine: Url,
  /// 输出，例如 folder:///tmp/qianli?record=name&always
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 传感器方向（角度）
  #[arg(long, default_value = "0", value_name = "DEGREES")]
  pub sensor_orientation: Rotation,
  /// 显示方向（角度）
  #[arg(long, default_value = "0", value_name = "DEGREES")]
  pub display_rotation: Rotation,
  /// 预处理方式: crop 或 stretch
  #[arg(long, default_value = "crop", value_name = "MODE")]
  pub mode: RectifyMode,

  /// JSON 字符串数组形式的标签文件，默认使用 VOC 标签
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
  /// 标签字体文件，未指定时只画框
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("帧来源: {}", args.source);
  info!("推理引擎: {}", args.engine);
  info!("输出路径: {}", args.output);

  let source = SourceWrapper::from_url(&args.source)?;
  let (width, height) = source.dimensions();
  let labels = match &args.labels {
    Some(path) => LabelSet::from_json_file(path)?,
    None => LabelSet::voc(),
  };
  let config = PipelineConfig::new(width, height)
    .with_mode(args.mode)
    .with_labels(labels);
  let pipeline = Pipeline::new(config, ReplayEngine::from_url(&args.engine)?)?;

  let style = match &args.font {
    Some(path) => OverlayStyle::with_font_file(path)?,
    None => OverlayStyle::default(),
  };
  let surface = ImageSurface::from_url(&args.output)?;
  let (sw, sh) = surface.dimensions();
  let renderer = Arc::new(OverlayRenderer::new(surface, style));
  renderer.surface_dimensions(sw, sh);
  renderer.target_dimensions(sw, sh);

  OneShotTask::default()
    .with_orientation(args.display_rotation, args.sensor_orientation)
    .run_task(source, pipeline, Arc::clone(&renderer))?;

  if let Some(path) = renderer.surface().last_saved() {
    info!("已保存: {}", path.display());
  }

  Ok(())
}
