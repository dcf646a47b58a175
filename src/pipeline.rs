// 该文件是 Qianli （千里眼） 项目的一部分。
// src/pipeline.rs - 单帧处理流水线：转换、预处理、推理、解码
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

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  convert::{ConvertError, YuvConverter},
  frame::{RectifiedImage, Rotation, SensorFrame},
  model::{
    DecodeError, Detection, EngineError, InferenceEngine, LabelSet, YoloV1Config, YoloV1Decoder,
  },
  rectify::{self, RectifyError, RectifyMode, Rectifier},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("帧尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  DimensionMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("无效帧: {0}")]
  Convert(#[from] ConvertError),
  #[error("预处理错误: {0}")]
  Rectify(#[from] RectifyError),
  #[error("推理错误: {0}")]
  Engine(#[from] EngineError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("工作线程崩溃: {0}")]
  WorkerPanicked(String),
}

impl PipelineError {
  /// 无效帧只丢弃当前帧，其余错误都会终止会话
  pub fn is_fatal(&self) -> bool {
    !matches!(self, PipelineError::Convert(_))
  }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// 传感器帧尺寸
  pub input_width: u32,
  pub input_height: u32,
  pub model: YoloV1Config,
  pub mode: RectifyMode,
  pub labels: LabelSet,
}

impl PipelineConfig {
  pub fn new(input_width: u32, input_height: u32) -> Self {
    Self {
      input_width,
      input_height,
      model: YoloV1Config::default(),
      mode: RectifyMode::default(),
      labels: LabelSet::default(),
    }
  }

  pub fn with_mode(mut self, mode: RectifyMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_labels(mut self, labels: LabelSet) -> Self {
    self.labels = labels;
    self
  }
}

/// 各阶段耗时
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
  pub preprocess: Duration,
  pub inference: Duration,
  pub decode: Duration,
  pub overall: Duration,
}

impl StageTimings {
  /// `1 / overall`，耗时为零时返回 0
  pub fn fps(&self) -> f32 {
    let seconds = self.overall.as_secs_f32();
    if seconds > 0.0 { 1.0 / seconds } else { 0.0 }
  }
}

/// 一帧的完整结果
#[derive(Debug, Clone)]
pub struct FrameResult {
  pub index: u64,
  pub detections: Vec<Detection>,
  pub timings: StageTimings,
  pub fps: f32,
}

pub struct Pipeline<E> {
  input_dimensions: (u32, u32),
  converter: YuvConverter,
  rectifier: Rectifier,
  rectified: RectifiedImage,
  engine: E,
  prediction: Box<[f32]>,
  decoder: YoloV1Decoder,
}

impl<E: InferenceEngine> Pipeline<E> {
  pub fn new(config: PipelineConfig, engine: E) -> Result<Self, PipelineError> {
    let PipelineConfig {
      input_width,
      input_height,
      model,
      mode,
      labels,
    } = config;

    // 尺寸在构造时校验，逐帧不再出现配置错误
    rectify::crop_and_rescale_transform((input_width, input_height), model.input_size, Rotation::Deg0)?;
    let decoder = YoloV1Decoder::new(model, labels)?;

    info!(
      "创建流水线: 输入 {}x{}, 模型输入 {}, 预处理 {:?}",
      input_width, input_height, model.input_size, mode
    );

    Ok(Self {
      input_dimensions: (input_width, input_height),
      converter: YuvConverter::new(input_width, input_height),
      rectifier: Rectifier::new(mode),
      rectified: RectifiedImage::new(model.input_size),
      engine,
      prediction: vec![0.0; model.prediction_len()].into_boxed_slice(),
      decoder,
    })
  }

  pub fn input_dimensions(&self) -> (u32, u32) {
    self.input_dimensions
  }

  pub fn config(&self) -> &YoloV1Config {
    self.decoder.config()
  }

  pub fn rectified(&self) -> &RectifiedImage {
    &self.rectified
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  pub fn engine_mut(&mut self) -> &mut E {
    &mut self.engine
  }

  /// 转换并预处理一帧，帧在转换完成后立即释放
  pub fn preprocess(
    &mut self,
    frame: SensorFrame,
    rotation: Rotation,
  ) -> Result<&RectifiedImage, PipelineError> {
    let actual = frame.dimensions();
    if actual != self.input_dimensions {
      return Err(PipelineError::DimensionMismatch {
        expected: self.input_dimensions,
        actual,
      });
    }

    let image = self.converter.convert(&frame)?;
    frame.release();

    self
      .rectifier
      .rectify(image, self.rectified.image_mut(), rotation)?;
    self.rectified.normalize();
    Ok(&self.rectified)
  }

  pub fn infer(&mut self) -> Result<(), PipelineError> {
    self
      .engine
      .run(self.rectified.tensor(), &mut self.prediction)?;
    Ok(())
  }

  pub fn decode(&mut self) -> Result<&[Detection], PipelineError> {
    Ok(self.decoder.decode(&self.prediction)?)
  }

  /// 同步处理一帧
  pub fn process(
    &mut self,
    frame: SensorFrame,
    rotation: Rotation,
  ) -> Result<FrameResult, PipelineError> {
    let index = frame.index();
    let overall = Instant::now();

    let started = Instant::now();
    self.preprocess(frame, rotation)?;
    let preprocess = started.elapsed();

    let started = Instant::now();
    self.infer()?;
    let inference = started.elapsed();

    let started = Instant::now();
    self.decode()?;
    let decode = started.elapsed();

    let timings = StageTimings {
      preprocess,
      inference,
      decode,
      overall: overall.elapsed(),
    };
    debug!("第 {} 帧处理耗时: {:?}", index, timings);

    Ok(FrameResult {
      index,
      detections: self.decoder.detections().to_vec(),
      fps: timings.fps(),
      timings,
    })
  }

  pub fn detections(&self) -> &[Detection] {
    self.decoder.detections()
  }

  /// 关闭推理引擎
  pub fn close(&mut self) {
    info!("关闭流水线");
    self.engine.close();
  }
}
