// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/yolo_v1.rs - YOLO tiny v1 输出解码
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

use thiserror::Error;
use tracing::debug;

use crate::model::{Detection, LabelSet};

/// 综合得分阈值，得分不低于该值的框才会输出
pub const SCORE_THRESHOLD: f32 = 0.1;
/// 宽高的尺寸指数，`w = raw_w ^ SIZE_EXPONENT`
pub const SIZE_EXPONENT: f64 = 1.8;

const YOLO_V1_GRID_SIZE: usize = 7;
const YOLO_V1_CLASS_NUM: usize = 20;
const YOLO_V1_BOXES_PER_CELL: usize = 2;
const YOLO_V1_INPUT_SIZE: u32 = 448;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("预测向量长度不匹配: 期望 {expected}, 实际 {actual}")]
  PredictionLength { expected: usize, actual: usize },
  #[error("标签数量与类别数不匹配: 期望 {expected}, 实际 {actual}")]
  LabelCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YoloV1Config {
  pub grid_size: usize,
  pub num_classes: usize,
  pub boxes_per_cell: usize,
  pub input_size: u32,
}

impl Default for YoloV1Config {
  fn default() -> Self {
    Self {
      grid_size: YOLO_V1_GRID_SIZE,
      num_classes: YOLO_V1_CLASS_NUM,
      boxes_per_cell: YOLO_V1_BOXES_PER_CELL,
      input_size: YOLO_V1_INPUT_SIZE,
    }
  }
}

impl YoloV1Config {
  pub fn cells(&self) -> usize {
    self.grid_size * self.grid_size
  }

  /// 预测向量长度 `G*G*(C + B + 4B)`
  pub fn prediction_len(&self) -> usize {
    self.cells() * (self.num_classes + self.boxes_per_cell * 5)
  }

  pub fn max_detections(&self) -> usize {
    self.cells() * self.boxes_per_cell
  }

  /// 模型输入张量长度（RGB 三通道）
  pub fn input_len(&self) -> usize {
    self.input_size as usize * self.input_size as usize * 3
  }

  fn cell_size(&self) -> f32 {
    1.0 / self.grid_size as f32
  }
}

/// 首个最大值的下标与取值
fn argmax(values: &[f32]) -> (usize, f32) {
  let mut best = (0, f32::MIN);
  for (index, &value) in values.iter().enumerate() {
    if value > best.1 {
      best = (index, value);
    }
  }
  best
}

/// YOLO v1 网格输出解码器
///
/// 检测结果按行优先的槽位顺序 `(row * G + col) * B + b` 输出；
/// 每次解码替换上一帧的结果，不做非极大值抑制。
#[derive(Debug, Clone)]
pub struct YoloV1Decoder {
  config: YoloV1Config,
  labels: LabelSet,
  detections: Vec<Detection>,
}

impl YoloV1Decoder {
  pub fn new(config: YoloV1Config, labels: LabelSet) -> Result<Self, DecodeError> {
    if labels.len() != config.num_classes {
      return Err(DecodeError::LabelCount {
        expected: config.num_classes,
        actual: labels.len(),
      });
    }
    Ok(Self {
      detections: Vec::with_capacity(config.max_detections()),
      config,
      labels,
    })
  }

  pub fn config(&self) -> &YoloV1Config {
    &self.config
  }

  pub fn labels(&self) -> &LabelSet {
    &self.labels
  }

  /// 上一次解码的结果
  pub fn detections(&self) -> &[Detection] {
    &self.detections
  }

  pub fn take_detections(&mut self) -> Vec<Detection> {
    std::mem::replace(
      &mut self.detections,
      Vec::with_capacity(self.config.max_detections()),
    )
  }

  pub fn decode(&mut self, prediction: &[f32]) -> Result<&[Detection], DecodeError> {
    let YoloV1Config {
      grid_size,
      num_classes,
      boxes_per_cell,
      ..
    } = self.config;

    let expected = self.config.prediction_len();
    if prediction.len() != expected {
      return Err(DecodeError::PredictionLength {
        expected,
        actual: prediction.len(),
      });
    }

    let cells = self.config.cells();
    let (classes, rest) = prediction.split_at(cells * num_classes);
    let (confidences, coordinates) = rest.split_at(cells * boxes_per_cell);
    let cell_size = self.config.cell_size();

    self.detections.clear();
    for cell in 0..cells {
      let (class_index, class_probability) =
        argmax(&classes[cell * num_classes..(cell + 1) * num_classes]);
      let row = cell / grid_size;
      let col = cell % grid_size;

      for slot in 0..boxes_per_cell {
        let score = confidences[cell * boxes_per_cell + slot] * class_probability;
        if score < SCORE_THRESHOLD {
          continue;
        }

        let base = (cell * boxes_per_cell + slot) * 4;
        let [x, y, raw_w, raw_h] = [
          coordinates[base],
          coordinates[base + 1],
          coordinates[base + 2],
          coordinates[base + 3],
        ];
        let cx = col as f32 * cell_size + x * cell_size;
        let cy = row as f32 * cell_size + y * cell_size;
        let w = (raw_w as f64).powf(SIZE_EXPONENT) as f32;
        let h = (raw_h as f64).powf(SIZE_EXPONENT) as f32;

        // 标签数量在构造时已校验
        let Some(label) = self.labels.get(class_index) else {
          continue;
        };

        self.detections.push(Detection {
          left: cx - w / 2.0,
          top: cy - h / 2.0,
          right: cx + w / 2.0,
          bottom: cy + h / 2.0,
          confidence: score,
          class_index,
          label: label.clone(),
        });
      }
    }

    debug!("检测到 {} 个物体", self.detections.len());
    Ok(&self.detections)
  }
}
