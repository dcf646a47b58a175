// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model.rs - 模型
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
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

/// Pascal VOC 的 20 个类别
pub const VOC_LABELS: [&str; 20] = [
  "aeroplane",
  "bicycle",
  "bird",
  "boat",
  "bottle",
  "bus",
  "car",
  "cat",
  "chair",
  "cow",
  "diningtable",
  "dog",
  "horse",
  "motorbike",
  "person",
  "pottedplant",
  "sheep",
  "sofa",
  "train",
  "tvmonitor",
];

/// 一个检测结果，坐标为归一化到 [0, 1] 的模型输入坐标，不做截断
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
  pub confidence: f32,
  pub class_index: usize,
  pub label: Arc<str>,
}

impl Detection {
  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }
}

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("标签文件解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("标签文件必须是字符串数组")]
  NotStringArray,
}

/// 按类别下标排列的标签
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSet {
  labels: Arc<[Arc<str>]>,
}

impl Default for LabelSet {
  fn default() -> Self {
    Self::voc()
  }
}

impl LabelSet {
  pub fn new<I, S>(labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    Self {
      labels: labels.into_iter().map(|s| Arc::from(s.as_ref())).collect(),
    }
  }

  pub fn voc() -> Self {
    Self::new(VOC_LABELS)
  }

  /// 从 JSON 字符串数组解析，例如 `["cat", "dog"]`
  pub fn from_json_str(content: &str) -> Result<Self, LabelError> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    let array = value.as_array().ok_or(LabelError::NotStringArray)?;
    let labels = array
      .iter()
      .map(|v| v.as_str().ok_or(LabelError::NotStringArray))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self::new(labels))
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    info!("加载标签文件: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    Self::from_json_str(&content)
  }

  pub fn get(&self, index: usize) -> Option<&Arc<str>> {
    self.labels.get(index)
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<str>> {
    self.labels.iter()
  }
}

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("推理引擎已关闭")]
  Closed,
  #[error("输入长度不匹配: 期望 {expected}, 实际 {actual}")]
  InputLength { expected: usize, actual: usize },
  #[error("输出长度不匹配: 期望 {expected}, 实际 {actual}")]
  OutputLength { expected: usize, actual: usize },
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("模型加载错误: {0}")]
  Load(#[from] std::io::Error),
  #[error("模型格式错误: {0}")]
  Format(String),
  #[error("推理失败: {0}")]
  Failed(String),
}

/// 推理引擎：张量进，张量出
///
/// 输入为 NHWC 排列、归一化到 [-1, 1] 的 RGB 张量，输出为模型原始预测向量。
pub trait InferenceEngine: Send {
  fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError>;

  /// 释放引擎资源，之后的 `run` 应返回错误
  fn close(&mut self) {}
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
    (**self).run(input, output)
  }

  fn close(&mut self) {
    (**self).close()
  }
}

/// 闭包推理引擎
pub struct FnEngine<F> {
  f: F,
  closed: bool,
}

impl<F> FnEngine<F>
where
  F: FnMut(&[f32], &mut [f32]) -> Result<(), EngineError> + Send,
{
  pub fn new(f: F) -> Self {
    Self { f, closed: false }
  }
}

impl<F> InferenceEngine for FnEngine<F>
where
  F: FnMut(&[f32], &mut [f32]) -> Result<(), EngineError> + Send,
{
  fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
    if self.closed {
      return Err(EngineError::Closed);
    }
    (self.f)(input, output)
  }

  fn close(&mut self) {
    self.closed = true;
  }
}

mod replay;
mod yolo_v1;

pub use self::replay::ReplayEngine;
pub use self::yolo_v1::{DecodeError, SCORE_THRESHOLD, SIZE_EXPONENT, YoloV1Config, YoloV1Decoder};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_labels_are_voc() {
    let labels = LabelSet::default();
    assert_eq!(labels.len(), 20);
    assert_eq!(labels.get(14).map(|l| &**l), Some("person"));
    assert!(labels.get(20).is_none());
  }

  #[test]
  fn labels_load_from_json_array() {
    let labels = LabelSet::from_json_str(r#"["cat", "dog"]"#).unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.get(1).map(|l| &**l), Some("dog"));

    assert!(matches!(
      LabelSet::from_json_str(r#"{"cat": 1}"#),
      Err(LabelError::NotStringArray)
    ));
    assert!(matches!(
      LabelSet::from_json_str(r#"["cat", 2]"#),
      Err(LabelError::NotStringArray)
    ));
  }

  #[test]
  fn closed_fn_engine_refuses_to_run() {
    let mut engine = FnEngine::new(|_: &[f32], out: &mut [f32]| {
      out.fill(1.0);
      Ok(())
    });
    let mut output = [0.0; 2];
    engine.run(&[], &mut output).unwrap();
    assert_eq!(output, [1.0, 1.0]);

    engine.close();
    assert!(matches!(engine.run(&[], &mut output), Err(EngineError::Closed)));
  }
}
