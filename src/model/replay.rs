// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/replay.rs - 回放录制的模型输出
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

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{EngineError, InferenceEngine},
};

/// 按顺序循环回放预先录制的预测向量
///
/// 录制文件为 JSON：单个数字数组表示一帧，数组的数组表示多帧。
#[derive(Debug, Clone)]
pub struct ReplayEngine {
  predictions: Vec<Vec<f32>>,
  cursor: usize,
  closed: bool,
}

impl FromUrlWithScheme for ReplayEngine {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayEngine {
  type Error = EngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(EngineError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let path = url.path();
    info!("加载回放文件: {}", path);
    let content = std::fs::read_to_string(path)?;
    let engine = Self::from_json_str(&content)?;
    info!("回放文件加载完成，共 {} 帧", engine.predictions.len());
    Ok(engine)
  }
}

fn parse_vector(value: &Value) -> Result<Vec<f32>, EngineError> {
  let array = value
    .as_array()
    .ok_or_else(|| EngineError::Format("预测必须是数组".to_string()))?;
  array
    .iter()
    .map(|v| {
      v.as_f64()
        .map(|f| f as f32)
        .ok_or_else(|| EngineError::Format(format!("无效的预测值: {}", v)))
    })
    .collect()
}

impl ReplayEngine {
  pub fn new(predictions: Vec<Vec<f32>>) -> Result<Self, EngineError> {
    if predictions.is_empty() {
      return Err(EngineError::Format("回放数据为空".to_string()));
    }
    Ok(Self {
      predictions,
      cursor: 0,
      closed: false,
    })
  }

  pub fn from_json_str(content: &str) -> Result<Self, EngineError> {
    let value: Value =
      serde_json::from_str(content).map_err(|e| EngineError::Format(e.to_string()))?;
    let frames = match value.as_array() {
      Some(items) if items.iter().all(Value::is_array) => {
        items.iter().map(parse_vector).collect::<Result<_, _>>()?
      }
      Some(_) => vec![parse_vector(&value)?],
      None => return Err(EngineError::Format("回放数据必须是数组".to_string())),
    };
    Self::new(frames)
  }

  pub fn len(&self) -> usize {
    self.predictions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.predictions.is_empty()
  }
}

impl InferenceEngine for ReplayEngine {
  fn run(&mut self, _input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
    if self.closed {
      return Err(EngineError::Closed);
    }

    let prediction = &self.predictions[self.cursor % self.predictions.len()];
    if prediction.len() != output.len() {
      return Err(EngineError::OutputLength {
        expected: output.len(),
        actual: prediction.len(),
      });
    }
    output.copy_from_slice(prediction);
    debug!("回放第 {} 帧预测", self.cursor);
    self.cursor = self.cursor.wrapping_add(1);
    Ok(())
  }

  fn close(&mut self) {
    if !self.closed {
      info!("关闭回放引擎");
      self.closed = true;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cycles_through_recorded_frames() {
    let mut engine = ReplayEngine::from_json_str("[[1, 2], [3.5, 4]]").unwrap();
    assert_eq!(engine.len(), 2);

    let mut output = [0.0; 2];
    let mut seen = Vec::new();
    for _ in 0..3 {
      engine.run(&[], &mut output).unwrap();
      seen.push(output);
    }
    assert_eq!(seen, vec![[1.0, 2.0], [3.5, 4.0], [1.0, 2.0]]);
  }

  #[test]
  fn single_vector_is_one_frame() {
    let engine = ReplayEngine::from_json_str("[0.25, 0.5, 0.75]").unwrap();
    assert_eq!(engine.len(), 1);
  }

  #[test]
  fn rejects_bad_recordings() {
    assert!(ReplayEngine::from_json_str("[]").is_err());
    assert!(ReplayEngine::from_json_str("{\"a\": 1}").is_err());
    assert!(ReplayEngine::from_json_str("[[1, \"x\"]]").is_err());

    let mut engine = ReplayEngine::from_json_str("[1, 2, 3]").unwrap();
    let mut output = [0.0; 2];
    assert!(matches!(
      engine.run(&[], &mut output),
      Err(EngineError::OutputLength {
        expected: 2,
        actual: 3
      })
    ));
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("file:///tmp/predictions.json").unwrap();
    assert!(matches!(
      ReplayEngine::from_url(&url),
      Err(EngineError::ModelPath(_))
    ));
  }
}
