// 该文件是 Qianli （千里眼） 项目的一部分。
// src/task.rs - 检测任务
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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::{thread, time::Duration};

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::{
  frame::{RectifiedImage, Rotation},
  model::InferenceEngine,
  overlay::{OverlayRenderer, RenderSurface},
  pipeline::{FrameResult, Pipeline, PipelineError},
  scheduler::{FrameObserver, FrameScheduler, SchedulerState, hinted_rotation},
  source::FrameSource,
};

// 等待工作线程空闲时的轮询间隔
const IDLE_POLL: Duration = Duration::from_millis(1);

pub trait Task<S, E, R>: Sized {
  type Error;
  fn run_task(
    self,
    source: S,
    pipeline: Pipeline<E>,
    renderer: Arc<OverlayRenderer<R>>,
  ) -> Result<TaskSummary, Self::Error>;
}

/// 任务结束时的帧计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSummary {
  /// 从输入取出的帧
  pub submitted: u64,
  /// 被调度器接纳的帧
  pub accepted: u64,
  /// 产生结果的帧
  pub completed: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OneShotTask {
  display: Rotation,
  sensor: Rotation,
}

impl OneShotTask {
  pub fn with_orientation(mut self, display: Rotation, sensor: Rotation) -> Self {
    self.display = display;
    self.sensor = sensor;
    self
  }
}

impl<S, E, R> Task<S, E, R> for OneShotTask
where
  S: FrameSource,
  E: InferenceEngine,
  R: RenderSurface,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut source: S,
    mut pipeline: Pipeline<E>,
    renderer: Arc<OverlayRenderer<R>>,
  ) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    let frame = source.next().ok_or_else(|| anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");

    let rotation = hinted_rotation(self.display, self.sensor, frame.rotation());
    let result = pipeline.process(frame, rotation);
    pipeline.close();
    let result = result?;
    info!(
      "推理完成，耗时: {:.2?}（预处理 {:.2?}，推理 {:.2?}，解码 {:.2?}）",
      result.timings.overall,
      result.timings.preprocess,
      result.timings.inference,
      result.timings.decode
    );

    renderer.surface().underlay(pipeline.rectified().image());
    if renderer.draw(&result.detections) {
      info!("渲染完成，共 {} 个目标", result.detections.len());
    }
    for detection in &result.detections {
      info!(
        "{} {:.2} [{:.3}, {:.3}, {:.3}, {:.3}]",
        detection.label,
        detection.confidence,
        detection.left,
        detection.top,
        detection.right,
        detection.bottom
      );
    }

    Ok(TaskSummary {
      submitted: 1,
      accepted: 1,
      completed: 1,
    })
  }
}

/// 在工作线程上把结果画到叠加层
struct RenderObserver<R> {
  renderer: Arc<OverlayRenderer<R>>,
  completed: Arc<AtomicU64>,
  fatal: Arc<Mutex<Option<String>>>,
}

impl<R: RenderSurface> FrameObserver for RenderObserver<R> {
  fn on_preprocessed(&mut self, image: &RectifiedImage) {
    self.renderer.surface().underlay(image.image());
  }

  fn on_result(&mut self, result: FrameResult) {
    info!(
      "第 {} 帧: {} 个目标, {:.1} fps",
      result.index,
      result.detections.len(),
      result.fps
    );
    self.renderer.draw(&result.detections);
    self.completed.fetch_add(1, Ordering::AcqRel);
  }

  fn on_fatal(&mut self, error: &PipelineError) {
    let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
    *fatal = Some(error.to_string());
  }
}

#[derive(Debug)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
  display: Rotation,
  sensor: Rotation,
  handle_interrupt: bool,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      display: Rotation::Deg0,
      sensor: Rotation::Deg0,
      handle_interrupt: true,
    }
  }
}

impl ContinuousTask {
  /// 接纳指定帧数后结束
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_orientation(mut self, display: Rotation, sensor: Rotation) -> Self {
    self.display = display;
    self.sensor = sensor;
    self
  }

  /// 是否注册 Ctrl-C 处理，一个进程只能注册一次
  pub fn with_interrupt(mut self, handle_interrupt: bool) -> Self {
    self.handle_interrupt = handle_interrupt;
    self
  }

  fn interrupt_channel(&self) -> Result<Option<Receiver<()>>, ctrlc::Error> {
    if !self.handle_interrupt {
      return Ok(None);
    }
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    Ok(Some(rx))
  }
}

fn wait_while_processing<E>(scheduler: &FrameScheduler<E>) {
  while scheduler.state() == SchedulerState::Processing {
    thread::sleep(IDLE_POLL);
  }
}

impl<S, E, R> Task<S, E, R> for ContinuousTask
where
  S: FrameSource,
  E: InferenceEngine + 'static,
  R: RenderSurface + 'static,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    source: S,
    pipeline: Pipeline<E>,
    renderer: Arc<OverlayRenderer<R>>,
  ) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    let interrupt = self.interrupt_channel()?;
    // 没有帧率的输入按工作线程的节奏送帧
    let paced = source.fps().is_some();

    let completed = Arc::new(AtomicU64::new(0));
    let fatal = Arc::new(Mutex::new(None));
    let scheduler = FrameScheduler::new();
    scheduler.set_orientation(self.display, self.sensor);
    scheduler.prepare(
      pipeline,
      RenderObserver {
        renderer,
        completed: Arc::clone(&completed),
        fatal: Arc::clone(&fatal),
      },
    )?;

    let mut summary = TaskSummary::default();
    for frame in source {
      if !paced {
        wait_while_processing(&scheduler);
      }
      if scheduler.state() == SchedulerState::Closed {
        warn!("调度器已关闭，退出任务循环");
        break;
      }

      summary.submitted += 1;
      if scheduler.on_frame(frame) {
        summary.accepted += 1;
      }

      if self.frame_number.is_some_and(|n| summary.accepted >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.accepted);
        break;
      }
      if interrupt.as_ref().is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    wait_while_processing(&scheduler);
    let mut pipeline = scheduler.shutdown()?;
    pipeline.close();

    summary.completed = completed.load(Ordering::Acquire);
    debug!("任务统计: {:?}", summary);

    let fatal = fatal.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(message) = fatal {
      return Err(anyhow!("流水线错误: {}", message));
    }
    info!(
      "任务完成，退出: 输入 {} 帧，处理 {} 帧",
      summary.submitted, summary.completed
    );
    Ok(summary)
  }
}
