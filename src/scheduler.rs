// 该文件是 Qianli （千里眼） 项目的一部分。
// src/scheduler.rs - 帧调度：忙时丢帧、后台工作线程与生命周期
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

//! 帧调度器
//!
//! 相机回调线程调用 [`FrameScheduler::on_frame`]，调度器同一时刻最多处理一帧，
//! 忙碌、暂停或关闭时到达的帧立即释放，不排队。被接纳的帧在专用工作线程上
//! 依次经过转换、预处理、推理和解码，结果交给唯一的 [`FrameObserver`]。

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::{RectifiedImage, Rotation, SensorFrame},
  pipeline::{Pipeline, PipelineError, StageTimings},
  model::InferenceEngine,
};

pub use crate::pipeline::FrameResult;

const MODE_ACTIVE: u8 = 0;
const MODE_PAUSED: u8 = 1;
const MODE_CLOSED: u8 = 2;
const MODE_MASK: u8 = 0b11;
const BUSY: u8 = 0b100;

const WORKER_NAME: &str = "qianli-pipeline";

#[derive(Error, Debug)]
pub enum SchedulerError {
  #[error("调度器已启动")]
  AlreadyPrepared,
  #[error("调度器未启动")]
  NotPrepared,
  #[error("不能在工作线程内关闭调度器")]
  ShutdownFromWorker,
  #[error("工作线程创建失败: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("工作线程异常退出")]
  WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
  Idle,
  Processing,
  Paused,
  Closed,
}

/// 根据显示方向和传感器方向计算送入模型前的旋转
pub fn frame_rotation(display: Rotation, sensor: Rotation) -> Rotation {
  match display {
    Rotation::Deg0 => sensor,
    Rotation::Deg90 => sensor.offset(-90),
    Rotation::Deg180 => sensor.offset(180),
    Rotation::Deg270 => sensor.offset(90),
  }
}

/// 叠加帧自带的旋转提示后计算送入模型前的旋转
///
/// 提示是采集时相对于配置显示方向的额外转动。
pub fn hinted_rotation(display: Rotation, sensor: Rotation, hint: Rotation) -> Rotation {
  frame_rotation(display.offset(hint.degrees()), sensor)
}

/// 流水线结果的唯一消费者，所有回调都在工作线程上执行
pub trait FrameObserver: Send {
  /// 预处理完成、推理开始前调用
  fn on_preprocessed(&mut self, _image: &RectifiedImage) {}

  fn on_result(&mut self, result: FrameResult);

  /// 会话级错误，调度器已进入关闭状态
  fn on_fatal(&mut self, _error: &PipelineError) {}
}

impl FrameObserver for Sender<FrameResult> {
  fn on_result(&mut self, result: FrameResult) {
    if self.send(result).is_err() {
      debug!("结果接收端已关闭");
    }
  }
}

/// 闭包观察者
pub struct FnObserver<F>(pub F);

impl<F: FnMut(FrameResult) + Send> FrameObserver for FnObserver<F> {
  fn on_result(&mut self, result: FrameResult) {
    (self.0)(result)
  }
}

/// 模式与忙碌位打包在一个原子变量中，只通过 CAS 迁移
#[derive(Debug)]
struct SchedulerShared {
  state: AtomicU8,
  // 低两位为显示方向，其上两位为传感器方向，单位为四分之一圈
  orientation: AtomicU8,
}

impl SchedulerShared {
  fn new() -> Self {
    Self {
      state: AtomicU8::new(MODE_CLOSED),
      orientation: AtomicU8::new(0),
    }
  }

  fn state(&self) -> SchedulerState {
    let raw = self.state.load(Ordering::Acquire);
    match raw & MODE_MASK {
      MODE_CLOSED => SchedulerState::Closed,
      MODE_PAUSED => SchedulerState::Paused,
      _ if raw & BUSY != 0 => SchedulerState::Processing,
      _ => SchedulerState::Idle,
    }
  }

  fn is_active(&self) -> bool {
    self.state.load(Ordering::Acquire) & MODE_MASK == MODE_ACTIVE
  }

  /// Idle -> Processing
  fn try_admit(&self) -> bool {
    self
      .state
      .compare_exchange(
        MODE_ACTIVE,
        MODE_ACTIVE | BUSY,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
  }

  fn finish(&self) {
    self.state.fetch_and(!BUSY, Ordering::AcqRel);
  }

  /// 在模式 `from` 下切换到 `to`，保留忙碌位
  fn transition(&self, from: Option<u8>, to: u8) -> bool {
    self
      .state
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
        let mode = raw & MODE_MASK;
        match from {
          Some(expected) if mode != expected => None,
          _ => Some((raw & BUSY) | to),
        }
      })
      .is_ok()
  }

  fn close(&self) -> bool {
    self.transition(None, MODE_CLOSED)
  }

  fn reopen(&self) -> bool {
    self
      .state
      .compare_exchange(
        MODE_CLOSED,
        MODE_ACTIVE,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
  }

  fn set_orientation(&self, display: Rotation, sensor: Rotation) {
    let packed = display.quarter_turns() as u8 | ((sensor.quarter_turns() as u8) << 2);
    self.orientation.store(packed, Ordering::Release);
  }

  fn orientation(&self) -> (Rotation, Rotation) {
    let packed = self.orientation.load(Ordering::Acquire) as i32;
    (
      Rotation::from_quarter_turns(packed & 0b11),
      Rotation::from_quarter_turns(packed >> 2),
    )
  }
}

/// 无论处理如何结束都清除忙碌位
struct BusyGuard<'a>(&'a SchedulerShared);

impl Drop for BusyGuard<'_> {
  fn drop(&mut self) {
    self.0.finish();
  }
}

struct Job {
  frame: SensorFrame,
  rotation: Rotation,
}

struct Worker<E> {
  sender: Sender<Job>,
  handle: JoinHandle<Pipeline<E>>,
}

pub struct FrameScheduler<E> {
  shared: Arc<SchedulerShared>,
  worker: Mutex<Option<Worker<E>>>,
}

impl<E> Default for FrameScheduler<E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<E> FrameScheduler<E> {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(SchedulerShared::new()),
      worker: Mutex::new(None),
    }
  }

  pub fn state(&self) -> SchedulerState {
    self.shared.state()
  }

  pub fn set_orientation(&self, display_rotation: Rotation, sensor_orientation: Rotation) {
    debug!("设置方向: 显示 {}, 传感器 {}", display_rotation, sensor_orientation);
    self.shared.set_orientation(display_rotation, sensor_orientation);
  }

  /// 当前方向下，带有给定旋转提示的帧送入模型前的旋转
  pub fn frame_rotation(&self, hint: Rotation) -> Rotation {
    let (display_rotation, sensor_orientation) = self.shared.orientation();
    hinted_rotation(display_rotation, sensor_orientation, hint)
  }

  pub fn pause(&self) -> bool {
    let paused = self.shared.transition(Some(MODE_ACTIVE), MODE_PAUSED);
    if paused {
      info!("调度器暂停");
    }
    paused
  }

  pub fn unpause(&self) -> bool {
    let resumed = self.shared.transition(Some(MODE_PAUSED), MODE_ACTIVE);
    if resumed {
      info!("调度器恢复");
    }
    resumed
  }

  /// 提交一帧，返回是否被接纳
  ///
  /// 未被接纳的帧在返回前释放。
  pub fn on_frame(&self, frame: SensorFrame) -> bool {
    if !self.shared.try_admit() {
      debug!("丢弃第 {} 帧: {:?}", frame.index(), self.shared.state());
      frame.release();
      return false;
    }

    let rotation = self.frame_rotation(frame.rotation());
    let job = Job { frame, rotation };

    let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
    let sent = match worker.as_ref() {
      Some(worker) => worker.sender.send(job).is_ok(),
      None => false,
    };
    drop(worker);

    if !sent {
      // 未送达的帧已随任务一起释放
      warn!("工作线程不可用，丢弃帧");
      self.shared.finish();
    }
    sent
  }
}

impl<E: InferenceEngine + 'static> FrameScheduler<E> {
  /// 启动工作线程并开始接收帧
  pub fn prepare(
    &self,
    pipeline: Pipeline<E>,
    observer: impl FrameObserver + 'static,
  ) -> Result<(), SchedulerError> {
    let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
    if worker.is_some() {
      return Err(SchedulerError::AlreadyPrepared);
    }

    let (sender, receiver) = mpsc::channel();
    let shared = Arc::clone(&self.shared);
    let handle = thread::Builder::new()
      .name(WORKER_NAME.to_string())
      .spawn(move || worker_loop(pipeline, observer, shared, receiver))?;

    *worker = Some(Worker { sender, handle });
    self.shared.reopen();
    info!("调度器启动");
    Ok(())
  }

  /// 关闭调度器并等待工作线程退出，返回流水线
  ///
  /// 返回后不会再有任何观察者回调。
  pub fn shutdown(&self) -> Result<Pipeline<E>, SchedulerError> {
    self.shared.close();

    let worker = {
      let mut guard = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
      let on_worker = guard
        .as_ref()
        .is_some_and(|w| w.handle.thread().id() == thread::current().id());
      if on_worker {
        return Err(SchedulerError::ShutdownFromWorker);
      }
      guard.take().ok_or(SchedulerError::NotPrepared)?
    };

    let Worker { sender, handle } = worker;
    drop(sender);
    let pipeline = handle.join().map_err(|_| SchedulerError::WorkerPanicked)?;
    info!("调度器关闭");
    Ok(pipeline)
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "未知错误".to_string()
  }
}

fn worker_loop<E, O>(
  mut pipeline: Pipeline<E>,
  mut observer: O,
  shared: Arc<SchedulerShared>,
  receiver: Receiver<Job>,
) -> Pipeline<E>
where
  E: InferenceEngine,
  O: FrameObserver,
{
  debug!("工作线程启动");
  for job in receiver {
    let _busy = BusyGuard(&shared);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
      run_job(&mut pipeline, &mut observer, &shared, job)
    }));

    let failure = match outcome {
      Ok(Ok(())) => continue,
      Ok(Err(e)) => e,
      Err(payload) => PipelineError::WorkerPanicked(panic_message(&*payload)),
    };

    if failure.is_fatal() {
      error!("流水线错误，会话终止: {}", failure);
      shared.close();
      let report = catch_unwind(AssertUnwindSafe(|| observer.on_fatal(&failure)));
      if report.is_err() {
        error!("观察者处理错误时崩溃");
      }
    } else {
      warn!("丢弃无效帧: {}", failure);
    }
  }
  debug!("工作线程退出");
  pipeline
}

fn run_job<E, O>(
  pipeline: &mut Pipeline<E>,
  observer: &mut O,
  shared: &SchedulerShared,
  job: Job,
) -> Result<(), PipelineError>
where
  E: InferenceEngine,
  O: FrameObserver,
{
  let Job { frame, rotation } = job;
  let index = frame.index();
  let overall = Instant::now();

  let started = Instant::now();
  let rectified = pipeline.preprocess(frame, rotation)?;
  let preprocess = started.elapsed();
  observer.on_preprocessed(rectified);

  if !shared.is_active() {
    debug!("第 {} 帧在推理前被取消: {:?}", index, shared.state());
    return Ok(());
  }

  let started = Instant::now();
  pipeline.infer()?;
  let inference = started.elapsed();

  let started = Instant::now();
  let detections = pipeline.decode()?.to_vec();
  let decode = started.elapsed();

  let timings = StageTimings {
    preprocess,
    inference,
    decode,
    overall: overall.elapsed(),
  };
  debug!(
    "第 {} 帧: 预处理 {:.2?}, 推理 {:.2?}, 解码 {:.2?}, 总计 {:.2?}",
    index, timings.preprocess, timings.inference, timings.decode, timings.overall
  );

  if !shared.is_active() {
    debug!("第 {} 帧结果被丢弃: {:?}", index, shared.state());
    return Ok(());
  }

  observer.on_result(FrameResult {
    index,
    detections,
    fps: timings.fps(),
    timings,
  });
  Ok(())
}
