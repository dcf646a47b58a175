// 该文件是 Qianli （千里眼） 项目的一部分。
// tests/scheduler_tests.rs - 帧调度器测试
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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbaImage;

use qianli::{
  frame::{RectifiedImage, Rotation},
  model::{EngineError, FnEngine, InferenceEngine},
  pipeline::{FrameResult, Pipeline, PipelineConfig, PipelineError},
  scheduler::{FnObserver, FrameObserver, FrameScheduler, SchedulerError, SchedulerState},
  source::PatternSource,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn pipeline<E: InferenceEngine>(engine: E) -> Pipeline<E> {
  Pipeline::new(PipelineConfig::new(16, 16), engine).unwrap()
}

fn zero_engine() -> FnEngine<impl FnMut(&[f32], &mut [f32]) -> Result<(), EngineError> + Send> {
  FnEngine::new(|_: &[f32], output: &mut [f32]| {
    output.fill(0.0);
    Ok(())
  })
}

fn wait_for_state<E>(scheduler: &FrameScheduler<E>, state: SchedulerState) {
  let started = Instant::now();
  while scheduler.state() != state {
    assert!(started.elapsed() < TIMEOUT, "等待状态 {:?} 超时", state);
    thread::sleep(Duration::from_millis(1));
  }
}

/// 把致命错误转发给测试线程
struct FatalObserver {
  results: Sender<FrameResult>,
  fatal: Sender<String>,
}

impl FrameObserver for FatalObserver {
  fn on_result(&mut self, result: FrameResult) {
    let _ = self.results.send(result);
  }

  fn on_fatal(&mut self, error: &PipelineError) {
    let _ = self.fatal.send(error.to_string());
  }
}

#[test]
fn busy_scheduler_drops_and_releases_frames() {
  let (gate_tx, gate_rx) = mpsc::channel::<()>();
  let (entered_tx, entered_rx) = mpsc::channel::<()>();
  let inferences = Arc::new(AtomicUsize::new(0));

  let engine = {
    let inferences = Arc::clone(&inferences);
    FnEngine::new(move |_: &[f32], output: &mut [f32]| {
      inferences.fetch_add(1, Ordering::SeqCst);
      let _ = entered_tx.send(());
      let _ = gate_rx.recv();
      output.fill(0.0);
      Ok(())
    })
  };

  let scheduler = FrameScheduler::new();
  let (results_tx, results_rx) = mpsc::channel();
  scheduler.prepare(pipeline(engine), results_tx).unwrap();

  let mut source = PatternSource::new(16, 16).unwrap().with_frames(3);
  let released = source.release_counter();

  assert!(scheduler.on_frame(source.next().unwrap()));
  entered_rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(scheduler.state(), SchedulerState::Processing);

  // 推理进行中到达的帧被丢弃并立即归还
  let before = released.load(Ordering::SeqCst);
  assert!(!scheduler.on_frame(source.next().unwrap()));
  assert_eq!(released.load(Ordering::SeqCst), before + 1);
  assert_eq!(inferences.load(Ordering::SeqCst), 1);

  gate_tx.send(()).unwrap();
  let first = results_rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(first.index, 0);
  assert!(first.detections.is_empty());
  wait_for_state(&scheduler, SchedulerState::Idle);

  gate_tx.send(()).unwrap();
  assert!(scheduler.on_frame(source.next().unwrap()));
  let third = results_rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(third.index, 2);

  let mut pipeline = scheduler.shutdown().unwrap();
  pipeline.close();
  assert_eq!(inferences.load(Ordering::SeqCst), 2);
  assert_eq!(released.load(Ordering::SeqCst), 3);
  assert!(results_rx.try_recv().is_err());
}

#[test]
fn no_observer_calls_after_shutdown() {
  let calls = Arc::new(AtomicUsize::new(0));
  let observer = {
    let calls = Arc::clone(&calls);
    FnObserver(move |_: FrameResult| {
      calls.fetch_add(1, Ordering::SeqCst);
    })
  };

  let scheduler = FrameScheduler::new();
  scheduler.prepare(pipeline(zero_engine()), observer).unwrap();

  let source = PatternSource::new(16, 16).unwrap();
  let released = source.release_counter();
  let started = Instant::now();
  let mut fed = 0;
  for frame in source {
    scheduler.on_frame(frame);
    fed += 1;
    if fed >= 50 && calls.load(Ordering::SeqCst) >= 1 {
      break;
    }
    assert!(started.elapsed() < TIMEOUT, "没有收到任何结果");
  }

  scheduler.shutdown().unwrap();
  assert_eq!(scheduler.state(), SchedulerState::Closed);
  let after_shutdown = calls.load(Ordering::SeqCst);
  assert!(after_shutdown >= 1);

  thread::sleep(Duration::from_millis(50));
  assert_eq!(calls.load(Ordering::SeqCst), after_shutdown);
  assert_eq!(released.load(Ordering::SeqCst), fed);

  // 关闭后提交的帧同样被归还
  let mut late = PatternSource::new(16, 16).unwrap();
  let late_released = late.release_counter();
  assert!(!scheduler.on_frame(late.next().unwrap()));
  assert_eq!(late_released.load(Ordering::SeqCst), 1);
  assert!(matches!(
    scheduler.shutdown(),
    Err(SchedulerError::NotPrepared)
  ));
}

#[test]
fn paused_scheduler_rejects_frames() {
  let scheduler = FrameScheduler::new();
  let (results_tx, results_rx) = mpsc::channel();
  scheduler.prepare(pipeline(zero_engine()), results_tx).unwrap();

  let mut source = PatternSource::new(16, 16).unwrap();
  let released = source.release_counter();

  assert!(scheduler.pause());
  assert_eq!(scheduler.state(), SchedulerState::Paused);
  assert!(!scheduler.on_frame(source.next().unwrap()));
  assert_eq!(released.load(Ordering::SeqCst), 1);
  assert!(results_rx.try_recv().is_err());

  assert!(scheduler.unpause());
  assert!(scheduler.on_frame(source.next().unwrap()));
  assert_eq!(results_rx.recv_timeout(TIMEOUT).unwrap().index, 1);

  scheduler.shutdown().unwrap();
}

#[test]
fn dimension_mismatch_closes_the_session() {
  let scheduler = FrameScheduler::new();
  let (results_tx, results_rx) = mpsc::channel();
  let (fatal_tx, fatal_rx) = mpsc::channel();
  scheduler
    .prepare(
      pipeline(zero_engine()),
      FatalObserver {
        results: results_tx,
        fatal: fatal_tx,
      },
    )
    .unwrap();

  let mut wrong = PatternSource::new(32, 16).unwrap();
  let released = wrong.release_counter();
  assert!(scheduler.on_frame(wrong.next().unwrap()));

  let message = fatal_rx.recv_timeout(TIMEOUT).unwrap();
  assert!(message.contains("(32, 16)"), "{}", message);
  wait_for_state(&scheduler, SchedulerState::Closed);
  assert_eq!(released.load(Ordering::SeqCst), 1);

  assert!(!scheduler.on_frame(wrong.next().unwrap()));
  assert!(scheduler.shutdown().is_ok());
  assert!(results_rx.try_recv().is_err());
  assert!(fatal_rx.try_recv().is_err());
}

#[test]
fn engine_failure_and_panic_are_fatal() {
  for panics in [false, true] {
    let engine = FnEngine::new(move |_: &[f32], _: &mut [f32]| {
      if panics {
        panic!("engine exploded");
      }
      Err(EngineError::Failed("boom".to_string()))
    });

    let scheduler = FrameScheduler::new();
    let (results_tx, _results_rx) = mpsc::channel();
    let (fatal_tx, fatal_rx) = mpsc::channel();
    scheduler
      .prepare(
        pipeline(engine),
        FatalObserver {
          results: results_tx,
          fatal: fatal_tx,
        },
      )
      .unwrap();

    let mut source = PatternSource::new(16, 16).unwrap();
    assert!(scheduler.on_frame(source.next().unwrap()));
    let message = fatal_rx.recv_timeout(TIMEOUT).unwrap();
    let expected = if panics { "engine exploded" } else { "boom" };
    assert!(message.contains(expected), "{}", message);

    wait_for_state(&scheduler, SchedulerState::Closed);
    // 工作线程捕获了崩溃，仍能正常回收流水线
    assert!(scheduler.shutdown().is_ok());
  }
}

struct ShutdownObserver<E> {
  scheduler: Arc<FrameScheduler<E>>,
  outcome: Sender<bool>,
}

impl<E: InferenceEngine + 'static> FrameObserver for ShutdownObserver<E> {
  fn on_result(&mut self, _result: FrameResult) {
    let refused = matches!(
      self.scheduler.shutdown(),
      Err(SchedulerError::ShutdownFromWorker)
    );
    let _ = self.outcome.send(refused);
  }
}

#[test]
fn shutdown_from_worker_is_refused() {
  let scheduler = Arc::new(FrameScheduler::new());
  let (outcome_tx, outcome_rx) = mpsc::channel();
  scheduler
    .prepare(
      pipeline(zero_engine()),
      ShutdownObserver {
        scheduler: Arc::clone(&scheduler),
        outcome: outcome_tx,
      },
    )
    .unwrap();

  let mut source = PatternSource::new(16, 16).unwrap();
  assert!(scheduler.on_frame(source.next().unwrap()));
  assert!(outcome_rx.recv_timeout(TIMEOUT).unwrap());

  // 工作线程内的关闭请求已把状态置为关闭
  assert_eq!(scheduler.state(), SchedulerState::Closed);
  assert!(scheduler.shutdown().is_ok());
}

#[test]
fn prepare_twice_is_rejected() {
  let scheduler = FrameScheduler::new();
  let (results_tx, _results_rx) = mpsc::channel();
  scheduler
    .prepare(pipeline(zero_engine()), results_tx.clone())
    .unwrap();
  assert!(matches!(
    scheduler.prepare(pipeline(zero_engine()), results_tx),
    Err(SchedulerError::AlreadyPrepared)
  ));
  scheduler.shutdown().unwrap();
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
  Pause,
  Shutdown,
}

/// 预处理完成后立即暂停或关闭调度器
struct InterruptingObserver<E> {
  scheduler: Arc<FrameScheduler<E>>,
  interrupt: Interrupt,
  preprocessed: Sender<()>,
  results: Sender<FrameResult>,
}

impl<E: InferenceEngine + 'static> FrameObserver for InterruptingObserver<E> {
  fn on_preprocessed(&mut self, _image: &RectifiedImage) {
    match self.interrupt {
      Interrupt::Pause => {
        assert!(self.scheduler.pause());
      }
      Interrupt::Shutdown => {
        let _ = self.scheduler.shutdown();
      }
    }
    let _ = self.preprocessed.send(());
  }

  fn on_result(&mut self, result: FrameResult) {
    let _ = self.results.send(result);
  }
}

fn interrupt_after_admission(interrupt: Interrupt) {
  let inferences = Arc::new(AtomicUsize::new(0));
  let engine = {
    let inferences = Arc::clone(&inferences);
    FnEngine::new(move |_: &[f32], output: &mut [f32]| {
      inferences.fetch_add(1, Ordering::SeqCst);
      output.fill(0.0);
      Ok(())
    })
  };

  let scheduler = Arc::new(FrameScheduler::new());
  let (preprocessed_tx, preprocessed_rx) = mpsc::channel();
  let (results_tx, results_rx) = mpsc::channel();
  scheduler
    .prepare(
      pipeline(engine),
      InterruptingObserver {
        scheduler: Arc::clone(&scheduler),
        interrupt,
        preprocessed: preprocessed_tx,
        results: results_tx,
      },
    )
    .unwrap();

  let mut source = PatternSource::new(16, 16).unwrap();
  let released = source.release_counter();
  assert!(scheduler.on_frame(source.next().unwrap()));
  preprocessed_rx.recv_timeout(TIMEOUT).unwrap();

  // 回收工作线程，确保已接纳的任务执行完毕
  let mut pipeline = scheduler.shutdown().unwrap();
  pipeline.close();
  assert_eq!(inferences.load(Ordering::SeqCst), 0, "{:?}", interrupt);
  assert!(results_rx.try_recv().is_err(), "{:?}", interrupt);
  assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn pause_after_admission_skips_inference() {
  interrupt_after_admission(Interrupt::Pause);
}

#[test]
fn shutdown_after_admission_skips_inference() {
  interrupt_after_admission(Interrupt::Shutdown);
}

struct RectifiedObserver(Sender<RgbaImage>);

impl FrameObserver for RectifiedObserver {
  fn on_preprocessed(&mut self, image: &RectifiedImage) {
    let _ = self.0.send(image.image().clone());
  }

  fn on_result(&mut self, _result: FrameResult) {}
}

fn rectified_with(display: Rotation, sensor: Rotation, hint: Rotation) -> RgbaImage {
  let scheduler = FrameScheduler::new();
  scheduler.set_orientation(display, sensor);
  let (image_tx, image_rx) = mpsc::channel();
  scheduler
    .prepare(pipeline(zero_engine()), RectifiedObserver(image_tx))
    .unwrap();

  let mut source = PatternSource::new(16, 16).unwrap().with_rotation(hint);
  assert!(scheduler.on_frame(source.next().unwrap()));
  let image = image_rx.recv_timeout(TIMEOUT).unwrap();
  scheduler.shutdown().unwrap();
  image
}

#[test]
fn frame_rotation_hint_reaches_the_rectifier() {
  let scheduler = FrameScheduler::<()>::new();
  scheduler.set_orientation(Rotation::Deg0, Rotation::Deg90);
  assert_eq!(scheduler.frame_rotation(Rotation::Deg0), Rotation::Deg90);
  assert_eq!(scheduler.frame_rotation(Rotation::Deg90), Rotation::Deg0);

  let upright = rectified_with(Rotation::Deg0, Rotation::Deg0, Rotation::Deg0);
  let hinted = rectified_with(Rotation::Deg0, Rotation::Deg0, Rotation::Deg90);
  let turned = rectified_with(Rotation::Deg90, Rotation::Deg0, Rotation::Deg0);
  assert!(hinted != upright);
  assert!(hinted == turned);
}
