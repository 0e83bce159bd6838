//! # Batch Pool
//!
//! Bounded worker pool whose threads pin numeric parallelism to one on start-up, and a
//! batch loop over it. Every task is isolated: a panic or a missed deadline costs only that
//! task, which is replaced by the caller-supplied failure value.
//!
//! Each batch gets a fresh pool draining a shared queue. A task's timeout runs from the
//! moment a worker picks it up. A worker stuck past its deadline is abandoned: a replacement
//! worker takes over the rest of the queue, and the stuck thread dies with its pool once the
//! task finally returns.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::mpsc;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use tracing::info;
use tracing::warn;

use super::memory::MemoryGovernor;
use super::pin_numeric_threads;
use crate::config::SchedulerConfig;

/// Build a pool of `workers` threads, each running the single-threaded-numerics hook first.
pub fn build_pool(workers: usize) -> Result<ThreadPool> {
  ThreadPoolBuilder::new()
    .num_threads(workers.max(1))
    .thread_name(|i| format!("forecast-worker-{i}"))
    .start_handler(|_| pin_numeric_threads(1))
    .build()
    .context("failed to build forecast worker pool")
}

enum Event<O> {
  Started(usize, Instant),
  Finished(usize, Option<O>),
}

type Queue<I> = Arc<Mutex<VecDeque<(usize, I)>>>;

/// Spawn `workers` loops on `pool`, each popping tasks from `queue` until it is empty.
fn spawn_workers<I, O, F>(
  pool: &ThreadPool,
  workers: usize,
  queue: &Queue<I>,
  task: &Arc<F>,
  tx: &mpsc::Sender<Event<O>>,
) where
  I: Send + 'static,
  O: Send + 'static,
  F: Fn(I) -> O + Send + Sync + 'static,
{
  for _ in 0..workers {
    let queue = Arc::clone(queue);
    let task = Arc::clone(task);
    let tx = tx.clone();
    pool.spawn(move || {
      loop {
        let next = queue
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .pop_front();
        let Some((idx, input)) = next else {
          break;
        };
        if tx.send(Event::Started(idx, Instant::now())).is_err() {
          break;
        }
        let out = catch_unwind(AssertUnwindSafe(|| task(input))).ok();
        if tx.send(Event::Finished(idx, out)).is_err() {
          break;
        }
      }
    });
  }
}

/// Runs tasks in fixed-size batches with a per-task timeout.
#[derive(Clone, Debug)]
pub struct BatchScheduler {
  cfg: SchedulerConfig,
  governor: MemoryGovernor,
}

impl BatchScheduler {
  pub fn new(cfg: SchedulerConfig) -> Self {
    let governor = MemoryGovernor::new(cfg.high_water);
    Self { cfg, governor }
  }

  pub fn with_governor(cfg: SchedulerConfig, governor: MemoryGovernor) -> Self {
    Self { cfg, governor }
  }

  pub fn config(&self) -> &SchedulerConfig {
    &self.cfg
  }

  /// Apply `task` to every input and return outputs in input order.
  ///
  /// `progress(completed, total)` fires after each batch. Fails only when a worker pool
  /// cannot be built.
  pub fn run<I, O, F, P>(&self, inputs: Vec<I>, task: F, failed: O, mut progress: P) -> Result<Vec<O>>
  where
    I: Send + 'static,
    O: Clone + Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
    P: FnMut(usize, usize),
  {
    let total = inputs.len();
    if total == 0 {
      return Ok(Vec::new());
    }

    let workers = self.cfg.worker_count(total);
    let task = Arc::new(task);
    let batch_size = self.cfg.batch_size.max(1);
    info!(total, workers, batch_size, "starting batched forecasting");

    let mut outputs: Vec<Option<O>> = (0..total).map(|_| None).collect();
    let mut completed = 0;
    let mut inputs = inputs.into_iter().enumerate().peekable();

    while inputs.peek().is_some() {
      let batch: VecDeque<(usize, I)> = inputs.by_ref().take(batch_size).collect();
      let batch_len = batch.len();
      self.run_batch(batch, workers.min(batch_len), &task, &mut outputs)?;

      completed += batch_len;
      let utilization = self.governor.after_batch();
      info!(completed, total, ?utilization, "batch complete");
      progress(completed, total);
    }

    Ok(
      outputs
        .into_iter()
        .map(|o| o.unwrap_or_else(|| failed.clone()))
        .collect(),
    )
  }

  fn run_batch<I, O, F>(
    &self,
    batch: VecDeque<(usize, I)>,
    workers: usize,
    task: &Arc<F>,
    outputs: &mut [Option<O>],
  ) -> Result<()>
  where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
  {
    let timeout = self.cfg.task_timeout();
    let mut pending = batch.len();
    let queue: Queue<I> = Arc::new(Mutex::new(batch));
    let (tx, rx) = mpsc::channel::<Event<O>>();

    let mut pools = vec![build_pool(workers)?];
    spawn_workers(&pools[0], workers, &queue, task, &tx);

    let mut running: HashMap<usize, Instant> = HashMap::new();
    while pending > 0 {
      let wait = running
        .values()
        .min()
        .map(|started| (*started + timeout).saturating_duration_since(Instant::now()))
        .unwrap_or(timeout);

      match rx.recv_timeout(wait) {
        Ok(Event::Started(idx, at)) => {
          running.insert(idx, at);
        }
        Ok(Event::Finished(idx, out)) => {
          // Results of tasks already given up on are dropped.
          if running.remove(&idx).is_none() {
            continue;
          }
          pending -= 1;
          match out {
            Some(out) => outputs[idx] = Some(out),
            None => warn!(task = idx, "forecast task panicked, using neutral forecast"),
          }
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
          let now = Instant::now();
          let expired: Vec<usize> = running
            .iter()
            .filter(|(_, started)| now.saturating_duration_since(**started) >= timeout)
            .map(|(idx, _)| *idx)
            .collect();

          if expired.is_empty() && running.is_empty() {
            warn!(unfinished = pending, "no forecast worker responded, using neutral forecasts");
            break;
          }
          for idx in &expired {
            running.remove(idx);
            warn!(task = idx, timeout_ms = timeout.as_millis() as u64, "forecast task timed out, using neutral forecast");
          }
          pending -= expired.len();

          let queued = queue.lock().unwrap_or_else(PoisonError::into_inner).len();
          let replacements = expired.len().min(queued);
          if replacements > 0 {
            match build_pool(replacements) {
              Ok(pool) => {
                spawn_workers(&pool, replacements, &queue, task, &tx);
                pools.push(pool);
              }
              Err(err) => warn!(error = %err, "could not replace stuck forecast workers"),
            }
          }
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => break,
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::memory::MemoryProbe;
  use crate::scheduler::numeric_threads;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::thread;
  use std::time::Duration;

  struct Calm;

  impl MemoryProbe for Calm {
    fn utilization(&self) -> Option<f64> {
      Some(0.1)
    }
  }

  fn scheduler(batch_size: usize, timeout_ms: u64) -> BatchScheduler {
    let cfg = SchedulerConfig {
      batch_size,
      max_workers: 4,
      task_timeout_ms: timeout_ms,
      ..SchedulerConfig::default()
    };
    let governor = MemoryGovernor::new(cfg.high_water)
      .with_probe(Arc::new(Calm))
      .with_reclaim(Arc::new(|| {}));
    BatchScheduler::with_governor(cfg, governor)
  }

  #[test]
  fn outputs_keep_input_order_and_progress_is_monotone() {
    let sched = scheduler(3, 10_000);
    let mut seen = Vec::new();
    let out = sched
      .run(
        (0..8).collect::<Vec<u64>>(),
        |i| {
          thread::sleep(Duration::from_millis(8 - i));
          i * 10
        },
        u64::MAX,
        |done, total| seen.push((done, total)),
      )
      .unwrap();

    assert_eq!(out, (0..8).map(|i| i * 10).collect::<Vec<_>>());
    assert_eq!(seen, vec![(3, 8), (6, 8), (8, 8)]);
  }

  #[test]
  fn workers_run_single_threaded_numerics() {
    let sched = scheduler(4, 10_000);
    let out = sched
      .run(vec![(); 4], |_| numeric_threads(), 0, |_, _| {})
      .unwrap();
    assert!(out.iter().all(|n| *n == 1));
  }

  #[test]
  fn panics_and_timeouts_become_failure_values() {
    let sched = scheduler(4, 200);
    let out = sched
      .run(
        vec![0, 1, 2],
        |i: i32| match i {
          1 => panic!("model blew up"),
          2 => {
            thread::sleep(Duration::from_millis(2_000));
            2
          }
          _ => i,
        },
        -1,
        |_, _| {},
      )
      .unwrap();
    assert_eq!(out, vec![0, -1, -1]);
  }

  fn single_worker(batch_size: usize, timeout_ms: u64) -> BatchScheduler {
    let cfg = SchedulerConfig {
      batch_size,
      max_workers: 1,
      task_timeout_ms: timeout_ms,
      ..SchedulerConfig::default()
    };
    let governor = MemoryGovernor::new(cfg.high_water)
      .with_probe(Arc::new(Calm))
      .with_reclaim(Arc::new(|| {}));
    BatchScheduler::with_governor(cfg, governor)
  }

  fn hang_first(i: u64) -> u64 {
    if i == 0 {
      thread::sleep(Duration::from_millis(1_500));
    }
    i
  }

  #[test]
  fn hung_task_does_not_fail_later_batches() {
    let out = single_worker(1, 200)
      .run(vec![0, 1, 2], hang_first, u64::MAX, |_, _| {})
      .unwrap();
    assert_eq!(out, vec![u64::MAX, 1, 2]);
  }

  #[test]
  fn hung_task_does_not_fail_queued_tasks_in_its_batch() {
    let out = single_worker(3, 200)
      .run(vec![0, 1, 2], hang_first, u64::MAX, |_, _| {})
      .unwrap();
    assert_eq!(out, vec![u64::MAX, 1, 2]);
  }

  #[test]
  fn timeout_runs_from_task_start() {
    let out = single_worker(3, 400)
      .run(
        vec![1, 2, 3],
        |i: u64| {
          thread::sleep(Duration::from_millis(150));
          i
        },
        0,
        |_, _| {},
      )
      .unwrap();
    assert_eq!(out, vec![1, 2, 3]);
  }

  #[test]
  fn governor_runs_after_every_batch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let cfg = SchedulerConfig {
      batch_size: 2,
      ..SchedulerConfig::default()
    };
    let governor = MemoryGovernor::new(cfg.high_water)
      .with_probe(Arc::new(Calm))
      .with_reclaim(Arc::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
      }));
    let sched = BatchScheduler::with_governor(cfg, governor);
    sched.run(vec![1, 2, 3, 4, 5], |x: i32| x, 0, |_, _| {}).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }
}
