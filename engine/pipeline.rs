// ========================================================================================
//
//                      The ordered, bounded-concurrency marker pipeline
//
// ========================================================================================
//
// A sweep over the markers of one Gibbs iteration is a strictly sequential Markov
// chain: marker `j + 1` must see the residual left behind by marker `j`. Decoding a
// marker (decompression, parsing the sparse lists) is independent of the chain, so it
// runs ahead on a worker pool while a single consumer applies the updates in order.
//
//   dispatcher ──(job)──> workers ──(built marker)──> reorder buffer ──> consumer
//        ^                                                                  │
//        └──────────────────────────(token)─────────────────────────────────┘
//
// A marker holds a token from admission until it is consumed, which bounds the
// number of decoded markers alive at any time.

use crossbeam_channel::bounded;
use crossbeam_queue::ArrayQueue;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use thiserror::Error;

use crate::types::MarkerIndex;

/// Default number of markers admitted into the pipeline but not yet consumed.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 12;

pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

// ========================================================================================
//                          Public API, context & error handling
// ========================================================================================

/// Failures of the pipeline machinery itself. Failures of a build or of the
/// consumer are carried in the caller's own error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("a build worker panicked while decoding {marker}")]
    WorkerPanicked { marker: MarkerIndex },
    #[error("the build stage stopped after delivering {delivered} of {expected} markers")]
    Disconnected { delivered: usize, expected: usize },
    #[error("the pipeline needs at least one {what}, got zero")]
    ZeroCapacity { what: &'static str },
}

/// Sizing of one pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_in_flight: usize,
    pub workers: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            workers: num_cpus::get().max(1),
        }
    }
}

/// What a sweep observed, reported at debug level by the sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub consumed: usize,
    /// Highest number of admitted but unconsumed markers seen at once.
    pub peak_in_flight: usize,
    /// Highest number of completed builds parked in the reorder buffer.
    pub peak_reorder_depth: usize,
}

/// Streams `order` through `build` on a worker pool and hands the results to
/// `consume` strictly in `order`, one at a time, on the calling thread.
///
/// At most `limits.max_in_flight` markers are between admission and consumption.
/// The first error from either stage stops admissions, drains the workers and is
/// returned. There are no retries.
pub fn run_ordered<T, E, B, C>(
    order: &[MarkerIndex],
    limits: PipelineLimits,
    build: B,
    mut consume: C,
) -> Result<SweepStats, E>
where
    T: Send,
    E: Send + From<PipelineError>,
    B: Fn(MarkerIndex) -> Result<T, E> + Sync,
    C: FnMut(MarkerIndex, T) -> Result<(), E>,
{
    if limits.max_in_flight == 0 {
        return Err(PipelineError::ZeroCapacity {
            what: "in-flight token",
        }
        .into());
    }
    if limits.workers == 0 {
        return Err(PipelineError::ZeroCapacity {
            what: "build worker",
        }
        .into());
    }

    let mut stats = SweepStats::default();
    if order.is_empty() {
        return Ok(stats);
    }

    // --- 1. Setup ---
    let (token_tx, token_rx) = bounded::<()>(limits.max_in_flight);
    for _ in 0..limits.max_in_flight {
        // The receiver is alive and the channel has exactly this capacity.
        let _ = token_tx.send(());
    }
    let (job_tx, job_rx) = bounded::<(usize, MarkerIndex)>(limits.max_in_flight);
    let (done_tx, done_rx) = bounded::<(usize, Result<T, E>)>(limits.max_in_flight);
    let cancelled = AtomicBool::new(false);
    let in_flight = AtomicUsize::new(0);
    let peak_in_flight = AtomicUsize::new(0);

    let build = &build;
    let cancelled = &cancelled;
    let in_flight = &in_flight;
    let peak_in_flight = &peak_in_flight;

    let outcome = thread::scope(|s| {
        let mut handles = Vec::with_capacity(limits.workers + 1);

        // --- 2. Dispatcher: admits one marker per token ---
        handles.push(s.spawn(move || {
            for (seq, &marker) in order.iter().enumerate() {
                if token_rx.recv().is_err() || cancelled.load(Ordering::Acquire) {
                    break;
                }
                let now = in_flight.fetch_add(1, Ordering::AcqRel) + 1;
                peak_in_flight.fetch_max(now, Ordering::AcqRel);
                if job_tx.send((seq, marker)).is_err() {
                    break;
                }
            }
        }));

        // --- 3. Build workers ---
        for _ in 0..limits.workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            handles.push(s.spawn(move || {
                for (seq, marker) in job_rx.iter() {
                    if cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    // A panicking build still reports its slot, otherwise the
                    // consumer would wait forever for this sequence number.
                    let guard = ScopeGuard::new(|| {
                        if thread::panicking() {
                            cancelled.store(true, Ordering::Release);
                            let _ = done_tx.send((
                                seq,
                                Err(PipelineError::WorkerPanicked { marker }.into()),
                            ));
                        }
                    });
                    let built = build(marker);
                    drop(guard);
                    if done_tx.send((seq, built)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(job_rx);
        drop(done_tx);

        // --- 4. Ordered consumer on the calling thread ---
        let mut parked: BTreeMap<usize, T> = BTreeMap::new();
        let mut next = 0usize;
        let result = loop {
            if next == order.len() {
                break Ok(());
            }
            if let Some(item) = parked.remove(&next) {
                let consumed = consume(order[next], item);
                in_flight.fetch_sub(1, Ordering::AcqRel);
                if let Err(e) = consumed {
                    break Err(e);
                }
                next += 1;
                stats.consumed = next;
                let _ = token_tx.send(());
                continue;
            }
            match done_rx.recv() {
                Ok((seq, Ok(item))) => {
                    parked.insert(seq, item);
                    stats.peak_reorder_depth = stats.peak_reorder_depth.max(parked.len());
                }
                Ok((_, Err(e))) => break Err(e),
                Err(_) => {
                    break Err(PipelineError::Disconnected {
                        delivered: next,
                        expected: order.len(),
                    }
                    .into());
                }
            }
        };

        // --- 5. Teardown: unblock every stage so the scope can join ---
        cancelled.store(true, Ordering::Release);
        drop(token_tx);
        drop(done_rx);
        // Joined explicitly so a panicked worker surfaces as its reported error
        // rather than re-panicking at the end of the scope.
        for handle in handles {
            let _ = handle.join();
        }
        result
    });

    stats.peak_in_flight = peak_in_flight.load(Ordering::Acquire);
    outcome.map(|()| stats)
}

// ========================================================================================
//                                 Resource management
// ========================================================================================

/// A bounded, lock-free pool of column buffers shared by the build workers.
/// Buffers are recycled between markers but never carry data from one to the next.
#[derive(Debug)]
pub struct BufferPool {
    queue: ArrayQueue<Vec<f64>>,
    column_len: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, column_len: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            column_len,
        })
    }

    /// Takes a zeroed buffer of `column_len` elements, allocating if the pool is dry.
    pub fn take(self: &Arc<Self>) -> PooledBuffer {
        let mut buf = self
            .queue
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.column_len));
        buf.clear();
        buf.resize(self.column_len, 0.0);
        PooledBuffer {
            buffer: Some(buf),
            pool: Arc::clone(self),
        }
    }

    pub fn idle(&self) -> usize {
        self.queue.len()
    }
}

/// A RAII guard that returns its buffer to the pool when dropped, including when a
/// marker is dropped on an error path.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<f64>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f64] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            let _ = self.pool.queue.push(buf);
        }
    }
}

/// A general-purpose RAII guard that executes a closure when it goes out of scope,
/// whether by normal completion, early return or unwinding.
pub struct ScopeGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    #[inline(always)]
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    #[inline(always)]
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
