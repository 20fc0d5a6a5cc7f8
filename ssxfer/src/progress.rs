//! Thread-safe accumulation of transfer progress, keyed by worker identity.
//!
//! Every worker in the pool reports the bytes it moves, one I/O increment at a time, to a single
//! [`ProgressAggregator`] scoped to the operation.  The aggregator keeps a per-worker byte count
//! and a running total, and can compute a percentage at any time via [`ProgressAggregator::snapshot`].
//!
//! Worker identity is passed explicitly into [`ProgressAggregator::report`] rather than derived
//! from thread-local state, so the same aggregator works whether parts run on spawned tasks or
//! sequentially on the caller's task.
use std::collections::HashMap;
use std::sync::Mutex;

/// Identity of one worker in the transfer pool.
///
/// Workers are numbered from 0 up to the pool size.  The sequential execution path always uses
/// worker 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A point-in-time copy of the progress counters, for external observation.
#[derive(Clone, Debug)]
pub struct ProgressSnapshot {
    /// Total bytes reported by all workers so far
    pub total_transferred: u64,

    /// The size of the object being transferred, fixed when the operation started
    pub target_size: u64,

    /// Bytes reported by each worker individually
    pub per_worker: HashMap<WorkerId, u64>,

    /// Percentage complete, clamped to `[0, 100]`.
    ///
    /// Clamping matters because a part that is retried after a partial failure can legitimately
    /// push the raw total past the target size.
    pub percent: f64,
}

#[derive(Debug, Default)]
struct ProgressState {
    total_transferred: u64,
    per_worker: HashMap<WorkerId, u64>,
}

/// Accumulates bytes transferred across all workers of a single operation.
///
/// A fresh aggregator is created per operation, scoped to that operation's object size.  It is
/// never reused.
#[derive(Debug)]
pub struct ProgressAggregator {
    target_size: u64,
    state: Mutex<ProgressState>,
}

impl ProgressAggregator {
    /// Create an aggregator for an object of `target_size` bytes.
    ///
    /// A target size of 0 means there is nothing to transfer, so the aggregator reports 100%
    /// complete from the start.
    pub fn new(target_size: u64) -> Self {
        Self {
            target_size,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Record `bytes_delta` more bytes transferred by `worker`.
    ///
    /// Adds to both the worker's own count and the running total, atomically with respect to
    /// other reporters.  Callers must not report the same bytes twice.
    pub fn report(&self, worker: WorkerId, bytes_delta: u64) {
        let mut state = self.state.lock().expect("BUG: progress lock poisoned");

        state.total_transferred += bytes_delta;
        *state.per_worker.entry(worker).or_insert(0) += bytes_delta;
    }

    /// Total bytes reported so far
    pub fn total_transferred(&self) -> u64 {
        let state = self.state.lock().expect("BUG: progress lock poisoned");

        state.total_transferred
    }

    /// Take a consistent copy of all counters, with the percentage computed.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock().expect("BUG: progress lock poisoned");

        let percent = if self.target_size == 0 {
            // Nothing to transfer means we're done before we started
            100.0
        } else {
            (state.total_transferred as f64 / self.target_size as f64 * 100.0).min(100.0)
        };

        ProgressSnapshot {
            total_transferred: state.total_transferred,
            target_size: self.target_size,
            per_worker: state.per_worker.clone(),
            percent,
        }
    }
}

/// A trait which callers can implement to get detailed progress updates as a transfer is
/// progressing.
///
/// All methods have empty default impls, so callers only implement the updates they care about.
/// The engine invokes these synchronously from the worker that made the progress, so
/// implementations should be quick about it.
#[allow(unused_variables)]
pub trait TransferProgressCallback: Sync + Send {
    /// The transfer is starting.  `total_bytes` is the full object size and `total_parts` the
    /// number of parts in the plan.
    fn transfer_started(&self, total_bytes: u64, total_parts: usize) {}

    /// A worker has claimed a part and is about to start moving its bytes
    fn part_started(&self, worker: WorkerId, part_number: u32, part_size: u64) {}

    /// A worker moved one I/O increment of a part.
    ///
    /// This fires for every physical read or write, not just at part boundaries, so percentage
    /// displays update smoothly even during very large parts.
    fn chunk_transferred(
        &self,
        worker: WorkerId,
        part_number: u32,
        chunk_size: usize,
        snapshot: &ProgressSnapshot,
    ) {
    }

    /// An entire part was transferred successfully
    fn part_completed(&self, worker: WorkerId, part_number: u32, part_size: u64) {}

    /// A part failed.  The error itself is reported through the transfer result, not here.
    fn part_failed(&self, worker: WorkerId, part_number: u32) {}

    /// The whole operation finished, successfully or not.  `total_bytes` is the number of bytes
    /// that were actually transferred.
    fn transfer_completed(&self, total_bytes: u64) {}
}
