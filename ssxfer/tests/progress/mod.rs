//! Test helper that implements [`ssxfer::TransferProgressCallback`] which keeps a record of every
//! progress update in order so we can write tests that verify behavior of progress reporting
//! functionality.
use more_asserts::*;
use ssxfer::{TransferProgressCallback, WorkerId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not all of these are used in tests but we want to capture all fields for all events
pub(crate) enum TransferProgressEvent {
    TransferStarted {
        total_bytes: u64,
        total_parts: usize,
    },

    PartStarted {
        worker: WorkerId,
        part_number: u32,
        part_size: u64,
    },

    ChunkTransferred {
        worker: WorkerId,
        part_number: u32,
        chunk_size: usize,

        /// The aggregator's running total at the moment this chunk was reported
        total_transferred: u64,
        percent: f64,
    },

    PartCompleted {
        worker: WorkerId,
        part_number: u32,
        part_size: u64,
    },

    PartFailed {
        worker: WorkerId,
        part_number: u32,
    },

    TransferCompleted {
        total_bytes: u64,
    },
}

// Helper macro to reduce boilerplate when matching on specific events
macro_rules! with_match {
    ($var:ident, $matches:pat, $block:block) => {
        if let $matches = $var {
            $block
        } else {
            unreachable!(
                "{}",
                concat!(
                    stringify!($var),
                    " does not match expression ",
                    stringify!($matches)
                )
            )
        }
    };
}

#[derive(Clone)]
pub(crate) struct TestTransferProgressCallback {
    events: Arc<Mutex<Vec<TransferProgressEvent>>>,
}

impl TestTransferProgressCallback {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Review all updates after a job has run to successful completion, validating that the
    /// updates are all sane and match expected invariants.
    ///
    /// If the transfer didn't finish successfully then this check should not be applied.
    pub fn sanity_check_updates(&self) {
        let (total_bytes, total_parts) = self.transfer_started();

        // Every planned part must have started and completed exactly once, and none failed
        let (parts_started, part_bytes_started) = self.parts_started();
        let (parts_completed, part_bytes_completed) = self.parts_completed();

        assert_eq!(parts_started, total_parts);
        assert_eq!(parts_completed, total_parts);
        assert_eq!(part_bytes_started, total_bytes);
        assert_eq!(part_bytes_completed, total_bytes);
        assert!(self.parts_failed().is_empty());

        // The chunk-level reports must add up to the whole object
        let (chunk_reports, chunk_bytes) = self.chunks_transferred();
        assert_eq!(chunk_bytes, total_bytes);
        if total_bytes > 0 {
            assert_gt!(chunk_reports, 0);
        }

        // The aggregator never reports beyond the object size on a clean run, and must have
        // reached exactly the object size by the end
        assert_eq!(self.max_reported_total(), total_bytes);
        for event in self.filter_events(TransferProgressEventDiscriminants::ChunkTransferred) {
            with_match!(event, TransferProgressEvent::ChunkTransferred { percent, .. }, {
                assert_le!(percent, 100.0);
            });
        }

        // The final completion event agrees with everything else
        assert_eq!(self.transfer_completed(), total_bytes);
    }

    /// The total bytes and total parts reported in the single transfer started event
    pub fn transfer_started(&self) -> (u64, usize) {
        let event = self
            .filter_single_event(TransferProgressEventDiscriminants::TransferStarted)
            .unwrap();
        with_match!(
            event,
            TransferProgressEvent::TransferStarted {
                total_bytes,
                total_parts
            },
            { (total_bytes, total_parts) }
        )
    }

    /// The number of part started events, and the total size of all of them combined
    pub fn parts_started(&self) -> (usize, u64) {
        let events = self.filter_events(TransferProgressEventDiscriminants::PartStarted);
        let count = events.len();
        let sum = events
            .into_iter()
            .map(|event| {
                with_match!(event, TransferProgressEvent::PartStarted { part_size, .. }, {
                    part_size
                })
            })
            .sum();

        (count, sum)
    }

    /// The number of part completed events, and the total size of all of them combined
    pub fn parts_completed(&self) -> (usize, u64) {
        let events = self.filter_events(TransferProgressEventDiscriminants::PartCompleted);
        let count = events.len();
        let sum = events
            .into_iter()
            .map(|event| {
                with_match!(
                    event,
                    TransferProgressEvent::PartCompleted { part_size, .. },
                    { part_size }
                )
            })
            .sum();

        (count, sum)
    }

    /// The part numbers from all part failed events
    pub fn parts_failed(&self) -> Vec<u32> {
        self.filter_events(TransferProgressEventDiscriminants::PartFailed)
            .into_iter()
            .map(|event| {
                with_match!(event, TransferProgressEvent::PartFailed { part_number, .. }, {
                    part_number
                })
            })
            .collect()
    }

    /// The number of chunk transferred events, and the total size of all of them combined
    pub fn chunks_transferred(&self) -> (usize, u64) {
        let events = self.filter_events(TransferProgressEventDiscriminants::ChunkTransferred);
        let count = events.len();
        let sum = events
            .into_iter()
            .map(|event| {
                with_match!(
                    event,
                    TransferProgressEvent::ChunkTransferred { chunk_size, .. },
                    { chunk_size as u64 }
                )
            })
            .sum();

        (count, sum)
    }

    /// The highest running total any chunk event carried.
    ///
    /// Chunk events from concurrent workers can be recorded slightly out of order, so the
    /// maximum is meaningful where "the last event's total" would be racy.
    pub fn max_reported_total(&self) -> u64 {
        self.filter_events(TransferProgressEventDiscriminants::ChunkTransferred)
            .into_iter()
            .map(|event| {
                with_match!(
                    event,
                    TransferProgressEvent::ChunkTransferred {
                        total_transferred, ..
                    },
                    { total_transferred }
                )
            })
            .max()
            .unwrap_or(0)
    }

    /// The total bytes reported in the single transfer completed event
    pub fn transfer_completed(&self) -> u64 {
        let event = self
            .filter_single_event(TransferProgressEventDiscriminants::TransferCompleted)
            .unwrap();
        with_match!(
            event,
            TransferProgressEvent::TransferCompleted { total_bytes },
            { total_bytes }
        )
    }

    /// The distinct workers that reported any part or chunk event
    pub fn workers_seen(&self) -> HashSet<WorkerId> {
        let events = self.events.lock().unwrap();

        events
            .iter()
            .filter_map(|event| match event {
                TransferProgressEvent::PartStarted { worker, .. }
                | TransferProgressEvent::ChunkTransferred { worker, .. }
                | TransferProgressEvent::PartCompleted { worker, .. }
                | TransferProgressEvent::PartFailed { worker, .. } => Some(*worker),
                _ => None,
            })
            .collect()
    }

    /// Iterate over all events of a certain type
    pub fn filter_events(
        &self,
        typ: TransferProgressEventDiscriminants,
    ) -> Vec<TransferProgressEvent> {
        let events = self.events.lock().unwrap();

        events
            .iter()
            .filter(|event| {
                let event_typ: TransferProgressEventDiscriminants = (*event).into();

                event_typ == typ
            })
            .cloned()
            .collect::<Vec<_>>()
    }

    /// Get the single ocurrence of an event, if it can only appear 0 or 1 times.  If it appears
    /// more than this an assert is fired
    pub fn filter_single_event(
        &self,
        typ: TransferProgressEventDiscriminants,
    ) -> Option<TransferProgressEvent> {
        let mut events = self.filter_events(typ);

        assert!(
            events.len() <= 1,
            "Expected 0 or 1 instances of {:?}, but found {}",
            typ,
            events.len()
        );

        events.pop()
    }

    fn report_event(&self, event: TransferProgressEvent) {
        let mut events = self.events.lock().unwrap();

        events.push(event)
    }
}

impl std::fmt::Debug for TestTransferProgressCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Just use the inner `Vec`'s debug repr
        let events = self.events.lock().unwrap();
        events.fmt(f)
    }
}

impl TransferProgressCallback for TestTransferProgressCallback {
    fn transfer_started(&self, total_bytes: u64, total_parts: usize) {
        self.report_event(TransferProgressEvent::TransferStarted {
            total_bytes,
            total_parts,
        });
    }

    fn part_started(&self, worker: WorkerId, part_number: u32, part_size: u64) {
        self.report_event(TransferProgressEvent::PartStarted {
            worker,
            part_number,
            part_size,
        });
    }

    fn chunk_transferred(
        &self,
        worker: WorkerId,
        part_number: u32,
        chunk_size: usize,
        snapshot: &ssxfer::ProgressSnapshot,
    ) {
        self.report_event(TransferProgressEvent::ChunkTransferred {
            worker,
            part_number,
            chunk_size,
            total_transferred: snapshot.total_transferred,
            percent: snapshot.percent,
        });
    }

    fn part_completed(&self, worker: WorkerId, part_number: u32, part_size: u64) {
        self.report_event(TransferProgressEvent::PartCompleted {
            worker,
            part_number,
            part_size,
        });
    }

    fn part_failed(&self, worker: WorkerId, part_number: u32) {
        self.report_event(TransferProgressEvent::PartFailed {
            worker,
            part_number,
        });
    }

    fn transfer_completed(&self, total_bytes: u64) {
        self.report_event(TransferProgressEvent::TransferCompleted { total_bytes });
    }
}
