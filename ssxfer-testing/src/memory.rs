//! A hermetic in-memory implementation of [`ObjectStorageClient`], so transfer tests can run
//! with no network, no credentials, and no S3-compatible server.
//!
//! Beyond just storing objects, the store instruments and perturbs the traffic in ways tests
//! need: counting calls, tracking how many part transfers are in flight at once, injecting
//! per-part failures, failing multipart finalization, and adding artificial latency.
use bytes::{Bytes, BytesMut};
use ssxfer::{CompletedPart, ObjectRef, ObjectStorageClient, Result, TransferError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Size of chunks on the channel returned by `get_range`
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,

    /// Parts uploaded so far, keyed by part number.  Ordered so assembly on completion is just a
    /// concatenation in iteration order.
    parts: BTreeMap<u32, Bytes>,
}

/// Call counters, all monotonically increasing over the store's lifetime
#[derive(Debug, Default)]
struct Counters {
    /// Every trait method call, of any kind
    total_calls: AtomicUsize,
    abort_calls: AtomicUsize,
    complete_calls: AtomicUsize,

    /// Part-level transfers (upload_part, put_object, get_range) currently executing
    in_flight: AtomicUsize,

    /// High water mark of `in_flight`
    max_in_flight: AtomicUsize,
}

/// In-memory object store holding a single bucket.
///
/// Clones share all state, so a test can keep one handle for assertions while the transfer
/// engine owns another.
#[derive(Clone, Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Arc<Mutex<StoreState>>,
    counters: Arc<Counters>,

    /// Part numbers whose `upload_part`/`put_object`/`get_range` calls fail with an injected
    /// error
    fail_parts: Arc<HashSet<u32>>,

    /// Whether `complete_multipart_upload` fails with an injected error
    fail_complete: bool,

    /// Artificial delay applied to each part-level call
    latency: Option<Duration>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(StoreState::default())),
            counters: Arc::new(Counters::default()),
            fail_parts: Arc::new(HashSet::new()),
            fail_complete: false,
            latency: None,
        }
    }

    /// Make the given part numbers fail when uploaded or downloaded
    pub fn fail_parts(mut self, parts: impl IntoIterator<Item = u32>) -> Self {
        self.fail_parts = Arc::new(parts.into_iter().collect());
        self
    }

    /// Make `complete_multipart_upload` fail
    pub fn fail_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    /// Delay every part-level call by `latency`, so tests can reliably interleave with an
    /// in-progress transfer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed an object directly into the store, for download tests
    pub fn put(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(key.into(), data.into());
    }

    /// The current contents of an object, if it exists
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state.objects.get(key).cloned()
    }

    /// Total calls made to any trait method
    pub fn total_calls(&self) -> usize {
        self.counters.total_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.counters.abort_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.counters.complete_calls.load(Ordering::SeqCst)
    }

    /// The highest number of part transfers that were ever executing at the same moment
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// Multipart uploads that were initiated but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.uploads.len()
    }

    fn called(&self) {
        self.counters.total_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn track_in_flight(&self) -> InFlightGuard {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);

        InFlightGuard {
            counters: Arc::clone(&self.counters),
        }
    }

    async fn apply_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_bucket(&self, bucket: &str) -> Result<()> {
        if bucket == self.bucket {
            Ok(())
        } else {
            Err(TransferError::StorageClient {
                message: format!("no such bucket '{bucket}'"),
            })
        }
    }
}

struct InFlightGuard {
    counters: Arc<Counters>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ObjectStorageClient for MemoryObjectStore {
    async fn validate_bucket(&self, bucket: &str) -> Result<()> {
        self.called();
        self.check_bucket(bucket)
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<u64> {
        self.called();
        self.check_bucket(&object.bucket)?;

        let state = self.state.lock().unwrap();

        state
            .objects
            .get(&object.key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| TransferError::ObjectNotFound {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            })
    }

    async fn get_range(
        &self,
        object: &ObjectRef,
        byte_range: Range<u64>,
    ) -> Result<mpsc::Receiver<Result<Bytes>>> {
        self.called();
        self.check_bucket(&object.bucket)?;

        let guard = self.track_in_flight();
        self.apply_latency().await;

        // The requested range's part number isn't known here, so failure injection keys off the
        // range start divided by the range length, which matches the planner's fixed-size layout
        let part_number = if byte_range.end > byte_range.start {
            (byte_range.start / (byte_range.end - byte_range.start)) as u32
        } else {
            0
        };

        let data = {
            let state = self.state.lock().unwrap();

            let data = state.objects.get(&object.key).cloned().ok_or_else(|| {
                TransferError::ObjectNotFound {
                    bucket: object.bucket.clone(),
                    key: object.key.clone(),
                }
            })?;

            assert!(
                byte_range.end <= data.len() as u64,
                "range {byte_range:?} exceeds object size {}",
                data.len()
            );

            data.slice(byte_range.start as usize..byte_range.end as usize)
        };

        let fail = self.fail_parts.contains(&part_number);
        let latency = self.latency;
        let object = object.clone();
        let (sender, receiver) = mpsc::channel(4);

        tokio::spawn(async move {
            // Hold the in-flight count until the whole range has been streamed
            let _guard = guard;

            let mut offset = 0usize;
            while offset < data.len() {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }

                // Inject the failure partway through the stream, after some bytes have already
                // been delivered, to exercise partial-download accounting
                if fail && offset > 0 {
                    debug!(%object, "injecting mid-stream read failure");
                    let _ = sender
                        .send(Err(TransferError::StorageClient {
                            message: format!("injected read failure for '{object}'"),
                        }))
                        .await;
                    return;
                }

                let end = (offset + CHUNK_SIZE).min(data.len());
                if sender.send(Ok(data.slice(offset..end))).await.is_err() {
                    return;
                }
                offset = end;
            }

            // A failing range of a single chunk still has to fail
            if fail {
                let _ = sender
                    .send(Err(TransferError::StorageClient {
                        message: format!("injected read failure for '{object}'"),
                    }))
                    .await;
            }
        });

        Ok(receiver)
    }

    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        self.called();
        self.check_bucket(&object.bucket)?;

        let _guard = self.track_in_flight();
        self.apply_latency().await;

        if self.fail_parts.contains(&0) {
            return Err(TransferError::StorageClient {
                message: format!("injected put failure for '{object}'"),
            });
        }

        let mut state = self.state.lock().unwrap();
        state.objects.insert(object.key.clone(), data);

        Ok(())
    }

    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        self.called();
        self.check_bucket(&object.bucket)?;

        let mut state = self.state.lock().unwrap();

        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);

        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: object.key.clone(),
                parts: BTreeMap::new(),
            },
        );

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        self.called();
        self.check_bucket(&object.bucket)?;

        let _guard = self.track_in_flight();
        self.apply_latency().await;

        if self.fail_parts.contains(&part_number) {
            debug!(part_number, "injecting part upload failure");
            return Err(TransferError::StorageClient {
                message: format!("injected upload failure for part {part_number}"),
            });
        }

        let etag = format!("etag-{part_number}-{}", data.len());

        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .unwrap_or_else(|| panic!("upload_part for unknown upload ID '{upload_id}'"));

        assert_eq!(upload.key, object.key, "part uploaded to the wrong key");
        upload.parts.insert(part_number, data);

        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        self.called();
        self.counters.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_bucket(&object.bucket)?;

        if self.fail_complete {
            debug!("injecting completion failure");
            return Err(TransferError::StorageClient {
                message: "injected completion failure".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .remove(upload_id)
            .unwrap_or_else(|| panic!("complete for unknown upload ID '{upload_id}'"));

        // Every part the caller claims to have uploaded must actually be here, with the etag
        // this store handed out
        assert_eq!(
            parts.len(),
            upload.parts.len(),
            "completion names a different number of parts than were uploaded"
        );
        for part in &parts {
            let data = upload
                .parts
                .get(&part.part_number)
                .unwrap_or_else(|| panic!("completion names part {} which was never uploaded", part.part_number));
            assert_eq!(
                part.etag,
                format!("etag-{}-{}", part.part_number, data.len()),
                "completion carries the wrong etag for part {}",
                part.part_number
            );
        }

        let mut assembled = BytesMut::new();
        for data in upload.parts.values() {
            assembled.extend_from_slice(data);
        }

        state.objects.insert(upload.key, assembled.freeze());

        Ok(())
    }

    async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.called();
        self.counters.abort_calls.fetch_add(1, Ordering::SeqCst);
        self.check_bucket(&object.bucket)?;

        let mut state = self.state.lock().unwrap();
        state.uploads.remove(upload_id);

        Ok(())
    }
}
