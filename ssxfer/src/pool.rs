//! Executes the parts of a [`TransferPlan`], either on a pool of spawned worker tasks or
//! sequentially on the calling task.
//!
//! The pool is work-stealing in the simplest possible sense: all parts go into a shared queue and
//! each worker pulls the next part whenever it finishes one, so a slow part never stalls the
//! others behind it.  Workers have stable identities for the lifetime of the operation, which is
//! what makes the per-worker byte counts in [`crate::ProgressSnapshot`] meaningful.
//!
//! Every part is attempted exactly once.  A failed part doesn't stop the other workers; the
//! caller decides what a partial failure means once all parts have been resolved.
use crate::error::{self, TransferError};
use crate::objstore::{ObjectRef, ObjectStorageClient};
use crate::planner::{PartSpec, TransferPlan};
use crate::progress::{ProgressAggregator, TransferProgressCallback, WorkerId};
use crate::{Config, Result};
use bytes::BytesMut;
use snafu::{IntoError, ResultExt};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, Instrument};

/// The size of one physical I/O increment when reading a source file or writing a target file.
///
/// Progress is reported once per increment, so this also bounds how stale a progress display can
/// get in the middle of a large part.
pub(crate) const IO_CHUNK_SIZE: usize = 64 * 1024;

/// What kind of storage operation each part performs.
#[derive(Clone, Debug)]
pub(crate) enum TransferMode {
    /// Upload the whole object with a single `PutObject`-style call.  The plan is guaranteed to
    /// have exactly one part in this mode.
    PutObject,

    /// Upload each part with the multipart API, under an already-initiated upload
    MultipartUpload { upload_id: String },

    /// Download each part with a ranged read, into a pre-allocated local file
    Download,
}

/// Everything a worker needs to transfer parts, shared by all workers of one operation.
pub(crate) struct PartContext {
    pub client: Box<dyn ObjectStorageClient>,
    pub object: ObjectRef,
    pub local_path: PathBuf,
    pub mode: TransferMode,
}

/// The outcome of one part's single attempt.
#[derive(Debug)]
pub(crate) struct PartResult {
    pub part_number: u32,

    /// The worker that claimed this part
    pub worker: WorkerId,

    /// Bytes attributable to this part in the final accounting.
    ///
    /// For a successful part this is the part length.  For a failed upload it's 0, since the
    /// storage system didn't durably take any of it.  For a failed download it's however many
    /// bytes actually landed in the target file before the failure.
    pub bytes_transferred: u64,

    /// The etag of the uploaded part, only present for successful multipart uploads
    pub etag: Option<String>,

    /// The error, if the part failed
    pub error: Option<TransferError>,
}

impl PartResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Transfer every part of the plan, returning one result per part sorted by part number.
///
/// When concurrency is enabled and the plan has more than one part, `min(max_concurrent_requests,
/// num_parts)` worker tasks are spawned and pull parts from a shared queue.  Otherwise the parts
/// run one at a time right here on the calling task, with no tasks spawned at all, and all
/// progress attributed to worker 0.
///
/// This function itself is infallible; per-part failures are carried in the results.
pub(crate) async fn execute(
    plan: &TransferPlan,
    context: Arc<PartContext>,
    aggregator: Arc<ProgressAggregator>,
    progress: Arc<dyn TransferProgressCallback>,
    config: &Config,
    cancel: CancellationToken,
) -> Vec<PartResult> {
    let num_workers = config.max_concurrent_requests.min(plan.num_parts());

    if !config.use_concurrency || num_workers <= 1 {
        debug!(
            num_parts = plan.num_parts(),
            "Transferring parts sequentially"
        );

        let worker = WorkerId::new(0);
        let mut results = Vec::with_capacity(plan.num_parts());

        for part in plan.parts() {
            results.push(run_part(worker, *part, &context, &aggregator, &*progress, &cancel).await);
        }

        return results;
    }

    debug!(
        num_workers,
        num_parts = plan.num_parts(),
        "Transferring parts on worker pool"
    );

    let queue: Arc<Mutex<VecDeque<PartSpec>>> =
        Arc::new(Mutex::new(plan.parts().iter().copied().collect()));

    let workers = (0..num_workers as u32)
        .map(|id| {
            let worker = WorkerId::new(id);
            let queue = Arc::clone(&queue);
            let context = Arc::clone(&context);
            let aggregator = Arc::clone(&aggregator);
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();

            tokio::spawn(
                async move {
                    let mut results = Vec::new();

                    loop {
                        // Don't hold the queue lock across the await
                        let part = {
                            let mut queue = queue.lock().expect("BUG: part queue lock poisoned");
                            queue.pop_front()
                        };

                        let Some(part) = part else {
                            break;
                        };

                        results.push(
                            run_part(worker, part, &context, &aggregator, &*progress, &cancel)
                                .await,
                        );
                    }

                    results
                }
                .instrument(tracing::debug_span!("transfer_worker", %worker)),
            )
        })
        .collect::<Vec<_>>();

    let mut results = Vec::with_capacity(plan.num_parts());
    for worker_results in futures::future::join_all(workers).await {
        results.extend(worker_results.expect("BUG: transfer worker panicked"));
    }

    results.sort_unstable_by_key(|result| result.part_number);

    results
}

/// Attempt one part, translating the outcome into a [`PartResult`] and firing the part-level
/// progress callbacks.
async fn run_part(
    worker: WorkerId,
    part: PartSpec,
    context: &PartContext,
    aggregator: &ProgressAggregator,
    progress: &dyn TransferProgressCallback,
    cancel: &CancellationToken,
) -> PartResult {
    progress.part_started(worker, part.part_number, part.length);

    match transfer_part(worker, part, context, aggregator, progress, cancel).await {
        Ok((bytes_transferred, etag)) => {
            progress.part_completed(worker, part.part_number, part.length);

            PartResult {
                part_number: part.part_number,
                worker,
                bytes_transferred,
                etag,
                error: None,
            }
        }
        Err((bytes_transferred, e)) => {
            error!(%worker, part_number = part.part_number, error = %e, "Part transfer failed");
            progress.part_failed(worker, part.part_number);

            PartResult {
                part_number: part.part_number,
                worker,
                bytes_transferred,
                etag: None,
                error: Some(e),
            }
        }
    }
}

/// Move one part's bytes in whichever direction the mode dictates.
///
/// On success yields the bytes transferred and the part's etag (for multipart uploads only).  On
/// failure yields the bytes that still count toward the accounting, paired with the error.
#[instrument(
    skip(context, aggregator, progress, cancel),
    fields(part_number = part.part_number, offset = part.offset, length = part.length)
)]
async fn transfer_part(
    worker: WorkerId,
    part: PartSpec,
    context: &PartContext,
    aggregator: &ProgressAggregator,
    progress: &dyn TransferProgressCallback,
    cancel: &CancellationToken,
) -> Result<(u64, Option<String>), (u64, TransferError)> {
    if cancel.is_cancelled() {
        return Err((
            0,
            error::TimeoutSnafu {
                part_number: part.part_number,
            }
            .build(),
        ));
    }

    match &context.mode {
        TransferMode::PutObject => {
            let data = match read_source_part(worker, part, context, aggregator, progress, cancel)
                .await
            {
                Ok(data) => data,
                Err(e) => return Err((0, e)),
            };

            match context.client.put_object(&context.object, data).await {
                Ok(()) => Ok((part.length, None)),
                Err(e) => Err((0, e)),
            }
        }
        TransferMode::MultipartUpload { upload_id } => {
            let data = match read_source_part(worker, part, context, aggregator, progress, cancel)
                .await
            {
                Ok(data) => data,
                Err(e) => return Err((0, e)),
            };

            match context
                .client
                .upload_part(&context.object, upload_id, part.part_number, data)
                .await
            {
                Ok(etag) => Ok((part.length, Some(etag))),
                Err(e) => Err((0, e)),
            }
        }
        TransferMode::Download => {
            write_target_part(worker, part, context, aggregator, progress, cancel).await
        }
    }
}

/// Read this part's byte range out of the local source file, one I/O increment at a time,
/// reporting progress as it goes.
///
/// Each worker opens its own file handle, so concurrent workers never contend over a shared seek
/// position.
async fn read_source_part(
    worker: WorkerId,
    part: PartSpec,
    context: &PartContext,
    aggregator: &ProgressAggregator,
    progress: &dyn TransferProgressCallback,
    cancel: &CancellationToken,
) -> Result<bytes::Bytes> {
    let path = &context.local_path;

    let mut file = File::open(path)
        .await
        .with_context(|_| error::ReadingSourceFileSnafu { path: path.clone() })?;
    file.seek(SeekFrom::Start(part.offset))
        .await
        .with_context(|_| error::ReadingSourceFileSnafu { path: path.clone() })?;

    let mut data = BytesMut::with_capacity(part.length as usize);

    while (data.len() as u64) < part.length {
        if cancel.is_cancelled() {
            return error::TimeoutSnafu {
                part_number: part.part_number,
            }
            .fail();
        }

        let want = (part.length - data.len() as u64).min(IO_CHUNK_SIZE as u64);
        let before = data.len();

        let bytes_read = (&mut file)
            .take(want)
            .read_buf(&mut data)
            .await
            .with_context(|_| error::ReadingSourceFileSnafu { path: path.clone() })?;

        if bytes_read == 0 {
            // The file is shorter than it was when the plan was computed
            return Err(
                error::ReadingSourceFileSnafu { path: path.clone() }.into_error(
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "file truncated mid-transfer; expected {} bytes but got {}",
                            part.offset + part.length,
                            part.offset + before as u64
                        ),
                    ),
                ),
            );
        }

        aggregator.report(worker, bytes_read as u64);
        progress.chunk_transferred(
            worker,
            part.part_number,
            data.len() - before,
            &aggregator.snapshot(),
        );
    }

    Ok(data.freeze())
}

/// Stream this part's byte range from object storage into the pre-allocated target file,
/// reporting progress on every chunk that lands on disk.
///
/// Each worker opens its own file handle and seeks to its part's offset, so parts can be written
/// out of order and concurrently.
async fn write_target_part(
    worker: WorkerId,
    part: PartSpec,
    context: &PartContext,
    aggregator: &ProgressAggregator,
    progress: &dyn TransferProgressCallback,
    cancel: &CancellationToken,
) -> Result<(u64, Option<String>), (u64, TransferError)> {
    // A zero-length object has nothing to read, and the ranged read API can't even express an
    // empty range
    if part.length == 0 {
        return Ok((0, None));
    }

    let path = &context.local_path;
    let mut bytes_written = 0u64;

    // A closure so every fallible step below can use `?`, while the byte count stays out here
    let result: Result<()> = async {
        let mut chunks = context
            .client
            .get_range(&context.object, part.offset..part.offset + part.length)
            .await?;

        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .with_context(|_| error::WritingTargetFileSnafu { path: path.clone() })?;
        file.seek(SeekFrom::Start(part.offset))
            .await
            .with_context(|_| error::WritingTargetFileSnafu { path: path.clone() })?;

        while let Some(chunk) = chunks.recv().await {
            if cancel.is_cancelled() {
                return error::TimeoutSnafu {
                    part_number: part.part_number,
                }
                .fail();
            }

            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .with_context(|_| error::WritingTargetFileSnafu { path: path.clone() })?;

            bytes_written += chunk.len() as u64;

            aggregator.report(worker, chunk.len() as u64);
            progress.chunk_transferred(
                worker,
                part.part_number,
                chunk.len(),
                &aggregator.snapshot(),
            );
        }

        file.flush()
            .await
            .with_context(|_| error::WritingTargetFileSnafu { path: path.clone() })?;

        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok((bytes_written, None)),
        Err(e) => Err((bytes_written, e)),
    }
}
