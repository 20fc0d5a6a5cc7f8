//! The top-level transfer operation: builds a plan, runs it on the worker pool, and settles the
//! multipart lifecycle.
//!
//! Construction is split from execution the same way as everything else in this crate: a
//! [`TransferJobBuilder`] does all of the validation and planning up front (and can fail), and
//! produces a [`TransferJob`] which is then run to completion exactly once.
use crate::error::{self, TransferError};
use crate::objstore::{CompletedPart, ObjectRef, ObjectStorageClient, ObjectStorageFactory};
use crate::planner::{self, TransferPlan};
use crate::pool::{self, PartContext, TransferMode};
use crate::progress::{ProgressAggregator, TransferProgressCallback, WorkerId};
use crate::{Config, Result};
use futures::FutureExt;
use snafu::{IntoError, ResultExt};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

/// Which way the bytes move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// From a local file to object storage
    Upload,

    /// From object storage to a local file
    Download,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// The final accounting of a finished transfer operation.
///
/// A transfer that had part failures still produces a result rather than an `Err`, because the
/// partial accounting is precisely what the caller needs in that case: how much data did move,
/// and what went wrong.  `Err` from [`TransferJob::run`] is reserved for failures before any
/// parts ran.
#[derive(Debug)]
pub struct TransferResult {
    /// Whether every part transferred and (for multipart uploads) finalization succeeded
    pub succeeded: bool,

    /// Bytes durably transferred, summed over the parts that succeeded plus whatever partial
    /// downloads landed on disk.
    ///
    /// Note this is deliberately not the same number as the raw progress total: a failed upload
    /// part reported progress while reading the source file, but none of those bytes made it to
    /// storage, so they don't count here.
    pub bytes_transferred: u64,

    /// Bytes reported by each worker, as accumulated by the progress aggregator.
    ///
    /// This is the raw progress accounting, so for a failed transfer the sum over workers can
    /// exceed [`Self::bytes_transferred`].
    pub per_worker_bytes: HashMap<WorkerId, u64>,

    /// The error that made the transfer fail, if it did.
    ///
    /// When multiple parts failed, this is the failure of the lowest-numbered part.
    pub error: Option<TransferError>,
}

/// Builder for a [`TransferJob`].
pub struct TransferJobBuilder {
    config: Config,
    direction: Direction,
    remote: Url,
    local: PathBuf,
    client: Option<Box<dyn ObjectStorageClient>>,
}

impl TransferJobBuilder {
    pub fn new(config: Config, direction: Direction, remote: Url, local: impl Into<PathBuf>) -> Self {
        Self {
            config,
            direction,
            remote,
            local: local.into(),
            client: None,
        }
    }

    /// Use the given client instead of constructing one from the remote URL.
    ///
    /// This is how tests substitute an in-memory store, but it works for any
    /// [`ObjectStorageClient`] implementation.
    pub fn client(mut self, client: Box<dyn ObjectStorageClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Validate the config and the remote URL, confirm access to the bucket, size the object, and
    /// compute the part plan.
    ///
    /// All fallible preparation happens here; the job this returns is ready to run.  Config
    /// errors are detected first, before a single storage call is made.
    pub async fn build(self) -> Result<TransferJob> {
        let Self {
            config,
            direction,
            remote,
            local,
            client,
        } = self;

        snafu::ensure!(
            config.multipart_chunk_size.get_bytes() > 0,
            error::InvalidChunkSizeSnafu
        );
        snafu::ensure!(
            config.max_concurrent_requests >= 1,
            error::InvalidConcurrencySnafu
        );

        let object = ObjectStorageFactory::parse_object_url(&remote)?;

        let client = match client {
            Some(client) => client,
            None => ObjectStorageFactory::from_url(config.clone(), &remote).await?,
        };

        client.validate_bucket(&object.bucket).await?;

        let object_size = match direction {
            Direction::Upload => tokio::fs::metadata(&local)
                .await
                .with_context(|_| error::ReadingSourceFileSnafu { path: local.clone() })?
                .len(),
            Direction::Download => client.head_object(&object).await?,
        };

        debug!(%direction, %object, object_size, "Sized transfer object");

        let plan = planner::plan(object_size, &config)?;

        Ok(TransferJob {
            config,
            direction,
            client,
            object,
            local_path: local,
            plan,
        })
    }
}

/// A fully planned transfer operation, ready to run.
pub struct TransferJob {
    config: Config,
    direction: Direction,
    client: Box<dyn ObjectStorageClient>,
    object: ObjectRef,
    local_path: PathBuf,
    plan: TransferPlan,
}

impl std::fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferJob")
            .field("direction", &self.direction)
            .field("object", &self.object)
            .field("local_path", &self.local_path)
            .field("num_parts", &self.plan.num_parts())
            .finish()
    }
}

impl TransferJob {
    /// The size of the object being transferred, in bytes
    pub fn object_size(&self) -> u64 {
        self.plan.object_size()
    }

    /// The number of parts the transfer is divided into
    pub fn num_parts(&self) -> usize {
        self.plan.num_parts()
    }

    /// Whether this transfer uses the multipart storage lifecycle
    pub fn is_multipart(&self) -> bool {
        self.plan.is_multipart()
    }

    /// Alternative to [`Self::run`] for when the caller doesn't care about progress updates and
    /// doesn't want to have to provide a no-op progress callback implementation.
    pub async fn run_without_progress(
        self,
        abort: impl Future<Output = ()>,
    ) -> Result<TransferResult> {
        // A dummy impl of the callback trait that doesn't do anything with any of the progress
        // updates
        struct NoProgress;
        impl TransferProgressCallback for NoProgress {}

        self.run(abort, NoProgress).await
    }

    /// Run the transfer to completion.
    ///
    /// If `abort` completes before the transfer does, the transfer is cancelled: workers stop at
    /// the next I/O increment, parts not yet complete resolve to
    /// [`TransferError::Timeout`] failures, and the result is reported the same way as any other
    /// partial failure.
    ///
    /// `Err` is returned only for failures before the parts started moving (for a multipart
    /// upload, failure to initiate the upload).  Everything after that point is reported through
    /// the [`TransferResult`], including partial failures, so the accounting of what did transfer
    /// is never lost.
    pub async fn run(
        self,
        abort: impl Future<Output = ()>,
        progress: impl TransferProgressCallback + 'static,
    ) -> Result<TransferResult> {
        let span = tracing::info_span!("transfer", direction = %self.direction, object = %self.object);

        async move {
            let Self {
                config,
                direction,
                client,
                object,
                local_path,
                plan,
            } = self;

            info!(
                object_size = plan.object_size(),
                num_parts = plan.num_parts(),
                multipart = plan.is_multipart(),
                "Starting transfer"
            );

            let progress: Arc<dyn TransferProgressCallback> = Arc::new(progress);
            let aggregator = Arc::new(ProgressAggregator::new(plan.object_size()));

            progress.transfer_started(plan.object_size(), plan.num_parts());

            let mode = match direction {
                Direction::Upload if plan.is_multipart() => {
                    let upload_id = client.create_multipart_upload(&object).await?;
                    TransferMode::MultipartUpload { upload_id }
                }
                Direction::Upload => TransferMode::PutObject,
                Direction::Download => {
                    // Pre-allocate the whole target file so workers can write their parts at any
                    // offset, in any order
                    let file = tokio::fs::File::create(&local_path).await.with_context(|_| {
                        error::WritingTargetFileSnafu {
                            path: local_path.clone(),
                        }
                    })?;
                    file.set_len(plan.object_size()).await.with_context(|_| {
                        error::WritingTargetFileSnafu {
                            path: local_path.clone(),
                        }
                    })?;

                    TransferMode::Download
                }
            };

            let context = Arc::new(PartContext {
                client,
                object,
                local_path,
                mode,
            });

            let cancel = CancellationToken::new();

            // Race the transfer against the abort signal.  When abort fires we don't stop
            // polling the transfer; we cancel the token and let the workers wind down, so every
            // part still resolves to a result.
            let results = {
                let transfer = pool::execute(
                    &plan,
                    Arc::clone(&context),
                    Arc::clone(&aggregator),
                    Arc::clone(&progress),
                    &config,
                    cancel.clone(),
                );
                tokio::pin!(transfer);

                let abort = abort.fuse();
                tokio::pin!(abort);

                loop {
                    tokio::select! {
                        results = &mut transfer => break results,
                        _ = &mut abort => {
                            warn!("Abort signaled; cancelling transfer");
                            cancel.cancel();
                        }
                    }
                }
            };

            let bytes_transferred = results
                .iter()
                .map(|result| result.bytes_transferred)
                .sum::<u64>();
            let per_worker_bytes = aggregator.snapshot().per_worker;

            if results.iter().any(|result| !result.is_success()) {
                // Results are sorted by part number, so the first failure found is the
                // lowest-numbered one
                let (part_number, cause) = results
                    .into_iter()
                    .filter(|result| !result.is_success())
                    .map(|result| {
                        (
                            result.part_number,
                            result
                                .error
                                .expect("BUG: failed part result must carry its error"),
                        )
                    })
                    .next()
                    .expect("BUG: a failing part was just observed");

                if let TransferMode::MultipartUpload { upload_id } = &context.mode {
                    abort_upload_best_effort(&context, upload_id).await;
                }

                // Cancellation already produces a self-describing error; anything else gets
                // wrapped so the caller knows which part sank the transfer
                let error = match cause {
                    timeout @ TransferError::Timeout { .. } => timeout,
                    cause => error::PartTransferFailedSnafu { part_number }
                        .into_error(cause),
                };

                error!(bytes_transferred, %error, "Transfer failed");
                progress.transfer_completed(bytes_transferred);

                return Ok(TransferResult {
                    succeeded: false,
                    bytes_transferred,
                    per_worker_bytes,
                    error: Some(error),
                });
            }

            // Every part transferred; for multipart uploads the object doesn't exist until the
            // upload is finalized
            if let TransferMode::MultipartUpload { upload_id } = &context.mode {
                let parts = results
                    .into_iter()
                    .map(|result| CompletedPart {
                        part_number: result.part_number,
                        etag: result
                            .etag
                            .expect("BUG: successful multipart part missing etag"),
                    })
                    .collect::<Vec<_>>();

                if let Err(cause) = context
                    .client
                    .complete_multipart_upload(&context.object, upload_id, parts)
                    .await
                {
                    // The parts all made it but the object was never assembled.  Clean up the
                    // orphaned upload state.
                    abort_upload_best_effort(&context, upload_id).await;

                    let error = error::FinalizationFailedSnafu.into_error(cause);

                    error!(%error, "Transfer failed during finalization");
                    progress.transfer_completed(bytes_transferred);

                    return Ok(TransferResult {
                        succeeded: false,
                        bytes_transferred,
                        per_worker_bytes,
                        error: Some(error),
                    });
                }
            }

            info!(bytes_transferred, "Transfer complete");
            progress.transfer_completed(bytes_transferred);

            Ok(TransferResult {
                succeeded: true,
                bytes_transferred,
                per_worker_bytes,
                error: None,
            })
        }
        .instrument(span)
        .await
    }
}

/// Abort a multipart upload because the transfer it belongs to failed.
///
/// The abort itself is best-effort: if it fails too, the original transfer failure is what the
/// caller needs to see, so this only logs.
async fn abort_upload_best_effort(context: &PartContext, upload_id: &str) {
    debug!(%upload_id, "Aborting multipart upload after transfer failure");

    if let Err(e) = context
        .client
        .abort_multipart_upload(&context.object, upload_id)
        .await
    {
        error!(%upload_id, error = %e, "Failed to abort multipart upload; the incomplete upload may linger until the bucket's lifecycle policy reaps it");
    }
}
