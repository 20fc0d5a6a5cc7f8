//! Integration tests which exercise complete upload and download transfers end to end, against
//! the hermetic in-memory object store so they need no network or credentials.
use crate::progress::TestTransferProgressCallback;
use crate::Result;
use assert_matches::assert_matches;
use more_asserts::*;
use ssxfer::{Config, Direction, TransferError, TransferJobBuilder, WorkerId};
use ssxfer_testing::{logging, memory::MemoryObjectStore, test_data};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

const BUCKET: &str = "test-bucket";

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

fn object_url(key: &str) -> Url {
    format!("s3://{BUCKET}/{key}").parse().unwrap()
}

fn config(threshold: u64, chunk_size: u64, max_concurrency: usize) -> Config {
    Config {
        multipart_threshold: byte_unit::Byte::from_bytes(threshold as u128),
        multipart_chunk_size: byte_unit::Byte::from_bytes(chunk_size as u128),
        max_concurrent_requests: max_concurrency,
        ..Config::default()
    }
}

/// Run an upload of a temp file of `size` random bytes against `store`, returning the transfer
/// result, the recorded progress events, and the expected file contents
async fn run_upload(
    store: &MemoryObjectStore,
    config: Config,
    key: &str,
    size: u64,
) -> Result<(
    ssxfer::TransferResult,
    TestTransferProgressCallback,
    Vec<u8>,
)> {
    let dir = tempfile::tempdir()?;
    let (path, data) = test_data::make_test_file(dir.path(), "source.bin", size as usize).await?;

    let job = TransferJobBuilder::new(config, Direction::Upload, object_url(key), path)
        .client(Box::new(store.clone()))
        .build()
        .await?;

    let progress = TestTransferProgressCallback::new();
    let result = job
        .run(futures::future::pending(), progress.clone())
        .await?;

    Ok((result, progress, data))
}

#[test]
fn upload_small_object_single_part() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);

        let (result, progress, data) =
            run_upload(&store, config(8 * MB, MB, 4), "small.bin", 5 * MB).await?;

        assert!(result.succeeded);
        assert!(result.error.is_none());
        assert_eq!(result.bytes_transferred, 5 * MB);

        // Small objects bypass the multipart lifecycle entirely
        assert_eq!(store.complete_calls(), 0);
        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(store.get("small.bin").unwrap(), data);

        progress.sanity_check_updates();
        let (_, total_parts) = progress.transfer_started();
        assert_eq!(total_parts, 1);

        Ok(())
    })
}

#[test]
fn upload_zero_byte_file() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);

        let (result, progress, _data) =
            run_upload(&store, config(8 * MB, MB, 4), "empty.bin", 0).await?;

        assert!(result.succeeded);
        assert_eq!(result.bytes_transferred, 0);
        assert!(store.get("empty.bin").unwrap().is_empty());

        progress.sanity_check_updates();

        Ok(())
    })
}

#[test]
fn multipart_upload_round_trip() -> Result<()> {
    logging::test_with_logging(async {
        // A little latency makes the parts genuinely overlap, so the in-flight high water mark
        // actually measures concurrency
        let store = MemoryObjectStore::new(BUCKET).with_latency(Duration::from_millis(10));

        let (result, progress, data) =
            run_upload(&store, config(8 * MB, MB, 4), "big.bin", 10 * MB).await?;

        assert!(result.succeeded);
        assert_eq!(result.bytes_transferred, 10 * MB);

        // The object was assembled from the parts byte-for-byte
        assert_eq!(store.get("big.bin").unwrap(), data);
        assert_eq!(store.complete_calls(), 1);
        assert_eq!(store.abort_calls(), 0);
        assert_eq!(store.pending_uploads(), 0);

        // Never more than the configured number of parts in flight
        assert_le!(store.max_in_flight(), 4);

        progress.sanity_check_updates();
        let (_, total_parts) = progress.transfer_started();
        assert_eq!(total_parts, 10);
        assert_le!(progress.workers_seen().len(), 4);

        // The per-worker accounting adds up to the whole object
        assert_eq!(result.per_worker_bytes.values().sum::<u64>(), 10 * MB);

        Ok(())
    })
}

#[test]
fn multipart_upload_sequential_when_concurrency_disabled() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);

        let mut config = config(MB, MB, 4);
        config.use_concurrency = false;

        let (result, progress, data) = run_upload(&store, config, "seq.bin", 5 * MB).await?;

        assert!(result.succeeded);
        assert_eq!(store.get("seq.bin").unwrap(), data);

        // Everything ran on the calling task, attributed to worker 0
        assert_eq!(
            progress.workers_seen(),
            HashSet::from([WorkerId::new(0)])
        );
        assert_eq!(result.per_worker_bytes.len(), 1);

        progress.sanity_check_updates();

        Ok(())
    })
}

#[test]
fn single_part_transfer_ignores_concurrency_setting() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);

        // use_concurrency is on and max concurrency is high, but a single-part plan still runs
        // sequentially with no workers spawned
        let (result, progress, _data) =
            run_upload(&store, config(8 * MB, MB, 10), "single.bin", 5 * MB).await?;

        assert!(result.succeeded);
        assert_eq!(
            progress.workers_seen(),
            HashSet::from([WorkerId::new(0)])
        );

        Ok(())
    })
}

#[test]
fn upload_part_failure_aborts_multipart_upload() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET).fail_parts([2]);

        let (result, progress, _data) =
            run_upload(&store, config(MB, MB, 4), "failing.bin", 5 * MB).await?;

        assert!(!result.succeeded);

        // The failure names the part that sank the transfer
        assert_matches!(
            result.error,
            Some(TransferError::PartTransferFailed { part_number: 2, .. })
        );
        assert_eq!(progress.parts_failed(), vec![2]);

        // The other four parts each moved their megabyte; the failed part contributes nothing
        assert_eq!(result.bytes_transferred, 4 * MB);

        // The orphaned multipart upload was aborted, exactly once, and never completed
        assert_eq!(store.abort_calls(), 1);
        assert_eq!(store.complete_calls(), 0);
        assert_eq!(store.pending_uploads(), 0);
        assert!(store.get("failing.bin").is_none());

        Ok(())
    })
}

#[test]
fn lowest_numbered_failure_selected_when_multiple_parts_fail() -> Result<()> {
    logging::test_with_logging(async {
        // Two parts fail, and the latency makes their completion order race, but the reported
        // error must always name the lower-numbered of the two regardless of which one the
        // workers resolved last
        let store = MemoryObjectStore::new(BUCKET)
            .fail_parts([1, 3])
            .with_latency(Duration::from_millis(5));

        let (result, progress, _data) =
            run_upload(&store, config(MB, MB, 4), "racing.bin", 5 * MB).await?;

        assert!(!result.succeeded);
        assert_matches!(
            result.error,
            Some(TransferError::PartTransferFailed { part_number: 1, .. })
        );

        // Both failures were reported; only their event order is racy
        let mut failed = progress.parts_failed();
        failed.sort_unstable();
        assert_eq!(failed, vec![1, 3]);

        // The three surviving parts each moved their megabyte
        assert_eq!(result.bytes_transferred, 3 * MB);

        assert_eq!(store.abort_calls(), 1);
        assert_eq!(store.pending_uploads(), 0);

        Ok(())
    })
}

#[test]
fn finalization_failure_aborts_multipart_upload() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET).fail_complete();

        let (result, _progress, _data) =
            run_upload(&store, config(MB, MB, 4), "unfinished.bin", 5 * MB).await?;

        assert!(!result.succeeded);
        assert_matches!(result.error, Some(TransferError::FinalizationFailed { .. }));

        // All of the parts did transfer
        assert_eq!(result.bytes_transferred, 5 * MB);

        assert_eq!(store.complete_calls(), 1);
        assert_eq!(store.abort_calls(), 1);
        assert!(store.get("unfinished.bin").is_none());

        Ok(())
    })
}

#[test]
fn multipart_download_round_trip() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);
        let data = test_data::make_random_data(10 * MB as usize);
        store.put("big.bin", data.clone());

        let dir = tempfile::tempdir()?;
        let target = dir.path().join("downloaded.bin");

        let job = TransferJobBuilder::new(
            config(8 * MB, MB, 4),
            Direction::Download,
            object_url("big.bin"),
            &target,
        )
        .client(Box::new(store.clone()))
        .build()
        .await?;

        assert!(job.is_multipart());
        assert_eq!(job.num_parts(), 10);

        let progress = TestTransferProgressCallback::new();
        let result = job
            .run(futures::future::pending(), progress.clone())
            .await?;

        assert!(result.succeeded);
        assert_eq!(result.bytes_transferred, 10 * MB);

        // Parts may have been written out of order and concurrently, but the bytes must line up
        // exactly
        assert_eq!(test_data::read_test_file(&target).await?, data);

        progress.sanity_check_updates();

        Ok(())
    })
}

#[test]
fn download_zero_byte_object() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);
        store.put("empty.bin", Vec::new());

        let dir = tempfile::tempdir()?;
        let target = dir.path().join("empty.bin");

        let job = TransferJobBuilder::new(
            config(8 * MB, MB, 4),
            Direction::Download,
            object_url("empty.bin"),
            &target,
        )
        .client(Box::new(store.clone()))
        .build()
        .await?;

        let result = job.run_without_progress(futures::future::pending()).await?;

        assert!(result.succeeded);
        assert_eq!(result.bytes_transferred, 0);
        assert!(test_data::read_test_file(&target).await?.is_empty());

        Ok(())
    })
}

#[test]
fn download_missing_object_fails_fast() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);

        let dir = tempfile::tempdir()?;
        let target = dir.path().join("never.bin");

        let result = TransferJobBuilder::new(
            config(8 * MB, MB, 4),
            Direction::Download,
            object_url("no/such/key.bin"),
            &target,
        )
        .client(Box::new(store.clone()))
        .build()
        .await;

        // The object is sized before any plan is computed, so a missing object fails the build
        assert_matches!(result, Err(TransferError::ObjectNotFound { .. }));
        assert!(!target.exists());

        Ok(())
    })
}

#[test]
fn download_part_failure_keeps_partial_accounting() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET).fail_parts([1]);
        let data = test_data::make_random_data(5 * MB as usize);
        store.put("flaky.bin", data);

        let dir = tempfile::tempdir()?;
        let target = dir.path().join("flaky.bin");

        let job = TransferJobBuilder::new(
            config(MB, MB, 4),
            Direction::Download,
            object_url("flaky.bin"),
            &target,
        )
        .client(Box::new(store.clone()))
        .build()
        .await?;

        let result = job.run_without_progress(futures::future::pending()).await?;

        assert!(!result.succeeded);
        assert_matches!(
            result.error,
            Some(TransferError::PartTransferFailed { part_number: 1, .. })
        );

        // The failed part delivered some chunks before the injected mid-stream error, and those
        // bytes did land in the file, so they count; the rest of its megabyte does not
        assert_gt!(result.bytes_transferred, 4 * MB);
        assert_lt!(result.bytes_transferred, 5 * MB);

        // Downloads have no multipart upload state to clean up
        assert_eq!(store.abort_calls(), 0);

        Ok(())
    })
}

#[test]
fn invalid_chunk_size_is_rejected_before_any_storage_call() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);

        let dir = tempfile::tempdir()?;
        let (path, _data) = test_data::make_test_file(dir.path(), "source.bin", KB as usize).await?;

        let result = TransferJobBuilder::new(
            config(8 * MB, 0, 4),
            Direction::Upload,
            object_url("never.bin"),
            path,
        )
        .client(Box::new(store.clone()))
        .build()
        .await;

        assert_matches!(result, Err(TransferError::InvalidChunkSize));
        assert_eq!(store.total_calls(), 0);

        Ok(())
    })
}

#[test]
fn zero_concurrency_is_rejected_before_any_storage_call() -> Result<()> {
    logging::test_with_logging(async {
        let store = MemoryObjectStore::new(BUCKET);

        let dir = tempfile::tempdir()?;
        let (path, _data) = test_data::make_test_file(dir.path(), "source.bin", KB as usize).await?;

        let result = TransferJobBuilder::new(
            config(8 * MB, MB, 0),
            Direction::Upload,
            object_url("never.bin"),
            path,
        )
        .client(Box::new(store.clone()))
        .build()
        .await;

        assert_matches!(result, Err(TransferError::InvalidConcurrency));
        assert_eq!(store.total_calls(), 0);

        Ok(())
    })
}

#[test]
fn abort_cancels_in_flight_transfer() -> Result<()> {
    logging::test_with_logging(async {
        // Slow the store down so the abort reliably fires while parts are still pending
        let store = MemoryObjectStore::new(BUCKET).with_latency(Duration::from_millis(50));

        let dir = tempfile::tempdir()?;
        let (path, _data) =
            test_data::make_test_file(dir.path(), "source.bin", 10 * MB as usize).await?;

        let job = TransferJobBuilder::new(
            config(MB, MB, 2),
            Direction::Upload,
            object_url("aborted.bin"),
            path,
        )
        .client(Box::new(store.clone()))
        .build()
        .await?;

        let abort = tokio::time::sleep(Duration::from_millis(120));
        let result = job.run_without_progress(abort).await?;

        assert!(!result.succeeded);
        assert_matches!(result.error, Some(TransferError::Timeout { .. }));

        // Some parts made it before the abort, but not all of them
        assert_lt!(result.bytes_transferred, 10 * MB);

        // The abandoned multipart upload was cleaned up
        assert_eq!(store.abort_calls(), 1);
        assert_eq!(store.pending_uploads(), 0);
        assert!(store.get("aborted.bin").is_none());

        Ok(())
    })
}
