//! Implementations of progress callbacks that render progress bars
use crate::Result;
use std::{borrow::Cow, future::Future, time::Duration};

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the specified transfer job, with a progress bar for extra pretty-ness.
///
/// Ctrl-C aborts the transfer; in-flight parts stop at their next I/O increment and whatever was
/// already transferred is reported before exiting.
pub(crate) async fn run_transfer_job(
    globals: &super::Globals,
    job: ssxfer::TransferJob,
) -> Result<()> {
    let progress = TransferProgressReport::new(hide_progress(globals), &job);

    let abort = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    let started = std::time::Instant::now();
    let result = job.run(abort, progress).await?;
    let duration = started.elapsed();

    if !globals.quiet {
        let bytes_per_second =
            (result.bytes_transferred as f64 / duration.as_secs_f64().max(f64::EPSILON)) as u64;

        println!(
            "Transferred {} in {} ({}/s)",
            indicatif::BinaryBytes(result.bytes_transferred),
            indicatif::HumanDuration(duration),
            indicatif::BinaryBytes(bytes_per_second),
        );

        if globals.verbose {
            let mut per_worker = result.per_worker_bytes.iter().collect::<Vec<_>>();
            per_worker.sort_unstable_by_key(|(worker, _)| **worker);

            for (worker, bytes) in per_worker {
                println!("  {worker}: {}", indicatif::BinaryBytes(*bytes));
            }
        }
    }

    match result.error {
        None => Ok(()),
        Some(error) => Err(error.into()),
    }
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Progress reporting for a transfer, which receives progress updates from the lib crate and
/// renders a progress bar accordingly
#[derive(Clone)]
struct TransferProgressReport {
    bar: indicatif::ProgressBar,
}

impl TransferProgressReport {
    fn new(hide_progress: bool, job: &ssxfer::TransferJob) -> Self {
        let bar = if !hide_progress {
            indicatif::ProgressBar::new(job.object_size())
        } else {
            indicatif::ProgressBar::hidden()
        };

        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {msg:<30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
        );

        Self { bar }
    }
}

#[allow(unused_variables)] // so we can keep the unused progress methods with their comments
impl ssxfer::TransferProgressCallback for TransferProgressReport {
    fn transfer_started(&self, total_bytes: u64, total_parts: usize) {
        self.bar.set_length(total_bytes);
        self.bar
            .set_message(format!("Transferring {total_parts} part(s)"));
    }

    fn part_started(&self, worker: ssxfer::WorkerId, part_number: u32, part_size: u64) {
        // Nothing to do here; the bar updates chunk by chunk
    }

    fn chunk_transferred(
        &self,
        worker: ssxfer::WorkerId,
        part_number: u32,
        chunk_size: usize,
        snapshot: &ssxfer::ProgressSnapshot,
    ) {
        // The aggregator's total is authoritative across all workers, so set the position rather
        // than incrementing and risking double counting
        self.bar
            .set_position(snapshot.total_transferred.min(snapshot.target_size));
        self.bar
            .set_message(format!("{worker} on part {part_number}"));
    }

    fn part_completed(&self, worker: ssxfer::WorkerId, part_number: u32, part_size: u64) {
        // Progress is reported chunk-by-chunk so there's nothing more to add here
    }

    fn part_failed(&self, worker: ssxfer::WorkerId, part_number: u32) {
        self.bar.set_message(format!("part {part_number} FAILED"));
    }

    fn transfer_completed(&self, total_bytes: u64) {
        self.bar.finish_and_clear();
    }
}
