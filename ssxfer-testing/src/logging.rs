//! Per-test log capture.
//!
//! Tests run in parallel, so a single global tracing subscriber interleaves the output of every
//! test at once.  Instead each test gets its own dispatcher writing into its own buffer, and the
//! buffer is dumped when that test finishes, so a failure's log output contains only the events
//! of the test that failed.
use crate::Result;
use std::cell::RefCell;
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

/// Collects the formatted log events of exactly one test
#[derive(Clone, Default)]
struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    /// Take everything logged so far, leaving the buffer empty
    fn drain(&self) -> String {
        let mut bytes = self.bytes.lock().unwrap();

        String::from_utf8_lossy(&std::mem::take(&mut *bytes)).into_owned()
    }
}

impl Write for &LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = &'a LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

/// Build the tracing dispatcher for one test, writing into `buffer`.
///
/// The transfer tests are hermetic (in-memory store, no network), so the default filter simply
/// turns the workspace crates up to their most verbose levels.  `RUST_LOG` overrides it when set.
fn capture_dispatch(buffer: LogBuffer) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ssxfer=trace,ssxfer_testing=trace,debug"));

    // Thread IDs are included because the worker pool spreads parts across runtime threads, and
    // which thread reported what is often the question being debugged
    let format = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(buffer);

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Drive a test future to completion on a dedicated multi-thread runtime with its own log
/// capture, dumping the captured log whether the test passes, fails, or panics.
///
/// Use this in place of `#[tokio::test]`.  The test's dispatcher must be the thread-local
/// default not just on the test's own thread but on every runtime worker thread too, otherwise
/// events from spawned tasks fall through to whatever global subscriber happens to exist.  That
/// requires building the runtime by hand and installing the dispatcher from `on_thread_start`.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let buffer = LogBuffer::default();
    let dispatch = Arc::new(capture_dispatch(buffer.clone()));

    tracing::dispatcher::with_default(&dispatch, || {
        std::thread_local! {
            static DISPATCH_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> =
                RefCell::new(None);
        }

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        let thread_dispatch = Arc::clone(&dispatch);
        builder.on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&thread_dispatch);

            DISPATCH_GUARD.with(|cell| {
                cell.replace(Some(guard));
            });
        });

        builder.on_thread_stop(|| {
            // The guard must not outlive the thread it was installed on
            DISPATCH_GUARD.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        // The runtime and the test future cross the unwind boundary so the captured log can
        // still be dumped when the test panics.  Neither holds state that another test could
        // observe in a broken condition afterwards, since both are scoped to this test alone.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Captured log output:\n{}", buffer.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
