use clap::{Parser, Subcommand};
use ssxfer::{Config, Direction, TransferJobBuilder};
use std::path::PathBuf;
use url::Url;

mod progress;

type Result<T> = color_eyre::Result<T>;

/// Detailed version string reported by `--version`, including how the binary was built
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ", opt-level ",
    env!("VERGEN_CARGO_OPT_LEVEL"),
    ")"
);

/// Chunked, concurrent transfer of objects to and from S3-compatible object storage
#[derive(Parser, Debug)]
#[clap(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    /// All of the transfer tuning options are declared on the lib crate's `Config` itself, so
    /// they can never drift out of sync with what the engine actually supports
    #[clap(flatten)]
    config: Config,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file to object storage
    Upload {
        /// The local file to upload
        #[clap(value_parser)]
        file: PathBuf,

        /// The S3 URL of the object to create, ie s3://bucket/some/key
        #[clap(value_parser, value_name = "URL")]
        url: Url,
    },

    /// Download an object from object storage to a local file
    Download {
        /// The S3 URL of the object to download, ie s3://bucket/some/key
        #[clap(value_parser, value_name = "URL")]
        url: Url,

        /// The local file to write the object to.
        ///
        /// If the file already exists it is overwritten.
        #[clap(value_parser)]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

/// Initialize the global tracing subscriber, writing to stderr so log output never corrupts the
/// progress bars or any output a script might capture
fn init_logging(globals: &Globals) {
    let default_directives = if globals.verbose {
        "ssxfer=debug,ssxfer_cli=debug,warn"
    } else if globals.quiet {
        "error"
    } else {
        "ssxfer=info,warn"
    };

    // `RUST_LOG` always wins if it's set, so the verbosity flags are just a default
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let globals = args.globals;

    match args.command {
        Command::Upload { file, url } => {
            let job = progress::with_spinner(
                &globals,
                format!("Preparing to upload '{}'...", file.display()),
                TransferJobBuilder::new(globals.config.clone(), Direction::Upload, url, file)
                    .build(),
            )
            .await?;

            progress::run_transfer_job(&globals, job).await
        }
        Command::Download { url, file } => {
            let job = progress::with_spinner(
                &globals,
                format!("Preparing to download '{url}'..."),
                TransferJobBuilder::new(globals.config.clone(), Direction::Download, url, file)
                    .build(),
            )
            .await?;

            progress::run_transfer_job(&globals, job).await
        }
    }
}
