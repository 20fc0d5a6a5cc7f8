use url::Url;

/// The configuration settings that control the behavior of a single transfer operation.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is ignored.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The size threshold ssxfer uses for multipart transfers.
    ///
    /// Objects at or below this size are transferred as a single unit with no chunking at all,
    /// no matter what `multipart_chunk_size` says.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_threshold: byte_unit::Byte,

    /// The chunk size that ssxfer uses for multipart transfers.
    ///
    /// Multipart transfers will be used for objects larger than `multipart_threshold`, with each
    /// part being `multipart_chunk_size` bytes (except possibly the last one).
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The maximum number of parts transferred concurrently.
    ///
    /// A higher number of concurrent requests may be necessary in order to saturate very fast
    /// connections to S3, but this will also increase RAM usage during the transfer, since up to
    /// `multipart_chunk_size` times this many bytes can be buffered at once.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// Whether to transfer parts concurrently at all.
    ///
    /// When disabled, parts of a multipart transfer are processed one at a time on the calling
    /// task, with no worker tasks spawned.  Single-part transfers always run this way regardless
    /// of this setting.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value_t = true, action = clap::ArgAction::Set, global = true)
    )]
    pub use_concurrency: bool,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            s3_endpoint: None,
            multipart_threshold: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            max_concurrent_requests: 10,
            use_concurrency: true,
        }
    }
}
