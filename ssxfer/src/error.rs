use snafu::prelude::*;
use std::path::PathBuf;
use url::Url;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransferError {
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the object key"))]
    MissingObjectKey { url: Url },

    #[snafu(display(
        "The multipart chunk size must be greater than zero when an object exceeds the multipart threshold"
    ))]
    InvalidChunkSize,

    #[snafu(display("The maximum concurrency must be at least 1"))]
    InvalidConcurrency,

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("The object '{key}' doesn't exist in bucket '{bucket}'"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("Error getting metadata about object '{key}' in S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Error reading byte range of object '{key}' in S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("Error reading response body of object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: std::io::Error,
    },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("Error initiating multipart upload of object '{key}' to S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' to S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: u32,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display("Error completing multipart upload of object '{key}' to S3 bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("Error aborting multipart upload of object '{key}' to S3 bucket '{bucket}'"))]
    AbortMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError,
        >,
    },

    #[snafu(display("Error reading source file '{}'", path.display()))]
    ReadingSourceFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error writing target file '{}'", path.display()))]
    WritingTargetFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An error reported by an [`crate::ObjectStorageClient`] implementation outside of this
    /// crate, which therefore can't have a more specific variant of its own
    #[snafu(display("Object storage client error: {message}"))]
    StorageClient { message: String },

    #[snafu(display("Part {part_number} of the transfer failed"))]
    PartTransferFailed {
        part_number: u32,
        #[snafu(source(from(TransferError, Box::new)))]
        source: Box<TransferError>,
    },

    #[snafu(display("All parts transferred but the multipart upload could not be finalized"))]
    FinalizationFailed {
        #[snafu(source(from(TransferError, Box::new)))]
        source: Box<TransferError>,
    },

    #[snafu(display(
        "Part {part_number} was abandoned because the transfer was aborted before the part could complete"
    ))]
    Timeout { part_number: u32 },
}
