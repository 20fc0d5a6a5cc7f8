use crate::{Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use std::ops::Range;
use tokio::sync::mpsc;
use url::Url;

mod s3;

/// A single addressable object in an object storage bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// One finished part of a multipart upload, as needed by the finalization call.
#[derive(Clone, Debug)]
pub struct CompletedPart {
    /// The part number, starting from 0
    pub part_number: u32,

    /// The opaque tag the storage system handed back when the part was uploaded
    pub etag: String,
}

/// A client for an object storage system like S3.
///
/// The transfer engine only orchestrates; all actual storage I/O goes through this trait.  Not
/// all object storage systems expose an S3-compatible API, so the storage implementation is
/// abstracted behind a trait, which also lets tests substitute a hermetic in-memory store.
///
/// Use [`ObjectStorageFactory`] to create an instance of this trait for a given URL.
///
/// Implementations must be safe for concurrent use by multiple workers, and are expected to be
/// trivially cloneable such that the cost of a clone is the cost of increasing the ref count on
/// an `Arc`.  Each call is individually atomic; retry policy, if any, lives inside the
/// implementation and not in the engine.
#[async_trait::async_trait]
pub trait ObjectStorageClient: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Verify the bucket exists and is accessible to the current identity.
    ///
    /// Fails with [`crate::TransferError::BucketInvalidOrNotAccessible`] (or an
    /// implementation-specific equivalent) if not.
    async fn validate_bucket(&self, bucket: &str) -> Result<()>;

    /// Query the size in bytes of the specified object.
    ///
    /// Fails with [`crate::TransferError::ObjectNotFound`] if the object doesn't exist.
    async fn head_object(&self, object: &ObjectRef) -> Result<u64>;

    /// Read a byte range of an object as a stream of chunks.
    ///
    /// The chunks arrive on the returned channel in order, and their sizes are an implementation
    /// detail; callers should treat each received chunk as one physical read increment.  An error
    /// mid-stream is delivered on the channel and terminates it.
    async fn get_range(
        &self,
        object: &ObjectRef,
        byte_range: Range<u64>,
    ) -> Result<mpsc::Receiver<Result<Bytes>>>;

    /// Upload a whole object in one call, with no multipart lifecycle.
    ///
    /// Only suitable for objects at or below the multipart threshold; anything bigger goes
    /// through [`Self::create_multipart_upload`] and friends.
    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<()>;

    /// Begin a multipart upload, returning the upload ID that all subsequent part uploads and the
    /// finalization call must carry.
    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String>;

    /// Upload one part of a multipart upload, returning the part's etag.
    ///
    /// `part_number` starts from 0; implementations targeting APIs that number parts from 1 (S3
    /// does) perform the translation internally.
    async fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Combine previously uploaded parts into the final addressable object.
    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()>;

    /// Abandon a multipart upload, releasing any storage-side state held for its parts.
    async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()>;
}

dyn_clone::clone_trait_object!(ObjectStorageClient);

/// Constructs [`ObjectStorageClient`] implementations from object URLs.
///
/// There is deliberately no process-wide instance here; every operation gets its own client
/// built from its own config.
#[derive(Debug)]
pub struct ObjectStorageFactory;

impl ObjectStorageFactory {
    /// Given the URL of an object storage bucket or object, determine which implementation
    /// handles that particular object storage technology and return an instance of it.
    ///
    /// If the URL isn't recognized as being supported by ssxfer, an error is returned
    pub async fn from_url(config: Config, url: &Url) -> Result<Box<dyn ObjectStorageClient>> {
        if url.scheme() == "s3" {
            Ok(Box::new(s3::S3Client::new(config).await))
        } else {
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
        }
    }

    /// Extract the bucket and object key from a URL like `s3://bucket/some/key`.
    ///
    /// In URL terms the bucket is the host name, and the key is the path with its leading `/`
    /// stripped, since that separator isn't part of the S3 object key.
    pub fn parse_object_url(url: &Url) -> Result<ObjectRef> {
        let bucket = url
            .host_str()
            .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

        let key = url.path().trim_start_matches('/');
        snafu::ensure!(
            !key.is_empty(),
            crate::error::MissingObjectKeySnafu { url: url.clone() }
        );

        Ok(ObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}
