use super::{CompletedPart, ObjectRef, ObjectStorageClient};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use bytes::{Bytes, BytesMut};
use snafu::{prelude::*, IntoError};
use std::ops::Range;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// The size of one physical read increment when streaming a ranged GET response body.
///
/// Each increment of this size becomes one chunk on the receiver returned by
/// [`S3Client::get_range`], and therefore one progress report.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// How many chunks of a ranged GET can be buffered before the producer task blocks waiting for
/// the consumer to catch up
const CHUNK_QUEUE_DEPTH: usize = 4;

/// Implementation of [`ObjectStorageClient`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3Client {
    // The SDK client is internally reference-counted, so cloning this is cheap
    client: aws_sdk_s3::Client,
}

impl S3Client {
    pub(super) async fn new(config: Config) -> Self {
        Self {
            client: make_s3_client(&config).await,
        }
    }
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3Client")
    }
}

#[async_trait::async_trait]
impl ObjectStorageClient for S3Client {
    #[instrument(skip(self))]
    async fn validate_bucket(&self, bucket: &str) -> Result<()> {
        debug!("Validating access to bucket");

        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .with_context(|_| crate::error::BucketInvalidOrNotAccessibleSnafu {
                bucket: bucket.to_string(),
            })?;

        debug!("Access to bucket is confirmed");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn head_object(&self, object: &ObjectRef) -> Result<u64> {
        match self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
        {
            Ok(metadata) => Ok(metadata.content_length().unwrap_or_default() as u64),
            Err(e) => {
                if e.as_service_error()
                    .map(|error| error.is_not_found())
                    .unwrap_or(false)
                {
                    crate::error::ObjectNotFoundSnafu {
                        bucket: object.bucket.clone(),
                        key: object.key.clone(),
                    }
                    .fail()
                } else {
                    Err(crate::error::HeadObjectSnafu {
                        bucket: object.bucket.clone(),
                        key: object.key.clone(),
                    }
                    .into_error(e))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_range(
        &self,
        object: &ObjectRef,
        byte_range: Range<u64>,
    ) -> Result<mpsc::Receiver<Result<Bytes>>> {
        debug!("Reading partial object");

        let response = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .range(format!("bytes={}-{}", byte_range.start, byte_range.end - 1))
            .send()
            .await
            .with_context(|_| crate::error::GetObjectSnafu {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            })?;

        // Feed the response body to the caller one read increment at a time.  The channel is
        // deliberately shallow so a slow consumer applies backpressure to the HTTP read instead
        // of buffering the whole part in memory.
        let (chunks_sender, chunks_receiver) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let object = object.clone();

        tokio::spawn(async move {
            let mut reader = response.body.into_async_read();

            loop {
                let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);

                match reader.read_buf(&mut buffer).await {
                    Ok(0) => {
                        // EOF; the entire requested range has been streamed
                        break;
                    }
                    Ok(_) => {
                        if chunks_sender.send(Ok(buffer.freeze())).await.is_err() {
                            debug!(%object, "chunk receiver was dropped; abandoning ranged read");
                            break;
                        }
                    }
                    Err(e) => {
                        let error = crate::error::ReadByteStreamSnafu {
                            bucket: object.bucket.clone(),
                            key: object.key.clone(),
                        }
                        .into_error(e);

                        if chunks_sender.send(Err(error)).await.is_err() {
                            warn!(%object, "body read failed but the chunk receiver is gone; error is lost");
                        }
                        break;
                    }
                }
            }
        });

        Ok(chunks_receiver)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn put_object(&self, object: &ObjectRef, data: Bytes) -> Result<()> {
        debug!("Uploading unipart object");

        self.client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            })?;

        let upload_id = response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string();

        debug!(%upload_id, "Initiated multi-part upload");

        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn upload_part(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        debug!("Uploading multi-part chunk");

        // Our part numbering starts from 0, but the S3 API expects parts to be numbered from 1
        let response = self
            .client
            .upload_part()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .part_number((part_number + 1) as i32)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::UploadPartSnafu {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                part_number,
            })?;

        let e_tag = response
            .e_tag()
            .expect("BUG: uploaded part missing etag")
            .to_string();

        debug!(%e_tag, "Uploaded multi-part chunk");

        Ok(e_tag)
    }

    #[instrument(skip(self, parts), fields(num_parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        // The S3 API requires that we enumerate all of the parts we uploaded (even though they
        // are all tied together with a unique upload ID), sorted by part number
        let mut parts = parts;
        parts.sort_unstable_by_key(|part| part.part_number);

        let completed_parts = parts
            .into_iter()
            .map(|part| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(part.etag)
                    .part_number((part.part_number + 1) as i32)
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            })?;

        debug!("Completed multi-part upload");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .send()
            .await
            .with_context(|_| crate::error::AbortMultipartUploadSnafu {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            })?;

        Ok(())
    }
}

/// Create a new AWS SDK S3 client, using the default configuration deduced from the environment
/// plus any endpoint override from the ssxfer config
async fn make_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
    let aws_config = aws_config::from_env().region(region_provider).load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // Custom endpoints are almost always S3-compatible servers like Minio which don't
        // support virtual-hosted bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.to_string())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
