//! S3-compatible storage backend using AWS SDK.

use super::{
    BackendError, BackendResult, ByteRange, CompletedPart, ObjectBackend, ObjectReader, PartInfo,
    RedundancySettings,
};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    error::SdkError,
    types::{self, CompletedMultipartUpload, Delete, ObjectIdentifier},
};
use bytes::Bytes;
use tracing::instrument;

/// DeleteObjects accepts at most this many keys per call.
const MAX_DELETE_BATCH: usize = 1000;

fn map_sdk_error<E>(err: SdkError<E>, bucket: &str, key: &str) -> BackendError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ref service_err) = err {
        if service_err.raw().status().as_u16() == 404 {
            return BackendError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            };
        }
    }
    BackendError::S3(Box::new(err))
}

fn map_upload_error<E>(err: SdkError<E>, upload_id: &str) -> BackendError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(ref service_err) = err {
        if service_err.raw().status().as_u16() == 404 {
            return BackendError::NoSuchUpload(upload_id.to_string());
        }
    }
    BackendError::S3(Box::new(err))
}

pub struct S3Backend {
    client: Client,
    endpoint: Option<String>,
    redundancy: Option<RedundancySettings>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("endpoint", &self.endpoint)
            .field("redundancy", &self.redundancy)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    pub async fn new(config: &S3Config) -> BackendResult<Self> {
        if config.access_key_id.is_some() ^ config.secret_access_key.is_some() {
            return Err(BackendError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let region = aws_config::Region::new(config.region.clone());
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "portal-config",
            );
            builder = builder.credentials_provider(credentials);
        }

        let endpoint = config.endpoint.as_ref().map(|endpoint| {
            let lower = endpoint.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("http://{}", endpoint)
            }
        });
        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            endpoint,
            redundancy: config
                .min_shards
                .map(|min_shards| RedundancySettings { min_shards }),
        })
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_bucket_if_not_exists(&self, bucket: &str) -> BackendResult<()> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => return Ok(()),
            Err(SdkError::ServiceError(ref err)) if err.raw().status().as_u16() == 404 => {}
            Err(err) => return Err(BackendError::S3(Box::new(err))),
        }
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            // lost a creation race with another node
            Err(SdkError::ServiceError(ref err)) if err.raw().status().as_u16() == 409 => Ok(()),
            Err(err) => Err(BackendError::S3(Box::new(err))),
        }
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BackendResult<String> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        Ok(output.e_tag().unwrap_or_default().trim_matches('"').to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BackendResult<ObjectReader> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(range) = range {
            let header = match range.end {
                // S3 ranges are inclusive; an empty range has nothing to fetch
                Some(end) if end <= range.start => return Ok(Box::pin(tokio::io::empty())),
                Some(end) => format!("bytes={}-{}", range.start, end - 1),
                None => format!("bytes={}-", range.start),
            };
            request = request.range(header);
        }

        let output = request.send().await.map_err(|e| map_sdk_error(e, bucket, key))?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head_object(&self, bucket: &str, key: &str) -> BackendResult<Option<u64>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(SdkError::ServiceError(ref err)) if err.raw().status().as_u16() == 404 => Ok(None),
            Err(err) => Err(BackendError::S3(Box::new(err))),
        }
    }

    #[instrument(skip(self), fields(backend = "s3", count = keys.len()))]
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<()> {
        for batch in keys.chunks(MAX_DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::S3(Box::new(e)))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| BackendError::S3(Box::new(e)))?;
            let output = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| BackendError::S3(Box::new(e)))?;
            if let Some(err) = output.errors().first() {
                return Err(BackendError::S3(
                    format!(
                        "failed to delete `{}`: {}",
                        err.key().unwrap_or_default(),
                        err.message().unwrap_or_default()
                    )
                    .into(),
                ));
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> BackendResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, key))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| BackendError::Config("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> BackendResult<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_upload_error(e, upload_id))?;
        Ok(CompletedPart {
            part_number,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<Vec<PartInfo>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .client
                .list_parts()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.clone())
                .send()
                .await
                .map_err(|e| map_upload_error(e, upload_id))?;

            parts.extend(output.parts().iter().map(|part| PartInfo {
                part_number: part.part_number().unwrap_or_default(),
                size: part.size().unwrap_or_default().max(0) as u64,
                etag: part.e_tag().unwrap_or_default().to_string(),
            }));

            if output.is_truncated().unwrap_or(false) {
                marker = output.next_part_number_marker().map(str::to_string);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, parts), fields(backend = "s3", parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        let completed = parts
            .iter()
            .map(|part| {
                types::CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect::<Vec<_>>();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| map_upload_error(e, upload_id))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_upload_error(e, upload_id))?;
        Ok(())
    }

    fn redundancy(&self) -> Option<RedundancySettings> {
        self.redundancy
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn health_check(&self) -> BackendResult<()> {
        self.client
            .list_buckets()
            .send()
            .await
            .map_err(|e| BackendError::S3(Box::new(e)))?;
        Ok(())
    }
}
