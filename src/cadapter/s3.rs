//! S3 adapter built on aws-sdk-s3.

use crate::cadapter::client::{ObjectHead, ObjectStoreClient, WirePart};
use crate::error::{BlobStoreError, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Tag, Tagging};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::BTreeMap;
use tracing::debug;

pub struct S3ObjectClient {
    client: Client,
}

impl S3ObjectClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Credentials come from the default provider chain. A custom endpoint
    /// (MinIO, rustfs, ...) switches to path-style addressing.
    pub async fn from_env(endpoint_url: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_owned()));
        }
        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let conf = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(endpoint_url.is_some())
            .build();
        Self::new(Client::from_conf(s3_conf))
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }
}

/// Everything but unreserved characters and the path separator.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// `x-amz-copy-source` value; S3 expects the key URL-encoded.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE))
}

fn classify<E>(key: &str, err: SdkError<E, HttpResponse>) -> BlobStoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|resp| resp.status().as_u16());
    if matches!(err.code(), Some("NoSuchKey" | "NotFound")) || status == Some(404) {
        return BlobStoreError::not_found(key);
    }
    BlobStoreError::unknown(format!("{key}: {}", DisplayErrorContext(&err)))
}

async fn collect_body(key: &str, body: ByteStream) -> Result<Bytes> {
    body.collect()
        .await
        .map(|data| data.into_bytes())
        .map_err(|e| BlobStoreError::unknown(format!("{key}: failed to read body: {e}")))
}

#[async_trait]
impl ObjectStoreClient for S3ObjectClient {
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        resp.upload_id()
            .map(str::to_owned)
            .ok_or_else(|| BlobStoreError::unknown(format!("{key}: no upload id returned")))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let checksum = Self::md5_base64(&data);
        let resp = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        resp.e_tag().map(str::to_owned).ok_or_else(|| {
            BlobStoreError::unknown(format!("{key}: part {part_number} returned no ETag"))
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[WirePart],
    ) -> Result<()> {
        let completed_parts = parts
            .iter()
            .map(|(number, tag)| {
                CompletedPart::builder()
                    .part_number(*number)
                    .e_tag(tag)
                    .build()
            })
            .collect::<Vec<_>>();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn get_range(&self, bucket: &str, key: &str, range: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        collect_body(key, resp.body).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        collect_body(key, resp.body).await
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let checksum = Self::md5_base64(&data);
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        let size = resp.content_length().unwrap_or_default().max(0) as u64;
        let e_tag = resp.e_tag().unwrap_or_default().trim_matches('"').to_owned();
        Ok(ObjectHead { size, e_tag })
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        self.client
            .copy_object()
            .copy_source(copy_source(src_bucket, src_key))
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| classify(src_key, e))?;
        debug!("Copied s3://{src_bucket}/{src_key} to s3://{dst_bucket}/{dst_key}");
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_owned)),
            );
        }
        Ok(keys)
    }

    async fn put_tags(
        &self,
        bucket: &str,
        key: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let tag_set = tags
            .iter()
            .map(|(k, v)| {
                Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(|e| BlobStoreError::unknown(format!("{key}: invalid tag {k}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| BlobStoreError::unknown(format!("{key}: invalid tag set: {e}")))?;
        self.client
            .put_object_tagging()
            .bucket(bucket)
            .key(key)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn get_tags(&self, bucket: &str, key: &str) -> Result<BTreeMap<String, String>> {
        let resp = self
            .client
            .get_object_tagging()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(resp
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_owned(), tag.value().to_owned()))
            .collect())
    }
}
