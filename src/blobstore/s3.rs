//! S3 backend: CRUD passes straight through to the client, chunked transfer
//! goes through `PartReader` and `MultipartWriter`.

use crate::blobstore::local::{ensure_parent, partial_path};
use crate::cadapter::client::ObjectStoreClient;
use crate::chunk::part::Part;
use crate::config::TransferConfig;
use crate::error::{BlobStoreError, Result};
use crate::transfer::{MultipartWriter, PartReader};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

pub const SCHEMA: &str = "s3://";

pub struct S3BlobStore {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    config: TransferConfig,
}

impl S3BlobStore {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        config: TransferConfig,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            config,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.client.list_objects(&self.bucket, prefix).await
    }

    pub fn blob(&self, key: &str) -> S3Blob {
        S3Blob {
            client: Arc::clone(&self.client),
            bucket: self.bucket.clone(),
            key: key.to_owned(),
            config: self.config.clone(),
        }
    }
}

pub struct S3Blob {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    config: TransferConfig,
}

impl S3Blob {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn url(&self) -> String {
        format!("{SCHEMA}{}/{}", self.bucket, self.key)
    }

    pub(crate) fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub async fn get(&self) -> Result<Bytes> {
        self.client.get_object(&self.bucket, &self.key).await
    }

    /// Objects that span more than one part go up as a multipart upload.
    pub async fn put(&self, data: Bytes) -> Result<()> {
        let descriptor = self.config.policy.describe(data.len() as u64);
        if !descriptor.is_multipart() {
            return self.client.put_object(&self.bucket, &self.key, data).await;
        }
        let mut writer = self.multipart_writer().await?;
        writer.expect_part_count(descriptor.part_count);
        let uploaded = async {
            for number in 0..descriptor.part_count as u32 {
                let (offset, len) = descriptor.part_range(number);
                let chunk = data.slice(offset as usize..(offset + len) as usize);
                writer.put_part(Part::new(number, chunk)).await?;
            }
            writer.close().await
        }
        .await;
        if let Err(e) = uploaded {
            abort_quietly(writer).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        self.client.delete_object(&self.bucket, &self.key).await
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.client.head_object(&self.bucket, &self.key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn size(&self) -> Result<u64> {
        Ok(self.client.head_object(&self.bucket, &self.key).await?.size)
    }

    /// The object's ETag without surrounding quotes.
    pub async fn checksum(&self) -> Result<String> {
        Ok(self.client.head_object(&self.bucket, &self.key).await?.e_tag)
    }

    pub async fn put_tags(&self, tags: &BTreeMap<String, String>) -> Result<()> {
        self.client.put_tags(&self.bucket, &self.key, tags).await
    }

    pub async fn get_tags(&self) -> Result<BTreeMap<String, String>> {
        self.client.get_tags(&self.bucket, &self.key).await
    }

    /// Fetches the object part by part, writing each part at its offset in a
    /// staging file that replaces `dest` once every part has landed.
    pub async fn download(&self, dest: &Path) -> Result<()> {
        let mut parts = self.parts().await?;
        let staging = partial_path(dest);
        ensure_parent(&staging).await?;
        let written = async {
            let mut file = File::create(&staging).await?;
            file.set_len(parts.size()).await?;
            while let Some(part) = parts.next_part().await {
                let part = part?;
                let offset = u64::from(part.number) * parts.chunk_size();
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(&part.data).await?;
            }
            file.flush().await?;
            Ok::<_, BlobStoreError>(())
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }
        fs::rename(&staging, dest).await?;
        debug!("Downloaded {} to {}", self.url(), dest.display());
        Ok(())
    }

    pub async fn parts(&self) -> Result<PartReader> {
        PartReader::open(
            Arc::clone(&self.client),
            self.bucket.clone(),
            self.key.clone(),
            self.config.policy,
            self.config.read_window,
        )
        .await
    }

    pub async fn multipart_writer(&self) -> Result<MultipartWriter> {
        MultipartWriter::create(
            Arc::clone(&self.client),
            self.bucket.clone(),
            self.key.clone(),
            self.config.concurrent_uploads,
        )
        .await
    }

    /// Server-side copy from another object in the same store.
    pub(crate) async fn copy_within_store(&self, src: &S3Blob) -> Result<()> {
        self.client
            .copy_object(&src.bucket, &src.key, &self.bucket, &self.key)
            .await
    }

    pub(crate) fn same_store(&self, other: &S3Blob) -> bool {
        Arc::ptr_eq(&self.client, &other.client)
    }
}

/// Aborts a writer whose transfer already failed; the transfer error wins.
pub(crate) async fn abort_quietly(writer: MultipartWriter) {
    let upload_id = writer.upload_id().to_owned();
    if let Err(e) = writer.abort().await {
        warn!("Failed to abort multipart upload {upload_id}: {e}");
    }
}
