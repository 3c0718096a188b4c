//! Uniform blob surface over S3 and a local directory.
//!
//! The backend is picked from the store url at construction time: `s3://bucket`
//! selects S3, anything else (optionally prefixed with `file://`) names a local
//! base directory. Only the S3 backend transfers parts concurrently.
pub mod local;
pub mod s3;

pub use local::{LocalBlob, LocalBlobStore, LocalMultipartWriter, LocalPartReader};
pub use s3::{S3Blob, S3BlobStore};

use crate::cadapter::s3::S3ObjectClient;
use crate::chunk::part::Part;
use crate::config::TransferConfig;
use crate::error::{BlobStoreError, Result};
use crate::transfer::{MultipartWriter, PartReader};
use bytes::Bytes;
use futures::Stream;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const FILE_SCHEMA: &str = "file://";

pub enum BlobStore {
    S3(S3BlobStore),
    Local(LocalBlobStore),
}

impl BlobStore {
    pub async fn from_url(url: &str, config: TransferConfig) -> Result<Self> {
        if let Some(rest) = url.strip_prefix(s3::SCHEMA) {
            let bucket = rest.trim_end_matches('/');
            if bucket.is_empty() || bucket.contains('/') {
                return Err(BlobStoreError::InvalidUrl {
                    url: url.to_owned(),
                });
            }
            let client = S3ObjectClient::from_env(
                config.endpoint_url.as_deref(),
                config.region.as_deref(),
            )
            .await;
            return Ok(Self::S3(S3BlobStore::new(Arc::new(client), bucket, config)));
        }
        let path = url.strip_prefix(FILE_SCHEMA).unwrap_or(url);
        if path.is_empty() {
            return Err(BlobStoreError::InvalidUrl {
                url: url.to_owned(),
            });
        }
        Ok(Self::Local(LocalBlobStore::new(path, config)?))
    }

    pub fn schema(&self) -> &'static str {
        match self {
            Self::S3(_) => s3::SCHEMA,
            Self::Local(_) => FILE_SCHEMA,
        }
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            Self::S3(store) => store.list(prefix).await,
            Self::Local(store) => store.list(prefix).await,
        }
    }

    pub fn blob(&self, key: &str) -> Blob {
        match self {
            Self::S3(store) => Blob::S3(store.blob(key)),
            Self::Local(store) => Blob::Local(store.blob(key)),
        }
    }
}

/// Splits a blob url into its store url and key:
/// `s3://bucket/a/b` -> (`s3://bucket`, `a/b`), `/data/a/b` -> (`/data/a`, `b`).
pub fn split_blob_url(url: &str) -> Result<(String, String)> {
    let invalid = || BlobStoreError::InvalidUrl {
        url: url.to_owned(),
    };
    if let Some(rest) = url.strip_prefix(s3::SCHEMA) {
        let (bucket, key) = rest.split_once('/').ok_or_else(invalid)?;
        if bucket.is_empty() || key.is_empty() {
            return Err(invalid());
        }
        return Ok((format!("{}{bucket}", s3::SCHEMA), key.to_owned()));
    }
    let path = Path::new(url.strip_prefix(FILE_SCHEMA).unwrap_or(url));
    let key = path.file_name().ok_or_else(invalid)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    Ok((
        dir.to_string_lossy().into_owned(),
        key.to_string_lossy().into_owned(),
    ))
}

pub enum Blob {
    S3(S3Blob),
    Local(LocalBlob),
}

impl Blob {
    pub fn key(&self) -> &str {
        match self {
            Self::S3(blob) => blob.key(),
            Self::Local(blob) => blob.key(),
        }
    }

    pub fn url(&self) -> String {
        match self {
            Self::S3(blob) => blob.url(),
            Self::Local(blob) => blob.url(),
        }
    }

    fn config(&self) -> &TransferConfig {
        match self {
            Self::S3(blob) => blob.config(),
            Self::Local(blob) => blob.config(),
        }
    }

    pub async fn get(&self) -> Result<Bytes> {
        match self {
            Self::S3(blob) => blob.get().await,
            Self::Local(blob) => blob.get().await,
        }
    }

    pub async fn put(&self, data: Bytes) -> Result<()> {
        match self {
            Self::S3(blob) => blob.put(data).await,
            Self::Local(blob) => blob.put(data).await,
        }
    }

    pub async fn delete(&self) -> Result<()> {
        match self {
            Self::S3(blob) => blob.delete().await,
            Self::Local(blob) => blob.delete().await,
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        match self {
            Self::S3(blob) => blob.exists().await,
            Self::Local(blob) => blob.exists().await,
        }
    }

    pub async fn size(&self) -> Result<u64> {
        match self {
            Self::S3(blob) => blob.size().await,
            Self::Local(blob) => blob.size().await,
        }
    }

    /// Cloud-native checksum. Local files report the ETag S3 would compute
    /// for the same content and chunk policy.
    pub async fn checksum(&self) -> Result<String> {
        match self {
            Self::S3(blob) => blob.checksum().await,
            Self::Local(blob) => blob.checksum().await,
        }
    }

    pub async fn put_tags(&self, tags: &BTreeMap<String, String>) -> Result<()> {
        match self {
            Self::S3(blob) => blob.put_tags(tags).await,
            Self::Local(blob) => blob.put_tags(tags).await,
        }
    }

    pub async fn get_tags(&self) -> Result<BTreeMap<String, String>> {
        match self {
            Self::S3(blob) => blob.get_tags().await,
            Self::Local(blob) => blob.get_tags().await,
        }
    }

    pub async fn download(&self, dest: &Path) -> Result<()> {
        match self {
            Self::S3(blob) => blob.download(dest).await,
            Self::Local(blob) => blob.download(dest).await,
        }
    }

    pub async fn parts(&self) -> Result<Parts> {
        match self {
            Self::S3(blob) => Ok(Parts::Remote(blob.parts().await?)),
            Self::Local(blob) => Ok(Parts::Local(blob.parts().await?)),
        }
    }

    pub async fn multipart_writer(&self) -> Result<Writer> {
        match self {
            Self::S3(blob) => Ok(Writer::Remote(blob.multipart_writer().await?)),
            Self::Local(blob) => Ok(Writer::Local(blob.multipart_writer())),
        }
    }

    /// Whether copying `src` here moves more than one part.
    pub async fn copy_from_is_multipart(&self, src: &Blob) -> Result<bool> {
        let size = src.size().await?;
        Ok(self.config().policy.describe(size).is_multipart())
    }

    /// Copies `src` into this blob. Copies into a local directory download
    /// directly. Single-part copies into S3 are a server-side copy inside one
    /// store and a plain put otherwise; larger ones stream parts from `src`
    /// into a multipart writer.
    pub async fn copy_from(&self, src: &Blob) -> Result<()> {
        info!("Copying {} to {}", src.url(), self.url());
        let dst = match self {
            Self::Local(dst) => return src.download(dst.path()).await,
            Self::S3(dst) => dst,
        };
        if !self.copy_from_is_multipart(src).await? {
            return match src {
                Self::S3(from) if dst.same_store(from) => dst.copy_within_store(from).await,
                _ => dst.put(src.get().await?).await,
            };
        }
        pipe(src.parts().await?, self.multipart_writer().await?).await
    }
}

/// Moves every part from `parts` into `writer`. On failure the writer's
/// session is aborted, since nobody else holds it.
async fn pipe(mut parts: Parts, mut writer: Writer) -> Result<()> {
    writer.expect_part_count(parts.len() as u64);
    let copied = async {
        while let Some(part) = parts.next_part().await {
            writer.put_part(part?).await?;
        }
        writer.close().await
    }
    .await;
    if let Err(e) = copied {
        parts.close();
        if let Err(abort_err) = writer.abort().await {
            warn!("Failed to abort writer after copy failure: {abort_err}");
        }
        return Err(e);
    }
    Ok(())
}

/// Part source of either backend. Remote parts arrive in completion order,
/// local parts in part order.
pub enum Parts {
    Remote(PartReader),
    Local(LocalPartReader),
}

impl Parts {
    pub fn len(&self) -> usize {
        match self {
            Self::Remote(reader) => reader.len(),
            Self::Local(reader) => reader.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Remote(reader) => reader.size(),
            Self::Local(reader) => reader.size(),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        match self {
            Self::Remote(reader) => reader.chunk_size(),
            Self::Local(reader) => reader.chunk_size(),
        }
    }

    pub async fn next_part(&mut self) -> Option<Result<Part>> {
        match self {
            Self::Remote(reader) => reader.next_part().await,
            Self::Local(reader) => reader.next_part().await,
        }
    }

    pub fn close(&mut self) {
        match self {
            Self::Remote(reader) => reader.close(),
            Self::Local(reader) => reader.close(),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Part>> + Send {
        futures::stream::unfold(self, |mut parts| async move {
            parts.next_part().await.map(|item| (item, parts))
        })
    }
}

pub enum Writer {
    Remote(MultipartWriter),
    Local(LocalMultipartWriter),
}

impl Writer {
    pub fn expect_part_count(&mut self, count: u64) {
        match self {
            Self::Remote(writer) => writer.expect_part_count(count),
            Self::Local(writer) => writer.expect_part_count(count),
        }
    }

    pub async fn put_part(&mut self, part: Part) -> Result<()> {
        match self {
            Self::Remote(writer) => writer.put_part(part).await,
            Self::Local(writer) => writer.put_part(part).await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::Remote(writer) => writer.close().await,
            Self::Local(writer) => writer.close().await,
        }
    }

    pub async fn abort(self) -> Result<()> {
        match self {
            Self::Remote(writer) => writer.abort().await,
            Self::Local(writer) => writer.abort().await,
        }
    }
}
