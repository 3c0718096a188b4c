//! Object store protocol used by the transfer engine.
//!
//! Shaped after S3 multipart uploads. Part numbers crossing this trait are the
//! one-based wire numbers; the engine converts at the call site.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    /// Cloud-native checksum, quotes stripped.
    pub e_tag: String,
}

/// `(wire part number, tag)` as submitted to `complete_multipart_upload`.
pub type WirePart = (i32, String);

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String>;

    /// `parts` must be sorted by part number, strictly increasing.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[WirePart],
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
    -> Result<()>;

    /// Read `range` (`bytes=start-end`, end inclusive) of an object.
    async fn get_range(&self, bucket: &str, key: &str, range: &str) -> Result<Bytes>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead>;

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    async fn put_tags(&self, bucket: &str, key: &str, tags: &BTreeMap<String, String>)
    -> Result<()>;

    async fn get_tags(&self, bucket: &str, key: &str) -> Result<BTreeMap<String, String>>;
}
