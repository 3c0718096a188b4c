//! In-process object store implementing the S3 protocol subset.
//!
//! Used for tests and demos. Besides storing objects it records request
//! concurrency and can inject latency or failures per part.

use crate::cadapter::client::{ObjectHead, ObjectStoreClient, WirePart};
use crate::error::{BlobStoreError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type ObjectKey = (String /*bucket*/, String /*key*/);

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    e_tag: String,
    tags: BTreeMap<String, String>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, (Bytes, String)>,
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    /// Part numbers submitted to each successful finalize, in call order.
    completions: Vec<Vec<i32>>,
}

#[derive(Default)]
struct Faults {
    latency: Duration,
    slow_uploads: HashMap<u32, Duration>,
    slow_ranges: HashMap<u64, Duration>,
    failing_uploads: HashSet<u32>,
    failing_ranges: HashSet<u64>,
    panicking_uploads: HashSet<u32>,
    panicking_ranges: HashSet<u64>,
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Counts a request as in flight until dropped, aborted requests included.
struct InFlight<'a>(&'a InMemoryObjectStore);

impl<'a> InFlight<'a> {
    fn enter(store: &'a InMemoryObjectStore) -> Self {
        let now = store.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        store.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(store)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

/// Parses `bytes=start-end` into an inclusive pair.
fn parse_range(range: &str) -> Option<(u64, u64)> {
    let (start, end) = range.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency applied to every part upload and range read.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.faults).latency = latency;
    }

    /// Extra latency for uploads of zero-based part `number`.
    pub fn delay_upload(&self, number: u32, delay: Duration) {
        lock(&self.faults).slow_uploads.insert(number, delay);
    }

    /// Extra latency for range reads starting at `offset`.
    pub fn delay_range(&self, offset: u64, delay: Duration) {
        lock(&self.faults).slow_ranges.insert(offset, delay);
    }

    pub fn fail_upload(&self, number: u32) {
        lock(&self.faults).failing_uploads.insert(number);
    }

    pub fn fail_range(&self, offset: u64) {
        lock(&self.faults).failing_ranges.insert(offset);
    }

    /// Makes the upload of part `number` panic, as a crashed task would.
    pub fn panic_upload(&self, number: u32) {
        lock(&self.faults).panicking_uploads.insert(number);
    }

    /// Makes range reads starting at `offset` panic.
    pub fn panic_range(&self, offset: u64) {
        lock(&self.faults).panicking_ranges.insert(offset);
    }

    /// Highest number of part uploads and range reads seen running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_max_in_flight(&self) {
        self.max_in_flight
            .store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Multipart sessions created but neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        lock(&self.state).uploads.len()
    }

    pub fn completions(&self) -> Vec<Vec<i32>> {
        lock(&self.state).completions.clone()
    }

    fn object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        lock(&self.state)
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| BlobStoreError::not_found(key))
    }

    async fn pause(&self, extra: Option<Duration>) {
        let delay = lock(&self.faults).latency + extra.unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        let _guard = InFlight::enter(self);
        if part_number < 1 {
            return Err(BlobStoreError::unknown(format!(
                "{key}: invalid part number {part_number}"
            )));
        }
        let number = (part_number - 1) as u32;
        let extra = lock(&self.faults).slow_uploads.get(&number).copied();
        self.pause(extra).await;
        if lock(&self.faults).panicking_uploads.contains(&number) {
            panic!("{key}: injected panic uploading part {part_number}");
        }
        if lock(&self.faults).failing_uploads.contains(&number) {
            return Err(BlobStoreError::unknown(format!(
                "{key}: injected failure uploading part {part_number}"
            )));
        }
        let e_tag = md5_hex(&data);
        let mut state = lock(&self.state);
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| BlobStoreError::unknown(format!("NoSuchUpload: {upload_id}")))?;
        upload.parts.insert(part_number, (data, e_tag.clone()));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[WirePart],
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| BlobStoreError::unknown(format!("NoSuchUpload: {upload_id}")))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(BlobStoreError::unknown(format!(
                "NoSuchUpload: {upload_id} does not belong to {key}"
            )));
        }
        if parts.is_empty() {
            return Err(BlobStoreError::unknown(format!(
                "MalformedXML: {key}: no parts given"
            )));
        }
        if parts.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(BlobStoreError::unknown(format!(
                "InvalidPartOrder: {key}: parts must be in ascending order"
            )));
        }

        let mut data = BytesMut::new();
        let mut digests = Vec::with_capacity(parts.len() * 16);
        for (number, tag) in parts {
            match upload.parts.get(number) {
                Some((bytes, e_tag)) if e_tag == tag => {
                    data.extend_from_slice(bytes);
                    digests.extend_from_slice(&md5::compute(bytes).0);
                }
                _ => {
                    return Err(BlobStoreError::unknown(format!(
                        "InvalidPart: {key}: part {number} not uploaded with tag {tag}"
                    )));
                }
            }
        }
        let e_tag = format!("{}-{}", md5_hex(&digests), parts.len());
        state.uploads.remove(upload_id);
        state.objects.insert(
            (bucket.to_owned(), key.to_owned()),
            StoredObject {
                data: data.freeze(),
                e_tag,
                tags: BTreeMap::new(),
            },
        );
        state
            .completions
            .push(parts.iter().map(|(number, _)| *number).collect());
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<()> {
        lock(&self.state)
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| BlobStoreError::unknown(format!("NoSuchUpload: {upload_id}")))
    }

    async fn get_range(&self, bucket: &str, key: &str, range: &str) -> Result<Bytes> {
        let _guard = InFlight::enter(self);
        let (start, end) = parse_range(range)
            .ok_or_else(|| BlobStoreError::unknown(format!("InvalidRange: {range}")))?;
        let extra = lock(&self.faults).slow_ranges.get(&start).copied();
        self.pause(extra).await;
        if lock(&self.faults).panicking_ranges.contains(&start) {
            panic!("{key}: injected panic reading {range}");
        }
        if lock(&self.faults).failing_ranges.contains(&start) {
            return Err(BlobStoreError::unknown(format!(
                "{key}: injected failure reading {range}"
            )));
        }
        let object = self.object(bucket, key)?;
        let len = object.data.len() as u64;
        if start >= len && len > 0 {
            return Err(BlobStoreError::unknown(format!("InvalidRange: {range}")));
        }
        let end = end.saturating_add(1).min(len);
        Ok(object.data.slice(start.min(len) as usize..end as usize))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let _guard = InFlight::enter(self);
        self.pause(None).await;
        Ok(self.object(bucket, key)?.data)
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<()> {
        let e_tag = md5_hex(&data);
        lock(&self.state).objects.insert(
            (bucket.to_owned(), key.to_owned()),
            StoredObject {
                data,
                e_tag,
                tags: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        // S3 deletes are idempotent.
        lock(&self.state)
            .objects
            .remove(&(bucket.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let object = self.object(bucket, key)?;
        Ok(ObjectHead {
            size: object.data.len() as u64,
            e_tag: object.e_tag,
        })
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        let mut object = self.object(src_bucket, src_key)?;
        object.tags.clear();
        lock(&self.state)
            .objects
            .insert((dst_bucket.to_owned(), dst_key.to_owned()), object);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = lock(&self.state)
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn put_tags(
        &self,
        bucket: &str,
        key: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let object = state
            .objects
            .get_mut(&(bucket.to_owned(), key.to_owned()))
            .ok_or_else(|| BlobStoreError::not_found(key))?;
        object.tags = tags.clone();
        Ok(())
    }

    async fn get_tags(&self, bucket: &str, key: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.object(bucket, key)?.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_range_reads_clamp_to_object() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("b", "k", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        let data = store.get_range("b", "k", "bytes=8-15").await.unwrap();
        assert_eq!(&data[..], b"89");
        assert!(store.get_range("b", "k", "bytes=10-19").await.is_err());
        let err = store.get_range("b", "missing", "bytes=0-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_complete_rejects_unsorted_parts() {
        let store = InMemoryObjectStore::new();
        let id = store.create_multipart_upload("b", "k").await.unwrap();
        let t1 = store
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        let t2 = store
            .upload_part("b", "k", &id, 2, Bytes::from_static(b"cd"))
            .await
            .unwrap();
        let unsorted = vec![(2, t2.clone()), (1, t1.clone())];
        assert!(
            store
                .complete_multipart_upload("b", "k", &id, &unsorted)
                .await
                .is_err()
        );
        assert_eq!(store.open_uploads(), 1);

        store
            .complete_multipart_upload("b", "k", &id, &[(1, t1), (2, t2)])
            .await
            .unwrap();
        assert_eq!(store.open_uploads(), 0);
        assert_eq!(&store.get_object("b", "k").await.unwrap()[..], b"abcd");
        assert!(store.head_object("b", "k").await.unwrap().e_tag.ends_with("-2"));
    }

    #[tokio::test]
    async fn test_tags_round_trip() {
        let store = InMemoryObjectStore::new();
        store.put_object("b", "k", Bytes::new()).await.unwrap();
        let tags = BTreeMap::from([("owner".to_string(), "rk8s".to_string())]);
        store.put_tags("b", "k", &tags).await.unwrap();
        assert_eq!(store.get_tags("b", "k").await.unwrap(), tags);
        assert!(store.put_tags("b", "nope", &tags).await.unwrap_err().is_not_found());
    }
}
