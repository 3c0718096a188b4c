//! MultipartWriter: accepts parts in any order, uploads them with bounded
//! concurrency and finalizes the remote object once every part is acknowledged.
//!
//! Receipts are only touched by the writer itself; upload tasks return them
//! and the writer integrates the results when it joins the tasks.

use crate::cadapter::client::{ObjectStoreClient, WirePart};
use crate::chunk::part::{self, CompletionReceipt, Part};
use crate::chunk::policy::MAX_PART_COUNT;
use crate::error::{BlobStoreError, Result};
use crate::transfer::{ensure_complete, ensure_in_range};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Number of part uploads allowed in flight by default.
pub const DEFAULT_CONCURRENT_UPLOADS: usize = 4;

type Joined = std::result::Result<(task::Id, Result<CompletionReceipt>), JoinError>;

pub struct MultipartWriter {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    upload_id: String,
    /// Zero means parts are uploaded inline by `put_part`.
    concurrency: usize,
    uploads: JoinSet<Result<CompletionReceipt>>,
    /// Part number of every running upload task.
    numbers: HashMap<task::Id, u32>,
    receipts: BTreeMap<u32, String>,
    submitted: BTreeSet<u32>,
    expected_parts: Option<u64>,
    /// First failure seen; the session is never finalized once set.
    failure: Option<BlobStoreError>,
    closed: bool,
}

impl MultipartWriter {
    /// Opens a multipart session for `key`.
    pub async fn create(
        client: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        concurrency: usize,
    ) -> Result<Self> {
        let bucket = bucket.into();
        let key = key.into();
        let upload_id = client.create_multipart_upload(&bucket, &key).await?;
        info!("Started multipart upload {upload_id} for s3://{bucket}/{key}");
        Ok(Self {
            client,
            bucket,
            key,
            upload_id,
            concurrency,
            uploads: JoinSet::new(),
            numbers: HashMap::new(),
            receipts: BTreeMap::new(),
            submitted: BTreeSet::new(),
            expected_parts: None,
            failure: None,
            closed: false,
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Uploads currently running.
    pub fn outstanding(&self) -> usize {
        self.uploads.len()
    }

    /// Refuse to finalize unless exactly `count` parts were acknowledged.
    pub fn expect_part_count(&mut self, count: u64) {
        self.expected_parts = Some(count);
    }

    /// Queues `part` for upload. Waits for a running upload to finish first
    /// when `concurrency` uploads are already in flight.
    ///
    /// Part numbers must be below the declared part count, or below the S3
    /// part limit when none was declared.
    pub async fn put_part(&mut self, part: Part) -> Result<()> {
        self.ensure_writable()?;
        ensure_in_range(part.number, self.expected_parts.unwrap_or(MAX_PART_COUNT))?;
        if !self.submitted.insert(part.number) {
            return Err(BlobStoreError::DuplicatePart {
                number: part.number,
            });
        }

        if self.concurrency == 0 {
            let uploaded = upload_part(
                Arc::clone(&self.client),
                self.bucket.clone(),
                self.key.clone(),
                self.upload_id.clone(),
                part,
            )
            .await;
            return self.integrate(uploaded);
        }

        if self.uploads.len() >= self.concurrency {
            if let Some(joined) = self.uploads.join_next_with_id().await {
                self.settle(joined)?;
            }
        }
        while let Some(joined) = self.uploads.try_join_next_with_id() {
            self.settle(joined)?;
        }

        let number = part.number;
        let handle = self.uploads.spawn(upload_part(
            Arc::clone(&self.client),
            self.bucket.clone(),
            self.key.clone(),
            self.upload_id.clone(),
            part,
        ));
        self.numbers.insert(handle.id(), number);
        Ok(())
    }

    /// Waits for every upload, then completes the session with receipts sorted
    /// by part number. Calling it again after success is a no-op.
    ///
    /// If any part failed, that first failure is returned here (again on every
    /// later call) and the session stays open on the store; use
    /// [`MultipartWriter::abort`] to discard it.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        match self.finish().await {
            Ok(()) => {
                self.closed = true;
                Ok(())
            }
            Err(e) => Err(self.record(e)),
        }
    }

    async fn finish(&mut self) -> Result<()> {
        while let Some(joined) = self.uploads.join_next_with_id().await {
            self.settle(joined)?;
        }
        ensure_complete(self.receipts.keys(), self.expected_parts)?;

        let parts: Vec<WirePart> = self
            .receipts
            .iter()
            .map(|(number, tag)| (part::to_wire(*number), tag.clone()))
            .collect();
        self.client
            .complete_multipart_upload(&self.bucket, &self.key, &self.upload_id, &parts)
            .await?;
        info!(
            "Completed multipart upload {} for s3://{}/{} ({} parts)",
            self.upload_id,
            self.bucket,
            self.key,
            parts.len()
        );
        Ok(())
    }

    /// Cancels running uploads and aborts the remote session.
    pub async fn abort(mut self) -> Result<()> {
        self.closed = true;
        self.uploads.abort_all();
        while self.uploads.join_next().await.is_some() {}
        self.numbers.clear();
        warn!(
            "Aborting multipart upload {} for s3://{}/{}",
            self.upload_id, self.bucket, self.key
        );
        self.client
            .abort_multipart_upload(&self.bucket, &self.key, &self.upload_id)
            .await
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.closed {
            return Err(BlobStoreError::WriterClosed {
                key: self.key.clone(),
            });
        }
        if self.failure.is_some() {
            return Err(BlobStoreError::UploadAborted {
                upload_id: self.upload_id.clone(),
            });
        }
        Ok(())
    }

    /// Attributes a joined task to its part number, then integrates it.
    fn settle(&mut self, joined: Joined) -> Result<()> {
        let uploaded = match joined {
            Ok((id, uploaded)) => {
                self.numbers.remove(&id);
                uploaded
            }
            Err(e) => match self.numbers.remove(&e.id()) {
                Some(number) => Err(BlobStoreError::transfer(number, e.into())),
                None => Err(e.into()),
            },
        };
        self.integrate(uploaded)
    }

    fn integrate(&mut self, uploaded: Result<CompletionReceipt>) -> Result<()> {
        match uploaded {
            Ok(receipt) => {
                self.receipts.insert(receipt.number, receipt.tag);
                Ok(())
            }
            Err(e) => Err(self.record(e)),
        }
    }

    /// Keeps the first failure and returns `e` to the caller.
    fn record(&mut self, e: BlobStoreError) -> BlobStoreError {
        if self.failure.is_none() {
            self.failure = Some(e.clone());
        }
        e
    }
}

impl Drop for MultipartWriter {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "Multipart writer for s3://{}/{} dropped without close; upload {} left open",
                self.bucket, self.key, self.upload_id
            );
            self.uploads.detach_all();
        }
    }
}

async fn upload_part(
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    upload_id: String,
    part: Part,
) -> Result<CompletionReceipt> {
    let number = part.number;
    let len = part.len();
    let tag = client
        .upload_part(&bucket, &key, &upload_id, part::to_wire(number), part.data)
        .await
        .map_err(|e| BlobStoreError::transfer(number, e))?;
    debug!("Uploaded part {number} of {key} ({len} bytes)");
    Ok(CompletionReceipt { number, tag })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::InMemoryObjectStore;
    use std::time::Duration;

    async fn writer(store: &Arc<InMemoryObjectStore>, concurrency: usize) -> MultipartWriter {
        MultipartWriter::create(store.clone(), "bucket", "obj", concurrency)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reverse_order_finalizes_sorted() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.set_latency(Duration::from_millis(2));
        let mut w = writer(&store, 4).await;
        for number in (0..6u32).rev() {
            w.put_part(Part::new(number, vec![b'a' + number as u8; 3]))
                .await
                .unwrap();
        }
        w.close().await.unwrap();

        assert_eq!(store.completions(), vec![vec![1, 2, 3, 4, 5, 6]]);
        let data = store.get_object("bucket", "obj").await.unwrap();
        assert_eq!(&data[..], b"aaabbbcccdddeeefff");
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_never_more_than_limit_outstanding() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.set_latency(Duration::from_millis(10));
        let mut w = writer(&store, 4).await;
        for number in 0..10u32 {
            w.put_part(Part::new(number, vec![0u8; 8])).await.unwrap();
            assert!(w.outstanding() <= 4);
        }
        w.close().await.unwrap();
        assert!(store.max_in_flight() <= 4);
        assert_eq!(store.completions()[0].len(), 10);
    }

    #[tokio::test]
    async fn test_inline_uploads_without_concurrency() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut w = writer(&store, 0).await;
        w.put_part(Part::new(1, &b"world"[..])).await.unwrap();
        assert_eq!(w.outstanding(), 0);
        w.put_part(Part::new(0, &b"hello "[..])).await.unwrap();
        w.close().await.unwrap();
        let data = store.get_object("bucket", "obj").await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut w = writer(&store, 2).await;
        w.put_part(Part::new(0, &b"x"[..])).await.unwrap();
        w.close().await.unwrap();
        w.close().await.unwrap();
        assert_eq!(store.completions().len(), 1);
        assert!(matches!(
            w.put_part(Part::new(1, &b"y"[..])).await,
            Err(BlobStoreError::WriterClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_part_prevents_finalize() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_upload(1);
        let mut w = writer(&store, 2).await;
        for number in 0..3u32 {
            // The failure may surface here or at close.
            if w.put_part(Part::new(number, vec![1u8; 4])).await.is_err() {
                break;
            }
        }
        let err = w.close().await.unwrap_err();
        assert!(matches!(err, BlobStoreError::TransferFailure { number: 1, .. }));
        assert!(store.completions().is_empty());
        assert_eq!(store.open_uploads(), 1);

        w.abort().await.unwrap();
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_gap_is_not_finalized() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut w = writer(&store, 2).await;
        w.put_part(Part::new(0, &b"a"[..])).await.unwrap();
        w.put_part(Part::new(2, &b"c"[..])).await.unwrap();
        assert!(matches!(
            w.close().await,
            Err(BlobStoreError::MissingParts {
                expected: 3,
                received: 2
            })
        ));
        assert!(matches!(
            w.close().await,
            Err(BlobStoreError::MissingParts { expected: 3, .. })
        ));
        assert!(store.completions().is_empty());
        assert_eq!(store.open_uploads(), 1);
    }

    #[tokio::test]
    async fn test_expected_part_count_is_enforced() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut w = writer(&store, 2).await;
        w.expect_part_count(3);
        w.put_part(Part::new(0, &b"a"[..])).await.unwrap();
        w.put_part(Part::new(1, &b"b"[..])).await.unwrap();
        assert!(matches!(
            w.close().await,
            Err(BlobStoreError::MissingParts { expected: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_part_rejected() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut w = writer(&store, 2).await;
        w.put_part(Part::new(0, &b"a"[..])).await.unwrap();
        assert!(matches!(
            w.put_part(Part::new(0, &b"b"[..])).await,
            Err(BlobStoreError::DuplicatePart { number: 0 })
        ));
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_session_open() {
        let store = Arc::new(InMemoryObjectStore::new());
        {
            let mut w = writer(&store, 2).await;
            w.put_part(Part::new(0, &b"a"[..])).await.unwrap();
        }
        assert_eq!(store.open_uploads(), 1);
        assert!(store.completions().is_empty());
    }

    #[tokio::test]
    async fn test_close_repeats_failure_reported_by_put_part() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_upload(0);
        let mut w = writer(&store, 1).await;
        w.put_part(Part::new(0, &b"a"[..])).await.unwrap();
        // The window is full, so this waits for part 0 and reports its failure.
        let err = w.put_part(Part::new(1, &b"b"[..])).await.unwrap_err();
        assert!(matches!(err, BlobStoreError::TransferFailure { number: 0, .. }));
        assert!(matches!(
            w.put_part(Part::new(2, &b"c"[..])).await,
            Err(BlobStoreError::UploadAborted { .. })
        ));

        for _ in 0..2 {
            let err = w.close().await.unwrap_err();
            assert!(matches!(err, BlobStoreError::TransferFailure { number: 0, .. }));
            assert!(err.is_retryable());
            assert!(!err.is_not_found());
        }
        assert!(store.completions().is_empty());
        assert_eq!(store.open_uploads(), 1);
        w.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_part_is_rejected() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut w = writer(&store, 0).await;
        assert!(matches!(
            w.put_part(Part::new(u32::MAX, &b"x"[..])).await,
            Err(BlobStoreError::PartOutOfRange { limit: 10_000, .. })
        ));
        w.expect_part_count(2);
        assert!(matches!(
            w.put_part(Part::new(2, &b"x"[..])).await,
            Err(BlobStoreError::PartOutOfRange { number: 2, limit: 2 })
        ));

        w.put_part(Part::new(0, &b"a"[..])).await.unwrap();
        w.put_part(Part::new(1, &b"b"[..])).await.unwrap();
        w.close().await.unwrap();
        assert_eq!(store.completions(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_crashed_upload_names_its_part() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.panic_upload(1);
        let mut w = writer(&store, 2).await;
        w.put_part(Part::new(0, &b"a"[..])).await.unwrap();
        w.put_part(Part::new(1, &b"b"[..])).await.unwrap();
        match w.close().await {
            Err(err @ BlobStoreError::TransferFailure { number: 1, .. }) => {
                assert!(!err.is_retryable());
            }
            other => panic!("expected failure of part 1, got {other:?}"),
        }
        assert!(store.completions().is_empty());
        w.abort().await.unwrap();
    }
}
