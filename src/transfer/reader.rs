//! PartReader: fetches the parts of a remote object with a sliding window of
//! concurrent range reads.
//!
//! Parts come out in completion order, not part order. Consumers that need the
//! original byte order must key the results by `Part::number`.

use crate::cadapter::client::ObjectStoreClient;
use crate::chunk::part::{self, Part};
use crate::chunk::policy::{ChunkPolicy, TransferDescriptor};
use crate::error::{BlobStoreError, Result};
use futures::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tracing::debug;

/// Number of range reads kept in flight by default.
pub const DEFAULT_READ_WINDOW: usize = 2;

pub struct PartReader {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    descriptor: TransferDescriptor,
    window: usize,
    next_number: u32,
    in_flight: JoinSet<Result<Part>>,
    /// Part number of every running fetch task.
    numbers: HashMap<task::Id, u32>,
    finished: bool,
}

impl PartReader {
    /// Looks up the object size and derives the part layout. Nothing is
    /// fetched until the first call to [`PartReader::next_part`].
    pub async fn open(
        client: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        policy: ChunkPolicy,
        window: usize,
    ) -> Result<Self> {
        let bucket = bucket.into();
        let key = key.into();
        let head = client.head_object(&bucket, &key).await?;
        Ok(Self::with_size(client, bucket, key, head.size, policy, window))
    }

    pub fn with_size(
        client: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        policy: ChunkPolicy,
        window: usize,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key: key.into(),
            descriptor: policy.describe(size),
            window: window.max(1),
            next_number: 0,
            in_flight: JoinSet::new(),
            numbers: HashMap::new(),
            finished: false,
        }
    }

    /// Number of parts this reader yields in total.
    pub fn len(&self) -> usize {
        self.descriptor.part_count as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.descriptor.chunk_size
    }

    pub fn descriptor(&self) -> TransferDescriptor {
        self.descriptor
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Next completed part, `None` once every part has been yielded or after
    /// an error has been returned.
    pub async fn next_part(&mut self) -> Option<Result<Part>> {
        if self.finished {
            return None;
        }
        if self.descriptor.part_count == 1 {
            // A single part covers the whole object; no window needed.
            self.finished = true;
            self.next_number = 1;
            let fetched = self
                .client
                .get_object(&self.bucket, &self.key)
                .await
                .map(|data| Part::new(0, data))
                .map_err(|e| BlobStoreError::transfer(0, e));
            return Some(fetched);
        }

        self.fill_window();
        let completed = match self.in_flight.join_next_with_id().await {
            Some(Ok((id, fetched))) => {
                self.numbers.remove(&id);
                fetched
            }
            Some(Err(e)) => match self.numbers.remove(&e.id()) {
                Some(number) => Err(BlobStoreError::transfer(number, e.into())),
                None => Err(e.into()),
            },
            None => {
                self.finished = true;
                return None;
            }
        };
        match completed {
            Ok(part) => {
                self.fill_window();
                Some(Ok(part))
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Part>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_part().await.map(|item| (item, reader))
        })
    }

    fn fill_window(&mut self) {
        while self.in_flight.len() < self.window
            && u64::from(self.next_number) < self.descriptor.part_count
        {
            let number = self.next_number;
            self.next_number += 1;
            let client = Arc::clone(&self.client);
            let bucket = self.bucket.clone();
            let key = self.key.clone();
            let chunk_size = self.descriptor.chunk_size;
            let handle = self.in_flight.spawn(async move {
                fetch_part(client.as_ref(), &bucket, &key, number, chunk_size).await
            });
            self.numbers.insert(handle.id(), number);
        }
    }

    /// Stops the reader: nothing further is scheduled and running fetches are
    /// cancelled.
    pub fn close(&mut self) {
        self.finished = true;
        self.in_flight.abort_all();
        self.numbers.clear();
    }
}

async fn fetch_part(
    client: &dyn ObjectStoreClient,
    bucket: &str,
    key: &str,
    number: u32,
    chunk_size: u64,
) -> Result<Part> {
    let range = part::byte_range(number, chunk_size);
    let data = client
        .get_range(bucket, key, &range)
        .await
        .map_err(|e| BlobStoreError::transfer(number, e))?;
    debug!("Fetched part {number} of {key} ({} bytes)", data.len());
    Ok(Part::new(number, data))
}
