use crate::chunk::policy::ChunkPolicy;
use crate::transfer::{DEFAULT_CONCURRENT_UPLOADS, DEFAULT_READ_WINDOW};

/// Settings shared by every transfer made through a blob store.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Range reads kept in flight by a part reader.
    pub read_window: usize,
    /// Part uploads kept in flight by a multipart writer; 0 uploads inline.
    pub concurrent_uploads: usize,
    pub policy: ChunkPolicy,
    /// Custom S3 endpoint, e.g. a local MinIO.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_window: DEFAULT_READ_WINDOW,
            concurrent_uploads: DEFAULT_CONCURRENT_UPLOADS,
            policy: ChunkPolicy::default(),
            endpoint_url: None,
            region: None,
        }
    }
}
