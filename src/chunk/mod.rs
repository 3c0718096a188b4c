//! Chunk arithmetic shared by every backend.
//!
//! Submodules:
//! - `policy`: object size -> chunk size and part count
//! - `part`: the `Part` value and zero-based/one-based numbering
pub mod part;
pub mod policy;

pub use part::{CompletionReceipt, Part};
pub use policy::{
    ChunkPolicy, MAX_PART_COUNT, MIB, MIN_CHUNK_SIZE, MULTIPART_THRESHOLD, TransferDescriptor,
    chunk_size, part_count,
};
