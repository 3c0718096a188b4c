//! Chunked, bounded-concurrency transfer of large blobs between S3 and a
//! local directory.
pub mod blobstore;
pub mod cadapter;
pub mod chunk;
pub mod config;
pub mod error;
pub mod transfer;

pub use blobstore::{Blob, BlobStore, Parts, Writer};
pub use error::{BlobStoreError, Result};
