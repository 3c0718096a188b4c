//! Object store adapter (cAdapter)
//!
//! Submodules:
//! - `client`: the protocol trait the transfer engine drives
//! - `s3`: implementation over aws-sdk-s3
//! - `memory`: in-process implementation for tests and demos
pub mod client;
pub mod memory;
pub mod s3;

pub use client::{ObjectHead, ObjectStoreClient, WirePart};
pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectClient;
