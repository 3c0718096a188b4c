//! Chunk size policy: object size -> (chunk size, part count).
//!
//! Reader and writer both derive part boundaries from here, so the two sides
//! of a transfer can never disagree about where a part starts.

pub const MIB: u64 = 1024 * 1024;

/// Smallest chunk used for multipart transfers.
pub const MIN_CHUNK_SIZE: u64 = 64 * MIB;

/// Objects at or above this size go through the multipart protocol.
pub const MULTIPART_THRESHOLD: u64 = MIN_CHUNK_SIZE + 1;

/// Hard limit on parts per multipart upload imposed by S3.
pub const MAX_PART_COUNT: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub min_chunk_size: u64,
    pub max_part_count: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_chunk_size: MIN_CHUNK_SIZE,
            max_part_count: MAX_PART_COUNT,
        }
    }
}

impl ChunkPolicy {
    /// Panics when either limit is zero; such a policy is a programming error.
    pub fn new(min_chunk_size: u64, max_part_count: u64) -> Self {
        assert!(min_chunk_size > 0, "min_chunk_size must be positive");
        assert!(max_part_count > 0, "max_part_count must be positive");
        Self {
            min_chunk_size,
            max_part_count,
        }
    }

    pub fn chunk_size(&self, total_size: u64) -> u64 {
        if total_size <= self.max_part_count.saturating_mul(self.min_chunk_size) {
            self.min_chunk_size
        } else {
            let raw = total_size.div_ceil(self.max_part_count);
            raw.div_ceil(MIB) * MIB
        }
    }

    pub fn part_count(&self, total_size: u64) -> u64 {
        if total_size == 0 {
            1
        } else {
            total_size.div_ceil(self.chunk_size(total_size))
        }
    }

    pub fn describe(&self, total_size: u64) -> TransferDescriptor {
        let chunk_size = self.chunk_size(total_size);
        TransferDescriptor {
            size: total_size,
            chunk_size,
            part_count: self.part_count(total_size),
        }
    }
}

/// Chunk size under the S3 limits.
pub fn chunk_size(total_size: u64) -> u64 {
    ChunkPolicy::default().chunk_size(total_size)
}

/// Part count under the S3 limits; an empty object is still one part.
pub fn part_count(total_size: u64) -> u64 {
    ChunkPolicy::default().part_count(total_size)
}

/// Part layout of a single transfer, derived once from the object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub size: u64,
    pub chunk_size: u64,
    pub part_count: u64,
}

impl TransferDescriptor {
    /// `(offset, len)` of part `number`. The last part may be shorter.
    pub fn part_range(&self, number: u32) -> (u64, u64) {
        let offset = u64::from(number) * self.chunk_size;
        let len = self.size.saturating_sub(offset).min(self.chunk_size);
        (offset, len)
    }

    pub fn is_multipart(&self) -> bool {
        self.part_count > 1
    }
}
