//! Part addressing.
//!
//! Parts are numbered from zero inside the crate. The S3 wire protocol numbers
//! them from one; conversion happens only at the adapter boundary.

use bytes::Bytes;

/// One contiguous byte range of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub number: u32,
    pub data: Bytes,
}

impl Part {
    pub fn new(number: u32, data: impl Into<Bytes>) -> Self {
        Self {
            number,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Acknowledgement of one uploaded part, numbered zero-based like [`Part`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReceipt {
    pub number: u32,
    pub tag: String,
}

/// One-based wire number, saturating at `i32::MAX`. Writers reject part
/// numbers past the store's limit before they get here.
pub fn to_wire(number: u32) -> i32 {
    number
        .checked_add(1)
        .and_then(|wire| i32::try_from(wire).ok())
        .unwrap_or(i32::MAX)
}

/// Inverse of [`to_wire`]; wire numbers below one map to part zero.
pub fn from_wire(number: i32) -> u32 {
    u32::try_from(number.saturating_sub(1)).unwrap_or(0)
}

/// HTTP range header selecting part `number`. The end may run past the object;
/// the store clamps it.
pub fn byte_range(number: u32, chunk_size: u64) -> String {
    let offset = u64::from(number) * chunk_size;
    format!("bytes={}-{}", offset, offset + chunk_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_numbers_are_one_based() {
        assert_eq!(to_wire(0), 1);
        assert_eq!(to_wire(9_999), 10_000);
        assert_eq!(from_wire(1), 0);
        assert_eq!(from_wire(10_000), 9_999);
        assert_eq!(to_wire(u32::MAX), i32::MAX);
        assert_eq!(to_wire(i32::MAX as u32), i32::MAX);
    }

    #[test]
    fn test_byte_range() {
        assert_eq!(byte_range(0, 64), "bytes=0-63");
        assert_eq!(byte_range(2, 64), "bytes=128-191");
    }
}
