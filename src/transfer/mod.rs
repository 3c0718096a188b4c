//! Bounded-concurrency part transfer against a remote object store.
//!
//! - `reader`: fetches parts with at most `window` range reads in flight
//! - `writer`: uploads parts with at most `concurrency` uploads in flight
pub mod reader;
pub mod writer;

pub use reader::{DEFAULT_READ_WINDOW, PartReader};
pub use writer::{DEFAULT_CONCURRENT_UPLOADS, MultipartWriter};

use crate::error::{BlobStoreError, Result};

/// Checks that `numbers` (ascending) is exactly `0..n` with `n >= 1`, and that
/// `n` matches `expected` when the part count is known up front.
pub(crate) fn ensure_complete<'a>(
    numbers: impl ExactSizeIterator<Item = &'a u32>,
    expected: Option<u64>,
) -> Result<()> {
    let received = numbers.len();
    let mut highest = None;
    let mut contiguous = true;
    for (index, number) in numbers.enumerate() {
        contiguous &= *number as usize == index;
        highest = Some(*number);
    }
    let required = expected
        .map(|count| count as usize)
        .unwrap_or_else(|| highest.map_or(1, |n| n as usize + 1));
    if !contiguous || received == 0 || received != required {
        return Err(BlobStoreError::MissingParts {
            expected: required.max(1),
            received,
        });
    }
    Ok(())
}

/// Rejects part numbers at or above `limit` before anything is uploaded.
pub(crate) fn ensure_in_range(number: u32, limit: u64) -> Result<()> {
    if u64::from(number) >= limit {
        return Err(BlobStoreError::PartOutOfRange { number, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_complete() {
        assert!(ensure_complete([0u32, 1, 2].iter(), None).is_ok());
        assert!(ensure_complete([0u32, 1, 2].iter(), Some(3)).is_ok());
        assert!(ensure_complete([0u32, 2].iter(), None).is_err());
        assert!(ensure_complete([1u32, 2].iter(), None).is_err());
        assert!(ensure_complete([0u32, 1].iter(), Some(3)).is_err());
        match ensure_complete(std::iter::empty::<&u32>(), None) {
            Err(BlobStoreError::MissingParts { expected, received }) => {
                assert_eq!((expected, received), (1, 0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ensure_in_range() {
        assert!(ensure_in_range(9_999, 10_000).is_ok());
        assert!(matches!(
            ensure_in_range(10_000, 10_000),
            Err(BlobStoreError::PartOutOfRange { number: 10_000, limit: 10_000 })
        ));
        assert!(ensure_in_range(u32::MAX, 10_000).is_err());
    }
}
