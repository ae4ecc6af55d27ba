// Copyright 2024 Oxide Computer Company
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A verified block did not match the digest chain rooted in the signature
#[derive(Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum IntegrityError {
    #[error(
        "hash mismatch at level {level} for block {block} \
         (stored digest all zero: {stored_digest_zero})"
    )]
    HashMismatch {
        level: usize,
        block: u32,
        /// The expected digest was all zero, which usually means the hash
        /// blocks were never filled rather than real corruption.
        stored_digest_zero: bool,
    },

    #[error("leaf hash mismatch for block {block}")]
    LeafHashMismatch { block: u32 },
}

#[derive(Error, Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum IncfsError {
    #[error("Bad metadata: {0}")]
    FormatError(String),

    #[error("Out of range: {0}")]
    RangeError(String),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Timed out waiting for data")]
    TimedOut,

    #[error("Wait interrupted")]
    Interrupted,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Data not found: {0}")]
    DataNotFound(String),

    #[error("IO Error: {0}")]
    IoError(String),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Decompression error: {0}")]
    DecompressionError(String),
}

impl IncfsError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, IncfsError::Integrity(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IncfsError::TimedOut)
    }
}

impl From<std::io::Error> for IncfsError {
    fn from(e: std::io::Error) -> Self {
        IncfsError::IoError(format!("{:?}", e))
    }
}

impl From<nix::errno::Errno> for IncfsError {
    fn from(e: nix::errno::Errno) -> Self {
        IncfsError::IoError(e.to_string())
    }
}

impl From<bincode::Error> for IncfsError {
    fn from(e: bincode::Error) -> Self {
        IncfsError::FormatError(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for IncfsError {
    fn from(_: std::collections::TryReserveError) -> Self {
        IncfsError::OutOfMemory
    }
}

#[macro_export]
macro_rules! incfs_bail {
    ($i:ident) => { return Err($crate::IncfsError::$i) };
    ($i:ident, $str:expr) => {
        return Err($crate::IncfsError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::IncfsError::$i(format!($fmt, $($arg)*)))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn bail_range(n: u32) -> Result<(), IncfsError> {
        if n > 3 {
            incfs_bail!(RangeError, "block {} is past the end", n);
        }
        Ok(())
    }

    fn bail_timeout() -> Result<(), IncfsError> {
        incfs_bail!(TimedOut);
    }

    #[test]
    fn bail_macro_builds_variants() {
        assert_eq!(bail_range(1), Ok(()));
        assert_eq!(
            bail_range(7),
            Err(IncfsError::RangeError("block 7 is past the end".to_string()))
        );
        assert!(bail_timeout().unwrap_err().is_timeout());
    }

    #[test]
    fn integrity_errors_are_distinct_from_timeouts() {
        let e: IncfsError = IntegrityError::LeafHashMismatch { block: 4 }.into();
        assert!(e.is_integrity());
        assert!(!e.is_timeout());

        let e = IncfsError::from(IntegrityError::HashMismatch {
            level: 1,
            block: 9,
            stored_digest_zero: true,
        });
        assert!(e.to_string().contains("all zero: true"));
    }
}
