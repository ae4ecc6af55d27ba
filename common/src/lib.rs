// Copyright 2024 Oxide Computer Company
use std::fmt;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;
use uuid::Uuid;

mod error;
mod options;

pub use error::{IncfsError, IntegrityError};
pub use options::*;

/// Size of a data block, a hash block, and a cached hash page
pub const DATA_FILE_BLOCK_SIZE: usize = 4096;

/// Largest value a file attribute record may describe
pub const MAX_FILE_ATTR_SIZE: usize = 512;

/// Number of blocks needed to hold `size` bytes
pub fn blocks_count_for_size(size: u64) -> u64 {
    size.div_ceil(DATA_FILE_BLOCK_SIZE as u64)
}

/// Opaque 128-bit identity of an incremental file
#[derive(
    Deserialize,
    Serialize,
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new_v4() -> FileId {
        FileId(Uuid::new_v4())
    }

    pub fn from_bytes(b: [u8; 16]) -> FileId {
        FileId(Uuid::from_bytes(b))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checksum used for metadata records and attribute values
pub fn integrity_hash(args: &[&[u8]]) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    for arg in args {
        std::hash::Hasher::write(&mut hasher, arg);
    }
    std::hash::Hasher::finish(&hasher)
}

pub fn build_logger() -> Logger {
    let level = std::env::var("INCFS_LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse::<slog::Level>().ok())
        .unwrap_or(slog::Level::Info);
    build_logger_with_level(level)
}

pub fn build_logger_with_level(level: slog::Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(level)
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let parent = file.parent().context("file path has no parent")?;
    let mut tmpf = NamedTempFile::new_in(parent)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}

pub fn mkdir_for_file(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
