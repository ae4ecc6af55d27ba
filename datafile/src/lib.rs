// Copyright 2024 Oxide Computer Company

//! Core engine of an incremental file system: files whose blocks arrive
//! lazily, readers that block until the block they need is filled, a
//! mount-wide log of completed reads, and Merkle tree verification of
//! every block read.

use incfs_common::FileId;
use serde::{Deserialize, Serialize};

mod backing;
mod clock;
mod data_file;
mod fill;
mod filled;
mod hash_tree;
mod mount;
mod page_cache;
mod pending;
mod raw_file;
mod read_log;
mod verify;
mod wait;

pub use backing::{
    BackingFile, FileHeader, MetadataEntry, MetadataRecord, RawBlockEntry,
    BLOCK_FLAG_COMPRESSED_LZ4, HEADER_FLAG_COMPLETE, MAX_BLOCK_DATA_OFFSET,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use data_file::{
    Compression, DataFile, DataFileBlock, DataFileCell, FileAttr,
    SignatureLayout, MAX_BLOCK_COUNT, SEGMENTS_PER_FILE,
};
pub use fill::{BlockKind, FillBlock};
pub use filled::{
    FilledBlocks, FilledRange, GetFilledBlocksArgs, READ_BLOCKMAP_ENTRIES,
};
pub use hash_tree::{
    build_hash_tree, HashAlgorithm, HashTree, Signature, MAX_HASH_TREE_LEVELS,
};
pub use mount::{MountState, Owner};
pub use pending::{PendingRead, PendingReadGuard, PendingReads};
pub use raw_file::{NewFile, RawBackingFile};
pub use read_log::{
    LogRecordBase, ReadLog, ReadLogState, MAX_RECORD_SIZE, READ_LOG_PAGE_SIZE,
};
pub use wait::{CancelToken, WaitQueue};

/// One read, either still pending or already completed and logged
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadInfo {
    pub file_id: FileId,
    pub block_index: u32,
    /// Pending read serial number, or read log record number
    pub serial_number: u64,
    pub timestamp_us: u64,
}
