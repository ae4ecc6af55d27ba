// Copyright 2024 Oxide Computer Company
use std::fmt;

use incfs_common::{FileId, IncfsError};
use serde::{Deserialize, Serialize};

/// Header flag: every data and hash block is present
pub const HEADER_FLAG_COMPLETE: u32 = 1 << 0;

/// Blockmap entry flag: the stored payload is LZ4 block compressed
pub const BLOCK_FLAG_COMPRESSED_LZ4: u16 = 1 << 0;

/// Largest backing file offset a blockmap entry can address (48 bits)
pub const MAX_BLOCK_DATA_OFFSET: u64 = (1 << 48) - 1;

/// Decoded fixed-size backing file header
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Offset of the first metadata record, zero for none
    pub metadata_offset: u64,
    pub file_id: FileId,
    /// Logical file size in bytes
    pub size: u64,
    pub flags: u32,
}

/// One packed blockmap entry as it sits on disk
///
/// An entry whose offset and size are both zero describes a block that has
/// not been filled yet.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RawBlockEntry {
    pub data_offset_lo: u32,
    pub data_offset_hi: u16,
    pub data_size: u16,
    pub flags: u16,
}

impl RawBlockEntry {
    pub const SIZE: usize = 10;

    pub fn new(
        offset: u64,
        size: u16,
        flags: u16,
    ) -> Result<RawBlockEntry, IncfsError> {
        if offset > MAX_BLOCK_DATA_OFFSET {
            incfs_common::incfs_bail!(
                RangeError,
                "block offset {:#x} does not fit a blockmap entry",
                offset
            );
        }
        Ok(RawBlockEntry {
            data_offset_lo: offset as u32,
            data_offset_hi: (offset >> 32) as u16,
            data_size: size,
            flags,
        })
    }

    pub fn data_offset(&self) -> u64 {
        ((self.data_offset_hi as u64) << 32) | self.data_offset_lo as u64
    }

    pub fn to_le_bytes(&self) -> [u8; RawBlockEntry::SIZE] {
        let mut out = [0u8; RawBlockEntry::SIZE];
        out[0..4].copy_from_slice(&self.data_offset_lo.to_le_bytes());
        out[4..6].copy_from_slice(&self.data_offset_hi.to_le_bytes());
        out[6..8].copy_from_slice(&self.data_size.to_le_bytes());
        out[8..10].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn from_le_bytes(b: &[u8; RawBlockEntry::SIZE]) -> RawBlockEntry {
        RawBlockEntry {
            data_offset_lo: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            data_offset_hi: u16::from_le_bytes([b[4], b[5]]),
            data_size: u16::from_le_bytes([b[6], b[7]]),
            flags: u16::from_le_bytes([b[8], b[9]]),
        }
    }
}

/// Typed payload of one metadata record
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataRecord {
    /// Location of the blockmap and how many entries it holds
    Blockmap { base_offset: u64, block_count: u32 },

    /// Location of the opaque attribute value and its checksum
    FileAttr { offset: u64, size: u16, checksum: u64 },

    /// Location of the hash tree area and of the signature blob
    Signature {
        hash_offset: u64,
        hash_size: u32,
        sig_offset: u64,
        sig_size: u32,
    },
}

/// A metadata record together with its place in the chain
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    /// Offset this record was read from
    pub offset: u64,
    /// Offset of the next record, zero at the end of the chain
    pub next_offset: u64,
    pub record: MetadataRecord,
}

/**
 * Positioned access to the on-disk container of an incremental file.
 *
 * Reads may run concurrently.  Writes that change the layout (data
 * appends, hash block writes, header flag updates) are serialized by the
 * caller, which holds the per-file backing lock around them.
 */
pub trait BackingFile: Send + Sync + fmt::Debug {
    /// Whether the container is a regular file
    fn is_regular_file(&self) -> bool;

    /// Read up to `buf.len()` bytes at `offset`, returning how many were
    /// read.  A count below `buf.len()` means end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, IncfsError>;

    fn read_header(&self) -> Result<FileHeader, IncfsError>;

    fn read_metadata_record(
        &self,
        offset: u64,
    ) -> Result<MetadataEntry, IncfsError>;

    /// Fill `out` with consecutive blockmap entries starting at
    /// `start_index`.  Returns the number of entries read, which is short
    /// only at end of file.
    fn read_blockmap_entries(
        &self,
        out: &mut [RawBlockEntry],
        start_index: u32,
        blockmap_offset: u64,
    ) -> Result<usize, IncfsError>;

    /// Store `data` for data block `index` and point its blockmap entry at
    /// it.
    fn write_data_block(
        &self,
        data: &[u8],
        index: u32,
        blockmap_offset: u64,
        flags: u16,
    ) -> Result<(), IncfsError>;

    /// Store hash block `index` inside the hash tree area and record it in
    /// blockmap entry `data_block_count + index`.
    fn write_hash_block(
        &self,
        data: &[u8],
        index: u32,
        hash_area_offset: u64,
        blockmap_offset: u64,
        data_block_count: u32,
    ) -> Result<(), IncfsError>;

    fn write_header_flags(&self, flags: u32) -> Result<(), IncfsError>;

    /// Read exactly `buf.len()` bytes, reporting a short read as an error
    fn read_exact_at(
        &self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), IncfsError> {
        let n = self.read_at(buf, offset)?;
        if n != buf.len() {
            return Err(IncfsError::ShortRead {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    fn read_blockmap_entry(
        &self,
        index: u32,
        blockmap_offset: u64,
    ) -> Result<RawBlockEntry, IncfsError> {
        let mut entry = [RawBlockEntry::default()];
        let n = self.read_blockmap_entries(&mut entry, index, blockmap_offset)?;
        if n != 1 {
            incfs_common::incfs_bail!(
                IoError,
                "blockmap entry {} is past the end of the backing file",
                index
            );
        }
        Ok(entry[0])
    }
}
