// Copyright 2024 Oxide Computer Company
use incfs_common::{incfs_bail, IncfsError, DATA_FILE_BLOCK_SIZE};
use slog::warn;

use crate::backing::BLOCK_FLAG_COMPRESSED_LZ4;
use crate::data_file::{Compression, DataFile};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    Hash,
}

/// One block handed to `fill_blocks`
#[derive(Debug, Copy, Clone)]
pub struct FillBlock<'a> {
    pub block_index: u32,
    pub kind: BlockKind,
    pub compression: Compression,
    pub data: &'a [u8],
}

impl DataFile {
    /**
     * Store data block `block_index` and wake every reader waiting for it.
     *
     * Filling a block that is already present succeeds without writing
     * anything.
     */
    pub fn fill_data_block(
        &self,
        block_index: u32,
        data: &[u8],
        compression: Compression,
    ) -> Result<(), IncfsError> {
        if block_index >= self.data_block_count {
            incfs_bail!(
                RangeError,
                "block {} is past the last data block {}",
                block_index,
                self.data_block_count
            );
        }
        if data.is_empty() || data.len() > DATA_FILE_BLOCK_SIZE {
            incfs_bail!(RangeError, "block payload of {} bytes", data.len());
        }
        if self.blockmap_offset == 0 {
            incfs_bail!(NoData, "file has no blockmap");
        }
        let flags = match compression {
            Compression::None => 0,
            Compression::Lz4 => BLOCK_FLAG_COMPRESSED_LZ4,
        };

        let segment = self.segment(block_index);
        let _guard = segment.blockmap_lock.lock().unwrap();
        if self.lookup_block(block_index)?.is_present() {
            return Ok(());
        }

        let res = {
            let _backing = self.backing_lock.lock().unwrap();
            self.backing.write_data_block(
                data,
                block_index,
                self.blockmap_offset,
                flags,
            )
        };
        if let Err(e) = res {
            warn!(self.log, "fill of block {} failed: {}", block_index, e);
            return Err(e);
        }

        self.mount
            .pending_reads()
            .notify(self.segment_key(block_index), block_index);
        segment.new_data_arrival.wake_all();
        Ok(())
    }

    /// Store hash block `block_index` of the hash tree area
    pub fn fill_hash_block(
        &self,
        block_index: u32,
        data: &[u8],
    ) -> Result<(), IncfsError> {
        let (Some(_), Some(sig)) = (&self.hash_tree, &self.signature) else {
            incfs_bail!(NotSupported, "file has no hash tree");
        };
        if sig.hash_offset == 0 {
            incfs_bail!(NotSupported, "file has no hash area");
        }
        if data.is_empty() || data.len() > DATA_FILE_BLOCK_SIZE {
            incfs_bail!(RangeError, "hash block of {} bytes", data.len());
        }
        let end = block_index as u64 * DATA_FILE_BLOCK_SIZE as u64
            + data.len() as u64;
        if (sig.hash_size as u64) < end {
            incfs_bail!(
                RangeError,
                "hash block {} ends past the hash area of {} bytes",
                block_index,
                sig.hash_size
            );
        }

        let _backing = self.backing_lock.lock().unwrap();
        self.backing
            .write_hash_block(
                data,
                block_index,
                sig.hash_offset,
                self.blockmap_offset,
                self.data_block_count,
            )
            .inspect_err(|e| {
                warn!(self.log, "fill of hash block {} failed: {}", block_index, e)
            })
    }

    /// Fill blocks in order.  Returns how many were stored before the first
    /// failure; a failure on the very first block is returned as an error.
    pub fn fill_blocks(&self, blocks: &[FillBlock]) -> Result<usize, IncfsError> {
        for (i, b) in blocks.iter().enumerate() {
            let res = match b.kind {
                BlockKind::Data => {
                    self.fill_data_block(b.block_index, b.data, b.compression)
                }
                BlockKind::Hash => self.fill_hash_block(b.block_index, b.data),
            };
            if let Err(e) = res {
                if i == 0 {
                    return Err(e);
                }
                return Ok(i);
            }
        }
        Ok(blocks.len())
    }
}
