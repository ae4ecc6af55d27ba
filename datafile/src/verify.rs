// Copyright 2024 Oxide Computer Company
use incfs_common::{
    blocks_count_for_size, IncfsError, IntegrityError, DATA_FILE_BLOCK_SIZE,
};
use slog::debug;

use crate::data_file::DataFile;
use crate::hash_tree::MAX_HASH_TREE_LEVELS;

impl DataFile {
    /**
     * Check a full, zero padded data block against the hash tree.
     *
     * The walk starts at the root hash and goes down one level at a time.
     * Hash pages that were verified before come from the page cache;
     * others are read from the hash area into `buf`, verified against the
     * digest from the level above, and cached.
     */
    pub(crate) fn validate_hash_tree(
        &self,
        block_index: u32,
        data: &[u8],
        buf: &mut [u8],
    ) -> Result<(), IncfsError> {
        let (Some(tree), Some(sig)) = (&self.hash_tree, &self.signature) else {
            return Ok(());
        };
        let bs = DATA_FILE_BLOCK_SIZE as u64;
        let digest_size = tree.alg.digest_size();
        let per_block = tree.alg.hashes_per_block() as u64;

        let mut hash_block_offset = [0u64; MAX_HASH_TREE_LEVELS];
        let mut hash_offset_in_block = [0usize; MAX_HASH_TREE_LEVELS];
        let mut index = block_index as u64;
        for lvl in 0..tree.depth {
            let at = index * digest_size as u64;
            hash_block_offset[lvl] = tree.level_offset[lvl] + at / bs * bs;
            hash_offset_in_block[lvl] = (at % bs) as usize;
            index /= per_block;
        }

        let file_pages = blocks_count_for_size(self.size);
        let buf = &mut buf[..DATA_FILE_BLOCK_SIZE];
        let mut stored_digest = tree.root_hash.clone();

        for lvl in (0..tree.depth).rev() {
            let page_index = file_pages + hash_block_offset[lvl] / bs;
            let in_block = hash_offset_in_block[lvl];

            if let Some(page) = self.page_cache.find(page_index) {
                if page.read_checked(in_block, &mut stored_digest) {
                    continue;
                }
            }

            self.backing
                .read_exact_at(buf, sig.hash_offset + hash_block_offset[lvl])?;
            let calculated = tree.alg.digest(buf);
            if calculated != stored_digest {
                let zero = stored_digest.iter().all(|b| *b == 0);
                debug!(self.log, "hash mismatch";
                    "level" => lvl,
                    "block" => block_index,
                    "expected" => hex::encode(&stored_digest),
                    "calculated" => hex::encode(&calculated));
                if zero {
                    debug!(self.log,
                        "stored digest is all zero, hashes were probably \
                         never loaded");
                }
                return Err(IntegrityError::HashMismatch {
                    level: lvl,
                    block: block_index,
                    stored_digest_zero: zero,
                }
                .into());
            }

            stored_digest.copy_from_slice(&buf[in_block..in_block + digest_size]);
            self.page_cache.grab(page_index).fill_checked(buf);
        }

        let calculated = tree.alg.digest(data);
        if calculated != stored_digest {
            debug!(self.log, "leaf hash mismatch";
                "block" => block_index,
                "expected" => hex::encode(&stored_digest),
                "calculated" => hex::encode(&calculated));
            return Err(IntegrityError::LeafHashMismatch { block: block_index }.into());
        }
        Ok(())
    }
}
