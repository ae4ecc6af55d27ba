// Copyright 2024 Oxide Computer Company
use incfs_common::{incfs_bail, IncfsError, DATA_FILE_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deepest hash tree we accept
pub const MAX_HASH_TREE_LEVELS: usize = 8;

const SIGNATURE_VERSION: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    pub fn hashes_per_block(&self) -> usize {
        DATA_FILE_BLOCK_SIZE / self.digest_size()
    }
}

/// The signature blob stored in a backing file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub version: u32,
    pub hash_algorithm: HashAlgorithm,
    pub root_hash: Vec<u8>,
    /// Opaque bytes signed by the producer over the root hash
    pub signature: Vec<u8>,
}

impl Signature {
    pub fn new(
        hash_algorithm: HashAlgorithm,
        root_hash: Vec<u8>,
        signature: Vec<u8>,
    ) -> Signature {
        Signature {
            version: SIGNATURE_VERSION,
            hash_algorithm,
            root_hash,
            signature,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IncfsError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Signature, IncfsError> {
        let sig: Signature = bincode::deserialize(b)?;
        if sig.version != SIGNATURE_VERSION {
            incfs_bail!(FormatError, "unknown signature version {}", sig.version);
        }
        if sig.root_hash.len() != sig.hash_algorithm.digest_size() {
            incfs_bail!(
                FormatError,
                "root hash is {} bytes, expected {}",
                sig.root_hash.len(),
                sig.hash_algorithm.digest_size()
            );
        }
        Ok(sig)
    }
}

/**
 * Layout of a Merkle tree over a file's data blocks.
 *
 * Level 0 holds the digests of the data blocks, each higher level holds
 * the digests of the blocks one level below, and the root hash is the
 * digest of the single block at the top level.  Levels are stored top
 * first, so the root level sits at the start of the hash area.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTree {
    pub alg: HashAlgorithm,
    pub depth: usize,
    /// Offset of each level inside the hash area, indexed by level
    pub level_offset: Vec<u64>,
    pub root_hash: Vec<u8>,
    pub area_size: u64,
}

impl HashTree {
    pub fn new(
        alg: HashAlgorithm,
        root_hash: Vec<u8>,
        data_block_count: u64,
    ) -> Result<HashTree, IncfsError> {
        let per_block = alg.hashes_per_block() as u64;
        let mut blocks_per_level = Vec::new();
        let mut blocks = data_block_count;
        while blocks > 1 {
            blocks = blocks.div_ceil(per_block);
            blocks_per_level.push(blocks);
            if blocks_per_level.len() > MAX_HASH_TREE_LEVELS {
                incfs_bail!(
                    FormatError,
                    "{} data blocks need more than {} hash levels",
                    data_block_count,
                    MAX_HASH_TREE_LEVELS
                );
            }
        }

        let depth = blocks_per_level.len();
        let mut level_offset = vec![0u64; depth];
        let mut offset = 0u64;
        for lvl in (0..depth).rev() {
            level_offset[lvl] = offset;
            offset += blocks_per_level[lvl] * DATA_FILE_BLOCK_SIZE as u64;
        }

        Ok(HashTree {
            alg,
            depth,
            level_offset,
            root_hash,
            area_size: offset,
        })
    }

    /// Parse a signature blob and lay out the tree it describes
    pub fn from_signature(
        sig: &[u8],
        data_block_count: u64,
    ) -> Result<HashTree, IncfsError> {
        let sig = Signature::from_bytes(sig)?;
        HashTree::new(sig.hash_algorithm, sig.root_hash, data_block_count)
    }

    pub fn hash_block_count(&self) -> u64 {
        self.area_size / DATA_FILE_BLOCK_SIZE as u64
    }
}

/// Digest of one data block, zero padded to a full block
pub(crate) fn leaf_digest(alg: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    if data.len() == DATA_FILE_BLOCK_SIZE {
        alg.digest(data)
    } else {
        let mut block = vec![0u8; DATA_FILE_BLOCK_SIZE];
        block[..data.len()].copy_from_slice(data);
        alg.digest(&block)
    }
}

/**
 * Build the hash area and root hash for a complete file image.
 *
 * The returned area is laid out exactly as `HashTree::new` describes, so
 * hash block `i` is `area[i * 4096..(i + 1) * 4096]`.
 */
pub fn build_hash_tree(
    alg: HashAlgorithm,
    image: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), IncfsError> {
    let bs = DATA_FILE_BLOCK_SIZE;
    let data_blocks = image.len().div_ceil(bs) as u64;
    let tree = HashTree::new(alg, Vec::new(), data_blocks)?;
    let digest_size = alg.digest_size();

    let mut area = Vec::new();
    area.try_reserve_exact(tree.area_size as usize)?;
    area.resize(tree.area_size as usize, 0u8);

    let mut digests: Vec<Vec<u8>> =
        image.chunks(bs).map(|c| leaf_digest(alg, c)).collect();
    if digests.is_empty() {
        digests.push(leaf_digest(alg, &[]));
    }

    for lvl in 0..tree.depth {
        let base = tree.level_offset[lvl] as usize;
        for (i, d) in digests.iter().enumerate() {
            let at = base + i * digest_size;
            area[at..at + digest_size].copy_from_slice(d);
        }
        let level_blocks = digests.len().div_ceil(alg.hashes_per_block());
        digests = (0..level_blocks)
            .map(|b| {
                let at = base + b * bs;
                alg.digest(&area[at..at + bs])
            })
            .collect();
    }

    let root = digests.remove(0);
    Ok((area, root))
}
