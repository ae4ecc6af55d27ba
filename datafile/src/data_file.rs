// Copyright 2024 Oxide Computer Company
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use incfs_common::{
    blocks_count_for_size, incfs_bail, integrity_hash, FileId, IncfsError,
    DATA_FILE_BLOCK_SIZE, MAX_FILE_ATTR_SIZE,
};
use serde::{Deserialize, Serialize};
use slog::{debug, o, warn, Logger};

use crate::backing::*;
use crate::hash_tree::HashTree;
use crate::mount::MountState;
use crate::page_cache::HashPageCache;
use crate::pending::SegmentKey;
use crate::wait::{CancelToken, WaitQueue};

/// Number of independently locked blockmap segments per file
pub const SEGMENTS_PER_FILE: usize = 3;

/// Block indexes must fit the 30-bit fields of the read log
pub const MAX_BLOCK_COUNT: u64 = 1 << 30;

#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

/// Where a block's payload lives in the backing file
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DataFileBlock {
    pub backing_file_data_offset: u64,
    pub stored_size: u16,
    pub compression: Compression,
}

impl DataFileBlock {
    /// A filled block has both a payload offset and a nonzero stored size
    pub fn is_present(&self) -> bool {
        self.backing_file_data_offset != 0 && self.stored_size != 0
    }
}

impl From<&RawBlockEntry> for DataFileBlock {
    fn from(e: &RawBlockEntry) -> DataFileBlock {
        DataFileBlock {
            backing_file_data_offset: e.data_offset(),
            stored_size: e.data_size,
            compression: if e.flags & BLOCK_FLAG_COMPRESSED_LZ4 != 0 {
                Compression::Lz4
            } else {
                Compression::None
            },
        }
    }
}

/// Placement of the hash tree area and signature blob
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureLayout {
    pub hash_offset: u64,
    pub hash_size: u32,
    pub sig_offset: u64,
    pub sig_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttr {
    pub offset: u64,
    pub size: u16,
    pub checksum: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Segment {
    /// Serializes lookups and fills of blocks in this segment
    pub blockmap_lock: Mutex<()>,
    pub new_data_arrival: Arc<WaitQueue>,
}

/// Result of walking the metadata chain
#[derive(Debug, Default)]
struct MetadataScan {
    records: usize,
    blockmap_offset: u64,
    total_block_count: u32,
    attr: Option<FileAttr>,
    signature: Option<(SignatureLayout, HashTree)>,
}

impl MetadataScan {
    fn process_blockmap(
        &mut self,
        base_offset: u64,
        block_count: u32,
        data_block_count: u64,
    ) -> Result<(), IncfsError> {
        if data_block_count > block_count as u64 {
            incfs_bail!(
                FormatError,
                "blockmap holds {} entries for {} data blocks",
                block_count,
                data_block_count
            );
        }
        self.blockmap_offset = base_offset;
        self.total_block_count = block_count;
        Ok(())
    }

    fn process_file_attr(
        &mut self,
        offset: u64,
        size: u16,
        checksum: u64,
    ) -> Result<(), IncfsError> {
        if size as usize > MAX_FILE_ATTR_SIZE {
            incfs_bail!(FormatError, "attribute of {} bytes is too large", size);
        }
        self.attr = Some(FileAttr {
            offset,
            size,
            checksum,
        });
        Ok(())
    }

    fn process_signature(
        &mut self,
        backing: &dyn BackingFile,
        record_offset: u64,
        layout: SignatureLayout,
        data_block_count: u64,
    ) -> Result<(), IncfsError> {
        let mut sig = Vec::new();
        sig.try_reserve_exact(layout.sig_size as usize)?;
        sig.resize(layout.sig_size as usize, 0u8);
        match backing.read_exact_at(&mut sig, layout.sig_offset) {
            Ok(()) => {}
            Err(IncfsError::ShortRead { expected, actual }) => {
                incfs_bail!(
                    FormatError,
                    "signature truncated: {} of {} bytes",
                    actual,
                    expected
                );
            }
            Err(e) => return Err(e),
        }

        let tree = HashTree::from_signature(&sig, data_block_count)?;
        if tree.area_size != layout.hash_size as u64 {
            incfs_bail!(
                FormatError,
                "hash area is {} bytes, tree needs {}",
                layout.hash_size,
                tree.area_size
            );
        }
        if (layout.hash_size > 0 && record_offset <= layout.hash_offset)
            || record_offset <= layout.sig_offset
        {
            incfs_bail!(
                FormatError,
                "signature record at {:#x} precedes its payload",
                record_offset
            );
        }
        self.signature = Some((layout, tree));
        Ok(())
    }
}

fn scan_metadata_chain(
    backing: &dyn BackingFile,
    first_offset: u64,
    data_block_count: u64,
    log: &Logger,
) -> Result<MetadataScan, IncfsError> {
    let mut scan = MetadataScan::default();
    let mut offset = first_offset;
    while offset != 0 {
        let entry = backing.read_metadata_record(offset)?;
        match entry.record {
            MetadataRecord::Blockmap {
                base_offset,
                block_count,
            } => scan.process_blockmap(base_offset, block_count, data_block_count)?,
            MetadataRecord::FileAttr {
                offset: attr_offset,
                size,
                checksum,
            } => scan.process_file_attr(attr_offset, size, checksum)?,
            MetadataRecord::Signature {
                hash_offset,
                hash_size,
                sig_offset,
                sig_size,
            } => scan.process_signature(
                backing,
                entry.offset,
                SignatureLayout {
                    hash_offset,
                    hash_size,
                    sig_offset,
                    sig_size,
                },
                data_block_count,
            )?,
        }
        scan.records += 1;
        debug!(log, "metadata record {:?} at {:#x}", entry.record, offset);

        if entry.next_offset != 0 && entry.next_offset <= offset {
            incfs_bail!(
                FormatError,
                "metadata record at {:#x} points back to {:#x}",
                offset,
                entry.next_offset
            );
        }
        offset = entry.next_offset;
    }
    Ok(scan)
}

/**
 * An open incremental file.
 *
 * Blocks are spread over `SEGMENTS_PER_FILE` segments by index.  Each
 * segment lock covers blockmap lookups and fills in that segment, and each
 * segment wait queue wakes readers whose block was just filled.  The
 * backing lock serializes writes that change the backing file layout.
 */
#[derive(Debug)]
pub struct DataFile {
    pub(crate) log: Logger,
    pub(crate) mount: Arc<MountState>,
    pub(crate) backing: Box<dyn BackingFile>,
    pub(crate) backing_lock: Mutex<()>,
    /// Distinguishes files in the mount-wide pending read lists
    pub(crate) instance: u64,
    pub(crate) id: FileId,
    pub(crate) size: u64,
    pub(crate) metadata_offset: u64,
    pub(crate) header_flags: AtomicU32,
    pub(crate) data_block_count: u32,
    pub(crate) total_block_count: u32,
    pub(crate) blockmap_offset: u64,
    pub(crate) attr: Option<FileAttr>,
    pub(crate) hash_tree: Option<HashTree>,
    pub(crate) signature: Option<SignatureLayout>,
    pub(crate) segments: [Segment; SEGMENTS_PER_FILE],
    pub(crate) page_cache: HashPageCache,
    pub(crate) closing: AtomicBool,
}

impl DataFile {
    pub fn open(
        mount: &Arc<MountState>,
        backing: Box<dyn BackingFile>,
    ) -> Result<DataFile, IncfsError> {
        if !backing.is_regular_file() {
            incfs_bail!(FormatError, "backing file is not a regular file");
        }

        let backing_lock = Mutex::new(());
        let (header, scan) = {
            let _guard = backing_lock.lock().unwrap();
            let header = backing.read_header()?;
            let log = mount.logger().new(o!("file" => header.file_id.to_string()));
            let data_blocks = blocks_count_for_size(header.size);
            if data_blocks > MAX_BLOCK_COUNT {
                incfs_bail!(FormatError, "{} bytes is too large", header.size);
            }
            let scan = scan_metadata_chain(
                &*backing,
                header.metadata_offset,
                data_blocks,
                &log,
            )
            .inspect_err(|e| {
                warn!(log, "metadata scan failed: {}", e);
            })?;
            (header, scan)
        };

        let data_block_count = blocks_count_for_size(header.size) as u32;
        let hash_blocks = scan
            .signature
            .as_ref()
            .map(|(_, tree)| tree.hash_block_count())
            .unwrap_or(0);
        if data_block_count as u64 + hash_blocks != scan.total_block_count as u64 {
            incfs_bail!(
                FormatError,
                "{} data and {} hash blocks, blockmap has {}",
                data_block_count,
                hash_blocks,
                scan.total_block_count
            );
        }

        let log = mount.logger().new(o!("file" => header.file_id.to_string()));
        debug!(log, "opened";
            "records" => scan.records,
            "data_blocks" => data_block_count,
            "total_blocks" => scan.total_block_count,
            "flags" => header.flags);

        let (signature, hash_tree) = match scan.signature {
            Some((layout, tree)) => (Some(layout), Some(tree)),
            None => (None, None),
        };

        Ok(DataFile {
            log,
            mount: mount.clone(),
            backing,
            backing_lock,
            instance: mount.next_file_instance(),
            id: header.file_id,
            size: header.size,
            metadata_offset: header.metadata_offset,
            header_flags: AtomicU32::new(header.flags),
            data_block_count,
            total_block_count: scan.total_block_count,
            blockmap_offset: scan.blockmap_offset,
            attr: scan.attr,
            hash_tree,
            signature,
            segments: Default::default(),
            page_cache: HashPageCache::default(),
            closing: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn metadata_offset(&self) -> u64 {
        self.metadata_offset
    }

    pub fn data_block_count(&self) -> u32 {
        self.data_block_count
    }

    pub fn total_block_count(&self) -> u32 {
        self.total_block_count
    }

    pub fn blockmap_offset(&self) -> u64 {
        self.blockmap_offset
    }

    pub fn header_flags(&self) -> u32 {
        self.header_flags.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.header_flags() & HEADER_FLAG_COMPLETE != 0
    }

    pub fn hash_tree(&self) -> Option<&HashTree> {
        self.hash_tree.as_ref()
    }

    pub fn signature_layout(&self) -> Option<&SignatureLayout> {
        self.signature.as_ref()
    }

    pub fn mount(&self) -> &Arc<MountState> {
        &self.mount
    }

    /// Which segment guards `block_index`
    pub fn segment_index(block_index: u32) -> usize {
        block_index as usize % SEGMENTS_PER_FILE
    }

    pub(crate) fn segment(&self, block_index: u32) -> &Segment {
        &self.segments[Self::segment_index(block_index)]
    }

    pub(crate) fn segment_key(&self, block_index: u32) -> SegmentKey {
        (self.instance, Self::segment_index(block_index))
    }

    /// Decode the blockmap entry for `block_index`
    pub fn lookup_block(&self, block_index: u32) -> Result<DataFileBlock, IncfsError> {
        if self.blockmap_offset == 0 {
            incfs_bail!(RangeError, "file has no blockmap");
        }
        if block_index >= self.total_block_count {
            incfs_bail!(
                RangeError,
                "block {} is past the blockmap end {}",
                block_index,
                self.total_block_count
            );
        }
        let entry =
            self.backing.read_blockmap_entry(block_index, self.blockmap_offset)?;
        Ok(DataFileBlock::from(&entry))
    }

    fn is_interrupted(&self, cancel: Option<&CancelToken>) -> bool {
        self.closing.load(Ordering::Acquire)
            || cancel.is_some_and(|c| c.is_cancelled())
    }

    /**
     * Find data block `block_index`, waiting up to `timeout_ms` for it to be
     * filled if it is not present yet.
     *
     * A zero timeout never blocks.  A read that gives up because of the
     * timeout is still recorded in the read log.
     */
    pub fn wait_for_block(
        &self,
        block_index: u32,
        timeout_ms: u32,
        cancel: Option<&CancelToken>,
    ) -> Result<DataFileBlock, IncfsError> {
        if block_index >= self.data_block_count {
            incfs_bail!(
                RangeError,
                "block {} is past the last data block {}",
                block_index,
                self.data_block_count
            );
        }
        if self.blockmap_offset == 0 {
            incfs_bail!(NoData, "file has no blockmap");
        }

        let segment = self.segment(block_index);
        let pending = {
            let _guard = segment.blockmap_lock.lock().unwrap();
            let block = self.lookup_block(block_index)?;
            if block.is_present() {
                return Ok(block);
            }
            if timeout_ms == 0 {
                None
            } else {
                Some(self.mount.pending_reads().add(
                    self.segment_key(block_index),
                    self.id,
                    block_index,
                    self.mount.now_us(),
                ))
            }
        };

        let Some(pending) = pending else {
            self.mount.log_block_read(&self.id, block_index);
            return Err(IncfsError::TimedOut);
        };

        if let Some(c) = cancel {
            c.register(&segment.new_data_arrival);
        }
        segment.new_data_arrival.wait_timeout(
            Duration::from_millis(timeout_ms as u64),
            || pending.is_done() || self.is_interrupted(cancel),
        );
        if let Some(c) = cancel {
            c.unregister(&segment.new_data_arrival);
        }

        let done = pending.is_done();
        drop(pending);
        if !done {
            if self.is_interrupted(cancel) {
                return Err(IncfsError::Interrupted);
            }
            self.mount.log_block_read(&self.id, block_index);
            return Err(IncfsError::TimedOut);
        }

        let _guard = segment.blockmap_lock.lock().unwrap();
        let block = self.lookup_block(block_index)?;
        if !block.is_present() {
            warn!(self.log, "woken for block {} but it is still absent", block_index);
            incfs_bail!(DataNotFound, "block {} vanished after fill", block_index);
        }
        Ok(block)
    }

    /**
     * Read data block `block_index` into `dst`, waiting for it if needed,
     * and verify it against the hash tree.
     *
     * `dst` must hold a full block; `scratch` must hold two.  Returns the
     * number of bytes of real data, the rest of the block is zeroed.
     */
    pub fn read_block(
        &self,
        block_index: u32,
        timeout_ms: u32,
        dst: &mut [u8],
        scratch: &mut [u8],
        cancel: Option<&CancelToken>,
    ) -> Result<usize, IncfsError> {
        let bs = DATA_FILE_BLOCK_SIZE;
        if dst.len() < bs {
            incfs_bail!(RangeError, "destination of {} bytes", dst.len());
        }
        if scratch.len() < 2 * bs {
            incfs_bail!(RangeError, "scratch of {} bytes", scratch.len());
        }

        let block = self.wait_for_block(block_index, timeout_ms, cancel)?;
        let stored = block.stored_size as usize;
        let at = block.backing_file_data_offset;

        let n = match block.compression {
            Compression::None => {
                let n = stored.min(bs);
                self.backing.read_exact_at(&mut dst[..n], at)?;
                n
            }
            Compression::Lz4 => {
                let src = &mut scratch[..stored.min(2 * bs)];
                self.backing.read_exact_at(src, at)?;
                lz4_flex::block::decompress_into(src, &mut dst[..bs]).map_err(
                    |e| {
                        warn!(self.log, "block {} decompression failed: {}",
                            block_index, e);
                        IncfsError::DecompressionError(e.to_string())
                    },
                )?
            }
        };
        dst[n..bs].fill(0);

        self.validate_hash_tree(block_index, &dst[..bs], scratch)?;
        self.mount.log_block_read(&self.id, block_index);
        Ok(n)
    }

    /// The detached signature bytes, empty when the file has none
    pub fn read_signature(&self) -> Result<Vec<u8>, IncfsError> {
        let Some(sig) = &self.signature else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        out.try_reserve_exact(sig.sig_size as usize)?;
        out.resize(sig.sig_size as usize, 0u8);
        self.backing.read_exact_at(&mut out, sig.sig_offset)?;
        Ok(out)
    }

    /// The attribute value, checked against its recorded checksum
    pub fn read_attribute(&self) -> Result<Option<Vec<u8>>, IncfsError> {
        let Some(attr) = &self.attr else {
            return Ok(None);
        };
        let mut out = vec![0u8; attr.size as usize];
        self.backing.read_exact_at(&mut out, attr.offset)?;
        let checksum = integrity_hash(&[&out]);
        if checksum != attr.checksum {
            incfs_bail!(
                FormatError,
                "attribute checksum {:#x}, expected {:#x}",
                checksum,
                attr.checksum
            );
        }
        Ok(Some(out))
    }

    /// Clear `reset` and set `set` in the header flags, writing them back
    /// only if they change.
    pub fn update_header_flags(&self, reset: u32, set: u32) -> Result<(), IncfsError> {
        let _guard = self.backing_lock.lock().unwrap();
        let old = self.header_flags.load(Ordering::Acquire);
        let new = (old & !reset) | set;
        if new == old {
            return Ok(());
        }
        self.backing.write_header_flags(new)?;
        self.header_flags.store(new, Ordering::Release);
        Ok(())
    }

    /// Wake every reader blocked on this file; they fail with `Interrupted`.
    /// Used when the file is being torn down.
    pub fn interrupt_waiters(&self) {
        self.closing.store(true, Ordering::Release);
        for segment in &self.segments {
            segment.new_data_arrival.wake_all();
        }
    }
}

/**
 * Lazily opened `DataFile` for one inode.
 *
 * The first caller opens the file under the cell lock; everyone else gets
 * the same instance.
 */
#[derive(Debug, Default)]
pub struct DataFileCell {
    file: Mutex<Option<Arc<DataFile>>>,
}

impl DataFileCell {
    pub fn new() -> DataFileCell {
        DataFileCell::default()
    }

    pub fn get(&self) -> Option<Arc<DataFile>> {
        self.file.lock().unwrap().clone()
    }

    pub fn get_or_open<F>(
        &self,
        mount: &Arc<MountState>,
        open_backing: F,
    ) -> Result<Arc<DataFile>, IncfsError>
    where
        F: FnOnce() -> Result<Box<dyn BackingFile>, IncfsError>,
    {
        let mut file = self.file.lock().unwrap();
        if let Some(df) = &*file {
            return Ok(df.clone());
        }
        let df = Arc::new(DataFile::open(mount, open_backing()?)?);
        *file = Some(df.clone());
        Ok(df)
    }

    /// Drop the cached file, waking anyone still blocked on it
    pub fn evict(&self) -> Option<Arc<DataFile>> {
        let df = self.file.lock().unwrap().take();
        if let Some(df) = &df {
            df.interrupt_waiters();
        }
        df
    }
}
