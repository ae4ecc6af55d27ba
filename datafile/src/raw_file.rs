// Copyright 2024 Oxide Computer Company
use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::path::Path;

use incfs_common::{
    blocks_count_for_size, incfs_bail, integrity_hash, FileId, IncfsError,
    DATA_FILE_BLOCK_SIZE, MAX_FILE_ATTR_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::backing::*;
use crate::hash_tree::HashTree;

/// "INCFS" plus a format byte
pub const RAW_FILE_MAGIC: u64 = 0x0153_4643_4e49;
pub const RAW_FILE_VERSION: u32 = 1;

/// Size of the header region at the start of the file
///
/// This must be large enough to contain an `OnDiskHeader` serialized using
/// `bincode`.
pub const HEADER_SIZE_BYTES: u64 = 64;

/// Size of every metadata record slot
///
/// This must be large enough to contain an `OnDiskRecord` serialized using
/// `bincode`.
pub const MD_RECORD_SIZE_BYTES: u64 = 64;

/// The header, ordered so `flags` sits at a fixed offset and can be
/// rewritten in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OnDiskHeader {
    magic: u64,
    version: u32,
    flags: u32,
    file_size: u64,
    first_md_offset: u64,
    file_id: [u8; 16],
}

/// Byte offset of `OnDiskHeader::flags`
const HEADER_FLAGS_OFFSET: u64 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OnDiskRecord {
    next_offset: u64,
    checksum: u64,
    record: MetadataRecord,
}

/// Contents of a backing file to be created
#[derive(Debug, Clone, Default)]
pub struct NewFile {
    pub file_id: FileId,
    pub size: u64,
    /// Encoded `Signature`; when present a hash tree area is reserved
    pub signature: Option<Vec<u8>>,
    pub attribute: Option<Vec<u8>>,
}

/// Call `pread` repeatedly to read as much of `buf` as the file holds
///
/// Returns the number of bytes read, which is only short at end of file.
fn pread_all<F: AsFd + Copy>(
    fd: F,
    mut buf: &mut [u8],
    mut offset: i64,
) -> Result<usize, nix::errno::Errno> {
    let mut total = 0;
    while !buf.is_empty() {
        let n = nix::sys::uio::pread(fd, buf, offset)?;
        if n == 0 {
            break;
        }
        total += n;
        offset += n as i64;
        buf = &mut buf[n..];
    }
    Ok(total)
}

/// Call `pwrite` repeatedly to write an entire buffer
fn pwrite_all<F: AsFd + Copy>(
    fd: F,
    mut buf: &[u8],
    mut offset: i64,
) -> Result<(), nix::errno::Errno> {
    while !buf.is_empty() {
        let n = nix::sys::uio::pwrite(fd, buf, offset)?;
        offset += n as i64;
        buf = &buf[n..];
    }
    Ok(())
}

fn to_off(offset: u64) -> Result<i64, IncfsError> {
    i64::try_from(offset).map_err(|_| {
        IncfsError::RangeError(format!("offset {offset:#x} is too large"))
    })
}

/**
 * A backing file stored as a plain host file.
 *
 * Layout: a 64-byte header, the blockmap (10 bytes per data and hash
 * block), the attribute value, the signature blob, the hash tree area
 * (4096 aligned) and then the chain of 64-byte metadata records.  Data
 * blocks are appended past the end as they are filled.
 */
#[derive(Debug)]
pub struct RawBackingFile {
    file: File,
    regular: bool,
}

impl RawBackingFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RawBackingFile, IncfsError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                IncfsError::IoError(format!("open of {path:?} failed: {e}"))
            })?;
        Self::from_file(file)
    }

    /// Open without write access; fills against such a file fail
    pub fn open_read_only<P: AsRef<Path>>(
        path: P,
    ) -> Result<RawBackingFile, IncfsError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            IncfsError::IoError(format!("open of {path:?} failed: {e}"))
        })?;
        Self::from_file(file)
    }

    fn from_file(file: File) -> Result<RawBackingFile, IncfsError> {
        let regular = file.metadata()?.file_type().is_file();
        Ok(RawBackingFile { file, regular })
    }

    /// Lay out a new, empty backing file at `path`
    pub fn create<P: AsRef<Path>>(
        path: P,
        new: &NewFile,
    ) -> Result<RawBackingFile, IncfsError> {
        let path = path.as_ref();
        let data_blocks = blocks_count_for_size(new.size);

        let hash_area_size = match &new.signature {
            Some(sig) => HashTree::from_signature(sig, data_blocks)?.area_size,
            None => 0,
        };
        let hash_blocks = hash_area_size / DATA_FILE_BLOCK_SIZE as u64;
        let total_blocks = data_blocks + hash_blocks;
        let block_count = u32::try_from(total_blocks).map_err(|_| {
            IncfsError::RangeError(format!("{total_blocks} blocks is too many"))
        })?;

        let mut offset = HEADER_SIZE_BYTES;
        let blockmap_offset = offset;
        offset += total_blocks * RawBlockEntry::SIZE as u64;

        let mut records = vec![MetadataRecord::Blockmap {
            base_offset: blockmap_offset,
            block_count,
        }];
        let mut payloads: Vec<(u64, &[u8])> = Vec::new();

        if let Some(attr) = &new.attribute {
            if attr.len() > MAX_FILE_ATTR_SIZE {
                incfs_bail!(
                    RangeError,
                    "attribute is {} bytes, at most {} allowed",
                    attr.len(),
                    MAX_FILE_ATTR_SIZE
                );
            }
            records.push(MetadataRecord::FileAttr {
                offset,
                size: attr.len() as u16,
                checksum: integrity_hash(&[attr]),
            });
            payloads.push((offset, attr));
            offset += attr.len() as u64;
        }

        if let Some(sig) = &new.signature {
            let sig_offset = offset;
            payloads.push((sig_offset, sig));
            offset += sig.len() as u64;
            let hash_offset = if hash_area_size == 0 {
                0
            } else {
                offset.next_multiple_of(DATA_FILE_BLOCK_SIZE as u64)
            };
            if hash_offset != 0 {
                offset = hash_offset + hash_area_size;
            }
            records.push(MetadataRecord::Signature {
                hash_offset,
                hash_size: hash_area_size as u32,
                sig_offset,
                sig_size: sig.len() as u32,
            });
        }

        let first_md_offset = offset;
        let end = first_md_offset + records.len() as u64 * MD_RECORD_SIZE_BYTES;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                IncfsError::IoError(format!("create of {path:?} failed: {e}"))
            })?;
        file.set_len(end)?;

        let header = OnDiskHeader {
            magic: RAW_FILE_MAGIC,
            version: RAW_FILE_VERSION,
            flags: 0,
            file_size: new.size,
            first_md_offset,
            file_id: *new.file_id.as_bytes(),
        };
        pwrite_all(file.as_fd(), &bincode::serialize(&header)?, 0)?;

        for (at, payload) in payloads {
            pwrite_all(file.as_fd(), payload, to_off(at)?)?;
        }

        let count = records.len();
        for (i, record) in records.into_iter().enumerate() {
            let at = first_md_offset + i as u64 * MD_RECORD_SIZE_BYTES;
            let next_offset = if i + 1 == count {
                0
            } else {
                at + MD_RECORD_SIZE_BYTES
            };
            let on_disk = OnDiskRecord {
                next_offset,
                checksum: integrity_hash(&[&bincode::serialize(&record)?]),
                record,
            };
            pwrite_all(file.as_fd(), &bincode::serialize(&on_disk)?, to_off(at)?)?;
        }

        file.sync_all()?;
        Self::from_file(file)
    }
}

impl BackingFile for RawBackingFile {
    fn is_regular_file(&self) -> bool {
        self.regular
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, IncfsError> {
        Ok(pread_all(self.file.as_fd(), buf, to_off(offset)?)?)
    }

    fn read_header(&self) -> Result<FileHeader, IncfsError> {
        let mut buf = [0u8; HEADER_SIZE_BYTES as usize];
        self.read_exact_at(&mut buf, 0)?;
        let h: OnDiskHeader = bincode::deserialize(&buf)?;
        if h.magic != RAW_FILE_MAGIC {
            incfs_bail!(FormatError, "bad magic {:#x}", h.magic);
        }
        if h.version != RAW_FILE_VERSION {
            incfs_bail!(FormatError, "unknown version {}", h.version);
        }
        Ok(FileHeader {
            metadata_offset: h.first_md_offset,
            file_id: FileId::from_bytes(h.file_id),
            size: h.file_size,
            flags: h.flags,
        })
    }

    fn read_metadata_record(
        &self,
        offset: u64,
    ) -> Result<MetadataEntry, IncfsError> {
        let mut buf = [0u8; MD_RECORD_SIZE_BYTES as usize];
        self.read_exact_at(&mut buf, offset)?;
        let r: OnDiskRecord = bincode::deserialize(&buf)?;
        let expected = integrity_hash(&[&bincode::serialize(&r.record)?]);
        if r.checksum != expected {
            incfs_bail!(
                FormatError,
                "metadata record at {:#x} has checksum {:#x}, expected {:#x}",
                offset,
                r.checksum,
                expected
            );
        }
        Ok(MetadataEntry {
            offset,
            next_offset: r.next_offset,
            record: r.record,
        })
    }

    fn read_blockmap_entries(
        &self,
        out: &mut [RawBlockEntry],
        start_index: u32,
        blockmap_offset: u64,
    ) -> Result<usize, IncfsError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(out.len() * RawBlockEntry::SIZE)?;
        buf.resize(out.len() * RawBlockEntry::SIZE, 0u8);

        let at = blockmap_offset + start_index as u64 * RawBlockEntry::SIZE as u64;
        let n = self.read_at(&mut buf, at)? / RawBlockEntry::SIZE;
        for (i, chunk) in buf.chunks_exact(RawBlockEntry::SIZE).take(n).enumerate()
        {
            let mut b = [0u8; RawBlockEntry::SIZE];
            b.copy_from_slice(chunk);
            out[i] = RawBlockEntry::from_le_bytes(&b);
        }
        Ok(n)
    }

    /// Single-entry lookup without touching the heap
    fn read_blockmap_entry(
        &self,
        index: u32,
        blockmap_offset: u64,
    ) -> Result<RawBlockEntry, IncfsError> {
        let mut b = [0u8; RawBlockEntry::SIZE];
        let at = blockmap_offset + index as u64 * RawBlockEntry::SIZE as u64;
        if self.read_at(&mut b, at)? != RawBlockEntry::SIZE {
            incfs_bail!(
                IoError,
                "blockmap entry {} is past the end of the backing file",
                index
            );
        }
        Ok(RawBlockEntry::from_le_bytes(&b))
    }

    fn write_data_block(
        &self,
        data: &[u8],
        index: u32,
        blockmap_offset: u64,
        flags: u16,
    ) -> Result<(), IncfsError> {
        let size = u16::try_from(data.len()).map_err(|_| {
            IncfsError::RangeError(format!("{} byte block", data.len()))
        })?;
        let at = self.file.metadata()?.len();
        let entry = RawBlockEntry::new(at, size, flags)?;

        pwrite_all(self.file.as_fd(), data, to_off(at)?)?;
        let entry_at =
            blockmap_offset + index as u64 * RawBlockEntry::SIZE as u64;
        pwrite_all(self.file.as_fd(), &entry.to_le_bytes(), to_off(entry_at)?)?;
        Ok(())
    }

    fn write_hash_block(
        &self,
        data: &[u8],
        index: u32,
        hash_area_offset: u64,
        blockmap_offset: u64,
        data_block_count: u32,
    ) -> Result<(), IncfsError> {
        let size = u16::try_from(data.len()).map_err(|_| {
            IncfsError::RangeError(format!("{} byte block", data.len()))
        })?;
        let at = hash_area_offset + index as u64 * DATA_FILE_BLOCK_SIZE as u64;
        let entry = RawBlockEntry::new(at, size, 0)?;

        pwrite_all(self.file.as_fd(), data, to_off(at)?)?;
        let entry_at = blockmap_offset
            + (data_block_count as u64 + index as u64)
                * RawBlockEntry::SIZE as u64;
        pwrite_all(self.file.as_fd(), &entry.to_le_bytes(), to_off(entry_at)?)?;
        Ok(())
    }

    fn write_header_flags(&self, flags: u32) -> Result<(), IncfsError> {
        pwrite_all(
            self.file.as_fd(),
            &flags.to_le_bytes(),
            HEADER_FLAGS_OFFSET as i64,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash_tree::{build_hash_tree, HashAlgorithm, Signature};
    use anyhow::Result;

    #[test]
    fn on_disk_structures_fit_their_slots() -> Result<()> {
        let h = OnDiskHeader {
            magic: RAW_FILE_MAGIC,
            version: RAW_FILE_VERSION,
            flags: u32::MAX,
            file_size: u64::MAX,
            first_md_offset: u64::MAX,
            file_id: [0xff; 16],
        };
        let b = bincode::serialize(&h)?;
        assert!(b.len() as u64 <= HEADER_SIZE_BYTES);
        assert_eq!(&b[12..16], &[0xff; 4]);

        let r = OnDiskRecord {
            next_offset: u64::MAX,
            checksum: u64::MAX,
            record: MetadataRecord::Signature {
                hash_offset: u64::MAX,
                hash_size: u32::MAX,
                sig_offset: u64::MAX,
                sig_size: u32::MAX,
            },
        };
        assert!(bincode::serialize(&r)?.len() as u64 <= MD_RECORD_SIZE_BYTES);
        Ok(())
    }

    #[test]
    fn create_then_walk_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = vec![3u8; 300 * 4096];
        let (_, root) = build_hash_tree(HashAlgorithm::Sha256, &image)?;
        let sig = Signature::new(HashAlgorithm::Sha256, root, vec![9; 8]);
        let id = FileId::new_v4();

        let f = RawBackingFile::create(
            dir.path().join("f"),
            &NewFile {
                file_id: id,
                size: image.len() as u64,
                signature: Some(sig.to_bytes()?),
                attribute: Some(b"hello".to_vec()),
            },
        )?;
        assert!(f.is_regular_file());

        let h = f.read_header()?;
        assert_eq!(h.file_id, id);
        assert_eq!(h.size, image.len() as u64);
        assert_eq!(h.flags, 0);

        let mut kinds = Vec::new();
        let mut at = h.metadata_offset;
        while at != 0 {
            let e = f.read_metadata_record(at)?;
            kinds.push(e.record);
            at = e.next_offset;
        }
        assert_eq!(kinds.len(), 3);
        match kinds[2] {
            MetadataRecord::Signature {
                hash_offset,
                hash_size,
                ..
            } => {
                assert_eq!(hash_offset % 4096, 0);
                // 300 blocks: 3 leaf-level blocks and one root block
                assert_eq!(hash_size, 4 * 4096);
            }
            other => panic!("unexpected record {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn data_blocks_append_and_map() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let f = RawBackingFile::create(
            dir.path().join("f"),
            &NewFile {
                file_id: FileId::new_v4(),
                size: 3 * 4096,
                ..Default::default()
            },
        )?;
        let e = f.read_metadata_record(f.read_header()?.metadata_offset)?;
        let MetadataRecord::Blockmap { base_offset, block_count } = e.record
        else {
            panic!("first record is {:?}", e.record);
        };
        assert_eq!(block_count, 3);
        assert_eq!(f.read_blockmap_entry(1, base_offset)?, RawBlockEntry::default());

        f.write_data_block(&[5u8; 100], 1, base_offset, 0)?;
        let entry = f.read_blockmap_entry(1, base_offset)?;
        assert_eq!(entry.data_size, 100);
        let mut buf = [0u8; 100];
        f.read_exact_at(&mut buf, entry.data_offset())?;
        assert_eq!(buf, [5u8; 100]);

        let mut entries = [RawBlockEntry::default(); 8];
        assert_eq!(f.read_blockmap_entries(&mut entries, 0, base_offset)?, 8);
        Ok(())
    }

    #[test]
    fn header_flags_rewrite_in_place() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f");
        let f = RawBackingFile::create(&path, &NewFile::default())?;
        f.write_header_flags(HEADER_FLAG_COMPLETE)?;
        drop(f);

        let f = RawBackingFile::open(&path)?;
        assert_eq!(f.read_header()?.flags, HEADER_FLAG_COMPLETE);
        Ok(())
    }

    #[test]
    fn short_reads_are_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let f = RawBackingFile::create(dir.path().join("f"), &NewFile::default())?;
        let mut buf = vec![0u8; 4096];
        let end = f.file.metadata()?.len();
        assert_eq!(
            f.read_exact_at(&mut buf, end - 10),
            Err(IncfsError::ShortRead {
                expected: 4096,
                actual: 10
            })
        );
        Ok(())
    }
}
