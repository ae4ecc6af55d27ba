// Copyright 2024 Oxide Computer Company
use incfs_common::{incfs_bail, IncfsError};
use serde::{Deserialize, Serialize};
use slog::{debug, warn};

use crate::backing::{RawBlockEntry, HEADER_FLAG_COMPLETE};
use crate::data_file::{DataFile, DataFileBlock};

/// Blockmap entries fetched per backing file round trip
pub const READ_BLOCKMAP_ENTRIES: usize = 512;

/// Half-open run of present blocks
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilledRange {
    pub begin: u32,
    pub end: u32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GetFilledBlocksArgs {
    pub start_index: u32,
    /// Zero means the end of the file
    pub end_index: u32,
    /// Room for this many ranges
    pub max_ranges: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilledBlocks {
    pub ranges: Vec<FilledRange>,
    /// Where a follow-up query should start; equal to the end of the
    /// queried range once everything was reported
    pub index_out: u32,
    pub total_blocks_out: u32,
    pub data_blocks_out: u32,
}

impl DataFile {
    /**
     * Report which blocks in `[start_index, end_index)` are present, as a
     * list of ranges.
     *
     * A file already marked complete answers without reading the blockmap.
     * A full scan that finds every block present marks the file complete.
     * When `max_ranges` runs out, `index_out` is the first block that still
     * needs reporting.
     */
    pub fn get_filled_blocks(
        &self,
        args: &GetFilledBlocksArgs,
    ) -> Result<FilledBlocks, IncfsError> {
        let total = self.total_block_count;
        let end_index = if args.end_index == 0 {
            total
        } else {
            args.end_index.min(total)
        };
        let mut out = FilledBlocks {
            ranges: Vec::new(),
            index_out: args.start_index,
            total_blocks_out: total,
            data_blocks_out: self.data_block_count,
        };

        if self.is_complete() {
            debug!(self.log, "file marked complete, skipping blockmap scan");
            if args.start_index >= end_index {
                return Ok(out);
            }
            if args.max_ranges == 0 {
                incfs_bail!(RangeError, "no room for a single range");
            }
            out.ranges.push(FilledRange {
                begin: args.start_index,
                end: end_index,
            });
            out.index_out = end_index;
            return Ok(out);
        }

        if args.start_index >= end_index {
            return Ok(out);
        }
        if self.blockmap_offset == 0 {
            incfs_bail!(NoData, "file has no blockmap");
        }

        let mut batch = Vec::new();
        batch.try_reserve_exact(READ_BLOCKMAP_ENTRIES)?;
        batch.resize(READ_BLOCKMAP_ENTRIES, RawBlockEntry::default());
        let mut batch_len = 0;
        let mut batch_pos = 0;

        let mut in_range = false;
        let mut range_begin = 0;
        let mut index = args.start_index;
        while index < end_index {
            if batch_pos == batch_len {
                batch_len = self.backing.read_blockmap_entries(
                    &mut batch,
                    index,
                    self.blockmap_offset,
                )?;
                batch_pos = 0;
                if batch_len == 0 {
                    incfs_bail!(IoError, "blockmap ends before block {}", index);
                }
            }
            let present = DataFileBlock::from(&batch[batch_pos]).is_present();
            batch_pos += 1;

            if present && !in_range {
                if out.ranges.len() >= args.max_ranges {
                    if out.ranges.is_empty() {
                        incfs_bail!(RangeError, "no room for a single range");
                    }
                    out.index_out = index;
                    return Ok(out);
                }
                in_range = true;
                range_begin = index;
            } else if !present && in_range {
                out.ranges.push(FilledRange {
                    begin: range_begin,
                    end: index,
                });
                in_range = false;
            }
            index += 1;
        }

        if in_range {
            out.ranges.push(FilledRange {
                begin: range_begin,
                end: index,
            });
        }
        out.index_out = index;

        if args.start_index == 0
            && end_index == total
            && out.ranges == [FilledRange { begin: 0, end: total }]
        {
            if let Err(e) = self.update_header_flags(0, HEADER_FLAG_COMPLETE) {
                warn!(self.log, "could not mark file complete: {}", e);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backing::{BackingFile, FileHeader, MetadataEntry};
    use crate::data_file::test::{new_data_file, new_mount};
    use crate::data_file::Compression;
    use crate::raw_file::{NewFile, RawBackingFile};
    use anyhow::Result;
    use incfs_common::FileId;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use test_strategy::proptest;

    /// Counts blockmap reads on the way to a real backing file
    #[derive(Debug)]
    struct CountingBacking {
        inner: RawBackingFile,
        blockmap_reads: Arc<AtomicUsize>,
    }

    impl BackingFile for CountingBacking {
        fn is_regular_file(&self) -> bool {
            self.inner.is_regular_file()
        }
        fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, IncfsError> {
            self.inner.read_at(buf, offset)
        }
        fn read_header(&self) -> Result<FileHeader, IncfsError> {
            self.inner.read_header()
        }
        fn read_metadata_record(
            &self,
            offset: u64,
        ) -> Result<MetadataEntry, IncfsError> {
            self.inner.read_metadata_record(offset)
        }
        fn read_blockmap_entries(
            &self,
            out: &mut [RawBlockEntry],
            start_index: u32,
            blockmap_offset: u64,
        ) -> Result<usize, IncfsError> {
            self.blockmap_reads.fetch_add(1, Ordering::SeqCst);
            self.inner
                .read_blockmap_entries(out, start_index, blockmap_offset)
        }
        fn write_data_block(
            &self,
            data: &[u8],
            index: u32,
            blockmap_offset: u64,
            flags: u16,
        ) -> Result<(), IncfsError> {
            self.inner.write_data_block(data, index, blockmap_offset, flags)
        }
        fn write_hash_block(
            &self,
            data: &[u8],
            index: u32,
            hash_area_offset: u64,
            blockmap_offset: u64,
            data_block_count: u32,
        ) -> Result<(), IncfsError> {
            self.inner.write_hash_block(
                data,
                index,
                hash_area_offset,
                blockmap_offset,
                data_block_count,
            )
        }
        fn write_header_flags(&self, flags: u32) -> Result<(), IncfsError> {
            self.inner.write_header_flags(flags)
        }
    }

    fn plain_file(blocks: u64) -> NewFile {
        NewFile {
            file_id: FileId::new_v4(),
            size: blocks * 4096,
            ..Default::default()
        }
    }

    fn all(max_ranges: usize) -> GetFilledBlocksArgs {
        GetFilledBlocksArgs {
            start_index: 0,
            end_index: 0,
            max_ranges,
        }
    }

    fn fill(df: &DataFile, blocks: &[u32]) -> Result<()> {
        for b in blocks {
            df.fill_data_block(*b, &[1u8; 16], Compression::None)?;
        }
        Ok(())
    }

    #[test]
    fn ranges_follow_present_runs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let df = new_data_file(&new_mount(), dir.path(), &plain_file(10))?;
        fill(&df, &[1, 2, 3, 6, 9])?;

        let got = df.get_filled_blocks(&all(10))?;
        assert_eq!(
            got.ranges,
            vec![
                FilledRange { begin: 1, end: 4 },
                FilledRange { begin: 6, end: 7 },
                FilledRange { begin: 9, end: 10 },
            ]
        );
        assert_eq!(got.index_out, 10);
        assert_eq!(got.total_blocks_out, 10);
        assert_eq!(got.data_blocks_out, 10);
        assert!(!df.is_complete());
        Ok(())
    }

    #[test]
    fn out_of_room_resumes_at_unreported_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let df = new_data_file(&new_mount(), dir.path(), &plain_file(10))?;
        fill(&df, &[1, 2, 3, 6, 9])?;

        let got = df.get_filled_blocks(&all(1))?;
        assert_eq!(got.ranges, vec![FilledRange { begin: 1, end: 4 }]);
        assert_eq!(got.index_out, 6);

        let rest = df.get_filled_blocks(&GetFilledBlocksArgs {
            start_index: got.index_out,
            end_index: 0,
            max_ranges: 10,
        })?;
        assert_eq!(rest.ranges.len(), 2);

        assert!(matches!(
            df.get_filled_blocks(&all(0)),
            Err(IncfsError::RangeError(_))
        ));
        Ok(())
    }

    #[test]
    fn complete_files_skip_the_blockmap() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let new = plain_file(1200);
        let path = dir.path().join("f");
        RawBackingFile::create(&path, &new)?;
        let reads = Arc::new(AtomicUsize::new(0));
        let backing = CountingBacking {
            inner: RawBackingFile::open(&path)?,
            blockmap_reads: reads.clone(),
        };
        let df = DataFile::open(&new_mount(), Box::new(backing))?;

        let blocks: Vec<u32> = (0..1200).collect();
        fill(&df, &blocks)?;
        reads.store(0, Ordering::SeqCst);

        let got = df.get_filled_blocks(&all(4))?;
        assert_eq!(got.ranges, vec![FilledRange { begin: 0, end: 1200 }]);
        // 1200 entries in batches of 512
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert!(df.is_complete());

        reads.store(0, Ordering::SeqCst);
        let got = df.get_filled_blocks(&GetFilledBlocksArgs {
            start_index: 100,
            end_index: 200,
            max_ranges: 1,
        })?;
        assert_eq!(got.ranges, vec![FilledRange { begin: 100, end: 200 }]);
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        // The flag survives a reopen.
        drop(df);
        let df = DataFile::open(&new_mount(), Box::new(RawBackingFile::open(&path)?))?;
        assert!(df.is_complete());
        Ok(())
    }

    #[test]
    fn partial_scans_do_not_mark_complete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let df = new_data_file(&new_mount(), dir.path(), &plain_file(4))?;
        fill(&df, &[0, 1, 2, 3])?;
        let got = df.get_filled_blocks(&GetFilledBlocksArgs {
            start_index: 1,
            end_index: 0,
            max_ranges: 4,
        })?;
        assert_eq!(got.ranges, vec![FilledRange { begin: 1, end: 4 }]);
        assert!(!df.is_complete());
        df.get_filled_blocks(&all(4))?;
        assert!(df.is_complete());
        Ok(())
    }

    #[proptest(cases = 32)]
    fn ranges_cover_exactly_the_filled_blocks(
        #[strategy(proptest::collection::btree_set(0..64u32, 0..64))]
        filled: BTreeSet<u32>,
        #[strategy(1..8usize)] max_ranges: usize,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let df = new_data_file(&new_mount(), dir.path(), &plain_file(64)).unwrap();
        for b in &filled {
            df.fill_data_block(*b, &[1u8; 16], Compression::None).unwrap();
        }

        let mut seen = BTreeSet::new();
        let mut start = 0;
        loop {
            let got = df
                .get_filled_blocks(&GetFilledBlocksArgs {
                    start_index: start,
                    end_index: 0,
                    max_ranges,
                })
                .unwrap();
            assert!(got.ranges.len() <= max_ranges);
            for r in &got.ranges {
                assert!(r.begin < r.end);
                seen.extend(r.begin..r.end);
            }
            assert!(got.index_out > start || got.index_out == 64);
            start = got.index_out;
            if start == 64 {
                break;
            }
        }
        assert_eq!(seen, filled);
    }
}
