// Copyright 2024 Oxide Computer Company
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use incfs_common::{FileId, IncfsError, LogThresholds, MountOptions};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};

use crate::wait::WaitQueue;
use crate::ReadInfo;

/// Ring buffer allocation unit
pub const READ_LOG_PAGE_SIZE: usize = 4096;

/// Encoded size of the largest record shape
pub const MAX_RECORD_SIZE: usize = 28;

const BLOCK_INDEX_BITS: u32 = 30;

const RECORD_FULL: u8 = 0;
const RECORD_SAME_FILE: u8 = 1;
const RECORD_SAME_FILE_NEXT_BLOCK: u8 = 2;
const RECORD_SAME_FILE_NEXT_BLOCK_SHORT: u8 = 3;

/// The last read a log cursor has decoded
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct LogRecordBase {
    pub file_id: FileId,
    pub block_index: u32,
    pub absolute_ts_us: u64,
}

/// A position in the read log
///
/// The log keeps two of these (head for writing, tail for the oldest
/// surviving record) and every reader holds its own.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct ReadLogState {
    pub generation_id: u32,
    pub next_offset: u32,
    pub current_pass_no: u32,
    pub current_record_no: u64,
    pub base_record: LogRecordBase,
}

/*
 * Records are delta encoded against the previous one.  The low two bits
 * of the first byte carry the shape:
 *
 *   FULL                       28 bytes  type:2 index:30 id:128 ts:64
 *   SAME_FILE                   8 bytes  type:2 index:30 rel_ts:32
 *   SAME_FILE_NEXT_BLOCK        4 bytes  type:2 rel_ts:30
 *   SAME_FILE_NEXT_BLOCK_SHORT  2 bytes  type:2 rel_ts:14
 *
 * All fields are little endian.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LogRecord {
    Full {
        block_index: u32,
        file_id: FileId,
        absolute_ts_us: u64,
    },
    SameFile {
        block_index: u32,
        relative_ts_us: u32,
    },
    SameFileNextBlock {
        relative_ts_us: u32,
    },
    SameFileNextBlockShort {
        relative_ts_us: u16,
    },
}

impl LogRecord {
    /// Pick the smallest shape that can express a read relative to `base`
    fn choose(
        base: &LogRecordBase,
        thresholds: &LogThresholds,
        file_id: &FileId,
        block_index: u32,
        now_us: u64,
    ) -> LogRecord {
        let rel = now_us.saturating_sub(base.absolute_ts_us);
        if *file_id != base.file_id || rel >= thresholds.full_us {
            LogRecord::Full {
                block_index,
                file_id: *file_id,
                absolute_ts_us: now_us,
            }
        } else if block_index != base.block_index.wrapping_add(1)
            || rel >= thresholds.same_file_us
        {
            LogRecord::SameFile {
                block_index,
                relative_ts_us: rel as u32,
            }
        } else if rel >= thresholds.next_block_us {
            LogRecord::SameFileNextBlock {
                relative_ts_us: rel as u32,
            }
        } else {
            LogRecord::SameFileNextBlockShort {
                relative_ts_us: rel as u16,
            }
        }
    }

    fn size(&self) -> usize {
        match self {
            LogRecord::Full { .. } => 28,
            LogRecord::SameFile { .. } => 8,
            LogRecord::SameFileNextBlock { .. } => 4,
            LogRecord::SameFileNextBlockShort { .. } => 2,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        let index_mask = (1u32 << BLOCK_INDEX_BITS) - 1;
        match *self {
            LogRecord::Full {
                block_index,
                file_id,
                absolute_ts_us,
            } => {
                let w = RECORD_FULL as u32 | ((block_index & index_mask) << 2);
                out[0..4].copy_from_slice(&w.to_le_bytes());
                out[4..20].copy_from_slice(file_id.as_bytes());
                out[20..28].copy_from_slice(&absolute_ts_us.to_le_bytes());
            }
            LogRecord::SameFile {
                block_index,
                relative_ts_us,
            } => {
                let w = RECORD_SAME_FILE as u32
                    | ((block_index & index_mask) << 2);
                out[0..4].copy_from_slice(&w.to_le_bytes());
                out[4..8].copy_from_slice(&relative_ts_us.to_le_bytes());
            }
            LogRecord::SameFileNextBlock { relative_ts_us } => {
                let w = RECORD_SAME_FILE_NEXT_BLOCK as u32 | (relative_ts_us << 2);
                out[0..4].copy_from_slice(&w.to_le_bytes());
            }
            LogRecord::SameFileNextBlockShort { relative_ts_us } => {
                let w = RECORD_SAME_FILE_NEXT_BLOCK_SHORT as u16
                    | (relative_ts_us << 2);
                out[0..2].copy_from_slice(&w.to_le_bytes());
            }
        }
    }

    fn decode(buf: &[u8]) -> LogRecord {
        match buf[0] & 0x3 {
            RECORD_FULL => {
                let w = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let mut id = [0u8; 16];
                id.copy_from_slice(&buf[4..20]);
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&buf[20..28]);
                LogRecord::Full {
                    block_index: w >> 2,
                    file_id: FileId::from_bytes(id),
                    absolute_ts_us: u64::from_le_bytes(ts),
                }
            }
            RECORD_SAME_FILE => {
                let w = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                LogRecord::SameFile {
                    block_index: w >> 2,
                    relative_ts_us: u32::from_le_bytes([
                        buf[4], buf[5], buf[6], buf[7],
                    ]),
                }
            }
            RECORD_SAME_FILE_NEXT_BLOCK => {
                let w = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                LogRecord::SameFileNextBlock { relative_ts_us: w >> 2 }
            }
            _ => {
                let w = u16::from_le_bytes([buf[0], buf[1]]);
                LogRecord::SameFileNextBlockShort { relative_ts_us: w >> 2 }
            }
        }
    }

    /// Fold this record into the running base.  The writer and every
    /// reader go through here, so they agree on each decoded value.
    fn apply(&self, base: &mut LogRecordBase) {
        match *self {
            LogRecord::Full {
                block_index,
                file_id,
                absolute_ts_us,
            } => {
                base.file_id = file_id;
                base.block_index = block_index;
                base.absolute_ts_us = absolute_ts_us;
            }
            LogRecord::SameFile {
                block_index,
                relative_ts_us,
            } => {
                base.block_index = block_index;
                base.absolute_ts_us += relative_ts_us as u64;
            }
            LogRecord::SameFileNextBlock { relative_ts_us } => {
                base.block_index = base.block_index.wrapping_add(1);
                base.absolute_ts_us += relative_ts_us as u64;
            }
            LogRecord::SameFileNextBlockShort { relative_ts_us } => {
                base.block_index = base.block_index.wrapping_add(1);
                base.absolute_ts_us += relative_ts_us as u64;
            }
        }
    }
}

/// Move a cursor past a record of `size` bytes
fn advance(state: &mut ReadLogState, size: usize, ring_size: usize) {
    state.next_offset += size as u32;
    if state.next_offset as usize > ring_size - MAX_RECORD_SIZE {
        state.next_offset = 0;
        state.current_pass_no += 1;
    }
    state.current_record_no += 1;
}

fn read_one(ring: &[u8], state: &mut ReadLogState) {
    let record = LogRecord::decode(&ring[state.next_offset as usize..]);
    record.apply(&mut state.base_record);
    advance(state, record.size(), ring.len());
}

#[derive(Debug)]
struct LogInner {
    /// None while the log is disabled
    ring: Option<Box<[u8]>>,
    head: ReadLogState,
    tail: ReadLogState,
    thresholds: LogThresholds,
}

/**
 * Mount-wide ring buffer of completed reads.
 *
 * When the ring fills up the oldest records are dropped.  Waiters for new
 * records are woken by a helper thread that coalesces wakeups over the
 * configured delay.
 */
#[derive(Debug)]
pub struct ReadLog {
    log: Logger,
    enabled: AtomicBool,
    inner: Mutex<LogInner>,
    waiters: Arc<WaitQueue>,
    wakeup_delay_ms: Arc<AtomicU64>,
    wakeup_tx: Option<SyncSender<()>>,
    wakeup_thread: Option<JoinHandle<()>>,
}

fn log_wakeup_loop(
    rx: Receiver<()>,
    delay_ms: Arc<AtomicU64>,
    waiters: Arc<WaitQueue>,
) {
    while rx.recv().is_ok() {
        thread::sleep(Duration::from_millis(delay_ms.load(Ordering::Relaxed)));
        while rx.try_recv().is_ok() {}
        waiters.wake_all();
    }
}

fn check_thresholds(t: &LogThresholds) -> Result<(), IncfsError> {
    t.validate()
        .map_err(|e| IncfsError::RangeError(format!("log thresholds: {e:#}")))
}

impl ReadLog {
    pub fn new(opts: &MountOptions, log: &Logger) -> Result<ReadLog, IncfsError> {
        check_thresholds(&opts.log_thresholds)?;
        let log = log.new(o!("task" => "read_log"));
        let waiters = Arc::new(WaitQueue::new());
        let wakeup_delay_ms = Arc::new(AtomicU64::new(opts.log_wakeup_delay_ms));
        let (tx, rx) = sync_channel(1);
        let wakeup_thread = thread::Builder::new()
            .name("incfs-log-wakeup".to_string())
            .spawn({
                let waiters = waiters.clone();
                let delay = wakeup_delay_ms.clone();
                move || log_wakeup_loop(rx, delay, waiters)
            })?;

        let rl = ReadLog {
            log,
            enabled: AtomicBool::new(false),
            inner: Mutex::new(LogInner {
                ring: None,
                head: ReadLogState::default(),
                tail: ReadLogState::default(),
                thresholds: opts.log_thresholds,
            }),
            waiters,
            wakeup_delay_ms,
            wakeup_tx: Some(tx),
            wakeup_thread: Some(wakeup_thread),
        };
        if opts.read_log_pages > 0 {
            rl.resize(opts.read_log_pages)?;
        }
        Ok(rl)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().unwrap().ring.as_ref().map_or(0, |r| r.len())
    }

    /// Record one completed read of `block_index` in `file_id`
    pub fn append(&self, file_id: &FileId, block_index: u32, now_us: u64) {
        if !self.is_enabled() {
            return;
        }
        debug_assert!(block_index < (1 << BLOCK_INDEX_BITS));

        {
            let mut inner = self.inner.lock().unwrap();
            let LogInner {
                ring,
                head,
                tail,
                thresholds,
            } = &mut *inner;
            let Some(ring) = ring.as_deref_mut() else {
                return;
            };

            let record = LogRecord::choose(
                &head.base_record,
                thresholds,
                file_id,
                block_index,
                now_us,
            );
            let size = record.size() as u32;

            while tail.current_pass_no < head.current_pass_no
                && tail.next_offset < head.next_offset + size
            {
                read_one(ring, tail);
            }

            record.encode(&mut ring[head.next_offset as usize..]);
            record.apply(&mut head.base_record);
            advance(head, record.size(), ring.len());
        }

        if let Some(tx) = &self.wakeup_tx {
            // A full channel already has a wakeup queued.
            let _ = tx.try_send(());
        }
    }

    /// Current head of the log
    pub fn state(&self) -> ReadLogState {
        self.inner.lock().unwrap().head
    }

    /// Records still in the ring that `state` has not collected
    pub fn uncollected_count(&self, state: &ReadLogState) -> u64 {
        let inner = self.inner.lock().unwrap();
        let head = inner.head.current_record_no;
        let tail = inner.tail.current_record_no;
        if state.generation_id != inner.head.generation_id {
            head.saturating_sub(tail)
        } else {
            head.saturating_sub(tail.max(state.current_record_no))
        }
    }

    /**
     * Decode up to `max` records after `cursor`, advancing it.
     *
     * A cursor from an earlier generation restarts at the beginning of the
     * current one, and a cursor that fell behind the tail skips the
     * records that were overwritten.
     */
    pub fn collect(&self, cursor: &mut ReadLogState, max: usize) -> Vec<ReadInfo> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let Some(ring) = inner.ring.as_deref() else {
            return out;
        };

        if cursor.generation_id != inner.head.generation_id {
            *cursor = ReadLogState {
                generation_id: inner.head.generation_id,
                ..Default::default()
            };
        }
        if cursor.current_record_no < inner.tail.current_record_no {
            *cursor = inner.tail;
        }

        while cursor.current_record_no < inner.head.current_record_no
            && out.len() < max
        {
            read_one(ring, cursor);
            out.push(ReadInfo {
                file_id: cursor.base_record.file_id,
                block_index: cursor.base_record.block_index,
                serial_number: cursor.current_record_no,
                timestamp_us: cursor.base_record.absolute_ts_us,
            });
        }
        out
    }

    /**
     * Replace the ring with one of `pages` pages and start a new
     * generation.  Zero pages disables the log.  The new ring is allocated
     * before the lock is taken and the old one freed after it is released.
     */
    pub fn resize(&self, pages: u32) -> Result<(), IncfsError> {
        let bytes = pages as usize * READ_LOG_PAGE_SIZE;
        let ring = if bytes == 0 {
            None
        } else {
            let mut ring = Vec::new();
            ring.try_reserve_exact(bytes)?;
            ring.resize(bytes, 0u8);
            Some(ring.into_boxed_slice())
        };

        let (old, generation) = {
            let mut inner = self.inner.lock().unwrap();
            let generation = inner.head.generation_id.wrapping_add(1);
            let old = std::mem::replace(&mut inner.ring, ring);
            inner.head = ReadLogState {
                generation_id: generation,
                ..Default::default()
            };
            inner.tail = inner.head;
            self.enabled.store(bytes > 0, Ordering::Release);
            (old, generation)
        };
        drop(old);

        info!(self.log, "read log resized";
            "pages" => pages, "generation" => generation);
        Ok(())
    }

    pub fn set_thresholds(
        &self,
        thresholds: LogThresholds,
    ) -> Result<(), IncfsError> {
        check_thresholds(&thresholds)?;
        self.inner.lock().unwrap().thresholds = thresholds;
        Ok(())
    }

    pub fn set_wakeup_delay_ms(&self, delay_ms: u64) {
        self.wakeup_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    /// Wait until the log holds records `cursor` has not collected
    pub fn wait_for_data(&self, cursor: &ReadLogState, timeout: Duration) -> bool {
        self.waiters
            .wait_timeout(timeout, || self.uncollected_count(cursor) > 0)
    }
}

impl Drop for ReadLog {
    fn drop(&mut self) {
        // Closing the channel ends the wakeup thread once any queued
        // wakeup has been delivered.
        self.wakeup_tx.take();
        if let Some(t) = self.wakeup_thread.take() {
            if t.join().is_err() {
                debug!(self.log, "log wakeup thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use incfs_common::build_logger;
    use std::time::Instant;
    use test_strategy::proptest;

    fn csl() -> Logger {
        build_logger()
    }

    fn new_log(pages: u32) -> ReadLog {
        let opts = MountOptions {
            read_log_pages: pages,
            log_wakeup_delay_ms: 1,
            ..Default::default()
        };
        ReadLog::new(&opts, &csl()).unwrap()
    }

    #[test]
    fn record_shapes_follow_gaps() {
        let rl = new_log(1);
        let a = FileId::new_v4();
        let b = FileId::new_v4();

        let mut offsets = Vec::new();
        let mut now = 1_000;
        rl.append(&a, 0, now);
        offsets.push(rl.state().next_offset);
        now += 10;
        rl.append(&a, 1, now);
        offsets.push(rl.state().next_offset);
        now += 20_000;
        rl.append(&a, 2, now);
        offsets.push(rl.state().next_offset);
        now += 5;
        rl.append(&a, 7, now);
        offsets.push(rl.state().next_offset);
        now += 5;
        rl.append(&b, 8, now);
        offsets.push(rl.state().next_offset);

        // FULL, SHORT, NEXT_BLOCK, SAME_FILE, FULL
        assert_eq!(offsets, vec![28, 30, 34, 42, 70]);

        let mut cursor = ReadLogState::default();
        let got = rl.collect(&mut cursor, usize::MAX);
        let blocks: Vec<_> = got.iter().map(|r| (r.file_id, r.block_index)).collect();
        assert_eq!(blocks, vec![(a, 0), (a, 1), (a, 2), (a, 7), (b, 8)]);
        let ts: Vec<_> = got.iter().map(|r| r.timestamp_us).collect();
        assert_eq!(ts, vec![1_000, 1_010, 21_010, 21_015, 21_020]);
        assert_eq!(got[4].serial_number, 5);
        assert_eq!(cursor, rl.state());
    }

    #[test]
    fn large_gaps_fall_back_to_full_records() {
        let rl = new_log(1);
        let a = FileId::new_v4();
        rl.append(&a, 0, 0);
        rl.append(&a, 1, 1 << 33);
        assert_eq!(rl.state().next_offset, 56);
    }

    #[test]
    fn wrapping_drops_oldest_records() {
        let rl = new_log(1);
        let ids = [FileId::new_v4(), FileId::new_v4()];
        let total = 5_000u32;
        for i in 0..total {
            rl.append(&ids[i as usize % 2], i, i as u64);
        }

        let mut cursor = ReadLogState::default();
        let got = rl.collect(&mut cursor, usize::MAX);
        assert!(!got.is_empty());
        assert!(got.len() * MAX_RECORD_SIZE <= READ_LOG_PAGE_SIZE);
        assert_eq!(got.last().unwrap().serial_number, total as u64);
        for r in &got {
            assert_eq!(r.block_index as u64, r.serial_number - 1);
            assert_eq!(r.file_id, ids[r.block_index as usize % 2]);
        }
        assert_eq!(rl.uncollected_count(&cursor), 0);
    }

    #[test]
    fn resize_starts_a_new_generation() {
        let rl = new_log(1);
        let a = FileId::new_v4();
        rl.append(&a, 0, 10);
        rl.append(&a, 1, 20);

        let mut cursor = ReadLogState::default();
        assert_eq!(rl.collect(&mut cursor, usize::MAX).len(), 2);
        let old_generation = cursor.generation_id;

        rl.resize(2).unwrap();
        assert_eq!(rl.size_bytes(), 2 * READ_LOG_PAGE_SIZE);
        assert_eq!(rl.uncollected_count(&cursor), 0);
        rl.append(&a, 5, 30);
        assert_eq!(rl.uncollected_count(&cursor), 1);

        let got = rl.collect(&mut cursor, usize::MAX);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].block_index, 5);
        assert_eq!(cursor.generation_id, old_generation + 1);
    }

    #[test]
    fn disabled_log_records_nothing() {
        let rl = new_log(0);
        assert!(!rl.is_enabled());
        rl.append(&FileId::new_v4(), 0, 1);
        let mut cursor = ReadLogState::default();
        assert!(rl.collect(&mut cursor, usize::MAX).is_empty());
        assert_eq!(rl.state().current_record_no, 0);
    }

    #[test]
    fn collect_honors_max() {
        let rl = new_log(1);
        let a = FileId::new_v4();
        for i in 0..10 {
            rl.append(&a, i, i as u64);
        }
        let mut cursor = ReadLogState::default();
        assert_eq!(rl.collect(&mut cursor, 4).len(), 4);
        assert_eq!(rl.uncollected_count(&cursor), 6);
        let rest = rl.collect(&mut cursor, usize::MAX);
        assert_eq!(rest.first().unwrap().block_index, 4);
    }

    #[test]
    fn thresholds_past_record_capacity_are_rejected() {
        let too_wide = LogThresholds {
            next_block_us: 1 << 20,
            ..Default::default()
        };
        let opts = MountOptions {
            log_thresholds: too_wide,
            ..Default::default()
        };
        assert!(matches!(
            ReadLog::new(&opts, &csl()),
            Err(IncfsError::RangeError(_))
        ));

        let rl = new_log(1);
        assert!(matches!(
            rl.set_thresholds(too_wide),
            Err(IncfsError::RangeError(_))
        ));
        assert!(rl.set_thresholds(LogThresholds::default()).is_ok());
    }

    #[test]
    fn waiters_wake_after_append() {
        let rl = Arc::new(new_log(1));
        let cursor = rl.state();
        let t = {
            let rl = rl.clone();
            thread::spawn(move || rl.wait_for_data(&cursor, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        rl.append(&FileId::new_v4(), 3, 100);
        assert!(t.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    const GAPS: [u64; 5] = [0, 5, 20_000, 1 << 31, 1 << 33];

    #[proptest]
    fn replay_matches_appends(
        #[strategy(proptest::collection::vec(
            (0..3usize, 0..64u32, 0..5usize),
            1..200
        ))]
        ops: Vec<(usize, u32, usize)>,
    ) {
        let rl = new_log(4);
        let ids = [FileId::new_v4(), FileId::new_v4(), FileId::new_v4()];
        let mut now = 0u64;
        let mut expected = Vec::new();
        for (f, block, gap) in ops {
            now += GAPS[gap];
            rl.append(&ids[f], block, now);
            expected.push((ids[f], block, now));
        }

        let mut cursor = ReadLogState::default();
        let got: Vec<_> = rl
            .collect(&mut cursor, usize::MAX)
            .into_iter()
            .map(|r| (r.file_id, r.block_index, r.timestamp_us))
            .collect();
        assert_eq!(got, expected);
    }
}
