// Copyright 2024 Oxide Computer Company
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use incfs_common::FileId;

use crate::wait::WaitQueue;
use crate::ReadInfo;

/// Identifies one blockmap segment of one open file
pub(crate) type SegmentKey = (u64, usize);

/// A reader blocked on a block that has not been filled yet
#[derive(Debug)]
pub struct PendingRead {
    pub file_id: FileId,
    pub block_index: u32,
    pub serial_number: u64,
    pub timestamp_us: u64,
    done: AtomicBool,
}

impl PendingRead {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn info(&self) -> ReadInfo {
        ReadInfo {
            file_id: self.file_id,
            block_index: self.block_index,
            serial_number: self.serial_number,
            timestamp_us: self.timestamp_us,
        }
    }
}

#[derive(Debug, Default)]
struct PendingInner {
    last_serial: u64,
    /// Every pending read on the mount, in serial order
    all: BTreeMap<u64, Arc<PendingRead>>,
    /// The same reads, grouped by the segment they wait on
    by_segment: HashMap<SegmentKey, HashMap<u64, Arc<PendingRead>>>,
}

/**
 * Mount-wide registry of blocked reads.
 *
 * Each read appears in the mount-wide list and in its segment's list for
 * exactly as long as the `PendingReadGuard` returned by `add` lives.
 */
#[derive(Debug, Default)]
pub struct PendingReads {
    inner: Mutex<PendingInner>,
    /// Mirrors of `inner` for the lock-free fast path of
    /// `fresh_pending_reads_exist`
    last_serial: AtomicU64,
    count: AtomicUsize,
    waiters: WaitQueue,
}

/// Keeps a pending read registered; dropping it removes the read
#[derive(Debug)]
pub struct PendingReadGuard<'a> {
    reads: &'a PendingReads,
    key: SegmentKey,
    read: Arc<PendingRead>,
}

impl Deref for PendingReadGuard<'_> {
    type Target = PendingRead;

    fn deref(&self) -> &PendingRead {
        &self.read
    }
}

impl Drop for PendingReadGuard<'_> {
    fn drop(&mut self) {
        self.reads.remove(self.key, self.read.serial_number);
    }
}

impl PendingReads {
    pub fn new() -> PendingReads {
        PendingReads::default()
    }

    pub(crate) fn add(
        &self,
        key: SegmentKey,
        file_id: FileId,
        block_index: u32,
        now_us: u64,
    ) -> PendingReadGuard<'_> {
        let read = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_serial += 1;
            let read = Arc::new(PendingRead {
                file_id,
                block_index,
                serial_number: inner.last_serial,
                timestamp_us: now_us,
                done: AtomicBool::new(false),
            });
            inner.all.insert(read.serial_number, read.clone());
            inner
                .by_segment
                .entry(key)
                .or_default()
                .insert(read.serial_number, read.clone());
            self.last_serial.store(inner.last_serial, Ordering::Release);
            self.count.store(inner.all.len(), Ordering::Release);
            read
        };
        self.waiters.wake_all();

        PendingReadGuard {
            reads: self,
            key,
            read,
        }
    }

    fn remove(&self, key: SegmentKey, serial_number: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.all.remove(&serial_number);
        if let Some(segment) = inner.by_segment.get_mut(&key) {
            segment.remove(&serial_number);
            if segment.is_empty() {
                inner.by_segment.remove(&key);
            }
        }
        self.count.store(inner.all.len(), Ordering::Release);
    }

    /// Mark every read waiting on `block_index` in segment `key` done.
    /// Returns how many were marked.
    pub(crate) fn notify(&self, key: SegmentKey, block_index: u32) -> usize {
        let inner = self.inner.lock().unwrap();
        let Some(segment) = inner.by_segment.get(&key) else {
            return 0;
        };
        let mut marked = 0;
        for read in segment.values() {
            if read.block_index == block_index {
                read.done.store(true, Ordering::Release);
                marked += 1;
            }
        }
        marked
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a read newer than serial `last` is still waiting
    pub fn fresh_pending_reads_exist(&self, last: u64) -> bool {
        if self.last_serial.load(Ordering::Acquire) <= last
            || self.count.load(Ordering::Acquire) == 0
        {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        inner.all.range(last.saturating_add(1)..).next().is_some()
    }

    /// Up to `max` pending reads with serial numbers above `sn_lowerbound`,
    /// oldest first
    pub fn collect(&self, sn_lowerbound: u64, max: usize) -> Vec<ReadInfo> {
        if !self.fresh_pending_reads_exist(sn_lowerbound) {
            return Vec::new();
        }
        let inner = self.inner.lock().unwrap();
        inner
            .all
            .range(sn_lowerbound.saturating_add(1)..)
            .take(max)
            .map(|(_, r)| r.info())
            .collect()
    }

    /// Wait until a read newer than serial `last` shows up
    pub fn wait_for_pending_reads(&self, last: u64, timeout: Duration) -> bool {
        self.waiters
            .wait_timeout(timeout, || self.fresh_pending_reads_exist(last))
    }
}
