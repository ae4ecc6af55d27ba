// Copyright 2024 Oxide Computer Company
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use incfs_common::{FileId, IncfsError, MountOptions};
use serde::Serialize;
use slog::{info, o, Logger};

use crate::clock::{Clock, MonotonicClock};
use crate::pending::PendingReads;
use crate::read_log::{ReadLog, ReadLogState};
use crate::ReadInfo;

/// Credentials captured when the mount was created
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn current() -> Owner {
        Owner {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// State shared by every file of one mount
#[derive(Debug)]
pub struct MountState {
    log: Logger,
    owner: Owner,
    options: Mutex<MountOptions>,
    clock: Arc<dyn Clock>,
    pending_reads: PendingReads,
    read_log: ReadLog,
    next_file_instance: AtomicU64,
}

fn check_options(opts: &MountOptions) -> Result<(), IncfsError> {
    opts.validate()
        .map_err(|e| IncfsError::RangeError(format!("mount options: {e:#}")))
}

impl MountState {
    pub fn new(
        options: MountOptions,
        log: &Logger,
    ) -> Result<Arc<MountState>, IncfsError> {
        Self::with_clock(options, Arc::new(MonotonicClock::new()), log)
    }

    pub fn with_clock(
        options: MountOptions,
        clock: Arc<dyn Clock>,
        log: &Logger,
    ) -> Result<Arc<MountState>, IncfsError> {
        check_options(&options)?;
        let log = log.new(o!("component" => "incfs"));
        let read_log = ReadLog::new(&options, &log)?;
        let owner = Owner::current();
        info!(log, "mount created";
            "uid" => owner.uid, "gid" => owner.gid,
            "read_log_pages" => options.read_log_pages);

        Ok(Arc::new(MountState {
            log,
            owner,
            options: Mutex::new(options),
            clock,
            pending_reads: PendingReads::new(),
            read_log,
            next_file_instance: AtomicU64::new(1),
        }))
    }

    /// Apply new options.  A different read log size resizes the log and
    /// starts a new generation.
    pub fn remount(&self, options: MountOptions) -> Result<(), IncfsError> {
        check_options(&options)?;
        let mut current = self.options.lock().unwrap();
        if options.read_log_pages != current.read_log_pages {
            self.read_log.resize(options.read_log_pages)?;
        }
        self.read_log.set_thresholds(options.log_thresholds)?;
        self.read_log.set_wakeup_delay_ms(options.log_wakeup_delay_ms);
        info!(self.log, "remounted"; "options" => ?options);
        *current = options;
        Ok(())
    }

    pub fn options(&self) -> MountOptions {
        self.options.lock().unwrap().clone()
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn pending_reads(&self) -> &PendingReads {
        &self.pending_reads
    }

    pub fn read_log(&self) -> &ReadLog {
        &self.read_log
    }

    pub(crate) fn next_file_instance(&self) -> u64 {
        self.next_file_instance.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn log_block_read(&self, file_id: &FileId, block_index: u32) {
        let now = self.clock.now_us();
        self.read_log.append(file_id, block_index, now);
    }

    pub fn collect_pending_reads(
        &self,
        sn_lowerbound: u64,
        max: usize,
    ) -> Vec<ReadInfo> {
        self.pending_reads.collect(sn_lowerbound, max)
    }

    pub fn collect_logged_reads(
        &self,
        cursor: &mut ReadLogState,
        max: usize,
    ) -> Vec<ReadInfo> {
        self.read_log.collect(cursor, max)
    }

    pub fn wait_for_pending_reads(&self, last: u64, timeout: Duration) -> bool {
        self.pending_reads.wait_for_pending_reads(last, timeout)
    }

    pub fn wait_for_log_data(
        &self,
        cursor: &ReadLogState,
        timeout: Duration,
    ) -> bool {
        self.read_log.wait_for_data(cursor, timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::Result;
    use incfs_common::{build_logger, LogThresholds};

    fn csl() -> Logger {
        build_logger()
    }

    #[test]
    fn remount_resizes_log() -> Result<()> {
        let mount = MountState::new(MountOptions::default(), &csl())?;
        let before = mount.read_log().state().generation_id;

        let opts = MountOptions {
            read_log_pages: 4,
            ..Default::default()
        };
        mount.remount(opts.clone())?;
        assert_eq!(mount.read_log().size_bytes(), 4 * 4096);
        assert_eq!(mount.read_log().state().generation_id, before + 1);

        // Same size again keeps the generation.
        mount.remount(opts)?;
        assert_eq!(mount.read_log().state().generation_id, before + 1);
        Ok(())
    }

    #[test]
    fn invalid_options_are_refused() -> Result<()> {
        let mount = MountState::new(MountOptions::default(), &csl())?;
        let bad = MountOptions {
            read_log_pages: 9,
            log_thresholds: LogThresholds {
                next_block_us: 1 << 20,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            mount.remount(bad.clone()),
            Err(IncfsError::RangeError(_))
        ));
        assert_eq!(mount.options(), MountOptions::default());
        assert!(MountState::new(bad, &csl()).is_err());
        Ok(())
    }

    #[test]
    fn reads_are_logged_with_mount_clock() -> Result<()> {
        let clock = Arc::new(ManualClock::new(5_000));
        let mount =
            MountState::with_clock(MountOptions::default(), clock.clone(), &csl())?;
        let id = FileId::new_v4();
        mount.log_block_read(&id, 2);
        clock.advance(7);
        mount.log_block_read(&id, 3);

        let mut cursor = ReadLogState::default();
        let got = mount.collect_logged_reads(&mut cursor, 10);
        let ts: Vec<_> = got.iter().map(|r| r.timestamp_us).collect();
        assert_eq!(ts, vec![5_000, 5_007]);
        assert!(!mount.wait_for_log_data(&cursor, Duration::from_millis(1)));
        Ok(())
    }

    #[test]
    fn owner_is_current_user() -> Result<()> {
        let mount = MountState::new(MountOptions::default(), &csl())?;
        assert_eq!(mount.owner().uid, nix::unistd::getuid().as_raw());
        Ok(())
    }
}
