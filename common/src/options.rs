// Copyright 2024 Oxide Computer Company
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/*
 * Widths of the relative-time fields in the compact read log records.
 * A threshold may be lowered, but never raised past what its record
 * shape can carry.
 */
pub const SAME_FILE_TS_CAPACITY_US: u64 = 1 << 32;
pub const NEXT_BLOCK_TS_CAPACITY_US: u64 = 1 << 30;
pub const NEXT_BLOCK_SHORT_TS_CAPACITY_US: u64 = 1 << 14;

/// Relative-time cutoffs used to pick the smallest read log record shape
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LogThresholds {
    /// At or above this gap a FULL record is written
    pub full_us: u64,
    /// At or above this gap a SAME_FILE record is written
    pub same_file_us: u64,
    /// At or above this gap a SAME_FILE_NEXT_BLOCK record is written,
    /// below it SAME_FILE_NEXT_BLOCK_SHORT
    pub next_block_us: u64,
}

impl Default for LogThresholds {
    fn default() -> Self {
        LogThresholds {
            full_us: SAME_FILE_TS_CAPACITY_US,
            same_file_us: NEXT_BLOCK_TS_CAPACITY_US,
            next_block_us: NEXT_BLOCK_SHORT_TS_CAPACITY_US,
        }
    }
}

impl LogThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.full_us > SAME_FILE_TS_CAPACITY_US {
            bail!(
                "full_us {} exceeds the same-file record capacity {}",
                self.full_us,
                SAME_FILE_TS_CAPACITY_US
            );
        }
        if self.same_file_us > NEXT_BLOCK_TS_CAPACITY_US {
            bail!(
                "same_file_us {} exceeds the next-block record capacity {}",
                self.same_file_us,
                NEXT_BLOCK_TS_CAPACITY_US
            );
        }
        if self.next_block_us > NEXT_BLOCK_SHORT_TS_CAPACITY_US {
            bail!(
                "next_block_us {} exceeds the short record capacity {}",
                self.next_block_us,
                NEXT_BLOCK_SHORT_TS_CAPACITY_US
            );
        }
        if !(self.next_block_us <= self.same_file_us
            && self.same_file_us <= self.full_us)
        {
            bail!("log thresholds must be ordered: {:?}", self);
        }
        Ok(())
    }
}

/// Per-mount tunables
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MountOptions {
    /**
     * Size of the read log ring buffer, in pages.  Zero disables the
     * read log entirely.
     */
    pub read_log_pages: u32,

    /**
     * How long a read waits for a missing block when the caller does not
     * supply its own timeout.
     */
    pub read_timeout_ms: u32,

    /**
     * Delay used to coalesce read log wakeups.
     */
    pub log_wakeup_delay_ms: u64,

    pub log_thresholds: LogThresholds,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            read_log_pages: 2,
            read_timeout_ms: 1000,
            log_wakeup_delay_ms: 16,
            log_thresholds: LogThresholds::default(),
        }
    }
}

impl MountOptions {
    pub fn validate(&self) -> Result<()> {
        self.log_thresholds.validate()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let opts: MountOptions =
            toml::from_str(s).context("parse mount options")?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn from_toml_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let s = std::fs::read_to_string(file)
            .with_context(|| anyhow!("read {:?}", file))?;
        Self::from_toml_str(&s).with_context(|| anyhow!("load {:?}", file))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MountOptions::default().validate().unwrap();
        assert_eq!(MountOptions::default().read_log_pages, 2);
    }

    #[test]
    fn partial_toml_keeps_defaults() -> Result<()> {
        let opts = MountOptions::from_toml_str(
            r#"
            read_log_pages = 0

            [log_thresholds]
            next_block_us = 1024
            "#,
        )?;
        assert_eq!(opts.read_log_pages, 0);
        assert_eq!(opts.read_timeout_ms, 1000);
        assert_eq!(opts.log_thresholds.next_block_us, 1024);
        assert_eq!(opts.log_thresholds.full_us, 1 << 32);
        Ok(())
    }

    #[test]
    fn thresholds_past_capacity_are_rejected() {
        let t = LogThresholds {
            next_block_us: 1 << 15,
            ..Default::default()
        };
        assert!(t.validate().is_err());

        let t = LogThresholds {
            full_us: 10,
            same_file_us: 20,
            next_block_us: 5,
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn options_file_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mount.toml");
        std::fs::write(&path, "read_timeout_ms = 50\n")?;
        let opts = MountOptions::from_toml_file(&path)?;
        assert_eq!(opts.read_timeout_ms, 50);
        Ok(())
    }
}
