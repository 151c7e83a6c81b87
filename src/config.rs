use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;

use crate::limits::{DEFAULT_MAX_WINDOW_DAYS, MAX_PAGE_SIZE};

/// Process configuration, read from `SLOTBOOK_*` environment variables.
/// Unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub journal_file: String,
    /// Journal appends after which the compactor rewrites the journal.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub max_window_days: i64,
    pub default_page_size: usize,
    pub nearest_horizon_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            journal_file: "slotbook.journal".into(),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            max_window_days: DEFAULT_MAX_WINDOW_DAYS,
            default_page_size: 20,
            nearest_horizon_days: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. `from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());

        Self {
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            journal_file: lookup("SLOTBOOK_JOURNAL")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.journal_file),
            compact_threshold: parsed("SLOTBOOK_COMPACT_THRESHOLD")
                .filter(|v| *v > 0)
                .map_or(defaults.compact_threshold, |v| v as u64),
            compact_interval: parsed("SLOTBOOK_COMPACT_INTERVAL_SECS")
                .filter(|v| *v > 0)
                .map_or(defaults.compact_interval, |v| Duration::from_secs(v as u64)),
            max_window_days: parsed("SLOTBOOK_MAX_WINDOW_DAYS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_window_days),
            default_page_size: parsed("SLOTBOOK_DEFAULT_PAGE_SIZE")
                .filter(|v| *v > 0)
                .map_or(defaults.default_page_size, |v| (v as usize).min(MAX_PAGE_SIZE)),
            nearest_horizon_days: parsed("SLOTBOOK_NEAREST_HORIZON_DAYS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.nearest_horizon_days),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(&self.journal_file)
    }

    pub fn max_window(&self) -> TimeDelta {
        TimeDelta::days(self.max_window_days)
    }

    pub fn nearest_horizon(&self) -> TimeDelta {
        TimeDelta::days(self.nearest_horizon_days)
    }
}
