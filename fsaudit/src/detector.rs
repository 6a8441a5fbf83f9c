//! Per-process burst detection.
//!
//! Every WRITE and UNLINK record lands in a sliding window keyed by pid.
//! A pid that makes more than `max_writes` writes (or `max_deletes`
//! unlinks) within the window raises one [`Alert`]. The alert re-arms once
//! the window drains back to the limit.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use fsaudit_common::SyscallKind;
use serde::Serialize;

use crate::consumer::{AuditRecord, RecordKind};
use crate::settings::DetectorSettings;

/// Observations between sweeps of idle pids.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Writes,
    Deletions,
}

impl Activity {
    fn of(kind: RecordKind) -> Option<Self> {
        match kind {
            RecordKind::Known(SyscallKind::Write) => Some(Self::Writes),
            RecordKind::Known(SyscallKind::Unlink) => Some(Self::Deletions),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Writes => "writes",
            Self::Deletions => "deletions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub pid: u32,
    pub comm: String,
    pub activity: Activity,
    /// Records inside the window when the limit was crossed.
    pub count: usize,
    pub window_secs: u64,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ALERT] Rapid file {} by PID {} ({}): {} in {}s",
            self.activity.as_str(),
            self.pid,
            self.comm,
            self.count,
            self.window_secs
        )
    }
}

#[derive(Default)]
struct Window {
    hits: VecDeque<Instant>,
    alerted: bool,
}

impl Window {
    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) <= window {
                break;
            }
            self.hits.pop_front();
        }
    }
}

pub struct BurstDetector {
    max_writes: usize,
    max_deletes: usize,
    window: Duration,
    history: HashMap<(u32, Activity), Window>,
    observed: u64,
}

impl BurstDetector {
    pub fn new(max_writes: usize, max_deletes: usize, window: Duration) -> Self {
        Self {
            max_writes,
            max_deletes,
            window,
            history: HashMap::new(),
            observed: 0,
        }
    }

    pub fn from_settings(settings: &DetectorSettings) -> Self {
        Self::new(
            settings.max_writes(),
            settings.max_deletes(),
            settings.window(),
        )
    }

    /// Feeds one record seen at `now`. Returns an alert when this record
    /// takes its pid over the limit.
    pub fn observe(&mut self, record: &AuditRecord, now: Instant) -> Option<Alert> {
        let activity = Activity::of(record.kind)?;
        let limit = match activity {
            Activity::Writes => self.max_writes,
            Activity::Deletions => self.max_deletes,
        };

        self.observed += 1;
        if self.observed % SWEEP_EVERY == 0 {
            self.sweep(now);
        }

        let window = self.window;
        let entry = self.history.entry((record.pid, activity)).or_default();
        entry.expire(now, window);
        entry.hits.push_back(now);

        let count = entry.hits.len();
        if count <= limit {
            entry.alerted = false;
            return None;
        }
        if entry.alerted {
            return None;
        }
        entry.alerted = true;

        Some(Alert {
            pid: record.pid,
            comm: record.comm.clone(),
            activity,
            count,
            window_secs: window.as_secs(),
        })
    }

    /// Drops pids with no activity left inside the window.
    fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.history.retain(|_, entry| {
            entry.expire(now, window);
            !entry.hits.is_empty()
        });
    }

    pub fn tracked(&self) -> usize {
        self.history.len()
    }
}
