//! Dry-run response to detector alerts.
//!
//! The agent never signals a process. For each alert it records what it
//! would have done, skipping whitelisted processes and limiting itself to a
//! fixed number of actions per minute.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::detector::Alert;
use crate::settings::ResponseSettings;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// What /proc says about the alerting process right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub comm: String,
    pub uid: Option<u32>,
}

impl ProcessIdentity {
    /// `None` once the process has exited.
    pub fn lookup(pid: u32) -> Option<Self> {
        let process = procfs::process::Process::new(pid as i32).ok()?;
        let comm = process.stat().ok()?.comm;
        Some(Self {
            comm,
            uid: process.uid().ok(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Would have terminated the process.
    DryRun {
        pid: u32,
        comm: String,
        uid: Option<u32>,
        reason: String,
    },
    ProcessGone {
        pid: u32,
    },
    Whitelisted {
        pid: u32,
        comm: String,
        uid: Option<u32>,
    },
    RateLimited {
        pid: u32,
        comm: String,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DryRun {
                pid,
                comm,
                uid,
                reason,
            } => write!(
                f,
                "[DRY_RUN] would kill PID {} ({}) uid={}: {}",
                pid,
                comm,
                uid.map_or_else(|| "?".to_string(), |u| u.to_string()),
                reason
            ),
            Self::ProcessGone { pid } => write!(f, "[ACTION] PID {} not present, skipped", pid),
            Self::Whitelisted { pid, comm, uid } => write!(
                f,
                "[ACTION] PID {} ({}) is whitelisted (uid={}), not killed",
                pid,
                comm,
                uid.map_or_else(|| "?".to_string(), |u| u.to_string())
            ),
            Self::RateLimited { pid, comm } => {
                write!(f, "[ACTION] Rate limit hit, skipping PID {} ({})", pid, comm)
            }
        }
    }
}

pub struct Responder {
    whitelist_comms: HashSet<String>,
    whitelist_uids: HashSet<u32>,
    max_per_minute: usize,
    taken: VecDeque<Instant>,
}

impl Responder {
    pub fn new(
        whitelist_comms: impl IntoIterator<Item = String>,
        whitelist_uids: impl IntoIterator<Item = u32>,
        max_per_minute: usize,
    ) -> Self {
        Self {
            whitelist_comms: whitelist_comms.into_iter().collect(),
            whitelist_uids: whitelist_uids.into_iter().collect(),
            max_per_minute,
            taken: VecDeque::new(),
        }
    }

    pub fn from_settings(settings: &ResponseSettings) -> Self {
        Self::new(
            settings.whitelist_comms(),
            settings.whitelist_uids(),
            settings.max_actions_per_minute(),
        )
    }

    /// Decides the action for `alert`, given the process as found at `now`.
    pub fn respond(
        &mut self,
        alert: &Alert,
        process: Option<ProcessIdentity>,
        now: Instant,
    ) -> Action {
        let pid = alert.pid;
        let Some(ProcessIdentity { comm, uid }) = process else {
            return Action::ProcessGone { pid };
        };

        let uid_whitelisted = uid.is_some_and(|u| self.whitelist_uids.contains(&u));
        if self.whitelist_comms.contains(&comm) || uid_whitelisted {
            return Action::Whitelisted { pid, comm, uid };
        }

        while let Some(&oldest) = self.taken.front() {
            if now.saturating_duration_since(oldest) < RATE_WINDOW {
                break;
            }
            self.taken.pop_front();
        }
        if self.taken.len() >= self.max_per_minute {
            return Action::RateLimited { pid, comm };
        }
        self.taken.push_back(now);

        Action::DryRun {
            pid,
            comm,
            uid,
            reason: format!("rapid file {}", alert.activity.as_str()),
        }
    }
}
