use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::output::OutputFormat;

const DEFAULT_PERF_PAGES: usize = 64;
const DEFAULT_RELAY_CAPACITY: usize = 8192;
const DEFAULT_MAX_WRITES: usize = 50;
const DEFAULT_MAX_DELETES: usize = 10;
const DEFAULT_WINDOW_SECS: u64 = 5;
const DEFAULT_MAX_ACTIONS_PER_MINUTE: usize = 5;
const DEFAULT_WHITELIST_COMMS: [&str; 7] = [
    "systemd",
    "init",
    "sshd",
    "bash",
    "code",
    "gnome-shell",
    "python3",
];

/// Which syscall-entry tracepoints to attach.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProbeSettings {
    pub open: Option<bool>,
    pub write: Option<bool>,
    pub unlink: Option<bool>,
    /// Also attach `sys_enter_open` / `sys_enter_unlink` where they exist.
    pub legacy_syscalls: Option<bool>,
}

impl ProbeSettings {
    pub fn open_enabled(&self) -> bool {
        self.open.unwrap_or(true)
    }

    pub fn write_enabled(&self) -> bool {
        self.write.unwrap_or(true)
    }

    pub fn unlink_enabled(&self) -> bool {
        self.unlink.unwrap_or(true)
    }

    pub fn legacy_enabled(&self) -> bool {
        self.legacy_syscalls.unwrap_or(false)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransportSettings {
    /// Pages per CPU perf ring. Must be a power of two.
    pub perf_pages: Option<usize>,
    /// Records buffered between the CPU readers and the consumer.
    pub relay_capacity: Option<usize>,
}

impl TransportSettings {
    pub fn perf_pages(&self) -> usize {
        match self.perf_pages {
            Some(pages) if pages.is_power_of_two() => pages,
            _ => DEFAULT_PERF_PAGES,
        }
    }

    pub fn relay_capacity(&self) -> usize {
        self.relay_capacity
            .filter(|&cap| cap > 0)
            .unwrap_or(DEFAULT_RELAY_CAPACITY)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputSettings {
    #[serde(default)]
    pub format: OutputFormat,
    pub log_file: Option<PathBuf>,
    /// Look up uid and executable path in /proc for every record.
    pub enrich_process: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterSettings {
    #[serde(default)]
    pub exclude_pids: Vec<u32>,
    #[serde(default)]
    pub exclude_comms: Vec<String>,
    /// Drop records produced by the agent itself (its own log writes).
    pub exclude_self: Option<bool>,
}

/// Per-process burst detection over WRITE and UNLINK records.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DetectorSettings {
    pub enabled: Option<bool>,
    /// Alert once a pid makes more than this many writes within the window.
    pub max_writes: Option<usize>,
    pub max_deletes: Option<usize>,
    pub window_secs: Option<u64>,
}

impl DetectorSettings {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn max_writes(&self) -> usize {
        self.max_writes.unwrap_or(DEFAULT_MAX_WRITES)
    }

    pub fn max_deletes(&self) -> usize {
        self.max_deletes.unwrap_or(DEFAULT_MAX_DELETES)
    }

    pub fn window(&self) -> Duration {
        let secs = self
            .window_secs
            .filter(|&secs| secs > 0)
            .unwrap_or(DEFAULT_WINDOW_SECS);
        Duration::from_secs(secs)
    }
}

/// Dry-run response to detector alerts. Nothing is ever signalled; the
/// action that would have been taken is logged.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResponseSettings {
    pub enabled: Option<bool>,
    pub whitelist_comms: Option<Vec<String>>,
    pub whitelist_uids: Option<Vec<u32>>,
    pub max_actions_per_minute: Option<usize>,
}

impl ResponseSettings {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn whitelist_comms(&self) -> Vec<String> {
        match &self.whitelist_comms {
            Some(comms) => comms.clone(),
            None => DEFAULT_WHITELIST_COMMS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn whitelist_uids(&self) -> Vec<u32> {
        self.whitelist_uids.clone().unwrap_or_else(|| vec![0])
    }

    pub fn max_actions_per_minute(&self) -> usize {
        self.max_actions_per_minute
            .unwrap_or(DEFAULT_MAX_ACTIONS_PER_MINUTE)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub probes: ProbeSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub response: ResponseSettings,
}

impl Settings {
    /// Settings from an optional YAML file, overridden by `FSAUDIT_*`
    /// environment variables (`FSAUDIT_PROBES__WRITE=false`).
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(false));
        }

        let s = builder
            .add_source(
                Environment::with_prefix("FSAUDIT")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("filter.exclude_pids")
                    .with_list_parse_key("filter.exclude_comms")
                    .with_list_parse_key("response.whitelist_comms")
                    .with_list_parse_key("response.whitelist_uids")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}
