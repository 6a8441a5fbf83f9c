//! Attaches the open/write/unlink syscall-entry programs.

use anyhow::{Result, bail};
use aya::Ebpf;
use log::info;

use crate::probes::{Probe, TracepointConfig, attach_tracepoint};
use crate::settings::ProbeSettings;
use crate::telemetry;

const CATEGORY: &str = "syscalls";

// Program names double as tracepoint names.
const OPENAT: &str = "sys_enter_openat";
const OPEN: &str = "sys_enter_open";
const WRITE: &str = "sys_enter_write";
const UNLINKAT: &str = "sys_enter_unlinkat";
const UNLINK: &str = "sys_enter_unlink";

pub struct FileAuditProbe {
    settings: ProbeSettings,
}

impl FileAuditProbe {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    /// Tracepoints selected by the settings, in attach order.
    pub fn tracepoints(&self) -> Vec<TracepointConfig<'static>> {
        let legacy = self.settings.legacy_enabled();
        let mut names = Vec::new();

        if self.settings.open_enabled() {
            names.push(OPENAT);
            if legacy {
                names.push(OPEN);
            }
        }
        if self.settings.write_enabled() {
            names.push(WRITE);
        }
        if self.settings.unlink_enabled() {
            names.push(UNLINKAT);
            if legacy {
                names.push(UNLINK);
            }
        }

        names
            .into_iter()
            .map(|name| TracepointConfig {
                program_name: name,
                category: CATEGORY,
                name,
            })
            .collect()
    }
}

impl Probe for FileAuditProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        let wanted = self.tracepoints();
        if wanted.is_empty() {
            bail!("All file audit probes are disabled");
        }

        let mut attached = 0u64;
        for config in wanted {
            if attach_tracepoint(bpf, config)? {
                info!("Attached tracepoint: {}/{}", config.category, config.name);
                attached += 1;
            }
        }

        if attached == 0 {
            bail!("None of the file audit tracepoints exist on this kernel");
        }

        telemetry::record_active_probe("file_audit", attached);
        info!("FileAuditProbe attached {} tracepoints", attached);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(settings: ProbeSettings) -> Vec<&'static str> {
        FileAuditProbe::new(settings)
            .tracepoints()
            .into_iter()
            .map(|tp| tp.name)
            .collect()
    }

    #[test]
    fn defaults_select_the_at_variants_and_write() {
        assert_eq!(
            names(ProbeSettings::default()),
            vec![OPENAT, WRITE, UNLINKAT]
        );
    }

    #[test]
    fn legacy_adds_open_and_unlink() {
        let settings = ProbeSettings {
            legacy_syscalls: Some(true),
            ..Default::default()
        };
        assert_eq!(names(settings), vec![OPENAT, OPEN, WRITE, UNLINKAT, UNLINK]);
    }

    #[test]
    fn disabled_probes_are_left_out() {
        let settings = ProbeSettings {
            write: Some(false),
            unlink: Some(false),
            legacy_syscalls: Some(true),
            ..Default::default()
        };
        assert_eq!(names(settings), vec![OPENAT, OPEN]);
    }

    #[test]
    fn every_selection_uses_the_syscalls_category() {
        let settings = ProbeSettings {
            legacy_syscalls: Some(true),
            ..Default::default()
        };
        for tp in FileAuditProbe::new(settings).tracepoints() {
            assert_eq!(tp.category, "syscalls");
            assert_eq!(tp.program_name, tp.name);
        }
    }
}
