//! Decodes relayed records, filters and enriches them, hands them to the
//! writer and feeds the burst detector.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use fsaudit_common::{FileEvent, SyscallKind};
use log::{debug, info, warn};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::sync::mpsc;

use crate::detector::BurstDetector;
use crate::output::EventWriter;
use crate::response::{ProcessIdentity, Responder};
use crate::settings::Settings;
use crate::telemetry;
use crate::transport::Envelope;

/// The syscall a record claims to come from. Unrecognised codes are kept
/// so they can still be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Known(SyscallKind),
    Unknown(u32),
}

impl RecordKind {
    pub fn from_raw(raw: u32) -> Self {
        SyscallKind::try_from(raw).map_or(Self::Unknown(raw), Self::Known)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Known(kind) => kind.as_str(),
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl Serialize for RecordKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("syscall", self.as_str())?;
        if let Self::Unknown(code) = self {
            map.serialize_entry("syscall_code", code)?;
        }
        map.end()
    }
}

/// Owned, decoded form of a [`FileEvent`]. Not-applicable sentinels become
/// `None`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AuditRecord {
    pub cpu: u32,
    pub seq: u64,
    pub pid: u32,
    pub comm: String,
    #[serde(flatten)]
    pub kind: RecordKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
}

impl AuditRecord {
    pub fn decode(envelope: &Envelope) -> Self {
        let event: &FileEvent = &envelope.event;
        let kind = RecordKind::from_raw(event.syscall_kind);
        let comm = String::from_utf8_lossy(event.comm_bytes()).into_owned();
        let filename = || Some(String::from_utf8_lossy(event.filename_bytes()).into_owned());

        let (filename, fd, bytes) = match kind {
            RecordKind::Known(SyscallKind::Write) => {
                (None, Some(event.fd), Some(event.byte_count))
            }
            RecordKind::Known(SyscallKind::Open | SyscallKind::Unlink) | RecordKind::Unknown(_) => {
                (filename(), None, None)
            }
        };

        Self {
            cpu: envelope.cpu,
            seq: envelope.seq,
            pid: event.pid,
            comm,
            kind,
            filename,
            fd,
            bytes,
            uid: None,
            exe: None,
        }
    }

    /// Best-effort process lookup; the task may already be gone.
    pub fn enrich(&mut self) {
        if let Ok(process) = procfs::process::Process::new(self.pid as i32) {
            self.uid = process.uid().ok();
            self.exe = process.exe().ok().map(|p| p.display().to_string());
        }
    }
}

/// Consumer-side exclusions. The probes themselves never filter.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pids: HashSet<u32>,
    comms: HashSet<String>,
}

impl EventFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut pids: HashSet<u32> = settings.filter.exclude_pids.iter().copied().collect();
        if settings.filter.exclude_self.unwrap_or(true) {
            pids.insert(std::process::id());
        }
        Self {
            pids,
            comms: settings.filter.exclude_comms.iter().cloned().collect(),
        }
    }

    pub fn admits(&self, record: &AuditRecord) -> bool {
        !self.pids.contains(&record.pid) && !self.comms.contains(&record.comm)
    }
}

pub struct Consumer {
    writer: EventWriter,
    filter: EventFilter,
    enrich: bool,
    detector: Option<BurstDetector>,
    responder: Option<Responder>,
    identify: fn(u32) -> Option<ProcessIdentity>,
}

impl Consumer {
    pub fn new(writer: EventWriter, filter: EventFilter, enrich: bool) -> Self {
        Self {
            writer,
            filter,
            enrich,
            detector: None,
            responder: None,
            identify: ProcessIdentity::lookup,
        }
    }

    /// Runs every written record through `detector`; alerts go to
    /// `responder` when there is one.
    pub fn with_detector(mut self, detector: BurstDetector, responder: Option<Responder>) -> Self {
        self.detector = Some(detector);
        self.responder = responder;
        self
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let writer = EventWriter::new(settings.output.format, settings.output.log_file.as_deref())?;
        let consumer = Self::new(
            writer,
            EventFilter::from_settings(settings),
            settings.output.enrich_process.unwrap_or(false),
        );
        if !settings.detector.enabled() {
            return Ok(consumer);
        }

        let responder = settings
            .response
            .enabled()
            .then(|| Responder::from_settings(&settings.response));
        Ok(consumer.with_detector(BurstDetector::from_settings(&settings.detector), responder))
    }

    /// Drains the relay until every producer is gone. Blocking; run it on a
    /// blocking thread. Returns the number of records written, or the first
    /// error that makes further output impossible.
    pub fn run(mut self, mut rx: mpsc::Receiver<Envelope>) -> Result<u64> {
        let mut written = 0;
        while let Some(envelope) = rx.blocking_recv() {
            if self.handle(&envelope)? {
                written += 1;
            }
        }
        if self.writer.failed_appends() > 0 {
            warn!(
                "{} lines could not be appended to the event log",
                self.writer.failed_appends()
            );
        }
        debug!("Relay closed after {} records", written);
        Ok(written)
    }

    /// Returns whether the record was written.
    pub fn handle(&mut self, envelope: &Envelope) -> Result<bool> {
        let mut record = AuditRecord::decode(envelope);
        if let RecordKind::Unknown(code) = record.kind {
            warn!(
                "Record with unknown syscall kind {} from cpu {}",
                code, envelope.cpu
            );
        }

        if !self.filter.admits(&record) {
            return Ok(false);
        }

        if self.enrich {
            record.enrich();
        }

        telemetry::record_file_event(&record);
        self.writer.write(&record)?;
        self.detect(&record)?;
        Ok(true)
    }

    fn detect(&mut self, record: &AuditRecord) -> Result<()> {
        let Some(detector) = self.detector.as_mut() else {
            return Ok(());
        };
        let now = Instant::now();
        let Some(alert) = detector.observe(record, now) else {
            return Ok(());
        };

        warn!("{}", alert);
        telemetry::record_alert(&alert);
        self.writer.write_notice("alert", &alert)?;

        if let Some(responder) = self.responder.as_mut() {
            let action = responder.respond(&alert, (self.identify)(alert.pid), now);
            info!("{}", action);
            self.writer.write_notice("action", &action)?;
        }
        Ok(())
    }
}
