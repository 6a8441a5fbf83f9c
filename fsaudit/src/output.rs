//! Rendering and persistence of decoded records.

use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use fsaudit_common::SyscallKind;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::consumer::{AuditRecord, RecordKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One aligned audit line per record.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

pub fn render_text(record: &AuditRecord) -> String {
    let head = format!(
        "{:<5} pid={:5} comm={:<15}",
        record.kind.as_str(),
        record.pid,
        record.comm
    );
    let filename = record.filename.as_deref().unwrap_or("");
    let mut line = match record.kind {
        RecordKind::Known(SyscallKind::Write) => format!(
            "{} fd={} bytes={}",
            head,
            record.fd.unwrap_or(-1),
            record.bytes.unwrap_or(0)
        ),
        RecordKind::Known(SyscallKind::Open | SyscallKind::Unlink) => {
            format!("{} file='{}'", head, filename)
        }
        RecordKind::Unknown(code) => format!(
            "UNKNOWN pid={} comm={} syscall={} file='{}'",
            record.pid, record.comm, code, filename
        ),
    };
    if let Some(uid) = record.uid {
        line.push_str(&format!(" uid={}", uid));
    }
    if let Some(exe) = &record.exe {
        line.push_str(&format!(" exe={}", exe));
    }
    line
}

#[derive(Serialize)]
struct Stamped<'a> {
    ts: String,
    #[serde(flatten)]
    record: &'a AuditRecord,
}

pub fn render_json(record: &AuditRecord, ts: &str) -> Result<String> {
    serde_json::to_string(&Stamped {
        ts: ts.to_string(),
        record,
    })
    .context("Failed to serialize record")
}

#[derive(Serialize)]
struct Notice<'a, T> {
    ts: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

/// Prints each record to stdout and, when configured, appends it to an
/// event log file.
///
/// A failed stdout write is returned to the caller; nobody is reading any
/// more. A failed append is logged and the line skipped.
pub struct EventWriter {
    format: OutputFormat,
    console: Box<dyn Write + Send>,
    file: Option<LineWriter<File>>,
    failed_appends: u64,
}

impl EventWriter {
    pub fn new(format: OutputFormat, log_file: Option<&Path>) -> Result<Self> {
        Self::with_console(format, Box::new(io::stdout()), log_file)
    }

    pub fn with_console(
        format: OutputFormat,
        console: Box<dyn Write + Send>,
        log_file: Option<&Path>,
    ) -> Result<Self> {
        let file = match log_file {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(dir)
                        .with_context(|| format!("Failed to create {}", dir.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open event log {}", path.display()))?;
                Some(LineWriter::new(file))
            }
            None => None,
        };

        Ok(Self {
            format,
            console,
            file,
            failed_appends: 0,
        })
    }

    pub fn write(&mut self, record: &AuditRecord) -> Result<()> {
        let ts = timestamp();
        let line = match self.format {
            OutputFormat::Text => format!("[{}] {}", ts, render_text(record)),
            OutputFormat::Json => render_json(record, &ts)?,
        };
        self.emit(&line)
    }

    /// Writes a detector alert or response action in the record stream.
    pub fn write_notice<T: Serialize + Display>(
        &mut self,
        kind: &'static str,
        notice: &T,
    ) -> Result<()> {
        let ts = timestamp();
        let line = match self.format {
            OutputFormat::Text => format!("[{}] {}", ts, notice),
            OutputFormat::Json => serde_json::to_string(&Notice {
                ts: &ts,
                kind,
                body: notice,
            })
            .context("Failed to serialize notice")?,
        };
        self.emit(&line)
    }

    pub fn failed_appends(&self) -> u64 {
        self.failed_appends
    }

    fn emit(&mut self, line: &str) -> Result<()> {
        writeln!(self.console, "{}", line).context("Failed to write to stdout")?;

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                if self.failed_appends == 0 {
                    warn!("Failed to append to event log: {}", e);
                } else {
                    debug!("Failed to append to event log: {}", e);
                }
                self.failed_appends += 1;
            }
        }
        Ok(())
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: SyscallKind) -> AuditRecord {
        AuditRecord {
            cpu: 0,
            seq: 0,
            pid: 4242,
            comm: "logger".to_string(),
            kind: RecordKind::Known(kind),
            filename: None,
            fd: None,
            bytes: None,
            uid: None,
            exe: None,
        }
    }

    #[test]
    fn text_lines_follow_the_audit_layout() {
        let mut open = record(SyscallKind::Open);
        open.filename = Some("/var/log/app.log".to_string());
        assert_eq!(
            render_text(&open),
            "OPEN  pid= 4242 comm=logger          file='/var/log/app.log'"
        );

        let mut write = record(SyscallKind::Write);
        write.fd = Some(7);
        write.bytes = Some(128);
        assert_eq!(
            render_text(&write),
            "WRITE pid= 4242 comm=logger          fd=7 bytes=128"
        );

        let mut unlink = record(SyscallKind::Unlink);
        unlink.filename = Some("/tmp/old.txt".to_string());
        assert_eq!(
            render_text(&unlink),
            "UNLINK pid= 4242 comm=logger          file='/tmp/old.txt'"
        );
    }

    #[test]
    fn enrichment_is_appended_to_text() {
        let mut open = record(SyscallKind::Open);
        open.filename = Some("/etc/hosts".to_string());
        open.uid = Some(1000);
        open.exe = Some("/usr/bin/cat".to_string());
        assert!(render_text(&open).ends_with("file='/etc/hosts' uid=1000 exe=/usr/bin/cat"));
    }

    #[test]
    fn json_omits_not_applicable_fields() {
        let mut write = record(SyscallKind::Write);
        write.fd = Some(7);
        write.bytes = Some(128);

        let json = render_json(&write, "2024-01-01 00:00:00").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ts"], "2024-01-01 00:00:00");
        assert_eq!(value["syscall"], "WRITE");
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["fd"], 7);
        assert_eq!(value["bytes"], 128);
        assert!(value.get("filename").is_none());
    }

    #[test]
    fn unknown_kind_gets_its_own_line() {
        let mut other = record(SyscallKind::Open);
        other.kind = RecordKind::Unknown(9);
        other.filename = Some("/x".to_string());
        assert_eq!(
            render_text(&other),
            "UNKNOWN pid=4242 comm=logger syscall=9 file='/x'"
        );

        let json = render_json(&other, "t").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["syscall"], "UNKNOWN");
        assert_eq!(value["syscall_code"], 9);
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn closed_stdout_is_an_error() {
        let mut writer =
            EventWriter::with_console(OutputFormat::Text, Box::new(ClosedPipe), None).unwrap();
        assert!(writer.write(&record(SyscallKind::Open)).is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn failed_append_is_counted_and_skipped() {
        let mut writer = EventWriter::with_console(
            OutputFormat::Text,
            Box::new(io::sink()),
            Some(Path::new("/dev/full")),
        )
        .unwrap();

        for _ in 0..3 {
            writer.write(&record(SyscallKind::Open)).unwrap();
        }
        assert_eq!(writer.failed_appends(), 3);
    }

    #[test]
    fn notices_render_in_both_formats() {
        #[derive(Serialize)]
        struct Note {
            pid: u32,
        }

        impl Display for Note {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "[ALERT] pid {}", self.pid)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut text =
            EventWriter::with_console(OutputFormat::Text, Box::new(io::sink()), Some(&path))
                .unwrap();
        text.write_notice("alert", &Note { pid: 3 }).unwrap();
        let mut json =
            EventWriter::with_console(OutputFormat::Json, Box::new(io::sink()), Some(&path))
                .unwrap();
        json.write_notice("alert", &Note { pid: 3 }).unwrap();
        drop((text, json));

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert!(lines[0].ends_with("] [ALERT] pid 3"));
        let value: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(value["type"], "alert");
        assert_eq!(value["pid"], 3);
    }

    #[test]
    fn writer_appends_and_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.log");

        let mut open = record(SyscallKind::Open);
        open.filename = Some("/a".to_string());

        let mut writer = EventWriter::new(OutputFormat::Text, Some(&path)).unwrap();
        writer.write(&open).unwrap();
        drop(writer);

        let mut writer = EventWriter::new(OutputFormat::Json, Some(&path)).unwrap();
        writer.write(&open).unwrap();
        drop(writer);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("file='/a'"));
        assert!(lines[1].contains("\"filename\":\"/a\""));
    }
}
