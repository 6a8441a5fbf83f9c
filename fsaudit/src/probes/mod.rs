use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use aya::{Ebpf, maps::PerfEventArray, programs::TracePoint, util::online_cpus};
use bytes::BytesMut;
use fsaudit_common::{EventSink, FileEvent};
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::transport::Relay;

pub mod file_audit;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

/// Records pulled from a perf ring per read call.
const READ_BATCH: usize = 32;

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

/// Loads and attaches one tracepoint program. Returns `Ok(false)` when the
/// kernel does not expose the tracepoint.
pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// Spawns one blocking reader per online CPU. Each reader drains its CPU's
/// perf ring in order into its own relay producer until shutdown.
pub fn spawn_perf_readers(
    bpf: &mut Ebpf,
    map_name: &str,
    page_count: usize,
    relay: &Relay,
) -> Result<Vec<JoinHandle<()>>> {
    let mut perf_array = PerfEventArray::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to get {} map", map_name))?,
    )?;

    let cpus = online_cpus().map_err(|(path, e)| anyhow!("Failed to read {}: {}", path, e))?;
    let mut handles = Vec::with_capacity(cpus.len());

    for cpu_id in cpus {
        let mut buf = perf_array
            .open(cpu_id, Some(page_count))
            .with_context(|| format!("Failed to open perf buffer for CPU {}", cpu_id))?;
        let producer = relay.producer(cpu_id);
        let stats = relay.stats().clone();
        let shutdown = shutdown_flag();

        handles.push(tokio::task::spawn_blocking(move || {
            let mut buffers = (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(std::mem::size_of::<FileEvent>()))
                .collect::<Vec<_>>();

            while !shutdown.load(Ordering::Relaxed) {
                if !buf.readable() {
                    std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
                    continue;
                }

                let events = match buf.read_events(&mut buffers) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("Perf buffer read failed on CPU {}: {}", cpu_id, e);
                        break;
                    }
                };

                stats.record_kernel_lost(events.lost as u64);
                for raw in &buffers[..events.read] {
                    if raw.len() < std::mem::size_of::<FileEvent>() {
                        debug!("Short record ({} bytes) on CPU {}", raw.len(), cpu_id);
                        continue;
                    }
                    let event = unsafe { (raw.as_ptr() as *const FileEvent).read_unaligned() };
                    producer.submit(&event);
                }
            }
            debug!("Reader for CPU {} stopped", producer.cpu());
        }));
    }

    info!("Reading {} on {} CPUs", map_name, handles.len());
    Ok(handles)
}
