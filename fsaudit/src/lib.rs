use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use aya::Ebpf;
use fsaudit_common::FILE_EVENTS_MAP;
use log::{error, info, warn};
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};

use crate::consumer::Consumer;
use crate::probes::{Probe, file_audit::FileAuditProbe, request_shutdown, spawn_perf_readers};
use crate::settings::Settings;
use crate::transport::DropStats;

pub mod consumer;
pub mod detector;
pub mod output;
pub mod probes;
pub mod response;
pub mod settings;
pub mod telemetry;
pub mod transport;

pub struct FsAuditEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl FsAuditEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let bpf = Ebpf::load(bytecode)?;
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        FileAuditProbe::new(self.settings.probes.clone()).attach(&mut self.bpf)?;

        let consumer = Consumer::from_settings(&self.settings)?;
        let stats = Arc::new(DropStats::default());
        let (relay, rx) =
            transport::relay(self.settings.transport.relay_capacity(), stats.clone());
        let readers = spawn_perf_readers(
            &mut self.bpf,
            FILE_EVENTS_MAP,
            self.settings.transport.perf_pages(),
            &relay,
        )?;
        // Readers hold the only producers; the consumer sees end-of-stream
        // once they all stop.
        drop(relay);

        let mut consumer = tokio::task::spawn_blocking(move || consumer.run(rx));

        info!("Monitoring active. Press Ctrl-C to exit.");
        let finished = wait_for_exit(signal::ctrl_c(), &mut consumer).await;

        request_shutdown();
        for reader in readers {
            if let Err(e) = reader.await {
                warn!("Perf reader task failed: {}", e);
            }
        }
        let outcome = match finished {
            Some(outcome) => outcome,
            None => consumer.await,
        }
        .context("Consumer task panicked")?;

        if stats.total() > 0 {
            warn!(
                "Dropped {} records (kernel ring full: {}, relay full: {})",
                stats.total(),
                stats.kernel_lost(),
                stats.relay_dropped()
            );
        }

        // Detaches every program and frees the maps.
        drop(self.bpf);

        let written = outcome.context("Consumer stopped")?;
        info!("Wrote {} records", written);
        Ok(())
    }
}

/// Waits for `stop` or for the consumer to end on its own, whichever comes
/// first. Returns the consumer's result only in the second case.
async fn wait_for_exit<F>(
    stop: F,
    consumer: &mut JoinHandle<Result<u64>>,
) -> Option<Result<Result<u64>, JoinError>>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        res = stop => {
            match res {
                Ok(()) => info!("Exiting..."),
                Err(e) => error!("Failed to listen for Ctrl-C: {}; exiting", e),
            }
            None
        }
        res = consumer => {
            match &res {
                Ok(Err(e)) => error!("Consumer stopped: {:#}; shutting down", e),
                Ok(Ok(_)) => warn!("Consumer finished before shutdown was requested"),
                Err(e) => error!("Consumer task failed: {}", e),
            }
            Some(res)
        }
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
