//! Userspace half of the event transport.
//!
//! ```text
//! ┌─────────────┐
//! │ eBPF (CPU 0)│ → perf ring (CPU 0) → reader 0 ┐
//! ├─────────────┤                                 │
//! │ eBPF (CPU 1)│ → perf ring (CPU 1) → reader 1  ├→ relay → consumer
//! ├─────────────┤                                 │
//! │ eBPF (CPU 2)│ → perf ring (CPU 2) → reader 2 ┘
//! └─────────────┘
//! ```
//!
//! Each CPU reader owns one [`RelayProducer`]. A producer never blocks: when
//! the relay is full the record is dropped and counted, exactly like a full
//! perf ring in the kernel. Order is preserved per producer only.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fsaudit_common::{EventSink, FileEvent};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::telemetry;

/// A record tagged with the CPU whose ring it came through.
#[derive(Clone, Copy)]
pub struct Envelope {
    pub cpu: u32,
    /// Per-CPU position among records the relay accepted.
    pub seq: u64,
    pub event: FileEvent,
}

/// Monotonic loss counters for both halves of the transport.
#[derive(Debug, Default)]
pub struct DropStats {
    kernel_lost: AtomicU64,
    relay_dropped: AtomicU64,
}

impl DropStats {
    /// Records reported lost by a perf ring (full when the probe fired).
    pub fn record_kernel_lost(&self, count: u64) {
        if count > 0 {
            self.kernel_lost.fetch_add(count, Ordering::Relaxed);
            telemetry::record_dropped_events("kernel", count);
        }
    }

    fn record_relay_drop(&self) {
        self.relay_dropped.fetch_add(1, Ordering::Relaxed);
        telemetry::record_dropped_events("relay", 1);
    }

    pub fn kernel_lost(&self) -> u64 {
        self.kernel_lost.load(Ordering::Relaxed)
    }

    pub fn relay_dropped(&self) -> u64 {
        self.relay_dropped.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.kernel_lost() + self.relay_dropped()
    }
}

/// Creates a relay holding at most `capacity` records in flight.
pub fn relay(capacity: usize, stats: Arc<DropStats>) -> (Relay, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Relay { tx, stats }, rx)
}

#[derive(Clone)]
pub struct Relay {
    tx: mpsc::Sender<Envelope>,
    stats: Arc<DropStats>,
}

impl Relay {
    /// A producer for one CPU. Use exactly one per CPU ring.
    pub fn producer(&self, cpu: u32) -> RelayProducer {
        RelayProducer {
            cpu,
            next_seq: Cell::new(0),
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> &Arc<DropStats> {
        &self.stats
    }
}

/// Single-writer handle; `Send` but not `Sync`.
pub struct RelayProducer {
    cpu: u32,
    next_seq: Cell<u64>,
    tx: mpsc::Sender<Envelope>,
    stats: Arc<DropStats>,
}

impl RelayProducer {
    pub fn cpu(&self) -> u32 {
        self.cpu
    }
}

impl EventSink for RelayProducer {
    fn submit(&self, event: &FileEvent) {
        let seq = self.next_seq.get();
        let envelope = Envelope {
            cpu: self.cpu,
            seq,
            event: *event,
        };
        match self.tx.try_send(envelope) {
            Ok(()) => self.next_seq.set(seq + 1),
            // A closed relay means the consumer is gone (shutdown); the
            // record is lost either way.
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.stats.record_relay_drop()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsaudit_common::SyscallKind;
    use std::time::Duration;

    fn write_event(pid: u32, count: u64) -> FileEvent {
        let mut event = FileEvent::zeroed();
        event.pid = pid;
        event.syscall_kind = SyscallKind::Write as u32;
        event.fd = pid as i32;
        event.byte_count = count;
        event
    }

    #[test]
    fn accepted_records_keep_producer_order() {
        let (relay, mut rx) = relay(16, Arc::default());
        let producer = relay.producer(3);
        for n in 0..5 {
            producer.submit(&write_event(1, n));
        }
        drop((relay, producer));

        let mut seen = Vec::new();
        while let Some(env) = rx.blocking_recv() {
            assert_eq!(env.cpu, 3);
            seen.push((env.seq, env.event.byte_count));
        }
        assert_eq!(seen, (0..5).map(|n| (n, n)).collect::<Vec<_>>());
    }

    #[test]
    fn full_relay_drops_and_counts() {
        let stats = Arc::new(DropStats::default());
        let (relay, mut rx) = relay(2, stats.clone());
        let producer = relay.producer(0);

        for n in 0..5 {
            producer.submit(&write_event(1, n));
        }

        assert_eq!(stats.relay_dropped(), 3);
        assert_eq!(stats.kernel_lost(), 0);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.event.byte_count, second.event.byte_count), (0, 1));
        assert!(rx.try_recv().is_err());

        // Sequence numbers only advance on acceptance.
        producer.submit(&write_event(1, 9));
        assert_eq!(rx.try_recv().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn submit_to_a_full_relay_never_blocks() {
        let stats = Arc::new(DropStats::default());
        let (relay, _rx) = relay(1, stats.clone());
        let producer = relay.producer(0);
        producer.submit(&write_event(1, 0));

        let submitted = tokio::time::timeout(
            Duration::from_millis(500),
            tokio::task::spawn_blocking(move || {
                for n in 0..1000 {
                    producer.submit(&write_event(1, n));
                }
            }),
        )
        .await;

        assert!(submitted.is_ok(), "submit blocked on a full relay");
        assert_eq!(stats.relay_dropped(), 1000);
    }

    #[test]
    fn closed_relay_counts_as_dropped() {
        let stats = Arc::new(DropStats::default());
        let (relay, rx) = relay(4, stats.clone());
        drop(rx);
        relay.producer(0).submit(&write_event(1, 0));
        assert_eq!(stats.relay_dropped(), 1);
    }

    #[test]
    fn concurrent_producers_keep_their_own_order_and_fields() {
        const PER_CPU: u64 = 2000;
        let (relay, mut rx) = relay(4 * PER_CPU as usize, Arc::default());

        let handles: Vec<_> = (0..2u32)
            .map(|cpu| {
                let producer = relay.producer(cpu);
                std::thread::spawn(move || {
                    for n in 0..PER_CPU {
                        producer.submit(&write_event(100 + cpu, n));
                    }
                })
            })
            .collect();
        drop(relay);
        for handle in handles {
            handle.join().unwrap();
        }

        let mut next = [0u64; 2];
        while let Some(env) = rx.blocking_recv() {
            let cpu = env.cpu as usize;
            assert_eq!(env.seq, next[cpu]);
            assert_eq!(env.event.byte_count, next[cpu]);
            assert_eq!(env.event.pid, 100 + env.cpu);
            assert_eq!(env.event.fd, 100 + env.cpu as i32);
            next[cpu] += 1;
        }
        assert_eq!(next, [PER_CPU, PER_CPU]);
    }

    #[test]
    fn kernel_losses_accumulate() {
        let stats = DropStats::default();
        stats.record_kernel_lost(0);
        stats.record_kernel_lost(4);
        stats.record_kernel_lost(6);
        assert_eq!(stats.kernel_lost(), 10);
        assert_eq!(stats.total(), 10);
    }
}
