//! Structured send events.
//!
//! The sender never prints; every step of a cycle becomes a `SendEvent` and
//! sinks decide what to do with it.

use common::{DeliveryResult, ErrorKind, TransportKind};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum SendEvent {
    CycleStarted {
        transport: TransportKind,
        device_id: String,
    },
    Delivered {
        transport: TransportKind,
        rotated: bool,
        latency: Duration,
        message: Option<String>,
    },
    Rejected {
        transport: TransportKind,
        result: DeliveryResult,
    },
    RenewalRequested {
        transport: TransportKind,
        device_id: String,
    },
    SecretRenewed {
        transport: TransportKind,
        device_id: String,
    },
    /// A transient failure; the cycle tries again after `delay`.
    RetryScheduled {
        transport: TransportKind,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    CycleFailed {
        transport: TransportKind,
        kind: ErrorKind,
        reason: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SendEvent);
}

/// Routes events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &SendEvent) {
        match event {
            SendEvent::CycleStarted { transport, device_id } => {
                debug!("[{}] Sending reading for device {}", transport, device_id);
            }
            SendEvent::Delivered { transport, rotated, latency, message } => {
                let message = message.as_deref().unwrap_or("accepted");
                if *rotated {
                    info!("[{}] Delivered with renewed secret in {:?}: {}", transport, latency, message);
                } else {
                    info!("[{}] Delivered in {:?}: {}", transport, latency, message);
                }
            }
            SendEvent::Rejected { transport, result } => {
                warn!("[{}] Delivery rejected: {}", transport, result);
            }
            SendEvent::RenewalRequested { transport, device_id } => {
                info!("[{}] Credentials rejected, requesting a new secret for device {}", transport, device_id);
            }
            SendEvent::SecretRenewed { transport, device_id } => {
                info!("[{}] Received a new secret for device {}, retrying once", transport, device_id);
            }
            SendEvent::RetryScheduled { transport, attempt, delay, reason } => {
                warn!("[{}] Attempt {} failed ({}), retrying in {:?}", transport, attempt, reason, delay);
            }
            SendEvent::CycleFailed { transport, kind, reason } => {
                warn!("[{}] Cycle failed ({}): {}", transport, kind, reason);
            }
        }
    }
}

/// Sends every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanOut {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanOut {
    fn emit(&self, event: &SendEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Latency samples kept for the p95; average and max cover the whole run.
const LATENCY_WINDOW: usize = 1024;

#[derive(Default)]
struct LatencyTracker {
    recent: VecDeque<Duration>,
    total: Duration,
    count: u64,
    max: Duration,
}

impl LatencyTracker {
    fn record(&mut self, latency: Duration) {
        if self.recent.len() == LATENCY_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(latency);
        self.total += latency;
        self.count += 1;
        self.max = self.max.max(latency);
    }

    fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total.as_secs_f64() * 1000.0 / self.count as f64
    }

    fn p95_ms(&self) -> f64 {
        let mut samples: Vec<f64> = self.recent.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        let idx = ((samples.len() as f64 * 0.95) as usize).min(samples.len() - 1);
        samples[idx]
    }
}

#[derive(Default)]
struct TransportTally {
    cycles: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rotations: AtomicU64,
    retries: AtomicU64,
    latencies: RwLock<LatencyTracker>,
}

/// Running per-transport counters.
pub struct SendStats {
    http: TransportTally,
    mqtt: TransportTally,
    failures: RwLock<BTreeMap<ErrorKind, u64>>,
    started_at: Instant,
}

impl Default for SendStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SendStats {
    pub fn new() -> Self {
        Self {
            http: TransportTally::default(),
            mqtt: TransportTally::default(),
            failures: RwLock::new(BTreeMap::new()),
            started_at: Instant::now(),
        }
    }

    fn tally(&self, transport: TransportKind) -> &TransportTally {
        match transport {
            TransportKind::Http => &self.http,
            TransportKind::Mqtt => &self.mqtt,
        }
    }

    pub fn delivered(&self, transport: TransportKind) -> u64 {
        self.tally(transport).delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self, transport: TransportKind) -> u64 {
        self.tally(transport).failed.load(Ordering::Relaxed)
    }

    pub fn failures_of(&self, kind: ErrorKind) -> u64 {
        self.failures.read().get(&kind).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> StatsSummary {
        let transports = [TransportKind::Http, TransportKind::Mqtt]
            .into_iter()
            .filter_map(|kind| {
                let tally = self.tally(kind);
                let cycles = tally.cycles.load(Ordering::Relaxed);
                if cycles == 0 {
                    return None;
                }

                let latencies = tally.latencies.read();
                Some(TransportSummary {
                    transport: kind,
                    cycles,
                    delivered: tally.delivered.load(Ordering::Relaxed),
                    failed: tally.failed.load(Ordering::Relaxed),
                    rotations: tally.rotations.load(Ordering::Relaxed),
                    retries: tally.retries.load(Ordering::Relaxed),
                    avg_latency: latencies.avg_ms(),
                    p95_latency: latencies.p95_ms(),
                    max_latency: latencies.max.as_secs_f64() * 1000.0,
                })
            })
            .collect();

        StatsSummary {
            transports,
            failures: self.failures.read().clone(),
            duration: self.started_at.elapsed(),
        }
    }
}

impl EventSink for SendStats {
    fn emit(&self, event: &SendEvent) {
        match event {
            SendEvent::CycleStarted { transport, .. } => {
                self.tally(*transport).cycles.fetch_add(1, Ordering::Relaxed);
            }
            SendEvent::Delivered { transport, latency, .. } => {
                let tally = self.tally(*transport);
                tally.delivered.fetch_add(1, Ordering::Relaxed);
                tally.latencies.write().record(*latency);
            }
            SendEvent::RetryScheduled { transport, .. } => {
                self.tally(*transport).retries.fetch_add(1, Ordering::Relaxed);
            }
            SendEvent::SecretRenewed { transport, .. } => {
                self.tally(*transport).rotations.fetch_add(1, Ordering::Relaxed);
            }
            SendEvent::CycleFailed { transport, kind, .. } => {
                self.tally(*transport).failed.fetch_add(1, Ordering::Relaxed);
                *self.failures.write().entry(*kind).or_insert(0) += 1;
            }
            SendEvent::Rejected { .. } | SendEvent::RenewalRequested { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportSummary {
    pub transport: TransportKind,
    pub cycles: u64,
    pub delivered: u64,
    pub failed: u64,
    pub rotations: u64,
    pub retries: u64,
    pub avg_latency: f64,
    pub p95_latency: f64,
    pub max_latency: f64,
}

impl TransportSummary {
    pub fn success_rate(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.delivered as f64 / self.cycles as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub transports: Vec<TransportSummary>,
    pub failures: BTreeMap<ErrorKind, u64>,
    pub duration: Duration,
}

impl StatsSummary {
    pub fn total_delivered(&self) -> u64 {
        self.transports.iter().map(|t| t.delivered).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.transports.iter().map(|t| t.failed).sum()
    }

    pub fn print_report(&self) {
        println!("{}", self);
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\nSend Results:")?;
        writeln!(f, "=============")?;
        for t in &self.transports {
            writeln!(f, "{}:", t.transport.as_str().to_uppercase())?;
            writeln!(f, "  Cycles:              {}", t.cycles)?;
            writeln!(f, "  Delivered:           {}", t.delivered)?;
            writeln!(f, "  Failed:              {}", t.failed)?;
            writeln!(f, "  Secret Rotations:    {}", t.rotations)?;
            writeln!(f, "  Retries:             {}", t.retries)?;
            writeln!(f, "  Success Rate:        {:.2}%", t.success_rate())?;
            writeln!(f, "  Latency Avg:         {:.2}ms", t.avg_latency)?;
            writeln!(f, "  Latency P95:         {:.2}ms", t.p95_latency)?;
            writeln!(f, "  Latency Max:         {:.2}ms", t.max_latency)?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "\nFailures:")?;
            for (kind, count) in &self.failures {
                writeln!(f, "  {:<21}{}", format!("{}:", kind), count)?;
            }
        }
        write!(f, "\nRun Duration:         {:.2}s", self.duration.as_secs_f64())
    }
}
