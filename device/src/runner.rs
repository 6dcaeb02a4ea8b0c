use common::{IngestError, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use crate::cycle::SendCycle;
use crate::events::{SendStats, StatsSummary};
use crate::sensor::SimulatedSensor;
use crate::transport::Transport;

/// Sends a fresh reading on a fixed interval through every configured
/// transport. Cycles run one after another; a slow cycle, retries included,
/// pushes the next tick back instead of overlapping it.
pub struct RealtimeSender {
    cycle: SendCycle,
    sensor: SimulatedSensor,
    device_id: String,
    transports: Vec<Box<dyn Transport>>,
    interval: Duration,
    max_cycles: Option<u64>,
    stats: Arc<SendStats>,
}

impl RealtimeSender {
    /// `stats` must also be one of the cycle's event sinks for the final
    /// summary to reflect the run. A zero interval is rejected.
    pub fn new(
        cycle: SendCycle,
        sensor: SimulatedSensor,
        device_id: impl Into<String>,
        interval: Duration,
        stats: Arc<SendStats>,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(IngestError::ConfigError("Send interval must be greater than zero".to_string()));
        }

        Ok(Self {
            cycle,
            sensor,
            device_id: device_id.into(),
            transports: Vec::new(),
            interval,
            max_cycles: None,
            stats,
        })
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn with_max_cycles(mut self, max_cycles: Option<u64>) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    /// Runs until `shutdown` turns true (or its sender is dropped) or
    /// `max_cycles` ticks have completed. A cycle already in flight is
    /// allowed to finish. Transports are closed before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> StatsSummary {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let transports: Vec<&str> = self.transports.iter().map(|t| t.kind().as_str()).collect();
        info!(
            "Sending for device {} every {:?} via {}",
            self.device_id,
            self.interval,
            transports.join(", ")
        );

        let mut completed = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.sensor.read() {
                Ok(reading) => {
                    for transport in &self.transports {
                        self.cycle.run(&self.device_id, &reading, transport.as_ref()).await;
                    }
                }
                Err(e) => warn!("Skipping tick, sensor read failed: {}", e),
            }

            completed += 1;
            if self.max_cycles.map_or(false, |max| completed >= max) {
                info!("Completed {} cycles", completed);
                break;
            }
        }

        info!("Stopping sender, closing transports");
        for transport in &self.transports {
            transport.close().await;
        }

        self.stats.summary()
    }
}
