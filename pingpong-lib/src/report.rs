use std::{io::Write, time::Duration};

use crate::{
    error::{PingpongError, Result},
    policy::Phase,
    sweep::SweepPoint,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub phase: Phase,
    pub units: usize,
    pub bytes: usize,
    pub repeat: usize,
    /// Mean time per operation.
    pub latency_us: f64,
    /// Per-channel bandwidth, bytes per microsecond.
    pub bandwidth_mbps: f64,
    /// `bandwidth_mbps` times the number of channels.
    pub aggregate_mbps: f64,
}

impl Measurement {
    pub fn new(
        phase: Phase,
        point: SweepPoint,
        elapsed: Duration,
        direction_factor: usize,
        num_channels: usize,
    ) -> Self {
        let ops = (point.repeat * direction_factor.max(1)) as f64;
        let latency_us = elapsed.as_secs_f64() * 1e6 / ops;
        let bandwidth_mbps = if latency_us > 0.0 { point.bytes as f64 / latency_us } else { 0.0 };
        Self {
            phase,
            units: point.units,
            bytes: point.bytes,
            repeat: point.repeat,
            latency_us,
            bandwidth_mbps,
            aggregate_mbps: bandwidth_mbps * num_channels as f64,
        }
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:<8} (x {:4}): {:8.2} us, {:8.2} MB/s, total {:8.2} MB/s",
            self.phase.label(),
            self.units,
            self.repeat,
            self.latency_us,
            self.bandwidth_mbps,
            self.aggregate_mbps
        )
    }
}

/// Collects measurements and prints one line per (phase, size).
pub struct Reporter {
    out: Box<dyn Write + Send>,
    measurements: Vec<Measurement>,
}

impl Reporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out, measurements: Vec::new() }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn sink() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    pub fn record(&mut self, measurement: Measurement) -> Result<()> {
        writeln!(self.out, "{measurement}")
            .and_then(|_| self.out.flush())
            .map_err(|e| PingpongError::Report(e.to_string()))?;
        self.measurements.push(measurement);
        Ok(())
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn into_measurements(self) -> Vec<Measurement> {
        self.measurements
    }
}
