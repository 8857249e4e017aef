//! Final run report.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::worker::WorkerOutcome;

/// Output format of the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReportFormat {
    /// `<total-bytes> bytes read from <C> websockets`
    #[default]
    Text,
    /// One JSON object with the full report
    Json,
}

/// How many workers finished in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub not_started: usize,
    pub dial_failed: usize,
    pub remote_closed: usize,
    pub read_failed: usize,
    pub stopped: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: WorkerOutcome) {
        let slot = match outcome {
            WorkerOutcome::NotStarted => &mut self.not_started,
            WorkerOutcome::DialFailed => &mut self.dial_failed,
            WorkerOutcome::RemoteClosed => &mut self.remote_closed,
            WorkerOutcome::ReadFailed => &mut self.read_failed,
            WorkerOutcome::Stopped => &mut self.stopped,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.not_started + self.dial_failed + self.remote_closed + self.read_failed + self.stopped
    }
}

/// Aggregate result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Sum of every connection's byte counter.
    pub total_bytes: u64,
    /// Configured connection count.
    pub connections: usize,
    /// Workers that completed the WebSocket handshake.
    pub connected: usize,
    /// Workers whose dial failed.
    pub dial_failures: usize,
    /// Final state of every worker that has exited.
    pub outcomes: OutcomeCounts,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    report: &'a RunReport,
    bytes_per_second: f64,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunReport {
    /// Read throughput over the whole run, in bytes per second.
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / secs
    }

    /// Renders the report in the requested format.
    pub fn render(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Text => self.to_string(),
            ReportFormat::Json => {
                let json = JsonReport {
                    report: self,
                    bytes_per_second: self.bytes_per_second(),
                };
                serde_json::to_string(&json).unwrap_or_else(|e| {
                    format!("{{\"error\":\"failed to serialize report: {}\"}}", e)
                })
            }
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes read from {} websockets",
            self.total_bytes, self.connections
        )
    }
}
