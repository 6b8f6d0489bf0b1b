// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Destination for serialized records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// JSON-lines file with size-based rotation.
    File {
        path: String,
        /// Rotate when the file reaches this size. 0 disables rotation.
        max_size_bytes: u64,
        /// Historical files kept after rotation.
        max_files: u64,
    },
    /// JSON-lines over a TCP connection.
    Tcp { addr: String },
    /// JSON-lines over a Unix domain socket.
    UnixSocket { path: String },
    /// JSON-lines into an existing named pipe.
    NamedPipe { path: String },
    /// JSON-lines on standard output, optionally ANSI-colored by severity.
    Console { color: bool },
}

impl SinkConfig {
    /// Lossy sinks drop their oldest queued record under pressure; durable
    /// sinks briefly block the producer instead.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            SinkConfig::File { .. } | SinkConfig::UnixSocket { .. } | SinkConfig::NamedPipe { .. }
        )
    }
}

/// Engine configuration. Every knob has a documented default; `validate`
/// rejects combinations the engine cannot run with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-stream ring buffer capacity in bytes.
    pub ring_capacity: usize,
    /// Record delimiter, opaque bytes.
    pub delimiter: Vec<u8>,
    /// Fastest and slowest adaptive scan intervals.
    pub scan_interval_min: Duration,
    pub scan_interval_max: Duration,
    /// Initial scan interval, within the bounds above.
    pub scan_interval: Duration,
    /// Bytes per read from a capture source.
    pub chunk_size: usize,
    /// Switch to the syscall tracer when a stream is a pseudo-terminal.
    pub strace_fallback_enabled: bool,
    /// Syscall events per second per PID before the tracer starts sampling.
    pub trace_event_rate_cap: u32,
    /// Also trace signal deliveries (see DESIGN.md, open question).
    pub trace_signal_events: bool,

    /// Idle session lifetime.
    pub session_ttl: Duration,
    /// Lifetime of a completed session awaiting its final checker pass.
    pub completed_session_ttl: Duration,
    /// Cadence of the background session sweeper.
    pub sweep_interval: Duration,
    /// Frames retained per session; older frames are counted but dropped.
    pub frame_history: usize,

    /// Dissection limits.
    pub max_frame_size: usize,
    pub regex_timeout: Duration,
    pub identify_confidence_threshold: f64,
    pub json_max_depth: usize,

    /// Checker thresholds.
    pub max_reuse_count: u64,
    pub max_session_duration: Duration,
    pub min_id_entropy_bits: f64,
    pub suppression_window: Duration,

    /// Output.
    pub sinks: Vec<SinkConfig>,
    pub queue_capacity: usize,
    pub sink_block_timeout: Duration,
    pub shutdown_flush_timeout: Duration,
    pub stats_interval: Duration,
    pub snippet_max_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ring_capacity: 256 * 1024,
            delimiter: b"\n".to_vec(),
            scan_interval_min: Duration::from_millis(10),
            scan_interval_max: Duration::from_millis(200),
            scan_interval: Duration::from_millis(50),
            chunk_size: 4096,
            strace_fallback_enabled: false,
            trace_event_rate_cap: 50_000,
            trace_signal_events: false,
            session_ttl: Duration::from_secs(30),
            completed_session_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            frame_history: 1024,
            max_frame_size: 10 * 1024 * 1024,
            regex_timeout: Duration::from_millis(100),
            identify_confidence_threshold: 0.7,
            json_max_depth: 64,
            max_reuse_count: 100,
            max_session_duration: Duration::from_secs(24 * 60 * 60),
            min_id_entropy_bits: 32.0,
            suppression_window: Duration::from_secs(60),
            sinks: Vec::new(),
            queue_capacity: 10_000,
            sink_block_timeout: Duration::from_millis(100),
            shutdown_flush_timeout: Duration::from_secs(2),
            stats_interval: Duration::from_secs(10),
            snippet_max_bytes: 128,
        }
    }
}

impl EngineConfig {
    /// Check option combinations the engine cannot run with. Called once at
    /// engine construction; a failure here is fatal.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.ring_capacity == 0 {
            return Err(EngineError::Config("ring_capacity must be non-zero".into()));
        }
        if self.delimiter.is_empty() {
            return Err(EngineError::Config("delimiter must be non-empty".into()));
        }
        if self.delimiter.len() >= self.ring_capacity {
            return Err(EngineError::Config(
                "delimiter must be shorter than ring_capacity".into(),
            ));
        }
        if self.scan_interval_min > self.scan_interval_max {
            return Err(EngineError::Config(format!(
                "scan interval bounds inverted: {:?} > {:?}",
                self.scan_interval_min, self.scan_interval_max
            )));
        }
        if self.scan_interval < self.scan_interval_min || self.scan_interval > self.scan_interval_max
        {
            return Err(EngineError::Config(
                "scan_interval outside configured bounds".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(EngineError::Config("chunk_size must be non-zero".into()));
        }
        if self.max_frame_size == 0 {
            return Err(EngineError::Config("max_frame_size must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.identify_confidence_threshold) {
            return Err(EngineError::Config(
                "identify_confidence_threshold must be within [0, 1]".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("queue_capacity must be non-zero".into()));
        }
        if self.frame_history == 0 {
            return Err(EngineError::Config("frame_history must be non-zero".into()));
        }
        if self.json_max_depth == 0 {
            return Err(EngineError::Config("json_max_depth must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_ring_capacity() {
        let cfg = EngineConfig {
            ring_capacity: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_delimiter() {
        let cfg = EngineConfig {
            delimiter: Vec::new(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_scan_bounds() {
        let cfg = EngineConfig {
            scan_interval_min: Duration::from_millis(500),
            scan_interval_max: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_bounds_initial_interval() {
        let cfg = EngineConfig {
            scan_interval: Duration::from_millis(5),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sink_durability() {
        assert!(SinkConfig::File {
            path: "x".into(),
            max_size_bytes: 0,
            max_files: 0
        }
        .is_durable());
        assert!(!SinkConfig::Console { color: false }.is_durable());
        assert!(!SinkConfig::Tcp {
            addr: "127.0.0.1:9".into()
        }
        .is_durable());
    }
}
