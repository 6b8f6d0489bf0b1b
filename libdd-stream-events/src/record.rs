// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire records. The JSON shape is versioned and stable across sinks;
//! downstream format adapters (CEF, LEEF, HEC, ECS, syslog) translate from
//! this schema and rely on every field here being present.

use chrono::Utc;
use libdd_stream_common::{format_ts, FieldValue, Finding, Frame};
use serde::Serialize;
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: u32 = 1;

/// Per-ring statistics, surfaced in `stats` records and from
/// `CaptureEngine::buffer_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub written: u64,
    pub events_sent: u64,
    pub dropped: u64,
    pub usage_pct: f64,
    pub write_rate_bps: f64,
    pub scan_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// "proc" or "trace".
    pub method: String,
    pub attempts: u64,
    pub successful: u64,
    pub bytes: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Event,
    Frame,
    Finding,
    Stats,
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Event {
        schema_version: u32,
        ts: String,
        pid: i32,
        stream: String,
        direction: String,
        size: usize,
        snippet: String,
    },
    Frame {
        schema_version: u32,
        ts: String,
        pid: i32,
        protocol: String,
        session_id: String,
        fields: BTreeMap<String, FieldValue>,
        raw_size: usize,
    },
    Finding {
        schema_version: u32,
        ts: String,
        pid: i32,
        scope: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        related_session_ids: Vec<String>,
        kind: String,
        subtype: String,
        severity: String,
        confidence: f64,
        evidence: String,
        context: String,
    },
    Stats {
        schema_version: u32,
        ts: String,
        pid: i32,
        buffers: BTreeMap<String, BufferStats>,
        capture: CaptureStats,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        sinks: Vec<crate::bus::SinkStats>,
    },
    Start {
        schema_version: u32,
        ts: String,
        pid: i32,
        target: String,
    },
    Stop {
        schema_version: u32,
        ts: String,
        pid: i32,
        reason: String,
    },
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Event { .. } => RecordKind::Event,
            Record::Frame { .. } => RecordKind::Frame,
            Record::Finding { .. } => RecordKind::Finding,
            Record::Stats { .. } => RecordKind::Stats,
            Record::Start { .. } => RecordKind::Start,
            Record::Stop { .. } => RecordKind::Stop,
        }
    }

    pub fn pid(&self) -> i32 {
        match self {
            Record::Event { pid, .. }
            | Record::Frame { pid, .. }
            | Record::Finding { pid, .. }
            | Record::Stats { pid, .. }
            | Record::Start { pid, .. }
            | Record::Stop { pid, .. } => *pid,
        }
    }

    /// Raw-stream event. `snippet` must already be redacted and bounded by
    /// the caller (see `SecretScanner::snippet`).
    pub fn event(
        pid: i32,
        stream: &str,
        direction: &str,
        size: usize,
        snippet: String,
    ) -> Self {
        Record::Event {
            schema_version: SCHEMA_VERSION,
            ts: format_ts(Utc::now()),
            pid,
            stream: stream.to_string(),
            direction: direction.to_string(),
            size,
            snippet,
        }
    }

    /// Parsed-frame summary. Carries field values, never the raw bytes.
    pub fn frame(frame: &Frame, session_id: &str) -> Self {
        Record::Frame {
            schema_version: SCHEMA_VERSION,
            ts: format_ts(frame.ts),
            pid: frame.pid,
            protocol: frame.protocol.as_str().to_string(),
            session_id: session_id.to_string(),
            fields: frame.fields.clone(),
            raw_size: frame.raw.len(),
        }
    }

    pub fn finding(pid: i32, finding: &Finding) -> Self {
        Record::Finding {
            schema_version: SCHEMA_VERSION,
            ts: format_ts(finding.ts),
            pid,
            scope: match finding.scope {
                libdd_stream_common::FindingScope::Frame => "frame".to_string(),
                libdd_stream_common::FindingScope::Session => "session".to_string(),
            },
            session_id: finding.session_id.clone(),
            related_session_ids: finding.related_session_ids.clone(),
            kind: finding.kind.as_str().to_string(),
            subtype: finding.subtype.clone(),
            severity: finding.severity.as_str().to_string(),
            confidence: finding.confidence,
            evidence: finding.evidence().to_string(),
            context: finding.context.clone(),
        }
    }

    pub fn stats(
        pid: i32,
        buffers: BTreeMap<String, BufferStats>,
        capture: CaptureStats,
        sinks: Vec<crate::bus::SinkStats>,
    ) -> Self {
        Record::Stats {
            schema_version: SCHEMA_VERSION,
            ts: format_ts(Utc::now()),
            pid,
            buffers,
            capture,
            sinks,
        }
    }

    pub fn start(pid: i32, target: &str) -> Self {
        Record::Start {
            schema_version: SCHEMA_VERSION,
            ts: format_ts(Utc::now()),
            pid,
            target: target.to_string(),
        }
    }

    pub fn stop(pid: i32, reason: &str) -> Self {
        Record::Stop {
            schema_version: SCHEMA_VERSION,
            ts: format_ts(Utc::now()),
            pid,
            reason: reason.to_string(),
        }
    }

    /// One JSON line, newline-terminated.
    pub fn to_json_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"stop","schema_version":{SCHEMA_VERSION},"reason":"error:internal serialization {e}"}}"#
            )
        });
        line.push('\n');
        line
    }
}
