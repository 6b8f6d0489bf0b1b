// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocols the dissector registry can recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Grpc,
    WebSocket,
    Json,
    Sql,
    PlainText,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Grpc => "gRPC",
            Protocol::WebSocket => "WebSocket",
            Protocol::Json => "JSON",
            Protocol::Sql => "SQL",
            Protocol::PlainText => "PlainText",
        }
    }

    /// Lowercase prefix used to namespace session identifiers.
    pub fn session_prefix(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
            Protocol::WebSocket => "websocket",
            Protocol::Json => "json",
            Protocol::Sql => "sql",
            Protocol::PlainText => "plaintext",
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One directed standard stream of a target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Stdin, StreamKind::Stdout, StreamKind::Stderr];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    pub fn fd(&self) -> i32 {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }

    /// Direction relative to the target process: stdin flows into it,
    /// stdout/stderr flow out of it.
    pub fn direction(&self) -> Direction {
        match self {
            StreamKind::Stdin => Direction::Inbound,
            StreamKind::Stdout | StreamKind::Stderr => Direction::Outbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

impl Serialize for Direction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Value of one dissected field. Mirrors the JSON value space so frame
/// summaries serialize without translation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Seq(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Product of one successful dissection.
///
/// `raw` is retained only so checkers can derive evidence from it; it never
/// reaches a sink verbatim.
#[derive(Debug, Clone)]
pub struct Frame {
    pub protocol: Protocol,
    pub fields: BTreeMap<String, FieldValue>,
    pub raw: Vec<u8>,
    pub ts: DateTime<Utc>,
    pub pid: i32,
    pub stream: StreamKind,
    pub direction: Direction,
}

impl Frame {
    pub fn new(protocol: Protocol, pid: i32, stream: StreamKind, raw: Vec<u8>) -> Self {
        Frame {
            protocol,
            fields: BTreeMap::new(),
            raw,
            ts: Utc::now(),
            pid,
            stream,
            direction: stream.direction(),
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_direction() {
        assert_eq!(StreamKind::Stdin.direction(), Direction::Inbound);
        assert_eq!(StreamKind::Stdout.direction(), Direction::Outbound);
        assert_eq!(StreamKind::Stderr.direction(), Direction::Outbound);
    }

    #[test]
    fn test_protocol_serializes_to_display_name() {
        let json = serde_json::to_string(&Protocol::Grpc).unwrap();
        assert_eq!(json, "\"gRPC\"");
    }

    #[test]
    fn test_field_value_untagged_serialization() {
        let mut map = BTreeMap::new();
        map.insert("status".to_string(), FieldValue::Int(200));
        map.insert("secure".to_string(), FieldValue::Bool(false));
        let json = serde_json::to_string(&FieldValue::Map(map)).unwrap();
        assert_eq!(json, r#"{"secure":false,"status":200}"#);
    }

    #[test]
    fn test_frame_field_access() {
        let mut frame = Frame::new(Protocol::Http, 7, StreamKind::Stdout, b"GET /".to_vec());
        frame.set("method", "GET");
        frame.set("status", 200i64);
        assert_eq!(frame.field_str("method"), Some("GET"));
        assert_eq!(frame.field("status").and_then(FieldValue::as_int), Some(200));
        assert!(frame.field("missing").is_none());
    }
}
