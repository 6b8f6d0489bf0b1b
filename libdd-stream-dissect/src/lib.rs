// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use libdd_stream_common::{
    EngineConfig, EngineError, Finding, Frame, Protocol, StreamKind,
};
use std::sync::Arc;

pub mod grpc;
pub mod http;
pub mod json;
pub mod pattern;
pub mod plaintext;
pub mod sql;
pub mod websocket;

/// Identification window: `identify` never looks past this many bytes.
pub const IDENTIFY_WINDOW: usize = 4096;

/// Where a record came from. Dissectors key any cross-record state they keep
/// on `(pid, stream)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordContext {
    pub pid: i32,
    pub stream: StreamKind,
}

impl RecordContext {
    pub fn new(pid: i32, stream: StreamKind) -> Self {
        RecordContext { pid, stream }
    }

    /// Stable textual form, hashed into `conn`/`hash`-source session IDs.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.pid, self.stream.as_str())
    }
}

/// Canonical session identity extracted from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    /// Protocol-prefixed canonical identifier (`http_cookie_<hash>`, ...).
    pub canonical: String,
    /// The raw observed identifier value, kept in memory for entropy and
    /// fixation analysis. Never emitted unredacted.
    pub raw_value: Option<String>,
    /// Other raw spellings observed to map to the same canonical identity.
    pub aliases: Vec<String>,
}

impl SessionId {
    pub fn new(canonical: String) -> Self {
        SessionId {
            canonical,
            raw_value: None,
            aliases: Vec::new(),
        }
    }

    pub fn with_raw(canonical: String, raw_value: String) -> Self {
        SessionId {
            canonical,
            raw_value: Some(raw_value),
            aliases: Vec::new(),
        }
    }
}

/// Result of feeding one record (or, in binary mode, one drained byte run)
/// to a dissector.
#[derive(Debug)]
pub enum Dissection {
    /// Zero or more completed frames.
    Frames(Vec<Frame>),
    /// Record consumed into cross-record accumulation; no frame yet.
    NeedMore,
}

/// A protocol dissector.
///
/// `identify` is pure and side-effect-free; all cross-record accumulation
/// lives behind interior mutability inside `dissect` and is keyed by
/// [`RecordContext`].
pub trait Dissector: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Dispatch priority; higher runs earlier. Ties keep registration order.
    fn priority(&self) -> u8;

    /// Confidence in [0, 1] that `window` belongs to this protocol. Must be
    /// cheap (single pass over at most [`IDENTIFY_WINDOW`] bytes).
    fn identify(&self, window: &[u8]) -> f64;

    /// Parse one record. Never panics on malformed input; records above the
    /// configured frame cap fail with a `resource` error.
    fn dissect(&self, ctx: &RecordContext, raw: &[u8]) -> Result<Dissection, EngineError>;

    /// Scan a parsed frame with this protocol's rules. Evidence in every
    /// returned finding is already redacted.
    fn find_vulnerabilities(&self, frame: &Frame) -> Vec<Finding>;

    /// Canonical session identity for a frame, or an error when none can be
    /// derived.
    fn session_id(&self, frame: &Frame) -> Result<SessionId, EngineError>;

    /// True when this dissector holds unfinished accumulation for the
    /// stream. The pipeline routes follow-up records straight to such a
    /// dissector instead of re-classifying them.
    fn mid_record(&self, _ctx: &RecordContext) -> bool {
        false
    }

    /// True when the stream has left line-oriented territory and this
    /// dissector needs the raw byte run, delimiters included (HTTP/2
    /// framing, WebSocket frames after the handshake).
    fn wants_raw(&self, _ctx: &RecordContext) -> bool {
        false
    }

    /// Adopt a session identity established by another dissector (the HTTP
    /// dissector hands the WebSocket key over after an upgrade handshake).
    fn adopt_session(&self, _ctx: &RecordContext, _key: &str) {}

    /// Drop any accumulation state for a stream (stream detached or engine
    /// shutdown).
    fn forget(&self, _ctx: &RecordContext) {}
}

/// Outcome of registry classification for one record.
pub struct Classification {
    pub dissector: Arc<dyn Dissector>,
    pub confidence: f64,
}

/// Ordered dissector set with priority dispatch.
///
/// The first dissector whose `identify` confidence reaches the configured
/// threshold wins; otherwise the highest reported confidence wins, which in
/// the limit is the PlainText fallback at 0.1.
pub struct DissectorRegistry {
    dissectors: Vec<Arc<dyn Dissector>>,
    threshold: f64,
}

impl DissectorRegistry {
    /// Default registry: HTTP, gRPC, WebSocket, JSON, SQL, PlainText.
    pub fn with_defaults(config: &EngineConfig) -> Self {
        let dissectors: Vec<Arc<dyn Dissector>> = vec![
            Arc::new(websocket::WebSocketDissector::new(config)),
            Arc::new(grpc::GrpcDissector::new(config)),
            Arc::new(http::HttpDissector::new(config)),
            Arc::new(json::JsonDissector::new(config)),
            Arc::new(sql::SqlDissector::new(config)),
            Arc::new(plaintext::PlainTextDissector::new(config)),
        ];
        Self::new(dissectors, config.identify_confidence_threshold)
    }

    pub fn new(mut dissectors: Vec<Arc<dyn Dissector>>, threshold: f64) -> Self {
        // Stable sort keeps registration order among equal priorities.
        dissectors.sort_by(|a, b| b.priority().cmp(&a.priority()));
        DissectorRegistry {
            dissectors,
            threshold,
        }
    }

    // The PlainText fallback always reports nonzero confidence, so a best
    // candidate always exists.
    #[allow(clippy::unwrap_used)]
    pub fn classify(&self, window: &[u8]) -> Classification {
        let window = &window[..window.len().min(IDENTIFY_WINDOW)];
        let mut best: Option<Classification> = None;
        for dissector in &self.dissectors {
            let confidence = dissector.identify(window);
            if confidence >= self.threshold {
                return Classification {
                    dissector: Arc::clone(dissector),
                    confidence,
                };
            }
            let better = match &best {
                Some(current) => confidence > current.confidence,
                None => confidence > 0.0,
            };
            if better {
                best = Some(Classification {
                    dissector: Arc::clone(dissector),
                    confidence,
                });
            }
        }
        best.unwrap()
    }

    /// The dissector holding unfinished cross-record accumulation for this
    /// stream, if any.
    pub fn mid_record(&self, ctx: &RecordContext) -> Option<Arc<dyn Dissector>> {
        self.dissectors
            .iter()
            .find(|d| d.mid_record(ctx))
            .map(Arc::clone)
    }

    /// The dissector that owns this stream in raw (binary) mode, if any.
    pub fn wants_raw(&self, ctx: &RecordContext) -> Option<Arc<dyn Dissector>> {
        self.dissectors
            .iter()
            .find(|d| d.wants_raw(ctx))
            .map(Arc::clone)
    }

    pub fn find(&self, protocol: Protocol) -> Option<Arc<dyn Dissector>> {
        self.dissectors
            .iter()
            .find(|d| d.protocol() == protocol)
            .map(Arc::clone)
    }

    /// Drop per-stream accumulation in every dissector.
    pub fn forget(&self, ctx: &RecordContext) {
        for dissector in &self.dissectors {
            dissector.forget(ctx);
        }
    }
}
