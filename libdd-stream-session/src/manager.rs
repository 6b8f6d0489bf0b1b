// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session table: canonical-ID keyed, TTL-swept, snapshot-read.
//!
//! Locking: the table mutex is held only to find or create the per-session
//! slot; mutation happens under the session's own mutex; checkers only ever
//! see deep-copied snapshots.

use crate::token::{self, ContextClass};
use chrono::{DateTime, Utc};
use libdd_stream_common::{short_hash, EngineConfig, FieldValue, Frame, MutexExt, Protocol};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionCounters {
    pub frame_count: u64,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    /// Frames that presented the session's identifier.
    pub reuse_count: u64,
    /// Distinct token context classes seen in the session.
    pub context_count: u64,
}

/// Everything remembered about one token value within a session. The value
/// itself is held raw for correlation and redacted on the way out.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub token_type: &'static str,
    pub raw: String,
    pub contexts: BTreeSet<ContextClass>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub protocol: Protocol,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Bounded history; older frames are counted in `counters`, not kept.
    pub frames: VecDeque<Frame>,
    pub peers: BTreeSet<String>,
    /// token type -> hashed observed values.
    pub tokens: BTreeMap<String, BTreeSet<String>>,
    /// hashed value -> full token state.
    pub token_states: HashMap<String, TokenState>,
    pub counters: SessionCounters,
    pub completed: bool,
    pub completed_reason: Option<String>,
    /// Raw observed identifier value (cookie value, bearer token, ...).
    pub raw_id_value: Option<String>,
    pub aliases: BTreeSet<String>,
    /// Peer that a server-side Set-Cookie assignment was first seen from.
    pub assigned_by_peer: Option<String>,
    /// True once the session identifier was presented by a peer other than
    /// the assigning one.
    pub presented_after_assignment: bool,
}

impl Session {
    fn new(id: &str, protocol: Protocol) -> Self {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            protocol,
            created_at: now,
            last_seen_at: now,
            frames: VecDeque::new(),
            peers: BTreeSet::new(),
            tokens: BTreeMap::new(),
            token_states: HashMap::new(),
            counters: SessionCounters::default(),
            completed: false,
            completed_reason: None,
            raw_id_value: None,
            aliases: BTreeSet::new(),
            assigned_by_peer: None,
            presented_after_assignment: false,
        }
    }

    pub fn duration(&self) -> Duration {
        (self.last_seen_at - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Read-only deep copy handed to checkers and observability callers.
pub type SessionSnapshot = Session;

pub struct UpsertOutcome {
    pub created: bool,
    pub completed: bool,
    pub snapshot: SessionSnapshot,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    session_ttl: Duration,
    completed_ttl: Duration,
    frame_history: usize,
}

impl SessionManager {
    pub fn new(config: &EngineConfig) -> Self {
        SessionManager {
            sessions: Mutex::new(HashMap::new()),
            session_ttl: config.session_ttl,
            completed_ttl: config.completed_session_ttl,
            frame_history: config.frame_history,
        }
    }

    /// Append a frame to its session, creating the session on first sight.
    pub fn upsert(
        &self,
        canonical_id: &str,
        raw_id_value: Option<&str>,
        aliases: &[String],
        frame: &Frame,
    ) -> UpsertOutcome {
        let slot = {
            let mut sessions = self.sessions.lock_or_panic();
            Arc::clone(
                sessions
                    .entry(canonical_id.to_string())
                    .or_insert_with(|| {
                        debug!(session_id = canonical_id, "session created");
                        Arc::new(Mutex::new(Session::new(canonical_id, frame.protocol)))
                    }),
            )
        };

        let mut session = slot.lock_or_panic();
        let created = session.counters.frame_count == 0;

        // LastSeenAt never moves backwards even if frame timestamps jitter.
        if frame.ts > session.last_seen_at {
            session.last_seen_at = frame.ts;
        }
        session.counters.frame_count += 1;
        match frame.direction {
            libdd_stream_common::Direction::Inbound => {
                session.counters.inbound_bytes += frame.raw.len() as u64
            }
            libdd_stream_common::Direction::Outbound => {
                session.counters.outbound_bytes += frame.raw.len() as u64
            }
        }

        let peer = extract_peer(frame);
        if let Some(peer) = &peer {
            session.peers.insert(peer.clone());
        }

        if let Some(raw) = raw_id_value {
            if session.raw_id_value.is_none() {
                session.raw_id_value = Some(raw.to_string());
            }
            session.counters.reuse_count += 1;

            // Track assignment vs presentation for fixation analysis: a
            // Set-Cookie carrying the session value assigns it; a Cookie (or
            // any later carrier) presents it.
            if frame_assigns_value(frame, raw) {
                if session.assigned_by_peer.is_none() {
                    session.assigned_by_peer = peer.clone().or(Some(String::new()));
                }
            } else if let Some(assigned_by) = &session.assigned_by_peer {
                if peer.as_deref().unwrap_or("") != assigned_by {
                    session.presented_after_assignment = true;
                }
            }
        }
        for alias in aliases {
            session.aliases.insert(alias.clone());
        }

        for obs in token::extract(frame) {
            let hashed = short_hash(&obs.value);
            session
                .tokens
                .entry(obs.token_type.to_string())
                .or_default()
                .insert(hashed.clone());
            let state = session
                .token_states
                .entry(hashed)
                .or_insert_with(|| TokenState {
                    token_type: obs.token_type,
                    raw: obs.value.clone(),
                    contexts: BTreeSet::new(),
                });
            state.contexts.insert(obs.context);
        }
        session.counters.context_count = session
            .token_states
            .values()
            .flat_map(|state| state.contexts.iter())
            .collect::<BTreeSet<_>>()
            .len() as u64;

        session.frames.push_back(frame.clone());
        while session.frames.len() > self.frame_history {
            session.frames.pop_front();
        }

        let mut completed = false;
        if let Some(reason) = completion_signal(frame) {
            if !session.completed {
                session.completed = true;
                session.completed_reason = Some(reason.to_string());
                completed = true;
            }
        }

        UpsertOutcome {
            created,
            completed,
            snapshot: session.clone(),
        }
    }

    /// Mark a session complete without evicting it; the final checker pass
    /// still needs it.
    pub fn complete(&self, canonical_id: &str, reason: &str) -> Option<SessionSnapshot> {
        let slot = {
            let sessions = self.sessions.lock_or_panic();
            sessions.get(canonical_id).map(Arc::clone)
        }?;
        let mut session = slot.lock_or_panic();
        session.completed = true;
        session.completed_reason = Some(reason.to_string());
        Some(session.clone())
    }

    /// Evict idle sessions, returning their final snapshots so the caller
    /// can run the last checker pass.
    pub fn sweep(&self) -> Vec<SessionSnapshot> {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut sessions = self.sessions.lock_or_panic();
        sessions.retain(|_, slot| {
            let session = slot.lock_or_panic();
            let ttl = if session.completed {
                self.completed_ttl
            } else {
                self.session_ttl
            };
            let idle = (now - session.last_seen_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle > ttl {
                expired.push(session.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            debug!(count = expired.len(), "sessions expired");
        }
        expired
    }

    /// Drain every live session (engine shutdown), newest last.
    pub fn drain(&self) -> Vec<SessionSnapshot> {
        let mut sessions = self.sessions.lock_or_panic();
        let mut out: Vec<SessionSnapshot> = sessions
            .drain()
            .map(|(_, slot)| slot.lock_or_panic().clone())
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn snapshot(&self, canonical_id: &str) -> Option<SessionSnapshot> {
        let slot = {
            let sessions = self.sessions.lock_or_panic();
            sessions.get(canonical_id).map(Arc::clone)
        }?;
        let session = slot.lock_or_panic();
        Some(session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock_or_panic().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn extract_peer(frame: &Frame) -> Option<String> {
    if let Some(peer) = frame.field_str("peer") {
        return Some(peer.to_string());
    }
    if let Some(FieldValue::Map(headers)) = frame.field("headers") {
        for header in ["x-forwarded-for", "x-real-ip"] {
            if let Some(value) = headers.get(header).and_then(FieldValue::as_str) {
                let first = value.split(',').next().unwrap_or(value).trim();
                if !first.is_empty() {
                    return Some(first.to_string());
                }
            }
        }
    }
    None
}

/// True when the frame assigns the given session value server-side
/// (Set-Cookie) rather than presenting it.
fn frame_assigns_value(frame: &Frame, raw: &str) -> bool {
    if let Some(FieldValue::Seq(set_cookies)) = frame.field("set_cookie") {
        return set_cookies.iter().any(|entry| {
            entry
                .as_str()
                .map(|s| s.contains(&format!("={raw}")))
                .unwrap_or(false)
        });
    }
    false
}

/// Protocol-specific terminal signals.
fn completion_signal(frame: &Frame) -> Option<&'static str> {
    match frame.protocol {
        Protocol::Http => frame
            .field("connection_close")
            .map(|_| "http_connection_close"),
        Protocol::WebSocket => {
            (frame.field_str("opcode") == Some("close")).then_some("websocket_close")
        }
        Protocol::Grpc => {
            if frame.field("grpc_status").is_some() {
                Some("grpc_trailers")
            } else if frame.field_str("h2_type") == Some("GOAWAY") {
                Some("grpc_goaway")
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdd_stream_common::StreamKind;

    fn manager() -> SessionManager {
        SessionManager::new(&EngineConfig::default())
    }

    fn frame(protocol: Protocol, raw: &[u8]) -> Frame {
        Frame::new(protocol, 77, StreamKind::Stdout, raw.to_vec())
    }

    #[test]
    fn test_upsert_creates_then_appends() {
        let m = manager();
        let f = frame(Protocol::Http, b"one");
        let outcome = m.upsert("http_conn_x", None, &[], &f);
        assert!(outcome.created);
        assert_eq!(outcome.snapshot.counters.frame_count, 1);

        let outcome = m.upsert("http_conn_x", None, &[], &frame(Protocol::Http, b"two"));
        assert!(!outcome.created);
        assert_eq!(outcome.snapshot.counters.frame_count, 2);
        assert_eq!(outcome.snapshot.counters.outbound_bytes, 6);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_frame_count_strictly_increases_and_last_seen_monotonic() {
        let m = manager();
        let mut previous_count = 0;
        let mut previous_seen = None;
        for i in 0..5 {
            let outcome = m.upsert(
                "s",
                None,
                &[],
                &frame(Protocol::PlainText, format!("r{i}").as_bytes()),
            );
            assert!(outcome.snapshot.counters.frame_count > previous_count);
            previous_count = outcome.snapshot.counters.frame_count;
            if let Some(previous) = previous_seen {
                assert!(outcome.snapshot.last_seen_at >= previous);
            }
            previous_seen = Some(outcome.snapshot.last_seen_at);
        }
    }

    #[test]
    fn test_frame_history_bounded() {
        let config = EngineConfig {
            frame_history: 4,
            ..Default::default()
        };
        let m = SessionManager::new(&config);
        for i in 0..10 {
            m.upsert(
                "s",
                None,
                &[],
                &frame(Protocol::PlainText, format!("r{i}").as_bytes()),
            );
        }
        let snapshot = m.snapshot("s").unwrap();
        assert_eq!(snapshot.frames.len(), 4);
        assert_eq!(snapshot.counters.frame_count, 10);
        // Oldest retained frame is r6.
        assert_eq!(snapshot.frames[0].raw, b"r6");
    }

    #[test]
    fn test_reuse_count_tracks_identifier_presentations() {
        let m = manager();
        m.upsert("s", Some("AAAA"), &[], &frame(Protocol::Http, b"a"));
        m.upsert("s", None, &[], &frame(Protocol::Http, b"b"));
        m.upsert("s", Some("AAAA"), &[], &frame(Protocol::Http, b"c"));
        let snapshot = m.snapshot("s").unwrap();
        assert_eq!(snapshot.counters.reuse_count, 2);
        assert_eq!(snapshot.raw_id_value.as_deref(), Some("AAAA"));
    }

    #[test]
    fn test_peers_accumulate_from_forwarded_header() {
        let m = manager();
        let mut f = frame(Protocol::Http, b"a");
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-forwarded-for".to_string(),
            FieldValue::Str("10.0.0.1, 172.16.0.9".to_string()),
        );
        f.set("headers", FieldValue::Map(headers));
        let outcome = m.upsert("s", None, &[], &f);
        assert!(outcome.snapshot.peers.contains("10.0.0.1"));
    }

    #[test]
    fn test_http_connection_close_completes() {
        let m = manager();
        let mut f = frame(Protocol::Http, b"bye");
        f.set("connection_close", true);
        let outcome = m.upsert("s", None, &[], &f);
        assert!(outcome.completed);
        assert_eq!(
            outcome.snapshot.completed_reason.as_deref(),
            Some("http_connection_close")
        );
    }

    #[test]
    fn test_websocket_close_completes() {
        let m = manager();
        let mut f = frame(Protocol::WebSocket, b"");
        f.set("opcode", "close");
        let outcome = m.upsert("s", None, &[], &f);
        assert!(outcome.completed);
    }

    #[test]
    fn test_sweep_evicts_idle_sessions() {
        let config = EngineConfig {
            session_ttl: Duration::from_millis(0),
            ..Default::default()
        };
        let m = SessionManager::new(&config);
        let mut f = frame(Protocol::PlainText, b"x");
        f.ts = Utc::now() - chrono::Duration::seconds(5);
        m.upsert("old", None, &[], &f);
        std::thread::sleep(Duration::from_millis(5));
        let expired = m.sweep();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
        assert!(m.is_empty());
    }

    #[test]
    fn test_sweep_keeps_fresh_sessions() {
        let m = manager();
        m.upsert("fresh", None, &[], &frame(Protocol::PlainText, b"x"));
        assert!(m.sweep().is_empty());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_snapshot_is_deep_copy() {
        let m = manager();
        m.upsert("s", None, &[], &frame(Protocol::PlainText, b"x"));
        let snapshot = m.snapshot("s").unwrap();
        m.upsert("s", None, &[], &frame(Protocol::PlainText, b"y"));
        // The earlier snapshot is unaffected by later mutation.
        assert_eq!(snapshot.counters.frame_count, 1);
    }

    #[test]
    fn test_canonical_spellings_share_one_session() {
        let m = manager();
        // Two raw spellings, same canonical ID (the dissector already folded
        // case); exactly one session may exist.
        m.upsert(
            "http_cookie_abc",
            Some("AAAA"),
            &["SessionId=AAAA".to_string()],
            &frame(Protocol::Http, b"a"),
        );
        m.upsert(
            "http_cookie_abc",
            Some("AAAA"),
            &["sessionid=AAAA".to_string()],
            &frame(Protocol::Http, b"b"),
        );
        assert_eq!(m.len(), 1);
        let snapshot = m.snapshot("http_cookie_abc").unwrap();
        assert_eq!(snapshot.aliases.len(), 2);
    }
}
