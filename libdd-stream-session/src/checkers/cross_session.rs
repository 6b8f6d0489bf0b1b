// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-session contamination: the same sensitive value surfacing in two
//! distinct sessions.

use super::SessionChecker;
use crate::manager::SessionSnapshot;
use crate::token;
use chrono::{DateTime, Utc};
use libdd_stream_common::{
    short_hash, EngineConfig, Finding, FindingKind, Frame, MutexExt, Severity,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

struct IndexEntry {
    session_id: String,
    seen_at: DateTime<Utc>,
}

/// Short-lived index of sensitive values observed anywhere, keyed by value
/// hash. Entries expire with the suppression window.
pub struct CrossSessionChecker {
    index: Mutex<HashMap<String, IndexEntry>>,
    ttl: Duration,
}

impl CrossSessionChecker {
    pub fn new(config: &EngineConfig) -> Self {
        CrossSessionChecker {
            index: Mutex::new(HashMap::new()),
            ttl: config.suppression_window,
        }
    }
}

impl SessionChecker for CrossSessionChecker {
    fn name(&self) -> &'static str {
        "cross_session"
    }

    fn check(&self, session: &SessionSnapshot, new_frame: Option<&Frame>) -> Vec<Finding> {
        let Some(frame) = new_frame else {
            return Vec::new();
        };
        let observations = token::extract(frame);
        if observations.is_empty() {
            return Vec::new();
        }

        let now = Utc::now();
        let mut findings = Vec::new();
        let mut index = self.index.lock_or_panic();
        let ttl = self.ttl;
        index.retain(|_, entry| {
            (now - entry.seen_at).to_std().unwrap_or(Duration::ZERO) <= ttl
        });

        for obs in observations {
            let hashed = short_hash(&obs.value);
            match index.get_mut(&hashed) {
                Some(entry) if entry.session_id != session.id => {
                    findings.push(
                        Finding::session_scoped(
                            &session.id,
                            FindingKind::CrossSession,
                            "shared_sensitive_value",
                            Severity::High,
                            0.8,
                            &obs.value,
                            &format!(
                                "{} value observed in two sessions",
                                obs.token_type
                            ),
                        )
                        .with_related(vec![entry.session_id.clone()]),
                    );
                    entry.seen_at = now;
                }
                Some(entry) => {
                    entry.seen_at = now;
                }
                None => {
                    index.insert(
                        hashed,
                        IndexEntry {
                            session_id: session.id.clone(),
                            seen_at: now,
                        },
                    );
                }
            }
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SessionManager;
    use libdd_stream_common::{FieldValue, Frame, Protocol, StreamKind};
    use std::collections::BTreeMap;

    fn checker() -> CrossSessionChecker {
        CrossSessionChecker::new(&EngineConfig::default())
    }

    fn api_key_header_frame(value: &str) -> Frame {
        let mut frame = Frame::new(Protocol::Http, 1, StreamKind::Stdout, b"x".to_vec());
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-api-key".to_string(),
            FieldValue::Str(value.to_string()),
        );
        frame.set("headers", FieldValue::Map(headers));
        frame
    }

    fn json_api_key_frame(value: &str) -> Frame {
        let mut frame = Frame::new(Protocol::Json, 2, StreamKind::Stdout, b"x".to_vec());
        let mut doc = BTreeMap::new();
        doc.insert("api_key".to_string(), FieldValue::Str(value.to_string()));
        frame.set("document", FieldValue::Map(doc));
        frame
    }

    #[test]
    fn test_same_value_two_sessions() {
        let c = checker();
        let manager = SessionManager::new(&EngineConfig::default());

        let frame_a = api_key_header_frame("K1");
        let a = manager.upsert("http_conn_a", None, &[], &frame_a);
        assert!(c.check(&a.snapshot, Some(&frame_a)).is_empty());

        let frame_b = json_api_key_frame("K1");
        let b = manager.upsert("json_hash_b", None, &[], &frame_b);
        let findings = c.check(&b.snapshot, Some(&frame_b));
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.kind, FindingKind::CrossSession);
        assert_eq!(finding.session_id.as_deref(), Some("json_hash_b"));
        assert_eq!(finding.related_session_ids, vec!["http_conn_a".to_string()]);
        assert_eq!(finding.evidence(), "***"); // K1 is short
    }

    #[test]
    fn test_same_session_reuse_is_quiet() {
        let c = checker();
        let manager = SessionManager::new(&EngineConfig::default());
        let frame = api_key_header_frame("K1");
        let outcome = manager.upsert("s", None, &[], &frame);
        assert!(c.check(&outcome.snapshot, Some(&frame)).is_empty());
        assert!(c.check(&outcome.snapshot, Some(&frame)).is_empty());
    }

    #[test]
    fn test_index_expires_with_window() {
        let config = EngineConfig {
            suppression_window: Duration::from_millis(5),
            ..Default::default()
        };
        let c = CrossSessionChecker::new(&config);
        let manager = SessionManager::new(&config);

        let frame_a = api_key_header_frame("K1");
        let a = manager.upsert("a", None, &[], &frame_a);
        c.check(&a.snapshot, Some(&frame_a));

        std::thread::sleep(Duration::from_millis(20));

        let frame_b = json_api_key_frame("K1");
        let b = manager.upsert("b", None, &[], &frame_b);
        // The earlier observation aged out; no cross-session finding.
        assert!(c.check(&b.snapshot, Some(&frame_b)).is_empty());
    }

    #[test]
    fn test_final_pass_without_frame_is_quiet() {
        let c = checker();
        let manager = SessionManager::new(&EngineConfig::default());
        let outcome = manager.upsert("s", None, &[], &api_key_header_frame("K1"));
        assert!(c.check(&outcome.snapshot, None).is_empty());
    }
}
