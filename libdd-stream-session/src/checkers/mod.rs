// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session-scope analyzers.
//!
//! Checkers run in a fixed order after every upsert and once more when a
//! session completes or expires. They see only snapshots; none runs under a
//! session lock. Repeat findings for the same (session, subtype) are
//! suppressed for the configured window.

use crate::manager::SessionSnapshot;
use chrono::{DateTime, Utc};
use libdd_stream_common::{EngineConfig, Finding, Frame, MutexExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub mod auth;
pub mod cross_session;
pub mod timeout;
pub mod token_leak;
pub mod weak_id;

pub trait SessionChecker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluate a session. `new_frame` is the frame that triggered this
    /// pass, or `None` on the final pass at completion/expiry.
    fn check(&self, session: &SessionSnapshot, new_frame: Option<&Frame>) -> Vec<Finding>;
}

pub struct CheckerSet {
    checkers: Vec<Box<dyn SessionChecker>>,
    suppression: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    window: Duration,
}

impl CheckerSet {
    pub fn new(config: &EngineConfig) -> Self {
        CheckerSet {
            checkers: vec![
                Box::new(auth::AuthIntegrityChecker::new(config)),
                Box::new(token_leak::TokenLeakChecker::new()),
                Box::new(timeout::SessionTimeoutChecker::new(config)),
                Box::new(weak_id::WeakSessionIdChecker::new(config)),
                Box::new(cross_session::CrossSessionChecker::new(config)),
            ],
            suppression: Mutex::new(HashMap::new()),
            window: config.suppression_window,
        }
    }

    /// Run every checker over the snapshot, dropping findings still inside
    /// their suppression window.
    pub fn run(&self, session: &SessionSnapshot, new_frame: Option<&Frame>) -> Vec<Finding> {
        let mut raw = Vec::new();
        for checker in &self.checkers {
            raw.extend(checker.check(session, new_frame));
        }
        if raw.is_empty() {
            return raw;
        }

        let now = Utc::now();
        let mut suppression = self.suppression.lock_or_panic();
        if suppression.len() > 8192 {
            let window = self.window;
            suppression.retain(|_, last| {
                (now - *last).to_std().unwrap_or(Duration::ZERO) <= window
            });
        }
        raw.retain(|finding| {
            let key = (
                finding.session_id.clone().unwrap_or_default(),
                finding.subtype.clone(),
            );
            match suppression.get(&key) {
                Some(last)
                    if (now - *last).to_std().unwrap_or(Duration::ZERO) < self.window =>
                {
                    false
                }
                _ => {
                    suppression.insert(key, now);
                    true
                }
            }
        });
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdd_stream_common::{FindingKind, Severity};

    struct AlwaysFires;

    impl SessionChecker for AlwaysFires {
        fn name(&self) -> &'static str {
            "always"
        }

        fn check(&self, session: &SessionSnapshot, _new_frame: Option<&Frame>) -> Vec<Finding> {
            vec![Finding::session_scoped(
                &session.id,
                FindingKind::Session,
                "test_subtype",
                Severity::Low,
                0.5,
                "",
                "",
            )]
        }
    }

    fn snapshot() -> SessionSnapshot {
        use libdd_stream_common::{Frame, Protocol, StreamKind};
        let frame = Frame::new(Protocol::PlainText, 1, StreamKind::Stdout, b"x".to_vec());
        let manager = crate::manager::SessionManager::new(&EngineConfig::default());
        manager.upsert("s1", None, &[], &frame).snapshot
    }

    #[test]
    fn test_suppression_blocks_repeats() {
        let set = CheckerSet {
            checkers: vec![Box::new(AlwaysFires)],
            suppression: Mutex::new(HashMap::new()),
            window: Duration::from_secs(60),
        };
        let snap = snapshot();
        assert_eq!(set.run(&snap, None).len(), 1);
        assert_eq!(set.run(&snap, None).len(), 0);
    }

    #[test]
    fn test_suppression_expires() {
        let set = CheckerSet {
            checkers: vec![Box::new(AlwaysFires)],
            suppression: Mutex::new(HashMap::new()),
            window: Duration::from_millis(10),
        };
        let snap = snapshot();
        assert_eq!(set.run(&snap, None).len(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(set.run(&snap, None).len(), 1);
    }

    #[test]
    fn test_distinct_sessions_not_suppressed_together() {
        let set = CheckerSet {
            checkers: vec![Box::new(AlwaysFires)],
            suppression: Mutex::new(HashMap::new()),
            window: Duration::from_secs(60),
        };
        let mut a = snapshot();
        a.id = "a".to_string();
        let mut b = snapshot();
        b.id = "b".to_string();
        assert_eq!(set.run(&a, None).len(), 1);
        assert_eq!(set.run(&b, None).len(), 1);
    }

    #[test]
    fn test_default_set_has_five_checkers() {
        let set = CheckerSet::new(&EngineConfig::default());
        assert_eq!(set.checkers.len(), 5);
    }
}
