// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session lifetime: overall duration, long-lived cookies, refresh loops.

use super::SessionChecker;
use crate::manager::SessionSnapshot;
use libdd_stream_common::{EngineConfig, FieldValue, Finding, FindingKind, Frame, Severity};
use std::time::Duration;

pub struct SessionTimeoutChecker {
    max_session_duration: Duration,
}

impl SessionTimeoutChecker {
    pub fn new(config: &EngineConfig) -> Self {
        SessionTimeoutChecker {
            max_session_duration: config.max_session_duration,
        }
    }

    fn cookie_max_age(set_cookie: &str) -> Option<u64> {
        for attr in set_cookie.split(';') {
            let attr = attr.trim();
            if let Some(value) = attr
                .strip_prefix("Max-Age=")
                .or_else(|| attr.strip_prefix("max-age="))
            {
                return value.trim().parse().ok();
            }
        }
        None
    }

    fn cookie_expires_far(set_cookie: &str, horizon: Duration) -> bool {
        for attr in set_cookie.split(';') {
            let attr = attr.trim();
            let Some(value) = attr
                .strip_prefix("Expires=")
                .or_else(|| attr.strip_prefix("expires="))
            else {
                continue;
            };
            if let Ok(expires) =
                chrono::DateTime::parse_from_rfc2822(&value.replace("GMT", "+0000"))
            {
                let until = expires.with_timezone(&chrono::Utc) - chrono::Utc::now();
                if let Ok(until) = until.to_std() {
                    return until > horizon;
                }
            }
        }
        false
    }
}

impl SessionChecker for SessionTimeoutChecker {
    fn name(&self) -> &'static str {
        "session_timeout"
    }

    fn check(&self, session: &SessionSnapshot, _new_frame: Option<&Frame>) -> Vec<Finding> {
        let mut findings = Vec::new();

        if session.duration() > self.max_session_duration {
            findings.push(Finding::session_scoped(
                &session.id,
                FindingKind::Session,
                "session_exceeds_max_duration",
                Severity::Medium,
                0.9,
                session.raw_id_value.as_deref().unwrap_or(""),
                &format!("session active for {}s", session.duration().as_secs()),
            ));
        }

        let mut refresh_frames = 0u32;
        for frame in &session.frames {
            if let Some(FieldValue::Seq(set_cookies)) = frame.field("set_cookie") {
                for raw in set_cookies {
                    let Some(raw) = raw.as_str() else { continue };
                    let long_max_age = Self::cookie_max_age(raw)
                        .map(|age| Duration::from_secs(age) > self.max_session_duration)
                        .unwrap_or(false);
                    if long_max_age || Self::cookie_expires_far(raw, self.max_session_duration) {
                        findings.push(Finding::session_scoped(
                            &session.id,
                            FindingKind::Session,
                            "long_lived_cookie",
                            Severity::Low,
                            0.7,
                            split_value(raw),
                            "cookie lifetime exceeds the session duration policy",
                        ));
                    }
                }
            }
            if let Some(path) = frame.field_str("path") {
                if path.contains("refresh") {
                    refresh_frames += 1;
                }
            }
            if let Some(body) = frame.field_str("body") {
                if body.contains("grant_type=refresh_token") {
                    refresh_frames += 1;
                }
            }
        }
        if refresh_frames >= 3 {
            findings.push(Finding::session_scoped(
                &session.id,
                FindingKind::Session,
                "refresh_pattern",
                Severity::Low,
                0.6,
                "",
                &format!("{refresh_frames} token refreshes within one session"),
            ));
        }

        findings
    }
}

fn split_value(set_cookie: &str) -> &str {
    set_cookie
        .split(';')
        .next()
        .and_then(|pair| pair.split('=').nth(1))
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SessionManager;
    use libdd_stream_common::{Frame, Protocol, StreamKind};

    fn checker() -> SessionTimeoutChecker {
        SessionTimeoutChecker::new(&EngineConfig::default())
    }

    #[test]
    fn test_overlong_session_flagged() {
        let manager = SessionManager::new(&EngineConfig::default());
        let mut old = Frame::new(Protocol::Http, 1, StreamKind::Stdout, b"x".to_vec());
        old.ts = chrono::Utc::now() - chrono::Duration::hours(25);
        manager.upsert("s", None, &[], &old);
        let now = Frame::new(Protocol::Http, 1, StreamKind::Stdout, b"y".to_vec());
        let outcome = manager.upsert("s", None, &[], &now);
        // created_at was 25h ago only if the first frame set it; the manager
        // stamps created_at at first sight, so backdate the snapshot.
        let mut snapshot = outcome.snapshot;
        snapshot.created_at = chrono::Utc::now() - chrono::Duration::hours(25);
        let findings = checker().check(&snapshot, None);
        assert!(findings
            .iter()
            .any(|f| f.subtype == "session_exceeds_max_duration"));
    }

    #[test]
    fn test_long_lived_cookie_max_age() {
        let manager = SessionManager::new(&EngineConfig::default());
        let mut frame = Frame::new(Protocol::Http, 1, StreamKind::Stdout, b"x".to_vec());
        frame.set(
            "set_cookie",
            FieldValue::Seq(vec![FieldValue::Str(
                // 90 days, far beyond the 24h policy.
                "sid=AAAA; Max-Age=7776000; Path=/".to_string(),
            )]),
        );
        let outcome = manager.upsert("s", None, &[], &frame);
        let findings = checker().check(&outcome.snapshot, None);
        assert!(findings.iter().any(|f| f.subtype == "long_lived_cookie"));
    }

    #[test]
    fn test_short_session_is_quiet() {
        let manager = SessionManager::new(&EngineConfig::default());
        let frame = Frame::new(Protocol::Http, 1, StreamKind::Stdout, b"x".to_vec());
        let outcome = manager.upsert("s", None, &[], &frame);
        assert!(checker().check(&outcome.snapshot, None).is_empty());
    }

    #[test]
    fn test_refresh_pattern() {
        let manager = SessionManager::new(&EngineConfig::default());
        let mut outcome = None;
        for _ in 0..3 {
            let mut frame = Frame::new(Protocol::Http, 1, StreamKind::Stdout, b"x".to_vec());
            frame.set("path", "/oauth/refresh");
            outcome = Some(manager.upsert("s", None, &[], &frame));
        }
        let findings = checker().check(&outcome.unwrap().snapshot, None);
        assert!(findings.iter().any(|f| f.subtype == "refresh_pattern"));
    }
}
