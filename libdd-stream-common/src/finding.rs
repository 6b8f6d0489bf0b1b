// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::redact::redact;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Four-level severity scale shared by every detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Credential,
    Injection,
    Configuration,
    Session,
    Token,
    CrossSession,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::Credential => "credential",
            FindingKind::Injection => "injection",
            FindingKind::Configuration => "configuration",
            FindingKind::Session => "session",
            FindingKind::Token => "token",
            FindingKind::CrossSession => "cross_session",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingScope {
    Frame,
    Session,
}

/// One detection, frame- or session-scoped.
///
/// There is no public way to set `evidence` directly: the constructors take
/// the raw sensitive value and store only its redacted form.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub scope: FindingScope,
    pub kind: FindingKind,
    pub subtype: String,
    pub severity: Severity,
    pub confidence: f64,
    evidence: String,
    pub context: String,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_session_ids: Vec<String>,
}

impl Finding {
    /// Build a frame-scoped finding. `raw_evidence` is the sensitive value as
    /// captured; it is redacted before being stored.
    pub fn frame_scoped(
        kind: FindingKind,
        subtype: &str,
        severity: Severity,
        confidence: f64,
        raw_evidence: &str,
        context: &str,
    ) -> Self {
        Finding {
            scope: FindingScope::Frame,
            kind,
            subtype: subtype.to_string(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: redact(raw_evidence),
            context: context.to_string(),
            ts: Utc::now(),
            session_id: None,
            related_session_ids: Vec::new(),
        }
    }

    /// Build a session-scoped finding.
    pub fn session_scoped(
        session_id: &str,
        kind: FindingKind,
        subtype: &str,
        severity: Severity,
        confidence: f64,
        raw_evidence: &str,
        context: &str,
    ) -> Self {
        Finding {
            scope: FindingScope::Session,
            kind,
            subtype: subtype.to_string(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: redact(raw_evidence),
            context: context.to_string(),
            ts: Utc::now(),
            session_id: Some(session_id.to_string()),
            related_session_ids: Vec::new(),
        }
    }

    /// Attach additional session identifiers, for cross-session findings.
    pub fn with_related(mut self, related: Vec<String>) -> Self {
        self.related_session_ids = related;
        self
    }

    /// Evidence is already redacted; callers may only read it.
    pub fn evidence(&self) -> &str {
        &self.evidence
    }

    pub fn attach_session(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_scoped_redacts_evidence() {
        let f = Finding::frame_scoped(
            FindingKind::Credential,
            "password_in_url",
            Severity::High,
            0.9,
            "hunter2",
            "url query",
        );
        assert_eq!(f.evidence(), "***");
        assert_eq!(f.scope, FindingScope::Frame);
        assert!(f.session_id.is_none());
    }

    #[test]
    fn test_session_scoped_keeps_ends_of_long_values() {
        let f = Finding::session_scoped(
            "http_cookie_abc",
            FindingKind::Token,
            "token_in_url",
            Severity::Medium,
            0.8,
            "sk_live_abcd1234efgh5678",
            "query string",
        );
        assert_eq!(f.evidence(), "sk_***678");
        assert_eq!(f.session_id.as_deref(), Some("http_cookie_abc"));
    }

    #[test]
    fn test_confidence_clamped() {
        let f = Finding::frame_scoped(
            FindingKind::Configuration,
            "trace_enabled",
            Severity::Low,
            3.5,
            "",
            "",
        );
        assert_eq!(f.confidence, 1.0);
    }

    #[test]
    fn test_serialization_shape() {
        let f = Finding::session_scoped(
            "sess",
            FindingKind::CrossSession,
            "shared_value",
            Severity::High,
            0.7,
            "0123456789abcdef",
            "two sessions",
        )
        .with_related(vec!["other".to_string()]);
        let v: serde_json::Value = serde_json::to_value(&f).unwrap();
        assert_eq!(v["kind"], "cross_session");
        assert_eq!(v["severity"], "high");
        assert_eq!(v["scope"], "session");
        assert_eq!(v["evidence"], "012***def");
        assert_eq!(v["related_session_ids"][0], "other");
    }
}
