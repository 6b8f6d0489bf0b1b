// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token leakage: tokens in unsafe contexts and tokens spanning context
//! classes.

use super::SessionChecker;
use crate::manager::SessionSnapshot;
use crate::token::token_weight;
use libdd_stream_common::{Finding, FindingKind, Frame, Severity};

pub struct TokenLeakChecker;

impl TokenLeakChecker {
    pub fn new() -> Self {
        TokenLeakChecker
    }
}

impl Default for TokenLeakChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionChecker for TokenLeakChecker {
    fn name(&self) -> &'static str {
        "token_leak"
    }

    fn check(&self, session: &SessionSnapshot, _new_frame: Option<&Frame>) -> Vec<Finding> {
        let mut findings = Vec::new();
        for state in session.token_states.values() {
            let weight = token_weight(state.token_type);

            if let Some(context) = state.contexts.iter().find(|c| c.is_unsafe()) {
                let severity = if weight >= 3 {
                    Severity::High
                } else if weight == 2 {
                    Severity::Medium
                } else {
                    Severity::Low
                };
                findings.push(Finding::session_scoped(
                    &session.id,
                    FindingKind::Token,
                    "token_in_unsafe_context",
                    severity,
                    0.85,
                    &state.raw,
                    &format!("{} token in {}", state.token_type, context.as_str()),
                ));
            }

            if state.contexts.len() >= 2 {
                let severity = if weight >= 3 && state.contexts.len() >= 3 {
                    Severity::High
                } else {
                    Severity::Medium
                };
                let contexts: Vec<&str> =
                    state.contexts.iter().map(|c| c.as_str()).collect();
                findings.push(Finding::session_scoped(
                    &session.id,
                    FindingKind::Token,
                    "token_multi_context",
                    severity,
                    0.8,
                    &state.raw,
                    &format!(
                        "{} token observed in {}",
                        state.token_type,
                        contexts.join(", ")
                    ),
                ));
            }
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SessionManager;
    use libdd_stream_common::{EngineConfig, FieldValue, Frame, Protocol, StreamKind};
    use std::collections::BTreeMap;

    fn http_frame(fields: &[(&str, &str)]) -> Frame {
        let mut frame = Frame::new(Protocol::Http, 1, StreamKind::Stdout, b"x".to_vec());
        for (key, value) in fields {
            frame.set(key, *value);
        }
        frame
    }

    #[test]
    fn test_bearer_in_query_is_high() {
        let manager = SessionManager::new(&EngineConfig::default());
        let frame = http_frame(&[("path", "/cb?access_token=verysecrettoken")]);
        let outcome = manager.upsert("s", None, &[], &frame);
        let findings = TokenLeakChecker::new().check(&outcome.snapshot, None);
        let leak = findings
            .iter()
            .find(|f| f.subtype == "token_in_unsafe_context")
            .expect("leak finding");
        assert_eq!(leak.severity, Severity::High);
        assert!(!leak.evidence().contains("verysecrettoken"));
    }

    #[test]
    fn test_token_in_two_contexts() {
        let manager = SessionManager::new(&EngineConfig::default());
        // Same token as bearer header and in the query string.
        let mut frame = http_frame(&[("path", "/cb?token=sharedtokenvalue")]);
        let mut headers = BTreeMap::new();
        headers.insert(
            "authorization".to_string(),
            FieldValue::Str("Bearer sharedtokenvalue".to_string()),
        );
        frame.set("headers", FieldValue::Map(headers));
        let outcome = manager.upsert("s", None, &[], &frame);
        let findings = TokenLeakChecker::new().check(&outcome.snapshot, None);
        assert!(findings.iter().any(|f| f.subtype == "token_multi_context"));
    }

    #[test]
    fn test_header_only_token_is_quiet() {
        let manager = SessionManager::new(&EngineConfig::default());
        let mut frame = http_frame(&[]);
        let mut headers = BTreeMap::new();
        headers.insert(
            "authorization".to_string(),
            FieldValue::Str("Bearer headerscopedtoken".to_string()),
        );
        frame.set("headers", FieldValue::Map(headers));
        let outcome = manager.upsert("s", None, &[], &frame);
        assert!(TokenLeakChecker::new()
            .check(&outcome.snapshot, None)
            .is_empty());
    }
}
