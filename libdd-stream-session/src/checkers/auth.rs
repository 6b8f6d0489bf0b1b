// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session integrity: fixation, hijack indicators, excessive reuse.

use super::SessionChecker;
use crate::manager::SessionSnapshot;
use libdd_stream_common::{EngineConfig, Finding, FindingKind, Frame, Severity};
use std::time::Duration;

pub struct AuthIntegrityChecker {
    max_reuse_count: u64,
    session_ttl: Duration,
}

impl AuthIntegrityChecker {
    pub fn new(config: &EngineConfig) -> Self {
        AuthIntegrityChecker {
            max_reuse_count: config.max_reuse_count,
            session_ttl: config.session_ttl,
        }
    }
}

impl SessionChecker for AuthIntegrityChecker {
    fn name(&self) -> &'static str {
        "auth_integrity"
    }

    fn check(&self, session: &SessionSnapshot, _new_frame: Option<&Frame>) -> Vec<Finding> {
        let mut findings = Vec::new();
        let raw_id = session.raw_id_value.as_deref().unwrap_or("");

        // Fixation: the identifier was assigned server-side, then presented
        // by a different peer identity.
        if session.assigned_by_peer.is_some() && session.presented_after_assignment {
            findings.push(Finding::session_scoped(
                &session.id,
                FindingKind::Session,
                "fixation_indicator",
                Severity::High,
                0.8,
                raw_id,
                "session identifier assigned to one peer and presented by another",
            ));
        }

        // Hijack indicator: two distinct peer identities inside one session
        // with no assignment step that would explain the change.
        if session.peers.len() >= 2 && session.assigned_by_peer.is_none() {
            let peers: Vec<&str> = session.peers.iter().map(String::as_str).collect();
            findings.push(Finding::session_scoped(
                &session.id,
                FindingKind::Session,
                "session_hijack_indicator",
                Severity::High,
                0.7,
                raw_id,
                &format!("session observed from {} distinct peers", peers.len()),
            ));
        }

        // Excessive reuse, normalized to the session TTL window when the
        // session has outlived it.
        let duration = session.duration();
        let windows = (duration.as_secs_f64() / self.session_ttl.as_secs_f64()).max(1.0);
        if (session.counters.reuse_count as f64 / windows) > self.max_reuse_count as f64 {
            findings.push(Finding::session_scoped(
                &session.id,
                FindingKind::Session,
                "excessive_reuse",
                Severity::Medium,
                0.9,
                raw_id,
                &format!(
                    "identifier presented {} times",
                    session.counters.reuse_count
                ),
            ));
        }

        findings
    }
}
