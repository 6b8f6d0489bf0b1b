// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Weak session identifiers: low entropy, sequential allocation, missing
//! cookie hardening flags.

use super::SessionChecker;
use crate::manager::SessionSnapshot;
use libdd_stream_common::{
    EngineConfig, FieldValue, Finding, FindingKind, Frame, MutexExt, Severity,
};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Recent raw identifiers kept for sequential-allocation detection.
const ID_WINDOW: usize = 32;

pub struct WeakSessionIdChecker {
    min_entropy_bits: f64,
    recent_ids: Mutex<VecDeque<String>>,
}

impl WeakSessionIdChecker {
    pub fn new(config: &EngineConfig) -> Self {
        WeakSessionIdChecker {
            min_entropy_bits: config.min_id_entropy_bits,
            recent_ids: Mutex::new(VecDeque::new()),
        }
    }

    /// Entropy estimate in bits for an identifier: the smaller of the
    /// Shannon estimate over observed characters and the character-class
    /// space estimate. Either alone overestimates; an attacker gets the
    /// weaker bound.
    pub fn entropy_bits(value: &str) -> f64 {
        let chars: Vec<char> = value.chars().collect();
        if chars.is_empty() {
            return 0.0;
        }

        let mut counts = std::collections::HashMap::new();
        for c in &chars {
            *counts.entry(*c).or_insert(0usize) += 1;
        }
        let len = chars.len() as f64;
        let shannon_per_char: f64 = counts
            .values()
            .map(|&count| {
                let p = count as f64 / len;
                -p * p.log2()
            })
            .sum();
        let shannon_total = shannon_per_char * len;

        let mut space = 0usize;
        if chars.iter().any(|c| c.is_ascii_lowercase()) {
            space += 26;
        }
        if chars.iter().any(|c| c.is_ascii_uppercase()) {
            space += 26;
        }
        if chars.iter().any(|c| c.is_ascii_digit()) {
            space += 10;
        }
        if chars.iter().any(|c| !c.is_ascii_alphanumeric()) {
            space += 16;
        }
        let class_total = len * (space.max(2) as f64).log2();

        shannon_total.min(class_total)
    }

    /// Trailing decimal run of an identifier, with its prefix.
    fn numeric_suffix(value: &str) -> Option<(&str, u64)> {
        let digits_start = value
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i)?;
        let (prefix, digits) = value.split_at(digits_start);
        if digits.len() > 18 {
            return None;
        }
        digits.parse().ok().map(|n| (prefix, n))
    }

    /// True when the window holds three or more identifiers with the same
    /// prefix and strictly increasing numeric suffixes.
    fn sequential_in_window(window: &VecDeque<String>, value: &str) -> bool {
        let Some((prefix, _)) = Self::numeric_suffix(value) else {
            return false;
        };
        let mut suffixes: Vec<u64> = window
            .iter()
            .filter_map(|id| {
                let (p, n) = Self::numeric_suffix(id)?;
                (p == prefix).then_some(n)
            })
            .collect();
        if suffixes.len() < 3 {
            return false;
        }
        suffixes.dedup();
        suffixes.windows(2).all(|w| w[1] > w[0]) && suffixes.len() >= 3
    }
}

impl SessionChecker for WeakSessionIdChecker {
    fn name(&self) -> &'static str {
        "weak_session_id"
    }

    fn check(&self, session: &SessionSnapshot, new_frame: Option<&Frame>) -> Vec<Finding> {
        let mut findings = Vec::new();
        let Some(raw_id) = session.raw_id_value.as_deref() else {
            return findings;
        };
        if raw_id.is_empty() {
            return findings;
        }

        let bits = Self::entropy_bits(raw_id);
        if bits < self.min_entropy_bits {
            let severity = if bits < self.min_entropy_bits / 2.0 {
                Severity::High
            } else {
                Severity::Medium
            };
            findings.push(Finding::session_scoped(
                &session.id,
                FindingKind::Session,
                "weak_session_id",
                severity,
                0.8,
                raw_id,
                &format!("identifier entropy ~{bits:.0} bits"),
            ));
        }

        {
            let mut recent = self.recent_ids.lock_or_panic();
            if recent.back().map(String::as_str) != Some(raw_id) {
                recent.push_back(raw_id.to_string());
                while recent.len() > ID_WINDOW {
                    recent.pop_front();
                }
            }
            if Self::sequential_in_window(&recent, raw_id) {
                findings.push(Finding::session_scoped(
                    &session.id,
                    FindingKind::Session,
                    "sequential_session_id",
                    Severity::High,
                    0.75,
                    raw_id,
                    "identifiers allocate along a monotonic counter",
                ));
            }
        }

        // Cookie hardening, when the identifier travelled in a Set-Cookie.
        if let Some(frame) = new_frame {
            if let Some(FieldValue::Seq(set_cookies)) = frame.field("set_cookie") {
                for raw in set_cookies {
                    let Some(raw) = raw.as_str() else { continue };
                    if !raw.contains(raw_id) {
                        continue;
                    }
                    let lowered = raw.to_ascii_lowercase();
                    if !(lowered.contains("secure")
                        && lowered.contains("httponly")
                        && lowered.contains("samesite"))
                    {
                        findings.push(Finding::session_scoped(
                            &session.id,
                            FindingKind::Session,
                            "cookie_flags_missing",
                            Severity::Medium,
                            0.85,
                            raw_id,
                            "session cookie lacks Secure/HttpOnly/SameSite",
                        ));
                    }
                }
            }
        }

        findings
    }
}
