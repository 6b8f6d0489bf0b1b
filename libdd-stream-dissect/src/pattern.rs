// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Budgeted regex evaluation.
//!
//! Patterns are compiled once at dissector construction. Every evaluation is
//! measured against a wall-clock budget: an overrun counts as a non-match
//! and emits one debug event. The regex engine itself is linear-time, so the
//! guard additionally caps the scanned window to keep pathological inputs
//! from burning the budget on sheer volume.

use libdd_stream_common::EngineError;
use regex::Regex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes scanned per evaluation, regardless of input size.
const SCAN_WINDOW: usize = 1024 * 1024;

#[derive(Debug)]
pub struct GuardedPattern {
    name: &'static str,
    regex: Regex,
    budget: Duration,
}

impl GuardedPattern {
    pub fn new(name: &'static str, pattern: &str, budget: Duration) -> Result<Self, EngineError> {
        let regex = Regex::new(pattern)
            .map_err(|e| EngineError::Internal(format!("invalid pattern {name}: {e}")))?;
        Ok(GuardedPattern {
            name,
            regex,
            budget,
        })
    }

    fn window<'t>(&self, text: &'t str) -> &'t str {
        if text.len() <= SCAN_WINDOW {
            return text;
        }
        let mut end = SCAN_WINDOW;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }

    fn guard<T>(&self, result: T, started: Instant, empty: T) -> T {
        if started.elapsed() > self.budget {
            debug!(
                pattern = self.name,
                budget_ms = self.budget.as_millis() as u64,
                "pattern evaluation exceeded budget, treating as non-match"
            );
            return empty;
        }
        result
    }

    pub fn is_match(&self, text: &str) -> bool {
        let started = Instant::now();
        let matched = self.regex.is_match(self.window(text));
        self.guard(matched, started, false)
    }

    pub fn captures<'t>(&self, text: &'t str) -> Option<regex::Captures<'t>> {
        let started = Instant::now();
        let caps = self.regex.captures(self.window(text));
        self.guard(caps, started, None)
    }

    /// All non-overlapping capture sets, subject to the same budget.
    pub fn captures_all<'t>(&self, text: &'t str) -> Vec<regex::Captures<'t>> {
        let started = Instant::now();
        let all: Vec<_> = self.regex.captures_iter(self.window(text)).collect();
        self.guard(all, started, Vec::new())
    }
}
