// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SQL dissector: lightweight tokenization, statement classification, and
//! injection indicators.
//!
//! Literal detection works the way the trace obfuscator normalizes SQL:
//! find the splitter positions where a literal could start, then identify
//! literals by their first characters. No context-sensitive SQL parsing.

use crate::{Dissection, Dissector, RecordContext, SessionId};
use libdd_stream_common::{
    short_hash, EngineConfig, EngineError, Finding, FindingKind, Frame, Protocol, Severity,
};

const STATEMENT_KEYWORDS: [(&str, &str); 12] = [
    ("select", "select"),
    ("insert", "insert"),
    ("update", "update"),
    ("delete", "delete"),
    ("create", "ddl"),
    ("alter", "ddl"),
    ("drop", "ddl"),
    ("truncate", "ddl"),
    ("grant", "auth"),
    ("revoke", "auth"),
    ("login", "auth"),
    ("auth", "auth"),
];

fn is_splitter(b: u8) -> bool {
    matches!(b, b',' | b'(' | b')' | b'|' | b' ' | b'\t' | b'\n' | b'\r' | 0xb | 0xc)
}

fn is_numeric_literal_prefix(bytes: &[u8], start: usize) -> bool {
    matches!(bytes[start], b'0'..=b'9' | b'-' | b'+' | b'.')
        && !(start + 1 < bytes.len() && bytes[start] == b'-' && bytes[start + 1] == b'-')
}

fn is_quoted(bytes: &[u8], start: usize, end: usize) -> bool {
    bytes[start] == b'\'' && bytes[end - 1] == b'\''
}

/// Position of the next splitter at or after `at`, skipping quoted spans.
fn next_splitter(s: &[u8], at: usize) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    for (pos, b) in s.iter().copied().enumerate().skip(at) {
        if b == b'\'' && !escaped {
            quoted = !quoted;
            continue;
        }
        escaped = (b == b'\\') && !escaped;
        if !quoted && is_splitter(b) {
            return Some(pos);
        }
    }
    None
}

/// Replace literals with `?`. Used for the normalized statement carried in
/// the frame, keeping raw values out of frame summaries.
fn normalize(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::new();
    let mut start = 0;
    while start < s.len() {
        let end = next_splitter(bytes, start).unwrap_or(s.len());
        if start + 1 == end {
            if bytes[start].is_ascii_digit() {
                out.push('?');
            } else {
                out.push_str(&s[start..end]);
            }
        } else if start + 1 < end {
            if is_numeric_literal_prefix(bytes, start) || is_quoted(bytes, start, end) {
                out.push('?');
            } else {
                out.push_str(&s[start..end]);
            }
        }
        if end < s.len() {
            out.push(bytes[end] as char);
        }
        start = end + 1;
    }
    out
}

pub struct SqlDissector {
    max_frame_size: usize,
}

impl SqlDissector {
    pub fn new(config: &EngineConfig) -> Self {
        SqlDissector {
            max_frame_size: config.max_frame_size,
        }
    }

    fn leading_keyword(window: &[u8]) -> Option<(&'static str, &'static str)> {
        let text = std::str::from_utf8(&window[..window.len().min(32)]).ok()?;
        let first = text.trim_start().split_whitespace().next()?;
        let lowered = first.to_ascii_lowercase();
        STATEMENT_KEYWORDS
            .iter()
            .find(|(kw, _)| *kw == lowered)
            .copied()
    }

    fn scan_injection(&self, statement: &str, findings: &mut Vec<Finding>) {
        let lowered = statement.to_ascii_lowercase();

        // Stacked statements: a ';' with another statement keyword after it.
        if let Some(pos) = statement.find(';') {
            let tail = statement[pos + 1..].trim_start();
            if Self::leading_keyword(tail.as_bytes()).is_some() {
                findings.push(Finding::frame_scoped(
                    FindingKind::Injection,
                    "stacked_statements",
                    Severity::High,
                    0.7,
                    tail,
                    "statement after ';'",
                ));
            }
        }

        // Comment-based truncation after a quote: classic `' --` tails.
        if let Some(quote_pos) = statement.rfind('\'') {
            let tail = &statement[quote_pos..];
            if tail.contains("--") || tail.contains('#') {
                findings.push(Finding::frame_scoped(
                    FindingKind::Injection,
                    "comment_truncation",
                    Severity::High,
                    0.75,
                    tail,
                    "comment following quoted literal",
                ));
            }
        }

        for tautology in ["or 1=1", "or '1'='1'", "or \"1\"=\"1\""] {
            if lowered.contains(tautology) {
                findings.push(Finding::frame_scoped(
                    FindingKind::Injection,
                    "tautology",
                    Severity::High,
                    0.8,
                    tautology,
                    "always-true predicate",
                ));
                break;
            }
        }

        if lowered.contains("union select") || lowered.contains("union all select") {
            findings.push(Finding::frame_scoped(
                FindingKind::Injection,
                "union_select",
                Severity::Medium,
                0.7,
                "union select",
                "result-set widening",
            ));
        }

        // String concatenation adjacent to quotes reads as query building
        // with variables.
        if lowered.contains("'+") || lowered.contains("+'") || lowered.contains("'||") || lowered.contains("||'")
        {
            findings.push(Finding::frame_scoped(
                FindingKind::Injection,
                "string_concatenation",
                Severity::Medium,
                0.6,
                "",
                "concatenation against quoted literal",
            ));
        }
    }

    fn scan_credentials(&self, statement: &str, findings: &mut Vec<Finding>) {
        let lowered = statement.to_ascii_lowercase();
        if let Some(pos) = lowered.find("identified by") {
            let tail = &statement[pos + "identified by".len()..];
            let value = tail
                .trim_start()
                .trim_start_matches('\'')
                .split('\'')
                .next()
                .unwrap_or("");
            findings.push(Finding::frame_scoped(
                FindingKind::Credential,
                "identified_by_password",
                Severity::High,
                0.9,
                value,
                "IDENTIFIED BY clause",
            ));
        }
        if (lowered.starts_with("create user") || lowered.starts_with("grant"))
            && lowered.contains("password")
        {
            findings.push(Finding::frame_scoped(
                FindingKind::Credential,
                "auth_statement",
                Severity::Medium,
                0.7,
                "",
                "account management statement carrying a password",
            ));
        }
    }
}

impl Dissector for SqlDissector {
    fn protocol(&self) -> Protocol {
        Protocol::Sql
    }

    fn priority(&self) -> u8 {
        50
    }

    fn identify(&self, window: &[u8]) -> f64 {
        match Self::leading_keyword(window) {
            // Bare "auth"/"login" leads far too many ordinary log lines.
            Some(("auth", _)) | Some(("login", _)) => 0.0,
            Some(_) => 0.8,
            None => 0.0,
        }
    }

    fn dissect(&self, ctx: &RecordContext, raw: &[u8]) -> Result<Dissection, EngineError> {
        if raw.len() > self.max_frame_size {
            return Err(EngineError::Resource(format!(
                "SQL record exceeds max frame size ({} bytes)",
                self.max_frame_size
            )));
        }
        let statement = String::from_utf8_lossy(raw).to_string();
        let (_, class) = Self::leading_keyword(raw).ok_or(EngineError::Format {
            protocol: "SQL",
            reason: "no leading statement keyword".into(),
        })?;
        let mut frame = Frame::new(Protocol::Sql, ctx.pid, ctx.stream, raw.to_vec());
        frame.set("statement_type", class);
        frame.set("normalized", normalize(&statement));
        frame.set("length", statement.len() as i64);
        Ok(Dissection::Frames(vec![frame]))
    }

    fn find_vulnerabilities(&self, frame: &Frame) -> Vec<Finding> {
        let statement = String::from_utf8_lossy(&frame.raw).to_string();
        let mut findings = Vec::new();
        self.scan_injection(&statement, &mut findings);
        self.scan_credentials(&statement, &mut findings);
        findings
    }

    fn session_id(&self, frame: &Frame) -> Result<SessionId, EngineError> {
        let ctx = RecordContext::new(frame.pid, frame.stream);
        Ok(SessionId::new(format!(
            "sql_hash_{}",
            short_hash(&ctx.endpoint())
        )))
    }
}
