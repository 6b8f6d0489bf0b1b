// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Standard-output sink with optional ANSI coloring by record kind. The
//! colored form strips back to the same parseable JSON line.

use crate::record::RecordKind;
use crate::sinks::Sink;
use async_trait::async_trait;
use std::io;
use tokio::io::AsyncWriteExt;

const RESET: &str = "\x1b[0m";

fn color_for(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Finding => "\x1b[31m", // red
        RecordKind::Frame => "\x1b[36m",   // cyan
        RecordKind::Event => "\x1b[2m",    // dim
        RecordKind::Stats => "\x1b[33m",   // yellow
        RecordKind::Start | RecordKind::Stop => "\x1b[32m", // green
    }
}

pub struct ConsoleSink {
    color: bool,
    stdout: tokio::io::Stdout,
}

impl ConsoleSink {
    pub fn new(color: bool) -> Self {
        ConsoleSink {
            color,
            stdout: tokio::io::stdout(),
        }
    }

    fn render(&self, kind: RecordKind, line: &str) -> String {
        if !self.color {
            return line.to_string();
        }
        // Color around the payload, newline outside the reset so a consumer
        // stripping ANSI sequences gets byte-identical JSON lines.
        let body = line.strip_suffix('\n').unwrap_or(line);
        format!("{}{}{}\n", color_for(kind), body, RESET)
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    async fn write_record(&mut self, kind: RecordKind, line: &str) -> io::Result<()> {
        let rendered = self.render(kind, line);
        self.stdout.write_all(rendered.as_bytes()).await?;
        self.stdout.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_ansi(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn test_plain_render_is_identity() {
        let sink = ConsoleSink::new(false);
        let line = "{\"type\":\"finding\"}\n";
        assert_eq!(sink.render(RecordKind::Finding, line), line);
    }

    #[test]
    fn test_colored_render_strips_to_same_json() {
        let sink = ConsoleSink::new(true);
        let line = "{\"type\":\"finding\",\"severity\":\"high\"}\n";
        let rendered = sink.render(RecordKind::Finding, line);
        assert_ne!(rendered, line);
        assert_eq!(strip_ansi(&rendered), line);
        let parsed: serde_json::Value = serde_json::from_str(&strip_ansi(&rendered)).unwrap();
        assert_eq!(parsed["severity"], "high");
    }

    #[test]
    fn test_kinds_have_distinct_colors() {
        assert_ne!(color_for(RecordKind::Finding), color_for(RecordKind::Frame));
        assert_ne!(color_for(RecordKind::Event), color_for(RecordKind::Stats));
    }
}
