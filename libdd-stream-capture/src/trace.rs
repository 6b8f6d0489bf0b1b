// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syscall-tracing capture source.
//!
//! Spawns `strace` attached to the target, filtered to read/write on fds
//! 0/1/2, and decodes the hex-escaped payloads back into raw bytes. Used
//! when a stream is a pseudo-terminal, where the procfs reader sees
//! nothing. Data written before attachment is gone; the engine emits a
//! one-shot notice saying so.
//!
//! The tracer subprocess runs under `tokio::process`; a reader task parses
//! its stderr and enforces an event-rate cap per PID: past the cap it keeps
//! one event in sixteen so a chatty target cannot melt the host.

use crate::source::{CaptureSource, ReadOutcome};
use libdd_stream_common::{EngineError, StreamKind};
use std::process::Stdio;
use std::sync::mpsc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

/// Sampling ratio once the rate cap trips.
const SAMPLE_KEEP_ONE_IN: u64 = 16;

/// One decoded I/O event from the trace stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub syscall: Syscall,
    pub fd: i32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Read,
    Write,
}

/// Parse one strace output line of the shape
/// `write(1, "\x68\x69", 2) = 2` or `[pid 4711] read(0, "\x61", 1) = 1`.
/// Lines that are not read/write payload lines parse to `None`.
pub fn parse_trace_line(line: &str) -> Option<TraceEvent> {
    let line = match line.strip_prefix("[pid ") {
        Some(rest) => rest.split_once("] ").map(|(_, tail)| tail)?,
        None => line,
    };
    let (name, rest) = line.split_once('(')?;
    let syscall = match name.trim() {
        "read" => Syscall::Read,
        "write" => Syscall::Write,
        _ => return None,
    };
    let (fd_str, rest) = rest.split_once(',')?;
    let fd: i32 = fd_str.trim().parse().ok()?;

    // Payload is the first double-quoted span; strace may append "..." when
    // the string was truncated by -s.
    let quote_start = rest.find('"')?;
    let payload = &rest[quote_start + 1..];
    let quote_end = find_closing_quote(payload)?;
    let bytes = decode_escapes(&payload[..quote_end]);

    // A failed syscall (= -1 ...) carries no captured data.
    let result = rest.rsplit_once('=').map(|(_, r)| r.trim())?;
    if result.starts_with('-') {
        return None;
    }

    Some(TraceEvent { syscall, fd, bytes })
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Decode the strace `-xx` escape form (`\xNN`, plus conventional escapes).
pub fn decode_escapes(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'x') => {
                let hex = bytes.get(i + 2..i + 4).and_then(|h| {
                    u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 4;
                    }
                    None => {
                        out.push(b'\\');
                        i += 1;
                    }
                }
            }
            Some(b'n') => {
                out.push(b'\n');
                i += 2;
            }
            Some(b'r') => {
                out.push(b'\r');
                i += 2;
            }
            Some(b't') => {
                out.push(b'\t');
                i += 2;
            }
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(b'"') => {
                out.push(b'"');
                i += 2;
            }
            Some(other) => {
                out.push(*other);
                i += 2;
            }
            None => {
                out.push(b'\\');
                i += 1;
            }
        }
    }
    out
}

pub struct TraceReader {
    pid: i32,
    stream: StreamKind,
    rate_cap: u32,
    signal_events: bool,
    child: Option<Child>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    pty: bool,
}

impl TraceReader {
    pub fn new(pid: i32, stream: StreamKind, rate_cap: u32, signal_events: bool) -> Self {
        TraceReader {
            pid,
            stream,
            rate_cap,
            signal_events,
            child: None,
            rx: None,
            pty: true,
        }
    }

    /// The syscall+fd combination this stream observes: data enters the
    /// target through read(0) and leaves through write(1)/write(2).
    fn wanted(stream: StreamKind) -> (Syscall, i32) {
        match stream {
            StreamKind::Stdin => (Syscall::Read, 0),
            StreamKind::Stdout => (Syscall::Write, 1),
            StreamKind::Stderr => (Syscall::Write, 2),
        }
    }
}

impl CaptureSource for TraceReader {
    fn open(&mut self) -> Result<(), EngineError> {
        let mut args = vec![
            "-p".to_string(),
            self.pid.to_string(),
            "-e".to_string(),
            "trace=read,write".to_string(),
            "-s".to_string(),
            "4096".to_string(),
            "-xx".to_string(),
            "-qq".to_string(),
            "-f".to_string(),
        ];
        if !self.signal_events {
            args.push("-e".to_string());
            args.push("signal=none".to_string());
        }
        let mut child = Command::new("strace")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::Config(
                    "strace fallback enabled but strace binary not found".to_string(),
                ),
                _ => EngineError::Permission {
                    pid: self.pid,
                    reason: format!("cannot spawn tracer: {e}"),
                },
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::Internal("tracer spawned without stderr pipe".to_string())
        })?;
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let (wanted_syscall, wanted_fd) = Self::wanted(self.stream);
        let rate_cap = self.rate_cap as u64;
        let pid = self.pid;

        // The reader task ends when strace exits or the receiver is
        // dropped; the channel hangup is what read_chunk reports as EOF.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut window_start = Instant::now();
            let mut window_events = 0u64;
            let mut sampling = false;
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(event) = parse_trace_line(&line) else {
                    continue;
                };
                if event.syscall != wanted_syscall || event.fd != wanted_fd {
                    continue;
                }

                window_events += 1;
                if window_start.elapsed().as_secs() >= 1 {
                    if sampling && window_events <= rate_cap {
                        debug!(pid, "tracer event rate back under cap");
                    }
                    sampling = window_events > rate_cap;
                    window_start = Instant::now();
                    window_events = 0;
                }
                if sampling && window_events % SAMPLE_KEEP_ONE_IN != 0 {
                    continue;
                }

                if event.bytes.is_empty() {
                    continue;
                }
                if tx.send(event.bytes).is_err() {
                    break;
                }
            }
        });

        self.child = Some(child);
        self.rx = Some(rx);
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, EngineError> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(ReadOutcome::Eof);
        };
        match rx.try_recv() {
            Ok(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                // Oversized events are truncated to the chunk size; strace -s
                // already bounds payloads to the same order of magnitude.
                Ok(ReadOutcome::Data(n))
            }
            Err(mpsc::TryRecvError::Empty) => Ok(ReadOutcome::Empty),
            Err(mpsc::TryRecvError::Disconnected) => Ok(ReadOutcome::Eof),
        }
    }

    fn is_pty(&self) -> bool {
        self.pty
    }

    fn close(&mut self) {
        self.rx = None;
        if let Some(mut child) = self.child.take() {
            // Reaping happens through kill_on_drop; start_kill is safe from
            // sync contexts.
            let _ = child.start_kill();
        }
    }

    fn method(&self) -> &'static str {
        "trace"
    }
}

impl Drop for TraceReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write_line() {
        let event =
            parse_trace_line(r#"write(1, "\x68\x65\x6c\x6c\x6f\x0a", 6) = 6"#).unwrap();
        assert_eq!(event.syscall, Syscall::Write);
        assert_eq!(event.fd, 1);
        assert_eq!(event.bytes, b"hello\n");
    }

    #[test]
    fn test_parse_read_line_with_pid_prefix() {
        let event = parse_trace_line(r#"[pid  4711] read(0, "\x61\x62", 2) = 2"#).unwrap();
        assert_eq!(event.syscall, Syscall::Read);
        assert_eq!(event.fd, 0);
        assert_eq!(event.bytes, b"ab");
    }

    #[test]
    fn test_parse_ignores_other_syscalls_and_noise() {
        assert!(parse_trace_line("close(3) = 0").is_none());
        assert!(parse_trace_line("strace: Process 1 attached").is_none());
        assert!(parse_trace_line("").is_none());
    }

    #[test]
    fn test_parse_ignores_failed_syscall() {
        assert!(
            parse_trace_line(r#"read(0, "", 1) = -1 EAGAIN (Resource temporarily unavailable)"#)
                .is_none()
        );
    }

    #[test]
    fn test_parse_truncated_payload_marker() {
        let event = parse_trace_line(r#"write(2, "\x61\x62"..., 4096) = 4096"#).unwrap();
        assert_eq!(event.bytes, b"ab");
    }

    #[test]
    fn test_decode_escaped_quote_inside_payload() {
        let event = parse_trace_line(r#"write(1, "\x61\"\x62", 3) = 3"#).unwrap();
        assert_eq!(event.bytes, b"a\"b");
    }

    #[test]
    fn test_decode_escapes_mixed() {
        assert_eq!(decode_escapes(r"\x41\x42\n"), b"AB\n");
        assert_eq!(decode_escapes(r"plain"), b"plain");
        assert_eq!(decode_escapes(r"\x4"), b"\\x4".to_vec());
    }

    #[test]
    fn test_wanted_mapping() {
        assert_eq!(TraceReader::wanted(StreamKind::Stdin), (Syscall::Read, 0));
        assert_eq!(TraceReader::wanted(StreamKind::Stdout), (Syscall::Write, 1));
        assert_eq!(TraceReader::wanted(StreamKind::Stderr), (Syscall::Write, 2));
    }
}
