// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture sources: mechanisms that turn a target's stream into bytes.
//!
//! `ProcReader` reads the per-process filesystem view of fds 0/1/2
//! directly; `TraceReader` (trace.rs) shadows the target's read/write
//! syscalls. Both sit behind one capability so further mechanisms slot in
//! as new variants.

use libdd_stream_common::{EngineError, StreamKind};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

/// One non-blocking read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the front of the caller's buffer.
    Data(usize),
    /// Nothing available right now.
    Empty,
    /// The stream is gone (process exited or fd closed).
    Eof,
}

pub trait CaptureSource: Send {
    fn open(&mut self) -> Result<(), EngineError>;
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, EngineError>;
    fn is_pty(&self) -> bool;
    fn close(&mut self);
    /// "proc" or "trace", surfaced in `stats` records.
    fn method(&self) -> &'static str;
}

/// Reads `/proc/<pid>/fd/{0,1,2}` non-blocking.
pub struct ProcReader {
    pid: i32,
    stream: StreamKind,
    file: Option<File>,
    pty: bool,
}

impl ProcReader {
    pub fn new(pid: i32, stream: StreamKind) -> Self {
        ProcReader {
            pid,
            stream,
            file: None,
            pty: false,
        }
    }

    fn fd_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/{}/fd/{}", self.pid, self.stream.fd()))
    }

    /// A pseudo-terminal fd resolves to `/dev/pts/N` (or the controlling
    /// tty); reading those through procfs yields nothing useful, which is
    /// what the strace fallback is for.
    fn detect_pty(&self) -> bool {
        match std::fs::read_link(self.fd_path()) {
            Ok(target) => {
                let target = target.to_string_lossy();
                target.starts_with("/dev/pts/") || target.starts_with("/dev/tty")
            }
            Err(_) => false,
        }
    }
}

impl CaptureSource for ProcReader {
    fn open(&mut self) -> Result<(), EngineError> {
        self.pty = self.detect_pty();
        let path = self.fd_path();
        let file = open_nonblocking(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => EngineError::Permission {
                pid: self.pid,
                reason: format!("cannot open {}", path.display()),
            },
            std::io::ErrorKind::NotFound => EngineError::Permission {
                pid: self.pid,
                reason: format!("{} does not exist", path.display()),
            },
            _ => EngineError::TransientIo {
                context: path.display().to_string(),
                source: e,
            },
        })?;
        self.file = Some(file);
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, EngineError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(ReadOutcome::Eof);
        };
        match file.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(ReadOutcome::Empty),
            Err(e) => Err(EngineError::TransientIo {
                context: format!("proc read pid {} {}", self.pid, self.stream.as_str()),
                source: e,
            }),
        }
    }

    fn is_pty(&self) -> bool {
        self.pty
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn method(&self) -> &'static str {
        "proc"
    }
}

#[cfg(unix)]
fn open_nonblocking(path: &std::path::Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &std::path::Path) -> std::io::Result<File> {
    std::fs::OpenOptions::new().read(true).open(path)
}

/// True when the process can be observed at all: it exists and its procfs
/// entry is readable by us.
pub fn process_observable(pid: i32) -> Result<(), EngineError> {
    let proc_dir = format!("/proc/{pid}");
    match std::fs::metadata(&proc_dir) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::Permission {
                pid,
                reason: "no such process".to_string(),
            })
        }
        Err(_) => {
            return Err(EngineError::Permission {
                pid,
                reason: format!("{proc_dir} not readable"),
            })
        }
    }
    match std::fs::read_dir(format!("{proc_dir}/fd")) {
        Ok(_) => Ok(()),
        Err(_) => Err(EngineError::Permission {
            pid,
            reason: format!("{proc_dir}/fd not readable"),
        }),
    }
}

/// True while the process still exists. EPERM still means alive, just not
/// ours to signal.
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_observable() {
        let pid = std::process::id() as i32;
        process_observable(pid).unwrap();
        assert!(process_alive(pid));
    }

    #[test]
    fn test_nonexistent_process_is_permission_error() {
        // PID max on Linux defaults to 4194304; beyond it nothing exists.
        let err = process_observable(9_999_999).unwrap_err();
        assert!(matches!(err, EngineError::Permission { .. }));
        assert!(!process_alive(9_999_999));
    }

    #[test]
    fn test_proc_reader_open_own_stdin() {
        let pid = std::process::id() as i32;
        let mut reader = ProcReader::new(pid, StreamKind::Stdin);
        // Opening our own fd 0 through procfs works whether or not it is a
        // terminal; a read must never block.
        if reader.open().is_ok() {
            let mut buf = [0u8; 64];
            let _ = reader.read_chunk(&mut buf);
            reader.close();
            let mut buf = [0u8; 64];
            assert_eq!(reader.read_chunk(&mut buf).unwrap(), ReadOutcome::Eof);
        }
    }

    #[test]
    fn test_open_missing_fd_classified() {
        let mut reader = ProcReader::new(9_999_999, StreamKind::Stdout);
        let err = reader.open().unwrap_err();
        assert!(matches!(err, EngineError::Permission { .. }));
    }
}
