// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON-lines file sink with size-based rotation.
//!
//! Rotated files are renamed with their rotation timestamp, extension
//! preserved; the oldest rotated files are deleted once `max_files` is
//! exceeded. The current file is never deleted.

use crate::record::RecordKind;
use crate::sinks::Sink;
use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::{fs, io::ErrorKind};

pub struct FileSink {
    path: PathBuf,
    current_size: u64,
    max_size: u64,
    max_files: u64,
    current_file: fs::File,
}

impl FileSink {
    pub fn new(path: &str, max_size: u64, max_files: u64) -> io::Result<Self> {
        let path = Path::new(path).to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(io::Error::new(ErrorKind::InvalidInput, "empty sink path"));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(FileSink {
            path,
            current_size,
            max_size,
            max_files,
            current_file: file,
        })
    }

    fn timestamp_string() -> String {
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string()
    }

    /// `events.log` rotates to `events_<timestamp>.log`; a name without an
    /// extension just gets the timestamp suffixed.
    fn rotated_path(&self, timestamp: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());
        let rotated = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{timestamp}.{ext}"),
            _ => format!("{name}_{timestamp}"),
        };
        self.path.with_file_name(rotated)
    }

    fn rotate_if_needed(&mut self) -> io::Result<()> {
        if self.max_size == 0 || self.current_size < self.max_size {
            return Ok(());
        }
        self.current_file.flush()?;
        let rotated = self.rotated_path(&Self::timestamp_string());
        fs::rename(&self.path, rotated)?;
        self.current_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.current_size = 0;
        if self.max_files > 0 {
            self.cleanup_old_files()?;
        }
        Ok(())
    }

    fn cleanup_old_files(&self) -> io::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let Some(stem) = self.path.file_stem() else {
            return Ok(());
        };
        let prefix = format!("{}_", stem.to_string_lossy());
        let extension = self
            .path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()));

        let mut rotated: Vec<(PathBuf, String)> = fs::read_dir(parent)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(&prefix) {
                    return None;
                }
                let timestamp = match &extension {
                    Some(ext) if name.ends_with(ext.as_str()) => {
                        name[prefix.len()..name.len() - ext.len()].to_string()
                    }
                    Some(_) => return None,
                    None => name[prefix.len()..].to_string(),
                };
                Some((entry.path(), timestamp))
            })
            .collect();

        // Newest first; keep max_files - 1 rotated plus the live file.
        rotated.sort_by(|(_, a), (_, b)| b.cmp(a));
        let keep = self.max_files.saturating_sub(1) as usize;
        for (path, _) in rotated.iter().skip(keep) {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write_record(&mut self, _kind: RecordKind, line: &str) -> io::Result<()> {
        self.rotate_if_needed()?;
        self.current_file.write_all(line.as_bytes())?;
        self.current_size += line.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.current_file.flush()
    }
}
