// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Socket and pipe sinks: JSON-lines over TCP, Unix domain sockets, and
//! named pipes.

use crate::record::RecordKind;
use crate::sinks::Sink;
use async_trait::async_trait;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};

pub struct TcpSink {
    stream: TcpStream,
}

impl TcpSink {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        Ok(TcpSink {
            stream: TcpStream::connect(addr).await?,
        })
    }
}

#[async_trait]
impl Sink for TcpSink {
    async fn write_record(&mut self, _kind: RecordKind, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes()).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

pub struct UnixSink {
    stream: UnixStream,
}

impl UnixSink {
    pub async fn connect(path: &str) -> io::Result<Self> {
        Ok(UnixSink {
            stream: UnixStream::connect(path).await?,
        })
    }
}

#[async_trait]
impl Sink for UnixSink {
    async fn write_record(&mut self, _kind: RecordKind, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes()).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Writes into an existing FIFO. The open blocks until a reader appears,
/// which matches operator expectations for pipe wiring.
pub struct PipeSink {
    file: tokio::fs::File,
}

impl PipeSink {
    pub async fn open(path: &str) -> io::Result<Self> {
        Ok(PipeSink {
            file: tokio::fs::OpenOptions::new().write(true).open(path).await?,
        })
    }
}

#[async_trait]
impl Sink for PipeSink {
    async fn write_record(&mut self, _kind: RecordKind, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes()).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file.flush().await
    }
}
