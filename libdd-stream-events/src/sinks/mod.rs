// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::record::RecordKind;
use async_trait::async_trait;
use libdd_stream_common::SinkConfig;
use std::io;

pub mod console;
pub mod file;
pub mod net;

/// An output destination for serialized records. `line` is always one
/// newline-terminated JSON document.
#[async_trait]
pub trait Sink: Send {
    async fn write_record(&mut self, kind: RecordKind, line: &str) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Open the sink a configuration entry describes.
pub async fn build(config: &SinkConfig) -> anyhow::Result<Box<dyn Sink>> {
    Ok(match config {
        SinkConfig::File {
            path,
            max_size_bytes,
            max_files,
        } => Box::new(file::FileSink::new(path, *max_size_bytes, *max_files)?),
        SinkConfig::Tcp { addr } => Box::new(net::TcpSink::connect(addr).await?),
        SinkConfig::UnixSocket { path } => Box::new(net::UnixSink::connect(path).await?),
        SinkConfig::NamedPipe { path } => Box::new(net::PipeSink::open(path).await?),
        SinkConfig::Console { color } => Box::new(console::ConsoleSink::new(*color)),
    })
}
