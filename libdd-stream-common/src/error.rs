// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

/// Error taxonomy of the engine. Every fallible path maps into one of these
/// classes; the class decides how far the error propagates.
///
/// - `Config` is fatal at startup.
/// - `Permission` is fatal for the affected PID only.
/// - `TransientIo`, `Format` and `Resource` are counted and reported through
///   the event stream, never fatal.
/// - `Internal` aborts the affected PID when containment fails.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("permission denied observing pid {pid}: {reason}")]
    Permission { pid: i32, reason: String },

    #[error("transient i/o error on {context}: {source}")]
    TransientIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {protocol} record: {reason}")]
    Format {
        protocol: &'static str,
        reason: String,
    },

    #[error("resource limit exceeded: {0}")]
    Resource(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Config,
    Permission,
    TransientIo,
    Format,
    Resource,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Config => "config",
            ErrorClass::Permission => "permission",
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::Format => "format",
            ErrorClass::Resource => "resource",
            ErrorClass::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Config(_) => ErrorClass::Config,
            EngineError::Permission { .. } => ErrorClass::Permission,
            EngineError::TransientIo { .. } => ErrorClass::TransientIo,
            EngineError::Format { .. } => ErrorClass::Format,
            EngineError::Resource(_) => ErrorClass::Resource,
            EngineError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// The `reason` string carried by a terminal `stop` record.
    pub fn stop_reason(&self) -> String {
        format!("error:{}", self.class().as_str())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        EngineError::TransientIo {
            context: "io".to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mapping() {
        let err = EngineError::Config("bad delimiter".into());
        assert_eq!(err.class(), ErrorClass::Config);
        assert_eq!(err.class().as_str(), "config");

        let err = EngineError::Permission {
            pid: 42,
            reason: "ptrace scope".into(),
        };
        assert_eq!(err.class(), ErrorClass::Permission);
        assert_eq!(err.stop_reason(), "error:permission");
    }

    #[test]
    fn test_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "eagain");
        let err: EngineError = io.into();
        assert_eq!(err.class(), ErrorClass::TransientIo);
    }
}
