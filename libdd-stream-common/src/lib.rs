// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod error;
pub mod finding;
pub mod frame;
pub mod redact;

pub use config::{EngineConfig, SinkConfig};
pub use error::{EngineError, ErrorClass};
pub use finding::{Finding, FindingKind, FindingScope, Severity};
pub use frame::{Direction, FieldValue, Frame, Protocol, StreamKind};

/// Extension trait for `Mutex` to acquire a lock, panicking if the lock is
/// poisoned.
///
/// A poisoned lock means another thread panicked while holding it; the shared
/// state cannot be trusted afterwards, so propagating the panic is the only
/// sound option for these internal maps.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}

/// Render a timestamp the way every wire record expects it: RFC 3339 with
/// nanosecond precision, UTC.
pub fn format_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Hex-encoded SHA-256, truncated to 16 characters. Used wherever a raw
/// identifier or token value must be referenced without being stored.
pub fn short_hash(value: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(value.as_bytes());
    let mut out = hex::encode(digest);
    out.truncate(16);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_stable() {
        assert_eq!(short_hash("AAAA"), short_hash("AAAA"));
        assert_ne!(short_hash("AAAA"), short_hash("AAAB"));
        assert_eq!(short_hash("AAAA").len(), 16);
    }

    #[test]
    fn test_format_ts_rfc3339_nanos() {
        let ts = chrono::DateTime::parse_from_rfc3339("2024-01-02T03:04:05.000000006Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(format_ts(ts), "2024-01-02T03:04:05.000000006Z");
    }
}
