// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive scan scheduling: busy streams are drained more often, quiet
//! streams back off, and nobody leaves the configured bounds.

use std::time::Duration;

/// Write rate at or above which a stream is polled at the minimum interval.
const HOT_RATE_BPS: f64 = 256.0 * 1024.0;

/// Rate below which a stream is considered idle.
const IDLE_RATE_BPS: f64 = 512.0;

/// Next scan interval for a stream given its current write rate.
///
/// Linear between the bounds: an idle stream sits at `max`, a hot stream at
/// `min`. The mapping is stateless, so a stream that bursts converges to
/// the fast end within one tick and decays just as directly. Bounds come
/// from the engine configuration; a low-rate stream is still scanned every
/// `max` at worst, so nothing starves.
pub fn next_interval(rate_bps: f64, min: Duration, max: Duration) -> Duration {
    if rate_bps >= HOT_RATE_BPS {
        return min;
    }
    if rate_bps <= IDLE_RATE_BPS {
        return max;
    }
    let t = (rate_bps - IDLE_RATE_BPS) / (HOT_RATE_BPS - IDLE_RATE_BPS);
    let span = max.as_secs_f64() - min.as_secs_f64();
    Duration::from_secs_f64(max.as_secs_f64() - span * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_millis(200);

    #[test]
    fn test_idle_stream_at_max() {
        assert_eq!(next_interval(0.0, MIN, MAX), MAX);
        assert_eq!(next_interval(100.0, MIN, MAX), MAX);
    }

    #[test]
    fn test_hot_stream_at_min() {
        assert_eq!(next_interval(1_000_000.0, MIN, MAX), MIN);
    }

    #[test]
    fn test_mid_rate_between_bounds() {
        let interval = next_interval(128.0 * 1024.0, MIN, MAX);
        assert!(interval > MIN && interval < MAX);
    }

    #[test]
    fn test_monotonic_in_rate() {
        let slow = next_interval(10_000.0, MIN, MAX);
        let fast = next_interval(200_000.0, MIN, MAX);
        assert!(fast <= slow);
    }
}
