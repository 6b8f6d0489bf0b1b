// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded byte ring with delimiter-aware reads.
//!
//! One producer, one consumer; statistics are readable from any thread.
//! Writes never block. When a write would overflow, the oldest bytes are
//! evicted in whole-record units where a delimiter allows it; an eviction
//! that has to cut mid-record marks the ring so the orphaned tail of that
//! record is discarded instead of being returned as a corrupt record.

use libdd_stream_events::BufferStats;
use libdd_stream_common::MutexExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Window for the moving write-rate average.
const RATE_WINDOW: Duration = Duration::from_secs(1);

struct Inner {
    buf: VecDeque<u8>,
    /// Set when eviction cut through the middle of a record; the consumer
    /// must skip to the next delimiter before returning records.
    skip_to_delimiter: bool,
    rate_samples: VecDeque<(Instant, usize)>,
}

pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    delimiter: Vec<u8>,
    written: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
    events_sent: AtomicU64,
    scan_interval_ms: AtomicU64,
}

impl RingBuffer {
    pub fn new(capacity: usize, delimiter: &[u8]) -> Self {
        RingBuffer {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
                skip_to_delimiter: false,
                rate_samples: VecDeque::new(),
            }),
            capacity,
            delimiter: delimiter.to_vec(),
            written: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            scan_interval_ms: AtomicU64::new(0),
        }
    }

    /// Accept a write unconditionally, evicting the oldest data on
    /// overflow. Returns the number of bytes evicted to make room.
    pub fn write(&self, bytes: &[u8]) -> u64 {
        if bytes.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock_or_panic();
        inner.buf.extend(bytes.iter().copied());
        self.written.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let now = Instant::now();
        inner.rate_samples.push_back((now, bytes.len()));
        while let Some((at, _)) = inner.rate_samples.front() {
            if now.duration_since(*at) > RATE_WINDOW {
                inner.rate_samples.pop_front();
            } else {
                break;
            }
        }

        let mut evicted = 0u64;
        if inner.buf.len() > self.capacity {
            let overflow = inner.buf.len() - self.capacity;
            let slice = inner.buf.make_contiguous();
            // Prefer evicting whole records: the shortest prefix that ends
            // on a delimiter and covers the overflow.
            let cut = find_delimiter_at_or_after(slice, &self.delimiter, overflow);
            match cut {
                Some(end) => {
                    inner.buf.drain(..end);
                    evicted = end as u64;
                    // The cut lands on a record boundary, so any earlier
                    // mid-record damage is inside the evicted span.
                    inner.skip_to_delimiter = false;
                }
                None => {
                    // No delimiter to cut on: shed raw bytes and discard the
                    // rest of the broken record at read time.
                    inner.buf.drain(..overflow);
                    inner.skip_to_delimiter = true;
                    evicted = overflow as u64;
                }
            }
            self.dropped.fetch_add(evicted, Ordering::Relaxed);
        }
        evicted
    }

    /// Every complete record since the last call; a trailing partial record
    /// stays buffered. Delimiters are consumed, never returned, and never
    /// split across records.
    pub fn read_delimited(&self) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock_or_panic();
        let mut records = Vec::new();

        if inner.skip_to_delimiter {
            let slice = inner.buf.make_contiguous();
            match find_delimiter(slice, &self.delimiter) {
                Some(pos) => {
                    let skip = pos + self.delimiter.len();
                    inner.buf.drain(..skip);
                    self.dropped.fetch_add(skip as u64, Ordering::Relaxed);
                    inner.skip_to_delimiter = false;
                }
                None => return records,
            }
        }

        loop {
            let slice = inner.buf.make_contiguous();
            let Some(pos) = find_delimiter(slice, &self.delimiter) else {
                break;
            };
            let record: Vec<u8> = inner.buf.drain(..pos).collect();
            inner.buf.drain(..self.delimiter.len());
            self.consumed
                .fetch_add((pos + self.delimiter.len()) as u64, Ordering::Relaxed);
            self.events_sent.fetch_add(1, Ordering::Relaxed);
            records.push(record);
        }
        records
    }

    /// Remove and return everything buffered, including a trailing partial
    /// record. Used for binary-mode streams and the final drain at detach.
    pub fn drain_all(&self) -> Vec<u8> {
        let mut inner = self.inner.lock_or_panic();
        let bytes: Vec<u8> = inner.buf.drain(..).collect();
        if !bytes.is_empty() {
            self.consumed.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.events_sent.fetch_add(1, Ordering::Relaxed);
        }
        inner.skip_to_delimiter = false;
        bytes
    }

    /// Copy of the first `n` buffered bytes, without consuming them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let mut inner = self.inner.lock_or_panic();
        let slice = inner.buf.make_contiguous();
        slice[..slice.len().min(n)].to_vec()
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock_or_panic().buf.len()
    }

    pub fn set_scan_interval(&self, interval: Duration) {
        self.scan_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Bytes per second over the last [`RATE_WINDOW`].
    pub fn write_rate_bps(&self) -> f64 {
        let inner = self.inner.lock_or_panic();
        let total: usize = inner.rate_samples.iter().map(|(_, n)| n).sum();
        total as f64 / RATE_WINDOW.as_secs_f64()
    }

    pub fn stats(&self) -> BufferStats {
        let buffered = self.buffered();
        BufferStats {
            written: self.written.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            usage_pct: (buffered as f64 / self.capacity as f64) * 100.0,
            write_rate_bps: self.write_rate_bps(),
            scan_interval_ms: self.scan_interval_ms.load(Ordering::Relaxed),
        }
    }

    /// written = consumed + buffered + dropped, by construction; exposed for
    /// tests and the stats path.
    pub fn accounted(&self) -> (u64, u64) {
        let written = self.written.load(Ordering::Relaxed);
        let accounted = self.consumed.load(Ordering::Relaxed)
            + self.dropped.load(Ordering::Relaxed)
            + self.buffered() as u64;
        (written, accounted)
    }
}

fn find_delimiter(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    if delimiter.len() == 1 {
        return haystack.iter().position(|b| *b == delimiter[0]);
    }
    haystack
        .windows(delimiter.len())
        .position(|w| w == delimiter)
}

/// First position `end` such that `end >= min_end` and `haystack[..end]`
/// ends with the delimiter.
fn find_delimiter_at_or_after(
    haystack: &[u8],
    delimiter: &[u8],
    min_end: usize,
) -> Option<usize> {
    let start = min_end.saturating_sub(delimiter.len());
    let slice = &haystack[start.min(haystack.len())..];
    let pos = find_delimiter(slice, delimiter)?;
    Some(start + pos + delimiter.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> RingBuffer {
        RingBuffer::new(capacity, b"\n")
    }

    #[test]
    fn test_write_then_read_records() {
        let r = ring(1024);
        r.write(b"alpha\nbeta\ngam");
        let records = r.read_delimited();
        assert_eq!(records, vec![b"alpha".to_vec(), b"beta".to_vec()]);
        // Partial record stays buffered until its delimiter arrives.
        assert_eq!(r.buffered(), 3);
        r.write(b"ma\n");
        assert_eq!(r.read_delimited(), vec![b"gamma".to_vec()]);
    }

    #[test]
    fn test_accounting_invariant() {
        let r = ring(64);
        for i in 0..50 {
            r.write(format!("record-{i:04}\n").as_bytes());
        }
        r.read_delimited();
        let (written, accounted) = r.accounted();
        assert_eq!(written, accounted);
    }

    #[test]
    fn test_eviction_whole_records_under_burst() {
        // Scenario from the capture contract: 4 KiB ring, 40 KiB of
        // 100-byte records; everything adds up and no record is partial.
        let r = ring(4096);
        let record = vec![b'x'; 99]; // +1 delimiter = 100
        let mut written = 0u64;
        for _ in 0..400 {
            let mut chunk = record.clone();
            chunk.push(b'\n');
            r.write(&chunk);
            written += 100;
        }
        let records = r.read_delimited();
        assert!(records.len() <= 40);
        for record in &records {
            assert_eq!(record.len(), 99, "no partial records");
        }
        let stats = r.stats();
        assert_eq!(stats.written, written);
        let consumed_bytes: u64 = records.iter().map(|r| r.len() as u64 + 1).sum();
        assert_eq!(stats.dropped + consumed_bytes + r.buffered() as u64, written);
    }

    #[test]
    fn test_eviction_without_delimiter_skips_broken_tail() {
        let r = ring(8);
        // 12 bytes, no delimiter: 4 evicted raw, front of record broken.
        r.write(b"abcdefghijkl");
        assert_eq!(r.buffered(), 8);
        // Nothing returned while the broken record has no terminator.
        assert!(r.read_delimited().is_empty());
        r.write(b"\nok\n");
        let records = r.read_delimited();
        // The broken record's tail was discarded, the clean one survives.
        assert_eq!(records, vec![b"ok".to_vec()]);
        let (written, accounted) = r.accounted();
        assert_eq!(written, accounted);
    }

    #[test]
    fn test_write_of_exactly_capacity_succeeds() {
        let r = ring(16);
        let evicted = r.write(b"0123456789abcde\n");
        assert_eq!(evicted, 0);
        assert_eq!(r.read_delimited().len(), 1);
    }

    #[test]
    fn test_previously_returned_records_are_stable() {
        let r = ring(32);
        r.write(b"first\n");
        let first = r.read_delimited();
        assert_eq!(first, vec![b"first".to_vec()]);
        // Heavy traffic afterwards cannot re-deliver or alter it.
        for _ in 0..100 {
            r.write(b"noise-noise-noise\n");
        }
        let later = r.read_delimited();
        assert!(later.iter().all(|r| r != b"first"));
    }

    #[test]
    fn test_multibyte_delimiter_never_split() {
        let r = RingBuffer::new(1024, b"\r\n");
        r.write(b"one\r\ntwo\r");
        assert_eq!(r.read_delimited(), vec![b"one".to_vec()]);
        r.write(b"\nthree");
        assert_eq!(r.read_delimited(), vec![b"two".to_vec()]);
        assert_eq!(r.buffered(), 5);
    }

    #[test]
    fn test_drain_all_returns_partial() {
        let r = ring(64);
        r.write(b"complete\npartial");
        assert_eq!(r.read_delimited(), vec![b"complete".to_vec()]);
        assert_eq!(r.drain_all(), b"partial".to_vec());
        assert_eq!(r.buffered(), 0);
        let (written, accounted) = r.accounted();
        assert_eq!(written, accounted);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let r = ring(64);
        r.write(b"peekable\n");
        assert_eq!(r.peek(4), b"peek".to_vec());
        assert_eq!(r.read_delimited(), vec![b"peekable".to_vec()]);
    }

    #[test]
    fn test_stats_usage_and_rate() {
        let r = ring(100);
        r.write(&[b'a'; 50]);
        let stats = r.stats();
        assert!((stats.usage_pct - 50.0).abs() < 1.0);
        assert!(stats.write_rate_bps > 0.0);
    }

    #[test]
    fn test_stats_readable_from_other_thread() {
        let r = std::sync::Arc::new(ring(1024));
        let writer = std::sync::Arc::clone(&r);
        let handle = std::thread::spawn(move || {
            for _ in 0..1000 {
                writer.write(b"line\n");
            }
        });
        for _ in 0..100 {
            let _ = r.stats();
        }
        handle.join().unwrap();
        assert_eq!(r.stats().written, 5000);
    }
}
