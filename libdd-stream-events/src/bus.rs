// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of records to sinks under explicit backpressure.
//!
//! Every sink owns a bounded queue and a consumer task. Lossy sinks
//! (console, TCP) drop their oldest queued record when full; durable sinks
//! (file, unix socket, pipe) briefly block the publisher and then drop.
//! Either way the publisher's throughput never depends on a slow sink
//! beyond the configured block timeout.

use crate::record::{Record, RecordKind};
use crate::sinks::{self, Sink};
use libdd_stream_common::{EngineConfig, MutexExt, SinkConfig};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuePolicy {
    /// Evict the oldest queued record to make room.
    DropOldest,
    /// Let the publisher wait for room, up to the timeout, then drop the
    /// new record.
    BlockWithTimeout(Duration),
}

struct QueueItem {
    kind: RecordKind,
    line: String,
}

/// Bounded MPSC queue with an explicit overflow policy.
struct SinkQueue {
    items: Mutex<VecDeque<QueueItem>>,
    capacity: usize,
    policy: QueuePolicy,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
    written: AtomicU64,
}

impl SinkQueue {
    fn new(capacity: usize, policy: QueuePolicy) -> Self {
        SinkQueue {
            items: Mutex::new(VecDeque::new()),
            capacity,
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
        }
    }

    async fn push(&self, item: QueueItem) {
        match self.policy {
            QueuePolicy::DropOldest => {
                let mut items = self.items.lock_or_panic();
                if items.len() >= self.capacity {
                    items.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                items.push_back(item);
                drop(items);
                self.readable.notify_one();
            }
            QueuePolicy::BlockWithTimeout(timeout) => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    {
                        let mut items = self.items.lock_or_panic();
                        if items.len() < self.capacity {
                            items.push_back(item);
                            drop(items);
                            self.readable.notify_one();
                            return;
                        }
                    }
                    if tokio::time::timeout_at(deadline, self.writable.notified())
                        .await
                        .is_err()
                    {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }

    async fn pop(&self) -> QueueItem {
        loop {
            {
                let mut items = self.items.lock_or_panic();
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.writable.notify_one();
                    return item;
                }
            }
            self.readable.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock_or_panic().len()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkStats {
    pub name: String,
    pub queued: usize,
    pub written: u64,
    pub dropped: u64,
}

struct SinkHandle {
    name: String,
    queue: Arc<SinkQueue>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct EventBus {
    sinks: Vec<SinkHandle>,
    cancel: CancellationToken,
    flush_timeout: Duration,
}

impl EventBus {
    /// Build the bus and connect every configured sink. A sink that cannot
    /// be opened is a hard error; backpressure problems later are not.
    pub async fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for sink_config in &config.sinks {
            let sink = sinks::build(sink_config).await?;
            let policy = if sink_config.is_durable() {
                QueuePolicy::BlockWithTimeout(config.sink_block_timeout)
            } else {
                QueuePolicy::DropOldest
            };
            handles.push(Self::spawn_sink(
                sink_name(sink_config),
                sink,
                config.queue_capacity,
                policy,
                cancel.clone(),
            ));
        }
        Ok(EventBus {
            sinks: handles,
            cancel,
            flush_timeout: config.shutdown_flush_timeout,
        })
    }

    /// A bus with no sinks; records are serialized and discarded. Used when
    /// the caller only consumes the engine's event channel.
    pub fn disconnected() -> Self {
        EventBus {
            sinks: Vec::new(),
            cancel: CancellationToken::new(),
            flush_timeout: Duration::from_secs(2),
        }
    }

    fn spawn_sink(
        name: String,
        mut sink: Box<dyn Sink>,
        capacity: usize,
        policy: QueuePolicy,
        cancel: CancellationToken,
    ) -> SinkHandle {
        let queue = Arc::new(SinkQueue::new(capacity, policy));
        let consumer_queue = Arc::clone(&queue);
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = consumer_queue.pop() => item,
                    _ = cancel.cancelled() => break,
                };
                match sink.write_record(item.kind, &item.line).await {
                    Ok(()) => {
                        consumer_queue.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        consumer_queue.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(sink = task_name.as_str(), error = %e, "sink write failed");
                    }
                }
            }
            // Cancellation: drain whatever is still queued, best effort.
            while let Some(item) = {
                let mut items = consumer_queue.items.lock_or_panic();
                items.pop_front()
            } {
                if sink.write_record(item.kind, &item.line).await.is_ok() {
                    consumer_queue.written.fetch_add(1, Ordering::Relaxed);
                }
            }
            if let Err(e) = sink.close().await {
                warn!(sink = task_name.as_str(), error = %e, "sink close failed");
            }
        });
        SinkHandle {
            name,
            queue,
            task: Mutex::new(Some(task)),
        }
    }

    /// Serialize once, enqueue everywhere.
    pub async fn publish(&self, record: &Record) {
        if self.sinks.is_empty() {
            return;
        }
        let line = record.to_json_line();
        let kind = record.kind();
        for handle in &self.sinks {
            handle
                .queue
                .push(QueueItem {
                    kind,
                    line: line.clone(),
                })
                .await;
        }
    }

    pub fn stats(&self) -> Vec<SinkStats> {
        self.sinks
            .iter()
            .map(|handle| SinkStats {
                name: handle.name.clone(),
                queued: handle.queue.len(),
                written: handle.queue.written.load(Ordering::Relaxed),
                dropped: handle.queue.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Flush queues within the configured timeout, then stop every sink
    /// task. Idempotent; later calls are no-ops.
    pub async fn shutdown(&self) {
        let deadline = tokio::time::Instant::now() + self.flush_timeout;
        for handle in &self.sinks {
            while handle.queue.len() > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        self.cancel.cancel();
        for handle in &self.sinks {
            let task = handle.task.lock_or_panic().take();
            if let Some(task) = task {
                let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
            }
        }
    }
}

fn sink_name(config: &SinkConfig) -> String {
    match config {
        SinkConfig::File { path, .. } => format!("file:{path}"),
        SinkConfig::Tcp { addr } => format!("tcp:{addr}"),
        SinkConfig::UnixSocket { path } => format!("unix:{path}"),
        SinkConfig::NamedPipe { path } => format!("pipe:{path}"),
        SinkConfig::Console { .. } => "console".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: usize) -> QueueItem {
        QueueItem {
            kind: RecordKind::Event,
            line: format!("line-{n}\n"),
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let queue = SinkQueue::new(3, QueuePolicy::DropOldest);
        for n in 0..5 {
            queue.push(item(n)).await;
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 2);
        // Oldest survivors are 2, 3, 4.
        assert_eq!(queue.pop().await.line, "line-2\n");
    }

    #[tokio::test]
    async fn test_block_with_timeout_drops_new_after_wait() {
        let queue = SinkQueue::new(1, QueuePolicy::BlockWithTimeout(Duration::from_millis(20)));
        queue.push(item(0)).await;
        let started = std::time::Instant::now();
        queue.push(item(1)).await;
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        // The queued record is the old one.
        assert_eq!(queue.pop().await.line, "line-0\n");
    }

    #[tokio::test]
    async fn test_block_policy_succeeds_when_consumer_drains() {
        let queue = Arc::new(SinkQueue::new(
            1,
            QueuePolicy::BlockWithTimeout(Duration::from_secs(5)),
        ));
        queue.push(item(0)).await;
        let consumer = Arc::clone(&queue);
        let drained = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            consumer.pop().await
        });
        queue.push(item(1)).await;
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 0);
        assert_eq!(drained.await.unwrap().line, "line-0\n");
        assert_eq!(queue.pop().await.line, "line-1\n");
    }

    #[tokio::test]
    async fn test_lossy_publisher_throughput_independent_of_consumer() {
        // No consumer at all: pushes never block.
        let queue = SinkQueue::new(16, QueuePolicy::DropOldest);
        let started = std::time::Instant::now();
        for n in 0..10_000 {
            queue.push(item(n)).await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.len(), 16);
    }

    #[tokio::test]
    async fn test_disconnected_bus_publish_is_noop() {
        let bus = EventBus::disconnected();
        bus.publish(&Record::start(1, "target")).await;
        assert!(bus.stats().is_empty());
        bus.shutdown().await;
    }
}
