// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capture engine: owns targets, their streams and rings, the pump and
//! scheduler tasks, and the wiring into the dissection pipeline.
//!
//! The engine is a value; several can coexist in one process, which is how
//! the tests run it.

use crate::pipeline::Pipeline;
use crate::ring::RingBuffer;
use crate::sched;
use crate::source::{self, CaptureSource, ProcReader, ReadOutcome};
use crate::trace::TraceReader;
use libdd_stream_common::{EngineConfig, EngineError, MutexExt, StreamKind};
use libdd_stream_dissect::RecordContext;
use libdd_stream_events::{BufferStats, CaptureStats, EventBus, Record};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct CaptureCounters {
    attempts: u64,
    successful: u64,
    bytes: u64,
}

struct StreamState {
    pid: i32,
    kind: StreamKind,
    ring: RingBuffer,
    source: Mutex<Box<dyn CaptureSource>>,
    method: &'static str,
    counters: Mutex<CaptureCounters>,
    eof: AtomicBool,
    /// Last transient-error report, for once-per-minute rate limiting.
    last_error_report: Mutex<Option<std::time::Instant>>,
}

impl StreamState {
    fn ctx(&self) -> RecordContext {
        RecordContext::new(self.pid, self.kind)
    }
}

struct Target {
    pid: i32,
    name: String,
    streams: Vec<Arc<StreamState>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct EngineShared {
    config: EngineConfig,
    pipeline: Arc<Pipeline>,
    targets: Mutex<HashMap<i32, Arc<Target>>>,
}

pub struct CaptureEngine {
    shared: Arc<EngineShared>,
    events_tx: broadcast::Sender<Record>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine").finish_non_exhaustive()
    }
}

impl CaptureEngine {
    /// Validate the configuration, connect the sinks, and start the
    /// background sweeper and stats tasks.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let bus = EventBus::new(&config)
            .await
            .map_err(|e| EngineError::Config(format!("sink setup failed: {e}")))?;
        let (events_tx, _) = broadcast::channel(config.queue_capacity);
        let pipeline = Arc::new(Pipeline::new(&config, bus, events_tx.clone()));
        let shared = Arc::new(EngineShared {
            config,
            pipeline,
            targets: Mutex::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();

        let mut background = Vec::new();
        {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(shared.config.sweep_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => shared.pipeline.sweep_sessions().await,
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }
        {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(shared.config.stats_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => shared.emit_stats().await,
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }

        Ok(CaptureEngine {
            shared,
            events_tx,
            cancel,
            background: Mutex::new(background),
        })
    }

    /// Establish read-only observation of a process's standard streams.
    pub async fn attach(&self, pid: i32) -> Result<(), EngineError> {
        source::process_observable(pid)?;
        {
            let targets = self.shared.targets.lock_or_panic();
            if targets.contains_key(&pid) {
                return Err(EngineError::Config(format!("pid {pid} already attached")));
            }
        }

        let config = &self.shared.config;
        let mut streams = Vec::new();
        let mut trace_notice = false;
        for kind in StreamKind::ALL {
            let mut proc_reader = ProcReader::new(pid, kind);
            let source: Box<dyn CaptureSource> = match proc_reader.open() {
                Ok(()) if proc_reader.is_pty() && config.strace_fallback_enabled => {
                    proc_reader.close();
                    let mut tracer = TraceReader::new(
                        pid,
                        kind,
                        config.trace_event_rate_cap,
                        config.trace_signal_events,
                    );
                    tracer.open()?;
                    trace_notice = true;
                    Box::new(tracer)
                }
                Ok(()) => Box::new(proc_reader),
                Err(EngineError::Permission { .. }) if kind == StreamKind::Stdin => {
                    // stdin is frequently closed or redirected; capture the
                    // output streams regardless.
                    debug!(pid, "stdin not observable, skipping stream");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let method = source.method();
            let ring = RingBuffer::new(config.ring_capacity, &config.delimiter);
            ring.set_scan_interval(config.scan_interval);
            streams.push(Arc::new(StreamState {
                pid,
                kind,
                ring,
                source: Mutex::new(source),
                method,
                counters: Mutex::new(CaptureCounters::default()),
                eof: AtomicBool::new(false),
                last_error_report: Mutex::new(None),
            }));
        }
        if streams.is_empty() {
            return Err(EngineError::Permission {
                pid,
                reason: "no stream of the target is observable".to_string(),
            });
        }

        let name = std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| format!("pid-{pid}"));

        let target = Arc::new(Target {
            pid,
            name: name.clone(),
            streams,
            cancel: self.cancel.child_token(),
            tasks: Mutex::new(Vec::new()),
        });
        self.shared
            .targets
            .lock_or_panic()
            .insert(pid, Arc::clone(&target));

        self.shared.pipeline.publish(Record::start(pid, &name)).await;
        if trace_notice {
            // One-shot limitation notice: a tracer only sees syscalls made
            // after it attached.
            self.shared
                .pipeline
                .publish(Record::event(
                    pid,
                    "stdout",
                    "out",
                    0,
                    "capture via syscall tracer: initial output prior to attach not recoverable"
                        .to_string(),
                ))
                .await;
        }

        let mut tasks = target.tasks.lock_or_panic();
        for stream in &target.streams {
            tasks.push(spawn_source_task(
                Arc::clone(&self.shared),
                Arc::clone(stream),
                target.cancel.clone(),
            ));
        }
        tasks.push(spawn_pump_task(
            Arc::clone(&self.shared),
            Arc::clone(&target),
        ));
        drop(tasks);
        info!(pid, target = name.as_str(), "attached");
        Ok(())
    }

    /// Tear down observation of a target, draining buffered data through
    /// one final dissection pass.
    pub async fn detach(&self, pid: i32) -> Result<(), EngineError> {
        let target = self
            .shared
            .targets
            .lock_or_panic()
            .remove(&pid)
            .ok_or_else(|| EngineError::Config(format!("pid {pid} is not attached")))?;
        self.shared.teardown_target(&target, "user").await;
        Ok(())
    }

    /// One manual scan pass over a target's streams, outside the scheduler.
    /// Primarily an observability/testing hook; the pump task does this on
    /// its own timer.
    pub async fn capture_streams(&self, pid: i32) -> Result<(), EngineError> {
        let target = {
            let targets = self.shared.targets.lock_or_panic();
            targets
                .get(&pid)
                .map(Arc::clone)
                .ok_or_else(|| EngineError::Config(format!("pid {pid} is not attached")))?
        };
        for stream in &target.streams {
            poll_source(&self.shared, stream);
            pump_stream(&self.shared, stream).await;
        }
        Ok(())
    }

    /// Per-stream ring statistics for an attached target.
    pub fn buffer_stats(&self, pid: i32) -> Option<BTreeMap<String, BufferStats>> {
        let targets = self.shared.targets.lock_or_panic();
        let target = targets.get(&pid)?;
        Some(
            target
                .streams
                .iter()
                .map(|s| (s.kind.as_str().to_string(), s.ring.stats()))
                .collect(),
        )
    }

    pub fn attached_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.shared.targets.lock_or_panic().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// The full record stream, every target included. Filter by
    /// `Record::pid` for per-target consumption.
    pub fn events(&self) -> broadcast::Receiver<Record> {
        self.events_tx.subscribe()
    }

    /// A per-target record stream backed by a filtering task.
    pub fn events_for(&self, pid: i32) -> tokio::sync::mpsc::Receiver<Record> {
        let (tx, rx) = tokio::sync::mpsc::channel(self.shared.config.queue_capacity);
        let mut all = self.events_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match all.recv().await {
                    Ok(record) if record.pid() == pid => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Orderly shutdown: stop scheduling, drain every ring through a final
    /// dissection pass, finish session checks, flush sinks bounded by the
    /// configured timeout.
    pub async fn shutdown(self) {
        let targets: Vec<Arc<Target>> = {
            let mut map = self.shared.targets.lock_or_panic();
            map.drain().map(|(_, t)| t).collect()
        };
        for target in targets {
            self.shared.teardown_target(&target, "user").await;
        }
        self.cancel.cancel();
        let background = {
            let mut tasks = self.background.lock_or_panic();
            std::mem::take(&mut *tasks)
        };
        for task in background {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        self.shared.pipeline.drain_sessions().await;
        self.shared.pipeline.shutdown_bus().await;
    }
}

impl EngineShared {
    async fn emit_stats(&self) {
        let targets: Vec<Arc<Target>> = {
            let map = self.targets.lock_or_panic();
            map.values().map(Arc::clone).collect()
        };
        for target in targets {
            let mut buffers = BTreeMap::new();
            let mut capture = CaptureStats::default();
            let mut any_trace = false;
            for stream in &target.streams {
                buffers.insert(stream.kind.as_str().to_string(), stream.ring.stats());
                let counters = stream.counters.lock_or_panic();
                capture.attempts += counters.attempts;
                capture.successful += counters.successful;
                capture.bytes += counters.bytes;
                capture.dropped += stream.ring.stats().dropped;
                if stream.method == "trace" {
                    any_trace = true;
                }
            }
            capture.method = if any_trace { "trace" } else { "proc" }.to_string();
            let sinks = self.pipeline.bus().stats();
            self.pipeline
                .publish(Record::stats(target.pid, buffers, capture, sinks))
                .await;
        }
        for (protocol, count) in self.pipeline.format_error_counts() {
            debug!(protocol, count, "malformed records so far");
        }
    }

    /// Cancel a target's tasks, drain its rings through dissection, release
    /// dissector state, and emit the terminal record.
    async fn teardown_target(&self, target: &Target, reason: &str) {
        target.cancel.cancel();
        let tasks = {
            let mut tasks = target.tasks.lock_or_panic();
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        for stream in &target.streams {
            poll_source(self, stream);
            pump_stream(self, stream).await;
            // Whatever remains is a trailing partial record; push it through
            // dissection rather than dropping it.
            let tail = stream.ring.drain_all();
            if !tail.is_empty() {
                self.pipeline.process_record(stream.ctx(), &tail).await;
            }
            self.pipeline.forget_stream(&stream.ctx());
            stream.source.lock_or_panic().close();
        }
        self.pipeline.publish(Record::stop(target.pid, reason)).await;
        info!(pid = target.pid, reason, "detached");
    }
}

/// Drain whatever the source has ready into the ring. Returns false once
/// the source reports end-of-stream.
fn poll_source(shared: &EngineShared, stream: &StreamState) -> bool {
    let mut source = stream.source.lock_or_panic();
    let mut chunk = vec![0u8; shared.config.chunk_size];
    let mut counters = stream.counters.lock_or_panic();
    loop {
        counters.attempts += 1;
        match source.read_chunk(&mut chunk) {
            Ok(ReadOutcome::Data(n)) => {
                counters.successful += 1;
                counters.bytes += n as u64;
                stream.ring.write(&chunk[..n]);
            }
            Ok(ReadOutcome::Empty) => return true,
            Ok(ReadOutcome::Eof) => {
                stream.eof.store(true, Ordering::Relaxed);
                return false;
            }
            Err(e) => {
                // Transient by taxonomy; reported at most once a minute per
                // stream, and never fatal to the other streams.
                let mut last = stream.last_error_report.lock_or_panic();
                let due = last
                    .map(|at| at.elapsed() >= Duration::from_secs(60))
                    .unwrap_or(true);
                if due {
                    *last = Some(std::time::Instant::now());
                    debug!(pid = stream.pid, stream = stream.kind.as_str(), error = %e, "read error");
                }
                return true;
            }
        }
    }
}

/// Move delimited records (or raw runs for binary-mode streams) from the
/// ring into the pipeline.
async fn pump_stream(shared: &EngineShared, stream: &StreamState) {
    let ctx = stream.ctx();
    let pipeline = &shared.pipeline;

    if pipeline.registry.wants_raw(&ctx).is_some() {
        let bytes = stream.ring.drain_all();
        if !bytes.is_empty() {
            pipeline.process_record(ctx, &bytes).await;
        }
        return;
    }

    // A fresh binary protocol claims the stream from its first bytes, before
    // any delimiter splitting can corrupt the framing.
    let window = stream.ring.peek(libdd_stream_dissect::IDENTIFY_WINDOW);
    if !window.is_empty() {
        let classification = pipeline.registry.classify(&window);
        if classification.dissector.protocol() == libdd_stream_common::Protocol::Grpc
            && classification.confidence >= shared.config.identify_confidence_threshold
        {
            let bytes = stream.ring.drain_all();
            if !bytes.is_empty() {
                pipeline.process_record(ctx, &bytes).await;
            }
            return;
        }
    }

    let records = stream.ring.read_delimited();
    let mut iter = records.into_iter();
    while let Some(record) = iter.next() {
        pipeline.process_record(ctx, &record).await;
        if pipeline.registry.wants_raw(&ctx).is_some() {
            // The stream switched to binary mid-batch; hand the remainder
            // over unsplit, delimiters restored.
            let mut tail = Vec::new();
            for rest in iter {
                tail.extend_from_slice(&rest);
                tail.extend_from_slice(&shared.config.delimiter);
            }
            tail.extend_from_slice(&stream.ring.drain_all());
            if !tail.is_empty() {
                pipeline.process_record(ctx, &tail).await;
            }
            break;
        }
    }
}

fn spawn_source_task(
    shared: Arc<EngineShared>,
    stream: Arc<StreamState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let min = shared.config.scan_interval_min;
        let max = shared.config.scan_interval_max;
        let mut interval = shared.config.scan_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
            if !poll_source(&shared, &stream) {
                break;
            }
            interval = sched::next_interval(stream.ring.write_rate_bps(), min, max);
            stream.ring.set_scan_interval(interval);
        }
    })
}

fn spawn_pump_task(shared: Arc<EngineShared>, target: Arc<Target>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let min = shared.config.scan_interval_min;
        let max = shared.config.scan_interval_max;
        let mut interval = shared.config.scan_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = target.cancel.cancelled() => return,
            }
            for stream in &target.streams {
                pump_stream(&shared, stream).await;
            }

            let all_eof = target
                .streams
                .iter()
                .all(|s| s.eof.load(Ordering::Relaxed));
            if all_eof || !source::process_alive(target.pid) {
                // The target went away. Teardown joins this very task, so it
                // runs detached while the pump returns.
                let removed = {
                    let mut targets = shared.targets.lock_or_panic();
                    targets.remove(&target.pid)
                };
                match removed {
                    Some(removed) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            shared.teardown_target(&removed, "process_exit").await;
                        });
                    }
                    None => warn!(pid = target.pid, "target vanished during detach"),
                }
                return;
            }

            // The pump follows the hottest stream within the configured
            // bounds; per-stream sources adapt on their own.
            let hottest = target
                .streams
                .iter()
                .map(|s| s.ring.write_rate_bps())
                .fold(0.0f64, f64::max);
            interval = sched::next_interval(hottest, min, max);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            scan_interval_min: Duration::from_millis(5),
            scan_interval: Duration::from_millis(10),
            scan_interval_max: Duration::from_millis(50),
            stats_interval: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            ring_capacity: 0,
            ..Default::default()
        };
        let err = CaptureEngine::new(config).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_attach_unobservable_pid_fails_fast() {
        let engine = CaptureEngine::new(test_config()).await.unwrap();
        let err = engine.attach(9_999_999).await.unwrap_err();
        assert!(matches!(err, EngineError::Permission { .. }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_detach_unknown_pid_is_error() {
        let engine = CaptureEngine::new(test_config()).await.unwrap();
        assert!(engine.detach(12345).await.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    #[cfg_attr(not(target_os = "linux"), ignore)]
    async fn test_attach_child_process_emits_start_and_stop() {
        let engine = CaptureEngine::new(test_config()).await.unwrap();
        let mut events = engine.events();

        // A target that lives long enough to attach, then exits.
        let mut child = tokio::process::Command::new("sleep")
            .arg("0.3")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;

        engine.attach(pid).await.unwrap();
        assert_eq!(engine.attached_pids(), vec![pid]);
        assert!(engine.buffer_stats(pid).is_some());

        let start = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(start.kind(), libdd_stream_events::RecordKind::Start);
        assert_eq!(start.pid(), pid);

        let _ = child.wait().await;
        // The pump notices the exit and emits a terminal stop record.
        let stop = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(record) = events.recv().await {
                    if record.kind() == libdd_stream_events::RecordKind::Stop {
                        return record;
                    }
                }
            }
        })
        .await
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&stop.to_json_line()).unwrap();
        assert_eq!(v["reason"], "process_exit");
        assert!(engine.attached_pids().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_double_attach_rejected() {
        let engine = CaptureEngine::new(test_config()).await.unwrap();
        let pid = std::process::id() as i32;
        if engine.attach(pid).await.is_ok() {
            assert!(engine.attach(pid).await.is_err());
            engine.detach(pid).await.unwrap();
        }
        engine.shutdown().await;
    }
}
