// Adaptive broadcast loop
//
// Successful results become frames. Frames wait in a bounded FIFO and are
// drained at a rate that adapts to how far behind subscribers are:
// - backlog above the threshold halves the rate (floor at min_fps)
// - backlog below it adds one frame per second (up to max_fps)
//
// Decision: Subscribers are fed with try_send; a full buffer skips that subscriber for the frame
// Decision: Frames are encoded once and shared between subscribers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use genrelay_core::{scopes, JobId, Principal};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::metrics::GatewayMetrics;

/// Broadcast loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    pub min_fps: u32,
    pub max_fps: u32,
    /// Summed subscriber backlog above which the rate backs off
    pub backlog_threshold_bytes: usize,
    pub queue_capacity: usize,
    /// Frames buffered per subscriber before it is skipped
    pub subscriber_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            min_fps: 1,
            max_fps: 10,
            backlog_threshold_bytes: 1024 * 1024,
            queue_capacity: 1000,
            subscriber_buffer: 64,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid broadcast configuration: {0}")]
pub struct InvalidBroadcastConfig(String);

impl BroadcastConfig {
    pub fn with_fps_range(mut self, min_fps: u32, max_fps: u32) -> Self {
        self.min_fps = min_fps;
        self.max_fps = max_fps;
        self
    }

    pub fn with_backlog_threshold(mut self, bytes: usize) -> Self {
        self.backlog_threshold_bytes = bytes;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_subscriber_buffer(mut self, frames: usize) -> Self {
        self.subscriber_buffer = frames;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidBroadcastConfig> {
        if self.min_fps == 0 {
            return Err(InvalidBroadcastConfig("min_fps must be at least 1".into()));
        }
        if self.max_fps < self.min_fps {
            return Err(InvalidBroadcastConfig(format!(
                "max_fps ({}) must be >= min_fps ({})",
                self.max_fps, self.min_fps
            )));
        }
        if self.queue_capacity == 0 || self.subscriber_buffer == 0 {
            return Err(InvalidBroadcastConfig(
                "queue_capacity and subscriber_buffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A successful result on its way to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub job_id: JobId,
    pub sequence: u64,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct FrameEvent<'a> {
    event: &'static str,
    #[serde(flatten)]
    frame: &'a Frame,
}

impl Frame {
    /// Socket text for `{event: "frame", ...}`
    pub fn to_event_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&FrameEvent {
            event: "frame",
            frame: self,
        })
    }
}

/// Frame rate clamped to `[min, max]`
#[derive(Debug, Clone)]
pub struct FrameRateController {
    fps: u32,
    min: u32,
    max: u32,
}

impl FrameRateController {
    /// Starts at the maximum rate
    pub fn new(min: u32, max: u32) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self { fps: max, min, max }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn adjust(&mut self, backlog_bytes: usize, threshold: usize) -> u32 {
        if backlog_bytes > threshold {
            self.fps = (self.fps / 2).max(self.min);
        } else if backlog_bytes < threshold && self.fps < self.max {
            self.fps += 1;
        }
        self.fps
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps))
    }
}

/// Bounded FIFO that drops from the head
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a frame; returns how many old frames were dropped
    pub fn push(&mut self, frame: Frame) -> u64 {
        self.frames.push_back(frame);
        self.trim()
    }

    /// Drop from the head until the queue is within its bound
    pub fn trim(&mut self) -> u64 {
        let mut dropped = 0;
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

struct Subscriber {
    id: u64,
    principal: Principal,
    tx: mpsc::Sender<Arc<str>>,
    buffered: Arc<AtomicUsize>,
}

/// Receiving end of a subscriber's frame buffer
pub struct FrameSubscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    buffered: Arc<AtomicUsize>,
}

impl FrameSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    /// Mark a received frame as written to the client
    pub fn complete(&self, bytes: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(bytes))
            });
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Connected frame subscribers
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl SubscriberRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Dropping the returned subscription unregisters it on the next emit
    pub fn register(&self, principal: &Principal) -> FrameSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let buffered = Arc::new(AtomicUsize::new(0));

        self.subscribers.lock().push(Subscriber {
            id,
            principal: principal.clone(),
            tx,
            buffered: Arc::clone(&buffered),
        });

        FrameSubscription { id, rx, buffered }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Bytes emitted but not yet written out, over all subscribers
    pub fn backlog_bytes(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .map(|s| s.buffered.load(Ordering::Acquire))
            .sum()
    }

    /// Offer one encoded frame to every authorized subscriber without waiting
    pub fn emit(&self, text: Arc<str>) -> EmitReport {
        let mut report = EmitReport::default();
        let mut subscribers = self.subscribers.lock();

        subscribers.retain(|subscriber| {
            if !subscriber.principal.has_scope(scopes::FRAMES_READ) {
                return !subscriber.tx.is_closed();
            }
            match subscriber.tx.try_send(Arc::clone(&text)) {
                Ok(()) => {
                    subscriber.buffered.fetch_add(text.len(), Ordering::AcqRel);
                    report.delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(subscriber = subscriber.id, "Skipping slow subscriber");
                    report.skipped += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.removed += 1;
                    false
                }
            }
        });

        report
    }
}

/// What one broadcast cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub fps: u32,
    pub backlog_bytes: usize,
    pub queue_depth: usize,
    pub emitted: Option<EmitReport>,
}

/// Broadcast state for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastState {
    pub fps: u32,
    pub queue_depth: usize,
    pub subscribers: usize,
}

/// Frame queue, subscribers and the adaptive rate, shared by producers and the loop
pub struct Broadcaster {
    config: BroadcastConfig,
    queue: Mutex<FrameQueue>,
    subscribers: SubscriberRegistry,
    rate: Mutex<FrameRateController>,
    sequence: AtomicU64,
    metrics: Arc<GatewayMetrics>,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            queue: Mutex::new(FrameQueue::new(config.queue_capacity)),
            subscribers: SubscriberRegistry::new(config.subscriber_buffer),
            rate: Mutex::new(FrameRateController::new(config.min_fps, config.max_fps)),
            sequence: AtomicU64::new(0),
            config,
            metrics,
        }
    }

    /// Queue a frame for a successful job
    pub fn push(&self, job_id: JobId, payload: Value) {
        let frame = Frame {
            job_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            payload,
            produced_at: Utc::now(),
        };
        let dropped = self.queue.lock().push(frame);
        self.metrics.frames_dropped("overflow", dropped);
    }

    pub fn subscribe(&self, principal: &Principal) -> FrameSubscription {
        self.subscribers.register(principal)
    }

    pub fn state(&self) -> BroadcastState {
        BroadcastState {
            fps: self.rate.lock().fps(),
            queue_depth: self.queue.lock().len(),
            subscribers: self.subscribers.len(),
        }
    }

    /// Adjust the rate, trim, then emit at most one frame
    pub fn cycle(&self) -> CycleReport {
        let backlog_bytes = self.subscribers.backlog_bytes();
        let fps = self
            .rate
            .lock()
            .adjust(backlog_bytes, self.config.backlog_threshold_bytes);

        let (frame, trimmed, queue_depth) = {
            let mut queue = self.queue.lock();
            let trimmed = queue.trim();
            let frame = queue.pop();
            (frame, trimmed, queue.len())
        };
        self.metrics.frames_dropped("overflow", trimmed);

        let emitted = frame.and_then(|frame| match frame.to_event_text() {
            Ok(text) => {
                let report = self.subscribers.emit(Arc::from(text));
                self.metrics
                    .frames_dropped("slow_subscriber", report.skipped as u64);
                Some(report)
            }
            Err(e) => {
                tracing::warn!(job_id = %frame.job_id, error = %e, "Failed to encode frame");
                None
            }
        });

        self.metrics.set_broadcast_state(queue_depth, fps);

        CycleReport {
            fps,
            backlog_bytes,
            queue_depth,
            emitted,
        }
    }

    /// Run cycles until cancelled, sleeping out the remainder of each frame interval
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            min_fps = self.config.min_fps,
            max_fps = self.config.max_fps,
            "Broadcast loop started"
        );

        loop {
            let started = Instant::now();
            let report = self.cycle();
            let interval = Duration::from_millis(1000 / u64::from(report.fps.max(1)));
            let pause = interval.saturating_sub(started.elapsed());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("Broadcast loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genrelay_core::AuthMethod;
    use serde_json::json;

    fn broadcaster(config: BroadcastConfig) -> (Broadcaster, Arc<GatewayMetrics>) {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        (Broadcaster::new(config, Arc::clone(&metrics)), metrics)
    }

    fn reader() -> Principal {
        Principal::new(
            "viewer",
            vec![scopes::FRAMES_READ.to_string()],
            AuthMethod::Jwt,
        )
    }

    #[test]
    fn test_config_validation() {
        assert!(BroadcastConfig::default().validate().is_ok());
        assert!(BroadcastConfig::default()
            .with_fps_range(0, 10)
            .validate()
            .is_err());
        assert!(BroadcastConfig::default()
            .with_fps_range(5, 2)
            .validate()
            .is_err());
    }

    #[test]
    fn test_rate_halves_to_min_then_recovers() {
        let mut rate = FrameRateController::new(1, 10);
        let mut seen = vec![rate.fps()];
        while rate.fps() > 1 {
            seen.push(rate.adjust(500, 100));
        }
        assert_eq!(seen, vec![10, 5, 2, 1]);
        assert_eq!(rate.adjust(500, 100), 1);

        assert_eq!(rate.adjust(0, 100), 2);
        assert_eq!(rate.adjust(0, 100), 3);
        // At the threshold the rate holds
        assert_eq!(rate.adjust(100, 100), 3);
        for _ in 0..20 {
            rate.adjust(0, 100);
        }
        assert_eq!(rate.fps(), 10);
        assert_eq!(rate.interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_queue_drops_oldest() {
        let mut queue = FrameQueue::new(2);
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        let mut dropped = 0;
        for (i, id) in ids.iter().enumerate() {
            dropped += queue.push(Frame {
                job_id: *id,
                sequence: i as u64,
                payload: json!(i),
                produced_at: Utc::now(),
            });
        }

        assert_eq!(dropped, 1);
        assert_eq!(queue.pop().unwrap().job_id, ids[1]);
        assert_eq!(queue.pop().unwrap().job_id, ids[2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_is_counted() {
        let (broadcaster, metrics) =
            broadcaster(BroadcastConfig::default().with_queue_capacity(2));
        for i in 0..5 {
            broadcaster.push(JobId::new(), json!(i));
        }
        assert_eq!(broadcaster.state().queue_depth, 2);
        assert_eq!(metrics.dropped_count("overflow"), 3);
    }

    #[tokio::test]
    async fn test_cycle_emits_fifo() {
        let (broadcaster, _) = broadcaster(BroadcastConfig::default());
        let mut sub = broadcaster.subscribe(&reader());
        let first = JobId::new();
        let second = JobId::new();
        broadcaster.push(first, json!({"n": 1}));
        broadcaster.push(second, json!({"n": 2}));

        broadcaster.cycle();
        broadcaster.cycle();

        let text = sub.recv().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "frame");
        assert_eq!(value["jobId"], json!(first.to_string()));
        assert_eq!(value["sequence"], 1);

        let text = sub.recv().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["jobId"], json!(second.to_string()));
    }

    #[tokio::test]
    async fn test_unauthorized_subscriber_gets_nothing() {
        let (broadcaster, _) = broadcaster(BroadcastConfig::default());
        let generator = Principal::new(
            "svc",
            vec![scopes::GENERATE.to_string()],
            AuthMethod::ApiKey,
        );
        let mut sub = broadcaster.subscribe(&generator);
        broadcaster.push(JobId::new(), json!({}));

        let report = broadcaster.cycle();
        assert_eq!(report.emitted.unwrap().delivered, 0);
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_skipped() {
        let (broadcaster, metrics) =
            broadcaster(BroadcastConfig::default().with_subscriber_buffer(1));
        let _slow = broadcaster.subscribe(&reader());
        let mut fast = broadcaster.subscribe(&reader());

        broadcaster.push(JobId::new(), json!(1));
        broadcaster.push(JobId::new(), json!(2));

        let first = broadcaster.cycle().emitted.unwrap();
        assert_eq!(first.delivered, 2);
        let text = fast.recv().await.unwrap();
        fast.complete(text.len());

        let second = broadcaster.cycle().emitted.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(metrics.dropped_count("slow_subscriber"), 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let (broadcaster, _) = broadcaster(BroadcastConfig::default());
        let sub = broadcaster.subscribe(&reader());
        assert_eq!(broadcaster.state().subscribers, 1);
        drop(sub);

        broadcaster.push(JobId::new(), json!({}));
        let report = broadcaster.cycle().emitted.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(broadcaster.state().subscribers, 0);
    }

    #[tokio::test]
    async fn test_backlog_drives_rate_down_and_back_up() {
        let (broadcaster, _) = broadcaster(
            BroadcastConfig::default()
                .with_backlog_threshold(10)
                .with_subscriber_buffer(100),
        );
        let mut sub = broadcaster.subscribe(&reader());

        // A subscriber that never reads accumulates backlog
        let mut rates = Vec::new();
        for i in 0..6 {
            broadcaster.push(JobId::new(), json!({"i": i}));
            rates.push(broadcaster.cycle().fps);
        }
        // First cycle saw no backlog yet and the rate was already at max
        assert_eq!(rates, vec![10, 5, 2, 1, 1, 1]);
        assert!(sub.buffered_bytes() > 10);

        while let Ok(text) = sub.rx.try_recv() {
            sub.complete(text.len());
        }
        assert_eq!(sub.buffered_bytes(), 0);

        assert_eq!(broadcaster.cycle().fps, 2);
        assert_eq!(broadcaster.cycle().fps, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (broadcaster, _) = broadcaster(BroadcastConfig::default());
        let broadcaster = Arc::new(broadcaster);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&broadcaster).run(cancel.clone()));

        broadcaster.push(JobId::new(), json!({}));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(broadcaster.state().queue_depth, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
