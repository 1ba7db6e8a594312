//! Mesh adapter — peer-to-peer state replication between sidecar nodes.
//!
//! Carries three replicated concerns over a [`transport::MeshTransport`]:
//! the shared tool-call counter, runtime configuration (version-vector
//! gossip), and a small shared state blob. Outbound traffic is batched,
//! rate-limited under backpressure, optionally compressed, and retried with
//! full jitter when flagged idempotent. Heartbeat pacing adapts to observed
//! health.
//!
//! Task layout (one purpose per loop): inbound event loop, egress writer,
//! heartbeat emitter, batch ticker, optional queue processor, config-event
//! listener. Shutdown flips a watch flag; every loop quiesces within one
//! tick.

pub mod batch;
pub mod bucket;
pub mod heartbeat;
pub mod retry;
pub mod transport;
pub mod wire;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigRegistry;
use crate::counter::{CounterUpdate, GlobalCounter, QuotaExceeded, ToolGate};
use crate::envelope::now_ms;
use crate::events::{EventBus, FabricEvent};
use crate::metrics::{MeshMetrics, MetricsSnapshot};
use crate::sync::ConfigReplicator;

use self::batch::BatchCoalescer;
use self::bucket::{priority_for, PriorityQueue, PushOutcome, TokenBucket, PRIORITY_HEARTBEAT};
use self::heartbeat::AdaptiveHeartbeat;
use self::retry::{RetryManager, RetrySettings};
use self::transport::MeshTransport;
use self::wire::{decode_frame, encode_frame, FrameBody, SharedState, WireFrame};

// ─── Capability seams ─────────────────────────────────────────────────────────
//
// The auto-tuner and the config listener reconfigure live components through
// these methods rather than poking fields.

pub trait ConfigureBatch {
    fn configure_batch(&self, size_limit: Option<usize>, time_limit: Option<Duration>);
}

pub trait ConfigureHeartbeat {
    fn configure_heartbeat(&self, interval: Option<Duration>);
}

pub trait ConfigureTokenBucket {
    fn configure_token_bucket(&self, rate: Option<f64>, capacity: Option<f64>);
}

/// An application message received from a peer.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub source_id: String,
    pub payload: Value,
}

/// Point-in-time adapter status for diagnostics.
#[derive(Debug, Clone)]
pub struct AdapterStatus {
    pub node_id: String,
    pub connected: bool,
    pub peers: Vec<String>,
    pub queue_length: usize,
    pub batch_length: usize,
    pub in_flight_retries: usize,
    pub heartbeat_interval: Duration,
    pub bucket_tokens: f64,
    pub bucket_rate: f64,
    pub metrics: MetricsSnapshot,
}

pub struct MeshAdapter {
    /// Handle back to our own `Arc` so `&self` methods can spawn tasks.
    weak_self: std::sync::Weak<MeshAdapter>,
    node_id: String,
    transport: Arc<dyn MeshTransport>,
    config: Arc<ConfigRegistry>,
    events: EventBus,
    metrics: Arc<MeshMetrics>,
    counter: Arc<GlobalCounter>,
    replicator: Arc<ConfigReplicator>,

    connected: AtomicBool,
    peers: Mutex<HashMap<String, Instant>>,
    heartbeat: Mutex<AdaptiveHeartbeat>,
    bucket: Mutex<TokenBucket>,
    queue: Mutex<PriorityQueue<WireFrame>>,
    batch: Mutex<BatchCoalescer>,
    batch_limits: Mutex<(usize, Duration)>,
    retries: RetryManager,
    shared_state: Mutex<SharedState>,

    /// Direct egress path: encode + transport send. Resends and acks also
    /// land here, bypassing the backpressure queue.
    egress_tx: mpsc::UnboundedSender<WireFrame>,
    egress_rx: Mutex<Option<mpsc::UnboundedReceiver<WireFrame>>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<IncomingMessage>>>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    queue_task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshAdapter {
    pub fn new(
        node_id: impl Into<String>,
        transport: Arc<dyn MeshTransport>,
        config: Arc<ConfigRegistry>,
        counter: Arc<GlobalCounter>,
        events: EventBus,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let mesh = config.mesh();
        let metrics = Arc::new(MeshMetrics::new());
        let replicator = Arc::new(ConfigReplicator::new(
            node_id.clone(),
            Arc::clone(&config),
            events.clone(),
        ));
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            heartbeat: Mutex::new(AdaptiveHeartbeat::new(
                Duration::from_secs_f64(mesh.initial_heartbeat_interval_s),
                Duration::from_secs_f64(mesh.min_heartbeat_interval_s),
                Duration::from_secs_f64(mesh.max_heartbeat_interval_s),
                mesh.heartbeat_success_threshold,
                mesh.heartbeat_failure_threshold,
            )),
            bucket: Mutex::new(TokenBucket::new(mesh.token_rate, mesh.token_capacity)),
            queue: Mutex::new(PriorityQueue::new(mesh.max_queue_length)),
            batch: Mutex::new(BatchCoalescer::new()),
            batch_limits: Mutex::new((
                mesh.batch_size_limit,
                Duration::from_millis(mesh.batch_time_limit_ms),
            )),
            retries: RetryManager::new(Arc::clone(&metrics)),
            shared_state: Mutex::new(SharedState::default()),
            connected: AtomicBool::new(true),
            peers: Mutex::new(HashMap::new()),
            node_id,
            transport,
            config,
            events,
            metrics,
            counter,
            replicator,
            egress_tx,
            egress_rx: Mutex::new(Some(egress_rx)),
            incoming_tx: Mutex::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            queue_task: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn counter(&self) -> &Arc<GlobalCounter> {
        &self.counter
    }

    pub fn replicator(&self) -> &Arc<ConfigReplicator> {
        &self.replicator
    }

    pub fn metrics(&self) -> &Arc<MeshMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Arc<ConfigRegistry> {
        &self.config
    }

    /// Receive application messages from peers. Replaces any previous
    /// subscription.
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<IncomingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.incoming_tx.lock().expect("incoming lock poisoned") = Some(tx);
        rx
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    fn strong(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("adapter still alive")
    }

    /// Spawn the background loops. Idempotent; call once after construction.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        if !tasks.is_empty() {
            return;
        }
        let shutdown = self.shutdown_tx.subscribe();

        if let Some(egress_rx) = self.egress_rx.lock().expect("egress lock poisoned").take() {
            tasks.push(tokio::spawn(
                self.strong().egress_loop(egress_rx, shutdown.clone()),
            ));
        }
        tasks.push(tokio::spawn(self.strong().inbound_loop(shutdown.clone())));
        tasks.push(tokio::spawn(self.strong().heartbeat_loop(shutdown.clone())));
        tasks.push(tokio::spawn(self.strong().batch_loop(shutdown.clone())));
        tasks.push(tokio::spawn(self.strong().config_listener_loop(shutdown)));
        drop(tasks);

        if self.config.mesh().enable_backpressure {
            self.ensure_queue_processor();
        }
        info!(node = %self.node_id, "mesh adapter started");
    }

    /// Stop every background loop and cancel outstanding retries.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.retries.cancel_all();

        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        if let Some(task) = self.queue_task.lock().expect("queue task lock poisoned").take() {
            task.abort();
        }
        info!(node = %self.node_id, "mesh adapter stopped");
    }

    /// Mark the node connected again, reset heartbeat pacing, and re-sync
    /// state to peers.
    pub async fn reconnect(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        let initial = Duration::from_secs_f64(self.config.mesh().initial_heartbeat_interval_s);
        self.heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
            .reset(initial);
        self.sync_state().await;
        info!(node = %self.node_id, "mesh adapter reconnected");
    }

    /// Stop emitting to peers. Inbound processing continues.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // ─── Send paths ───────────────────────────────────────────────────────────

    /// Broadcast an application message to peers.
    pub async fn broadcast(&self, payload: Value) -> bool {
        self.send_with_retry(FrameBody::Message(payload), true, None)
            .await
    }

    /// Broadcast a counter update, via the batch coalescer when batching is
    /// enabled.
    pub async fn broadcast_counter_update(&self, update: CounterUpdate) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.config.mesh().enable_batching {
            self.batch
                .lock()
                .expect("batch lock poisoned")
                .push(update);
            true
        } else {
            self.send_with_retry(FrameBody::CounterUpdate(update), true, None)
                .await
        }
    }

    /// Count one gated tool call and gossip the increment. On quota
    /// exhaustion, signals `recovery_needed` upstream and returns the error.
    pub async fn invoke_gated(&self, gate: &ToolGate) -> Result<(), QuotaExceeded> {
        match gate.begin_call() {
            Ok(update) => {
                self.broadcast_counter_update(update).await;
                Ok(())
            }
            Err(e) => {
                self.events.publish(FabricEvent::RecoveryNeeded {
                    tool: e.tool.clone(),
                });
                Err(e)
            }
        }
    }

    /// Publish a config change through the replicator and gossip it.
    pub async fn publish_config(
        &self,
        section: &str,
        parameter: &str,
        value: Value,
        priority: i32,
    ) -> bool {
        let update = self.replicator.publish(section, parameter, value, priority);
        self.send_with_retry(FrameBody::ConfigUpdate(update), true, None)
            .await
    }

    /// Push our shared state blob to peers (larger timestamp wins remotely).
    pub async fn sync_state(&self) -> bool {
        let state = {
            let mut state = self.shared_state.lock().expect("state lock poisoned");
            state.timestamp = now_ms();
            state.clone()
        };
        self.send_with_retry(FrameBody::StateSync(state), true, None)
            .await
    }

    pub fn shared_state(&self) -> SharedState {
        self.shared_state
            .lock()
            .expect("state lock poisoned")
            .clone()
    }

    pub fn update_cursor(&self, position: i64, last_msg_id: Option<String>) {
        let mut state = self.shared_state.lock().expect("state lock poisoned");
        state.cursor_position = position;
        state.last_msg_id = last_msg_id;
        state.timestamp = now_ms();
    }

    /// Core send path: build the frame, register its retry task, and either
    /// queue it (backpressure) or hand it straight to egress.
    pub async fn send_with_retry(
        &self,
        body: FrameBody,
        idempotent: bool,
        priority: Option<i32>,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        let frame = WireFrame::new(&self.node_id, idempotent, body);
        let priority = priority.unwrap_or_else(|| priority_for(frame.kind()));
        let mesh = self.config.mesh();

        if mesh.enable_retries && idempotent {
            let settings = RetrySettings::from_config(&mesh, &self.metrics.snapshot());
            self.retries
                .track(frame.clone(), settings, self.egress_tx.clone());
        }

        if mesh.enable_backpressure {
            let outcome = self
                .queue
                .lock()
                .expect("queue lock poisoned")
                .push(priority, frame);
            match outcome {
                PushOutcome::Queued => true,
                PushOutcome::Evicted(evicted) => {
                    warn!(
                        kind = evicted.kind(),
                        "queue full — evicted lower-priority frame"
                    );
                    self.retries.ack(&evicted.message_id);
                    true
                }
                PushOutcome::Rejected(rejected) => {
                    warn!(
                        kind = rejected.kind(),
                        "queue full of higher-priority frames — dropping send"
                    );
                    self.retries.ack(&rejected.message_id);
                    false
                }
            }
        } else {
            self.egress_tx.send(frame).is_ok()
        }
    }

    // ─── Background loops ─────────────────────────────────────────────────────

    async fn egress_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WireFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { return };
                    self.transmit(frame).await;
                }
            }
        }
    }

    async fn transmit(&self, frame: WireFrame) {
        let mesh = self.config.mesh();
        let encoded = match encode_frame(&frame, mesh.enable_compression, mesh.compression_threshold)
        {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(err = %e, "frame encode failed — dropping");
                return;
            }
        };
        if let Some((original, compressed)) = encoded.compression {
            self.metrics.record_compression(original, compressed);
        }

        let started = Instant::now();
        match self.transport.send(encoded.text).await {
            Ok(()) => {
                self.metrics
                    .record_send_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
            }
            Err(e) => {
                warn!(err = %e, kind = frame.kind(), "mesh send failed");
                self.note_failure();
            }
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.transport.subscribe();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                frame = rx.recv() => {
                    match frame {
                        Ok(text) => {
                            let started = Instant::now();
                            self.handle_frame(&text).await;
                            self.metrics
                                .record_process_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "mesh inbound lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(err = %e, "undecodable mesh frame — ignoring");
                self.note_failure();
                return;
            }
        };
        if frame.source_id == self.node_id {
            return; // own loopback copy
        }

        // Idempotent frames are acknowledged so the sender can stop retrying.
        if frame.idempotent {
            let ack = WireFrame::ack_for(&self.node_id, &frame.message_id);
            let _ = self.egress_tx.send(ack);
        }

        match frame.body {
            FrameBody::Ack { message_id } => {
                self.retries.ack(&message_id);
            }
            FrameBody::Message(payload) => {
                let incoming = self.incoming_tx.lock().expect("incoming lock poisoned");
                if let Some(tx) = incoming.as_ref() {
                    let _ = tx.send(IncomingMessage {
                        source_id: frame.source_id,
                        payload,
                    });
                }
            }
            FrameBody::CounterUpdate(update) => {
                self.counter.apply(&update);
            }
            FrameBody::ConfigUpdate(update) => {
                self.replicator.absorb(update);
            }
            FrameBody::StateSync(remote) => {
                let mut state = self.shared_state.lock().expect("state lock poisoned");
                if remote.timestamp > state.timestamp {
                    *state = remote;
                }
            }
            FrameBody::Heartbeat { .. } => {
                self.note_peer_heartbeat(&frame.source_id);
            }
        }
    }

    fn note_peer_heartbeat(&self, peer: &str) {
        let now = Instant::now();
        {
            let mut peers = self.peers.lock().expect("peer lock poisoned");
            if let Some(previous) = peers.insert(peer.to_string(), now) {
                self.metrics
                    .record_heartbeat_interval_s(now.duration_since(previous).as_secs_f64());
            }
        }
        self.replicator.observe_peer(peer);
        if self.config.mesh().enable_adaptive_heartbeat {
            if let Some(interval) = self
                .heartbeat
                .lock()
                .expect("heartbeat lock poisoned")
                .on_success()
            {
                debug!(interval_ms = interval.as_millis(), "heartbeat widened");
            }
        }
    }

    fn note_failure(&self) {
        if self.config.mesh().enable_adaptive_heartbeat {
            if let Some(interval) = self
                .heartbeat
                .lock()
                .expect("heartbeat lock poisoned")
                .on_failure()
            {
                debug!(interval_ms = interval.as_millis(), "heartbeat tightened");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.current_heartbeat_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if self.is_connected() {
                let sent = self
                    .send_with_retry(
                        FrameBody::Heartbeat { timestamp: now_ms() },
                        true,
                        Some(PRIORITY_HEARTBEAT),
                    )
                    .await;
                if !sent {
                    self.note_failure();
                }
            }
            self.replicator.update_coordinator_status(interval);
        }
    }

    fn current_heartbeat_interval(&self) -> Duration {
        let mesh = self.config.mesh();
        if mesh.enable_adaptive_heartbeat {
            self.heartbeat
                .lock()
                .expect("heartbeat lock poisoned")
                .interval()
        } else {
            Duration::from_secs_f64(mesh.initial_heartbeat_interval_s)
        }
    }

    async fn batch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            let (size_limit, time_limit) =
                *self.batch_limits.lock().expect("batch limits lock poisoned");
            let ready = self
                .batch
                .lock()
                .expect("batch lock poisoned")
                .drain_ready(size_limit, time_limit);
            if let Some(merged) = ready {
                for update in merged {
                    self.send_with_retry(FrameBody::CounterUpdate(update), true, None)
                        .await;
                }
            }
        }
    }

    /// Start the queue processor if it is not already running. Idempotent —
    /// the enable flag may be flipped repeatedly by the tuner.
    pub fn ensure_queue_processor(&self) {
        let mut slot = self.queue_task.lock().expect("queue task lock poisoned");
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shutdown = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(self.strong().queue_loop(shutdown)));
    }

    async fn queue_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let (frame, len) = {
                let mut queue = self.queue.lock().expect("queue lock poisoned");
                (queue.pop(), queue.len())
            };
            match frame {
                Some(frame) => {
                    self.metrics.record_queue_length(len + 1);
                    let wait = self
                        .bucket
                        .lock()
                        .expect("bucket lock poisoned")
                        .acquire(1.0);
                    if !wait.is_zero() {
                        self.metrics
                            .record_backpressure_wait_ms(wait.as_secs_f64() * 1000.0);
                        tokio::time::sleep(wait).await;
                    }
                    let _ = self.egress_tx.send(frame);
                }
                None => {
                    // Drained. If backpressure was turned off, let the task end.
                    if !self.config.mesh().enable_backpressure {
                        debug!("backpressure disabled and queue drained — queue processor exiting");
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// React to replicated config changes that need more than a snapshot
    /// re-read: live component knobs and the queue-processor task.
    async fn config_listener_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.events.subscribe();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                event = rx.recv() => {
                    match event {
                        Ok(FabricEvent::ConfigUpdated { section, parameter, new_value, .. })
                            if section == "mesh" =>
                        {
                            self.apply_mesh_parameter(&parameter, &new_value);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "config listener lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    fn apply_mesh_parameter(&self, parameter: &str, value: &Value) {
        match parameter {
            "enable_backpressure" => {
                if value.as_bool() == Some(true) {
                    self.ensure_queue_processor();
                }
                // Disabling needs no action: sends stop queueing immediately
                // and the processor exits once drained.
            }
            "token_rate" => self.configure_token_bucket(value.as_f64(), None),
            "token_capacity" => self.configure_token_bucket(None, value.as_f64()),
            "batch_size_limit" => {
                self.configure_batch(value.as_u64().map(|v| v as usize), None);
            }
            "batch_time_limit_ms" => {
                self.configure_batch(None, value.as_u64().map(Duration::from_millis));
            }
            "max_queue_length" => {
                if let Some(len) = value.as_u64() {
                    self.queue
                        .lock()
                        .expect("queue lock poisoned")
                        .set_max_len(len as usize);
                }
            }
            "initial_heartbeat_interval_s" => {
                self.configure_heartbeat(value.as_f64().map(Duration::from_secs_f64));
            }
            // Everything else is read from the config snapshot at use.
            _ => {}
        }
    }

    // ─── Status ───────────────────────────────────────────────────────────────

    pub fn active_peer_ids(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("peer lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn status(&self) -> AdapterStatus {
        let bucket = self.bucket.lock().expect("bucket lock poisoned");
        AdapterStatus {
            node_id: self.node_id.clone(),
            connected: self.is_connected(),
            peers: self.active_peer_ids(),
            queue_length: self.queue.lock().expect("queue lock poisoned").len(),
            batch_length: self.batch.lock().expect("batch lock poisoned").len(),
            in_flight_retries: self.retries.in_flight_count(),
            heartbeat_interval: self
                .heartbeat
                .lock()
                .expect("heartbeat lock poisoned")
                .interval(),
            bucket_tokens: bucket.tokens(),
            bucket_rate: bucket.rate(),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl ConfigureBatch for MeshAdapter {
    fn configure_batch(&self, size_limit: Option<usize>, time_limit: Option<Duration>) {
        let mut limits = self.batch_limits.lock().expect("batch limits lock poisoned");
        if let Some(size) = size_limit {
            limits.0 = size.max(1);
        }
        if let Some(time) = time_limit {
            limits.1 = time.max(Duration::from_millis(10));
        }
    }
}

impl ConfigureHeartbeat for MeshAdapter {
    fn configure_heartbeat(&self, interval: Option<Duration>) {
        if let Some(interval) = interval {
            self.heartbeat
                .lock()
                .expect("heartbeat lock poisoned")
                .reset(interval);
        }
    }
}

impl ConfigureTokenBucket for MeshAdapter {
    fn configure_token_bucket(&self, rate: Option<f64>, capacity: Option<f64>) {
        let mut bucket = self.bucket.lock().expect("bucket lock poisoned");
        if let Some(rate) = rate {
            bucket.set_rate(rate);
        }
        if let Some(capacity) = capacity {
            bucket.set_capacity(capacity);
        }
    }
}
