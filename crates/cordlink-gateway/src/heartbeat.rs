//! Heartbeat supervisor
//!
//! Once Hello arrives, a dedicated task wakes every interval and either sends
//! a heartbeat or, when the peer has been silent for longer than the grace
//! window, closes the connection with [`HEARTBEAT_TIMEOUT_CLOSE`] and stops.
//!
//! ```text
//! ┌──────────────────────┐
//! │  Supervisor task     │
//! │  every interval:     │
//! │   silent > grace? ───┼──> force_close(4900), exit
//! │   else send ─────────┼──> Connection writer ──> socket
//! └──────────────────────┘
//!            ▲ stop (watch)
//! ```
//!
//! The supervisor only reaches the connection through a [`HeartbeatSink`];
//! the production sink holds a `Weak` reference so a torn-down connection is
//! never kept alive by its heartbeat.

use crate::connection::Connection;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{GatewayMessage, HEARTBEAT_TIMEOUT_CLOSE};
use crate::session::Sequence;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const NEVER: u64 = u64::MAX;

/// Shortest tick the supervisor runs with
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Lock-free heartbeat timestamps
///
/// Times are microseconds since the tracker was created. `last_received`
/// starts at creation so the first liveness check has a baseline.
pub struct HeartbeatTracker {
    epoch: Instant,
    last_sent_us: AtomicU64,
    last_received_us: AtomicU64,
    last_ack_us: AtomicU64,
    latency_us: AtomicU64,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_sent_us: AtomicU64::new(NEVER),
            last_received_us: AtomicU64::new(0),
            last_ack_us: AtomicU64::new(NEVER),
            latency_us: AtomicU64::new(NEVER),
        }
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn load(slot: &AtomicU64) -> Option<u64> {
        match slot.load(Ordering::Acquire) {
            NEVER => None,
            us => Some(us),
        }
    }

    pub fn record_sent(&self) {
        self.last_sent_us.store(self.now_us(), Ordering::Release);
    }

    /// Any inbound frame counts, not only acks
    pub fn record_received(&self) {
        self.last_received_us.store(self.now_us(), Ordering::Release);
    }

    /// Record an ack; returns the new latency if a heartbeat was sent
    pub fn record_ack(&self) -> Option<Duration> {
        let now = self.now_us();
        self.last_ack_us.store(now, Ordering::Release);
        self.last_received_us.store(now, Ordering::Release);

        let sent = Self::load(&self.last_sent_us)?;
        let latency = now.saturating_sub(sent);
        self.latency_us.store(latency, Ordering::Release);
        Some(Duration::from_micros(latency))
    }

    /// Round trip of the most recent acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        Self::load(&self.latency_us).map(Duration::from_micros)
    }

    pub fn since_received(&self) -> Duration {
        let last = self.last_received_us.load(Ordering::Acquire);
        Duration::from_micros(self.now_us().saturating_sub(last))
    }

    pub fn since_sent(&self) -> Option<Duration> {
        Self::load(&self.last_sent_us).map(|sent| Duration::from_micros(self.now_us().saturating_sub(sent)))
    }

    pub fn since_ack(&self) -> Option<Duration> {
        Self::load(&self.last_ack_us).map(|ack| Duration::from_micros(self.now_us().saturating_sub(ack)))
    }
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound side of the supervisor
#[async_trait]
pub trait HeartbeatSink: Send + Sync + 'static {
    async fn send_heartbeat(&self) -> GatewayResult<()>;

    /// Close the connection; called at most once, then the supervisor exits
    async fn force_close(&self, code: u16);
}

/// Sink writing through a gateway [`Connection`]
pub struct ConnectionHeartbeat {
    connection: Weak<Connection>,
    sequence: Sequence,
}

impl ConnectionHeartbeat {
    pub fn new(connection: &Arc<Connection>, sequence: Sequence) -> Self {
        Self {
            connection: Arc::downgrade(connection),
            sequence,
        }
    }
}

#[async_trait]
impl HeartbeatSink for ConnectionHeartbeat {
    async fn send_heartbeat(&self) -> GatewayResult<()> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(GatewayError::ConnectionClosed { code: None })?;
        connection.send(&GatewayMessage::heartbeat(self.sequence.get())).await
    }

    async fn force_close(&self, code: u16) {
        if let Some(connection) = self.connection.upgrade() {
            connection.close(code).await;
        }
    }
}

/// Running heartbeat task for one connection
pub struct HeartbeatSupervisor {
    tracker: Arc<HeartbeatTracker>,
    interval: Duration,
    grace: Duration,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatSupervisor {
    /// Start heartbeating every `interval`
    ///
    /// The peer is declared silent after `interval * grace_factor` without
    /// any inbound frame. Intervals below one millisecond are raised to it.
    pub fn start<S: HeartbeatSink>(interval: Duration, grace_factor: f64, sink: S) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let tracker = Arc::new(HeartbeatTracker::new());
        let grace = interval.mul_f64(grace_factor);
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(supervise(
            interval,
            grace,
            Arc::clone(&tracker),
            sink,
            stop_rx,
        ));

        Self {
            tracker,
            interval,
            grace,
            stop,
            task,
        }
    }

    /// Heartbeat acknowledged by the peer
    pub fn ack(&self) {
        if let Some(latency) = self.tracker.record_ack() {
            tracing::trace!(latency_ms = latency.as_millis() as u64, "Heartbeat acknowledged");
        }
    }

    pub fn record_received(&self) {
        self.tracker.record_received();
    }

    pub fn latency(&self) -> Option<Duration> {
        self.tracker.latency()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Stop the task; safe to call repeatedly and after the task exited
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HeartbeatSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatSupervisor")
            .field("interval", &self.interval)
            .field("grace", &self.grace)
            .field("latency", &self.latency())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn supervise<S: HeartbeatSink>(
    interval: Duration,
    grace: Duration,
    tracker: Arc<HeartbeatTracker>,
    sink: S,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let silent_for = tracker.since_received();
        if silent_for > grace {
            tracing::warn!(
                silent_ms = silent_for.as_millis() as u64,
                grace_ms = grace.as_millis() as u64,
                since_sent_ms = tracker.since_sent().map(|d| d.as_millis() as u64),
                since_ack_ms = tracker.since_ack().map(|d| d.as_millis() as u64),
                "Peer unresponsive, closing connection"
            );
            sink.force_close(HEARTBEAT_TIMEOUT_CLOSE).await;
            break;
        }

        if let Err(e) = sink.send_heartbeat().await {
            tracing::debug!(error = %e, "Heartbeat not sent, supervisor stopping");
            break;
        }
        tracker.record_sent();
        tracing::trace!("Heartbeat sent");
    }

    tracing::debug!("Heartbeat supervisor stopped");
}
