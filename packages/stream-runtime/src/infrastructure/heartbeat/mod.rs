//! Heartbeat Monitor
//!
//! Detects stale connections through a probe schedule with a reply
//! deadline. The monitor owns the clock; the connection owns the traffic:
//! every inbound frame counts as activity, and an optional keepalive frame
//! is sent when the monitor asks for a probe. A deadline miss surfaces as
//! [`HeartbeatSignal::Stale`], which the owning connection maps to a forced
//! reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between probe requests.
    pub probe_interval: Duration,
    /// How long a probe may go unanswered before the connection is
    /// considered stale.
    pub stale_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(20),
            stale_after: Duration::from_secs(20),
        }
    }
}

impl HeartbeatConfig {
    /// Create a configuration with custom values.
    #[must_use]
    pub const fn new(probe_interval: Duration, stale_after: Duration) -> Self {
        Self {
            probe_interval,
            stale_after,
        }
    }
}

/// Signals emitted by the monitor.
#[derive(Debug, Clone)]
pub enum HeartbeatSignal {
    /// Time to send a probe (keepalive frame).
    Probe,
    /// No activity within the deadline; the connection is presumed dead.
    Stale,
}

/// Activity state shared between the monitor and the connection's read path.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    awaiting_reply: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create fresh state; the connection counts as just-active.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            awaiting_reply: AtomicBool::new(false),
        }
    }

    /// Record inbound traffic; clears any outstanding probe.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.awaiting_reply.store(false, Ordering::SeqCst);
    }

    /// Mark that a probe went out and a reply is now expected.
    pub fn mark_probe_sent(&self) {
        self.awaiting_reply.store(true, Ordering::SeqCst);
    }

    /// Whether a probe is outstanding.
    #[must_use]
    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply.load(Ordering::SeqCst)
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Reset for a fresh connection.
    pub fn reset(&self) {
        *self.last_activity.write() = Instant::now();
        self.awaiting_reply.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn backdate_activity(&self, by: Duration) {
        if let Some(then) = Instant::now().checked_sub(by) {
            *self.last_activity.write() = then;
        }
    }
}

/// Probe scheduler and staleness watchdog.
///
/// Runs until cancelled or until a stale connection is detected. The owner
/// handles [`HeartbeatSignal::Probe`] by sending a keepalive frame (and
/// calling [`HeartbeatState::mark_probe_sent`]) and [`HeartbeatSignal::Stale`]
/// by tearing the connection down.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    signal_tx: mpsc::Sender<HeartbeatSignal>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a monitor over shared activity state.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        signal_tx: mpsc::Sender<HeartbeatSignal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            signal_tx,
            cancel,
        }
    }

    /// Run the probe loop until cancelled or a stale connection is found.
    pub async fn run(self) {
        let mut ticks = tokio::time::interval(self.config.probe_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; skip it so
        // a fresh connection is not probed at once.
        ticks.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat monitor cancelled");
                    return;
                }
                _ = ticks.tick() => {
                    if self.probe().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// One probe cycle. `Err(())` ends the loop.
    async fn probe(&self) -> Result<(), ()> {
        if self.state.is_awaiting_reply() {
            let idle = self.state.idle_for();
            if idle > self.config.stale_after {
                tracing::warn!(
                    idle_ms = idle.as_millis(),
                    stale_after_ms = self.config.stale_after.as_millis(),
                    "connection is stale"
                );
                let _ = self.signal_tx.send(HeartbeatSignal::Stale).await;
                return Err(());
            }
        }

        if self.signal_tx.send(HeartbeatSignal::Probe).await.is_err() {
            tracing::debug!("heartbeat signal channel closed");
            return Err(());
        }

        Ok(())
    }
}
