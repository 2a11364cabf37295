//! Wake Detector
//!
//! Detects host suspend/resume by watching for wall-clock discontinuities.
//! A single detector instance is shared by every reconnecting connection in
//! the process: one background poller samples the wall clock on a fixed
//! interval, and when the observed gap between samples is well beyond the
//! interval the process is inferred to have been suspended (laptop sleep,
//! container freeze). A wake signal then fans out to every registration,
//! each of which forces its connection to reconnect.
//!
//! Registrations are bus subscriptions, so the poller runs only while at
//! least one connection is registered. Instances are explicit: construct
//! one per process (or per test) and hand out clones of the handle; there
//! is no process-global state.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::bus::{BusEvent, EventBus, Subscription};

// =============================================================================
// Types
// =============================================================================

/// Configuration for wake detection.
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Wall-clock sampling interval.
    pub poll_interval: Duration,
    /// A gap exceeding `poll_interval * gap_factor` is treated as a
    /// suspend/resume cycle.
    pub gap_factor: u32,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            gap_factor: 2,
        }
    }
}

/// Signal delivered to every registration after a suspected suspend.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    /// Observed wall-clock gap between samples.
    pub gap: Duration,
}

/// Discriminant for [`WakeEvent`]; a wake bus carries a single kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeEventKind {
    /// The only kind: a wake signal.
    Wake,
}

impl BusEvent for WakeEvent {
    type Kind = WakeEventKind;

    fn kind(&self) -> WakeEventKind {
        WakeEventKind::Wake
    }
}

/// Handle to an active wake registration. Deregisters on drop; the poller
/// stops when the last registration is gone.
pub type WakeRegistration = Subscription<WakeEvent>;

// =============================================================================
// Detector
// =============================================================================

struct WakeInner {
    config: WakeConfig,
    bus: EventBus<WakeEvent>,
    poller: Mutex<Option<CancellationToken>>,
    last_sample: Mutex<DateTime<Utc>>,
}

/// Shared suspend/resume detector. Cheap to clone; all clones share one
/// poller and one registration set.
#[derive(Clone)]
pub struct WakeDetector {
    inner: Arc<WakeInner>,
}

impl Default for WakeDetector {
    fn default() -> Self {
        Self::new(WakeConfig::default())
    }
}

impl WakeDetector {
    /// Create a detector. The poller starts with the first registration.
    #[must_use]
    pub fn new(config: WakeConfig) -> Self {
        let inner = Arc::new(WakeInner {
            config,
            bus: EventBus::new(),
            poller: Mutex::new(None),
            last_sample: Mutex::new(Utc::now()),
        });

        let on_first = Arc::downgrade(&inner);
        let on_zero = Arc::downgrade(&inner);
        inner.bus.set_lifecycle(
            move || {
                if let Some(inner) = on_first.upgrade() {
                    WakeInner::start_poller(&inner);
                }
            },
            move || {
                if let Some(inner) = on_zero.upgrade() {
                    inner.stop_poller();
                }
            },
        );

        Self { inner }
    }

    /// Register for wake signals. The first registration starts the poller.
    pub fn register(
        &self,
        callback: impl Fn(&WakeEvent) + Send + Sync + 'static,
    ) -> WakeRegistration {
        self.inner.bus.subscribe(callback)
    }

    /// Stop the poller regardless of registrations. Existing registrations
    /// stay subscribed but receive nothing further; intended for process
    /// teardown and tests.
    pub fn shutdown(&self) {
        self.inner.stop_poller();
    }

    /// Number of active registrations.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.bus.subscriber_count()
    }

    #[cfg(test)]
    fn backdate_last_sample(&self, by: chrono::TimeDelta) {
        *self.inner.last_sample.lock() = Utc::now() - by;
    }
}

impl WakeInner {
    fn start_poller(inner: &Arc<Self>) {
        let cancel = CancellationToken::new();
        {
            let mut poller = inner.poller.lock();
            if poller.is_some() {
                return;
            }
            *poller = Some(cancel.clone());
        }
        *inner.last_sample.lock() = Utc::now();

        tracing::debug!(
            interval_secs = inner.config.poll_interval.as_secs_f64(),
            "wake poller started"
        );

        let task: Weak<Self> = Arc::downgrade(inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = task.upgrade() else { return };
                let interval = inner.config.poll_interval;
                drop(inner);

                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }

                let Some(inner) = task.upgrade() else { return };
                inner.sample();
            }
        });
    }

    fn stop_poller(&self) {
        if let Some(cancel) = self.poller.lock().take() {
            cancel.cancel();
            tracing::debug!("wake poller stopped");
        }
    }

    /// Take one wall-clock sample and fan out a wake signal when the gap
    /// since the previous sample says the process was suspended.
    fn sample(&self) {
        let now = Utc::now();
        let gap = {
            let mut last = self.last_sample.lock();
            let gap = now - *last;
            *last = now;
            gap
        };

        let threshold = self.config.poll_interval * self.config.gap_factor;
        let Ok(gap) = gap.to_std() else {
            // Clock went backwards; nothing to report.
            return;
        };

        if gap > threshold {
            tracing::info!(
                gap_secs = gap.as_secs_f64(),
                "wall-clock discontinuity detected, signalling wake"
            );
            self.bus.dispatch(&WakeEvent { gap });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
