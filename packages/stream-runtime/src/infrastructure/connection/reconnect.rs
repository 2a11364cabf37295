//! Reconnecting Connection
//!
//! A logical connection whose identity survives drops. Composes a
//! [`RawConnection`] (hedged dialing, send buffering) with an outage state
//! machine, the wake detector, and an optional heartbeat monitor.
//!
//! # Outage protocol
//!
//! The first abrupt drop of an outage announces `Disconnected` exactly
//! once; every drop schedules a reopen after
//! `clamp(now - disconnect_time, min, max)` (the longer the outage has
//! lasted, the longer the pause, capped). When an attempt starts the
//! connection announces `Reconnecting`; the first successful reopen after
//! an outage announces `Reconnected` exactly once. A fresh `open()` that
//! never dropped announces a plain open, never `Reconnected`. Reopen
//! attempts repeat indefinitely until success.
//!
//! The connection observes its inner raw bus through the non-ref-counted
//! listener channel, so composing alone never forces the socket open; only
//! this connection's own subscribers do.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::bus::{BusEvent, EventBus, Listener, Subscription};
use crate::infrastructure::heartbeat::{
    HeartbeatConfig, HeartbeatMonitor, HeartbeatSignal, HeartbeatState,
};
use crate::infrastructure::wake::{WakeDetector, WakeRegistration};

use super::raw::{ConnectionEvent, ConnectionEventKind, RawConnection, SendError};

// =============================================================================
// Events
// =============================================================================

/// Events emitted by a [`ReconnectingConnection`]: the outage protocol plus
/// passthrough of every inner [`ConnectionEvent`].
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Passthrough of an inner raw connection event. A `Raw(Open)` on a
    /// connection that never dropped is the plain open announcement.
    Raw(ConnectionEvent),
    /// The connection dropped unexpectedly; announced once per outage.
    Disconnected {
        /// Description of the originating failure.
        error: String,
    },
    /// A reopen attempt is starting.
    Reconnecting {
        /// The failure that caused the outage, when known.
        error: Option<String>,
    },
    /// The outage is over; announced once per outage, before the
    /// accompanying `Raw(Open)`.
    Reconnected,
}

/// Discriminants of [`LinkEvent`] for subscriber filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    /// Passthrough events, by their raw kind.
    Raw(ConnectionEventKind),
    /// `Disconnected` events.
    Disconnected,
    /// `Reconnecting` events.
    Reconnecting,
    /// `Reconnected` events.
    Reconnected,
}

impl BusEvent for LinkEvent {
    type Kind = LinkEventKind;

    fn kind(&self) -> LinkEventKind {
        match self {
            Self::Raw(event) => LinkEventKind::Raw(event.kind()),
            Self::Disconnected { .. } => LinkEventKind::Disconnected,
            Self::Reconnecting { .. } => LinkEventKind::Reconnecting,
            Self::Reconnected => LinkEventKind::Reconnected,
        }
    }
}

/// Lifecycle states of a [`ReconnectingConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection and none wanted.
    Closed,
    /// First open in progress.
    Opening,
    /// Connected.
    Open,
    /// Intentional teardown in progress.
    Closing,
    /// A reopen attempt is in flight.
    Reconnecting,
    /// Dropped; a reopen is scheduled.
    Disconnected,
}

// =============================================================================
// Schedule
// =============================================================================

/// Maps how long the current outage has lasted to the pause before the next
/// reopen attempt.
pub trait ReconnectSchedule: Send + Sync + 'static {
    /// Delay before the next reopen, given the outage's elapsed time.
    fn delay(&self, outage_elapsed: Duration) -> Duration;
}

/// Default schedule: the pause equals the outage's elapsed time, clamped.
/// Early in an outage reopens come quickly; a long outage settles at the
/// cap.
#[derive(Debug, Clone)]
pub struct ElapsedClamp {
    /// Smallest pause between reopens.
    pub min: Duration,
    /// Largest pause between reopens.
    pub max: Duration,
}

impl Default for ElapsedClamp {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl ReconnectSchedule for ElapsedClamp {
    fn delay(&self, outage_elapsed: Duration) -> Duration {
        outage_elapsed.clamp(self.min, self.max)
    }
}

// =============================================================================
// Options
// =============================================================================

/// Keepalive frame factory, invoked on each heartbeat probe.
pub type KeepaliveFrame = Arc<dyn Fn() -> String + Send + Sync>;

/// Composition options for a [`ReconnectingConnection`].
pub struct ReconnectOptions {
    /// Reopen pacing; defaults to [`ElapsedClamp`].
    pub schedule: Arc<dyn ReconnectSchedule>,
    /// Wake detector to register with while the connection has subscribers.
    pub wake: Option<WakeDetector>,
    /// Staleness monitoring; enabled when set.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Frame to send on each heartbeat probe; without it the heartbeat
    /// relies on the stream's own traffic.
    pub keepalive: Option<KeepaliveFrame>,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            schedule: Arc::new(ElapsedClamp::default()),
            wake: None,
            heartbeat: None,
            keepalive: None,
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

struct LinkMachine {
    state: LinkState,
    outage_since: Option<Instant>,
    last_error: Option<String>,
    timer_cancel: Option<CancellationToken>,
    wake_reg: Option<WakeRegistration>,
    heartbeat_stop: Option<CancellationToken>,
    heartbeat_state: Option<Arc<HeartbeatState>>,
}

struct LinkInner {
    raw: RawConnection,
    bus: EventBus<LinkEvent>,
    schedule: Arc<dyn ReconnectSchedule>,
    wake: Option<WakeDetector>,
    heartbeat: Option<HeartbeatConfig>,
    keepalive: Option<KeepaliveFrame>,
    machine: Mutex<LinkMachine>,
}

enum OpenOutcome {
    Fresh,
    Reconnected,
    Discard,
}

enum CloseOutcome {
    Finished,
    FirstDrop(Duration, CancellationToken, String),
    RepeatDrop(Duration, CancellationToken),
    Ignore,
}

/// A logical connection that survives drops.
///
/// Subscribing for the first time opens the inner connection and registers
/// with the wake detector; the last unsubscribe closes it and cancels any
/// pending reconnect timer.
pub struct ReconnectingConnection {
    inner: Arc<LinkInner>,
    _raw_listener: Listener<ConnectionEvent>,
}

impl ReconnectingConnection {
    /// Wrap `raw` with default options.
    #[must_use]
    pub fn new(raw: RawConnection) -> Self {
        Self::with_options(raw, ReconnectOptions::default())
    }

    /// Wrap `raw` with explicit composition options.
    #[must_use]
    pub fn with_options(raw: RawConnection, options: ReconnectOptions) -> Self {
        let inner = Arc::new(LinkInner {
            raw,
            bus: EventBus::new(),
            schedule: options.schedule,
            wake: options.wake,
            heartbeat: options.heartbeat,
            keepalive: options.keepalive,
            machine: Mutex::new(LinkMachine {
                state: LinkState::Closed,
                outage_since: None,
                last_error: None,
                timer_cancel: None,
                wake_reg: None,
                heartbeat_stop: None,
                heartbeat_state: None,
            }),
        });

        let events = Arc::downgrade(&inner);
        let raw_listener = inner.raw.observe(move |event| {
            if let Some(inner) = events.upgrade() {
                LinkInner::on_raw_event(&inner, event);
            }
        });

        let on_first = Arc::downgrade(&inner);
        let on_zero = Arc::downgrade(&inner);
        inner.bus.set_lifecycle(
            move || {
                if let Some(inner) = on_first.upgrade() {
                    LinkInner::acquire(&inner);
                }
            },
            move || {
                if let Some(inner) = on_zero.upgrade() {
                    LinkInner::release(&inner);
                }
            },
        );

        Self {
            inner,
            _raw_listener: raw_listener,
        }
    }

    /// Start opening the connection. Usually driven by the first subscriber
    /// instead of called directly.
    pub fn open(&self) {
        LinkInner::open_link(&self.inner);
    }

    /// Tear the connection down: cancels any pending reconnect and closes
    /// the inner connection.
    pub fn close(&self) {
        LinkInner::release(&self.inner);
    }

    /// Force the reconnect path, as after a host wake: the current
    /// transport is presumed dead and is torn down and reopened. Never
    /// double-announces `Disconnected` when an outage is already running.
    pub fn force_reconnect(&self) {
        LinkInner::force_reconnect(&self.inner);
    }

    /// Send one frame through the current (or currently opening) transport.
    ///
    /// # Errors
    ///
    /// Propagates [`SendError`] from the inner connection; during an outage
    /// the frame is dropped and reported, not queued across reconnects.
    pub async fn send(&self, data: String) -> Result<(), SendError> {
        self.inner.raw.send(data).await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.inner.machine.lock().state
    }

    /// Subscribe to all link events. The first subscriber opens the
    /// connection.
    pub fn subscribe(
        &self,
        callback: impl Fn(&LinkEvent) + Send + Sync + 'static,
    ) -> Subscription<LinkEvent> {
        self.inner.bus.subscribe(callback)
    }

    /// Subscribe to a subset of event kinds. The first subscriber opens the
    /// connection.
    pub fn subscribe_to(
        &self,
        kinds: impl Into<Vec<LinkEventKind>>,
        callback: impl Fn(&LinkEvent) + Send + Sync + 'static,
    ) -> Subscription<LinkEvent> {
        self.inner.bus.subscribe_to(kinds, callback)
    }

    /// Observe all link events without holding the connection open.
    pub fn observe(
        &self,
        callback: impl Fn(&LinkEvent) + Send + Sync + 'static,
    ) -> Listener<LinkEvent> {
        self.inner.bus.listen(callback)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.bus.subscriber_count()
    }
}

impl LinkInner {
    /// First subscriber: register for wake signals and open.
    fn acquire(inner: &Arc<Self>) {
        let wake_reg = inner.wake.as_ref().map(|detector| {
            let weak = Arc::downgrade(inner);
            detector.register(move |_| {
                if let Some(inner) = weak.upgrade() {
                    tracing::info!("host wake detected, forcing reconnect");
                    LinkInner::force_reconnect(&inner);
                }
            })
        });
        inner.machine.lock().wake_reg = wake_reg;

        Self::open_link(inner);
    }

    /// Last unsubscribe (or explicit close): cancel timers, deregister from
    /// the wake detector, close the inner connection.
    fn release(inner: &Arc<Self>) {
        let (wake_reg, timer, heartbeat, close_raw) = {
            let mut machine = inner.machine.lock();
            let wake_reg = machine.wake_reg.take();
            let timer = machine.timer_cancel.take();
            let heartbeat = machine.heartbeat_stop.take();
            machine.heartbeat_state = None;
            machine.outage_since = None;
            machine.last_error = None;

            let close_raw = match machine.state {
                LinkState::Open | LinkState::Opening | LinkState::Reconnecting => {
                    machine.state = LinkState::Closing;
                    true
                }
                // No live transport to drain during a scheduled pause.
                LinkState::Disconnected => {
                    machine.state = LinkState::Closed;
                    false
                }
                LinkState::Closed | LinkState::Closing => false,
            };
            (wake_reg, timer, heartbeat, close_raw)
        };

        drop(wake_reg);
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(heartbeat) = heartbeat {
            heartbeat.cancel();
        }
        if close_raw {
            let task = Arc::clone(inner);
            tokio::spawn(async move {
                task.raw.close().await;
            });
        }
    }

    fn open_link(inner: &Arc<Self>) {
        {
            let mut machine = inner.machine.lock();
            if machine.state != LinkState::Closed {
                return;
            }
            machine.state = LinkState::Opening;
        }
        inner.raw.open();
    }

    fn on_raw_event(inner: &Arc<Self>, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Open => Self::on_raw_open(inner),
            ConnectionEvent::Close { clean, details } => {
                Self::on_raw_close(inner, *clean, details);
            }
            ConnectionEvent::Error { details } => {
                inner.machine.lock().last_error = Some(details.clone());
            }
            ConnectionEvent::Response { .. } => {
                if let Some(heartbeat) = &inner.machine.lock().heartbeat_state {
                    heartbeat.record_activity();
                }
            }
            _ => {}
        }

        inner.bus.dispatch(&LinkEvent::Raw(event.clone()));
    }

    fn on_raw_open(inner: &Arc<Self>) {
        let outcome = {
            let mut machine = inner.machine.lock();
            match machine.state {
                // Opened after teardown began: discard the transport.
                LinkState::Closing | LinkState::Closed => OpenOutcome::Discard,
                _ => {
                    let was_outage = machine.outage_since.take().is_some();
                    machine.state = LinkState::Open;
                    machine.last_error = None;
                    if let Some(timer) = machine.timer_cancel.take() {
                        timer.cancel();
                    }
                    if was_outage {
                        OpenOutcome::Reconnected
                    } else {
                        OpenOutcome::Fresh
                    }
                }
            }
        };

        match outcome {
            OpenOutcome::Discard => {
                let task = Arc::clone(inner);
                tokio::spawn(async move {
                    task.raw.close().await;
                });
            }
            OpenOutcome::Reconnected => {
                tracing::info!("connection reestablished");
                inner.bus.dispatch(&LinkEvent::Reconnected);
                Self::start_heartbeat(inner);
            }
            OpenOutcome::Fresh => Self::start_heartbeat(inner),
        }
    }

    fn on_raw_close(inner: &Arc<Self>, clean: bool, details: &str) {
        let outcome = {
            let mut machine = inner.machine.lock();
            match machine.state {
                LinkState::Closing => {
                    machine.state = LinkState::Closed;
                    CloseOutcome::Finished
                }
                LinkState::Closed => CloseOutcome::Ignore,
                LinkState::Open
                | LinkState::Opening
                | LinkState::Reconnecting
                | LinkState::Disconnected => {
                    let first = machine.outage_since.is_none();
                    let since = *machine.outage_since.get_or_insert_with(Instant::now);
                    machine.state = LinkState::Disconnected;

                    let error = machine
                        .last_error
                        .clone()
                        .unwrap_or_else(|| details.to_owned());
                    let delay = inner.schedule.delay(since.elapsed());
                    let cancel = CancellationToken::new();
                    if let Some(old) = machine.timer_cancel.replace(cancel.clone()) {
                        old.cancel();
                    }

                    if first {
                        CloseOutcome::FirstDrop(delay, cancel, error)
                    } else {
                        CloseOutcome::RepeatDrop(delay, cancel)
                    }
                }
            }
        };

        match outcome {
            CloseOutcome::Finished | CloseOutcome::Ignore => {}
            CloseOutcome::FirstDrop(delay, cancel, error) => {
                tracing::warn!(clean, error = %error, "connection dropped, outage begins");
                Self::stop_heartbeat(inner);
                inner.bus.dispatch(&LinkEvent::Disconnected { error });
                Self::schedule_reopen(inner, delay, cancel);
            }
            CloseOutcome::RepeatDrop(delay, cancel) => {
                Self::stop_heartbeat(inner);
                Self::schedule_reopen(inner, delay, cancel);
            }
        }
    }

    fn schedule_reopen(inner: &Arc<Self>, delay: Duration, cancel: CancellationToken) {
        tracing::info!(delay_ms = delay.as_millis(), "reconnect scheduled");
        let task = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    Self::begin_reconnect(&task);
                }
            }
        });
    }

    fn begin_reconnect(inner: &Arc<Self>) {
        let error = {
            let mut machine = inner.machine.lock();
            if machine.state != LinkState::Disconnected {
                return;
            }
            machine.state = LinkState::Reconnecting;
            machine.timer_cancel = None;
            machine.last_error.clone()
        };

        inner.bus.dispatch(&LinkEvent::Reconnecting { error });
        inner.raw.open();
    }

    fn force_reconnect(inner: &Arc<Self>) {
        let first = {
            let mut machine = inner.machine.lock();
            match machine.state {
                LinkState::Open | LinkState::Opening => {
                    let first = machine.outage_since.is_none();
                    if first {
                        machine.outage_since = Some(Instant::now());
                    }
                    machine.state = LinkState::Disconnected;
                    machine
                        .last_error
                        .get_or_insert_with(|| "reconnect forced".to_owned());
                    if let Some(timer) = machine.timer_cancel.take() {
                        timer.cancel();
                    }
                    Some(first)
                }
                // An outage is already running its own reconnect cycle.
                LinkState::Disconnected | LinkState::Reconnecting => None,
                LinkState::Closed | LinkState::Closing => None,
            }
        };

        let Some(first) = first else { return };

        Self::stop_heartbeat(inner);
        if first {
            inner.bus.dispatch(&LinkEvent::Disconnected {
                error: "reconnect forced".to_owned(),
            });
        }
        // Tearing the raw connection down produces its Close event, which
        // schedules the reopen through the normal drop path.
        let task = Arc::clone(inner);
        tokio::spawn(async move {
            task.raw.close().await;
        });
    }

    fn start_heartbeat(inner: &Arc<Self>) {
        let Some(config) = inner.heartbeat.clone() else {
            return;
        };

        let state = Arc::new(HeartbeatState::new());
        let (signal_tx, mut signal_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        {
            let mut machine = inner.machine.lock();
            if let Some(old) = machine.heartbeat_stop.replace(cancel.clone()) {
                old.cancel();
            }
            machine.heartbeat_state = Some(Arc::clone(&state));
        }

        let monitor = HeartbeatMonitor::new(config, Arc::clone(&state), signal_tx, cancel);
        tokio::spawn(monitor.run());

        let task = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                let Some(inner) = task.upgrade() else { return };
                match signal {
                    HeartbeatSignal::Probe => {
                        state.mark_probe_sent();
                        if let Some(keepalive) = &inner.keepalive {
                            let frame = keepalive();
                            if let Err(error) = inner.raw.send(frame).await {
                                tracing::debug!(error = %error, "keepalive send failed");
                            }
                        }
                    }
                    HeartbeatSignal::Stale => {
                        LinkInner::force_reconnect(&inner);
                        return;
                    }
                }
            }
        });
    }

    fn stop_heartbeat(inner: &Arc<Self>) {
        let mut machine = inner.machine.lock();
        if let Some(cancel) = machine.heartbeat_stop.take() {
            cancel.cancel();
        }
        machine.heartbeat_state = None;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    use crate::application::ports::{
        Connector, Dialed, TransportError, TransportEvent, TransportSink,
    };
    use crate::application::retry::RetryConfig;

    use super::*;

    struct LinkControl {
        events: mpsc::Sender<TransportEvent>,
        closed: Arc<AtomicBool>,
    }

    struct ScriptedSink {
        events: mpsc::Sender<TransportEvent>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TransportSink for ScriptedSink {
        async fn send(&mut self, _data: String) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            let _ = self
                .events
                .send(TransportEvent::Closed {
                    clean: true,
                    details: "closed by peer".to_owned(),
                })
                .await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        dials: AtomicUsize,
        links: PlMutex<Vec<Arc<LinkControl>>>,
    }

    impl ScriptedConnector {
        fn link(&self, index: usize) -> Arc<LinkControl> {
            Arc::clone(&self.links.lock()[index])
        }

        fn link_count(&self) -> usize {
            self.links.lock().len()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<Dialed, TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(64);
            let closed = Arc::new(AtomicBool::new(false));
            self.links.lock().push(Arc::new(LinkControl {
                events: tx.clone(),
                closed: Arc::clone(&closed),
            }));
            Ok(Dialed {
                sink: Box::new(ScriptedSink { events: tx, closed }),
                events: rx,
            })
        }
    }

    async fn wait_until(what: &str, check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn quick_schedule() -> Arc<dyn ReconnectSchedule> {
        Arc::new(ElapsedClamp {
            min: Duration::from_millis(10),
            max: Duration::from_millis(50),
        })
    }

    fn connection(
        connector: &Arc<ScriptedConnector>,
        options: ReconnectOptions,
    ) -> ReconnectingConnection {
        let raw = RawConnection::with_options(
            "wss://example.test/stream",
            Arc::clone(connector) as _,
            RetryConfig {
                delay_offset: Duration::from_millis(10),
                delay_multiple: Duration::from_millis(10),
                ..RetryConfig::default()
            },
            None,
        );
        ReconnectingConnection::with_options(raw, options)
    }

    fn recorder() -> (
        Arc<PlMutex<Vec<LinkEvent>>>,
        impl Fn(&LinkEvent) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |e: &LinkEvent| sink.lock().push(e.clone()))
    }

    fn count_kind(seen: &PlMutex<Vec<LinkEvent>>, kind: LinkEventKind) -> usize {
        seen.lock().iter().filter(|e| e.kind() == kind).count()
    }

    #[tokio::test]
    async fn fresh_open_announces_open_not_reconnected() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = connection(
            &connector,
            ReconnectOptions {
                schedule: quick_schedule(),
                ..ReconnectOptions::default()
            },
        );

        let (seen, record) = recorder();
        let _sub = conn.subscribe(record);

        wait_until("open", || conn.state() == LinkState::Open).await;

        assert_eq!(
            count_kind(&seen, LinkEventKind::Raw(ConnectionEventKind::Open)),
            1
        );
        assert_eq!(count_kind(&seen, LinkEventKind::Reconnected), 0);
        assert_eq!(count_kind(&seen, LinkEventKind::Disconnected), 0);
    }

    #[tokio::test]
    async fn drop_and_reopen_announce_exactly_once_each() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = connection(
            &connector,
            ReconnectOptions {
                schedule: quick_schedule(),
                ..ReconnectOptions::default()
            },
        );

        let (seen, record) = recorder();
        let _sub = conn.subscribe(record);

        wait_until("open", || conn.state() == LinkState::Open).await;

        connector
            .link(0)
            .events
            .send(TransportEvent::Closed {
                clean: false,
                details: "connection reset".to_owned(),
            })
            .await
            .unwrap();

        wait_until("reconnect", || {
            conn.state() == LinkState::Open && connector.link_count() == 2
        })
        .await;

        assert_eq!(count_kind(&seen, LinkEventKind::Disconnected), 1);
        assert_eq!(count_kind(&seen, LinkEventKind::Reconnected), 1);
        assert!(count_kind(&seen, LinkEventKind::Reconnecting) >= 1);
    }

    #[tokio::test]
    async fn double_drop_before_reconnect_announces_disconnected_once() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = connection(
            &connector,
            ReconnectOptions {
                schedule: Arc::new(ElapsedClamp {
                    min: Duration::from_millis(150),
                    max: Duration::from_millis(300),
                }),
                ..ReconnectOptions::default()
            },
        );

        let (seen, record) = recorder();
        let _sub = conn.subscribe(record);

        wait_until("open", || conn.state() == LinkState::Open).await;

        // First drop starts the outage.
        connector
            .link(0)
            .events
            .send(TransportEvent::Closed {
                clean: false,
                details: "connection reset".to_owned(),
            })
            .await
            .unwrap();
        wait_until("outage", || conn.state() == LinkState::Disconnected).await;

        // Second "drop" lands while the reopen is still pending.
        conn.force_reconnect();

        wait_until("reconnect", || conn.state() == LinkState::Open).await;

        assert_eq!(count_kind(&seen, LinkEventKind::Disconnected), 1);
        assert_eq!(count_kind(&seen, LinkEventKind::Reconnected), 1);
    }

    #[tokio::test]
    async fn force_reconnect_cycles_the_transport() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = connection(
            &connector,
            ReconnectOptions {
                schedule: quick_schedule(),
                ..ReconnectOptions::default()
            },
        );

        let (seen, record) = recorder();
        let _sub = conn.subscribe(record);

        wait_until("open", || conn.state() == LinkState::Open).await;

        conn.force_reconnect();

        wait_until("new transport", || {
            connector.link_count() == 2 && conn.state() == LinkState::Open
        })
        .await;

        assert!(connector.link(0).closed.load(Ordering::SeqCst));
        assert_eq!(count_kind(&seen, LinkEventKind::Disconnected), 1);
        assert_eq!(count_kind(&seen, LinkEventKind::Reconnected), 1);
    }

    #[tokio::test]
    async fn raw_events_pass_through() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = connection(
            &connector,
            ReconnectOptions {
                schedule: quick_schedule(),
                ..ReconnectOptions::default()
            },
        );

        let (seen, record) = recorder();
        let _sub = conn.subscribe(record);

        wait_until("open", || conn.state() == LinkState::Open).await;

        connector
            .link(0)
            .events
            .send(TransportEvent::Message("payload".to_owned()))
            .await
            .unwrap();

        wait_until("passthrough", || {
            count_kind(&seen, LinkEventKind::Raw(ConnectionEventKind::Response)) == 1
        })
        .await;

        let got = seen
            .lock()
            .iter()
            .find_map(|e| match e {
                LinkEvent::Raw(ConnectionEvent::Response { data }) => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(got, "payload");
    }

    #[tokio::test]
    async fn zero_subscribers_cancel_pending_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = connection(
            &connector,
            ReconnectOptions {
                schedule: Arc::new(ElapsedClamp {
                    min: Duration::from_secs(5),
                    max: Duration::from_secs(10),
                }),
                ..ReconnectOptions::default()
            },
        );

        let sub = conn.subscribe(|_| {});
        wait_until("open", || conn.state() == LinkState::Open).await;

        connector
            .link(0)
            .events
            .send(TransportEvent::Closed {
                clean: false,
                details: "connection reset".to_owned(),
            })
            .await
            .unwrap();
        wait_until("outage", || conn.state() == LinkState::Disconnected).await;

        sub.unsubscribe();
        wait_until("closed", || conn.state() == LinkState::Closed).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_heartbeat_forces_reconnect() {
        let connector = Arc::new(ScriptedConnector::default());
        let conn = connection(
            &connector,
            ReconnectOptions {
                schedule: quick_schedule(),
                heartbeat: Some(HeartbeatConfig::new(
                    Duration::from_millis(20),
                    Duration::from_millis(40),
                )),
                keepalive: Some(Arc::new(|| "{\"action\":\"ping\"}".to_owned())),
                ..ReconnectOptions::default()
            },
        );

        let (seen, record) = recorder();
        let _sub = conn.subscribe(record);

        wait_until("open", || conn.state() == LinkState::Open).await;

        // The scripted transport never answers keepalives, so the monitor
        // flags the connection stale and a new transport is dialed.
        wait_until("stale-driven reconnect", || connector.link_count() >= 2).await;
        wait_until("reopen", || conn.state() == LinkState::Open).await;

        assert!(count_kind(&seen, LinkEventKind::Disconnected) >= 1);
    }
}
