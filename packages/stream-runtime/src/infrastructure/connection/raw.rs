//! Raw Connection
//!
//! Wraps one physical transport connection as an event bus with a four-state
//! lifecycle: `Closed -> Opening -> Open -> Closing -> Closed`, with an
//! abrupt drop taking `Open -> Closed` directly.
//!
//! Dialing is wrapped in the hedged retry combinator, so transient connect
//! failures are absorbed here, below any reconnect machinery stacked on
//! top. When concurrent dial attempts race, the first ready transport wins
//! and every loser is discarded the moment the winner is chosen; duplicate
//! transports never leak.
//!
//! Sends issued while `Opening` buffer in FIFO order and flush exactly once
//! when `Open` is reached. Sends are not assumed idempotent, so a send-time
//! fault is reported, never retried.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Connector, Dialed, SessionGate, TransportError, TransportEvent};
use crate::application::retry::{Resilient, RetryConfig};
use crate::domain::bus::{BusEvent, EventBus, Listener, Subscription};

// =============================================================================
// Events
// =============================================================================

/// Events emitted by a [`RawConnection`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport is ready; buffered sends have begun flushing.
    Open,
    /// A graceful close was requested; the transport is still draining.
    /// Subscribers can use this to distinguish an intentional close from a
    /// later abrupt drop.
    Closing,
    /// The connection ended.
    Close {
        /// Whether the close was negotiated rather than an abrupt drop.
        clean: bool,
        /// Close code / reason text for diagnostics.
        details: String,
    },
    /// The transport or a send reported a fault.
    Error {
        /// Fault description.
        details: String,
    },
    /// An outbound frame was transmitted.
    Request {
        /// The transmitted payload.
        data: String,
    },
    /// An inbound frame arrived.
    Response {
        /// The received payload.
        data: String,
    },
}

/// Discriminants of [`ConnectionEvent`] for subscriber filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// `Open` events.
    Open,
    /// `Closing` events.
    Closing,
    /// `Close` events.
    Close,
    /// `Error` events.
    Error,
    /// `Request` events.
    Request,
    /// `Response` events.
    Response,
}

impl BusEvent for ConnectionEvent {
    type Kind = ConnectionEventKind;

    fn kind(&self) -> ConnectionEventKind {
        match self {
            Self::Open => ConnectionEventKind::Open,
            Self::Closing => ConnectionEventKind::Closing,
            Self::Close { .. } => ConnectionEventKind::Close,
            Self::Error { .. } => ConnectionEventKind::Error,
            Self::Request { .. } => ConnectionEventKind::Request,
            Self::Response { .. } => ConnectionEventKind::Response,
        }
    }
}

// =============================================================================
// State & Errors
// =============================================================================

/// Lifecycle states of a [`RawConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; dialing has not started or has fully torn down.
    Closed,
    /// Dialing in progress; sends buffer.
    Opening,
    /// Transport ready; sends transmit immediately.
    Open,
    /// Graceful close requested; waiting for the transport to drain.
    Closing,
}

/// Failures reported by [`RawConnection::send`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The connection is closed or closing; the payload was dropped.
    #[error("connection is not open")]
    NotConnected,

    /// The transport rejected the transmission.
    #[error("transmit failed: {0}")]
    Transport(String),
}

// =============================================================================
// Raw Connection
// =============================================================================

struct Machine {
    state: ConnectionState,
    pending: VecDeque<String>,
    /// Bumped on every teardown; tasks from an earlier life see a stale
    /// epoch and stand down.
    epoch: u64,
    dial_cancel: Option<CancellationToken>,
}

enum CloseAction {
    Graceful,
    AbortDial(Option<CancellationToken>),
    None,
}

struct RawInner {
    url: String,
    dial_retry: RetryConfig,
    connector: Arc<dyn Connector>,
    gate: Option<Arc<dyn SessionGate>>,
    bus: EventBus<ConnectionEvent>,
    machine: Mutex<Machine>,
    sink: tokio::sync::Mutex<Option<Box<dyn crate::application::ports::TransportSink>>>,
}

/// One physical transport connection, exposed as an event bus.
///
/// The socket's lifecycle is tied to the subscriber count: the first
/// subscriber opens the connection and the last unsubscribe closes it.
/// `open`/`close` are also exposed directly for composition layers that
/// drive the lifecycle themselves and observe via [`RawConnection::observe`].
pub struct RawConnection {
    inner: Arc<RawInner>,
}

impl RawConnection {
    /// Create a connection to `url` over `connector`, with default dial
    /// retry and no session gate.
    #[must_use]
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self::with_options(url, connector, RetryConfig::default(), None)
    }

    /// Create a connection with explicit dial retry configuration and an
    /// optional session gate run after each successful dial.
    #[must_use]
    pub fn with_options(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        dial_retry: RetryConfig,
        gate: Option<Arc<dyn SessionGate>>,
    ) -> Self {
        let inner = Arc::new(RawInner {
            url: url.into(),
            dial_retry,
            connector,
            gate,
            bus: EventBus::new(),
            machine: Mutex::new(Machine {
                state: ConnectionState::Closed,
                pending: VecDeque::new(),
                epoch: 0,
                dial_cancel: None,
            }),
            sink: tokio::sync::Mutex::new(None),
        });

        let on_first = Arc::downgrade(&inner);
        let on_zero = Arc::downgrade(&inner);
        inner.bus.set_lifecycle(
            move || {
                if let Some(inner) = on_first.upgrade() {
                    RawInner::open(&inner);
                }
            },
            move || {
                if let Some(inner) = on_zero.upgrade() {
                    tokio::spawn(async move {
                        inner.close().await;
                    });
                }
            },
        );

        Self { inner }
    }

    /// Start opening the connection. Idempotent while `Opening` or `Open`;
    /// a connection that is still `Closing` must finish before it can
    /// reopen.
    pub fn open(&self) {
        RawInner::open(&self.inner);
    }

    /// Send one frame.
    ///
    /// `Opening` buffers the frame for the flush; `Open` transmits now.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] when closed or closing (the frame is
    /// dropped and reported); [`SendError::Transport`] when the transport
    /// rejects the transmission.
    pub async fn send(&self, data: String) -> Result<(), SendError> {
        self.inner.send(data).await
    }

    /// Close the connection. From `Open` this announces `Closing` first and
    /// lets the transport drain; otherwise teardown is immediate.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.machine.lock().state
    }

    /// Subscribe to all connection events. The first subscriber opens the
    /// connection.
    pub fn subscribe(
        &self,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Subscription<ConnectionEvent> {
        self.inner.bus.subscribe(callback)
    }

    /// Subscribe to a subset of event kinds. The first subscriber opens the
    /// connection.
    pub fn subscribe_to(
        &self,
        kinds: impl Into<Vec<ConnectionEventKind>>,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Subscription<ConnectionEvent> {
        self.inner.bus.subscribe_to(kinds, callback)
    }

    /// Observe all connection events without participating in the
    /// subscriber count; observing alone never opens the connection.
    pub fn observe(
        &self,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Listener<ConnectionEvent> {
        self.inner.bus.listen(callback)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.bus.subscriber_count()
    }
}

impl RawInner {
    fn open(inner: &Arc<Self>) {
        let (epoch, cancel) = {
            let mut machine = inner.machine.lock();
            match machine.state {
                ConnectionState::Opening | ConnectionState::Open | ConnectionState::Closing => {
                    return;
                }
                ConnectionState::Closed => {}
            }
            machine.state = ConnectionState::Opening;
            machine.epoch += 1;
            let cancel = CancellationToken::new();
            machine.dial_cancel = Some(cancel.clone());
            (machine.epoch, cancel)
        };

        tracing::debug!(url = %inner.url, "opening connection");
        let task = Arc::clone(inner);
        tokio::spawn(async move {
            task.dial_task(epoch, cancel).await;
        });
    }

    async fn dial_task(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        let connector = Arc::clone(&self.connector);
        let gate = self.gate.clone();
        let url = self.url.clone();

        let resilient: Resilient<Dialed, TransportError> =
            Resilient::new(self.dial_retry.clone());
        let dial = resilient.run(move |attempt| {
            let connector = Arc::clone(&connector);
            let gate = gate.clone();
            let url = url.clone();
            async move {
                tracing::debug!(attempt, url = %url, "dial attempt");
                let mut dialed = connector.connect(&url).await?;
                if let Some(gate) = &gate {
                    gate.ready(&mut dialed)
                        .await
                        .map_err(|e| TransportError::Dial(format!("session gate: {e}")))?;
                }
                Ok(dialed)
            }
        });

        let result = tokio::select! {
            // Cancelling drops the retry run, which aborts every dial
            // attempt still in flight; their transports close on drop.
            () = cancel.cancelled() => return,
            result = dial => result,
        };

        match result {
            Ok(dialed) => self.install(dialed, epoch, cancel).await,
            Err(error) => {
                let stale = {
                    let mut machine = self.machine.lock();
                    if machine.epoch == epoch {
                        machine.state = ConnectionState::Closed;
                        machine.dial_cancel = None;
                        machine.pending.clear();
                        false
                    } else {
                        true
                    }
                };
                if !stale {
                    tracing::warn!(url = %self.url, error = %error, "dial gave up");
                    self.bus.dispatch(&ConnectionEvent::Error {
                        details: error.to_string(),
                    });
                    self.bus.dispatch(&ConnectionEvent::Close {
                        clean: false,
                        details: "connect failed".to_owned(),
                    });
                }
            }
        }
    }

    async fn install(self: Arc<Self>, dialed: Dialed, epoch: u64, cancel: CancellationToken) {
        let Dialed { mut sink, events } = dialed;

        // Take the sink slot before flipping the state, so a send that
        // observes `Open` always finds the sink installed (it queues behind
        // this lock while the buffered frames flush).
        let mut slot = self.sink.lock().await;

        let pending = {
            let mut machine = self.machine.lock();
            if machine.epoch == epoch && machine.state == ConnectionState::Opening {
                machine.state = ConnectionState::Open;
                Some(std::mem::take(&mut machine.pending))
            } else {
                None
            }
        };

        // A winner that arrives after teardown is discarded, not installed.
        let Some(pending) = pending else {
            drop(slot);
            let _ = sink.close().await;
            return;
        };

        tracing::info!(url = %self.url, "connection open");

        *slot = Some(sink);
        self.bus.dispatch(&ConnectionEvent::Open);
        for data in pending {
            if let Some(active) = slot.as_mut() {
                match active.send(data.clone()).await {
                    Ok(()) => self.bus.dispatch(&ConnectionEvent::Request { data }),
                    Err(error) => self.bus.dispatch(&ConnectionEvent::Error {
                        details: error.to_string(),
                    }),
                }
            }
        }
        drop(slot);

        let reader = Arc::clone(&self);
        tokio::spawn(async move {
            reader.read_loop(events, epoch, cancel).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => event,
            };

            match event {
                Some(TransportEvent::Message(data)) => {
                    self.bus.dispatch(&ConnectionEvent::Response { data });
                }
                Some(TransportEvent::Error(error)) => {
                    self.bus.dispatch(&ConnectionEvent::Error {
                        details: error.to_string(),
                    });
                }
                Some(TransportEvent::Closed { clean, details }) => {
                    self.finish_close(epoch, clean, details).await;
                    return;
                }
                None => {
                    self.finish_close(epoch, false, "transport stream ended".to_owned())
                        .await;
                    return;
                }
            }
        }
    }

    async fn finish_close(&self, epoch: u64, clean: bool, details: String) {
        let stale = {
            let mut machine = self.machine.lock();
            if machine.epoch == epoch {
                machine.state = ConnectionState::Closed;
                machine.dial_cancel = None;
                false
            } else {
                true
            }
        };
        if stale {
            return;
        }

        *self.sink.lock().await = None;
        tracing::info!(url = %self.url, clean, "connection closed");
        self.bus.dispatch(&ConnectionEvent::Close { clean, details });
    }

    async fn send(&self, data: String) -> Result<(), SendError> {
        {
            let mut machine = self.machine.lock();
            match machine.state {
                ConnectionState::Opening => {
                    machine.pending.push_back(data);
                    return Ok(());
                }
                ConnectionState::Open => {}
                ConnectionState::Closed | ConnectionState::Closing => {
                    drop(machine);
                    tracing::warn!("send dropped: connection is not open");
                    self.bus.dispatch(&ConnectionEvent::Error {
                        details: "send dropped: connection is not open".to_owned(),
                    });
                    return Err(SendError::NotConnected);
                }
            }
        }

        let mut slot = self.sink.lock().await;
        let Some(sink) = slot.as_mut() else {
            return Err(SendError::NotConnected);
        };
        match sink.send(data.clone()).await {
            Ok(()) => {
                drop(slot);
                self.bus.dispatch(&ConnectionEvent::Request { data });
                Ok(())
            }
            Err(error) => {
                drop(slot);
                self.bus.dispatch(&ConnectionEvent::Error {
                    details: error.to_string(),
                });
                Err(SendError::Transport(error.to_string()))
            }
        }
    }

    async fn close(&self) {
        let action = {
            let mut machine = self.machine.lock();
            match machine.state {
                ConnectionState::Open => {
                    machine.state = ConnectionState::Closing;
                    CloseAction::Graceful
                }
                ConnectionState::Opening => {
                    machine.state = ConnectionState::Closed;
                    machine.epoch += 1;
                    machine.pending.clear();
                    CloseAction::AbortDial(machine.dial_cancel.take())
                }
                ConnectionState::Closing | ConnectionState::Closed => CloseAction::None,
            }
        };

        match action {
            CloseAction::Graceful => {
                self.bus.dispatch(&ConnectionEvent::Closing);
                let mut slot = self.sink.lock().await;
                if let Some(sink) = slot.as_mut() {
                    if let Err(error) = sink.close().await {
                        tracing::warn!(error = %error, "graceful close failed");
                    }
                }
                // The read loop delivers the final Close event once the
                // transport acknowledges.
            }
            CloseAction::AbortDial(cancel) => {
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
                *self.sink.lock().await = None;
                self.bus.dispatch(&ConnectionEvent::Close {
                    clean: true,
                    details: "closed before open completed".to_owned(),
                });
            }
            CloseAction::None => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
