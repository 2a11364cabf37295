#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Stream Runtime - Event Distribution & Connection Resilience
//!
//! The shared core every data-access manager in the SDK builds on: managers
//! are thin CRUD wrappers over vendor endpoints; this crate is the runtime
//! underneath them: a reference-counted event bus, a hedged retry
//! combinator, and a reconnecting socket state machine over a raw transport
//! wrapper.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure coordination primitives
//!   - `bus`: Reference-counted publish/subscribe with lifecycle hooks
//!   - `outcome`: Result combinators for concurrent fallible work
//!
//! - **Application**: Ports and cross-cutting services
//!   - `ports`: Transport, codec, and session-gate interfaces
//!   - `retry`: Hedged retry (backoff rounds racing in-flight attempts)
//!
//! - **Infrastructure**: Connection machinery and adapters
//!   - `connection`: Raw transport wrapper + reconnecting state machine
//!   - `heartbeat`: Probe/deadline staleness monitor
//!   - `wake`: Host suspend/resume detector
//!   - `websocket`: WebSocket implementation of the transport port
//!   - `config`: Runtime settings from the environment
//!
//! # Data Flow
//!
//! ```text
//!                       ┌──────────────────────┐
//! manager subscribe ───►│ Reconnecting         │── listen ──┐
//!                       │ Connection           │            ▼
//!                       │  (outage machine)    │      ┌───────────────┐
//!                       └─────────┬────────────┘      │ RawConnection │
//!                                 │ open/close        │  (event bus)  │
//!                                 └───────────────────►───────┬───────┘
//!                                                             │ hedged dial
//!                                                       ┌─────▼─────┐
//!                                                       │ Connector │──► wss://…
//!                                                       └───────────┘
//! ```
//!
//! Subscribing to a connection for the first time acquires the underlying
//! resource (opens the socket); the last unsubscribe releases it. Dialing
//! sits inside the hedged retry combinator, so transient connect failures
//! are absorbed below the reconnect machine's own outage handling.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pure coordination primitives.
pub mod domain;

/// Application layer - Ports and cross-cutting services.
pub mod application;

/// Infrastructure layer - Connection machinery and adapters.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Event bus
pub use domain::bus::{BusEvent, EventBus, Listener, SubscriberId, Subscription};

// Outcome combinators
pub use domain::outcome::{Fault, Raced, await_all, race, wrap};

// Retry
pub use application::retry::{Resilient, RetryConfig, RetryError};

// Ports
pub use application::ports::{
    CodecError, Connector, Dialed, JsonCodec, SessionError, SessionGate, TransportError,
    TransportEvent, TransportSink, WireCodec,
};

// Connections
pub use infrastructure::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, LinkEvent, LinkEventKind, LinkState,
    RawConnection, ReconnectSchedule, ReconnectingConnection, SendError,
};
pub use infrastructure::connection::reconnect::{ElapsedClamp, KeepaliveFrame, ReconnectOptions};

// Heartbeat
pub use infrastructure::heartbeat::{
    HeartbeatConfig, HeartbeatMonitor, HeartbeatSignal, HeartbeatState,
};

// Wake detection
pub use infrastructure::wake::{WakeConfig, WakeDetector, WakeEvent, WakeRegistration};

// WebSocket adapter
pub use infrastructure::websocket::WebSocketConnector;

// Configuration
pub use infrastructure::config::{
    ConfigError, HeartbeatSettings, ReconnectSettings, RetrySettings, RuntimeConfig, WakeSettings,
};
