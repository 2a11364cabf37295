//! Port Interfaces
//!
//! Contracts between the connection runtime and its collaborators, following
//! the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Connector`] / [`TransportSink`]: dialing and driving one physical
//!   transport connection. Connect resolving successfully covers the
//!   transport's "ready" signal; everything after that arrives as
//!   [`TransportEvent`]s.
//!
//! ## Collaborator Ports (supplied by domain managers)
//!
//! - [`WireCodec`]: wire text to domain message mapping for one endpoint
//! - [`SessionGate`]: readies a fresh connection (token refresh, login
//!   exchange) before it is announced open; token acquisition itself lives
//!   behind this port, outside the runtime

use async_trait::async_trait;
use tokio::sync::mpsc;

// =============================================================================
// Errors
// =============================================================================

/// Failures at the transport boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Establishing the connection failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// An outbound transmission failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The transport reported a fault while receiving.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Closing the connection failed.
    #[error("close failed: {0}")]
    Close(String),
}

/// Failures while readying a fresh connection for traffic.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The endpoint rejected the session's authorization.
    #[error("session not authorized: {0}")]
    Unauthorized(String),

    /// The readiness exchange itself failed.
    #[error("session handshake failed: {0}")]
    Handshake(String),
}

/// Failures mapping between wire text and domain messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Inbound text did not parse as a known message.
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// A domain message could not be serialized for the wire.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

// =============================================================================
// Transport
// =============================================================================

/// Events produced by a live transport connection after a successful dial.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound message arrived.
    Message(String),
    /// The transport reported a fault; the connection may still be alive.
    Error(TransportError),
    /// The connection ended. `clean` distinguishes a negotiated close from
    /// an abrupt drop.
    Closed {
        /// Whether the close was negotiated.
        clean: bool,
        /// Close code / reason text for diagnostics.
        details: String,
    },
}

/// A dialed transport connection: an outbound sink plus the inbound event
/// stream. Dropping both halves releases the underlying connection.
pub struct Dialed {
    /// Outbound half.
    pub sink: Box<dyn TransportSink>,
    /// Inbound half.
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for Dialed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialed").finish_non_exhaustive()
    }
}

/// Dials one physical connection to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a connection and return it once the transport is ready for
    /// traffic.
    async fn connect(&self, url: &str) -> Result<Dialed, TransportError>;
}

/// Outbound half of a dialed connection.
#[async_trait]
pub trait TransportSink: Send {
    /// Transmit one text frame.
    async fn send(&mut self, data: String) -> Result<(), TransportError>;

    /// Close the connection gracefully. The matching
    /// [`TransportEvent::Closed`] arrives on the event stream.
    async fn close(&mut self) -> Result<(), TransportError>;
}

// =============================================================================
// Session Gate
// =============================================================================

/// Readies a freshly dialed connection before it is announced open.
///
/// Implementations typically fetch or refresh an authorization token and run
/// the endpoint's login exchange over the dialed link. A gate failure fails
/// the dial attempt, so it is absorbed by the same hedged retry that absorbs
/// transport-level connect failures.
#[async_trait]
pub trait SessionGate: Send + Sync + 'static {
    /// Bring the dialed link to a traffic-ready state.
    async fn ready(&self, link: &mut Dialed) -> Result<(), SessionError>;
}

// =============================================================================
// Wire Codec
// =============================================================================

/// Wire text to domain message mapping for one endpoint.
///
/// Decoding may fan one frame out into several messages (batch frames are
/// common); encoding is one message per frame.
pub trait WireCodec: Send + Sync + 'static {
    /// Inbound domain message type.
    type Incoming;
    /// Outbound domain message type.
    type Outgoing;

    /// Decode one inbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] when the frame does not parse.
    fn decode(&self, text: &str) -> Result<Vec<Self::Incoming>, CodecError>;

    /// Encode one outbound message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] when the message cannot be serialized.
    fn encode(&self, message: &Self::Outgoing) -> Result<String, CodecError>;
}

/// JSON codec over serde types; frames may carry either a single message or
/// an array of messages.
#[derive(Debug, Clone)]
pub struct JsonCodec<In, Out> {
    _marker: std::marker::PhantomData<fn() -> (In, Out)>,
}

impl<In, Out> Default for JsonCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> JsonCodec<In, Out> {
    /// Create a JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<In, Out> WireCodec for JsonCodec<In, Out>
where
    In: serde::de::DeserializeOwned + Send + Sync + 'static,
    Out: serde::Serialize + Send + Sync + 'static,
{
    type Incoming = In;
    type Outgoing = Out;

    fn decode(&self, text: &str) -> Result<Vec<In>, CodecError> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('[') {
            Ok(serde_json::from_str(text)?)
        } else {
            Ok(vec![serde_json::from_str(text)?])
        }
    }

    fn encode(&self, message: &Out) -> Result<String, CodecError> {
        serde_json::to_string(message).map_err(|e| CodecError::Encode(e.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
