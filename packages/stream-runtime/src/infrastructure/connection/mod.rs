//! Connection Runtime
//!
//! Two layers compose the connection stack:
//!
//! - [`raw`]: one physical transport connection wrapped as an event bus,
//!   with hedged dialing and FIFO send buffering,
//! - [`reconnect`]: a logical connection whose identity survives drops,
//!   auto-reconnecting with backoff and announcing each outage exactly once.

pub mod raw;
pub mod reconnect;

pub use raw::{ConnectionEvent, ConnectionEventKind, ConnectionState, RawConnection, SendError};
pub use reconnect::{
    LinkEvent, LinkEventKind, LinkState, ReconnectSchedule, ReconnectingConnection,
};
