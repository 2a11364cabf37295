//! Application layer - Ports and cross-cutting services.
//!
//! - `ports`: Transport, codec, and session-gate interfaces that adapters
//!   and domain managers implement
//! - `retry`: Hedged retry combinator used below every connection

pub mod ports;
pub mod retry;
