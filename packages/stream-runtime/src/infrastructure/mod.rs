//! Infrastructure layer - Connection machinery and adapters.
//!
//! - `connection`: Raw transport wrapper and the reconnecting state machine
//! - `heartbeat`: Ping/pong staleness monitor
//! - `wake`: Host suspend/resume detector
//! - `websocket`: WebSocket implementation of the transport port
//! - `config`: Runtime settings loaded from the environment

pub mod config;
pub mod connection;
pub mod heartbeat;
pub mod wake;
pub mod websocket;
