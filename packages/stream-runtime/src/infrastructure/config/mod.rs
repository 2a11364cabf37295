//! Configuration Module
//!
//! Typed runtime settings with environment-variable loading.

mod settings;

pub use settings::{
    ConfigError, HeartbeatSettings, ReconnectSettings, RetrySettings, RuntimeConfig, WakeSettings,
};
