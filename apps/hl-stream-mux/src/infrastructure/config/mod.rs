//! Configuration module.
//!
//! Environment-variable driven settings for the multiplexer.

mod settings;

pub use settings::{MuxConfig, Network, ServerSettings, WebSocketSettings};
