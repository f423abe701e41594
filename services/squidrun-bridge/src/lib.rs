pub mod backoff;
pub mod client;
pub mod config;

pub use client::{BridgeClient, Delivery, SendOutcome};
pub use config::BridgeConfig;
