//! # Dryer Controller Agent
//!
//! On-device agent for DM510-class industrial grain dryers: polls the
//! controller's Modbus RTU registers, derives debounced alarm events
//! from the raw status bits, and relays state to a supervisory server
//! over a persistent duplex connection while accepting remote commands
//! (register writes, reboot) that interleave safely with polling.
//!
//! ## Architecture
//!
//! - [`registers`] - Static register model: addresses, tags, scaling
//! - [`bus`] - Register I/O engine over the half-duplex serial bus
//! - [`scheduler`] - Bounded read/write queues with write priority
//! - [`alarms`] - Alarm decode, debounce, delivery retry and ack state
//! - [`protocol`] - Supervisory message envelope and payloads
//! - [`uplink`] - Reconnecting server link with heartbeat liveness
//! - [`agent`] - Task wiring and lifecycle
//! - [`config`] - Environment-driven configuration
//! - [`storage`] - Local sample persistence interface
//!
//! ## Quick start
//!
//! ```no_run
//! use dryerlink::agent::DryerAgent;
//! use dryerlink::config::AgentConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AgentConfig::from_env();
//!     if let Ok(mut agent) = DryerAgent::spawn(config).await {
//!         agent.reboot_requested().await;
//!         agent.shutdown().await;
//!     }
//! }
//! ```

#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod alarms;
pub mod bus;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registers;
pub mod scheduler;
pub mod storage;
pub mod uplink;

// Re-export main public types for convenience
pub use agent::DryerAgent;
pub use alarms::{AlarmId, AlarmRegistry, AlarmStage};
pub use config::AgentConfig;
pub use error::AgentError;
pub use registers::Snapshot;

/// Milliseconds since the unix epoch; the timestamp basis for alarm
/// bookkeeping and wire messages.
pub fn unix_time_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
