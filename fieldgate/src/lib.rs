//! A fault-isolated [Modbus](http://modbus.org/) polling gateway
//! using [Tokio](https://docs.rs/tokio) and Rust's `async/await` syntax.
//!
//! # Features
//!
//! * Streaming frame reassembly from arbitrarily fragmented byte streams
//! * Modbus TCP (MBAP) and RTU (CRC-16) framings with RTU resynchronization
//! * Panic-free parsing
//! * Per-channel supervision: every device polls inside its own isolated
//!   task, and a crash or protocol desync on one device cannot affect others
//! * Bounded-retry restart policy with configurable backoff and
//!   reset-on-stability
//!
//! # Example
//!
//! A gateway polling one TCP device and printing its values:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use fieldgate::client::{ChannelConfig, PointMapping, PollConfig, TransportConfig};
//! use fieldgate::{AddressRange, Gateway, UnitId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sink, mut events) = tokio::sync::mpsc::channel(64);
//!     let mut gateway = Gateway::new(sink);
//!
//!     let mut config = ChannelConfig::new(
//!         "boiler-plc",
//!         UnitId::new(1),
//!         TransportConfig::Tcp("127.0.0.1:502".parse()?),
//!     );
//!     config.polls.push(PollConfig::new(
//!         Duration::from_secs(1),
//!         AddressRange::try_from(0, 2)?,
//!         vec![
//!             PointMapping::new("pressure", 0),
//!             PointMapping::new("flow", 1),
//!         ],
//!     )?);
//!
//!     gateway.add_channel(config)?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

/// client configuration and the per-channel request API
pub mod client;
/// serial transport settings (RTU framing lives in the core)
pub mod serial;
/// channel supervision: lifecycle state machine and restart policy
pub mod supervisor;

mod constants;
mod decode;
mod error;
mod events;
mod exception;
mod gateway;
mod retry;
mod types;

// internal modules
mod common;
mod tcp;

pub use crate::decode::*;
pub use crate::error::*;
pub use crate::events::*;
pub use crate::exception::ExceptionCode;
pub use crate::gateway::Gateway;
pub use crate::retry::*;
pub use crate::types::*;
