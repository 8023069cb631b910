//! # jaeger
//!
//! Host controller for a Focal Plane System: a fleet of two-axis robotic
//! fiber positioners on a shared CAN bus. The crate multiplexes a broadcast
//! bus across several hundred endpoints, correlates command replies by wire
//! uid, keeps per-positioner and fleet state machines consistent, and
//! enforces the lock-on-collision safety discipline.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use jaeger::bus::{BusInterface, VirtualBus};
//! use jaeger::config::Config;
//! use jaeger::fps::{Fps, FpsRegistry};
//!
//! # async fn example() -> Result<(), jaeger::error::JaegerError> {
//! let registry = FpsRegistry::new();
//! let bus = Arc::new(VirtualBus::new("virtual0").with_positioners(10));
//! let fps = Fps::create(
//!     &registry,
//!     Config::default(),
//!     vec![bus as Arc<dyn BusInterface>],
//! )
//! .await?;
//!
//! fps.goto(HashMap::from([(1, (90.0, 180.0))]), None, false).await?;
//! fps.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`codec`] - CAN arbitration identifier packing and payload chunking
//! - [`commands`] - command registry and the in-flight `Command` lifecycle
//! - [`bus`] - the `BusInterface` abstraction and the virtual fleet
//! - [`dispatcher`] - send queue, reply demultiplexing, timeouts
//! - [`positioner`] - per-device state
//! - [`fps`] - the fleet aggregate and its high-level operations
//! - [`poller`] - periodic status and position refresh tasks
//! - [`trajectory`] - `goto` and chunked trajectory uploads

#![deny(warnings)]
#![deny(clippy::all)]

pub mod bus;
pub mod codec;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fps;
pub mod logging;
pub mod maskbits;
pub mod poller;
pub mod positioner;
pub mod trajectory;

// Re-export the main public types for convenience.
pub use commands::{Command, CommandID, CommandStatus};
pub use error::JaegerError;
pub use fps::{Fps, FpsRegistry};
pub use maskbits::{FPSStatus, PositionerStatus};
pub use positioner::Positioner;
