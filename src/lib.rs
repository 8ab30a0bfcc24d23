//! Concurrent EtherCAN interface for a grid of Fibre Positioner Units.
//!
//! See each module for its corresponding component from the design
//! (`C1`-`C10`); [`driver::AsyncDriver`] is the top-level entry point most
//! callers want, backed by [`gateway::GatewayDriver`] for the wire-level
//! TX/RX threads and [`protection::ProtectionLayer`] for the persisted
//! per-FPU position envelopes.

pub mod codec;
pub mod command;
pub mod config;
pub mod devicelock;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod fpu;
pub mod persistence;
pub mod pool;
pub mod protection;
pub mod queue;
pub mod timeout_list;

pub mod gateway;

pub use config::DriverConfig;
pub use driver::AsyncDriver;
pub use error::{DriverError, Result};
pub use fpu::{FpuStateArray, GridState, GridSummary};
