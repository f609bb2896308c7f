//! # fleet-server
//!
//! Network side of the fleet hub:
//!
//! - [`device`]: newline-delimited TCP protocol spoken by devices, with a
//!   per-connection session state machine and read/write idle watchdog.
//! - [`observer`]: WebSocket sessions for dashboards and the broadcaster
//!   that pushes registry changes to them.
//! - [`server`]: binds both listeners and wires them to one registry.

#![deny(unsafe_code)]

pub mod device;
pub mod error;
pub mod health;
pub mod observer;
pub mod server;
pub mod shutdown;

pub use error::{Result, ServerError};
pub use observer::{Broadcaster, PushMessage};
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
