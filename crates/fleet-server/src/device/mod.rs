//! Device side: line protocol, session state machine, idle watchdog and
//! the TCP listener that drives them.

pub mod framing;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod watchdog;

pub use listener::{bind, run_device_connection, serve, CloseReason};
pub use protocol::{parse_line, Command, ProtocolError};
pub use session::{SessionContext, SessionState};
pub use watchdog::{IdleEvent, IdleWatchdog};
