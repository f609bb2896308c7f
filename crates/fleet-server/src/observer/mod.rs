//! Observer side: WebSocket sessions and the broadcaster that feeds them.

pub mod broadcast;
pub mod connection;
pub mod messages;
pub mod session;

pub use broadcast::Broadcaster;
pub use connection::ObserverConnection;
pub use messages::{classify, DeviceListEntry, Inbound, PushMessage};
pub use session::run_observer_session;
