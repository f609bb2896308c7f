//! # fleet-core
//!
//! Device state shared by every connection: the [`DeviceRecord`] data model,
//! the [`DeviceRegistry`] that owns it, and the [`ChangeHub`] that carries
//! registry change notifications to subscribers.

#![deny(unsafe_code)]

pub mod device;
pub mod ids;
pub mod notify;
pub mod registry;

pub use device::{DeviceRecord, DeviceStatus};
pub use ids::{LinkId, ObserverId};
pub use notify::{ChangeHub, ListenerError, ListenerId, ListenerKind, Notification};
pub use registry::{DeviceLink, DeviceRegistry, Registration};
