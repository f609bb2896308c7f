//! Per-connection device session state machine.
//!
//! The state is a plain value owned by the connection task and threaded
//! through [`step`] once per inbound line. Nothing here touches the socket;
//! the caller writes whatever reply `step` returns.

use fleet_core::{DeviceLink, DeviceRegistry, Registration};
use tracing::{debug, info};

use super::protocol::{self, Command, ProtocolError};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Unregistered,
    Registered {
        device_id: String,
    },
    Closed,
}

impl SessionState {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Registered { device_id } => Some(device_id),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// What a session step needs besides its own state.
#[derive(Clone, Copy)]
pub struct SessionContext<'a> {
    pub registry: &'a DeviceRegistry,
    pub link: &'a DeviceLink,
}

/// Process one inbound line and return the reply to send, if any.
///
/// Protocol errors never change the state; they only produce a reply.
pub fn step(state: &mut SessionState, line: &str, ctx: SessionContext<'_>) -> Option<String> {
    if state.is_closed() {
        return None;
    }
    match handle(state, line, ctx) {
        Ok(reply) => reply,
        Err(e) => {
            debug!(link_id = %ctx.link.id(), line, reply = %e, "protocol error");
            Some(e.to_string())
        }
    }
}

fn handle(
    state: &mut SessionState,
    line: &str,
    ctx: SessionContext<'_>,
) -> Result<Option<String>, ProtocolError> {
    let command = protocol::parse_line(line)?;
    debug!(link_id = %ctx.link.id(), command = command.name(), "command parsed");
    match command {
        Command::Register { id, name, kind } => Ok(Some(register(state, id, name, kind, ctx))),
        command => {
            let device_id = state.device_id().ok_or(ProtocolError::NotRegistered)?;
            on_registered(device_id, command, ctx)
        }
    }
}

fn on_registered(
    device_id: &str,
    command: Command,
    ctx: SessionContext<'_>,
) -> Result<Option<String>, ProtocolError> {
    match command {
        Command::Heartbeat { id } => {
            if id != device_id {
                debug!(device_id, claimed = %id, "heartbeat names another id");
            }
            let _ = ctx.registry.touch_heartbeat(device_id);
            debug!(device_id, "heartbeat");
            Ok(Some(protocol::HEARTBEAT_OK.to_string()))
        }
        Command::Data { payload } => {
            debug!(device_id, bytes = payload.len(), "data report");
            let _ = ctx.registry.record_data(device_id, &payload);
            Ok(Some(protocol::DATA_RECEIVED.to_string()))
        }
        Command::Pong { id } => {
            if id != device_id {
                return Err(ProtocolError::IdMismatch);
            }
            let _ = ctx.registry.touch_heartbeat(device_id);
            debug!(device_id, "pong");
            Ok(None)
        }
        // Routed to `register` by the caller.
        Command::Register { .. } => Ok(None),
    }
}

fn register(
    state: &mut SessionState,
    id: String,
    name: String,
    kind: String,
    ctx: SessionContext<'_>,
) -> String {
    if let Some(previous) = state.device_id() {
        if previous != id {
            info!(from = previous, to = %id, "session switching device id");
            let _ = ctx.registry.release(previous, ctx.link.id());
        }
    }

    let peer = ctx.link.peer();
    let reply = protocol::registered_reply(&id);
    let _ = ctx.registry.register_online(
        Registration {
            id: id.clone(),
            name,
            kind,
            address: peer.ip().to_string(),
            port: peer.port(),
        },
        ctx.link.clone(),
    );
    *state = SessionState::Registered { device_id: id };
    reply
}

/// End the session. A registered device is marked offline unless another
/// connection has since taken over its id.
pub fn close(state: &mut SessionState, ctx: SessionContext<'_>) -> bool {
    let released = match state.device_id() {
        Some(device_id) => ctx.registry.release(device_id, ctx.link.id()),
        None => false,
    };
    *state = SessionState::Closed;
    released
}
