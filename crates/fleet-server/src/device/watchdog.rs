//! Read-idle / write-idle timers for one device connection.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Which idle timer fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleEvent {
    /// Nothing received for the read-idle window. Fatal.
    ReadIdle,
    /// Nothing sent for the write-idle window. Probe and carry on.
    WriteIdle,
}

/// Two independent idle deadlines.
///
/// The connection loop calls [`record_read`](Self::record_read) and
/// [`record_write`](Self::record_write) on traffic and races
/// [`expired`](Self::expired) against its socket.
#[derive(Debug)]
pub struct IdleWatchdog {
    read_idle: Duration,
    write_idle: Duration,
    read_deadline: Instant,
    write_deadline: Instant,
}

impl IdleWatchdog {
    pub fn new(read_idle: Duration, write_idle: Duration) -> Self {
        let now = Instant::now();
        Self {
            read_idle,
            write_idle,
            read_deadline: now + read_idle,
            write_deadline: now + write_idle,
        }
    }

    pub fn record_read(&mut self) {
        self.read_deadline = Instant::now() + self.read_idle;
    }

    pub fn record_write(&mut self) {
        self.write_deadline = Instant::now() + self.write_idle;
    }

    /// Resolves when the earlier deadline passes. Read-idle wins a tie.
    ///
    /// Cancel safe; dropping the future leaves the deadlines untouched.
    pub async fn expired(&self) -> IdleEvent {
        tokio::select! {
            biased;
            () = sleep_until(self.read_deadline) => IdleEvent::ReadIdle,
            () = sleep_until(self.write_deadline) => IdleEvent::WriteIdle,
        }
    }
}
