//! TCP accept loop and per-connection device task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{DeviceLink, DeviceRegistry};
use fleet_settings::DeviceSettings;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::framing::{Frame, LineReader};
use super::protocol::{self, ProtocolError};
use super::session::{self, SessionContext, SessionState};
use super::watchdog::{IdleEvent, IdleWatchdog};
use crate::error::{Result, ServerError};

/// Frames buffered between the socket reader and the session loop.
const FRAME_QUEUE: usize = 32;

/// Replies buffered between the session loop and the socket writer.
/// A device that lets this fill up is not reading and gets disconnected.
const WRITE_QUEUE: usize = 1024;

/// How long queued replies may take to flush once the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a device connection ended.
#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    ReadIdle,
    /// The device stopped reading and its reply queue filled up.
    WriteStalled,
    /// Another connection registered the same device id.
    Superseded,
    Shutdown,
    Transport(io::Error),
}

/// Bind the device listener.
pub async fn bind(settings: &DeviceSettings) -> Result<TcpListener> {
    let addr = format!("{}:{}", settings.host, settings.port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Accept device connections until `shutdown` fires.
///
/// Each connection runs on `tracker`, so callers can wait for every
/// session to release its device before exiting.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    settings: Arc<DeviceSettings>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "device listener started");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&registry);
                    let settings = Arc::clone(&settings);
                    let shutdown = shutdown.clone();
                    let _ = tracker.spawn(async move {
                        let _ = run_device_connection(stream, peer, registry, settings, shutdown).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "device accept failed");
                }
            },
            () = shutdown.cancelled() => break,
        }
    }

    info!("device listener stopped");
}

/// Serve one device connection to completion.
///
/// Socket reads and writes each run on their own task, so the session
/// loop keeps polling its timers and close signals even when the device
/// stops draining replies.
pub async fn run_device_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<DeviceRegistry>,
    settings: Arc<DeviceSettings>,
    shutdown: CancellationToken,
) -> CloseReason {
    let link = DeviceLink::with_parent(peer, &shutdown);
    let span = info_span!("device", %peer, link_id = %link.id());
    async move {
        info!("device connected");
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
        let reader = tokio::spawn(
            read_frames(read_half, settings.max_line_length, frame_tx).in_current_span(),
        );
        let (out_tx, out_rx) = mpsc::channel::<String>(WRITE_QUEUE);
        let mut writer = tokio::spawn(write_lines(write_half, out_rx).in_current_span());
        let mut writer_finished = false;

        let ctx = SessionContext {
            registry: &registry,
            link: &link,
        };
        let mut state = SessionState::default();
        let mut watchdog = IdleWatchdog::new(settings.read_idle(), settings.write_idle());

        let reason = 'session: {
            if let Some(greeting) = settings.greeting.as_deref() {
                if let Err(reason) = enqueue(&out_tx, greeting.to_string()) {
                    break 'session reason;
                }
                watchdog.record_write();
            }

            loop {
                let reply = tokio::select! {
                    frame = frames.recv() => {
                        watchdog.record_read();
                        match frame {
                            Some(Ok(Frame::Line(line))) => {
                                debug!(%line, "line received");
                                session::step(&mut state, &line, ctx)
                            }
                            Some(Ok(Frame::TooLong)) => {
                                debug!(limit = settings.max_line_length, "overlong line discarded");
                                Some(ProtocolError::BadFormat.to_string())
                            }
                            Some(Err(e)) => break CloseReason::Transport(e),
                            None => break CloseReason::PeerClosed,
                        }
                    }
                    event = watchdog.expired() => match event {
                        IdleEvent::ReadIdle => break CloseReason::ReadIdle,
                        IdleEvent::WriteIdle => {
                            debug!("write idle, sending ping");
                            Some(protocol::PING.to_string())
                        }
                    },
                    () = link.closed() => {
                        break if shutdown.is_cancelled() {
                            CloseReason::Shutdown
                        } else {
                            CloseReason::Superseded
                        };
                    }
                    joined = &mut writer => {
                        writer_finished = true;
                        break match joined {
                            Ok(Err(e)) => CloseReason::Transport(e),
                            Ok(Ok(())) => CloseReason::PeerClosed,
                            Err(e) => CloseReason::Transport(io::Error::other(e)),
                        };
                    }
                };

                if let Some(reply) = reply {
                    if let Err(reason) = enqueue(&out_tx, reply) {
                        break reason;
                    }
                    watchdog.record_write();
                }
            }
        };

        reader.abort();
        let released = session::close(&mut state, ctx);

        drop(out_tx);
        if !writer_finished {
            let stalled = matches!(reason, CloseReason::WriteStalled);
            if stalled || tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }

        match &reason {
            CloseReason::ReadIdle => warn!(released, "device read idle, connection closed"),
            CloseReason::WriteStalled => {
                warn!(released, queued = WRITE_QUEUE, "device stopped reading, connection closed");
            }
            CloseReason::Transport(e) => warn!(released, error = %e, "device connection failed"),
            other => info!(released, reason = ?other, "device disconnected"),
        }
        reason
    }
    .instrument(span)
    .await
}

/// Queue a reply for the writer task without waiting on the socket.
fn enqueue(out: &mpsc::Sender<String>, line: String) -> std::result::Result<(), CloseReason> {
    match out.try_send(line) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(CloseReason::WriteStalled),
        Err(TrySendError::Closed(_)) => {
            Err(CloseReason::Transport(io::ErrorKind::BrokenPipe.into()))
        }
    }
}

async fn read_frames(
    read_half: OwnedReadHalf,
    max_line: usize,
    tx: mpsc::Sender<io::Result<Frame>>,
) {
    let mut reader = LineReader::new(BufReader::new(read_half), max_line);
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

/// Drain queued lines to the socket, then half-close it.
async fn write_lines(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
) -> io::Result<()> {
    while let Some(line) = rx.recv().await {
        write_line(&mut writer, &line).await?;
    }
    writer.shutdown().await
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}
