//! Observer session lifecycle, from WebSocket upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use fleet_core::ObserverId;
use fleet_settings::ObserverSettings;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::broadcast::Broadcaster;
use super::connection::ObserverConnection;
use super::messages::{classify, Inbound};

/// How long queued pushes may take to flush after the reader stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a WebSocket session for one observer.
///
/// 1. Registers the observer with the broadcaster
/// 2. Forwards queued pushes and periodic Ping frames to the socket
/// 3. Answers inbound text (device-list request or echo)
/// 4. Unregisters on disconnect or shutdown
#[instrument(skip_all, fields(observer_id = %observer_id))]
pub async fn run_observer_session(
    ws: WebSocket,
    observer_id: ObserverId,
    broadcaster: Arc<Broadcaster>,
    settings: Arc<ObserverSettings>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(settings.send_queue.max(1));
    let connection = Arc::new(ObserverConnection::new(observer_id.clone(), send_tx));
    broadcaster.add_observer(Arc::clone(&connection));
    info!("observer connected");

    let ping_every = settings.ping_interval().max(Duration::from_secs(1));
    let writer_shutdown = shutdown.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => match msg {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                () = writer_shutdown.cancelled() => break,
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = shutdown.cancelled() => {
                debug!("shutdown, closing observer");
                break;
            }
        };
        let text = match frame {
            Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    debug!(len = data.len(), "non-UTF8 binary frame ignored");
                    continue;
                }
            },
            // axum answers pings itself
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => {
                info!("observer sent close frame");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "observer socket error");
                break;
            }
            None => break,
        };
        handle_text(&text, &connection, &broadcaster);
    }

    let _ = broadcaster.remove_observer(&observer_id);
    let dropped = connection.drop_count();
    let connected_secs = connection.age().as_secs();
    drop(connection);
    // The queue is closed now; let the writer drain what is left.
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(dropped, connected_secs, "observer disconnected");
}

/// Act on one inbound text frame.
pub(crate) fn handle_text(text: &str, connection: &ObserverConnection, broadcaster: &Broadcaster) {
    match classify(text) {
        Inbound::RequestDeviceList => {
            let recipients = broadcaster.broadcast_device_list();
            debug!(recipients, "device list requested");
        }
        Inbound::Echo(reply) => {
            if !connection.send(Arc::new(reply)) {
                warn!("failed to enqueue echo (queue full or closed)");
            }
        }
        Inbound::Ignored => {
            debug!(text, "unrecognised observer request ignored");
        }
    }
}
