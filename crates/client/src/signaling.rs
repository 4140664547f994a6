use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientMessage, ParticipantId, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::coordinator::Event;
use crate::errors::TransportError;

/// Connection parameters for one relay attempt.
pub(crate) struct SignalingCtx<'a> {
    pub server_url: &'a str,
    pub room_id: &'a str,
    pub user_id: ParticipantId,
    pub tls_cert_path: Option<&'a str>,
}

/// Build a TLS connector, pinning the server certificate if a cert path is
/// provided. Falls back to system roots if no cert path is given.
fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned server certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to read TLS cert from {cert_path}: {e}, falling back to system roots"
                );
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

/// Connect to the relay, announce ourselves, and bridge the socket to the
/// coordinator: inbound frames become [`Event::Signal`], outbound
/// [`ClientMessage`]s are written to the socket.
///
/// Returns `Ok(())` when the room was left deliberately or the server closed
/// cleanly; any transport fault is an error so the caller can decide whether
/// to reconnect. In both cases a `TransportClosed` event has been delivered
/// (the coordinator distinguishes a leave because it initiated it).
pub(crate) async fn run_bridge(
    ctx: &SignalingCtx<'_>,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    events: &mpsc::Sender<Event>,
) -> Result<(), TransportError> {
    let url = format!(
        "{}/{}?user_id={}",
        ctx.server_url,
        urlencoding::encode(ctx.room_id),
        ctx.user_id
    );

    let connector = build_tls_connector(ctx.tls_cert_path);
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(65_536); // 64KB, plenty for any SDP
    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        &url,
        Some(ws_config),
        false,
        Some(connector),
    )
    .await
    .map_err(|e| TransportError::Connect(e.to_string()))?;

    info!(room = ctx.room_id, user = %ctx.user_id, "Connected to relay");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Announce membership; the relay replies with a roster broadcast
    let join = ClientMessage::Join {
        room_id: ctx.room_id.to_string(),
        user_id: ctx.user_id,
    };
    if let Err(e) = send_json(&mut ws_tx, &join).await {
        let _ = events.send(Event::TransportClosed).await;
        return Err(e);
    }

    let result = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(parsed) => {
                                if events.send(Event::Signal(parsed)).await.is_err() {
                                    break Ok(());
                                }
                            }
                            // Malformed frames are logged and dropped; the
                            // connection stays up
                            Err(e) => warn!("Invalid message from relay: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Relay closed the connection");
                        break Ok(());
                    }
                    None => break Ok(()),
                    Some(Err(e)) => break Err(TransportError::Lost(e.to_string())),
                    _ => {}
                }
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break Ok(()) };
                let leaving = matches!(msg, ClientMessage::Leave { .. });
                if let Err(e) = send_json(&mut ws_tx, &msg).await {
                    break Err(e);
                }
                if leaving {
                    debug!("Leave sent, closing relay socket");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    };

    // The socket is gone; the coordinator tears down every session at once
    let _ = events.send(Event::TransportClosed).await;
    result
}

async fn send_json<S>(ws_tx: &mut S, msg: &ClientMessage) -> Result<(), TransportError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(msg).map_err(|e| TransportError::Lost(e.to_string()))?;
    ws_tx
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Lost(e.to_string()))
}
