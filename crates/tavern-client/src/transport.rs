// SPDX-License-Identifier: MIT OR Apache-2.0
//! Concrete transports behind the send-callback seam.
//!
//! The protocol layer only ever sees a [`SendFn`] and a stream of decoded
//! envelopes; these adapters bind that seam to a WebSocket or to the
//! legacy newline-delimited TCP framing.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tavern_protocol::{Envelope, WireCodec};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::session::SendFn;

/// Transport bring-up failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// WebSocket handshake failure.
    #[error("websocket connect failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// TCP connect failure.
    #[error("tcp connect failed: {0}")]
    Tcp(#[from] std::io::Error),
}

/// A running transport: the outbound callback plus the inbound envelope
/// stream. Dropping the receiver tears the connection down.
pub struct Transport {
    /// Hand this to the protocol layer as its send callback.
    pub send: SendFn,
    /// Decoded inbound envelopes.
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Connect a WebSocket transport.
///
/// `url` is the full endpoint, e.g.
/// `ws://host:8780/ws/game/CODE?user_id=7&username=mira`.
pub async fn connect_websocket(url: &str) -> Result<Transport, TransportError> {
    let (socket, _) = connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let Ok(text) = WireCodec::encode(&envelope) else {
                warn!(kind = %envelope.kind, "unencodable outbound envelope");
                continue;
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match WireCodec::decode(text.as_str()) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable inbound frame"),
                },
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(other) => debug!(?other, "ignoring non-text frame"),
            }
        }
    });

    let send: SendFn = Arc::new(move |envelope| {
        let _ = outbound_tx.send(envelope);
    });
    Ok(Transport {
        send,
        inbound: inbound_rx,
    })
}

/// Connect the legacy newline-delimited TCP transport.
pub async fn connect_tcp(addr: &str) -> Result<Transport, TransportError> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let Ok(line) = WireCodec::encode_line(&envelope) else {
                continue;
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match WireCodec::decode(line.trim()) {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "undecodable inbound line"),
            }
        }
    });

    let send: SendFn = Arc::new(move |envelope| {
        let _ = outbound_tx.send(envelope);
    });
    Ok(Transport {
        send,
        inbound: inbound_rx,
    })
}
