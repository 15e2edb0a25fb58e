// SPDX-License-Identifier: MIT OR Apache-2.0
//! Newline-delimited TCP endpoint for legacy connections.
//!
//! The envelope schema is identical to the WebSocket transport; only the
//! framing differs (one JSON envelope per line). A raw socket carries no
//! URL, so the first line must be an `auth_token` envelope whose payload
//! names the session to attach to:
//!
//! ```json
//! {"type":"auth_token","data":{"session_code":"game-1","user_id":"7","username":"mira"}}
//! ```

use std::sync::Arc;

use tavern_error::ErrorCode;
use tavern_protocol::{Envelope, MessageType, WireCodec, generate_client_id};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::broker::SessionCommand;

/// Accept loop for the legacy transport. Runs until the listener errors.
pub async fn serve_legacy_tcp(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "legacy TCP endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "legacy connection accepted");
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_legacy_connection(stream, state).await {
                debug!(%peer, error = %e, "legacy connection ended");
            }
        });
    }
}

async fn handle_legacy_connection(
    stream: TcpStream,
    state: Arc<AppState>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Attach handshake: the first line names the session.
    let attach = loop {
        match lines.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => break line,
            None => return Ok(()),
        }
    };
    let envelope = match WireCodec::decode(attach.trim()) {
        Ok(envelope) if envelope.kind == MessageType::AuthToken => envelope,
        Ok(envelope) => {
            warn!(kind = %envelope.kind, "legacy connection did not start with auth_token");
            let report = ErrorCode::MalformedMessage
                .report("first frame must be auth_token with a session_code")
                .note("got", envelope.kind);
            write_half
                .write_all(
                    WireCodec::encode_line(&Envelope::failure(&report))
                        .unwrap_or_default()
                        .as_bytes(),
                )
                .await?;
            return Ok(());
        }
        Err(e) => {
            let report = e.wire_code().report("attach frame could not be decoded").caused_by(&e);
            write_half
                .write_all(
                    WireCodec::encode_line(&Envelope::failure(&report))
                        .unwrap_or_default()
                        .as_bytes(),
                )
                .await?;
            return Ok(());
        }
    };
    let Some(session_code) = envelope.str_field("session_code").map(str::to_string) else {
        let error = Envelope::error(ErrorCode::MalformedMessage, "auth_token lacks session_code");
        write_half
            .write_all(WireCodec::encode_line(&error).unwrap_or_default().as_bytes())
            .await?;
        return Ok(());
    };
    let client_id = envelope
        .str_field("client_id")
        .map(str::to_string)
        .unwrap_or_else(generate_client_id);
    let user_id = envelope
        .str_field("user_id")
        .unwrap_or("0")
        .to_string();
    let username = envelope
        .str_field("username")
        .unwrap_or("guest")
        .to_string();

    let session = state.manager.session(&session_code).await;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    if !session
        .send(SessionCommand::Join {
            client_id: client_id.clone(),
            user_id,
            username,
            outbound: outbound_tx,
        })
        .await
    {
        return Ok(());
    }
    info!(session = %session_code, client = %client_id, "legacy client attached");

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(text) => {
                    write_half.write_all(text.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                }
                // The broker dropped this client (kick, ban, reap).
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    if !session
                        .send(SessionCommand::Frame {
                            client_id: client_id.clone(),
                            text: line,
                        })
                        .await
                    {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = session
        .send(SessionCommand::Leave {
            client_id: client_id.clone(),
        })
        .await;
    info!(session = %session_code, client = %client_id, "legacy client detached");
    Ok(())
}
