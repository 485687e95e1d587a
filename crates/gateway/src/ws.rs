//! WebSocket connection lifecycle: handshake (with auth) → frame loop →
//! cleanup.

use std::sync::Arc;

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    tracing::{debug, info, warn},
};

use relay_protocol::{
    ClientInfo, ErrorKind, ErrorShape, Frame, FrameParseError, HANDSHAKE_TIMEOUT_MS,
    PROGRESS_BUFFER_FRAMES, parse_frame,
};

use crate::{dispatcher, outbound::ConnQueue, state::GatewayState};

pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let queue = Arc::new(ConnQueue::new(PROGRESS_BUFFER_FRAMES));

    // Write loop: sole writer for this socket; drains even after close so
    // terminal frames queued during shutdown still flush.
    let write_queue = Arc::clone(&queue);
    let write_handle = tokio::spawn(async move {
        while let Some(text) = write_queue.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // ── Handshake ────────────────────────────────────────────────────────

    let hello = tokio::time::timeout(
        std::time::Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        wait_for_hello(&mut ws_rx, state.config.max_frame_bytes),
    )
    .await;

    let (token, client) = match hello {
        Ok(Ok(parts)) => parts,
        Ok(Err(reason)) => {
            warn!(reason = %reason, "ws: handshake failed");
            queue.send(&Frame::HelloNak { reason });
            queue.close();
            let _ = write_handle.await;
            return;
        },
        Err(_) => {
            warn!("ws: handshake timeout");
            queue.send(&Frame::HelloNak {
                reason: "handshake timeout".into(),
            });
            queue.close();
            let _ = write_handle.await;
            return;
        },
    };

    if !state.tokens.accepts(&token) {
        warn!(client = %client.name, "ws: auth failed");
        queue.send(&Frame::HelloNak {
            reason: "authentication failed".into(),
        });
        queue.close();
        let _ = write_handle.await;
        return;
    }

    let session = state.sessions.create(client.name.clone(), Arc::clone(&queue));
    queue.send(&Frame::HelloAck {
        session_id: session.id,
        server: state.server_caps(&session.client_name),
    });
    info!(
        session = %session.id,
        client = %client.name,
        client_version = client.version.as_deref().unwrap_or("-"),
        "ws: handshake complete"
    );

    // ── Frame loop ───────────────────────────────────────────────────────

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = session.cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(t))) => t.to_string(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session = %session.id, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > state.config.max_frame_bytes {
            warn!(session = %session.id, size = text.len(), "ws: frame too large, closing");
            queue.send(&Frame::error(
                None,
                ErrorShape::new(
                    ErrorKind::InvalidRequest,
                    format!(
                        "frame of {} bytes exceeds MAX_FRAME_BYTES={}",
                        text.len(),
                        state.config.max_frame_bytes
                    ),
                ),
            ));
            break;
        }

        session.touch(std::time::Instant::now());

        let frame = match parse_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = %session.id, error = %e, "ws: unparseable frame");
                let kind = e.kind();
                queue.send(&Frame::error(None, ErrorShape::new(kind, e.to_string())));
                continue;
            },
        };

        dispatcher::handle_frame(&state, &session, frame).await;
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    let duration = session.created_at.elapsed();
    state.sessions.close(session.id);
    info!(
        session = %session.id,
        duration_secs = duration.as_secs(),
        "ws: connection closed"
    );
    let _ = write_handle.await;
}

/// Wait for the first frame, which must be `hello`.
async fn wait_for_hello(
    rx: &mut futures::stream::SplitStream<WebSocket>,
    max_frame_bytes: usize,
) -> Result<(String, ClientInfo), String> {
    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => return Err("connection closed before handshake".into()),
            Ok(_) => continue,
            Err(e) => return Err(format!("read error during handshake: {e}")),
        };
        if text.len() > max_frame_bytes {
            return Err("handshake frame too large".into());
        }
        return match parse_frame(&text) {
            Ok(Frame::Hello { token, client }) => Ok((token, client)),
            Ok(_) => Err("first frame must be 'hello'".into()),
            Err(FrameParseError::UnknownOp(op)) => Err(format!("unknown op before hello: {op}")),
            Err(FrameParseError::Invalid(e)) => Err(format!("invalid hello frame: {e}")),
        };
    }
    Err("connection closed before handshake".into())
}
