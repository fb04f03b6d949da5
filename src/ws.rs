//! NIP-01 WebSocket server: the relay's client-facing wire protocol.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::conn::frames;
use crate::ingest::{ClientMessage, IngestJob};
use crate::metrics::metrics;
use crate::monitor::MonitorMsg;
use crate::negentropy::NegJob;
use crate::relay::Engine;

/// Start the WebSocket server for client connections.
pub async fn serve_ws(
    addr: SocketAddr,
    engine: Arc<Engine>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(engine);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, engine).await })
}

/// Drive one connection: frames in through the ingester pool, frames
/// out through the connection's bounded queue.
async fn process(socket: WebSocket, engine: Arc<Engine>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(engine.settings.queue_depth);
    let conn = engine.registry.register(outbound_tx);
    tracing::debug!(conn, "connection open");

    let (mut sink, mut stream) = socket.split();
    let pump = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match ClientMessage::parse(&text) {
                Ok(parsed) => {
                    metrics().client_messages.inc(parsed.verb());
                    // Backpressure: a full ingester queue pauses reads
                    // from this socket.
                    if engine
                        .ingest_sender(conn)
                        .send(IngestJob { conn, msg: parsed })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(reject) => {
                    engine
                        .registry
                        .deliver(conn, frames::notice(&reject.to_string()));
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
        if !engine.registry.is_open(conn) {
            break;
        }
    }

    engine.registry.unregister(conn);
    let _ = engine
        .monitor_sender(conn)
        .send(MonitorMsg::Disconnect { conn })
        .await;
    let _ = engine.neg_sender(conn).send(NegJob::Disconnect { conn }).await;
    pump.abort();
    tracing::debug!(conn, "connection closed");
}
