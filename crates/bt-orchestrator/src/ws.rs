//! Websocket adapter for the event bus
//!
//! A client connects to `/ws/{session_id}` (or `/ws?session_id=...`) and
//! receives every event published under that session as one JSON text
//! frame. `/ws` without a session follows all sessions.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use bt_core::{Event, EventBus, SessionFilter};

#[derive(Clone)]
struct WsState {
    bus: EventBus,
    buffer: usize,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

/// Routes serving bus events to websocket clients
pub fn router(bus: EventBus, buffer: usize) -> Router {
    Router::new()
        .route("/ws", get(query_handler))
        .route("/ws/:session_id", get(path_handler))
        .with_state(WsState { bus, buffer })
}

/// Serve the adapter on `listener` until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    bus: EventBus,
    buffer: usize,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Websocket adapter listening on {}", addr);
    }
    axum::serve(listener, router(bus, buffer))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn path_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<WsState>,
) -> Response {
    let filter = SessionFilter::session(session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn query_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SessionQuery>,
    State(state): State<WsState>,
) -> Response {
    let filter = match query.session_id {
        Some(id) if !id.is_empty() => SessionFilter::session(id),
        _ => SessionFilter::All,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

/// Forward matching events until either side goes away
async fn handle_socket(socket: WebSocket, state: WsState, filter: SessionFilter) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.bus.subscribe(filter, state.buffer);
    tracing::debug!(subscription = subscription.id(), "Websocket client joined");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let Some(message) = encode(&event) else { continue };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Websocket receive error: {}", e);
                    break;
                }
            },
        }
    }

    if subscription.dropped() > 0 {
        tracing::warn!(
            subscription = subscription.id(),
            "Websocket client fell behind; {} events dropped",
            subscription.dropped()
        );
    }
    state.bus.unsubscribe(&subscription);
    tracing::debug!(subscription = subscription.id(), "Websocket client left");
}

fn encode(event: &Event) -> Option<Message> {
    match event.to_wire().to_json() {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::warn!("Dropping unencodable event: {}", e);
            None
        }
    }
}
