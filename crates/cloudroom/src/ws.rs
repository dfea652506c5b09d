//! WebSocket transport for room events and client commands.

use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use cloudroom::Orchestrator;
use cloudroom_protocol::{ClientCommand, RoomEvent};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connected_clients: usize,
    terminals: usize,
}

async fn health(State(orchestrator): State<Orchestrator>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connected_clients: orchestrator.hub().connected_client_count(),
        terminals: orchestrator.terminals().len(),
    })
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Stable client id, so reconnects keep their room memberships.
    client: Option<String>,
}

/// GET /ws?client=<id>
async fn ws_handler(
    State(orchestrator): State<Orchestrator>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = params
        .client
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("WebSocket upgrade request from client {}", client_id);
    ws.on_upgrade(move |socket| handle_connection(socket, orchestrator, client_id))
}

async fn handle_connection(socket: WebSocket, orchestrator: Orchestrator, client_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let hub = orchestrator.hub().clone();
    let (mut event_rx, conn_id) = hub.register_connection(&client_id);

    let send_client = client_id.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        loop {
            let event = tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = ping_interval.tick() => RoomEvent::Ping,
            };
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize {} event: {}", event.kind(), e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                debug!("send to client {} failed, closing writer", send_client);
                break;
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                Ok(ClientCommand::CreateRoom {
                    room_id,
                    image,
                    language,
                }) => {
                    // Image pulls can take minutes; keep reading commands meanwhile.
                    let orchestrator = orchestrator.clone();
                    let client_id = client_id.clone();
                    tokio::spawn(async move {
                        orchestrator
                            .dispatch(
                                &client_id,
                                ClientCommand::CreateRoom {
                                    room_id,
                                    image,
                                    language,
                                },
                            )
                            .await;
                    });
                }
                Ok(command) => orchestrator.dispatch(&client_id, command).await,
                Err(e) => {
                    warn!("Failed to parse command from client {}: {}", client_id, e);
                    hub.send_to_client(
                        &client_id,
                        RoomEvent::Error {
                            message: format!("invalid command: {}", e),
                            room_id: None,
                        },
                    )
                    .await;
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Received binary message from client {}, ignoring", client_id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("Client {} closed WebSocket connection", client_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error for client {}: {}", client_id, e);
                break;
            }
        }
    }

    send_task.abort();
    if hub.unregister_connection(&client_id, conn_id) {
        orchestrator.disconnect(&client_id);
    }
    info!("WebSocket connection closed for client {}", client_id);
}
