use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::net::TcpListener;
use tokio::time::interval;
use tower_http::cors::CorsLayer;

use crate::stats::StatsSnapshot;

/// Websocket push period
const PUSH_INTERVAL: Duration = Duration::from_secs(1);

/// What the dashboard reads and the one action it may take
pub trait StatsSource: Send + Sync + 'static {
    fn stats(&self) -> StatsSnapshot;
    fn reset_stats(&self);
}

type SharedSource = Arc<dyn StatsSource>;

pub fn router(source: SharedSource) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/stats/reset", post(reset_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(source)
}

/// Serve the dashboard until the listener fails
pub async fn serve(source: SharedSource, port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("[dashboard] Serving stats at http://{}/stats", addr);
    axum::serve(listener, router(source)).await
}

async fn stats_handler(State(source): State<SharedSource>) -> Json<StatsSnapshot> {
    Json(source.stats())
}

async fn reset_handler(State(source): State<SharedSource>) -> impl IntoResponse {
    log::info!("[dashboard] Stats reset requested");
    source.reset_stats();
    (StatusCode::OK, Json(source.stats()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(source): State<SharedSource>) -> impl IntoResponse {
    ws.on_upgrade(|socket| push_stats(socket, source))
}

async fn push_stats(socket: WebSocket, source: SharedSource) {
    let (mut sender, mut receiver) = socket.split();
    let mut ticker = interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let json = match serde_json::to_string(&source.stats()) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("[dashboard] Cannot encode stats: {}", e);
                        break;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    log::debug!("[dashboard] Websocket client disconnected");
}
