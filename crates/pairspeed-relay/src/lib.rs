//! WebSocket relay that assigns session identifiers and forwards
//! base64(JSON) payloads between sessions.

pub mod connection;
pub mod dispatcher;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};

pub use dispatcher::Dispatcher;

/// Routes served by the relay: `GET /signal` upgrades to a relay session.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/signal", get(ws_upgrade))
        .with_state(dispatcher)
}

async fn ws_upgrade(State(dispatcher): State<Dispatcher>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher))
}
