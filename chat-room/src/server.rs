use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::HOST},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{
    message,
    page::{PageError, PageTemplate},
    room::RoomHandle,
    session::Session,
};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    room: RoomHandle,
    page: Arc<PageTemplate>,
}

impl AppState {
    pub fn new(room: RoomHandle, page: PageTemplate) -> Self {
        Self {
            room,
            page: Arc::new(page),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_page))
        .route("/room", get(join_room))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")
}

pub async fn serve_until_ctrl_c(listener: TcpListener, state: AppState) -> Result<()> {
    serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            // Without a signal handler, run until the process is killed.
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    })
    .await
}

async fn serve_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");

    match state.page.render(host).await {
        Ok(html) => Html(html).into_response(),
        Err(PageError::InvalidHost(host)) => {
            debug!(host = %host, "refusing page for invalid host");
            (StatusCode::BAD_REQUEST, "invalid host").into_response()
        }
        Err(err) => {
            error!(error = ?err, "failed to render chat page");
            (StatusCode::INTERNAL_SERVER_ERROR, "chat page unavailable").into_response()
        }
    }
}

async fn join_room(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_failed_upgrade(|err| warn!(error = ?err, "websocket upgrade failed"))
        .on_upgrade(move |socket| run_session(socket, state.room))
}

async fn run_session(socket: WebSocket, room: RoomHandle) {
    let session = match Session::join(room).await {
        Ok(session) => session,
        Err(err) => {
            // Dropping the socket closes the connection.
            warn!(error = %err, "rejecting websocket, room is not running");
            return;
        }
    };
    debug!(session = %session.id(), "websocket session started");

    let (sink, stream) = socket.split();
    session
        .run(message::inbound(stream), message::outbound(sink))
        .await;
}
