use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    serve, Json, Router,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::chat::{ChatError, ChatSession, ChatSnapshot};

// Envelope for everything pushed over the web socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketMessage {
    pub message_type: String,
    pub payload: ChatSnapshot,
}

impl SocketMessage {
    fn snapshot(payload: ChatSnapshot) -> Self {
        Self {
            message_type: "Snapshot".to_string(),
            payload,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// Shared application state
#[derive(Clone)]
struct AppState {
    templates: Arc<AutoReloader>,
    chat: Arc<ChatSession>,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match self {
            ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChatError::Busy => StatusCode::CONFLICT,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// Minijinja Environment setup
fn create_minijinja_env(templates_dir: PathBuf) -> AutoReloader {
    // Use AutoReloader for development convenience
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&templates_dir));
        // Watch the templates directory for changes
        notifier.watch_path(&templates_dir, true);
        Ok(env)
    })
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, (StatusCode, Html<String>)> {
    let snapshot = state.chat.snapshot();
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => "Mindful Chat",
                    messages => snapshot.messages,
                    pending => snapshot.pending,
                    error => snapshot.error,
                })
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Internal Server Error: {}", e)),
            )
        })
}

async fn get_session(State(state): State<AppState>) -> Json<ChatSnapshot> {
    Json(state.chat.snapshot())
}

async fn post_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<ChatSnapshot>, ChatError> {
    state.chat.send(&request.text).await.map(Json)
}

async fn clear_messages(State(state): State<AppState>) -> Json<ChatSnapshot> {
    Json(state.chat.clear())
}

// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    debug!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_snapshot(sender: &mut SplitSink<WebSocket, Message>, snapshot: ChatSnapshot) -> bool {
    match serde_json::to_string(&SocketMessage::snapshot(snapshot)) {
        Ok(json_msg) => sender.send(Message::Text(json_msg)).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize snapshot: {}", e);
            true
        }
    }
}

// Each connected tab gets the current state, then every change after it.
async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("New WebSocket connection established");
    let mut updates = state.chat.subscribe();
    let (mut sender, mut receiver) = socket.split();

    if !send_snapshot(&mut sender, state.chat.snapshot()).await {
        warn!("Failed to send initial snapshot to new WebSocket client");
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                let snapshot = match update {
                    Ok(snapshot) => snapshot,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "WebSocket client lagged, sending current state");
                        state.chat.snapshot()
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send_snapshot(&mut sender, snapshot).await {
                    warn!("WebSocket client disconnected or send error. Closing connection.");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed WebSocket");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!("Ignoring text message from client: {}", text);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    info!("WebSocket connection closed");
}

/// Builds the application router around an existing chat session.
pub fn router(chat: Arc<ChatSession>, templates_dir: &Path, static_dir: &Path) -> Router {
    let state = AppState {
        templates: Arc::new(create_minijinja_env(templates_dir.to_path_buf())),
        chat,
    };

    Router::new()
        .route("/", get(index_handler))
        .route("/api/session", get(get_session))
        .route("/api/messages", axum::routing::post(post_message).delete(clear_messages))
        .route("/ws", get(ws_handler))
        // Static files live under /static so they never shadow the routes above.
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn start_web_server(
    port: u16,
    chat: Arc<ChatSession>,
    templates_dir: &Path,
    static_dir: &Path,
) -> Result<()> {
    let app = router(chat, templates_dir, static_dir);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Ctrl-C received, initiating shutdown...");
        })
        .await
        .context("Web server failed")?;

    Ok(())
}
