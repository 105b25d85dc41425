//! Gateway HTTP server (single port): log stream, chat stream, screenshot.

use crate::capture::{CommandCapture, ScreenCapture};
use crate::chat::{ChatEvent, ChatRequest, ChatService};
use crate::config::{self, Config};
use crate::llm::{ChatBackend, GeminiClient};
use crate::log_stream::LogBroadcaster;
use crate::session::ConversationSession;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};

/// Shared state for the gateway. Owns the one conversation (inside `chat`) and the one log queue.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub chat: ChatService,
    pub logs: LogBroadcaster,
    pub capture: Arc<dyn ScreenCapture>,
    /// Flipped to true on shutdown so infinite log streams end and the server can drain.
    shutdown: Arc<watch::Sender<bool>>,
}

impl GatewayState {
    /// Seed the conversation from the configured system prompt and wire the collaborators.
    pub fn new(
        config: Config,
        backend: Arc<dyn ChatBackend>,
        capture: Arc<dyn ScreenCapture>,
        logs: LogBroadcaster,
    ) -> Self {
        logs.set_capacity(config.log_stream.capacity);
        let session = ConversationSession::initialize(config.prompt.system_prompt.clone()).into_shared();
        let chat = ChatService::new(
            session,
            backend,
            Duration::from_secs(config.chat.stream_timeout_secs),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            chat,
            logs,
            capture,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Resolves once shutdown has started.
    fn shutdown_started(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }
}

/// Build the HTTP routes. CORS is open: the page is served from a local file or dev server.
pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/", get(health_http))
        .route("/log-stream", get(log_stream))
        .route("/chat", post(chat))
        .route("/screenshot", get(screenshot))
        .layer(cors)
        .with_state(state)
}

/// Serve on an already-bound listener until `signal` resolves, then close log streams and drain.
pub async fn serve<F>(listener: TcpListener, state: GatewayState, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signal.await;
            log::info!("shutdown signal received, closing streams");
            let _ = shutdown.send(true);
        })
        .await
        .context("gateway server exited")
}

/// Run the gateway: validate config, apply the proxy, build the Gemini client, bind, serve.
/// Config problems are returned before the port is bound. Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config, logs: LogBroadcaster) -> Result<()> {
    let api_key = config::validate(&config)?;

    log::info!("initializing gemini ({})", config.gemini.model);
    if let Some(proxy) = config::resolve_proxy(&config) {
        log::info!("using proxy: {}", proxy);
        config::apply_proxy(&proxy);
    }
    let backend = Arc::new(GeminiClient::new(
        api_key,
        config.gemini.model.clone(),
        Some(config.gemini.base_url.clone()),
    ));
    let capture = Arc::new(CommandCapture::new(config.capture.command.clone()));
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let state = GatewayState::new(config, backend, capture, logs);
    log::info!("gemini initialized");

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    serve(listener, state, shutdown_signal()).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// SSE field values may not contain carriage returns; normalize them to newlines.
fn sse_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Marks the final frame of a failed exchange.
pub const CHAT_ERROR_PREFIX: &str = "**Error**: ";

/// Encode one chat event as `data: <text>\n\n` frames.
///
/// The browser reader splits the body on blank lines and renders every block that starts with
/// `data: `, so the text goes out raw on a single `data:` field and line breaks inside it survive.
/// A blank line would end the frame early: text is cut into one frame per paragraph and trailing
/// newlines are trimmed. Errors are ordinary frames carrying [`CHAT_ERROR_PREFIX`].
fn chat_frames(event: ChatEvent) -> String {
    let text = match event {
        ChatEvent::Fragment(text) => sse_text(&text),
        ChatEvent::Error(message) => format!("{}{}", CHAT_ERROR_PREFIX, sse_text(&message)),
    };
    text.split("\n\n")
        .map(|paragraph| paragraph.trim_end_matches('\n'))
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| format!("data: {}\n\n", paragraph))
        .collect()
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// GET / returns a simple health JSON (for probes). `turns` is null while a chat holds the session.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let turns = state.chat.session().try_lock().map(|s| s.len()).ok();
    Json(json!({
        "runtime": "running",
        "model": state.chat.backend().model(),
        "port": state.config.gateway.port,
        "turns": turns,
        "pendingLogs": state.logs.len(),
    }))
}

/// GET /log-stream drains the log queue as an endless SSE stream.
async fn log_stream(
    State(state): State<GatewayState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    log::info!("log viewer connected");
    let poll = Duration::from_millis(state.config.log_stream.poll_interval_ms.max(1));
    let stream = state
        .logs
        .open_stream(poll)
        .map(|entry| Ok(Event::default().data(sse_text(&entry.line()))))
        .take_until(state.shutdown_started());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// POST /chat streams the model's reply. Input errors get a JSON 400 instead of a stream.
async fn chat(
    State(state): State<GatewayState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            log::warn!("rejected chat request: {}", rejection.body_text());
            return json_error(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    let chat = match request.validate() {
        Ok(chat) => chat,
        Err(e) => {
            log::warn!("rejected chat request: {}", e);
            return json_error(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    // The exchange runs in its own task; dropping the body drops `rx`, which cancels it.
    let (rx, _exchange) = state.chat.start(chat);
    let frames = UnboundedReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(chat_frames(event)));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

/// GET /screenshot returns the screen as base64 PNG.
async fn screenshot(State(state): State<GatewayState>) -> Response {
    log::info!("screenshot requested");
    match state.capture.capture_png().await {
        Ok(png) => {
            let image = base64::engine::general_purpose::STANDARD.encode(&png);
            log::info!("screenshot captured and encoded ({} bytes)", png.len());
            Json(json!({ "image": image })).into_response()
        }
        Err(e) => {
            log::error!("screenshot failed: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
