//! main.rs — CodLess backend entry point
//!
//! Owns one control loop (see `runtime`) and exposes it over:
//!   1. `/ws`: JSON requests in, replies and the status event stream out
//!   2. `/health`: status snapshot for probes

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use codless_backend::config::AppConfig;
use codless_backend::runtime::{self, ControlHandle, ControlRequest};
use codless_backend::store::JsonFileStore;
use codless_backend::transport::UdpTransport;
use codless_backend::Controller;

// ─── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "codless-backend", about = "CodLess robot motion and dispatch backend")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Override the HTTP/WebSocket port
    #[arg(long)]
    port: Option<u16>,
    /// Start in simulation mode regardless of saved preferences
    #[arg(long)]
    simulate: bool,
    /// Hub UDP address (e.g. a running codless-sim)
    #[arg(long)]
    hub_addr: Option<String>,
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codless_backend=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = AppConfig::load(&args.config).context("invalid backend config")?;
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(addr) = args.hub_addr {
        cfg.transport.hub_addr = addr;
    }

    info!("🤖 CodLess backend starting...");

    let transport = UdpTransport::new(
        cfg.transport.hub_addr.clone(),
        cfg.transport.bind_addr.clone(),
        cfg.transport.max_payload,
    );
    let store = JsonFileStore::new(&cfg.store.dir);
    let port = cfg.server.port;
    let auto_connect = cfg.transport.auto_connect;

    let mut controller = Controller::new(cfg, transport, store, Instant::now());
    controller.restore().await.context("failed to load persisted state")?;
    let (handle, control_task) = runtime::spawn(controller);

    if args.simulate {
        handle
            .request(ControlRequest::SetSimulation { enabled: true })
            .await
            .context("could not enable simulation")?;
    }
    if auto_connect {
        if let Err(e) = handle.request(ControlRequest::Connect).await {
            warn!("Auto-connect failed: {e}");
        }
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .with_state(handle.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("🚀 Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Stop the robot before the loop goes away.
    let _ = handle.request(ControlRequest::EmergencyStop).await;
    drop(handle);
    let _ = control_task.await;
    info!("👋 Backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

async fn health(State(handle): State<ControlHandle>) -> Json<Value> {
    match handle.request(ControlRequest::Status).await {
        Ok(status) => Json(json!({ "ok": true, "status": status })),
        Err(e) => Json(json!({ "ok": false, "error": e.to_string() })),
    }
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(handle): State<ControlHandle>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, handle))
}

async fn handle_ws(mut socket: WebSocket, handle: ControlHandle) {
    let mut events = handle.subscribe();
    info!("🔌 Operator connected");

    // Initial snapshot: status plus recent log history.
    for request in [ControlRequest::Status, ControlRequest::Logs] {
        if let Ok(data) = handle.request(request).await {
            let msg = json!({ "event": "snapshot", "data": data });
            if socket.send(Message::Text(msg.to_string())).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Operator socket lagged, skipped {n} events"),
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_request(&handle, &text).await;
                    if socket.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    info!("🔌 Operator disconnected");
}

/// `{"id": 7, "cmd": "...", "args": {...}}` → `{"reply": 7, "ok": true, "data": ...}`.
async fn handle_request(handle: &ControlHandle, raw: &str) -> Value {
    let mut value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return json!({ "reply": null, "ok": false, "error": format!("malformed JSON: {e}") }),
    };
    let id = value
        .as_object_mut()
        .and_then(|o| o.remove("id"))
        .unwrap_or(Value::Null);

    let request: ControlRequest = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => return json!({ "reply": id, "ok": false, "error": format!("bad request: {e}") }),
    };
    match handle.request(request).await {
        Ok(data) => json!({ "reply": id, "ok": true, "data": data }),
        Err(e) => json!({ "reply": id, "ok": false, "error": e.to_string() }),
    }
}
