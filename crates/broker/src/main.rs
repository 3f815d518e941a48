use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use piped_broker::{BrokerService, TracingSink};
use piped_queue::Queue;
use piped_rpc::{dispatch, Request};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Broker service: exposes the in-memory job queue over the agent
/// websocket protocol.
#[derive(Parser, Debug)]
#[command(name = "piped-broker")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "PIPED_BROKER_LISTEN", default_value = "0.0.0.0:9999")]
    listen: SocketAddr,

    /// Opaque bearer token agents must present. Forwarded/compared only,
    /// no cryptographic meaning (see SPEC_FULL.md Non-goals).
    #[arg(long, env = "PIPED_BROKER_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let queue = Queue::new();
    let broker = BrokerService::new(queue, Arc::new(TracingSink));

    let app = Router::new()
        .route("/", get(ws_handler))
        .with_state(AppState {
            broker,
            token: cli.token.clone(),
        });

    tracing::info!(listen = %cli.listen, "piped-broker listening");
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    broker: Arc<BrokerService>,
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: axum::http::HeaderMap,
    State(state): State<AppState>,
) -> axum::response::Response {
    if let Some(expected) = &state.token {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != expected {
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state.broker))
}

async fn handle_socket(socket: WebSocket, broker: Arc<BrokerService>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
    let conn_cancel = CancellationToken::new();

    let writer = tokio::spawn(async move {
        while let Some(msg) = write_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut inflight = tokio::task::JoinSet::new();
    while let Some(next) = ws_rx.next().await {
        let msg = match next {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "broker connection read error");
                break;
            }
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let request: Request = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable request frame");
                continue;
            }
        };

        let handler = broker.clone();
        let write_tx = write_tx.clone();
        let cancel = conn_cancel.child_token();
        inflight.spawn(async move {
            let response = dispatch(handler, request, cancel).await;
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = write_tx.send(Message::Text(text));
            }
        });
    }

    conn_cancel.cancel();
    drop(write_tx);
    writer.abort();
    while inflight.join_next().await.is_some() {}
}
