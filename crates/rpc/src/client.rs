//! Auto-reconnecting RPC client.
//!
//! One `tokio::sync::Mutex` guards the current connection and a sticky
//! `closed` flag, matching the concurrency model in SPEC_FULL.md §4.2/§5.
//! A reader task demultiplexes responses by request id into a map of
//! one-shot channels; a writer task serializes outgoing frames onto the
//! socket. `call` never holds the connection lock while awaiting a
//! response, so calls interleave freely over one connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::proto::{Request, Response};
use crate::wire::{Filter, LogLine, Pipeline, State, WaitResult};

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>>>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Static configuration for a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub backoff: Duration,
    pub retry_limit: u32,
}

struct Connection {
    write_tx: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct ConnState {
    conn: Option<Connection>,
    closed: bool,
}

/// A connected RPC peer implementing the agent protocol.
pub struct Client {
    cfg: ClientConfig,
    state: AsyncMutex<ConnState>,
    next_id: AtomicU64,
}

async fn dial(cfg: &ClientConfig) -> Result<Connection, RpcError> {
    let mut request = cfg
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    if let Some(token) = &cfg.token {
        let value = token
            .parse()
            .map_err(|_| RpcError::Transport("invalid token header value".to_string()))?;
        request.headers_mut().insert("authorization", value);
    }

    let (ws, _) = connect_async(request)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    let (sink, stream) = ws.split();

    let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(writer_task(sink, write_rx));
    let reader = tokio::spawn(reader_task(stream, pending.clone()));

    Ok(Connection {
        write_tx,
        pending,
        reader,
        writer,
    })
}

async fn writer_task(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

async fn reader_task(mut stream: futures_util::stream::SplitStream<WsStream>, pending: PendingMap) {
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "rpc read error, closing connection");
                break;
            }
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let response: Response = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable rpc frame");
                continue;
            }
        };
        if let Some(tx) = pending.lock().unwrap().remove(&response.id) {
            let result = match response.error {
                Some(e) => Err(RpcError::Protocol(e.message)),
                None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
            };
            let _ = tx.send(result);
        }
    }
    drain_pending(&pending);
}

fn drain_pending(pending: &PendingMap) {
    let mut map = pending.lock().unwrap();
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(RpcError::Transport("connection closed".to_string())));
    }
}

impl Client {
    /// Dials once (no retry). A failure here is the fatal startup error the
    /// agent process should exit on.
    pub async fn connect(cfg: ClientConfig) -> Result<Self, RpcError> {
        let conn = dial(&cfg).await?;
        Ok(Self {
            cfg,
            state: AsyncMutex::new(ConnState {
                conn: Some(conn),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Sticky close: further reopen attempts fail immediately.
    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        guard.closed = true;
        if let Some(conn) = guard.conn.take() {
            conn.shutdown();
        }
    }

    async fn reopen(&self) -> Result<(), RpcError> {
        let mut guard = self.state.lock().await;
        if guard.closed {
            return Err(RpcError::Closed);
        }
        if let Some(old) = guard.conn.take() {
            old.shutdown();
        }
        let conn = dial(&self.cfg).await?;
        guard.conn = Some(conn);
        Ok(())
    }

    async fn send_once(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let (write_tx, pending) = {
            let guard = self.state.lock().await;
            if guard.closed {
                return Err(RpcError::Closed);
            }
            match &guard.conn {
                Some(c) => (c.write_tx.clone(), c.pending.clone()),
                None => return Err(RpcError::Transport("not connected".to_string())),
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);

        let request = Request::new(id, method, params);
        let text = serde_json::to_string(&request)?;
        if write_tx.send(Message::Text(text)).is_err() {
            pending.lock().unwrap().remove(&id);
            return Err(RpcError::Transport("writer task closed".to_string()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Transport(
                "connection dropped while awaiting response".to_string(),
            )),
        }
    }

    /// Issues `method`, retrying reopen up to `retry_limit` times with a
    /// fixed backoff on transport failure, re-issuing the call exactly once
    /// after a successful reopen.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        match self.send_once(method, params.clone()).await {
            Ok(v) => return Ok(v),
            Err(RpcError::Closed) => return Err(RpcError::Closed),
            Err(e) if e.is_transport() => {}
            Err(e) => return Err(e),
        }

        let mut last_err = RpcError::Transport("retry budget exhausted".to_string());
        let mut reopened = false;
        for _ in 0..self.cfg.retry_limit {
            match self.reopen().await {
                Ok(()) => {
                    reopened = true;
                    break;
                }
                Err(RpcError::Closed) => return Err(RpcError::Closed),
                Err(e) => {
                    last_err = e;
                    tokio::time::sleep(self.cfg.backoff).await;
                }
            }
        }
        if !reopened {
            return Err(last_err);
        }
        self.send_once(method, params).await
    }

    /// Races `call` against `cancel`. `Ok(None)` means the caller's context
    /// cancelled locally before a response arrived; the underlying call may
    /// still complete server-side, its response simply uncollected.
    async fn call_cancellable(
        &self,
        method: &str,
        params: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<Option<serde_json::Value>, RpcError> {
        tokio::select! {
            res = self.call(method, params) => res.map(Some),
            _ = cancel.cancelled() => Ok(None),
        }
    }

    pub async fn next(&self, filter: Filter, cancel: CancellationToken) -> Result<Option<Pipeline>, RpcError> {
        let params = serde_json::json!({ "filter": filter });
        match self.call_cancellable("next", params, cancel).await? {
            None => Ok(None),
            Some(serde_json::Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
        }
    }

    pub async fn wait(&self, id: &str, cancel: CancellationToken) -> Result<Option<WaitResult>, RpcError> {
        let params = serde_json::json!({ "id": id });
        match self.call_cancellable("wait", params, cancel).await? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
        }
    }

    pub async fn extend(&self, id: &str) -> Result<(), RpcError> {
        self.call("extend", serde_json::json!({ "id": id })).await?;
        Ok(())
    }

    pub async fn update(&self, id: &str, state: &State) -> Result<(), RpcError> {
        self.call("update", serde_json::json!({ "id": id, "state": state }))
            .await?;
        Ok(())
    }

    pub async fn upload(&self, id: &str, mime: &str, data: &[u8]) -> Result<(), RpcError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.call(
            "upload",
            serde_json::json!({ "id": id, "mime": mime, "data": encoded }),
        )
        .await?;
        Ok(())
    }

    pub async fn log(&self, id: &str, line: &LogLine) -> Result<(), RpcError> {
        self.call("log", serde_json::json!({ "id": id, "line": line })).await?;
        Ok(())
    }

    pub async fn done(&self, id: &str) -> Result<(), RpcError> {
        self.call("done", serde_json::json!({ "id": id })).await?;
        Ok(())
    }
}
