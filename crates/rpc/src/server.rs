//! Server-side method dispatch. Transport-agnostic: a websocket listener
//! (see `piped-broker`) reads frames, calls [`dispatch`] per request — each
//! call spawned as its own task so a parked `next`/`wait` never blocks
//! other calls on the same connection — and writes the resulting
//! [`Response`] back.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::proto::{Request, Response};
use crate::wire::{Filter, LogLine, Pipeline, State, WaitResult};

/// Broker-side implementation of the agent protocol.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn next(&self, filter: Filter, cancel: CancellationToken) -> Option<Pipeline>;
    async fn wait(&self, id: String, cancel: CancellationToken) -> WaitResult;
    async fn extend(&self, id: String);
    async fn update(&self, id: String, state: State);
    async fn upload(&self, id: String, mime: String, data: Vec<u8>);
    async fn log(&self, id: String, line: LogLine);
    async fn done(&self, id: String);
}

#[derive(serde::Deserialize)]
struct IdParams {
    id: String,
}

#[derive(serde::Deserialize)]
struct NextParams {
    #[serde(default)]
    filter: Filter,
}

#[derive(serde::Deserialize)]
struct UpdateParams {
    id: String,
    state: State,
}

#[derive(serde::Deserialize)]
struct UploadParams {
    id: String,
    mime: String,
    data: String,
}

#[derive(serde::Deserialize)]
struct LogParams {
    id: String,
    line: LogLine,
}

/// Dispatches one request to `handler`, returning the response to write
/// back. Never panics on malformed params or an unknown method; both are
/// reported as a JSON-RPC error response instead.
pub async fn dispatch(handler: Arc<dyn Handler>, request: Request, cancel: CancellationToken) -> Response {
    let id = request.id;
    match request.method.as_str() {
        "next" => {
            let params: NextParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return Response::err(id, e.to_string()),
            };
            let job = handler.next(params.filter, cancel).await;
            Response::ok(id, serde_json::to_value(job).unwrap())
        }
        "wait" => {
            let params: IdParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return Response::err(id, e.to_string()),
            };
            let result = handler.wait(params.id, cancel).await;
            Response::ok(id, serde_json::to_value(result).unwrap())
        }
        "extend" => {
            let params: IdParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return Response::err(id, e.to_string()),
            };
            handler.extend(params.id).await;
            Response::ok(id, serde_json::Value::Null)
        }
        "update" => {
            let params: UpdateParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return Response::err(id, e.to_string()),
            };
            handler.update(params.id, params.state).await;
            Response::ok(id, serde_json::Value::Null)
        }
        "upload" => {
            let params: UploadParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return Response::err(id, e.to_string()),
            };
            use base64::Engine;
            let data = match base64::engine::general_purpose::STANDARD.decode(params.data) {
                Ok(d) => d,
                Err(e) => return Response::err(id, format!("invalid base64 payload: {e}")),
            };
            handler.upload(params.id, params.mime, data).await;
            Response::ok(id, serde_json::Value::Null)
        }
        "log" => {
            let params: LogParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return Response::err(id, e.to_string()),
            };
            handler.log(params.id, params.line).await;
            Response::ok(id, serde_json::Value::Null)
        }
        "done" => {
            let params: IdParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return Response::err(id, e.to_string()),
            };
            handler.done(params.id).await;
            Response::ok(id, serde_json::Value::Null)
        }
        other => Response::err(id, format!("{}: {other}", crate::proto::METHOD_NOT_FOUND)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        done_ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn next(&self, filter: Filter, _cancel: CancellationToken) -> Option<Pipeline> {
            if filter.labels.get("platform").map(String::as_str) == Some("linux/amd64") {
                Some(Pipeline {
                    id: "job-1".to_string(),
                    timeout: 10,
                    config: serde_json::Value::Null,
                })
            } else {
                None
            }
        }
        async fn wait(&self, _id: String, _cancel: CancellationToken) -> WaitResult {
            WaitResult { cancelled: false }
        }
        async fn extend(&self, _id: String) {}
        async fn update(&self, _id: String, _state: State) {}
        async fn upload(&self, _id: String, _mime: String, _data: Vec<u8>) {}
        async fn log(&self, _id: String, _line: LogLine) {}
        async fn done(&self, id: String) {
            self.done_ids.lock().unwrap().push(id);
        }
    }

    #[tokio::test]
    async fn next_dispatches_to_handler_and_returns_job() {
        let handler: Arc<dyn Handler> = Arc::new(RecordingHandler::default());
        let request = Request::new(
            1,
            "next",
            serde_json::json!({ "filter": { "labels": { "platform": "linux/amd64" } } }),
        );
        let response = dispatch(handler, request, CancellationToken::new()).await;
        let job: Pipeline = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(job.id, "job-1");
    }

    #[tokio::test]
    async fn done_forwards_id_to_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let request = Request::new(2, "done", serde_json::json!({ "id": "job-1" }));
        let response = dispatch(handler.clone(), request, CancellationToken::new()).await;
        assert!(response.error.is_none());
        assert_eq!(*handler.done_ids.lock().unwrap(), vec!["job-1".to_string()]);
    }

    #[tokio::test]
    async fn unknown_method_returns_protocol_error() {
        let handler: Arc<dyn Handler> = Arc::new(RecordingHandler::default());
        let request = Request::new(3, "teleport", serde_json::Value::Null);
        let response = dispatch(handler, request, CancellationToken::new()).await;
        assert!(response.result.is_none());
        assert!(response.error.unwrap().message.contains("no such method"));
    }

    #[tokio::test]
    async fn malformed_params_return_protocol_error_not_a_panic() {
        let handler: Arc<dyn Handler> = Arc::new(RecordingHandler::default());
        let request = Request::new(4, "update", serde_json::json!({ "id": "job-1" }));
        let response = dispatch(handler, request, CancellationToken::new()).await;
        assert!(response.error.is_some());
    }
}
