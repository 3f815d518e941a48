//! Thin adapter from the RPC `Handler` trait to `piped_queue::Queue`
//! (SPEC_FULL.md §4.3).

use std::sync::Arc;

use async_trait::async_trait;
use piped_queue::{Job, Queue};
use piped_rpc::wire::{Filter, LogLine, Pipeline, State, WaitResult, CANCELLED_SENTINEL};
use piped_rpc::Handler;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sink::Sink;

enum SinkEvent {
    Update(String, State),
    Log(String, LogLine),
    Upload(String, String, Vec<u8>),
}

pub struct BrokerService {
    queue: Queue,
    sink_tx: mpsc::UnboundedSender<SinkEvent>,
}

impl BrokerService {
    /// Spawns a background task draining sink events so a slow sink never
    /// blocks `next` dispatch on the same queue mutex.
    pub fn new(queue: Queue, sink: Arc<dyn Sink>) -> Arc<Self> {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<SinkEvent>();
        tokio::spawn(async move {
            while let Some(event) = sink_rx.recv().await {
                match event {
                    SinkEvent::Update(id, state) => sink.on_update(&id, &state).await,
                    SinkEvent::Log(id, line) => sink.on_log(&id, &line).await,
                    SinkEvent::Upload(id, mime, data) => sink.on_upload(&id, &mime, &data).await,
                }
            }
        });
        Arc::new(Self { queue, sink_tx })
    }

    /// Producer-facing entry point: adds a job to the queue.
    pub fn push(&self, job: Job) {
        self.queue.push(job);
    }

    /// External cancel entry point (SPEC_FULL.md §4.3). Whatever decides a
    /// job should be cancelled calls this; the broker has no opinion on
    /// what that trigger is.
    pub fn cancel(&self, id: &str) {
        self.queue.error(id, Some(CANCELLED_SENTINEL.to_string()));
    }
}

fn predicate(filter: Filter) -> piped_queue::Filter {
    Arc::new(move |job: &Job| {
        filter
            .labels
            .iter()
            .all(|(k, v)| job.labels.get(k) == Some(v))
    })
}

#[async_trait]
impl Handler for BrokerService {
    async fn next(&self, filter: Filter, cancel: CancellationToken) -> Option<Pipeline> {
        let job = self.queue.poll(predicate(filter), cancel).await?;
        Some(Pipeline {
            id: job.id,
            timeout: job.timeout_minutes as i64,
            config: job.config,
        })
    }

    async fn wait(&self, id: String, cancel: CancellationToken) -> WaitResult {
        let err = self.queue.wait(&id, cancel).await;
        WaitResult {
            cancelled: err.as_deref() == Some(CANCELLED_SENTINEL),
        }
    }

    async fn extend(&self, id: String) {
        self.queue.extend(&id);
    }

    async fn update(&self, id: String, state: State) {
        let _ = self.sink_tx.send(SinkEvent::Update(id, state));
    }

    async fn upload(&self, id: String, mime: String, data: Vec<u8>) {
        let _ = self.sink_tx.send(SinkEvent::Upload(id, mime, data));
    }

    async fn log(&self, id: String, line: LogLine) {
        let _ = self.sink_tx.send(SinkEvent::Log(id, line));
    }

    async fn done(&self, id: String) {
        self.queue.done(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job(id: &str, labels: &[(&str, &str)]) -> Job {
        Job {
            id: id.to_string(),
            timeout_minutes: 1,
            config: serde_json::Value::Null,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn next_matches_on_label_equality() {
        let service = BrokerService::new(Queue::new(), Arc::new(crate::sink::TracingSink));
        service.push(job("a", &[("platform", "linux/amd64")]));
        service.push(job("b", &[("platform", "windows/amd64")]));

        let mut labels = BTreeMap::new();
        labels.insert("platform".to_string(), "windows/amd64".to_string());
        let got = service.next(Filter { labels }, CancellationToken::new()).await;
        assert_eq!(got.unwrap().id, "b");
    }

    #[tokio::test]
    async fn empty_filter_matches_any_job() {
        let service = BrokerService::new(Queue::new(), Arc::new(crate::sink::TracingSink));
        service.push(job("a", &[("platform", "linux/amd64")]));
        let got = service.next(Filter::default(), CancellationToken::new()).await;
        assert_eq!(got.unwrap().id, "a");
    }

    #[tokio::test]
    async fn external_cancel_is_observed_as_wait_result_cancelled() {
        let service = BrokerService::new(Queue::new(), Arc::new(crate::sink::TracingSink));
        service.push(job("a", &[]));
        let got = service.next(Filter::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(got.id, "a");

        service.cancel("a");
        let result = service.wait("a".to_string(), CancellationToken::new()).await;
        assert!(result.cancelled);
    }

    #[tokio::test]
    async fn clean_completion_is_not_reported_as_cancelled() {
        let service = BrokerService::new(Queue::new(), Arc::new(crate::sink::TracingSink));
        service.push(job("a", &[]));
        service.next(Filter::default(), CancellationToken::new()).await;

        service.done("a".to_string()).await;
        let result = service.wait("a".to_string(), CancellationToken::new()).await;
        assert!(!result.cancelled);
    }
}
