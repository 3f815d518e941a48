//! Destination for `update`/`log`/`upload` calls. The real destination
//! (object storage, a log index, a status API) is out of scope; this trait
//! is the seam, and [`TracingSink`] is a usable default so the broker runs
//! standalone.

use async_trait::async_trait;
use piped_rpc::wire::{LogLine, State};

#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn on_update(&self, id: &str, state: &State);
    async fn on_log(&self, id: &str, line: &LogLine);
    async fn on_upload(&self, id: &str, mime: &str, data: &[u8]);
}

pub struct TracingSink;

#[async_trait]
impl Sink for TracingSink {
    async fn on_update(&self, id: &str, state: &State) {
        tracing::info!(job_id = id, exit_code = state.exit_code, exited = state.exited, error = %state.error, "job update");
    }

    async fn on_log(&self, id: &str, line: &LogLine) {
        tracing::debug!(job_id = id, proc = %line.proc, pos = line.pos, "{}", line.out);
    }

    async fn on_upload(&self, id: &str, mime: &str, data: &[u8]) {
        tracing::info!(job_id = id, mime, bytes = data.len(), "job artifact uploaded");
    }
}
