use clap::Parser;

/// Agent: fetches jobs from a broker over the websocket RPC protocol and
/// executes them via the configured engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "piped")]
pub struct Cli {
    /// Broker websocket endpoint.
    #[arg(long, env = "PIPED_ENDPOINT", default_value = "ws://localhost:9999")]
    pub endpoint: String,

    /// Opaque bearer token forwarded to the broker.
    #[arg(long, env = "PIPED_TOKEN")]
    pub token: Option<String>,

    /// Fixed delay between reconnect attempts.
    #[arg(long, env = "PIPED_BACKOFF", default_value = "15s")]
    pub backoff: humantime::Duration,

    /// Maximum consecutive reconnect attempts before a call gives up.
    #[arg(long, env = "PIPED_RETRY_LIMIT", default_value_t = 100)]
    pub retry_limit: u32,

    /// Platform label advertised in the `next` filter.
    #[arg(long, env = "PIPED_PLATFORM", default_value = "linux/amd64")]
    pub platform: String,

    /// Per-step log/artifact cap, in bytes.
    #[arg(long, env = "PIPED_UPLOAD_LIMIT", default_value_t = 5_000_000)]
    pub upload_limit: u64,

    /// Run a single job then exit, instead of looping forever.
    #[arg(long)]
    pub once: bool,
}
