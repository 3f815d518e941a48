//! Wire types shared by client and server. Every type here is the JSON shape
//! carried in a JSON-RPC 2.0 `params`/`result` field, never the envelope
//! itself (see `proto`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A job as delivered to an agent over `next`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub timeout: i64,
    pub config: serde_json::Value,
}

/// Label-equality predicate sent with `next`. An empty filter matches every
/// job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Terminal (or in-progress) job state reported via `update`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
    #[serde(default)]
    pub exited: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: String,
}

/// A single log line reported via `log`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogLine {
    pub proc: String,
    pub pos: u64,
    pub out: String,
    pub time: i64,
}

/// Response to `wait`. `cancelled` is explicit rather than overloading the
/// error channel, per the open question this protocol resolves: a clean
/// completion and an explicit cancel must be distinguishable.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitResult {
    pub cancelled: bool,
}

/// Sentinel error string the queue records for an externally cancelled job.
/// The broker's `wait` adapter maps this (and only this) to
/// `WaitResult { cancelled: true }`.
pub const CANCELLED_SENTINEL: &str = "cancelled";
