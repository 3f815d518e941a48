//! Shared pipeline configuration types and the `Engine` trait the agent
//! loop drives. The container/process backend itself is out of scope; this
//! crate only fixes the interface both the broker (which treats `Config` as
//! an opaque blob) and the agent (which actually drives an `Engine`) agree
//! on.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub mask: bool,
}

/// Terminal state of one step's execution, as reported by `Engine::wait`.
#[derive(Clone, Debug, Default)]
pub struct ExecState {
    pub exited: bool,
    pub exit_code: i32,
    pub oom_killed: bool,
}

/// A step's log stream plus an optional artifact, as returned by
/// `Engine::tail`.
pub struct StepOutput {
    pub log: Pin<Box<dyn AsyncRead + Send>>,
    pub artifact: Option<Artifact>,
}

pub struct Artifact {
    pub mime: String,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

/// Structured execution failure. The agent loop inspects this to fill in
/// `JobState.exit_code` (SPEC_FULL.md §4.4h): `Exit`/`Oom` carry the code
/// through, anything else maps to 1, and an explicit cancel overrides all
/// of them to 130.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("step exited with code {0}")]
    Exit(i32),

    #[error("step killed: out of memory (code {0})")]
    Oom(i32),

    #[error("{0}")]
    Other(String),
}

/// The external collaborator that actually runs steps. Method set follows
/// the original backend's `kubernetes.go` implementation, which includes
/// `kill` alongside `setup`/`exec`/`wait`/`tail`/`destroy`.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn setup(&self, config: &Config) -> Result<(), EngineError>;
    async fn exec(&self, step: &Step) -> Result<(), EngineError>;
    async fn kill(&self, step: &Step) -> Result<(), EngineError>;
    async fn wait(&self, step: &Step) -> Result<ExecState, EngineError>;
    async fn tail(&self, step: &Step) -> Result<StepOutput, EngineError>;
    async fn destroy(&self, config: &Config) -> Result<(), EngineError>;
}
