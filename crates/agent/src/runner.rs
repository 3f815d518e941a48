//! Drives the `Engine` collaborator through one job's stages/steps
//! (SPEC_FULL.md §4.4f), streaming logs and artifacts under a byte cap and
//! injecting the `CI_BUILD_*` trace environment per step.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use piped_backend::{Config, Engine, EngineError, Step, StepOutput};
use piped_rpc::wire::LogLine;
use piped_rpc::{Client, RpcError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::redact::redact;
use crate::trace::Tracer;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn step_label(step: &Step) -> &str {
    if step.alias.is_empty() {
        &step.name
    } else {
        &step.alias
    }
}

/// The two calls a step's output needs. A seam so the runner can be
/// exercised without a live connection; `Client` is the real implementation.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn log(&self, id: &str, line: &LogLine) -> Result<(), RpcError>;
    async fn upload(&self, id: &str, mime: &str, data: &[u8]) -> Result<(), RpcError>;
}

#[async_trait]
impl ResultSink for Client {
    async fn log(&self, id: &str, line: &LogLine) -> Result<(), RpcError> {
        Client::log(self, id, line).await
    }

    async fn upload(&self, id: &str, mime: &str, data: &[u8]) -> Result<(), RpcError> {
        Client::upload(self, id, mime, data).await
    }
}

/// Runs `config`'s stages/steps to completion (or the first failure),
/// tearing the engine down in either case.
pub async fn run_pipeline(
    engine: &dyn Engine,
    config: &Config,
    ctx: &CancellationToken,
    job_id: &str,
    sink: &dyn ResultSink,
    masks: &[String],
    log_cap: u64,
    tracer: &Tracer,
) -> Result<(), EngineError> {
    engine.setup(config).await?;

    let outcome = run_steps(engine, config, ctx, job_id, sink, masks, log_cap, tracer).await;

    if let Err(e) = engine.destroy(config).await {
        tracing::warn!(job_id, error = %e, "engine teardown failed");
    }

    outcome
}

/// Runs every step in order, gating each on the build's status so far via
/// `on_success`/`on_failure` (a step with `on_success` runs while nothing
/// has failed yet; one with `on_failure` runs only after something has —
/// e.g. a cleanup or notification step). A step's own failure does not
/// abort the pipeline: later `on_failure` steps still need to run. The
/// first failure's error is what's ultimately reported.
async fn run_steps(
    engine: &dyn Engine,
    config: &Config,
    ctx: &CancellationToken,
    job_id: &str,
    sink: &dyn ResultSink,
    masks: &[String],
    log_cap: u64,
    tracer: &Tracer,
) -> Result<(), EngineError> {
    let mut first_failure: Option<EngineError> = None;

    for stage in &config.stages {
        for step in &stage.steps {
            if ctx.is_cancelled() {
                return Err(EngineError::Other("cancelled".to_string()));
            }

            let should_run = if tracer.has_failed() { step.on_failure } else { step.on_success };
            if !should_run {
                continue;
            }

            let mut step = step.clone();
            step.environment.extend(tracer.env(now_unix()));

            engine.exec(&step).await?;

            let state = tokio::select! {
                res = engine.wait(&step) => res?,
                _ = ctx.cancelled() => {
                    let _ = engine.kill(&step).await;
                    return Err(EngineError::Other("cancelled".to_string()));
                }
            };

            let output = engine.tail(&step).await?;
            if let Err(e) = stream_step_output(sink, job_id, step_label(&step), output, masks, log_cap).await {
                tracing::warn!(job_id, error = %e, "failed to ship step output");
            }

            let succeeded = state.exited && state.exit_code == 0 && !state.oom_killed;
            tracer.observe(succeeded);
            if !succeeded && first_failure.is_none() {
                first_failure = Some(if state.oom_killed {
                    EngineError::Oom(state.exit_code)
                } else {
                    EngineError::Exit(state.exit_code)
                });
            }
        }
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn stream_step_output(
    sink: &dyn ResultSink,
    job_id: &str,
    proc: &str,
    output: StepOutput,
    masks: &[String],
    cap: u64,
) -> Result<(), RpcError> {
    let capped = output.log.take(cap);
    let mut lines = BufReader::new(capped).lines();
    let mut pos: u64 = 0;
    while let Ok(Some(line)) = lines.next_line().await {
        let entry = LogLine {
            proc: proc.to_string(),
            pos,
            out: redact(&line, masks),
            time: now_unix(),
        };
        sink.log(job_id, &entry).await?;
        pos += 1;
    }

    if let Some(artifact) = output.artifact {
        let mut capped = artifact.reader.take(cap);
        let mut buf = Vec::new();
        let _ = capped.read_to_end(&mut buf).await;
        sink.upload(job_id, &artifact.mime, &buf).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use piped_backend::{Artifact, ExecState, Stage};
    use std::io::Cursor;
    use std::sync::Mutex;

    struct ScriptedEngine {
        exit_code: i32,
        oom: bool,
        log: &'static [u8],
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn setup(&self, _config: &Config) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push("setup");
            Ok(())
        }
        async fn exec(&self, _step: &Step) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push("exec");
            Ok(())
        }
        async fn kill(&self, _step: &Step) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push("kill");
            Ok(())
        }
        async fn wait(&self, _step: &Step) -> Result<ExecState, EngineError> {
            self.calls.lock().unwrap().push("wait");
            Ok(ExecState {
                exited: true,
                exit_code: self.exit_code,
                oom_killed: self.oom,
            })
        }
        async fn tail(&self, _step: &Step) -> Result<StepOutput, EngineError> {
            Ok(StepOutput {
                log: Box::pin(Cursor::new(self.log.to_vec())),
                artifact: None,
            })
        }
        async fn destroy(&self, _config: &Config) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push("destroy");
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn log(&self, _id: &str, line: &LogLine) -> Result<(), RpcError> {
            self.lines.lock().unwrap().push(line.out.clone());
            Ok(())
        }
        async fn upload(&self, _id: &str, _mime: &str, _data: &[u8]) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn one_step_config() -> Config {
        Config {
            stages: vec![Stage {
                name: "build".to_string(),
                alias: String::new(),
                steps: vec![Step {
                    name: "compile".to_string(),
                    alias: String::new(),
                    image: "rust:latest".to_string(),
                    entrypoint: vec![],
                    command: vec![],
                    environment: Default::default(),
                    on_success: true,
                    on_failure: false,
                }],
            }],
            secrets: vec![],
        }
    }

    #[tokio::test]
    async fn successful_step_streams_redacted_log_and_tears_down() {
        let engine = ScriptedEngine {
            exit_code: 0,
            oom: false,
            log: b"line one\nsecret-token\nline three\n",
            calls: Mutex::new(vec![]),
        };
        let sink = RecordingSink::default();
        let tracer = Tracer::new(now_unix());
        let config = one_step_config();
        let masks = vec!["secret-token".to_string()];

        let result = run_pipeline(
            &engine,
            &config,
            &CancellationToken::new(),
            "job-1",
            &sink,
            &masks,
            5_000_000,
            &tracer,
        )
        .await;

        assert!(result.is_ok());
        assert!(!tracer.has_failed());
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.as_slice(), ["line one", "******", "line three"]);
        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec!["setup", "exec", "wait", "destroy"]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_exit_error_and_still_tears_down() {
        let engine = ScriptedEngine {
            exit_code: 7,
            oom: false,
            log: b"",
            calls: Mutex::new(vec![]),
        };
        let sink = RecordingSink::default();
        let tracer = Tracer::new(now_unix());
        let config = one_step_config();

        let result = run_pipeline(
            &engine,
            &config,
            &CancellationToken::new(),
            "job-1",
            &sink,
            &[],
            5_000_000,
            &tracer,
        )
        .await;

        match result {
            Err(EngineError::Exit(7)) => {}
            other => panic!("expected Exit(7), got {other:?}"),
        }
        assert!(tracer.has_failed());
        assert_eq!(*engine.calls.lock().unwrap(), vec!["setup", "exec", "wait", "destroy"]);
    }

    #[tokio::test]
    async fn oom_maps_to_oom_error() {
        let engine = ScriptedEngine {
            exit_code: 137,
            oom: true,
            log: b"",
            calls: Mutex::new(vec![]),
        };
        let sink = RecordingSink::default();
        let tracer = Tracer::new(now_unix());
        let config = one_step_config();

        let result = run_pipeline(
            &engine,
            &config,
            &CancellationToken::new(),
            "job-1",
            &sink,
            &[],
            5_000_000,
            &tracer,
        )
        .await;

        match result {
            Err(EngineError::Oom(137)) => {}
            other => panic!("expected Oom(137), got {other:?}"),
        }
    }

    struct ConditionalEngine {
        exit_codes: std::collections::HashMap<&'static str, i32>,
        calls: Mutex<Vec<String>>,
        statuses: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Engine for ConditionalEngine {
        async fn setup(&self, _config: &Config) -> Result<(), EngineError> {
            Ok(())
        }
        async fn exec(&self, step: &Step) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(step.name.clone());
            let status = step.environment.get("CI_BUILD_STATUS").cloned().unwrap_or_default();
            self.statuses.lock().unwrap().push((step.name.clone(), status));
            Ok(())
        }
        async fn kill(&self, _step: &Step) -> Result<(), EngineError> {
            Ok(())
        }
        async fn wait(&self, step: &Step) -> Result<ExecState, EngineError> {
            let exit_code = self.exit_codes.get(step.name.as_str()).copied().unwrap_or(0);
            Ok(ExecState {
                exited: true,
                exit_code,
                oom_killed: false,
            })
        }
        async fn tail(&self, _step: &Step) -> Result<StepOutput, EngineError> {
            Ok(StepOutput {
                log: Box::pin(Cursor::new(Vec::new())),
                artifact: None,
            })
        }
        async fn destroy(&self, _config: &Config) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn step(name: &str, on_success: bool, on_failure: bool) -> Step {
        Step {
            name: name.to_string(),
            alias: String::new(),
            image: "rust:latest".to_string(),
            entrypoint: vec![],
            command: vec![],
            environment: Default::default(),
            on_success,
            on_failure,
        }
    }

    #[tokio::test]
    async fn on_failure_step_runs_after_a_prior_failure_while_on_success_step_is_skipped() {
        let mut exit_codes = std::collections::HashMap::new();
        exit_codes.insert("build", 1);
        let engine = ConditionalEngine {
            exit_codes,
            calls: Mutex::new(vec![]),
            statuses: Mutex::new(vec![]),
        };
        let sink = RecordingSink::default();
        let tracer = Tracer::new(now_unix());
        let config = Config {
            stages: vec![Stage {
                name: "pipeline".to_string(),
                alias: String::new(),
                steps: vec![
                    step("build", true, false),
                    step("skipped_on_success_only", true, false),
                    step("notify", false, true),
                ],
            }],
            secrets: vec![],
        };

        let result = run_pipeline(
            &engine,
            &config,
            &CancellationToken::new(),
            "job-1",
            &sink,
            &[],
            5_000_000,
            &tracer,
        )
        .await;

        match result {
            Err(EngineError::Exit(1)) => {}
            other => panic!("expected Exit(1), got {other:?}"),
        }
        assert!(tracer.has_failed());
        assert_eq!(*engine.calls.lock().unwrap(), vec!["build".to_string(), "notify".to_string()]);
        assert_eq!(
            *engine.statuses.lock().unwrap(),
            vec![
                ("build".to_string(), "success".to_string()),
                ("notify".to_string(), "failure".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn already_cancelled_context_skips_execution() {
        let engine = ScriptedEngine {
            exit_code: 0,
            oom: false,
            log: b"",
            calls: Mutex::new(vec![]),
        };
        let sink = RecordingSink::default();
        let tracer = Tracer::new(now_unix());
        let config = one_step_config();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_pipeline(&engine, &config, &cancel, "job-1", &sink, &[], 5_000_000, &tracer).await;

        assert!(matches!(result, Err(EngineError::Other(_))));
        assert_eq!(*engine.calls.lock().unwrap(), vec!["setup", "destroy"]);
    }

    #[test]
    fn step_label_prefers_alias() {
        let mut step = one_step_config().stages.remove(0).steps.remove(0);
        assert_eq!(step_label(&step), "compile");
        step.alias = "compile-alias".to_string();
        assert_eq!(step_label(&step), "compile-alias");
    }

    #[test]
    fn artifact_pairs_with_mime() {
        let artifact = Artifact {
            mime: "application/octet-stream".to_string(),
            reader: Box::pin(Cursor::new(vec![1, 2, 3])),
        };
        assert_eq!(artifact.mime, "application/octet-stream");
    }
}
