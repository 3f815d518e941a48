//! Minimal local-process `Engine`. The container/Kubernetes backend is out
//! of scope (SPEC_FULL.md §1); this gives the agent binary something real
//! to drive end to end, in the spirit of the original project's "local"
//! backend alongside its container backends.

use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use piped_backend::{Config, Engine, EngineError, ExecState, Step, StepOutput};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::Mutex;

struct Running {
    child: Child,
    output: Arc<Mutex<Vec<u8>>>,
}

#[derive(Default)]
pub struct LocalProcessEngine {
    current: Mutex<Option<Running>>,
}

#[async_trait]
impl Engine for LocalProcessEngine {
    async fn setup(&self, _config: &Config) -> Result<(), EngineError> {
        Ok(())
    }

    async fn exec(&self, step: &Step) -> Result<(), EngineError> {
        let mut args = step.entrypoint.clone();
        args.extend(step.command.clone());
        let Some(program) = args.first().cloned() else {
            return Err(EngineError::Other(format!("step {} has no entrypoint/command", step.name)));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&args[1..]);
        cmd.envs(step.environment.iter());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Other(format!("spawn failed: {e}")))?;

        let output = Arc::new(Mutex::new(Vec::new()));
        if let Some(mut stdout) = child.stdout.take() {
            let output = output.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if stdout.read_to_end(&mut buf).await.is_ok() {
                    output.lock().await.extend(buf);
                }
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            let output = output.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if stderr.read_to_end(&mut buf).await.is_ok() {
                    output.lock().await.extend(buf);
                }
            });
        }

        *self.current.lock().await = Some(Running { child, output });
        Ok(())
    }

    async fn kill(&self, _step: &Step) -> Result<(), EngineError> {
        if let Some(running) = self.current.lock().await.as_mut() {
            let _ = running.child.kill().await;
        }
        Ok(())
    }

    async fn wait(&self, _step: &Step) -> Result<ExecState, EngineError> {
        let mut guard = self.current.lock().await;
        let Some(running) = guard.as_mut() else {
            return Err(EngineError::Other("wait called with no running step".to_string()));
        };
        let status = running
            .child
            .wait()
            .await
            .map_err(|e| EngineError::Other(format!("wait failed: {e}")))?;
        Ok(ExecState {
            exited: true,
            exit_code: status.code().unwrap_or(1),
            oom_killed: false,
        })
    }

    async fn tail(&self, _step: &Step) -> Result<StepOutput, EngineError> {
        let guard = self.current.lock().await;
        let buf = match guard.as_ref() {
            Some(running) => running.output.lock().await.clone(),
            None => Vec::new(),
        };
        Ok(StepOutput {
            log: Box::pin(Cursor::new(buf)),
            artifact: None,
        })
    }

    async fn destroy(&self, _config: &Config) -> Result<(), EngineError> {
        *self.current.lock().await = None;
        Ok(())
    }
}
