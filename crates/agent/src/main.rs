mod cli;
mod local_engine;
mod redact;
mod runner;
mod shutdown;
mod trace;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use piped_backend::Config;
use piped_rpc::wire::{Filter, State};
use piped_rpc::{Client, ClientConfig};
use tokio_util::sync::CancellationToken;

use cli::Cli;
use local_engine::LocalProcessEngine;
use runner::{now_unix, run_pipeline};
use shutdown::spawn_ctrl_c_handler;
use trace::Tracer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let shutdown = spawn_ctrl_c_handler();

    let client = Arc::new(
        Client::connect(ClientConfig {
            endpoint: cli.endpoint.clone(),
            token: cli.token.clone(),
            backoff: *cli.backoff,
            retry_limit: cli.retry_limit,
        })
        .await?,
    );
    let engine = Arc::new(LocalProcessEngine::default());

    let mut filter_labels = BTreeMap::new();
    filter_labels.insert("platform".to_string(), cli.platform.clone());
    let filter = Filter { labels: filter_labels };

    loop {
        if shutdown.requested() {
            tracing::info!("shutdown requested, exiting cleanly");
            break;
        }

        let processed = run_one_job(
            client.clone(),
            engine.clone(),
            filter.clone(),
            shutdown.token(),
            cli.upload_limit,
        )
        .await?;

        if cli.once {
            break;
        }
        if !processed && !shutdown.requested() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    client.close().await;
    Ok(())
}

/// One pass of SPEC_FULL.md §4.4's `run`: acquire, bound, arm cancellation
/// and heartbeat, execute, wait for uploads, report. Returns `false` if no
/// job was available.
async fn run_one_job(
    client: Arc<Client>,
    engine: Arc<LocalProcessEngine>,
    filter: Filter,
    shutdown_token: CancellationToken,
    upload_limit: u64,
) -> anyhow::Result<bool> {
    let job = match client.next(filter, shutdown_token).await? {
        Some(job) => job,
        None => return Ok(false),
    };
    let job_id = job.id.clone();

    let timeout = if job.timeout <= 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_secs(job.timeout as u64 * 60)
    };

    let exec_ctx = CancellationToken::new();
    let wait_stop = CancellationToken::new();
    let cancelled = Arc::new(AtomicBool::new(false));

    let timeout_task = tokio::spawn({
        let exec_ctx = exec_ctx.clone();
        async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => exec_ctx.cancel(),
                _ = exec_ctx.cancelled() => {}
            }
        }
    });

    let wait_task = tokio::spawn({
        let client = client.clone();
        let id = job_id.clone();
        let exec_ctx = exec_ctx.clone();
        let cancelled = cancelled.clone();
        let wait_stop = wait_stop.clone();
        async move {
            if let Ok(Some(result)) = client.wait(&id, wait_stop).await {
                if result.cancelled {
                    cancelled.store(true, Ordering::SeqCst);
                    exec_ctx.cancel();
                }
            }
        }
    });

    let heartbeat_task = tokio::spawn({
        let client = client.clone();
        let id = job_id.clone();
        let exec_ctx = exec_ctx.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        let _ = client.extend(&id).await;
                    }
                    _ = exec_ctx.cancelled() => break,
                }
            }
        }
    });

    let started = now_unix();
    client
        .update(&job_id, &State { started, ..Default::default() })
        .await?;

    let config: Config = match serde_json::from_value(job.config.clone()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "malformed job config");
            Config::default()
        }
    };
    let masks: Vec<String> = config
        .secrets
        .iter()
        .filter(|s| s.mask)
        .map(|s| s.value.clone())
        .collect();

    let tracer = Tracer::new(started);
    let result = run_pipeline(
        engine.as_ref(),
        &config,
        &exec_ctx,
        &job_id,
        client.as_ref(),
        &masks,
        upload_limit,
        &tracer,
    )
    .await;
    // Every log/upload call inside run_pipeline is awaited in place, so by
    // the time it returns all transfers for this job have completed.

    exec_ctx.cancel();
    wait_stop.cancel();
    let _ = timeout_task.await;
    let _ = wait_task.await;
    let _ = heartbeat_task.await;

    let finished = now_unix();
    let (exit_code, error) = match result {
        Ok(()) => (0, String::new()),
        Err(e) => {
            let message = e.to_string();
            let code = if cancelled.load(Ordering::SeqCst) {
                130
            } else {
                match e {
                    piped_backend::EngineError::Exit(k) => k,
                    piped_backend::EngineError::Oom(k) if k != 0 => k,
                    piped_backend::EngineError::Oom(_) => 1,
                    piped_backend::EngineError::Other(_) => 1,
                }
            };
            (code, message)
        }
    };

    client
        .update(
            &job_id,
            &State {
                started,
                finished,
                exited: true,
                exit_code,
                error,
            },
        )
        .await?;
    client.done(&job_id).await?;

    Ok(true)
}
