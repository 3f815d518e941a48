//! Double-Ctrl+C shutdown, adapted from the teacher's `ShutdownController`:
//! the first interrupt cancels the shared token — unblocking a parked
//! `next` immediately and asking the outer loop to finish its current job
//! and stop — a second interrupt exits immediately with code 130.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    /// Token that cancels on the first interrupt. Pass (a child of) this
    /// into anything that should unblock as soon as shutdown begins, such
    /// as the agent's `next` call.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub fn spawn_ctrl_c_handler() -> Arc<ShutdownController> {
    let controller = Arc::new(ShutdownController {
        token: CancellationToken::new(),
    });
    let handle = controller.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if handle.token.is_cancelled() {
                tracing::warn!("second interrupt received, exiting immediately");
                std::process::exit(130);
            }
            tracing::info!("interrupt received, finishing current job before exit");
            handle.token.cancel();
        }
    });
    controller
}
