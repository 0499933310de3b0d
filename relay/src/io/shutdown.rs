//! Interrupt handling.
//!
//! SIGINT/SIGTERM raise a shared [`CancelFlag`]. Every blocking wait in the
//! relay sleeps in short slices and checks the flag, so an interrupt is
//! observed within one slice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::exit_codes;

/// Granularity of cancellable sleeps.
pub const CANCEL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `true` if the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(remaining.min(CANCEL_SLICE));
        }
    }
}

/// Spawn a watcher thread that raises `flag` on SIGINT or SIGTERM.
///
/// A second signal exits the process immediately with the interrupted code.
pub fn install_signal_handler(flag: CancelFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;

    thread::Builder::new()
        .name("relay-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                shutdown_signal().await;
                warn!("interrupt received, stopping after the current wait");
                flag.cancel();
                shutdown_signal().await;
                warn!("second interrupt received, exiting");
                std::process::exit(exit_codes::INTERRUPTED);
            });
        })
        .context("spawn signal watcher")?;
    debug!("signal handler installed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_runs_to_completion_when_not_cancelled() {
        let flag = CancelFlag::new();
        let start = Instant::now();
        assert!(!flag.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn sleep_wakes_early_on_cancel() {
        let flag = CancelFlag::new();
        let remote = flag.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let start = Instant::now();
        assert!(flag.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }
}
