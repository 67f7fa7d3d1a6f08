//! Interrupt handling and the force-exit monitor
//!
//! On SIGINT/SIGTERM the batch token is canceled, which cancels every line
//! token derived from it. Blocking tools cannot be interrupted, so a monitor
//! thread waits for outstanding node work to drain and exits the process
//! with status 130 if it does not within the grace period.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::util::constants::INTERRUPT_POLL_INTERVAL;

/// Node executions currently running, blocking work included
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Exit status used when the monitor gives up waiting
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Counts one running node execution while alive
#[must_use]
pub struct InFlightGuard(());

impl InFlightGuard {
    pub fn new() -> Self {
        IN_FLIGHT.fetch_add(1, Ordering::AcqRel);
        Self(())
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::AcqRel);
    }
}

pub fn in_flight() -> usize {
    IN_FLIGHT.load(Ordering::Acquire)
}

/// Poll until no work is in flight (true) or `grace` elapses (false)
pub fn wait_for_drain(grace: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if in_flight() == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(poll);
    }
}

/// Start the monitor thread; exits the process if work outlives `grace`
pub fn spawn_force_exit_monitor(grace: Duration) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("flowline-force-exit".into())
        .spawn(move || {
            if wait_for_drain(grace, INTERRUPT_POLL_INTERVAL) {
                info!("outstanding work drained after interrupt");
            } else {
                error!(
                    in_flight = in_flight(),
                    grace_secs = grace.as_secs(),
                    "work did not drain after interrupt, forcing exit"
                );
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        })
        // Spawning only fails on resource exhaustion; there is nothing to drain then
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to start force-exit monitor");
            std::process::exit(INTERRUPTED_EXIT_CODE)
        })
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Install signal handling for a batch
///
/// The first signal cancels `token`; with `force_exit` set the monitor is
/// started at the same time. Returns the listener task, abort it once the
/// batch is done.
pub fn install(token: CancellationToken, force_exit: Option<Duration>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = token.cancelled() => return,
        }
        warn!("interrupt received, canceling outstanding lines");
        token.cancel();
        if let Some(grace) = force_exit {
            spawn_force_exit_monitor(grace);
        }
    })
}
