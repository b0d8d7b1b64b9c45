//! Fixed-timestep tick loop.
//!
//! The loop runs on a Tokio task and drives [`Scheduler::tick`] at the
//! configured rate:
//!
//! 1. Run one tick on the blocking pool and wait for it to finish.
//! 2. Stop if `max_ticks` has been reached.
//! 3. Sleep for the rest of the tick interval, waking early on a stop signal.
//!
//! A stop signal therefore cancels the next tick but never interrupts one in
//! progress.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::scheduler::Scheduler;

/// Handle to a running tick loop.
#[derive(Debug)]
pub struct TickLoop {
    stop: watch::Sender<bool>,
    /// Set to the tick count when the loop exits.
    done: watch::Receiver<Option<u64>>,
    task: JoinHandle<()>,
}

impl TickLoop {
    /// Returns `true` once the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some() || self.task.is_finished()
    }

    /// Ask the loop to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Resolves with the number of ticks run once the loop exits.
    pub fn finished(&self) -> impl Future<Output = u64> + Send + 'static {
        let mut done = self.done.clone();
        async move {
            let ticks = done
                .wait_for(Option::is_some)
                .await
                .map(|ticks| *ticks)
                .ok()
                .flatten();
            ticks.unwrap_or_else(|| done.borrow().unwrap_or_default())
        }
    }

    /// Stop the loop and wait for it. Returns the number of ticks run.
    pub async fn stop(self) -> u64 {
        self.signal_stop();
        let ticks = self.finished().await;
        if let Err(err) = self.task.await {
            error!(error = %err, "tick loop task failed");
        }
        ticks
    }
}

pub(crate) fn spawn_loop(scheduler: Arc<Scheduler>) -> TickLoop {
    let (stop, mut stop_rx) = watch::channel(false);
    let (done_tx, done) = watch::channel(None);
    let task = tokio::spawn(async move {
        let config = scheduler.config().clone();
        let interval = config.tick_interval();
        let mut ticks = 0u64;

        info!(
            tick_rate = config.tick_rate,
            max_ticks = config.max_ticks,
            "starting tick loop"
        );

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            let start = Instant::now();

            let worker = Arc::clone(&scheduler);
            if let Err(err) = tokio::task::spawn_blocking(move || worker.tick()).await {
                error!(error = %err, "tick task failed");
                break;
            }
            ticks += 1;

            if config.max_ticks > 0 && ticks >= config.max_ticks {
                info!(ticks, "tick loop complete");
                break;
            }

            let wait = interval.saturating_sub(start.elapsed());
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(wait) => {}
            }
        }

        info!(ticks, "tick loop stopped");
        done_tx.send_replace(Some(ticks));
    });
    TickLoop { stop, done, task }
}
