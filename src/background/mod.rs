//! Background tasks — the periodic expiration sweep.
//!
//! A [`Sweeper`] owns one spawned Tokio task that calls [`Sweep::sweep`] on a
//! fixed interval until it is shut down. The task holds only a [`Weak`]
//! reference to its target, so it also exits once the target is dropped.
//!
//! Shutdown is deterministic: [`Sweeper::shutdown`] signals the task and waits
//! for it to finish, so no timer outlives the sweeper that created it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace};

/// Something that can drop its expired entries on demand.
pub trait Sweep: Send + Sync + 'static {
    /// Removes every expired entry and returns how many were removed.
    fn sweep(&self) -> usize;
}

/// Handle to a running sweep loop.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawns a loop that sweeps `target` every `period`.
    ///
    /// The first sweep happens one full `period` after spawning.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero or if called outside of a Tokio runtime.
    pub fn spawn<S: Sweep>(target: &Arc<S>, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_loop(Arc::downgrade(target), period, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Returns `true` while the loop task has not exited.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            debug!(error = %e, "sweep task ended abnormally");
        }
    }

    /// Signals the loop to stop without waiting for it.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn sweep_loop<S: Sweep>(
    target: Weak<S>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval = ?period, "expiration sweep started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender means the owning handle is gone as well.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    debug!("sweep target dropped");
                    break;
                };
                let evicted = target.sweep();
                if evicted > 0 {
                    debug!(evicted, "expired entries evicted");
                } else {
                    trace!("sweep found nothing to evict");
                }
            }
        }
    }

    info!("expiration sweep stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct Counter {
        sweeps: AtomicUsize,
    }

    impl Sweep for Counter {
        fn sweep(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_sweep_waits_one_period() {
        let target = Arc::new(Counter::default());
        let sweeper = Sweeper::spawn(&target, Duration::from_millis(100));

        sleep(Duration::from_millis(99)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 4);

        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_sweeping() {
        let target = Arc::new(Counter::default());
        let sweeper = Sweeper::spawn(&target, Duration::from_millis(100));

        sleep(Duration::from_millis(150)).await;
        sweeper.shutdown().await;
        let after_shutdown = target.sweeps.load(Ordering::SeqCst);

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_target_dropped() {
        let target = Arc::new(Counter::default());
        let sweeper = Sweeper::spawn(&target, Duration::from_millis(10));
        drop(target);

        sleep(Duration::from_millis(20)).await;
        assert!(!sweeper.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn signal_shutdown_without_waiting() {
        let target = Arc::new(Counter::default());
        let sweeper = Sweeper::spawn(&target, Duration::from_millis(10));

        sweeper.signal_shutdown();
        sleep(Duration::from_millis(50)).await;

        assert!(!sweeper.is_running());
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 0);
    }
}
