//! Background eviction of idle limiters.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::LimiterRegistry;

/// Handle to a running sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the sweep loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            debug!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

/// Periodically calls [`LimiterRegistry::sweep`].
pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweep loop on the current runtime.
    ///
    /// The first sweep happens one full `interval` after start. The loop
    /// exits when `cancel` fires, either directly or through
    /// [`SweeperHandle::stop`].
    pub fn start(
        registry: Arc<LimiterRegistry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> SweeperHandle {
        let interval = interval.max(Duration::from_millis(1));
        let task_cancel = cancel.clone();

        info!(
            interval = ?interval,
            max_idle = ?registry.config().max_idle,
            "Starting limiter sweeper"
        );

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        info!("Limiter sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = registry.sweep();
                        if evicted > 0 {
                            debug!(evicted = evicted, active = registry.count(), "Evicted idle client limiters");
                        }
                    }
                }
            }
        });

        SweeperHandle { cancel, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Quota, RegistryConfig};
    use std::num::NonZeroU32;

    fn registry(clock: Arc<ManualClock>) -> Arc<LimiterRegistry> {
        let quota = Quota::per_window(NonZeroU32::new(1).unwrap(), Duration::from_secs(1));
        let config = RegistryConfig {
            max_idle: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        };
        Arc::new(LimiterRegistry::new(quota, config, clock))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_on_tick() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());
        registry.get_or_create("idle");
        clock.advance(Duration::from_secs(120));

        let handle = Sweeper::start(registry.clone(), Duration::from_secs(10), CancellationToken::new());

        // Nothing happens before the first interval elapses.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.contains("idle"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!registry.contains("idle"));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let registry = registry(Arc::new(ManualClock::new()));
        let handle = Sweeper::start(registry, Duration::from_secs(10), CancellationToken::new());

        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation_ends_task() {
        let registry = registry(Arc::new(ManualClock::new()));
        let cancel = CancellationToken::new();
        let handle = Sweeper::start(registry, Duration::from_secs(10), cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        handle.stop().await;
    }
}
