//! Background expired-key sweep
//!
//! A single timer per adapter, best-effort only: expiration is always
//! evaluated on read and acquire, so a disabled or failing sweep never
//! compromises correctness. It only reclaims space.

use crate::adapter::contracts::AdapterLifecycle;
use crate::core::TimeSpan;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sweep configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often expired keys are removed.
    pub interval: TimeSpan,
    /// Whether the sweep task is spawned at all.
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: TimeSpan::from_minutes(1),
            enabled: true,
        }
    }
}

/// Periodic expired-key removal task for one adapter.
///
/// Dropping the sweeper aborts the task, when one was spawned.
#[derive(Debug)]
pub struct ExpiredKeySweeper {
    handle: Option<JoinHandle<()>>,
}

impl ExpiredKeySweeper {
    /// Spawn the sweep loop. With `enabled: false` or a non-positive
    /// interval, no task is spawned.
    pub fn spawn(adapter: Arc<dyn AdapterLifecycle>, config: SweeperConfig) -> Self {
        if !config.enabled || config.interval.as_millis() <= 0 {
            return Self { handle: None };
        }

        let interval = config.interval.to_duration_clamped();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match adapter.remove_all_expired().await {
                    Ok(removed) if removed > 0 => {
                        log::debug!("expired key sweep removed {} entries", removed);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        log::warn!("expired key sweep failed: {}", error);
                    }
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Whether a sweep task is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the sweep task.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ExpiredKeySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryLockAdapter;
    use crate::adapter::LockAdapter;
    use crate::core::Namespace;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweeper_removes_expired_locks() {
        let adapter = Arc::new(MemoryLockAdapter::new());
        let key = Namespace::new("test/sweeper").key("stale");
        adapter
            .acquire(&key, "o", Some(TimeSpan::from_millis(-10).end_date()))
            .await
            .unwrap();

        let sweeper = ExpiredKeySweeper::spawn(
            Arc::clone(&adapter) as Arc<dyn AdapterLifecycle>,
            SweeperConfig {
                interval: TimeSpan::from_millis(20),
                enabled: true,
            },
        );
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(adapter.find(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_sweeper_spawns_nothing() {
        let adapter = Arc::new(MemoryLockAdapter::new());
        let mut sweeper = ExpiredKeySweeper::spawn(
            adapter as Arc<dyn AdapterLifecycle>,
            SweeperConfig {
                enabled: false,
                ..Default::default()
            },
        );
        assert!(!sweeper.is_running());
        // Stopping a sweeper that never started is a no-op.
        sweeper.stop();
    }
}
