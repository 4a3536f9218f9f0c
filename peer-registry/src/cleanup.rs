//! Background sweep of expired records.

use crate::config::CleanupConfig;
use crate::server::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn the periodic sweep.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    registry: Arc<Registry>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!(interval_secs, "cleanup task started");

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            match registry.sweep().await {
                Ok(0) => tracing::debug!("cleanup: no expired records"),
                Ok(deleted) => tracing::info!(deleted, "cleanup: removed expired records"),
                Err(e) => tracing::error!(error = %e, "cleanup failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::tests::{registry, signed};
    use crate::storage::RecordStorage;

    #[tokio::test]
    async fn cleanup_task_removes_expired_records() {
        let registry = Arc::new(registry(Config::default()).await);
        let expired = signed(1, 0, 1);
        registry.publish(&expired).await.unwrap();

        let handle = spawn_cleanup_task(
            registry.clone(),
            CleanupConfig {
                interval_secs: 1,
                enabled: true,
            },
        );

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert_eq!(
            registry
                .metrics()
                .records_expired
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(registry.storage().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let registry = Arc::new(registry(Config::default()).await);
        let config = CleanupConfig {
            interval_secs: 1,
            enabled: false,
        };

        let handle = spawn_cleanup_task(registry, config);

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should complete when disabled")
            .expect("task should not panic");
    }
}
