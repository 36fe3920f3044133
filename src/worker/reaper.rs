//! Reaper: fails Waiting jobs that never got a result.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::JobStore;

/// Spawn a background task that periodically fails Waiting jobs older than `max_age`.
pub fn spawn_reaper(store: Arc<JobStore>, max_age: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_age = match chrono::Duration::from_std(max_age) {
            Ok(age) => age,
            Err(e) => {
                warn!(error = %e, "Job max age out of range; expiry disabled");
                return;
            }
        };

        info!(max_age_secs = max_age.num_seconds(), "Job reaper started");

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            store.expire_older_than(max_age).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelKind;
    use crate::store::{JobId, JobStatus};

    #[tokio::test]
    async fn reaper_fails_stale_jobs() {
        let store = JobStore::new();
        store.create(JobId::from("old"), ChannelKind::Folder).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = spawn_reaper(
            Arc::clone(&store),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let JobStatus::Failed { reason } =
                    store.get(&JobId::from("old")).await.unwrap().status
                {
                    assert!(reason.contains("no result"));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job was never reaped");

        handle.abort();
    }
}
