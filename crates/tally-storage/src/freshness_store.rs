//! Freshness status store
//!
//! Holds the most recent evaluation per organization (and the global one
//! under `None`). Every row can be rebuilt from the event store.

use async_trait::async_trait;
use dashmap::DashMap;

use tally_common::{FreshnessStatus, Result};

#[async_trait]
pub trait FreshnessStore: Send + Sync {
    async fn put(&self, status: FreshnessStatus) -> Result<()>;

    /// Last evaluation for an organization, or the global one for `None`
    async fn get(&self, organization_id: Option<&str>) -> Result<Option<FreshnessStatus>>;

    async fn list(&self) -> Result<Vec<FreshnessStatus>>;
}

#[derive(Default)]
pub struct InMemoryFreshnessStore {
    statuses: DashMap<Option<String>, FreshnessStatus>,
}

impl InMemoryFreshnessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FreshnessStore for InMemoryFreshnessStore {
    async fn put(&self, status: FreshnessStatus) -> Result<()> {
        self.statuses.insert(status.organization_id.clone(), status);
        Ok(())
    }

    async fn get(&self, organization_id: Option<&str>) -> Result<Option<FreshnessStatus>> {
        let key = organization_id.map(str::to_string);
        Ok(self.statuses.get(&key).map(|s| s.clone()))
    }

    async fn list(&self) -> Result<Vec<FreshnessStatus>> {
        let mut statuses: Vec<FreshnessStatus> = self.statuses.iter().map(|s| s.clone()).collect();
        statuses.sort_by(|a, b| a.organization_id.cmp(&b.organization_id));
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tally_common::{FreshnessState, FreshnessThresholds};

    #[tokio::test]
    async fn test_put_replaces_previous_evaluation() {
        let store = InMemoryFreshnessStore::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let thresholds = FreshnessThresholds::default();

        store
            .put(FreshnessStatus::derive(Some("org-a".into()), now - chrono::Duration::hours(1), now, &thresholds))
            .await
            .unwrap();
        store
            .put(FreshnessStatus::derive(Some("org-a".into()), now, now, &thresholds))
            .await
            .unwrap();
        store
            .put(FreshnessStatus::derive(None, now, now, &thresholds))
            .await
            .unwrap();

        let status = store.get(Some("org-a")).await.unwrap().unwrap();
        assert_eq!(status.status, FreshnessState::Fresh);
        assert!(store.get(None).await.unwrap().is_some());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
