//! In-memory call store for tests and standalone experiments.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use redis_coordination::{CallId, CampaignId, LeaseToken};

use crate::{CallRecord, CallStatus, CallStore, CallStoreResult};

#[derive(Debug, Clone, Default)]
pub struct MemoryCallStore {
    inner: Arc<Mutex<HashMap<CallId, CallRecord>>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, id: &CallId, f: impl FnOnce(&mut CallRecord)) {
        let mut map = self.inner.lock();
        if let Some(record) = map.get_mut(id) {
            f(record);
            record.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn upsert(&self, record: &CallRecord) -> CallStoreResult<()> {
        self.inner.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &CallId) -> CallStoreResult<Option<CallRecord>> {
        Ok(self.inner.lock().get(id).cloned())
    }

    async fn find_by_provider(
        &self,
        provider_call_id: &str,
    ) -> CallStoreResult<Option<CallRecord>> {
        Ok(self
            .inner
            .lock()
            .values()
            .find(|r| r.provider_call_id.as_deref() == Some(provider_call_id))
            .cloned())
    }

    async fn set_provider(
        &self,
        id: &CallId,
        provider_call_id: &str,
        pre_token: &LeaseToken,
    ) -> CallStoreResult<()> {
        self.update(id, |r| {
            r.provider_call_id = Some(provider_call_id.to_owned());
            r.pre_token = Some(pre_token.clone());
        });
        Ok(())
    }

    async fn set_active_token(&self, id: &CallId, token: &LeaseToken) -> CallStoreResult<()> {
        self.update(id, |r| r.active_token = Some(token.clone()));
        Ok(())
    }

    async fn set_status(&self, id: &CallId, status: CallStatus) -> CallStoreResult<()> {
        self.update(id, |r| r.status = status);
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &CallId,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> CallStoreResult<()> {
        self.update(id, |r| {
            r.retry_count = retry_count;
            r.next_retry_at = Some(next_retry_at);
        });
        Ok(())
    }

    async fn active_calls(&self, campaign_id: &CampaignId) -> CallStoreResult<Vec<CallRecord>> {
        Ok(self
            .inner
            .lock()
            .values()
            .filter(|r| r.campaign_id == *campaign_id && r.status.is_in_flight())
            .cloned()
            .collect())
    }
}
