//! Sqlite-backed call store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqliteSynchronous},
    ConnectOptions, Row,
};
use tracing::debug;

use redis_coordination::{CallId, CampaignId, LeaseToken};

use crate::{CallRecord, CallStatus, CallStore, CallStoreError, CallStoreResult};

#[derive(Debug)]
pub struct SqliteCallStore {
    inner: SqlitePool,
}

impl Clone for SqliteCallStore {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SqliteCallStore {
    /// Open (creating if missing) and migrate the database at `uri`.
    /// Use `sqlite::memory:` for an in-memory database.
    pub async fn new(uri: impl AsRef<str>) -> Result<Self, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(uri.as_ref())?
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true)
            // sqlite logs queries at trace level so we don't bloat `info`
            .log_statements(tracing::log::LevelFilter::Trace);

        let inner = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("../../migrations").run(&inner).await?;
        debug!("call store database ready");
        Ok(Self { inner })
    }
}

#[async_trait]
impl CallStore for SqliteCallStore {
    async fn upsert(&self, record: &CallRecord) -> CallStoreResult<()> {
        sqlx::query(
            r#"INSERT INTO calls
                (id, campaign_id, contact_ref, agent_ref, phone_ref, to_number,
                 provider_call_id, pre_token, active_token, status, retry_count,
                 next_retry_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO UPDATE SET
                provider_call_id = excluded.provider_call_id,
                pre_token = excluded.pre_token,
                active_token = excluded.active_token,
                status = excluded.status,
                retry_count = excluded.retry_count,
                next_retry_at = excluded.next_retry_at,
                updated_at = excluded.updated_at"#,
        )
        .bind(record.id.as_str())
        .bind(record.campaign_id.as_str())
        .bind(&record.contact_ref)
        .bind(&record.agent_ref)
        .bind(&record.phone_ref)
        .bind(&record.to_number)
        .bind(record.provider_call_id.as_deref())
        .bind(record.pre_token.as_ref().map(|t| t.as_str()))
        .bind(record.active_token.as_ref().map(|t| t.as_str()))
        .bind(record.status.to_string())
        .bind(record.retry_count as i64)
        .bind(record.next_retry_at.map(|t| t.timestamp()))
        .bind(record.created_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(&self.inner)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &CallId) -> CallStoreResult<Option<CallRecord>> {
        let row = sqlx::query("SELECT * FROM calls WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.inner)
            .await?;
        row.map(|r| util::to_record(&r)).transpose()
    }

    async fn find_by_provider(
        &self,
        provider_call_id: &str,
    ) -> CallStoreResult<Option<CallRecord>> {
        let row = sqlx::query("SELECT * FROM calls WHERE provider_call_id = ?1")
            .bind(provider_call_id)
            .fetch_optional(&self.inner)
            .await?;
        row.map(|r| util::to_record(&r)).transpose()
    }

    async fn set_provider(
        &self,
        id: &CallId,
        provider_call_id: &str,
        pre_token: &LeaseToken,
    ) -> CallStoreResult<()> {
        sqlx::query(
            "UPDATE calls SET provider_call_id = ?2, pre_token = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(id.as_str())
        .bind(provider_call_id)
        .bind(pre_token.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.inner)
        .await?;
        Ok(())
    }

    async fn set_active_token(&self, id: &CallId, token: &LeaseToken) -> CallStoreResult<()> {
        sqlx::query("UPDATE calls SET active_token = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.as_str())
            .bind(token.as_str())
            .bind(Utc::now().timestamp())
            .execute(&self.inner)
            .await?;
        Ok(())
    }

    async fn set_status(&self, id: &CallId, status: CallStatus) -> CallStoreResult<()> {
        sqlx::query("UPDATE calls SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.as_str())
            .bind(status.to_string())
            .bind(Utc::now().timestamp())
            .execute(&self.inner)
            .await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &CallId,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> CallStoreResult<()> {
        sqlx::query(
            "UPDATE calls SET retry_count = ?2, next_retry_at = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(id.as_str())
        .bind(retry_count as i64)
        .bind(next_retry_at.timestamp())
        .bind(Utc::now().timestamp())
        .execute(&self.inner)
        .await?;
        Ok(())
    }

    async fn active_calls(&self, campaign_id: &CampaignId) -> CallStoreResult<Vec<CallRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM calls WHERE campaign_id = ?1 AND status IN ('dialing', 'ringing', 'in_progress')",
        )
        .bind(campaign_id.as_str())
        .fetch_all(&self.inner)
        .await?;
        rows.iter().map(util::to_record).collect()
    }
}

mod util {
    use sqlx::sqlite::SqliteRow;

    use super::*;

    pub fn to_systime(secs: i64) -> CallStoreResult<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| CallStoreError::Corrupt(format!("timestamp out of range: {secs}")))
    }

    pub fn to_record(row: &SqliteRow) -> CallStoreResult<CallRecord> {
        let status: String = row.get("status");
        let status = CallStatus::from_str(&status).map_err(CallStoreError::Corrupt)?;
        let next_retry_at: Option<i64> = row.get("next_retry_at");
        Ok(CallRecord {
            id: CallId::from(row.get::<String, _>("id")),
            campaign_id: CampaignId::from(row.get::<String, _>("campaign_id")),
            contact_ref: row.get("contact_ref"),
            agent_ref: row.get("agent_ref"),
            phone_ref: row.get("phone_ref"),
            to_number: row.get("to_number"),
            provider_call_id: row.get("provider_call_id"),
            pre_token: row
                .get::<Option<String>, _>("pre_token")
                .map(|t| LeaseToken::from(t.as_str())),
            active_token: row
                .get::<Option<String>, _>("active_token")
                .map(|t| LeaseToken::from(t.as_str())),
            status,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            next_retry_at: next_retry_at.map(to_systime).transpose()?,
            created_at: to_systime(row.get("created_at"))?,
            updated_at: to_systime(row.get("updated_at"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;


    async fn mem_db() -> SqliteCallStore {
        SqliteCallStore::new("sqlite::memory:").await.unwrap()
    }

    fn record(call: &str, campaign: &str, status: CallStatus) -> CallRecord {
        let mut r = CallRecord::new(
            CallId::from(call),
            CampaignId::from(campaign),
            format!("contact-{call}"),
            "agent-a",
            "+15550100",
            "+15550199",
            0,
        );
        r.status = status;
        r
    }

    #[tokio::test]
    #[traced_test]
    async fn upsert_and_get_roundtrip() {
        let db = mem_db().await;
        let rec = record("c1", "k", CallStatus::Pending);
        db.upsert(&rec).await.unwrap();

        let got = db.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(got.id, rec.id);
        assert_eq!(got.status, CallStatus::Pending);
        assert_eq!(got.retry_count, 0);
        assert!(got.provider_call_id.is_none());

        // upsert replaces mutable columns
        db.set_status(&rec.id, CallStatus::Dialing).await.unwrap();
        let got = db.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(got.status, CallStatus::Dialing);
    }

    #[tokio::test]
    #[traced_test]
    async fn provider_lookup_and_tokens() {
        let db = mem_db().await;
        let rec = record("c1", "k", CallStatus::Dialing);
        db.upsert(&rec).await.unwrap();

        let pre = LeaseToken::generate();
        db.set_provider(&rec.id, "PA42", &pre).await.unwrap();
        let active = LeaseToken::generate();
        db.set_active_token(&rec.id, &active).await.unwrap();

        let got = db.find_by_provider("PA42").await.unwrap().unwrap();
        assert_eq!(got.pre_token, Some(pre));
        assert_eq!(got.active_token, Some(active));
        assert!(db.find_by_provider("PA43").await.unwrap().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn active_calls_filters_by_campaign_and_status() {
        let db = mem_db().await;
        db.upsert(&record("c1", "k", CallStatus::Dialing)).await.unwrap();
        db.upsert(&record("c2", "k", CallStatus::InProgress))
            .await
            .unwrap();
        db.upsert(&record("c3", "k", CallStatus::Completed))
            .await
            .unwrap();
        db.upsert(&record("c4", "other", CallStatus::InProgress))
            .await
            .unwrap();

        let active = db.active_calls(&CampaignId::from("k")).await.unwrap();
        let mut ids: Vec<String> = active.iter().map(|r| r.id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, ["c1", "c2"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn mark_retry_updates_counters() {
        let db = mem_db().await;
        let rec = record("c1", "k", CallStatus::Failed);
        db.upsert(&rec).await.unwrap();

        let at = Utc::now() + chrono::Duration::seconds(300);
        db.mark_retry(&rec.id, 1, at).await.unwrap();
        let got = db.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(got.retry_count, 1);
        assert_eq!(got.next_retry_at.unwrap().timestamp(), at.timestamp());
    }
}
