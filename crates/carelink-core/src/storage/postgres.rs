//! PostgreSQL implementation of [`IntegrationStore`].
//!
//! Uses runtime-checked queries so the crate builds without a live database.
//! Structured columns (credentials, metadata, retry config, error snapshots,
//! payloads) are stored as JSONB. Sync-state compare-and-set and webhook
//! claiming are single `UPDATE ... WHERE` statements, which makes them safe
//! across processes sharing one database.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use uuid::Uuid;

use super::{IntegrationStore, StoreFuture, SyncCompletion};
use crate::{
    error::{CoreError, Result},
    models::{
        Credentials, ErrorSnapshot, IntegrationConfig, IntegrationConfigId, RetryConfig, SyncLog,
        SyncLogId, SyncStatus, WebhookEvent, WebhookEventId,
    },
};

const CONFIG_COLUMNS: &str = "id, name, integration_type, endpoint, credentials, metadata, \
     is_active, sync_frequency, last_sync_at, sync_status, last_error, webhook_url, \
     retry_config, created_at, updated_at";

const SYNC_LOG_COLUMNS: &str = "id, integration_config_id, status, sync_type, started_at, \
     completed_at, records_processed, records_succeeded, records_failed, error";

const WEBHOOK_EVENT_COLUMNS: &str = "id, integration_config_id, event_type, payload, status, \
     attempts, max_attempts, next_retry_at, delivered_at, error, created_at, updated_at";

/// Store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns error if the probe query fails.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }
}

/// Creates tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns error if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let statements = [
        r"
        CREATE TABLE IF NOT EXISTS integration_configs (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            integration_type TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            credentials JSONB NOT NULL DEFAULT '{}'::jsonb,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            sync_frequency TEXT,
            last_sync_at TIMESTAMPTZ,
            sync_status TEXT NOT NULL DEFAULT 'idle',
            last_error JSONB,
            webhook_url TEXT,
            retry_config JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS integration_sync_logs (
            id UUID PRIMARY KEY,
            integration_config_id UUID NOT NULL
                REFERENCES integration_configs(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            sync_type TEXT NOT NULL DEFAULT 'full',
            started_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ,
            records_processed BIGINT NOT NULL DEFAULT 0,
            records_succeeded BIGINT NOT NULL DEFAULT 0,
            records_failed BIGINT NOT NULL DEFAULT 0,
            error JSONB
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS webhook_events (
            id UUID PRIMARY KEY,
            integration_config_id UUID NOT NULL
                REFERENCES integration_configs(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            next_retry_at TIMESTAMPTZ,
            delivered_at TIMESTAMPTZ,
            error JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK (attempts <= max_attempts)
        )
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_integration_configs_name
        ON integration_configs(name)
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_sync_logs_config_started
        ON integration_sync_logs(integration_config_id, started_at DESC)
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_webhook_events_status_retry
        ON webhook_events(status, next_retry_at)
        WHERE status = 'pending'
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_webhook_events_config_created
        ON webhook_events(integration_config_id, created_at DESC)
        ",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_u32(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn config_from_row(row: &PgRow) -> Result<IntegrationConfig> {
    let integration_type: String = row.try_get("integration_type")?;
    let sync_status: String = row.try_get("sync_status")?;
    let credentials: Json<Credentials> = row.try_get("credentials")?;
    let metadata: Json<Map<String, Value>> = row.try_get("metadata")?;
    let last_error: Option<Json<ErrorSnapshot>> = row.try_get("last_error")?;
    let retry_config: Option<Json<RetryConfig>> = row.try_get("retry_config")?;

    Ok(IntegrationConfig {
        id: IntegrationConfigId(row.try_get("id")?),
        name: row.try_get("name")?,
        integration_type: integration_type.parse()?,
        endpoint: row.try_get("endpoint")?,
        credentials: credentials.0,
        metadata: metadata.0,
        is_active: row.try_get("is_active")?,
        sync_frequency: row.try_get("sync_frequency")?,
        last_sync_at: row.try_get("last_sync_at")?,
        sync_status: sync_status.parse()?,
        last_error: last_error.map(|j| j.0),
        webhook_url: row.try_get("webhook_url")?,
        retry_config: retry_config.map(|j| j.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_log_from_row(row: &PgRow) -> Result<SyncLog> {
    let status: String = row.try_get("status")?;
    let sync_type: String = row.try_get("sync_type")?;
    let error: Option<Json<ErrorSnapshot>> = row.try_get("error")?;

    Ok(SyncLog {
        id: SyncLogId(row.try_get("id")?),
        integration_config_id: IntegrationConfigId(row.try_get("integration_config_id")?),
        status: status.parse()?,
        sync_type: sync_type.parse()?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        records_processed: to_u64(row.try_get("records_processed")?),
        records_succeeded: to_u64(row.try_get("records_succeeded")?),
        records_failed: to_u64(row.try_get("records_failed")?),
        error: error.map(|j| j.0),
    })
}

fn webhook_event_from_row(row: &PgRow) -> Result<WebhookEvent> {
    let status: String = row.try_get("status")?;
    let error: Option<Json<ErrorSnapshot>> = row.try_get("error")?;

    Ok(WebhookEvent {
        id: WebhookEventId(row.try_get("id")?),
        integration_config_id: IntegrationConfigId(row.try_get("integration_config_id")?),
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        attempts: to_u32(row.try_get("attempts")?),
        max_attempts: to_u32(row.try_get("max_attempts")?),
        next_retry_at: row.try_get("next_retry_at")?,
        delivered_at: row.try_get("delivered_at")?,
        error: error.map(|j| j.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl PostgresStore {
    async fn config_exists(&self, id: IntegrationConfigId) -> Result<bool> {
        let found: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM integration_configs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&*self.pool)
                .await?;
        Ok(found.is_some())
    }
}

impl IntegrationStore for PostgresStore {
    fn insert_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO integration_configs ({CONFIG_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
            ))
            .bind(config.id.0)
            .bind(&config.name)
            .bind(config.integration_type.as_str())
            .bind(&config.endpoint)
            .bind(Json(&config.credentials))
            .bind(Json(&config.metadata))
            .bind(config.is_active)
            .bind(&config.sync_frequency)
            .bind(config.last_sync_at)
            .bind(config.sync_status.as_str())
            .bind(config.last_error.as_ref().map(Json))
            .bind(&config.webhook_url)
            .bind(config.retry_config.as_ref().map(Json))
            .bind(config.created_at)
            .bind(config.updated_at)
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }

    fn find_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, Option<IntegrationConfig>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {CONFIG_COLUMNS} FROM integration_configs WHERE id = $1"
            ))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await?;
            row.as_ref().map(config_from_row).transpose()
        })
    }

    fn list_configs(&self) -> StoreFuture<'_, Vec<IntegrationConfig>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {CONFIG_COLUMNS} FROM integration_configs ORDER BY name ASC, created_at ASC"
            ))
            .fetch_all(&*self.pool)
            .await?;
            rows.iter().map(config_from_row).collect()
        })
    }

    fn update_config(&self, config: IntegrationConfig) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE integration_configs
                SET name = $2, integration_type = $3, endpoint = $4, credentials = $5,
                    metadata = $6, is_active = $7, sync_frequency = $8, webhook_url = $9,
                    retry_config = $10, updated_at = $11
                WHERE id = $1
                ",
            )
            .bind(config.id.0)
            .bind(&config.name)
            .bind(config.integration_type.as_str())
            .bind(&config.endpoint)
            .bind(Json(&config.credentials))
            .bind(Json(&config.metadata))
            .bind(config.is_active)
            .bind(&config.sync_frequency)
            .bind(&config.webhook_url)
            .bind(config.retry_config.as_ref().map(Json))
            .bind(config.updated_at)
            .execute(&*self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(CoreError::not_found("IntegrationConfig", config.id));
            }
            Ok(())
        })
    }

    fn delete_config(&self, id: IntegrationConfigId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM integration_configs WHERE id = $1")
                .bind(id.0)
                .execute(&*self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn transition_sync_status(
        &self,
        id: IntegrationConfigId,
        from: &'static [SyncStatus],
        to: SyncStatus,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let from: Vec<String> = from.iter().map(ToString::to_string).collect();
            let updated: Option<Uuid> = sqlx::query_scalar(
                r"
                UPDATE integration_configs
                SET sync_status = $3, updated_at = $4
                WHERE id = $1 AND sync_status = ANY($2)
                RETURNING id
                ",
            )
            .bind(id.0)
            .bind(&from)
            .bind(to.as_str())
            .bind(at)
            .fetch_optional(&*self.pool)
            .await?;

            if updated.is_some() {
                return Ok(true);
            }
            if self.config_exists(id).await? {
                Ok(false)
            } else {
                Err(CoreError::not_found("IntegrationConfig", id))
            }
        })
    }

    fn finish_sync(
        &self,
        id: IntegrationConfigId,
        completion: SyncCompletion,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = match completion {
                SyncCompletion::Succeeded { at } => {
                    sqlx::query(
                        r"
                        UPDATE integration_configs
                        SET sync_status = 'idle', last_sync_at = $2, last_error = NULL,
                            updated_at = $2
                        WHERE id = $1
                        ",
                    )
                    .bind(id.0)
                    .bind(at)
                    .execute(&*self.pool)
                    .await?
                },
                SyncCompletion::Failed { error } => {
                    sqlx::query(
                        r"
                        UPDATE integration_configs
                        SET sync_status = 'error', last_error = $2, updated_at = $3
                        WHERE id = $1
                        ",
                    )
                    .bind(id.0)
                    .bind(Json(&error))
                    .bind(error.timestamp)
                    .execute(&*self.pool)
                    .await?
                },
            };

            if result.rows_affected() == 0 {
                return Err(CoreError::not_found("IntegrationConfig", id));
            }
            Ok(())
        })
    }

    fn recover_interrupted_syncs(
        &self,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, Vec<IntegrationConfigId>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let ids: Vec<Uuid> = sqlx::query_scalar(
                r"
                UPDATE integration_configs
                SET sync_status = 'error', last_error = $1, updated_at = $2
                WHERE sync_status = 'syncing'
                RETURNING id
                ",
            )
            .bind(Json(&error))
            .bind(error.timestamp)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query(
                r"
                UPDATE integration_sync_logs
                SET status = 'failed', completed_at = $2, error = $3
                WHERE integration_config_id = ANY($1) AND completed_at IS NULL
                ",
            )
            .bind(&ids)
            .bind(error.timestamp)
            .bind(Json(&error))
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(ids.into_iter().map(IntegrationConfigId).collect())
        })
    }

    fn insert_sync_log(&self, log: SyncLog) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO integration_sync_logs ({SYNC_LOG_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
            ))
            .bind(log.id.0)
            .bind(log.integration_config_id.0)
            .bind(log.status.as_str())
            .bind(log.sync_type.as_str())
            .bind(log.started_at)
            .bind(log.completed_at)
            .bind(to_i64(log.records_processed))
            .bind(to_i64(log.records_succeeded))
            .bind(to_i64(log.records_failed))
            .bind(log.error.as_ref().map(Json))
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }

    fn finalize_sync_log(&self, log: SyncLog) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE integration_sync_logs
                SET status = $2, completed_at = $3, records_processed = $4,
                    records_succeeded = $5, records_failed = $6, error = $7
                WHERE id = $1 AND completed_at IS NULL
                ",
            )
            .bind(log.id.0)
            .bind(log.status.as_str())
            .bind(log.completed_at)
            .bind(to_i64(log.records_processed))
            .bind(to_i64(log.records_succeeded))
            .bind(to_i64(log.records_failed))
            .bind(log.error.as_ref().map(Json))
            .execute(&*self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn list_sync_logs(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<SyncLog>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {SYNC_LOG_COLUMNS} FROM integration_sync_logs \
                 WHERE integration_config_id = $1 ORDER BY started_at DESC LIMIT $2"
            ))
            .bind(config_id.0)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await?;
            rows.iter().map(sync_log_from_row).collect()
        })
    }

    fn recent_sync_logs(&self, limit: usize) -> StoreFuture<'_, Vec<SyncLog>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {SYNC_LOG_COLUMNS} FROM integration_sync_logs \
                 ORDER BY started_at DESC LIMIT $1"
            ))
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await?;
            rows.iter().map(sync_log_from_row).collect()
        })
    }

    fn insert_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO webhook_events ({WEBHOOK_EVENT_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            ))
            .bind(event.id.0)
            .bind(event.integration_config_id.0)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.status.as_str())
            .bind(to_i32(event.attempts))
            .bind(to_i32(event.max_attempts))
            .bind(event.next_retry_at)
            .bind(event.delivered_at)
            .bind(event.error.as_ref().map(Json))
            .bind(event.created_at)
            .bind(event.updated_at)
            .execute(&*self.pool)
            .await?;
            Ok(())
        })
    }

    fn find_webhook_event(&self, id: WebhookEventId) -> StoreFuture<'_, Option<WebhookEvent>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events WHERE id = $1"
            ))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await?;
            row.as_ref().map(webhook_event_from_row).transpose()
        })
    }

    fn claim_webhook_event(
        &self,
        id: WebhookEventId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<WebhookEvent>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "UPDATE webhook_events \
                 SET status = 'processing', attempts = attempts + 1, updated_at = $2 \
                 WHERE id = $1 AND status = 'pending' AND attempts < max_attempts \
                 RETURNING {WEBHOOK_EVENT_COLUMNS}"
            ))
            .bind(id.0)
            .bind(at)
            .fetch_optional(&*self.pool)
            .await?;
            row.as_ref().map(webhook_event_from_row).transpose()
        })
    }

    fn update_webhook_event(&self, event: WebhookEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE webhook_events
                SET status = $2, attempts = $3, max_attempts = $4, next_retry_at = $5,
                    delivered_at = $6, error = $7, updated_at = $8
                WHERE id = $1
                ",
            )
            .bind(event.id.0)
            .bind(event.status.as_str())
            .bind(to_i32(event.attempts))
            .bind(to_i32(event.max_attempts))
            .bind(event.next_retry_at)
            .bind(event.delivered_at)
            .bind(event.error.as_ref().map(Json))
            .bind(event.updated_at)
            .execute(&*self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(CoreError::not_found("WebhookEvent", event.id));
            }
            Ok(())
        })
    }

    fn list_webhook_events(
        &self,
        config_id: IntegrationConfigId,
        limit: usize,
    ) -> StoreFuture<'_, Vec<WebhookEvent>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events \
                 WHERE integration_config_id = $1 ORDER BY created_at DESC LIMIT $2"
            ))
            .bind(config_id.0)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await?;
            rows.iter().map(webhook_event_from_row).collect()
        })
    }

    fn reclaim_stale_webhook_events(
        &self,
        stale_before: DateTime<Utc>,
        error: ErrorSnapshot,
    ) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE webhook_events
                SET status = 'pending', next_retry_at = $2, error = $3, updated_at = $2
                WHERE status = 'processing' AND updated_at <= $1
                ",
            )
            .bind(stale_before)
            .bind(error.timestamp)
            .bind(Json(&error))
            .execute(&*self.pool)
            .await?;
            Ok(result.rows_affected())
        })
    }

    fn due_webhook_events(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<WebhookEvent>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events \
                 WHERE status = 'pending' AND next_retry_at IS NOT NULL AND next_retry_at <= $1 \
                 ORDER BY next_retry_at ASC"
            ))
            .bind(now)
            .fetch_all(&*self.pool)
            .await?;
            rows.iter().map(webhook_event_from_row).collect()
        })
    }
}
