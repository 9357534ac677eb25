use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{ConnectionStatus, UserSession};

const SESSION_COLUMNS: &str = "id, user_id, session_id, pod_id, connection_status, \
     connected_at, disconnected_at, last_heartbeat";

fn map_session(row: &PgRow) -> Result<UserSession, sqlx::Error> {
    let status: String = row.try_get("connection_status")?;

    Ok(UserSession {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        pod_id: row.try_get("pod_id")?,
        connection_status: ConnectionStatus::parse(&status).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "connection_status".to_string(),
                source: "unknown enum value".into(),
            }
        })?,
        connected_at: row.try_get("connected_at")?,
        disconnected_at: row.try_get("disconnected_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
    })
}

#[derive(Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open (or re-open) a session. Merge key is (user_id, session_id): a
    /// reconnect with the same session id takes ownership for this pod.
    pub async fn upsert_active(
        &self,
        user_id: &str,
        session_id: Uuid,
        pod_id: &str,
    ) -> AppResult<UserSession> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO user_sessions (user_id, session_id, pod_id, connection_status,
                                       connected_at, disconnected_at, last_heartbeat)
            VALUES ($1, $2, $3, 'ACTIVE', NOW(), NULL, NOW())
            ON CONFLICT (user_id, session_id)
            DO UPDATE SET pod_id = EXCLUDED.pod_id,
                          connection_status = 'ACTIVE',
                          connected_at = NOW(),
                          disconnected_at = NULL,
                          last_heartbeat = NOW()
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(session_id)
        .bind(pod_id)
        .fetch_one(&self.pool)
        .await?;

        map_session(&row).map_err(AppError::from)
    }

    /// Close a session, bound by (session_id, pod_id) so another pod's
    /// identically-named session is never clobbered.
    pub async fn mark_inactive(&self, session_id: Uuid, pod_id: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_sessions
            SET connection_status = 'INACTIVE', disconnected_at = NOW()
            WHERE session_id = $1 AND pod_id = $2 AND connection_status = 'ACTIVE'
            "#,
        )
        .bind(session_id)
        .bind(pod_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// One batched heartbeat for every session this pod owns.
    pub async fn touch_heartbeats(&self, pod_id: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_sessions
            SET last_heartbeat = NOW()
            WHERE pod_id = $1 AND connection_status = 'ACTIVE'
            "#,
        )
        .bind(pod_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// ACTIVE sessions whose heartbeat is older than the threshold.
    pub async fn find_stale(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<UserSession>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM user_sessions
            WHERE connection_status = 'ACTIVE' AND last_heartbeat < $1
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(map_session)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Batch-close stale sessions regardless of owning pod.
    pub async fn mark_inactive_by_ids(&self, ids: &[i64]) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE user_sessions
            SET connection_status = 'INACTIVE', disconnected_at = NOW()
            WHERE id = ANY($1) AND connection_status = 'ACTIVE'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Hard-delete long-INACTIVE sessions (daily retention purge).
    pub async fn purge_inactive_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_sessions
            WHERE connection_status = 'INACTIVE' AND disconnected_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
