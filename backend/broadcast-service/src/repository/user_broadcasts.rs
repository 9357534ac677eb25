use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::{AppError, AppResult};
use crate::models::{DeliveryStatus, ReadStatus, UserBroadcast};

const USER_BROADCAST_COLUMNS: &str = "id, broadcast_id, user_id, delivery_status, read_status, \
     delivered_at, read_at, created_at, updated_at";

fn map_user_broadcast(row: &PgRow) -> Result<UserBroadcast, sqlx::Error> {
    let delivery: String = row.try_get("delivery_status")?;
    let read: String = row.try_get("read_status")?;

    let decode = |col: &str| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: "unknown enum value".into(),
    };

    Ok(UserBroadcast {
        id: row.try_get("id")?,
        broadcast_id: row.try_get("broadcast_id")?,
        user_id: row.try_get("user_id")?,
        delivery_status: DeliveryStatus::parse(&delivery)
            .ok_or_else(|| decode("delivery_status"))?,
        read_status: ReadStatus::parse(&read).ok_or_else(|| decode("read_status"))?,
        delivered_at: row.try_get("delivered_at")?,
        read_at: row.try_get("read_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Clone)]
pub struct UserBroadcastRepository {
    pool: PgPool,
}

impl UserBroadcastRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Materialize one PENDING/UNREAD row per recipient.
    ///
    /// `ON CONFLICT DO NOTHING` on the (broadcast, user) pair makes a
    /// replayed activation a no-op.
    pub async fn insert_batch(
        tx: &mut Transaction<'_, Postgres>,
        broadcast_id: i64,
        user_ids: &[String],
    ) -> AppResult<u64> {
        if user_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO user_broadcasts (broadcast_id, user_id)
            SELECT $1, unnest($2::TEXT[])
            ON CONFLICT (broadcast_id, user_id) DO NOTHING
            "#,
        )
        .bind(broadcast_id)
        .bind(user_ids)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// The idempotency guard for CREATED events: only a still-PENDING row.
    pub async fn find_pending(
        &self,
        user_id: &str,
        broadcast_id: i64,
    ) -> AppResult<Option<UserBroadcast>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {USER_BROADCAST_COLUMNS}
            FROM user_broadcasts
            WHERE user_id = $1 AND broadcast_id = $2 AND delivery_status = 'PENDING'
            "#
        ))
        .bind(user_id)
        .bind(broadcast_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(map_user_broadcast)
            .transpose()
            .map_err(AppError::from)
    }

    /// Reconnect replay source, oldest first.
    pub async fn find_pending_for_user(&self, user_id: &str) -> AppResult<Vec<UserBroadcast>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {USER_BROADCAST_COLUMNS}
            FROM user_broadcasts
            WHERE user_id = $1 AND delivery_status = 'PENDING'
            ORDER BY created_at ASC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(map_user_broadcast)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// PENDING → DELIVERED, conditioned on the row still being PENDING.
    ///
    /// Returns affected rows; 0 means another pod already delivered and the
    /// caller must not touch statistics.
    pub async fn mark_delivered(&self, id: i64) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_broadcasts
            SET delivery_status = 'DELIVERED', delivered_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND delivery_status = 'PENDING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// UNREAD → READ inside the caller's transaction; 0 rows = replayed.
    pub async fn mark_read(
        tx: &mut Transaction<'_, Postgres>,
        broadcast_id: i64,
        user_id: &str,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE user_broadcasts
            SET read_status = 'READ', read_at = NOW(), updated_at = NOW()
            WHERE broadcast_id = $1 AND user_id = $2 AND read_status = 'UNREAD'
            "#,
        )
        .bind(broadcast_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Flip every still-PENDING row of an expiring broadcast to SUPERSEDED;
    /// returns the affected user ids.
    pub async fn supersede_pending(
        tx: &mut Transaction<'_, Postgres>,
        broadcast_id: i64,
    ) -> AppResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE user_broadcasts
            SET delivery_status = 'SUPERSEDED', updated_at = NOW()
            WHERE broadcast_id = $1 AND delivery_status = 'PENDING'
            RETURNING user_id
            "#,
        )
        .bind(broadcast_id)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter()
            .map(|r| r.try_get("user_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// All targeted user ids of a broadcast (cancel / expire fan-out).
    pub async fn user_ids_for_broadcast(
        tx: &mut Transaction<'_, Postgres>,
        broadcast_id: i64,
    ) -> AppResult<Vec<String>> {
        let rows = sqlx::query("SELECT user_id FROM user_broadcasts WHERE broadcast_id = $1")
            .bind(broadcast_id)
            .fetch_all(&mut **tx)
            .await?;

        rows.iter()
            .map(|r| r.try_get("user_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Admin deliveries view.
    pub async fn list_for_broadcast(&self, broadcast_id: i64) -> AppResult<Vec<UserBroadcast>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {USER_BROADCAST_COLUMNS}
            FROM user_broadcasts
            WHERE broadcast_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(broadcast_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(map_user_broadcast)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }
}
