use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::{AppError, AppResult};
use crate::models::{Broadcast, BroadcastPriority, BroadcastStatus, TargetType};

/// Fields of a broadcast before the server assigns an id.
#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub target_type: TargetType,
    pub target_ids: Vec<String>,
    pub priority: BroadcastPriority,
    pub category: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: BroadcastStatus,
}

/// Admin listing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFilter {
    All,
    Active,
    Scheduled,
}

impl BroadcastFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(BroadcastFilter::All),
            "active" => Some(BroadcastFilter::Active),
            "scheduled" => Some(BroadcastFilter::Scheduled),
            _ => None,
        }
    }
}

const BROADCAST_COLUMNS: &str = "id, sender_id, sender_name, content, target_type, target_ids, \
     priority, category, scheduled_at, expires_at, status, created_at, updated_at";

fn map_broadcast(row: &PgRow) -> Result<Broadcast, sqlx::Error> {
    let target_type: String = row.try_get("target_type")?;
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;

    let decode = |col: &str| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: "unknown enum value".into(),
    };

    Ok(Broadcast {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        sender_name: row.try_get("sender_name")?,
        content: row.try_get("content")?,
        target_type: TargetType::parse(&target_type).ok_or_else(|| decode("target_type"))?,
        target_ids: row.try_get("target_ids")?,
        priority: BroadcastPriority::parse(&priority).ok_or_else(|| decode("priority"))?,
        category: row.try_get("category")?,
        scheduled_at: row.try_get("scheduled_at")?,
        expires_at: row.try_get("expires_at")?,
        status: BroadcastStatus::parse(&status).ok_or_else(|| decode("status"))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Clone)]
pub struct BroadcastRepository {
    pool: PgPool,
}

impl BroadcastRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert inside the caller's transaction; returns the stored row.
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        new: &NewBroadcast,
    ) -> AppResult<Broadcast> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO broadcasts (
                sender_id, sender_name, content, target_type, target_ids,
                priority, category, scheduled_at, expires_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {BROADCAST_COLUMNS}
            "#
        ))
        .bind(&new.sender_id)
        .bind(&new.sender_name)
        .bind(&new.content)
        .bind(new.target_type.as_str())
        .bind(&new.target_ids)
        .bind(new.priority.as_str())
        .bind(&new.category)
        .bind(new.scheduled_at)
        .bind(new.expires_at)
        .bind(new.status.as_str())
        .fetch_one(&mut **tx)
        .await?;

        map_broadcast(&row).map_err(AppError::from)
    }

    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<Broadcast>> {
        let row = sqlx::query(&format!(
            "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(map_broadcast)
            .transpose()
            .map_err(AppError::from)
    }

    pub async fn list(&self, filter: BroadcastFilter, limit: i64) -> AppResult<Vec<Broadcast>> {
        let rows = match filter {
            BroadcastFilter::All => {
                sqlx::query(&format!(
                    "SELECT {BROADCAST_COLUMNS} FROM broadcasts ORDER BY created_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            BroadcastFilter::Active => {
                sqlx::query(&format!(
                    "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE status = 'ACTIVE' \
                     ORDER BY created_at DESC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            BroadcastFilter::Scheduled => {
                sqlx::query(&format!(
                    "SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE status = 'SCHEDULED' \
                     ORDER BY scheduled_at ASC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(map_broadcast)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Claim due SCHEDULED rows for activation.
    ///
    /// Rows stay locked until `tx` ends; rows claimed by a sibling pod are
    /// skipped, which is what makes the two-pod activation race safe.
    pub async fn claim_due_scheduled(
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> AppResult<Vec<Broadcast>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BROADCAST_COLUMNS}
            FROM broadcasts
            WHERE status = 'SCHEDULED' AND scheduled_at <= NOW()
            ORDER BY scheduled_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter()
            .map(map_broadcast)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Claim ACTIVE rows whose expiry has passed.
    pub async fn claim_expired_active(
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> AppResult<Vec<Broadcast>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BROADCAST_COLUMNS}
            FROM broadcasts
            WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= NOW()
            ORDER BY expires_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter()
            .map(map_broadcast)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    /// Conditional status transition; returns affected rows (0 = lost race).
    pub async fn update_status(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        from: BroadcastStatus,
        to: BroadcastStatus,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE broadcasts SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Cancel an ACTIVE or SCHEDULED broadcast. 0 affected rows means the
    /// broadcast is already terminal (or missing; the caller distinguishes).
    pub async fn cancel(tx: &mut Transaction<'_, Postgres>, id: i64) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE broadcasts
            SET status = 'CANCELLED', updated_at = NOW()
            WHERE id = $1 AND status IN ('ACTIVE', 'SCHEDULED')
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }
}
