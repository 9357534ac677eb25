use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::{AppError, AppResult};
use crate::models::BroadcastStatistics;

fn map_statistics(row: &PgRow) -> Result<BroadcastStatistics, sqlx::Error> {
    Ok(BroadcastStatistics {
        broadcast_id: row.try_get("broadcast_id")?,
        total_targeted: row.try_get("total_targeted")?,
        total_delivered: row.try_get("total_delivered")?,
        total_read: row.try_get("total_read")?,
        total_failed: row.try_get("total_failed")?,
        calculated_at: row.try_get("calculated_at")?,
    })
}

/// Counters are only ever moved by atomic server-side increments, guarded by
/// the corresponding row-status transition; never recomputed client-side.
#[derive(Clone)]
pub struct StatisticsRepository {
    pool: PgPool,
}

impl StatisticsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Seed the per-broadcast row at activation time.
    pub async fn seed(
        tx: &mut Transaction<'_, Postgres>,
        broadcast_id: i64,
        total_targeted: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO broadcast_statistics (broadcast_id, total_targeted, calculated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (broadcast_id)
            DO UPDATE SET total_targeted = EXCLUDED.total_targeted, calculated_at = NOW()
            "#,
        )
        .bind(broadcast_id)
        .bind(total_targeted)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn increment_delivered(&self, broadcast_id: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE broadcast_statistics
            SET total_delivered = total_delivered + 1, calculated_at = NOW()
            WHERE broadcast_id = $1
            "#,
        )
        .bind(broadcast_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn increment_read(
        tx: &mut Transaction<'_, Postgres>,
        broadcast_id: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE broadcast_statistics
            SET total_read = total_read + 1, calculated_at = NOW()
            WHERE broadcast_id = $1
            "#,
        )
        .bind(broadcast_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get(&self, broadcast_id: i64) -> AppResult<Option<BroadcastStatistics>> {
        let row = sqlx::query(
            r#"
            SELECT broadcast_id, total_targeted, total_delivered, total_read,
                   total_failed, calculated_at
            FROM broadcast_statistics
            WHERE broadcast_id = $1
            "#,
        )
        .bind(broadcast_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(map_statistics)
            .transpose()
            .map_err(AppError::from)
    }
}
