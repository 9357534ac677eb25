use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::DltRecord;

const DLT_COLUMNS: &str = "id, original_topic, original_partition, original_offset, \
     exception_message, payload, failed_at";

fn map_record(row: &PgRow) -> Result<DltRecord, sqlx::Error> {
    Ok(DltRecord {
        id: row.try_get("id")?,
        original_topic: row.try_get("original_topic")?,
        original_partition: row.try_get("original_partition")?,
        original_offset: row.try_get("original_offset")?,
        exception_message: row.try_get("exception_message")?,
        payload: row.try_get("payload")?,
        failed_at: row.try_get("failed_at")?,
    })
}

#[derive(Clone)]
pub struct DltRepository {
    pool: PgPool,
}

impl DltRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &DltRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dlt_records (id, original_topic, original_partition, original_offset,
                                     exception_message, payload, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.original_topic)
        .bind(record.original_partition)
        .bind(record.original_offset)
        .bind(&record.exception_message)
        .bind(&record.payload)
        .bind(record.failed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<DltRecord>> {
        let row = sqlx::query(&format!("SELECT {DLT_COLUMNS} FROM dlt_records WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(map_record)
            .transpose()
            .map_err(AppError::from)
    }

    pub async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<DltRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DLT_COLUMNS}
            FROM dlt_records
            ORDER BY failed_at DESC
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(map_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM dlt_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
