use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::models::{QuietHours, UserPreferences};

/// Keeps each IN-list under typical parameter limits.
const LOOKUP_CHUNK_SIZE: usize = 900;

fn map_preferences(row: &PgRow) -> Result<UserPreferences, sqlx::Error> {
    let quiet_start: Option<chrono::NaiveTime> = row.try_get("quiet_start")?;
    let quiet_end: Option<chrono::NaiveTime> = row.try_get("quiet_end")?;
    let quiet_tz: Option<String> = row.try_get("quiet_tz")?;

    let quiet_hours = match (quiet_start, quiet_end, quiet_tz) {
        (Some(start), Some(end), Some(timezone)) => Some(QuietHours {
            start,
            end,
            timezone,
        }),
        _ => None,
    };

    Ok(UserPreferences {
        user_id: row.try_get("user_id")?,
        notifications_enabled: row.try_get("notifications_enabled")?,
        preferred_categories: row.try_get("preferred_categories")?,
        quiet_hours,
    })
}

#[derive(Clone)]
pub struct PreferencesRepository {
    pool: PgPool,
}

impl PreferencesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch preferences for a candidate set, chunked at 900 ids.
    ///
    /// Users without a row simply don't appear in the result; the caller
    /// treats them as default (notifications on, no quiet hours).
    pub async fn find_by_user_ids(&self, user_ids: &[String]) -> AppResult<Vec<UserPreferences>> {
        let mut out = Vec::with_capacity(user_ids.len());

        for chunk in user_ids.chunks(LOOKUP_CHUNK_SIZE) {
            let rows = sqlx::query(
                r#"
                SELECT user_id, notifications_enabled, preferred_categories,
                       quiet_start, quiet_end, quiet_tz
                FROM user_preferences
                WHERE user_id = ANY($1)
                "#,
            )
            .bind(chunk)
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                out.push(map_preferences(row).map_err(AppError::from)?);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_stays_under_parameter_limits() {
        assert!(LOOKUP_CHUNK_SIZE <= 900);

        let ids: Vec<String> = (0..2000).map(|i| format!("u{}", i)).collect();
        let chunks: Vec<_> = ids.chunks(LOOKUP_CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 900);
        assert_eq!(chunks[2].len(), 200);
    }
}
