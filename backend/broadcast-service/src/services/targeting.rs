//! Resolves a broadcast's target set into the concrete recipient list.
//!
//! The directory is authoritative for the candidate roster; local
//! preferences only filter it. Users with no preference row get defaults
//! (notifications on, all categories, no quiet hours).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::{Broadcast, QuietHours, TargetType, UserPreferences};
use crate::repository::PreferencesRepository;
use crate::services::directory::{DirectoryError, UserDirectory};

pub struct TargetingService {
    directory: Arc<dyn UserDirectory>,
    preferences: PreferencesRepository,
}

impl TargetingService {
    pub fn new(directory: Arc<dyn UserDirectory>, preferences: PreferencesRepository) -> Self {
        Self {
            directory,
            preferences,
        }
    }

    /// Concrete recipient ids for a broadcast, preference-filtered.
    ///
    /// A directory failure propagates as an error; silently delivering to a
    /// partial roster is not an option.
    pub async fn resolve_recipients(&self, broadcast: &Broadcast) -> AppResult<Vec<String>> {
        let candidates = match broadcast.target_type {
            TargetType::All => self.directory.full_roster().await.map_err(map_directory)?,
            TargetType::Role => {
                let role = broadcast.target_ids.first().ok_or_else(|| {
                    AppError::Validation("ROLE broadcast needs a role name".to_string())
                })?;
                self.directory
                    .role_members(role)
                    .await
                    .map_err(map_directory)?
            }
            TargetType::Selected => broadcast.target_ids.clone(),
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let preferences = self.preferences.find_by_user_ids(&candidates).await?;
        let by_user: HashMap<&str, &UserPreferences> = preferences
            .iter()
            .map(|p| (p.user_id.as_str(), p))
            .collect();

        let now = Utc::now();
        let recipients: Vec<String> = candidates
            .into_iter()
            .filter(|user_id| match by_user.get(user_id.as_str()) {
                Some(prefs) => accepts(prefs, &broadcast.category, now),
                None => true,
            })
            .collect();

        debug!(
            broadcast_id = broadcast.id,
            target_type = broadcast.target_type.as_str(),
            recipients = recipients.len(),
            "Target set resolved"
        );

        Ok(recipients)
    }
}

fn map_directory(e: DirectoryError) -> AppError {
    AppError::DirectoryUnavailable(e.to_string())
}

/// Does this user currently accept a broadcast of the given category?
pub fn accepts(prefs: &UserPreferences, category: &str, now: DateTime<Utc>) -> bool {
    if !prefs.notifications_enabled {
        return false;
    }

    if !prefs.preferred_categories.is_empty()
        && !prefs.preferred_categories.iter().any(|c| c == category)
    {
        return false;
    }

    match &prefs.quiet_hours {
        Some(window) => !in_quiet_hours(window, now),
        None => true,
    }
}

/// Is `now` inside the user's quiet-hours window, in their local timezone?
///
/// start > end means the window wraps midnight.
pub fn in_quiet_hours(window: &QuietHours, now: DateTime<Utc>) -> bool {
    let tz: chrono_tz::Tz = match window.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = %window.timezone, "Unknown quiet-hours timezone, ignoring window");
            return false;
        }
    };

    let local = now.with_timezone(&tz).time();

    if window.start <= window.end {
        local >= window.start && local < window.end
    } else {
        local >= window.start || local < window.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn prefs(
        enabled: bool,
        categories: &[&str],
        quiet: Option<QuietHours>,
    ) -> UserPreferences {
        UserPreferences {
            user_id: "u1".to_string(),
            notifications_enabled: enabled,
            preferred_categories: categories.iter().map(|s| s.to_string()).collect(),
            quiet_hours: quiet,
        }
    }

    fn quiet(start: &str, end: &str, tz: &str) -> QuietHours {
        QuietHours {
            start: NaiveTime::parse_from_str(start, "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str(end, "%H:%M").unwrap(),
            timezone: tz.to_string(),
        }
    }

    fn at_utc(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    #[test]
    fn disabled_notifications_reject_everything() {
        assert!(!accepts(&prefs(false, &[], None), "general", at_utc(12, 0)));
    }

    #[test]
    fn empty_category_list_accepts_all_categories() {
        assert!(accepts(&prefs(true, &[], None), "anything", at_utc(12, 0)));
    }

    #[test]
    fn category_filter_is_exact() {
        let p = prefs(true, &["alerts", "maintenance"], None);
        assert!(accepts(&p, "alerts", at_utc(12, 0)));
        assert!(!accepts(&p, "marketing", at_utc(12, 0)));
    }

    #[test]
    fn same_day_quiet_window() {
        let window = quiet("13:00", "15:00", "UTC");
        assert!(!in_quiet_hours(&window, at_utc(12, 59)));
        assert!(in_quiet_hours(&window, at_utc(13, 0)));
        assert!(in_quiet_hours(&window, at_utc(14, 30)));
        assert!(!in_quiet_hours(&window, at_utc(15, 0)));
    }

    #[test]
    fn overnight_quiet_window_wraps_midnight() {
        let window = quiet("22:00", "07:00", "UTC");
        assert!(in_quiet_hours(&window, at_utc(23, 0)));
        assert!(in_quiet_hours(&window, at_utc(3, 0)));
        assert!(!in_quiet_hours(&window, at_utc(7, 0)));
        assert!(!in_quiet_hours(&window, at_utc(12, 0)));
    }

    #[test]
    fn quiet_window_respects_user_timezone() {
        // 12:00 UTC is 21:00 in Tokyo
        let window = quiet("20:00", "23:00", "Asia/Tokyo");
        assert!(in_quiet_hours(&window, at_utc(12, 0)));
        assert!(!in_quiet_hours(&window, at_utc(16, 0)));
    }

    #[test]
    fn unknown_timezone_disables_the_window() {
        let window = quiet("00:00", "23:59", "Not/AZone");
        assert!(!in_quiet_hours(&window, at_utc(12, 0)));
    }
}
