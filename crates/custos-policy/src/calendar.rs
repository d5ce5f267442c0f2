//! Calendar restrictions
//!
//! Outside business hours, on weekends and on holidays nobody is watching the
//! veto dashboard, so timed windows would expire unseen.

use crate::config::CalendarRules;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Result of a calendar check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarVerdict {
    /// Inside business hours on a working day
    Open,
    /// Working day, outside business hours
    OutsideBusinessHours,
    /// Weekend or holiday
    RestrictedDay,
}

impl CalendarVerdict {
    /// Check if supervision is staffed
    #[inline]
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl CalendarRules {
    /// Classify `now` against these rules
    #[must_use]
    pub fn check(&self, now: DateTime<Utc>) -> CalendarVerdict {
        if !self.enabled {
            return CalendarVerdict::Open;
        }
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_minutes * 60) else {
            tracing::warn!(
                offset_minutes = self.utc_offset_minutes,
                "invalid calendar offset, treating as restricted"
            );
            return CalendarVerdict::RestrictedDay;
        };
        let local = now.with_timezone(&offset);

        if self.holidays.contains(&local.date_naive()) {
            return CalendarVerdict::RestrictedDay;
        }
        if self.weekend_restricted && matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return CalendarVerdict::RestrictedDay;
        }
        let hour = local.hour();
        if hour < self.business_start_hour || hour >= self.business_end_hour {
            return CalendarVerdict::OutsideBusinessHours;
        }
        CalendarVerdict::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn weekday_business_hours_are_open() {
        let rules = CalendarRules::default();
        // Tuesday 10:00 UTC is 11:00 at +01:00
        assert_eq!(rules.check(utc(2025, 3, 4, 10, 0)), CalendarVerdict::Open);
    }

    #[test]
    fn offset_moves_the_boundary() {
        let rules = CalendarRules::default();
        // 19:30 UTC is 20:30 local
        assert_eq!(
            rules.check(utc(2025, 3, 4, 19, 30)),
            CalendarVerdict::OutsideBusinessHours
        );
        let utc_rules = CalendarRules::default().with_utc_offset_minutes(0);
        assert_eq!(utc_rules.check(utc(2025, 3, 4, 19, 30)), CalendarVerdict::Open);
    }

    #[test]
    fn weekends_and_holidays_are_restricted() {
        let rules = CalendarRules::default()
            .with_holiday(NaiveDate::from_ymd_opt(2025, 12, 25).unwrap());
        assert_eq!(rules.check(utc(2025, 3, 8, 10, 0)), CalendarVerdict::RestrictedDay);
        assert_eq!(rules.check(utc(2025, 12, 25, 10, 0)), CalendarVerdict::RestrictedDay);
    }

    #[test]
    fn disabled_rules_never_restrict() {
        let rules = CalendarRules::disabled();
        assert!(rules.check(utc(2025, 3, 8, 3, 0)).is_open());
    }
}
