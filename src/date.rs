//! Ordinal (year, day-of-year) dates, leap-year aware, plus the handful of
//! wall-clock helpers the histories worker's 11:15 UTC cadence needs.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Date {
    pub year: u16,
    pub day: u16,
}

impl Date {
    pub fn is_leap_year(year: u16) -> bool {
        year % 400 == 0 || (year % 4 == 0 && year % 100 != 0)
    }

    pub fn days_in_year(self) -> u16 {
        if Self::is_leap_year(self.year) { 366 } else { 365 }
    }

    /// Advance one day, rolling over into the next year at the boundary.
    pub fn incr(self) -> Date {
        if self.day >= self.days_in_year() {
            Date { year: self.year + 1, day: 1 }
        } else {
            Date { year: self.year, day: self.day + 1 }
        }
    }

    pub fn from_epoch(epoch_secs: u64) -> Date {
        let dt = Utc
            .timestamp_opt(epoch_secs as i64, 0)
            .single()
            .expect("epoch_secs in range");
        Date {
            year: dt.year() as u16,
            day: dt.ordinal() as u16,
        }
    }

    pub fn parse(s: &str, format: &str) -> anyhow::Result<Date> {
        let naive = chrono::NaiveDate::parse_from_str(s, format)?;
        Ok(Date {
            year: naive.year() as u16,
            day: naive.ordinal() as u16,
        })
    }
}

impl PartialOrd for Date {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Date {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.day).cmp(&(other.year, other.day))
    }
}

/// `now`, offset by some number of whole days (may be negative).
pub fn epoch_minus_days(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - chrono::Duration::days(days)
}

/// The next occurrence of 11:15:00 UTC at or after `now` (today if `now`
/// is before it, else tomorrow).
pub fn next_eleven_fifteen(now: DateTime<Utc>) -> DateTime<Utc> {
    let target_time = NaiveTime::from_hms_opt(11, 15, 0).unwrap();
    let today = now.date_naive().and_time(target_time).and_utc();
    if now < today {
        today
    } else {
        (now.date_naive() + chrono::Duration::days(1))
            .and_time(target_time)
            .and_utc()
    }
}

pub fn is_before_eleven_fifteen(now: DateTime<Utc>) -> bool {
    let target_time = NaiveTime::from_hms_opt(11, 15, 0).unwrap();
    now.time() < target_time || now.hour() < 11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_stays_within_year() {
        let d = Date { year: 2024, day: 100 };
        assert_eq!(d.incr(), Date { year: 2024, day: 101 });
    }

    #[test]
    fn incr_rolls_over_non_leap_year() {
        let d = Date { year: 2023, day: 365 };
        assert_eq!(d.incr(), Date { year: 2024, day: 1 });
    }

    #[test]
    fn incr_rolls_over_leap_year() {
        let d = Date { year: 2024, day: 366 };
        assert_eq!(d.incr(), Date { year: 2025, day: 1 });
    }

    #[test]
    fn leap_year_rules() {
        assert!(Date::is_leap_year(2000));
        assert!(!Date::is_leap_year(1900));
        assert!(Date::is_leap_year(2024));
        assert!(!Date::is_leap_year(2023));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Date { year: 2024, day: 10 };
        let b = Date { year: 2024, day: 20 };
        let c = Date { year: 2025, day: 1 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn next_eleven_fifteen_before_cutover() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let next = next_eleven_fifteen(now);
        assert_eq!(next.day(), 1);
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn next_eleven_fifteen_after_cutover() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let next = next_eleven_fifteen(now);
        assert_eq!(next.day(), 2);
    }
}
