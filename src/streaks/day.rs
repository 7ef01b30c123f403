//! Calendar-day arithmetic.
//!
//! Days are plain `NaiveDate` values: no time of day, stepped in whole days,
//! so DST transitions cannot shift a bucket.

use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;

/// Format used for stored days.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Calendar day of `now` in `tz`.
pub fn local_today(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Parse a stored log date.
///
/// Only the leading `YYYY-MM-DD` is read, so values stored with a time
/// suffix still land on their calendar day. The stored day has no time
/// component; it is taken as a day of the rule's timezone as-is, without
/// shifting between zones.
pub fn parse_log_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(head, DAY_FORMAT).ok()
}

/// Format a day for storage.
pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// `day` minus `n` days, clamped at the minimum representable date.
pub fn days_before(day: NaiveDate, n: u64) -> NaiveDate {
    day.checked_sub_days(Days::new(n)).unwrap_or(NaiveDate::MIN)
}

/// Every day from `first` through `last`, inclusive. Empty when `first > last`.
pub fn days_between(first: NaiveDate, last: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    first.iter_days().take_while(move |day| *day <= last)
}

/// The `n` consecutive days ending at `today`, oldest first.
pub fn trailing_days(today: NaiveDate, n: u64) -> impl Iterator<Item = NaiveDate> {
    days_between(days_before(today, n.saturating_sub(1)), today).take(n as usize)
}
