//! Week and time-of-day arithmetic.
//!
//! Days of the week are numbered `0 = Sunday ... 6 = Saturday`, but weeks start on Monday: a
//! template applied to the week of Monday 2026-10-19 places a Sunday (`0`) entry on 2026-10-25.
//! Wall-clock times are read in a fixed UTC offset taken from configuration.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};

use crate::db::models::lessons::LessonDBResponse;
use crate::errors::{Error, Result};
use crate::types::UserId;

pub fn is_monday(date: NaiveDate) -> bool {
    date.weekday() == Weekday::Mon
}

/// Days between the Monday that starts the week and the given day of week.
fn days_from_monday(day_of_week: i16) -> i64 {
    i64::from((day_of_week + 6) % 7)
}

/// Instant of `time` on the given day of the week that starts on `week_start`.
pub fn occurrence(week_start: NaiveDate, day_of_week: i16, time: NaiveTime, offset: FixedOffset) -> Result<DateTime<Utc>> {
    if !(0..=6).contains(&day_of_week) {
        return Err(Error::invalid("day_of_week", format!("{day_of_week} is not in 0..=6")));
    }
    let date = week_start + Duration::days(days_from_monday(day_of_week));
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| Error::invalid("start_time", format!("{date} {time} does not exist in offset {offset}")))
}

/// Day of week (`0 = Sunday`) of an instant, read in `offset`.
pub fn day_of_week(at: DateTime<Utc>, offset: FixedOffset) -> i16 {
    at.with_timezone(&offset).weekday().num_days_from_sunday() as i16
}

/// What makes lessons "the same lesson, another week" for bulk edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatternKey {
    pub teacher_id: UserId,
    pub day_of_week: i16,
    pub time_of_day: NaiveTime,
}

impl PatternKey {
    pub fn of(lesson: &LessonDBResponse, offset: FixedOffset) -> Self {
        let local = lesson.start_time.with_timezone(&offset);
        Self {
            teacher_id: lesson.teacher_id,
            day_of_week: local.weekday().num_days_from_sunday() as i16,
            time_of_day: local.time(),
        }
    }

    pub fn matches(&self, lesson: &LessonDBResponse, offset: FixedOffset) -> bool {
        Self::of(lesson, offset) == *self
    }
}

/// A cancellation refunds only when made strictly before `start - window`.
pub fn refund_allowed(now: DateTime<Utc>, lesson_start: DateTime<Utc>, window: Duration) -> bool {
    now < lesson_start - window
}
