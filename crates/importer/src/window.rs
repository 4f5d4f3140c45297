use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use crate::error::ImportError;

/// One calendar day's recording interval, half-open `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    /// 1-based day number within the request
    pub index: usize,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DayWindow {
    pub fn duration_secs(&self) -> f64 {
        secs_between(self.start, self.end)
    }

    pub fn crosses_midnight(&self) -> bool {
        self.end.date() > self.start.date()
    }

    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        start < self.end && self.start < end
    }
}

/// Signed seconds from `from` to `to`, millisecond precision
pub fn secs_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, ImportError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ImportError::InvalidRange(format!("unparsable date '{}'", raw)))
}

/// Parse a wall-clock time given as "H:MM" or "HH:MM"
pub fn parse_time(raw: &str) -> Result<NaiveTime, ImportError> {
    let invalid = || ImportError::InvalidRange(format!("unparsable time '{}'", raw));
    let (hh, mm) = raw.trim().split_once(':').ok_or_else(invalid)?;
    let h: u32 = hh.parse().map_err(|_| invalid())?;
    let m: u32 = mm.parse().map_err(|_| invalid())?;
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    NaiveTime::from_hms_opt(h, m, 0).ok_or_else(invalid)
}

/// Build one window per calendar day from `start_date` to `end_date` inclusive.
///
/// When `end_time <= start_time` every window ends on the following day, which
/// models overnight recording shifts.
pub fn plan_windows(
    start_date: NaiveDate,
    end_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
) -> Result<Vec<DayWindow>, ImportError> {
    let days = (end_date - start_date).num_days() + 1;
    if days < 1 {
        return Err(ImportError::InvalidRange(format!(
            "end date {} is before start date {}",
            end_date, start_date
        )));
    }

    let crosses = end_time <= start_time;
    let windows = (0..days)
        .map(|i| {
            let day = start_date + Duration::days(i);
            let start = day.and_time(start_time);
            let end_day = if crosses { day + Duration::days(1) } else { day };
            DayWindow {
                index: i as usize + 1,
                start,
                end: end_day.and_time(end_time),
            }
        })
        .collect();
    Ok(windows)
}

/// String front-end for [`plan_windows`]
pub fn day_windows(
    start_date: &str,
    end_date: &str,
    start_time: &str,
    end_time: &str,
) -> Result<Vec<DayWindow>, ImportError> {
    plan_windows(
        parse_date(start_date)?,
        parse_date(end_date)?,
        parse_time(start_time)?,
        parse_time(end_time)?,
    )
}
