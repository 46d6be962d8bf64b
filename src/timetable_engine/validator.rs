//! Invariant checks for assembled timetables.
//!
//! Validation runs once per (request, offset) on the fully merged payload;
//! a failure drops that offset from batch responses.

use chrono::{NaiveDate, NaiveTime};

use super::error::{EngineError, EngineResult};
use super::model::{TimetableData, FORMAT_VERSION};

/// Checks the payload invariants and fills in the computed `weekKey`.
pub fn validate_timetable(data: &mut TimetableData) -> EngineResult<()> {
    if data.format_version != FORMAT_VERSION {
        return Err(invalid(format!(
            "format version must be {FORMAT_VERSION}, got {}",
            data.format_version
        )));
    }

    if let Some(week_number) = data.week_info.week_number {
        if !(1..=53).contains(&week_number) {
            return Err(invalid(format!("week number {week_number} out of range")));
        }
    }
    check_date(data.week_info.start_date.as_deref(), "week start date")?;
    check_date(data.week_info.end_date.as_deref(), "week end date")?;
    if let (Some(start), Some(end)) = (
        data.week_info.start_date.as_deref(),
        data.week_info.end_date.as_deref(),
    ) {
        // ISO strings compare in date order.
        if start > end {
            return Err(invalid(format!(
                "week starts after it ends ({start} > {end})"
            )));
        }
    }

    for event in &data.events {
        check_date(event.date.as_deref(), "event date")?;
        check_time(event.start_time.as_deref(), "event start time")?;
        check_time(event.end_time.as_deref(), "event end time")?;
    }

    if data.week_info.week_key.is_none() {
        if let (Some(year), Some(week_number)) =
            (data.week_info.year, data.week_info.week_number)
        {
            data.week_info.week_key = Some(format!("{year}-W{week_number:02}"));
        }
    }

    Ok(())
}

fn check_date(value: Option<&str>, what: &str) -> EngineResult<()> {
    if let Some(value) = value {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map_err(|_| invalid(format!("{what} {value:?} is not YYYY-MM-DD")))?;
    }
    Ok(())
}

fn check_time(value: Option<&str>, what: &str) -> EngineResult<()> {
    if let Some(value) = value {
        NaiveTime::parse_from_str(value, "%H:%M")
            .map_err(|_| invalid(format!("{what} {value:?} is not HH:MM")))?;
    }
    Ok(())
}

fn invalid(message: String) -> EngineError {
    EngineError::Validation(message)
}
