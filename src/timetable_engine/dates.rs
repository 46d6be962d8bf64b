//! Date and time-range normalization for the scraped timetable pages.
//!
//! The upstream mixes several date spellings (`24.03.2025`, `24/3`,
//! `24/3-2025`, ISO) in one document; everything is normalized to
//! `YYYY-MM-DD` as early as possible.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Order matters: the full forms must win over their prefix forms.
    static ref PERIOD_DATE_FULL: Regex = Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{4})").unwrap();
    static ref HYPHEN_DATE: Regex = Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})").unwrap();
    static ref SLASH_DATE_WITH_YEAR: Regex = Regex::new(r"^(\d{1,2})/(\d{1,2})-(\d{4})").unwrap();
    static ref SLASH_DATE_SHORT: Regex = Regex::new(r"^(\d{1,2})/(\d{1,2})").unwrap();
    static ref PERIOD_DATE_SHORT: Regex = Regex::new(r"^(\d{1,2})\.(\d{1,2})").unwrap();
}

/// Converts a date string in any supported spelling to ISO `YYYY-MM-DD`.
///
/// Day-first forms without a year (`DD.MM`, `DD/MM`) take `default_year`.
/// Returns `None` when no spelling matches.
pub fn to_iso_date(raw: &str, default_year: i32) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(c) = PERIOD_DATE_FULL.captures(raw) {
        return Some(iso(&c[3], &c[2], &c[1]));
    }
    if let Some(c) = HYPHEN_DATE.captures(raw) {
        return Some(iso(&c[1], &c[2], &c[3]));
    }
    if let Some(c) = SLASH_DATE_WITH_YEAR.captures(raw) {
        return Some(iso(&c[3], &c[2], &c[1]));
    }
    if let Some(c) = SLASH_DATE_SHORT.captures(raw) {
        return Some(iso(&default_year.to_string(), &c[2], &c[1]));
    }
    if let Some(c) = PERIOD_DATE_SHORT.captures(raw) {
        return Some(iso(&default_year.to_string(), &c[2], &c[1]));
    }
    None
}

fn iso(year: &str, month: &str, day: &str) -> String {
    format!("{}-{:0>2}-{:0>2}", year, month, day)
}

/// Splits `"08:10-09:40"` into start and end times.
///
/// Non-ranges such as `"N/A"` yield `(None, None)`.
pub fn parse_time_range(time_range: &str) -> (Option<String>, Option<String>) {
    let mut parts = time_range.splitn(2, '-');
    match (parts.next(), parts.next()) {
        (Some(start), Some(end)) => {
            (Some(start.trim().to_string()), Some(end.trim().to_string()))
        }
        _ => (None, None),
    }
}

/// Formats a four-digit year code `YYZZ` as the academic year `20YY-20ZZ`.
///
/// The expansion only applies when the two halves are consecutive years;
/// any other code is kept verbatim. Empty input yields `None`.
pub fn format_academic_year(year_code: &str) -> Option<String> {
    if year_code.is_empty() {
        return None;
    }
    if year_code.len() == 4 && year_code.chars().all(|c| c.is_ascii_digit()) {
        let start: u32 = 2000 + year_code[..2].parse::<u32>().ok()?;
        let end: u32 = 2000 + year_code[2..].parse::<u32>().ok()?;
        if end == start + 1 {
            return Some(format!("{start}-{end}"));
        }
    }
    Some(year_code.to_string())
}
