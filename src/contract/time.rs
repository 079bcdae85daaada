//! Civil-time formatting and parsing for contract validity periods.
//!
//! Contracts carry their validity period as human-readable text inside the
//! legally binding message, e.g. `dinsdag, 1 oktober 2019 13:30:42`. The
//! period is rendered and interpreted in a fixed civil zone and locale:
//! Europe/Amsterdam with Dutch day and month names.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Europe::Amsterdam;
use chrono_tz::Tz;

use crate::error::Error;

/// The civil zone contracts are drawn up in.
pub const CONTRACT_TIME_ZONE: Tz = Amsterdam;

const DAYS_NL: [&str; 7] =
    ["maandag", "dinsdag", "woensdag", "donderdag", "vrijdag", "zaterdag", "zondag"];

const MONTHS_NL: [&str; 12] = [
    "januari", "februari", "maart", "april", "mei", "juni", "juli", "augustus", "september",
    "oktober", "november", "december",
];

/// Format an instant using the contract time layout (`Monday, 2 January 2006
/// 15:04:05`) in the Dutch locale, in the Amsterdam civil zone.
#[must_use]
pub fn format_contract_time(at: DateTime<Utc>) -> String {
    let local = at.with_timezone(&CONTRACT_TIME_ZONE);
    let day = DAYS_NL[local.weekday().num_days_from_monday() as usize];
    let month = MONTHS_NL[local.month0() as usize];
    format!(
        "{day}, {} {month} {} {:02}:{:02}:{:02}",
        local.day(),
        local.year(),
        local.hour(),
        local.minute(),
        local.second()
    )
}

/// Parse a contract time string in the Dutch locale, interpreting it in the
/// Amsterdam civil zone.
///
/// # Errors
///
/// Returns `Error::ContractInvalid` when the string does not follow the
/// contract time layout or does not name a valid date.
pub fn parse_contract_time(s: &str) -> Result<DateTime<Utc>, Error> {
    let invalid = || Error::ContractInvalid(format!("invalid time string [{s}]"));

    let (day_name, rest) = s.split_once(", ").ok_or_else(invalid)?;
    if !DAYS_NL.contains(&day_name) {
        return Err(invalid());
    }

    let parts: Vec<&str> = rest.split_whitespace().collect();
    let [day, month_name, year, clock] = parts.as_slice() else {
        return Err(invalid());
    };

    let month = MONTHS_NL
        .iter()
        .position(|m| m == month_name)
        .ok_or_else(invalid)? as u32
        + 1;
    let day: u32 = day.parse().map_err(|_| invalid())?;
    let year: i32 = year.parse().map_err(|_| invalid())?;

    let clock_parts: Vec<&str> = clock.split(':').collect();
    let [hour, minute, second] = clock_parts.as_slice() else {
        return Err(invalid());
    };
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    let second: u32 = second.parse().map_err(|_| invalid())?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(invalid)?;

    // ambiguous or skipped local times (DST transitions) are rejected rather
    // than silently resolved
    let local = CONTRACT_TIME_ZONE.from_local_datetime(&naive).single().ok_or_else(invalid)?;

    Ok(local.with_timezone(&Utc))
}
