//! phenomenonTime rendering.
//!
//! Timestamps carrying an offset are absolute. Timestamps without one are
//! read with the configured fixed UTC offset. Either way the instant is then
//! shown in the sensor's origin timezone, formatted with a `chrono` pattern
//! and locale. Intervals (`start/end`) render both ends joined by `" - "`.

use chrono::{DateTime, FixedOffset, Locale, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::errors::{SyncError, SyncResult};

/// How phenomenonTime values are displayed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeRendering {
    pub utc_offset: FixedOffset,
    pub timezone: Tz,
    pub locale: Locale,
    pub pattern: String,
}

impl Default for TimeRendering {
    fn default() -> Self {
        Self {
            utc_offset: FixedOffset::east_opt(3600).unwrap_or(Utc.fix()),
            timezone: chrono_tz::Europe::Berlin,
            locale: Locale::de_DE,
            pattern: "%d. %B %Y, %H:%M:%S".to_string(),
        }
    }
}

impl TimeRendering {
    /// Builds a rendering from configuration strings.
    pub fn from_settings(utc_offset: &str, timezone: &str, locale: &str, pattern: &str) -> SyncResult<Self> {
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|e| SyncError::Configuration(format!("unknown timezone '{}': {}", timezone, e)))?;
        let locale = Locale::try_from(locale.replace('-', "_").as_str())
            .map_err(|_| SyncError::Configuration(format!("unknown locale '{}'", locale)))?;
        Ok(Self {
            utc_offset: parse_utc_offset(utc_offset)?,
            timezone,
            locale,
            pattern: pattern.to_string(),
        })
    }

    /// Renders an instant or interval. Unparseable input is returned as is.
    pub fn render(&self, phenomenon_time: &str) -> String {
        let raw = phenomenon_time.trim();
        if raw.is_empty() {
            return String::new();
        }
        raw.split('/')
            .map(|part| match self.parse_instant(part) {
                Some(instant) => instant
                    .with_timezone(&self.timezone)
                    .format_localized(&self.pattern, self.locale)
                    .to_string(),
                None => part.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" - ")
    }

    fn parse_instant(&self, part: &str) -> Option<DateTime<FixedOffset>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(part) {
            return Some(dt);
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(part, fmt).ok())
            .and_then(|naive| self.utc_offset.from_local_datetime(&naive).single())
    }
}

/// Parses `+1`, `-5`, `+01:00`, `+0530` or `Z` into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> SyncResult<FixedOffset> {
    let invalid = || SyncError::Configuration(format!("invalid UTC offset '{}'", raw));
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("z") {
        return Ok(Utc.fix());
    }

    let (sign, rest) = match trimmed.as_bytes()[0] {
        b'+' => (1, &trimmed[1..]),
        b'-' => (-1, &trimmed[1..]),
        _ => (1, trimmed),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().map_err(|_| invalid())?, 0),
        3 | 4 => {
            let split = digits.len() - 2;
            (
                digits[..split].parse::<i32>().map_err(|_| invalid())?,
                digits[split..].parse::<i32>().map_err(|_| invalid())?,
            )
        }
        _ => return Err(invalid()),
    };
    if minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
