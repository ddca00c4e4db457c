//! Canonical timestamp formatting.
//!
//! Every persisted timestamp in this system is a fixed-width wall-clock
//! string, `YYYY-MM-DD HH:MM:SS`, rendered in the configured display zone
//! (Asia/Taipei unless overridden) with no fractional seconds and no zone
//! suffix. This module is the only place that renders or validates them.

use crate::error::TimeError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Unix values at or above this magnitude are interpreted as milliseconds.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

static CANONICAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$").expect("static regex"));

#[derive(Debug, Clone, Copy)]
pub struct TimeService {
    tz: Tz,
}

impl TimeService {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Render a Unix value as a canonical string. Seconds and milliseconds
    /// are auto-detected by magnitude.
    pub fn format_unix(&self, value: i64) -> Result<String, TimeError> {
        if value <= 0 {
            return Err(TimeError::InvalidInput(format!(
                "non-positive unix value {value}"
            )));
        }
        let utc: DateTime<Utc> = if value >= MILLIS_THRESHOLD {
            Utc.timestamp_millis_opt(value)
                .single()
                .ok_or_else(|| TimeError::InvalidInput(format!("unrepresentable millis {value}")))?
        } else {
            Utc.timestamp_opt(value, 0)
                .single()
                .ok_or_else(|| TimeError::InvalidInput(format!("unrepresentable seconds {value}")))?
        };
        Ok(self.format_datetime(utc))
    }

    pub fn format_datetime(&self, dt: DateTime<Utc>) -> String {
        dt.with_timezone(&self.tz).format(CANONICAL_FORMAT).to_string()
    }

    /// Current wall clock in canonical form.
    pub fn now(&self) -> String {
        self.format_datetime(Utc::now())
    }

    /// Accept a numeric string (unix seconds or millis) or an
    /// already-canonical wall-clock string; anything else is rejected.
    pub fn normalize(&self, input: &str) -> Result<String, TimeError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(TimeError::InvalidInput("empty input".to_string()));
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            return self.format_unix(value);
        }
        self.parse_canonical(trimmed)?;
        Ok(trimmed.to_string())
    }

    /// Strict validator: shape via regex, then a real calendar parse so
    /// impossible dates (2023-02-30) are rejected too.
    pub fn parse_canonical(&self, input: &str) -> Result<NaiveDateTime, TimeError> {
        if !CANONICAL_RE.is_match(input) {
            return Err(TimeError::InvalidInput(format!(
                "not canonical form: {input}"
            )));
        }
        NaiveDateTime::parse_from_str(input, CANONICAL_FORMAT)
            .map_err(|e| TimeError::InvalidInput(format!("{input}: {e}")))
    }

    pub fn is_canonical(&self, input: &str) -> bool {
        self.parse_canonical(input).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> TimeService {
        TimeService::new(chrono_tz::Asia::Taipei)
    }

    #[test]
    fn seconds_render_in_taipei() {
        // 2021-07-01 00:00:00 UTC == 2021-07-01 08:00:00 Taipei
        assert_eq!(svc().format_unix(1_625_097_600).unwrap(), "2021-07-01 08:00:00");
    }

    #[test]
    fn millis_are_detected_by_magnitude() {
        assert_eq!(
            svc().format_unix(1_625_097_600_000).unwrap(),
            "2021-07-01 08:00:00"
        );
    }

    #[test]
    fn non_positive_values_are_rejected() {
        assert!(svc().format_unix(0).is_err());
        assert!(svc().format_unix(-5).is_err());
    }

    #[test]
    fn canonical_strings_pass_through_normalize() {
        assert_eq!(
            svc().normalize("2021-07-01 08:00:00").unwrap(),
            "2021-07-01 08:00:00"
        );
    }

    #[test]
    fn numeric_strings_normalize_like_integers() {
        assert_eq!(svc().normalize("1625097600").unwrap(), "2021-07-01 08:00:00");
    }

    #[test]
    fn empty_and_garbage_inputs_fail() {
        assert!(svc().normalize("").is_err());
        assert!(svc().normalize("  ").is_err());
        assert!(svc().normalize("yesterday").is_err());
    }

    #[test]
    fn impossible_calendar_dates_fail() {
        assert!(!svc().is_canonical("2023-02-30 10:00:00"));
        assert!(!svc().is_canonical("2023-13-01 10:00:00"));
        assert!(svc().is_canonical("2024-02-29 10:00:00"));
    }

    #[test]
    fn shape_violations_fail_before_parsing() {
        assert!(!svc().is_canonical("2023-2-01 10:00:00"));
        assert!(!svc().is_canonical("2023-02-01T10:00:00"));
        assert!(!svc().is_canonical("2023-02-01 10:00:00.123"));
    }
}
