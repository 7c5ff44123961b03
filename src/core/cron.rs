//! Cron expression handling for recurring queue triggers.
//!
//! Operators write the common 5-field form (`*/5 * * * *`); the `cron` crate
//! wants a leading seconds field, so one is prepended. 6 and 7 field
//! expressions pass through untouched.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),
}

/// Normalize a cron expression to the seconds-first form
pub fn normalize_expression(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, CronError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(name.to_string()))
}

/// A parsed cron expression bound to a timezone
#[derive(Debug, Clone)]
pub struct CronTrigger {
    schedule: Schedule,
    timezone: Tz,
}

impl CronTrigger {
    pub fn parse(expr: &str, timezone: &str) -> Result<Self, CronError> {
        let normalized = normalize_expression(expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            schedule,
            timezone: parse_timezone(timezone)?,
        })
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Whether a slot fell between the last firing (or registration) and `now`.
    ///
    /// Missed slots collapse into one firing.
    pub fn is_due(
        &self,
        last_fired: Option<DateTime<Utc>>,
        registered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let reference = last_fired.unwrap_or(registered_at);
        match self.next_after(reference) {
            Some(next) => next <= now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_five_field_expressions_get_seconds() {
        assert_eq!(normalize_expression("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_expression(" 0 */5 * * * * "), "0 */5 * * * *");
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            CronTrigger::parse("every five minutes", "UTC"),
            Err(CronError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CronTrigger::parse("*/5 * * * *", "Mars/Olympus"),
            Err(CronError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_next_after() {
        let trigger = CronTrigger::parse("*/15 * * * *", "UTC").unwrap();
        assert_eq!(
            trigger.next_after(at("2024-05-10T10:07:00Z")),
            Some(at("2024-05-10T10:15:00Z"))
        );
        assert_eq!(
            trigger.next_after(at("2024-05-10T10:15:00Z")),
            Some(at("2024-05-10T10:30:00Z"))
        );
    }

    #[test]
    fn test_next_after_respects_timezone() {
        // Daily at 06:00 in New York (EDT, UTC-4 in May)
        let trigger = CronTrigger::parse("0 6 * * *", "America/New_York").unwrap();
        assert_eq!(
            trigger.next_after(at("2024-05-10T00:00:00Z")),
            Some(at("2024-05-10T10:00:00Z"))
        );
    }

    #[test]
    fn test_is_due() {
        let trigger = CronTrigger::parse("*/5 * * * *", "UTC").unwrap();
        let registered = at("2024-05-10T10:01:00Z");

        assert!(!trigger.is_due(None, registered, at("2024-05-10T10:04:59Z")));
        assert!(trigger.is_due(None, registered, at("2024-05-10T10:05:00Z")));

        let fired = at("2024-05-10T10:05:10Z");
        assert!(!trigger.is_due(Some(fired), registered, at("2024-05-10T10:09:00Z")));
        assert!(trigger.is_due(Some(fired), registered, at("2024-05-10T11:00:00Z")));
    }
}
