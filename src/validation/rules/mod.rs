//! Business-rule building blocks.
//!
//! - Built-in record-type invariants
//! - The invariant expression language
//! - Named rule functions for custom-function rules

pub mod builtin;
pub mod expression;
pub mod functions;

pub use expression::{Expression, ExpressionError};
pub use functions::{RuleFunction, RuleFunctionRegistry};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Parse a date or date-time at any of the usual precisions.
///
/// Accepts `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, local date-times and RFC 3339
/// instants. Partial dates resolve to their earliest instant; local times
/// are taken as UTC.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(local) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&local));
    }
    let date = match text.len() {
        4 => NaiveDate::parse_from_str(&format!("{}-01-01", text), "%Y-%m-%d").ok(),
        7 => NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d").ok(),
        10 => NaiveDate::parse_from_str(text, "%Y-%m-%d").ok(),
        _ => None,
    }?;
    date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_datetime_precisions() {
        assert_eq!(parse_datetime("1980").unwrap().year(), 1980);
        assert_eq!(parse_datetime("1980-06").unwrap().month(), 6);
        assert_eq!(parse_datetime("1980-06-15").unwrap().day(), 15);
        assert!(parse_datetime("2024-01-01T10:00:00Z").is_some());
        assert!(parse_datetime("2024-01-01T10:00:00+02:00").is_some());
        assert!(parse_datetime("2024-01-01T10:00:00").is_some());
        assert!(parse_datetime("yesterday").is_none());
        assert!(parse_datetime("1980-13-01").is_none());
    }
}
