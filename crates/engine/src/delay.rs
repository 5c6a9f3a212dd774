//! Delay duration expressions: `500ms`, `30s`, `10m`, `2h`, `1d`, and
//! sequences of those (`1h30m`, `1d 12h`).

use chrono::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid delay '{expr}': {reason}")]
pub struct DelayError {
    pub expr: String,
    pub reason: String,
}

/// Parse a delay expression into a duration.
pub fn parse_delay(expr: &str) -> Result<Duration, DelayError> {
    let fail = |reason: &str| DelayError {
        expr: expr.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(fail("empty expression"));
    }

    let mut total_ms: i64 = 0;
    let mut rest = trimmed;

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(fail("expected a number"));
        }
        let amount: i64 = rest[..digits]
            .parse()
            .map_err(|_| fail("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "" => return Err(fail("missing unit")),
            _ => return Err(fail("unknown unit")),
        };
        rest = rest[unit_len..].trim_start();

        total_ms = amount
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| fail("duration too large"))?;
    }

    Ok(Duration::milliseconds(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_units() {
        assert_eq!(parse_delay("5s").unwrap(), Duration::seconds(5));
        assert_eq!(parse_delay("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_delay(" 2h ").unwrap(), Duration::hours(2));
        assert_eq!(parse_delay("1d").unwrap(), Duration::days(1));
    }

    #[test]
    fn compound_expressions() {
        assert_eq!(parse_delay("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_delay("1d 12h").unwrap(), Duration::hours(36));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "soon", "5", "5 s", "5y", "-5s", "1h30"] {
            assert!(parse_delay(bad).is_err(), "expected error for {bad:?}");
        }
    }
}
