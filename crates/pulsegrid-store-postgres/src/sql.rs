//! Helpers for building DDL that cannot use bind parameters

use pulsegrid_core::{Error, Result, tenant::is_valid_identifier};
use std::time::Duration;

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a literal, escaping embedded quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Reject identifiers that are not plain lowercase SQL names
pub fn checked_ident(name: &str) -> Result<&str> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(Error::Config(format!("Invalid SQL identifier: {}", name)))
    }
}

/// Render a duration as a PostgreSQL interval literal, e.g. `INTERVAL '3600 seconds'`
pub fn interval(duration: Duration) -> String {
    format!("INTERVAL '{} seconds'", duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("events"), "\"events\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_escapes_quotes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_checked_ident() {
        assert!(checked_ident("activity_events").is_ok());
        assert!(checked_ident("activity_events; drop").is_err());
    }

    #[test]
    fn test_interval_literal() {
        assert_eq!(
            interval(Duration::from_secs(86_400)),
            "INTERVAL '86400 seconds'"
        );
    }
}
