//! Identifier validation and quoting for dynamically built SQL.
//!
//! Collection and column names come from configuration and end up inside SQL
//! text, where they cannot be bound as parameters. Every name goes through
//! [`quote_pg`] before it is spliced into a statement.

use crate::error::{MigrateError, Result};

/// PostgreSQL truncates identifiers beyond 63 bytes; refuse them instead of
/// letting two names silently collide.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Reject identifiers that are empty, contain NUL, or exceed the length limit.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config("identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "identifier contains a NUL byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "identifier exceeds {} bytes ({} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier, doubling embedded double quotes.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `"schema"."table"` with both parts quoted.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad\0name").is_err());
        assert!(validate_identifier(&"x".repeat(63)).is_ok());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_quote_pg_escapes_double_quote() {
        assert_eq!(quote_pg("orders").unwrap(), "\"orders\"");
        assert_eq!(quote_pg("we\"ird").unwrap(), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_pg_injection_stays_inside_quotes() {
        let quoted = quote_pg("x\"; DROP TABLE users; --").unwrap();
        assert_eq!(quoted, "\"x\"\"; DROP TABLE users; --\"");
    }

    #[test]
    fn test_qualify_pg() {
        assert_eq!(
            qualify_pg("public", "orders").unwrap(),
            "\"public\".\"orders\""
        );
        assert!(qualify_pg("", "orders").is_err());
    }
}
