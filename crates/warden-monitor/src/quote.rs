//! Quoting for the few statements that cannot take bind parameters.
//!
//! `ALTER ROLE` is a utility statement: the role name and password must be
//! spliced into the SQL text. These follow PostgreSQL's own `quote_ident`
//! and `quote_literal`.

use crate::error::{MonitorError, MonitorResult};

/// Double-quoted identifier with embedded quotes doubled.
pub fn quote_ident(ident: &str) -> MonitorResult<String> {
    reject_nul(ident)?;
    if ident.is_empty() {
        return Err(MonitorError::InvalidRequest("role name is empty".to_string()));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

/// Single-quoted literal. Values containing a backslash use the `E''` form
/// so the result is correct whatever `standard_conforming_strings` says.
pub fn quote_literal(value: &str) -> MonitorResult<String> {
    reject_nul(value)?;
    let quoted = value.replace('\'', "''");
    if value.contains('\\') {
        Ok(format!("E'{}'", quoted.replace('\\', "\\\\")))
    } else {
        Ok(format!("'{quoted}'"))
    }
}

fn reject_nul(value: &str) -> MonitorResult<()> {
    if value.contains('\0') {
        return Err(MonitorError::InvalidRequest(
            "value contains a NUL byte".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idents() {
        assert_eq!(quote_ident("app").unwrap(), "\"app\"");
        assert_eq!(quote_ident("Mixed Case").unwrap(), "\"Mixed Case\"");
        assert_eq!(quote_ident("evil\"; DROP").unwrap(), "\"evil\"\"; DROP\"");
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn literals() {
        assert_eq!(quote_literal("secret").unwrap(), "'secret'");
        assert_eq!(quote_literal("it's").unwrap(), "'it''s'");
        assert_eq!(quote_literal(r"back\slash").unwrap(), r"E'back\\slash'");
        assert_eq!(quote_literal(r"a\'b").unwrap(), r"E'a\\''b'");
    }

    #[test]
    fn nul_is_rejected() {
        assert!(matches!(
            quote_literal("a\0b"),
            Err(MonitorError::InvalidRequest(_))
        ));
        assert!(quote_ident("a\0b").is_err());
    }
}
