//! MySQL identifier validation and quoting.
//!
//! Table, column and database names embedded in generated SQL go through
//! these helpers. Valid identifiers are 1..=64 characters, start with a
//! letter or underscore, and continue with letters, digits, underscores or
//! dollar signs. Generated DDL/DML always backtick-quotes identifiers.

/// Maximum identifier length accepted by MySQL.
pub const MAX_IDENT_LEN: usize = 64;

/// Check whether `name` is a valid unquoted MySQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_IDENT_LEN {
        return false;
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Quote an identifier with backticks.
///
/// Embedded backticks are doubled, which is how MySQL escapes them inside a
/// quoted identifier. Callers validate names with [`is_valid_identifier`]
/// before building SQL; quoting is still applied unconditionally.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a `database.table` pair.
pub fn quote_qualified(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("t1"));
        assert!(is_valid_identifier("order$archive"));
        assert!(is_valid_identifier("a".repeat(64).as_str()));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1users"));
        assert!(!is_valid_identifier("$money"));
        assert!(!is_valid_identifier("user name"));
        assert!(!is_valid_identifier("users;drop"));
        assert!(!is_valid_identifier("a".repeat(65).as_str()));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "`users`");
        assert_eq!(quote_ident("wei`rd"), "`wei``rd`");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("appdb", "users"), "`appdb`.`users`");
    }
}
