// ABOUTME: Utility functions for SQL quoting and log-safe connection strings
// ABOUTME: Shared by the database adapters, the event log and the CLI

/// Quote a SQL identifier (table or column name)
///
/// Escapes embedded quotes and wraps the identifier in double quotes. Both
/// SQLite and PostgreSQL accept this form.
///
/// # Examples
///
/// ```
/// use database_reconciler::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a SQL string literal (for use in SQL statements)
///
/// Escapes single quotes by doubling them and wraps the string in single quotes.
/// Use this for string values in SQL, not for identifiers.
///
/// # Examples
///
/// ```
/// use database_reconciler::utils::quote_literal;
/// assert_eq!(quote_literal("hello"), "'hello'");
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// assert_eq!(quote_literal(""), "''");
/// ```
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Join quoted identifiers with ", "
pub fn quote_ident_list(identifiers: &[String]) -> String {
    identifiers
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Sanitize a database URL by masking the password component
///
/// Connection strings are logged at startup; this keeps credentials out of logs.
pub fn sanitize_url(url: &str) -> String {
    // Try to parse as URL and mask password
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        // If not a valid URL, return as-is (might be a file path for SQLite)
        url.to_string()
    }
}

/// Truncate a string to at most `max_chars` characters.
///
/// Returns the kept prefix and the remainder (empty if nothing was cut).
pub fn split_at_chars(value: &str, max_chars: usize) -> (&str, &str) {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, ""),
    }
}
