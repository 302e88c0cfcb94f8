//! The SQL front-end: a restricted SELECT/UPDATE dialect lowered into
//! the internal query form, with every column reference resolved to
//! `table.column` against the system catalog.

pub mod condition;
pub mod parser;

pub use condition::Comparison;
pub use condition::ComparisonOp;
pub use condition::Condition;
pub use parser::SelectQuery;
pub use parser::Statement;
pub use parser::UpdateStatement;

/// Split a `func(inner)` aggregate reference into its function name and
/// inner reference.
pub fn aggregate_parts(reference: &str) -> Option<(&str, &str)> {
    let (func, rest) = reference.split_once('(')?;
    if !is_identifier(func) {
        return None;
    }
    rest.strip_suffix(')').map(|inner| (func, inner))
}

/// Strip a single `func(...)` aggregate wrapper, returning the inner
/// reference. Plain references are returned unchanged.
pub fn strip_aggregate(reference: &str) -> &str {
    match aggregate_parts(reference) {
        Some((_, inner)) => inner,
        None => reference,
    }
}

/// Render a resolved reference with quoted identifier parts so reserved
/// words (`group`, `user`) survive re-parsing. Literals pass through.
pub fn quote_reference(reference: &str) -> String {
    if let Some((func, inner)) = aggregate_parts(reference) {
        if let Some((table, column)) = column_parts(inner) {
            return format!("{func}(\"{table}\".\"{column}\")");
        }
        return reference.to_string();
    }
    match column_parts(reference) {
        Some((table, column)) => format!("\"{table}\".\"{column}\""),
        None => reference.to_string(),
    }
}

/// Split a resolved `table.column` reference (possibly wrapped in an
/// aggregate) into its parts. Literals and malformed references yield
/// `None`.
pub fn column_parts(reference: &str) -> Option<(&str, &str)> {
    let (table, column) = strip_aggregate(reference).split_once('.')?;
    (is_identifier(table) && is_identifier(column)).then_some((table, column))
}

/// Parse an integer literal operand of a comparison.
pub fn integer_literal(operand: &str) -> Option<i64> {
    operand.parse().ok()
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_parts_splits_references() {
        assert_eq!(column_parts("user.name"), Some(("user", "name")));
        assert_eq!(column_parts("avg(user.last_seen)"), Some(("user", "last_seen")));
        assert_eq!(column_parts("'a.quoted.string'"), None);
        assert_eq!(column_parts("42"), None);
        assert_eq!(column_parts("name"), None);
    }

    #[test]
    fn aggregates_unwrap() {
        assert_eq!(strip_aggregate("avg(user.last_seen)"), "user.last_seen");
        assert_eq!(strip_aggregate("user.name"), "user.name");
        assert_eq!(strip_aggregate("count(id"), "count(id");
    }
}
