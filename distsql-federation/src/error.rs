use thiserror::Error;

/// Errors surfaced by the planning stack.
///
/// All of these are fatal for the statement being processed: nothing is
/// retried and no partial plan is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The statement failed to lex, or did not have the shape the
    /// restricted dialect expects.
    #[error("parse error: {0}")]
    Parse(String),

    /// A column reference matched more than one table of the FROM list.
    #[error("column reference `{0}` is ambiguous")]
    AmbiguousColumn(String),

    /// A column reference matched no table of the FROM list.
    #[error("unknown column reference `{0}`")]
    UnknownColumn(String),

    /// A table or alias was referenced that the catalog does not know.
    #[error("unknown table `{0}`")]
    UnknownTable(String),

    /// The statement is well-formed SQL but outside the supported subset.
    #[error("unsupported SQL: {0}")]
    Unsupported(String),

    /// The query tree could not be built or linearized.
    #[error("planning failed: {0}")]
    Plan(String),

    /// A catalog record required during planning is missing.
    #[error("inconsistent catalog: {0}")]
    Catalog(String),
}

impl QueryError {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub(crate) fn plan(message: impl Into<String>) -> Self {
        Self::Plan(message.into())
    }

    pub(crate) fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog(message.into())
    }
}

impl From<sqlparser::parser::ParserError> for QueryError {
    fn from(error: sqlparser::parser::ParserError) -> Self {
        Self::Parse(error.to_string())
    }
}
