use std::fmt;
use std::num::{ParseFloatError, ParseIntError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("empty query is invalid")]
    EmptyQuery,
    #[error("topic name cannot be empty")]
    MissingTopic,
    #[error("unhandled parsing step")]
    UnhandledStep,
    #[error("SELECT requires field projection or *")]
    NoFieldsSelected,
    #[error("cannot select * and specify fields")]
    InvalidSelectAllFields,
    #[error("cannot parse non-numeric token as a number")]
    NonNumeric,
    #[error("cannot parse non-boolean token as a bool")]
    NonBoolean,
    #[error("token is not an operator")]
    NotAnOperator,
    #[error("unknown operator")]
    UnknownOperator,
    #[error("unknown or unhandled operator in predicate")]
    PredicateType,
    #[error("could not parse or evaluate predicate")]
    InvalidPredicate,
    #[error("cannot open parenthesis in condition group")]
    OpenParens,
    #[error("cannot close parenthesis in condition group")]
    CloseParens,
    #[error("cannot append operator to condition group")]
    AppendOperator,
    #[error("cannot append or update condition in group")]
    AppendCondition,
    #[error("invalid integer: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("invalid float: {0}")]
    ParseFloat(#[from] ParseFloatError),
    #[error("invalid boolean {0:?}")]
    ParseBool(String),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
}

impl Error {
    /// Wrap a parser error with the position and text of the token that caused it.
    pub fn at(position: usize, near: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Syntax(SyntaxError::new(position, near, message))
    }
}

/// A parse error at a byte offset of the raw query, safe to return to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub position: usize,
    pub near: String,
    pub message: String,
}

impl SyntaxError {
    pub fn new(position: usize, near: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            position,
            near: near.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error at position {} near {:?}", self.position, self.near)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyntaxError {}
