//! # EnSQL Parser
//!
//! A feed-forward state machine over the scanner's tokens. Each step consumes one
//! token and decides the next step; clauses may only appear in statement order
//! (`SELECT .. FROM .. WHERE ..`) except `OFFSET` and `LIMIT`, which may come in
//! either order but at most once each.
//!
//! Errors are [`SyntaxError`]s carrying the byte offset and text of the offending
//! token. Errors at the end of the input point one past the last byte.
//!
//! [`SyntaxError`]: super::errors::SyntaxError

use std::collections::BTreeMap;
use std::fmt;

use super::conditions::ConditionGroup;
use super::errors::Error;
use super::predicate::{Predicate, PredicateType};
use super::tokens::{self, Scanner, Token, TokenType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryType {
    #[default]
    Unknown,
    Select,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("UNKNOWN"),
            Self::Select => f.write_str(tokens::SELECT),
        }
    }
}

/// The topic a query reads from, optionally narrowed to an event type and version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub topic: String,
    pub schema: String,
    pub version: u32,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic)?;
        if !self.schema.is_empty() {
            write!(f, ".{}", self.schema)?;
        }
        if self.version > 0 {
            write!(f, ".{}", self.version)?;
        }
        Ok(())
    }
}

/// A parsed EnSQL statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub query_type: QueryType,
    pub topic: Topic,
    pub fields: Vec<Token>,
    /// Field name to output name.
    pub aliases: BTreeMap<String, String>,
    pub conditions: Option<ConditionGroup>,
    pub predicate: Option<Predicate>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub raw: String,
}

impl Query {
    pub fn select_all(&self) -> bool {
        self.fields.iter().any(|f| f.kind == TokenType::Asterisk)
    }

    pub fn has_offset(&self) -> bool {
        self.offset.is_some()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// Output name of a projected field.
    pub fn alias<'a>(&'a self, field: &'a str) -> &'a str {
        self.aliases.get(field).map(String::as_str).unwrap_or(field)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.raw.is_empty() {
            return Err(Error::EmptyQuery);
        }

        if self.topic.topic.is_empty() {
            return Err(Error::MissingTopic);
        }

        if self.fields.is_empty() {
            return Err(Error::NoFieldsSelected);
        }

        let aliased = self.aliases.contains_key(tokens::ASTERISK);
        if self.select_all() && (self.fields.len() > 1 || aliased) {
            return Err(Error::InvalidSelectAllFields);
        }

        if let Some(predicate) = &self.predicate {
            predicate.validate()?;
        }
        Ok(())
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.query_type)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}")?;
            if let Some(alias) = self.aliases.get(&field.text) {
                write!(f, " {} {alias}", tokens::AS)?;
            }
        }
        write!(f, " {} {}", tokens::FROM, self.topic)?;

        if let Some(conditions) = self.conditions.as_ref().filter(|c| !c.is_empty()) {
            write!(f, " {} {conditions}", tokens::WHERE)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " {} {offset}", tokens::OFFSET)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " {} {limit}", tokens::LIMIT)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    Select,
    SelectField,
    SelectFieldAlias,
    SelectFrom,
    SelectFromSchema,
    SelectFromVersion,
    Where,
    WhereField,
    WhereOperator,
    WhereValue,
    WhereLogical,
    WhereCloseParens,
    Offset,
    OffsetValue,
    Limit,
    LimitValue,
    Term,
}

/// Parse an EnSQL statement. Surrounding whitespace is ignored and positions in
/// errors are relative to the trimmed statement.
pub fn parse(sql: &str) -> Result<Query, Error> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(Error::EmptyQuery);
    }

    let mut parser = Parser {
        tokens: Scanner::new(sql).collect(),
        idx: 0,
        step: Step::Init,
        end: sql.len(),
        query: Query {
            raw: sql.to_string(),
            ..Default::default()
        },
    };

    parser.exec()?;
    parser.query.validate()?;
    Ok(parser.query)
}

// The parser is not reusable; parse allocates one per statement.
struct Parser {
    tokens: Vec<(usize, Token)>,
    idx: usize,
    step: Step,
    end: usize,
    query: Query,
}

impl Parser {
    fn exec(&mut self) -> Result<(), Error> {
        while self.idx < self.tokens.len() {
            let (pos, token) = self.tokens[self.idx].clone();
            self.step = self.next(pos, &token)?;
            self.idx += 1;
        }
        self.finish()
    }

    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.idx + 1)
    }

    fn next(&mut self, pos: usize, token: &Token) -> Result<Step, Error> {
        let err = |message: &str| Error::at(pos, token.to_string(), message);

        match self.step {
            Step::Init => {
                if token.kind == TokenType::Reserved && token.text == tokens::SELECT {
                    self.query.query_type = QueryType::Select;
                    Ok(Step::Select)
                } else {
                    Err(err("invalid query type"))
                }
            }

            Step::Select => match token.kind {
                TokenType::Asterisk | TokenType::Identifier => {
                    let select_all = token.kind == TokenType::Asterisk;
                    if !self.query.fields.is_empty() && (select_all || self.query.select_all()) {
                        return Err(err("invalid select all fields"));
                    }
                    self.query.fields.push(token.clone());
                    Ok(Step::SelectField)
                }
                TokenType::Numeric | TokenType::QuotedString | TokenType::Boolean => {
                    Err(err("invalid field identifier"))
                }
                _ if token.is(tokens::FROM) && self.query.fields.is_empty() => {
                    Err(err(&Error::NoFieldsSelected.to_string()))
                }
                _ => Err(err("invalid select fields statement")),
            },

            Step::SelectField => {
                if token.is(tokens::COMMA) {
                    Ok(Step::Select)
                } else if token.is(tokens::AS) {
                    let last = self
                        .query
                        .fields
                        .last()
                        .map(|f| f.text.as_str())
                        .unwrap_or_default();
                    if last == tokens::ASTERISK {
                        return Err(err("cannot alias select all fields"));
                    }
                    if self.query.aliases.contains_key(last) {
                        return Err(err("invalid select fields statement"));
                    }
                    Ok(Step::SelectFieldAlias)
                } else if token.is(tokens::FROM) {
                    Ok(Step::SelectFrom)
                } else {
                    Err(err("invalid select fields statement"))
                }
            }

            Step::SelectFieldAlias => {
                if token.kind != TokenType::Identifier {
                    return Err(err("invalid alias identifier"));
                }
                if let Some(field) = self.query.fields.last() {
                    self.query
                        .aliases
                        .insert(field.text.clone(), token.text.clone());
                }
                Ok(Step::SelectField)
            }

            Step::SelectFrom => {
                if token.kind != TokenType::Identifier {
                    return Err(err("invalid topic identifier"));
                }
                self.query.topic.topic = token.text.clone();
                Ok(Step::SelectFromSchema)
            }

            Step::SelectFromSchema | Step::SelectFromVersion if token.is(tokens::DOT) => {
                let Some((_, qualifier)) = self.peek().cloned() else {
                    return Err(err("invalid from clause"));
                };

                match qualifier.kind {
                    TokenType::Identifier if self.step == Step::SelectFromSchema => {
                        self.query.topic.schema = qualifier.text;
                        self.idx += 1;
                        Ok(Step::SelectFromVersion)
                    }
                    TokenType::Numeric => {
                        self.query.topic.version = qualifier
                            .parse_uint()
                            .ok()
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| err("invalid topic version"))?;
                        self.idx += 1;
                        Ok(Step::Where)
                    }
                    _ => Err(err("invalid from clause")),
                }
            }

            Step::SelectFromSchema | Step::SelectFromVersion | Step::Where => {
                if token.is(tokens::WHERE) {
                    self.query.conditions = Some(ConditionGroup::new());
                    Ok(Step::WhereField)
                } else {
                    self.clause(token).ok_or_else(|| err("invalid from clause"))
                }
            }

            Step::WhereField => {
                let conditions = self.conditions();
                let result = if token.is(tokens::LP) {
                    conditions.open_parens().map(|_| Step::WhereField)
                } else if token.kind == TokenType::Identifier {
                    conditions
                        .condition_left(token.clone())
                        .map(|_| Step::WhereOperator)
                } else {
                    return Err(err("invalid where clause field"));
                };
                result.map_err(|e| err(&e.to_string()))
            }

            Step::WhereOperator => {
                let op = token
                    .operator()
                    .map_err(|_| err("invalid where clause operator"))?;
                if !matches!(op.kind(), PredicateType::Comparison | PredicateType::Search) {
                    return Err(err("invalid where clause operator"));
                }
                self.conditions()
                    .condition_operator(token.clone())
                    .map_err(|e| err(&e.to_string()))?;
                Ok(Step::WhereValue)
            }

            Step::WhereValue => {
                if !matches!(
                    token.kind,
                    TokenType::Numeric | TokenType::QuotedString | TokenType::Boolean
                ) {
                    return Err(err("invalid where clause value"));
                }
                self.conditions()
                    .condition_right(token.clone())
                    .map_err(|e| err(&e.to_string()))?;
                Ok(Step::WhereLogical)
            }

            Step::WhereLogical | Step::WhereCloseParens => {
                if token.is(tokens::RP) {
                    self.conditions()
                        .close_parens()
                        .map_err(|e| err(&e.to_string()))?;
                    return Ok(Step::WhereCloseParens);
                }

                if let Ok(op) = token.operator() {
                    if op.kind() != PredicateType::Logical {
                        return Err(err("invalid where clause operator"));
                    }
                    self.conditions()
                        .logical_operator(op)
                        .map_err(|e| err(&e.to_string()))?;
                    return Ok(Step::WhereField);
                }

                let next = self.clause(token).ok_or_else(|| err("invalid where clause"))?;
                self.compile_where().map_err(|e| err(&e.to_string()))?;
                Ok(next)
            }

            Step::OffsetValue => {
                if self.query.offset.is_some() {
                    return Err(err("offset has already been set"));
                }
                if token.kind != TokenType::Numeric {
                    return Err(err("invalid offset"));
                }
                let offset = token.parse_uint().map_err(|_| err("could not parse offset"))?;
                self.query.offset = Some(offset);
                Ok(Step::Offset)
            }

            Step::LimitValue => {
                if self.query.limit.is_some() {
                    return Err(err("limit has already been set"));
                }
                if token.kind != TokenType::Numeric {
                    return Err(err("invalid limit"));
                }
                let limit = token.parse_uint().map_err(|_| err("could not parse limit"))?;
                self.query.limit = Some(limit);
                Ok(Step::Limit)
            }

            Step::Offset => self.clause(token).ok_or_else(|| err("invalid offset clause")),
            Step::Limit => self.clause(token).ok_or_else(|| err("invalid limit clause")),
            Step::Term => Err(err("unexpected token after end of statement")),
        }
    }

    // Clauses that may follow a complete FROM, WHERE, OFFSET or LIMIT clause.
    fn clause(&self, token: &Token) -> Option<Step> {
        if token.is(tokens::OFFSET) {
            Some(Step::OffsetValue)
        } else if token.is(tokens::LIMIT) {
            Some(Step::LimitValue)
        } else if token.is(tokens::SC) {
            Some(Step::Term)
        } else {
            None
        }
    }

    fn conditions(&mut self) -> &mut ConditionGroup {
        self.query
            .conditions
            .get_or_insert_with(ConditionGroup::new)
    }

    fn compile_where(&mut self) -> Result<(), Error> {
        let conditions = self.conditions();
        if !conditions.is_complete() {
            return Err(Error::CloseParens);
        }
        let predicate = conditions.predicate()?;
        predicate.validate()?;
        self.query.predicate = Some(predicate);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let end = self.end;
        let err = move |message: &str| Error::at(end, "", message);
        match self.step {
            Step::Init => Err(Error::EmptyQuery),
            Step::Select => Err(err(&Error::NoFieldsSelected.to_string())),
            Step::SelectFieldAlias => Err(err("missing alias identifier")),
            Step::WhereField | Step::WhereOperator | Step::WhereValue => {
                Err(err("incomplete where clause"))
            }
            Step::WhereLogical | Step::WhereCloseParens => {
                self.compile_where()
                    .map_err(|e| Error::at(end, "", e.to_string()))
            }
            Step::OffsetValue => Err(err("missing offset value")),
            Step::LimitValue => Err(err("missing limit value")),
            Step::SelectField
            | Step::SelectFrom
            | Step::SelectFromSchema
            | Step::SelectFromVersion
            | Step::Where
            | Step::Offset
            | Step::Limit
            | Step::Term => Ok(()),
        }
    }
}
