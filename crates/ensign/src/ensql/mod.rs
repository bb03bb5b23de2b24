//! # EnSQL
//!
//! A small SQL dialect for reading finite slices of a topic:
//!
//! ```text
//! SELECT name AS who, age FROM people.Person.1 WHERE age > 21 AND name ILIKE 'a%' OFFSET 10 LIMIT 5;
//! ```
//!
//! [`parse`] turns a statement into a [`Query`] plan via the token [`Scanner`], the
//! condition group builder and the [`Predicate`] tree; [`executor::execute`] runs a
//! plan over the committed events of the topic.

pub mod conditions;
pub mod errors;
pub mod executor;
pub mod parser;
pub mod predicate;
pub mod tokens;

pub use conditions::{Condition, ConditionGroup};
pub use errors::{Error, SyntaxError};
pub use parser::{parse, Query, QueryType, Topic};
pub use predicate::{Operator, Predicate, PredicateType};
pub use tokens::{tokenize, Scanner, Token, TokenType};
