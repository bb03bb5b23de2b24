//! # Predicates
//!
//! WHERE clauses compile to a binary [`Predicate`] tree. Leaves compare an identifier
//! with a literal; logical nodes combine two subtrees with AND or OR.
//!
//! Evaluation runs against a map of variables (e.g. the fields of a JSON event). A
//! variable that is missing, null, or of a type that cannot be compared with the
//! literal makes the leaf false rather than failing the whole evaluation.

use std::cmp::Ordering;
use std::fmt;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::errors::Error;
use super::tokens::{self, Token, TokenType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Operator {
    #[default]
    Unknown,
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    And,
    Or,
    Like,
    ILike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateType {
    Unknown,
    Logical,
    Comparison,
    Search,
}

impl Operator {
    pub fn kind(self) -> PredicateType {
        match self {
            Self::And | Self::Or => PredicateType::Logical,
            Self::Eq | Self::Ne | Self::Gt | Self::Lt | Self::Gte | Self::Lte => {
                PredicateType::Comparison
            }
            Self::Like | Self::ILike => PredicateType::Search,
            Self::Unknown => PredicateType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "?",
            Self::Eq => tokens::EQ,
            Self::Ne => tokens::NE,
            Self::Gt => tokens::GT,
            Self::Lt => tokens::LT,
            Self::Gte => tokens::GTE,
            Self::Lte => tokens::LTE,
            Self::And => tokens::AND,
            Self::Or => tokens::OR,
            Self::Like => tokens::LIKE,
            Self::ILike => tokens::ILIKE,
        }
    }

    fn matches(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Gt => ord == Ordering::Greater,
            Self::Lt => ord == Ordering::Less,
            Self::Gte => ord != Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
            _ => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Logical {
        left: Box<Predicate>,
        operator: Operator,
        right: Box<Predicate>,
    },
    Comparison {
        left: Token,
        operator: Operator,
        right: Token,
    },
    Search {
        left: Token,
        operator: Operator,
        right: Token,
    },
}

impl Predicate {
    pub fn logical(left: Predicate, operator: Operator, right: Predicate) -> Self {
        Self::Logical {
            left: Box::new(left),
            operator,
            right: Box::new(right),
        }
    }

    /// Build a leaf from an `identifier operator literal` triple, choosing the arm
    /// from the operator.
    pub fn leaf(left: Token, operator: Operator, right: Token) -> Result<Self, Error> {
        match operator.kind() {
            PredicateType::Comparison => Ok(Self::Comparison {
                left,
                operator,
                right,
            }),
            PredicateType::Search => Ok(Self::Search {
                left,
                operator,
                right,
            }),
            PredicateType::Logical => Err(Error::InvalidPredicate),
            PredicateType::Unknown => Err(Error::PredicateType),
        }
    }

    pub fn operator(&self) -> Operator {
        match self {
            Self::Logical { operator, .. }
            | Self::Comparison { operator, .. }
            | Self::Search { operator, .. } => *operator,
        }
    }

    /// Check that the tree can be evaluated.
    pub fn validate(&self) -> Result<(), Error> {
        self.check()?;
        if let Self::Logical { left, right, .. } = self {
            left.validate()?;
            right.validate()?;
        }
        Ok(())
    }

    // Shape check of this node only.
    fn check(&self) -> Result<(), Error> {
        let operator = self.operator();
        let expected = match self {
            Self::Logical { .. } => PredicateType::Logical,
            Self::Comparison { .. } => PredicateType::Comparison,
            Self::Search { .. } => PredicateType::Search,
        };

        match operator.kind() {
            PredicateType::Unknown => return Err(Error::PredicateType),
            kind if kind != expected => return Err(Error::InvalidPredicate),
            _ => {}
        }

        match self {
            Self::Logical { .. } => Ok(()),
            Self::Comparison { left, right, .. } => {
                let literal = matches!(
                    right.kind,
                    TokenType::Numeric | TokenType::QuotedString | TokenType::Boolean
                );
                if left.kind == TokenType::Identifier && literal {
                    Ok(())
                } else {
                    Err(Error::InvalidPredicate)
                }
            }
            Self::Search { left, right, .. } => {
                if left.kind == TokenType::Identifier && right.kind == TokenType::QuotedString {
                    Ok(())
                } else {
                    Err(Error::InvalidPredicate)
                }
            }
        }
    }

    /// Evaluate the predicate against the variables. Both sides of a logical node are
    /// always evaluated so that an invalid subtree is reported even when the other
    /// side would decide the result.
    pub fn evaluate(&self, vars: &Map<String, Value>) -> Result<bool, Error> {
        self.check()?;
        match self {
            Self::Logical {
                left,
                operator,
                right,
            } => {
                let lres = left.evaluate(vars)?;
                let rres = right.evaluate(vars)?;
                match operator {
                    Operator::And => Ok(lres && rres),
                    Operator::Or => Ok(lres || rres),
                    _ => Err(Error::InvalidPredicate),
                }
            }
            Self::Comparison {
                left,
                operator,
                right,
            } => compare(lookup(vars, left), *operator, right),
            Self::Search {
                left,
                operator,
                right,
            } => search(lookup(vars, left), *operator, right),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logical {
                left,
                operator,
                right,
            } => write!(f, "({left} {operator} {right})"),
            Self::Comparison {
                left,
                operator,
                right,
            }
            | Self::Search {
                left,
                operator,
                right,
            } => write!(f, "{left} {operator} {right}"),
        }
    }
}

fn lookup<'a>(vars: &'a Map<String, Value>, ident: &Token) -> Option<&'a Value> {
    vars.get(&ident.text).filter(|v| !v.is_null())
}

fn compare(value: Option<&Value>, operator: Operator, literal: &Token) -> Result<bool, Error> {
    let Some(value) = value else {
        return Ok(false);
    };

    let ord = match literal.kind {
        TokenType::Numeric => {
            let rhs = literal.parse_float()?;
            match value_to_f64(value) {
                Some(lhs) => lhs.partial_cmp(&rhs),
                None => None,
            }
        }
        TokenType::QuotedString => match value {
            Value::String(lhs) => Some(lhs.as_str().cmp(literal.unquote().as_str())),
            Value::Number(n) => Some(n.to_string().cmp(&literal.unquote())),
            _ => None,
        },
        TokenType::Boolean => {
            let rhs = literal.parse_bool()?;
            value.as_bool().map(|lhs| lhs.cmp(&rhs))
        }
        _ => return Err(Error::InvalidPredicate),
    };

    Ok(ord.is_some_and(|ord| operator.matches(ord)))
}

fn search(value: Option<&Value>, operator: Operator, pattern: &Token) -> Result<bool, Error> {
    let Some(Value::String(haystack)) = value else {
        return Ok(false);
    };

    let regex = like_pattern(&pattern.unquote(), operator == Operator::ILike)?;
    Ok(regex.is_match(haystack))
}

/// Translate a SQL LIKE pattern into an anchored regular expression: `%` matches any
/// run of characters and `_` matches exactly one.
pub fn like_pattern(pattern: &str, case_insensitive: bool) -> Result<regex::Regex, Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');

    RegexBuilder::new(&expr)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|_| Error::InvalidPredicate)
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(s: &str) -> Token {
        Token::of(s, TokenType::Identifier)
    }

    fn quoted(s: &str) -> Token {
        Token::new(s, TokenType::QuotedString, s.len() + 2)
    }

    fn num(s: &str) -> Token {
        Token::of(s, TokenType::Numeric)
    }

    fn cmp(left: Token, operator: Operator, right: Token) -> Predicate {
        Predicate::Comparison {
            left,
            operator,
            right,
        }
    }

    fn vars(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_validate_predicate() {
        let col = ident("color");
        let red = cmp(col.clone(), Operator::Eq, quoted("red"));
        let blue = cmp(col.clone(), Operator::Eq, quoted("blue"));
        let flt = num("3.14");
        let bol = Token::of("True", TokenType::Boolean);
        let pre = quoted("prefix%");

        let valid = [
            red.clone(),
            cmp(col.clone(), Operator::Gt, num("42")),
            cmp(col.clone(), Operator::Lte, flt.clone()),
            cmp(col.clone(), Operator::Ne, bol),
            Predicate::Search {
                left: col.clone(),
                operator: Operator::Like,
                right: pre.clone(),
            },
            Predicate::Search {
                left: col.clone(),
                operator: Operator::ILike,
                right: pre.clone(),
            },
            Predicate::logical(blue.clone(), Operator::And, red.clone()),
            Predicate::logical(red.clone(), Operator::Or, blue.clone()),
        ];
        for (i, p) in valid.iter().enumerate() {
            assert!(p.validate().is_ok(), "case {i}: {p}");
        }

        let invalid = [
            cmp(flt.clone(), Operator::Gte, num("42")),
            cmp(col.clone(), Operator::Lte, col.clone()),
            Predicate::Search {
                left: flt.clone(),
                operator: Operator::ILike,
                right: pre.clone(),
            },
            Predicate::Search {
                left: col.clone(),
                operator: Operator::Like,
                right: num("42"),
            },
            cmp(col.clone(), Operator::Like, pre.clone()),
            cmp(col.clone(), Operator::And, quoted("red")),
            Predicate::logical(red.clone(), Operator::Eq, blue.clone()),
            Predicate::logical(
                Predicate::logical(blue.clone(), Operator::And, cmp(num("1"), Operator::Eq, flt)),
                Operator::Or,
                red.clone(),
            ),
        ];
        for (i, p) in invalid.iter().enumerate() {
            assert_eq!(p.validate(), Err(Error::InvalidPredicate), "case {i}: {p}");
        }

        let unknown = cmp(col, Operator::Unknown, num("42"));
        assert_eq!(unknown.validate(), Err(Error::PredicateType));
    }

    #[test]
    fn test_nested_predicate() {
        // (color = 'red' OR color = 'blue' AND country = 'fr') AND (age > 18 OR age < 35)
        let pred = Predicate::logical(
            Predicate::logical(
                cmp(ident("color"), Operator::Eq, quoted("red")),
                Operator::Or,
                Predicate::logical(
                    cmp(ident("color"), Operator::Eq, quoted("blue")),
                    Operator::And,
                    cmp(ident("country"), Operator::Eq, quoted("fr")),
                ),
            ),
            Operator::And,
            Predicate::logical(
                cmp(ident("age"), Operator::Gt, num("18")),
                Operator::Or,
                cmp(ident("age"), Operator::Lt, num("35")),
            ),
        );
        assert!(pred.validate().is_ok());

        let fr = vars(json!({"color": "blue", "country": "fr", "age": 40}));
        assert!(pred.evaluate(&fr).unwrap());

        let us = vars(json!({"color": "blue", "country": "us", "age": 40}));
        assert!(!pred.evaluate(&us).unwrap());

        let red = vars(json!({"color": "red", "age": 12}));
        assert!(pred.evaluate(&red).unwrap());
    }

    #[test]
    fn test_compare() {
        let v = vars(json!({
            "age": 42,
            "score": "7.5",
            "name": "ada",
            "active": true,
            "missing": null,
        }));

        let cases = [
            (cmp(ident("age"), Operator::Eq, num("42")), true),
            (cmp(ident("age"), Operator::Gte, num("42.0")), true),
            (cmp(ident("age"), Operator::Lt, num("-1")), false),
            (cmp(ident("score"), Operator::Gt, num("7")), true),
            (cmp(ident("name"), Operator::Eq, quoted("ada")), true),
            (cmp(ident("name"), Operator::Lt, quoted("bob")), true),
            (cmp(ident("name"), Operator::Ne, quoted("ada")), false),
            (cmp(ident("active"), Operator::Eq, Token::of("t", TokenType::Boolean)), true),
            (cmp(ident("active"), Operator::Ne, Token::of("TRUE", TokenType::Boolean)), false),
            // type mismatches, missing and null variables never match
            (cmp(ident("name"), Operator::Ne, num("3")), false),
            (cmp(ident("active"), Operator::Eq, quoted("true")), false),
            (cmp(ident("missing"), Operator::Ne, num("3")), false),
            (cmp(ident("nope"), Operator::Eq, quoted("x")), false),
        ];

        for (i, (p, expected)) in cases.iter().enumerate() {
            assert_eq!(p.evaluate(&v).unwrap(), *expected, "case {i}: {p}");
        }
    }

    #[test]
    fn test_search() {
        let v = vars(json!({"email": "Ada@Example.com", "code": "a_1"}));
        let like = |field: &str, op: Operator, pattern: &str| Predicate::Search {
            left: ident(field),
            operator: op,
            right: quoted(pattern),
        };

        assert!(like("email", Operator::Like, "%@Example.com").evaluate(&v).unwrap());
        assert!(!like("email", Operator::Like, "%@example.com").evaluate(&v).unwrap());
        assert!(like("email", Operator::ILike, "ada@%").evaluate(&v).unwrap());
        assert!(like("code", Operator::Like, "a__").evaluate(&v).unwrap());
        assert!(!like("code", Operator::Like, "a_").evaluate(&v).unwrap());
        assert!(like("code", Operator::Like, "a.1").evaluate(&v).is_ok_and(|m| !m));
        assert!(!like("nope", Operator::Like, "%").evaluate(&v).unwrap());
    }

    #[test]
    fn test_invalid_tree_is_not_evaluable() {
        let v = vars(json!({"a": 1}));
        let bad = Predicate::logical(
            cmp(ident("a"), Operator::Eq, num("1")),
            Operator::Or,
            cmp(num("1"), Operator::Eq, num("1")),
        );
        assert_eq!(bad.validate(), Err(Error::InvalidPredicate));
        assert_eq!(bad.evaluate(&v), Err(Error::InvalidPredicate));

        let good = Predicate::logical(
            cmp(ident("a"), Operator::Eq, num("1")),
            Operator::And,
            cmp(ident("a"), Operator::Ne, num("2")),
        );
        assert!(good.validate().is_ok());
        assert!(good.evaluate(&v).unwrap());
    }

    #[test]
    fn test_leaf() {
        let p = Predicate::leaf(ident("a"), Operator::ILike, quoted("x%")).unwrap();
        assert!(matches!(p, Predicate::Search { .. }));
        assert_eq!(p.to_string(), "a ILIKE 'x%'");
        assert_eq!(
            Predicate::leaf(ident("a"), Operator::Or, num("1")),
            Err(Error::InvalidPredicate)
        );
        assert_eq!(
            Predicate::leaf(ident("a"), Operator::Unknown, num("1")),
            Err(Error::PredicateType)
        );
    }
}
