//! # EnSQL Tokens
//!
//! The scanner splits a raw EnSQL statement into typed [`Token`]s. Tokenization is
//! total: every byte of the input ends up in some token (or is whitespace), so the
//! scanner never fails and leaves error reporting to the parser.
//!
//! | Kind           | Matches                                             |
//! |----------------|-----------------------------------------------------|
//! | `Reserved`     | `SELECT FROM WHERE AS OFFSET LIMIT` (any case)      |
//! | `Operator`     | `= != > < >= <= AND OR LIKE ILIKE`                  |
//! | `Punctuation`  | `, . ( ) ;`                                         |
//! | `Asterisk`     | `*`                                                 |
//! | `QuotedString` | `'...'` with `\'` escapes                           |
//! | `Numeric`      | `-?[0-9]+(\.[0-9]+)?`                               |
//! | `Boolean`      | `t T true True TRUE f F false False FALSE`          |
//! | `Identifier`   | `[A-Za-z_][A-Za-z0-9_]*`                            |

use std::collections::VecDeque;
use std::fmt;

use super::errors::Error;
use super::predicate::Operator;

pub const SELECT: &str = "SELECT";
pub const FROM: &str = "FROM";
pub const WHERE: &str = "WHERE";
pub const AS: &str = "AS";
pub const OFFSET: &str = "OFFSET";
pub const LIMIT: &str = "LIMIT";

pub const EQ: &str = "=";
pub const NE: &str = "!=";
pub const GT: &str = ">";
pub const LT: &str = "<";
pub const GTE: &str = ">=";
pub const LTE: &str = "<=";
pub const AND: &str = "AND";
pub const OR: &str = "OR";
pub const LIKE: &str = "LIKE";
pub const ILIKE: &str = "ILIKE";

pub const ASTERISK: &str = "*";
pub const COMMA: &str = ",";
pub const DOT: &str = ".";
pub const LP: &str = "(";
pub const RP: &str = ")";
pub const SC: &str = ";";

pub const RESERVED_WORDS: [&str; 6] = [SELECT, FROM, WHERE, AS, OFFSET, LIMIT];

// Keywords that may run together without whitespace, longest first so that the
// segmentation prefers ILIKE over a shorter prefix.
const KEYWORDS: [&str; 10] = [
    SELECT, OFFSET, ILIKE, WHERE, LIMIT, FROM, LIKE, AND, AS, OR,
];

// Two character operators must be matched before their one character prefixes.
const SYMBOL_OPERATORS: [&str; 6] = [NE, GTE, LTE, EQ, GT, LT];

const TRUE_SPELLINGS: [&str; 5] = ["t", "T", "true", "True", "TRUE"];
const FALSE_SPELLINGS: [&str; 5] = ["f", "F", "false", "False", "FALSE"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TokenType {
    #[default]
    Empty,
    Unknown,
    Reserved,
    Operator,
    Punctuation,
    Asterisk,
    Identifier,
    QuotedString,
    Numeric,
    Boolean,
}

/// A lexeme of an EnSQL statement.
///
/// Reserved words and keyword operators are upper-cased. Quoted strings store the
/// text between the quotes (escapes are kept as written) while `length` counts the
/// quotes, so `length` is always the number of bytes the token spans in the input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Token {
    pub text: String,
    pub kind: TokenType,
    pub length: usize,
}

impl Token {
    pub const EMPTY: Token = Token {
        text: String::new(),
        kind: TokenType::Empty,
        length: 0,
    };

    pub fn new(text: impl Into<String>, kind: TokenType, length: usize) -> Self {
        Self {
            text: text.into(),
            kind,
            length,
        }
    }

    /// Create a token whose length is the length of its text.
    pub fn of(text: impl Into<String>, kind: TokenType) -> Self {
        let text = text.into();
        let length = text.len();
        Self { text, kind, length }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == TokenType::Empty
    }

    /// True if the token is the given reserved word or punctuation mark.
    pub fn is(&self, text: &str) -> bool {
        matches!(
            self.kind,
            TokenType::Reserved | TokenType::Punctuation | TokenType::Operator
        ) && self.text == text
    }

    pub fn parse_int(&self) -> Result<i64, Error> {
        if self.kind != TokenType::Numeric {
            return Err(Error::NonNumeric);
        }
        Ok(self.text.parse::<i64>()?)
    }

    pub fn parse_uint(&self) -> Result<u64, Error> {
        if self.kind != TokenType::Numeric {
            return Err(Error::NonNumeric);
        }
        Ok(self.text.parse::<u64>()?)
    }

    pub fn parse_float(&self) -> Result<f64, Error> {
        if self.kind != TokenType::Numeric {
            return Err(Error::NonNumeric);
        }
        Ok(self.text.parse::<f64>()?)
    }

    /// Parse a boolean token; `1` and `0` are accepted alongside the boolean spellings.
    pub fn parse_bool(&self) -> Result<bool, Error> {
        if self.kind != TokenType::Boolean {
            return Err(Error::NonBoolean);
        }

        let text = self.text.as_str();
        if text == "1" || TRUE_SPELLINGS.contains(&text) {
            Ok(true)
        } else if text == "0" || FALSE_SPELLINGS.contains(&text) {
            Ok(false)
        } else {
            Err(Error::ParseBool(self.text.clone()))
        }
    }

    pub fn operator(&self) -> Result<Operator, Error> {
        if self.kind != TokenType::Operator {
            return Err(Error::NotAnOperator);
        }

        match self.text.as_str() {
            EQ => Ok(Operator::Eq),
            NE => Ok(Operator::Ne),
            GT => Ok(Operator::Gt),
            LT => Ok(Operator::Lt),
            GTE => Ok(Operator::Gte),
            LTE => Ok(Operator::Lte),
            AND => Ok(Operator::And),
            OR => Ok(Operator::Or),
            LIKE => Ok(Operator::Like),
            ILIKE => Ok(Operator::ILike),
            _ => Err(Error::UnknownOperator),
        }
    }

    /// The text of a quoted string with its `\'` escapes resolved.
    pub fn unquote(&self) -> String {
        self.text.replace("\\'", "'")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenType::QuotedString => write!(f, "'{}'", self.text),
            _ => f.write_str(&self.text),
        }
    }
}

/// Split an EnSQL statement into tokens.
pub fn tokenize(sql: &str) -> Vec<Token> {
    Scanner::new(sql).map(|(_, token)| token).collect()
}

/// Iterator over the tokens of a statement along with the byte offset each starts at.
#[derive(Debug)]
pub struct Scanner<'a> {
    sql: &'a str,
    pos: usize,
    pending: VecDeque<(usize, Token)>,
}

impl<'a> Scanner<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            pos: 0,
            pending: VecDeque::new(),
        }
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.sql[self.pos..];
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    fn scan(&mut self) -> Option<(usize, Token)> {
        self.skip_whitespace();
        let start = self.pos;
        let rest = &self.sql[start..];
        let first = rest.chars().next()?;

        let token = match first {
            '\'' => quoted(rest),
            '*' => Token::of(ASTERISK, TokenType::Asterisk),
            ',' | '.' | '(' | ')' | ';' => Token::of(first.to_string(), TokenType::Punctuation),
            '-' | '0'..='9' if numeric_len(rest) > 0 => {
                Token::of(&rest[..numeric_len(rest)], TokenType::Numeric)
            }
            'A'..='Z' | 'a'..='z' | '_' => {
                let run = &rest[..word_len(rest)];
                self.pos = start + run.len();

                let mut words = word(run).into_iter();
                let head = words.next()?;
                let mut offset = start + head.length;
                for token in words {
                    let length = token.length;
                    self.pending.push_back((offset, token));
                    offset += length;
                }
                return Some((start, head));
            }
            _ => match SYMBOL_OPERATORS.iter().find(|op| rest.starts_with(**op)) {
                Some(op) => Token::of(*op, TokenType::Operator),
                None => Token::of(first.to_string(), TokenType::Unknown),
            },
        };

        self.pos = start + token.length;
        Some((start, token))
    }
}

impl Iterator for Scanner<'_> {
    type Item = (usize, Token);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(pending) = self.pending.pop_front() {
            return Some(pending);
        }
        self.scan()
    }
}

// A quoted string starting at the beginning of rest. An unterminated quote consumes
// the remainder of the input, quote included, as an empty token.
fn quoted(rest: &str) -> Token {
    let bytes = rest.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => i += 2,
            b'\'' => return Token::new(&rest[1..i], TokenType::QuotedString, i + 1),
            _ => i += 1,
        }
    }
    Token::new(rest, TokenType::Empty, rest.len())
}

// Length of the numeric literal at the start of rest, zero if there is none.
fn numeric_len(rest: &str) -> usize {
    let bytes = rest.as_bytes();
    let mut i = usize::from(bytes.first() == Some(&b'-'));

    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let whole = digits(i);
    if whole == 0 {
        return 0;
    }
    i += whole;

    if bytes.get(i) == Some(&b'.') {
        let fraction = digits(i + 1);
        if fraction > 0 {
            i += 1 + fraction;
        }
    }
    i
}

fn word_len(rest: &str) -> usize {
    rest.bytes()
        .position(|b| !(b.is_ascii_alphanumeric() || b == b'_'))
        .unwrap_or(rest.len())
}

// Classify an identifier-shaped run of characters. Upper case runs made up entirely
// of keywords (e.g. SELECTFROM) are split into those keywords.
fn word(run: &str) -> Vec<Token> {
    if let Some(token) = keyword(run) {
        return vec![token];
    }

    if TRUE_SPELLINGS.contains(&run) || FALSE_SPELLINGS.contains(&run) {
        return vec![Token::of(run, TokenType::Boolean)];
    }

    if run.bytes().all(|b| b.is_ascii_uppercase()) {
        if let Some(parts) = segment(run) {
            return parts.into_iter().filter_map(keyword).collect();
        }
    }

    vec![Token::of(run, TokenType::Identifier)]
}

fn keyword(word: &str) -> Option<Token> {
    let upper = word.to_ascii_uppercase();
    let kind = match upper.as_str() {
        SELECT | FROM | WHERE | AS | OFFSET | LIMIT => TokenType::Reserved,
        AND | OR | LIKE | ILIKE => TokenType::Operator,
        _ => return None,
    };
    Some(Token::new(upper, kind, word.len()))
}

fn segment(run: &str) -> Option<Vec<&str>> {
    if run.is_empty() {
        return Some(Vec::new());
    }

    KEYWORDS.iter().find_map(|kw| {
        let rest = run.strip_prefix(kw)?;
        let mut parts = segment(rest)?;
        parts.insert(0, &run[..kw.len()]);
        Some(parts)
    })
}
