//! Incremental builder for WHERE clauses.
//!
//! The parser feeds the builder one token at a time. Groups live in an arena and
//! refer to their parent by index; `current` is the group that the next token is
//! appended to, so opening a parenthesis descends into a new group and closing it
//! ascends to the parent.

use std::fmt;

use super::errors::Error;
use super::predicate::{Operator, Predicate, PredicateType};
use super::tokens::Token;

/// A comparison between an identifier and a literal. Conditions are built left to
/// right, so a condition is partial until all three tokens are set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    pub left: Token,
    pub operator: Token,
    pub right: Token,
}

impl Condition {
    pub fn is_partial(&self) -> bool {
        self.left.is_empty() || self.operator.is_empty() || self.right.is_empty()
    }

    pub fn predicate(&self) -> Result<Predicate, Error> {
        if self.is_partial() {
            return Err(Error::InvalidPredicate);
        }
        Predicate::leaf(
            self.left.clone(),
            self.operator.operator()?,
            self.right.clone(),
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [&self.left, &self.operator, &self.right]
            .into_iter()
            .filter(|token| !token.is_empty())
            .map(ToString::to_string)
            .collect();
        f.write_str(&parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Condition(Condition),
    Logical(Operator),
    Group(usize),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Group {
    children: Vec<Node>,
    parent: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionGroup {
    groups: Vec<Group>,
    current: usize,
}

impl Default for ConditionGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionGroup {
    pub fn new() -> Self {
        Self {
            groups: vec![Group::default()],
            current: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups[0].children.is_empty()
    }

    /// True when every parenthesis has been closed and the last child completes an
    /// expression.
    pub fn is_complete(&self) -> bool {
        self.current == 0 && self.completes(0)
    }

    /// Depth of open parentheses at the current position.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut group = self.current;
        while let Some(parent) = self.groups[group].parent {
            depth += 1;
            group = parent;
        }
        depth
    }

    fn last(&self) -> Option<&Node> {
        self.groups[self.current].children.last()
    }

    fn last_mut(&mut self) -> Option<&mut Node> {
        self.groups[self.current].children.last_mut()
    }

    // A condition or subexpression may start here.
    fn accepts_operand(&self) -> bool {
        matches!(self.last(), None | Some(Node::Logical(_)))
    }

    fn completes(&self, group: usize) -> bool {
        match self.groups[group].children.last() {
            Some(Node::Condition(cond)) => !cond.is_partial(),
            Some(Node::Group(_)) => true,
            _ => false,
        }
    }

    pub fn condition_left(&mut self, token: Token) -> Result<(), Error> {
        if !self.accepts_operand() {
            return Err(Error::AppendCondition);
        }

        self.groups[self.current]
            .children
            .push(Node::Condition(Condition {
                left: token,
                ..Default::default()
            }));
        Ok(())
    }

    pub fn condition_operator(&mut self, token: Token) -> Result<(), Error> {
        match self.last_mut() {
            Some(Node::Condition(cond))
                if !cond.left.is_empty() && cond.operator.is_empty() && cond.right.is_empty() =>
            {
                cond.operator = token;
                Ok(())
            }
            _ => Err(Error::AppendCondition),
        }
    }

    pub fn condition_right(&mut self, token: Token) -> Result<(), Error> {
        match self.last_mut() {
            Some(Node::Condition(cond))
                if !cond.left.is_empty() && !cond.operator.is_empty() && cond.right.is_empty() =>
            {
                cond.right = token;
                if cond.is_partial() {
                    cond.right = Token::EMPTY;
                    return Err(Error::AppendCondition);
                }
                Ok(())
            }
            _ => Err(Error::AppendCondition),
        }
    }

    pub fn logical_operator(&mut self, operator: Operator) -> Result<(), Error> {
        if operator.kind() != PredicateType::Logical || !self.completes(self.current) {
            return Err(Error::AppendOperator);
        }

        self.groups[self.current]
            .children
            .push(Node::Logical(operator));
        Ok(())
    }

    pub fn open_parens(&mut self) -> Result<(), Error> {
        if !self.accepts_operand() {
            return Err(Error::OpenParens);
        }

        let idx = self.groups.len();
        self.groups.push(Group {
            children: Vec::new(),
            parent: Some(self.current),
        });
        self.groups[self.current].children.push(Node::Group(idx));
        self.current = idx;
        Ok(())
    }

    pub fn close_parens(&mut self) -> Result<(), Error> {
        let Some(parent) = self.groups[self.current].parent else {
            return Err(Error::CloseParens);
        };

        if !self.completes(self.current) {
            return Err(Error::CloseParens);
        }

        self.current = parent;
        Ok(())
    }

    /// Compile the conditions into a predicate tree; AND binds tighter than OR and
    /// operators of equal precedence associate to the left.
    pub fn predicate(&self) -> Result<Predicate, Error> {
        self.compile(0)
    }

    fn compile(&self, group: usize) -> Result<Predicate, Error> {
        let mut disjuncts: Vec<Predicate> = Vec::new();
        let mut conjunct: Option<Predicate> = None;
        let mut pending: Option<Operator> = None;

        for node in &self.groups[group].children {
            let operand = match node {
                Node::Logical(op) => {
                    if conjunct.is_none() || pending.is_some() {
                        return Err(Error::InvalidPredicate);
                    }
                    pending = Some(*op);
                    continue;
                }
                Node::Condition(cond) => cond.predicate()?,
                Node::Group(idx) => self.compile(*idx)?,
            };

            conjunct = match (conjunct.take(), pending.take()) {
                (None, None) => Some(operand),
                (Some(left), Some(Operator::And)) => {
                    Some(Predicate::logical(left, Operator::And, operand))
                }
                (Some(left), Some(Operator::Or)) => {
                    disjuncts.push(left);
                    Some(operand)
                }
                _ => return Err(Error::InvalidPredicate),
            };
        }

        if pending.is_some() {
            return Err(Error::InvalidPredicate);
        }
        disjuncts.push(conjunct.ok_or(Error::InvalidPredicate)?);

        let mut disjuncts = disjuncts.into_iter();
        let first = disjuncts.next().ok_or(Error::InvalidPredicate)?;
        Ok(disjuncts.fold(first, |left, right| {
            Predicate::logical(left, Operator::Or, right)
        }))
    }

    fn render(&self, group: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.groups[group].children.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match node {
                Node::Condition(cond) => write!(f, "{cond}")?,
                Node::Logical(op) => write!(f, "{op}")?,
                Node::Group(idx) => {
                    f.write_str("(")?;
                    self.render(*idx, f)?;
                    f.write_str(")")?;
                }
            }
        }
        Ok(())
    }
}

/// Renders the conditions as SQL; open groups are rendered as if they were closed.
impl fmt::Display for ConditionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(0, f)
    }
}
