//! Boolean expression language for per-sink transfer conditions.
//!
//! Five named tokens combine with `and`, `or`, `not`, and parentheses.
//! Unknown identifiers are rejected at parse time.

use std::path::Path;

use thiserror::Error;

use common::manifest::{MaxRep, STOP_MARKER};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("unknown token {0:?} in transfer condition")]
    UnknownToken(String),
    #[error("unexpected end of transfer condition")]
    UnexpectedEnd,
    #[error("unexpected {0:?} in transfer condition")]
    Unexpected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    All,
    Never,
    LastIteration,
    AllButLastIteration,
    StopIteration,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    All,
    Never,
    LastIteration,
    AllButLastIteration,
    StopIteration,
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Iteration state the tokens are evaluated against. `cur_iter` is the
/// post-increment value of the iteration that just finished.
#[derive(Debug, Clone, Copy)]
pub struct IterationState {
    pub cur_iter: u32,
    pub max_rep: MaxRep,
    pub stop_marker: bool,
}

impl IterationState {
    pub fn from_request(cur_iter: u32, max_rep: MaxRep, req_dir: &Path) -> Self {
        Self {
            cur_iter,
            max_rep,
            stop_marker: req_dir.join(STOP_MARKER).is_file(),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let spaced = input.replace('(', " ( ").replace(')', " ) ");
    for word in spaced.split_whitespace() {
        let token = match word.to_ascii_lowercase().as_str() {
            "all" => Token::All,
            "never" => Token::Never,
            "last_iteration" => Token::LastIteration,
            "all_but_last_iteration" => Token::AllButLastIteration,
            "stop_iteration" => Token::StopIteration,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "(" => Token::LParen,
            ")" => Token::RParen,
            other => return Err(ConditionError::UnknownToken(other.to_string())),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<Token, ConditionError> {
        let t = self.peek().ok_or(ConditionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(t)
    }

    // or := and ('or' and)*
    fn or_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and := unary ('and' unary)*
    fn and_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // unary := 'not' unary | primary
    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next()? {
            Token::All => Ok(Expr::All),
            Token::Never => Ok(Expr::Never),
            Token::LastIteration => Ok(Expr::LastIteration),
            Token::AllButLastIteration => Ok(Expr::AllButLastIteration),
            Token::StopIteration => Ok(Expr::StopIteration),
            Token::LParen => {
                let inner = self.or_expr()?;
                match self.next()? {
                    Token::RParen => Ok(inner),
                    other => Err(ConditionError::Unexpected(format!("{other:?}"))),
                }
            }
            other => Err(ConditionError::Unexpected(format!("{other:?}"))),
        }
    }
}

fn parse(input: &str) -> Result<Expr, ConditionError> {
    let tokens = lex(input)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let expr = parser.or_expr()?;
    if parser.pos != tokens.len() {
        return Err(ConditionError::Unexpected(format!(
            "{:?}",
            tokens[parser.pos]
        )));
    }
    Ok(expr)
}

fn eval(expr: &Expr, state: &IterationState) -> bool {
    match expr {
        Expr::All => true,
        Expr::Never => false,
        Expr::LastIteration => match state.max_rep {
            MaxRep::Inf => false,
            MaxRep::Count(n) => state.cur_iter == n,
        },
        Expr::AllButLastIteration => match state.max_rep {
            MaxRep::Inf => true,
            MaxRep::Count(n) => state.cur_iter < n,
        },
        Expr::StopIteration => state.stop_marker,
        Expr::Not(inner) => !eval(inner, state),
        Expr::And(a, b) => eval(a, state) && eval(b, state),
        Expr::Or(a, b) => eval(a, state) || eval(b, state),
    }
}

/// Decide whether a sink transfer fires for the iteration described by
/// `state`.
pub fn should_transfer(condition: &str, state: &IterationState) -> Result<bool, ConditionError> {
    let expr = parse(condition)?;
    Ok(eval(&expr, state))
}
