//! Condition evaluation seam.
//!
//! Aggregation consumes conditions through [`ExpressionEvaluator`] only.
//! [`ComparisonEvaluator`] is a small built-in implementation that
//! understands `<path> <op> <json literal>` comparisons and `exists(<path>)`.

use std::cmp::Ordering;

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, value},
    sequence::{delimited, pair},
};
use serde_json::Value;

use crate::error::ExpressionError;
use crate::event::Event;

/// Evaluates boolean conditions against events.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate_conditional(&self, expression: &str, event: &Event) -> Result<bool, ExpressionError>;

    /// Check an expression without evaluating it.
    fn validate(&self, _expression: &str) -> Result<(), ExpressionError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
enum Condition<'a> {
    Exists(&'a str),
    Compare {
        path: &'a str,
        op: Operator,
        literal: Value,
    },
}

/// Evaluator for single comparisons such as `/status >= 500` or
/// `/level == "ERROR"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComparisonEvaluator;

impl ComparisonEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for ComparisonEvaluator {
    fn evaluate_conditional(&self, expression: &str, event: &Event) -> Result<bool, ExpressionError> {
        match parse(expression)? {
            Condition::Exists(path) => Ok(event.contains_key(path)),
            Condition::Compare { path, op, literal } => {
                let Some(value) = event.get(path) else {
                    return Ok(op == Operator::Ne);
                };
                match op {
                    Operator::Eq => Ok(values_equal(value, &literal)),
                    Operator::Ne => Ok(!values_equal(value, &literal)),
                    _ => {
                        let ordering = compare(value, &literal).ok_or_else(|| {
                            ExpressionError::Evaluation {
                                expression: expression.to_owned(),
                                reason: format!("cannot order {value} against {literal}"),
                            }
                        })?;
                        Ok(match op {
                            Operator::Lt => ordering == Ordering::Less,
                            Operator::Le => ordering != Ordering::Greater,
                            Operator::Gt => ordering == Ordering::Greater,
                            _ => ordering != Ordering::Less,
                        })
                    }
                }
            }
        }
    }

    fn validate(&self, expression: &str) -> Result<(), ExpressionError> {
        parse(expression).map(|_| ())
    }
}

fn parse(expression: &str) -> Result<Condition<'_>, ExpressionError> {
    let text = expression.trim();
    let parse_error = |reason: String| ExpressionError::Parse {
        expression: expression.to_owned(),
        reason,
    };
    if text.is_empty() {
        return Err(parse_error("empty expression".to_owned()));
    }

    let (rest, head) = alt((exists, comparison))(text)
        .map_err(|e| parse_error(format!("expected `exists(<path>)` or `<path> <op> <literal>`: {e}")))?;
    let rest = rest.trim();
    match head {
        Head::Exists(path) => {
            if !rest.is_empty() {
                return Err(parse_error(format!("unexpected trailing input: {rest:?}")));
            }
            Ok(Condition::Exists(path))
        }
        Head::Compare(path, op) => {
            let literal = serde_json::from_str(rest).map_err(|e| {
                parse_error(format!("right-hand side is not a JSON literal: {e}"))
            })?;
            Ok(Condition::Compare { path, op, literal })
        }
    }
}

/// The part of a condition recognized by the grammar. A comparison's
/// literal is the remaining input, decoded as JSON.
enum Head<'a> {
    Exists(&'a str),
    Compare(&'a str, Operator),
}

/// Consume optional whitespace around a parser.
fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// A field key or `/`-separated path.
fn field_path(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && !matches!(c, '=' | '!' | '<' | '>' | '(' | ')'))(
        input,
    )
}

fn operator(input: &str) -> IResult<&str, Operator> {
    alt((
        value(Operator::Eq, tag("==")),
        value(Operator::Ne, tag("!=")),
        value(Operator::Le, tag("<=")),
        value(Operator::Ge, tag(">=")),
        value(Operator::Lt, tag("<")),
        value(Operator::Gt, tag(">")),
    ))(input)
}

fn exists(input: &str) -> IResult<&str, Head<'_>> {
    map(
        delimited(tag("exists("), ws(field_path), char(')')),
        Head::Exists,
    )(input)
}

fn comparison(input: &str) -> IResult<&str, Head<'_>> {
    map(pair(field_path, ws(operator)), |(path, op)| {
        Head::Compare(path, op)
    })(input)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
