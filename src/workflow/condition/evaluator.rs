// SPDX-License-Identifier: MIT

//! Condition expression evaluator

use super::ast::{CompareOp, Expression, Literal};
use crate::sdk::step::StepContext;
use serde_json::Value;

/// Evaluate a condition expression against the context a step would receive
pub fn evaluate(expr: &Expression, ctx: &StepContext) -> bool {
    match expr {
        Expression::True => true,
        Expression::False => false,
        Expression::Truthy(path) => ctx.get_path(path).is_some_and(is_truthy),
        Expression::Compare { path, op, right } => compare(ctx.get_path(path), *op, right),
        Expression::And(left, right) => evaluate(left, ctx) && evaluate(right, ctx),
        Expression::Or(left, right) => evaluate(left, ctx) || evaluate(right, ctx),
        Expression::Not(inner) => !evaluate(inner, ctx),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(left: Option<&Value>, op: CompareOp, right: &Literal) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::NotEq => !values_equal(left, right),
        CompareOp::Gt => compare_numbers(left, right, |a, b| a > b),
        CompareOp::Gte => compare_numbers(left, right, |a, b| a >= b),
        CompareOp::Lt => compare_numbers(left, right, |a, b| a < b),
        CompareOp::Lte => compare_numbers(left, right, |a, b| a <= b),
        CompareOp::Contains => contains(left, right),
    }
}

fn literal_matches(value: &Value, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::Null, Literal::Null) => true,
        (Value::String(s), Literal::String(r)) => s == r,
        (Value::Number(n), Literal::Number(r)) => {
            n.as_f64().is_some_and(|f| (f - r).abs() < f64::EPSILON)
        }
        (Value::Bool(b), Literal::Boolean(r)) => b == r,
        _ => false,
    }
}

/// A missing path compares equal to `null`
fn values_equal(left: Option<&Value>, right: &Literal) -> bool {
    match left {
        None => *right == Literal::Null,
        Some(value) => literal_matches(value, right),
    }
}

fn compare_numbers<F>(left: Option<&Value>, right: &Literal, cmp: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (left.and_then(Value::as_f64), right) {
        (Some(l), Literal::Number(r)) => cmp(l, *r),
        _ => false,
    }
}

fn contains(left: Option<&Value>, right: &Literal) -> bool {
    match (left, right) {
        (Some(Value::String(s)), Literal::String(needle)) => s.contains(needle.as_str()),
        (Some(Value::Array(items)), literal) => items.iter().any(|v| literal_matches(v, literal)),
        (Some(Value::Object(map)), Literal::String(key)) => map.contains_key(key),
        _ => false,
    }
}
