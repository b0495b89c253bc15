// SPDX-License-Identifier: MIT

//! Step conditions
//!
//! A condition decides, at the start of a step's layer, whether the step
//! runs at all. It is either a parsed `when` expression such as
//! - `research.score > 0.8`
//! - `input.channel == 'email' and not review.rejected`
//!
//! or an arbitrary predicate over the step's context.

mod ast;
mod evaluator;
mod parser;

pub use ast::{CompareOp, Expression, Literal};
pub use evaluator::evaluate;
pub use parser::parse;

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::sdk::error::ConditionError;
use crate::sdk::step::StepContext;

type Predicate = Arc<dyn Fn(&StepContext) -> bool + Send + Sync>;

/// Gate evaluated against the accumulated context before a step is dispatched
#[derive(Clone)]
pub enum Condition {
    Expression { source: String, expr: Expression },
    Predicate(Predicate),
}

impl Condition {
    /// Parse a `when` expression
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        Ok(Self::Expression {
            source: source.trim().to_string(),
            expr: parse(source)?,
        })
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&StepContext) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// True once `step` has produced an output of at least `min_words` words
    pub fn min_output_words(step: impl Into<String>, min_words: usize) -> Self {
        let step = step.into();
        Self::predicate(move |ctx| match ctx.output(&step) {
            None | Some(Value::Null) => false,
            Some(Value::String(text)) => text.split_whitespace().count() >= min_words,
            Some(other) => other.to_string().split_whitespace().count() >= min_words,
        })
    }

    pub fn evaluate(&self, ctx: &StepContext) -> bool {
        match self {
            Self::Expression { expr, .. } => evaluate(expr, ctx),
            Self::Predicate(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expression { source, .. } => f.debug_tuple("Expression").field(source).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
