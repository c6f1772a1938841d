// SPDX-License-Identifier: MIT

//! Guard conditions on sequence flows
//!
//! Guards are compiled by a [`ConditionRegistry`] once at preheat. Typical
//! guards:
//! - `true`
//! - `r:admin,audit`
//! - `2: amount > 100 and req.type == 'vip'`

mod ast;
mod evaluator;
mod matcher;
mod parser;

pub use ast::{CompareOp, Expression, Literal, Operand};
pub use evaluator::evaluate;
pub use matcher::{
    BooleanMatcher, CompiledCondition, ConditionExpression, ConditionMatcher, ConditionRegistry,
    CustomPredicate, RoleMatcher, ScriptMatcher, DEFAULT_CONDITIONS,
};
pub use parser::parse;
