//! Guard expression parser
//!
//! Parses expressions like:
//! - `amount > 100`
//! - `req.type == 'vip' && !(var.retries >= 3)`
//! - `tags contains 'urgent' or sta.approved`

use super::ast::{CompareOp, Expression, Literal, Operand};
use crate::storyline::bus::ScopePath;
use std::error::Error;

type ParseResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Parse a guard expression string into an AST
pub fn parse(input: &str) -> ParseResult<Expression> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Empty condition".into());
    }

    // Lowest precedence first so `a or b and c` groups as `a or (b and c)`
    if let Some((pos, len)) = find_top_level(input, &[" or ", "||"]) {
        let left = parse(&input[..pos])?;
        let right = parse(&input[pos + len..])?;
        return Ok(Expression::Or(Box::new(left), Box::new(right)));
    }
    if let Some((pos, len)) = find_top_level(input, &[" and ", "&&"]) {
        let left = parse(&input[..pos])?;
        let right = parse(&input[pos + len..])?;
        return Ok(Expression::And(Box::new(left), Box::new(right)));
    }

    if let Some(rest) = strip_not(input) {
        return Ok(Expression::Not(Box::new(parse(rest)?)));
    }
    if let Some(inner) = strip_parens(input) {
        return parse(inner);
    }

    if input == "true" {
        return Ok(Expression::True);
    }
    if input == "false" {
        return Ok(Expression::False);
    }

    if let Some(expr) = parse_comparison(input)? {
        return Ok(expr);
    }
    if is_path(input) {
        return Ok(Expression::Path(input.to_string()));
    }

    Err(format!("Could not parse condition: {}", input).into())
}

/// Byte position and length of the first operator found outside quotes and
/// parentheses
fn find_top_level(input: &str, ops: &[&str]) -> Option<(usize, usize)> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if depth == 0 => {
                if let Some(op) = ops.iter().find(|op| input[i..].starts_with(**op)) {
                    return Some((i, op.len()));
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_not(input: &str) -> Option<&str> {
    if let Some(rest) = input.strip_prefix("not ") {
        return Some(rest);
    }
    if input.starts_with('!') && !input.starts_with("!=") {
        return Some(&input[1..]);
    }
    None
}

/// Inner text when the whole input is wrapped in one pair of parentheses
fn strip_parens(input: &str) -> Option<&str> {
    if !input.starts_with('(') || !input.ends_with(')') {
        return None;
    }

    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return (i == input.len() - 1).then(|| &input[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_comparison(input: &str) -> ParseResult<Option<Expression>> {
    // Try operators in order of length (longest first)
    let operators = [
        ("!=", CompareOp::NotEq),
        (">=", CompareOp::Gte),
        ("<=", CompareOp::Lte),
        ("==", CompareOp::Eq),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        (" contains ", CompareOp::Contains),
    ];

    for (op_str, op) in operators {
        if let Some((pos, len)) = find_top_level(input, &[op_str]) {
            let left = input[..pos].trim();
            if !is_path(left) {
                return Err(format!("Left side of '{}' must be a path: {}", op, left).into());
            }
            let right = parse_operand(input[pos + len..].trim())?;
            return Ok(Some(Expression::Compare {
                left: left.to_string(),
                op,
                right,
            }));
        }
    }

    Ok(None)
}

fn parse_operand(input: &str) -> ParseResult<Operand> {
    if let Some(literal) = parse_literal(input) {
        return Ok(Operand::Literal(literal));
    }
    if is_path(input) {
        return Ok(Operand::Path(input.to_string()));
    }
    Err(format!("Could not parse operand: {}", input).into())
}

fn parse_literal(input: &str) -> Option<Literal> {
    let input = input.trim();

    match input {
        "null" => return Some(Literal::Null),
        "true" => return Some(Literal::Boolean(true)),
        "false" => return Some(Literal::Boolean(false)),
        _ => {}
    }

    // String (single or double quotes)
    if input.len() >= 2
        && ((input.starts_with('\'') && input.ends_with('\''))
            || (input.starts_with('"') && input.ends_with('"')))
    {
        return Some(Literal::String(input[1..input.len() - 1].to_string()));
    }

    input.parse::<f64>().ok().map(Literal::Number)
}

fn is_path(input: &str) -> bool {
    let starts_well = input
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || matches!(c, '_' | '@' | '$'));
    starts_well
        && input
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '@' | '$' | '.' | '[' | ']'))
        && ScopePath::parse(input).is_some()
}
