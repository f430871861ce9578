//! Validation of policy-group expressions and match-condition expressions.
//!
//! CEL compilation is consumed as a library; the controller never evaluates
//! expressions against live requests. Group expressions run in a deliberately
//! tiny environment: every member name is a zero-arity boolean function and
//! the only operators are `==`, `!=`, `&&`, `||` and `!`, so a validated
//! expression is guaranteed to type to `bool`.

use std::collections::BTreeSet;

use cel_parser::{Atom, Expression, RelationOp, UnaryOp};

/* ============================= MEMBER NAMES ============================= */

/// Identifiers the expression language reserves; member policies cannot
/// shadow them.
const RESERVED_WORDS: &[&str] = &[
    "true", "false", "null", "in", "as", "break", "const", "continue", "else", "for", "function",
    "if", "import", "let", "loop", "package", "namespace", "return", "var", "void", "while",
];

pub fn is_reserved_word(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

/// Member names must match `[_a-zA-Z][_a-zA-Z0-9]*`.
pub fn is_valid_member_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return false;
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/* ============================= GROUP EXPRESSIONS ============================= */

/// Validate a policy-group expression against the set of member names.
///
/// The expression must parse, reference only the given members as zero-arity
/// calls, and stick to boolean/equality operators.
pub fn validate_group_expression(
    expression: &str,
    members: &BTreeSet<String>,
) -> Result<(), String> {
    if expression.trim().is_empty() {
        return Err("expression is empty".to_string());
    }
    let parsed =
        cel_parser::parse(expression).map_err(|e| format!("cannot compile expression: {e}"))?;
    check_group_node(&parsed, members)
}

fn check_group_node(expr: &Expression, members: &BTreeSet<String>) -> Result<(), String> {
    match expr {
        Expression::And(left, right) | Expression::Or(left, right) => {
            check_group_node(left, members)?;
            check_group_node(right, members)
        }
        Expression::Unary(op, inner) => match op {
            UnaryOp::Not | UnaryOp::DoubleNot => check_group_node(inner, members),
            _ => Err("only the ! unary operator is allowed".to_string()),
        },
        Expression::Relation(left, op, right) => match op {
            RelationOp::Equals | RelationOp::NotEquals => {
                check_group_node(left, members)?;
                check_group_node(right, members)
            }
            _ => Err("only the == and != comparison operators are allowed".to_string()),
        },
        Expression::FunctionCall(function, receiver, args) => {
            if receiver.is_some() {
                return Err("method calls are not allowed".to_string());
            }
            if !args.is_empty() {
                return Err("member policies are called without arguments".to_string());
            }
            match function.as_ref() {
                Expression::Ident(name) if members.contains(name.as_str()) => Ok(()),
                Expression::Ident(name) => {
                    Err(format!("unknown policy group member {name:?}"))
                }
                _ => Err("only member policies can be called".to_string()),
            }
        }
        Expression::Atom(Atom::Bool(_)) => Ok(()),
        Expression::Atom(_) => Err("only boolean literals are allowed".to_string()),
        Expression::Ident(name) => Err(format!(
            "{name:?} must be called as a function: {name}()"
        )),
        _ => Err("expression element is not allowed".to_string()),
    }
}

/* ============================= MATCH CONDITIONS ============================= */

/// Pre-flight check for a match-condition expression: it must compile, and
/// its outermost construct must be able to produce a boolean. The request
/// environment (`object`, `request`, `authorizer`, …) belongs to the API
/// server, so member typing stops at the root.
pub fn validate_match_condition_expression(expression: &str) -> Result<(), String> {
    if expression.trim().is_empty() {
        return Err("expression is empty".to_string());
    }
    let parsed =
        cel_parser::parse(expression).map_err(|e| format!("cannot compile expression: {e}"))?;

    match &parsed {
        Expression::Atom(Atom::Bool(_))
        | Expression::And(_, _)
        | Expression::Or(_, _)
        | Expression::Relation(_, _, _)
        | Expression::Unary(UnaryOp::Not, _)
        | Expression::Unary(UnaryOp::DoubleNot, _)
        | Expression::Ternary(_, _, _)
        | Expression::FunctionCall(_, _, _)
        | Expression::Member(_, _)
        | Expression::Ident(_) => Ok(()),
        _ => Err("expression must evaluate to bool".to_string()),
    }
}

/* ============================= TESTS ============================= */
