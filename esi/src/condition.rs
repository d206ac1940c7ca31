use log::{debug, warn};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::sync::LazyLock;

use crate::expression::EvalContext;
use crate::interpolate::interpolate;
use crate::{ExecutionError, Value};

static SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+(\|\||&&)\s+").expect("valid separator pattern"));

static COMPARISON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(.*?)\s+(==|=|!=|>=|<=|has_i|has|matches_i|matches)\s+(.*)$")
        .expect("valid comparison pattern")
});

/// Outcome of an `esi:when` test.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionResult {
    False,
    True,
    /// A successful `matches`, carrying the whole match followed by each capture group.
    Matches(Vec<Value>),
}

impl ConditionResult {
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::False)
    }

    /// The value bound to `MATCHES` (and `matchname`) when the test passes.
    pub fn into_value(self) -> Value {
        match self {
            Self::False => Value::Boolean(false),
            Self::True => Value::Boolean(true),
            Self::Matches(groups) => Value::List(groups),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Logic {
    And,
    Or,
}

/// Evaluates a test expression such as `$(HTTP_HOST) == 'example.com' && !$(debug)`.
///
/// Terms are joined by `&&` and `||` and evaluated strictly left to right
/// with short-circuiting; there is no precedence between the two.
pub fn evaluate_condition(test: &str, ctx: &EvalContext) -> ConditionResult {
    let mut result: Option<bool> = None;
    let mut groups: Option<Vec<Value>> = None;

    let mut pending = None;
    let mut start = 0;
    let mut terms = Vec::new();
    for captures in SEPARATOR.captures_iter(test) {
        let (Some(whole), Some(op)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        terms.push((pending, &test[start..whole.start()]));
        pending = Some(if op.as_str() == "&&" {
            Logic::And
        } else {
            Logic::Or
        });
        start = whole.end();
    }
    terms.push((pending, &test[start..]));

    for (logic, term) in terms {
        match (logic, result) {
            (Some(Logic::And), Some(false)) | (Some(Logic::Or), Some(true)) => break,
            _ => {}
        }
        result = Some(evaluate_term(term.trim(), ctx, &mut groups));
    }

    match (result, groups) {
        (Some(true), Some(groups)) => ConditionResult::Matches(groups),
        (Some(true), None) => ConditionResult::True,
        _ => ConditionResult::False,
    }
}

fn evaluate_term(term: &str, ctx: &EvalContext, groups: &mut Option<Vec<Value>>) -> bool {
    let (negated, term) = match term.strip_prefix('!') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, term),
    };
    let term = match term.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        Some(inner) => inner.trim(),
        None => term,
    };

    let result = match COMPARISON.captures(term) {
        Some(captures) => {
            let left = operand(captures.get(1).map_or("", |m| m.as_str()), ctx);
            let op = captures.get(2).map_or("", |m| m.as_str());
            let right = operand(captures.get(3).map_or("", |m| m.as_str()), ctx);
            compare(&left, op, &right, groups)
        }
        None => !interpolate(term, ctx).is_empty(),
    };
    debug!("condition term {:?} evaluated to {}", term, result != negated);
    result != negated
}

fn operand(raw: &str, ctx: &EvalContext) -> String {
    let raw = raw.trim();
    if raw.len() >= 6 && raw.starts_with("'''") && raw.ends_with("'''") {
        return raw[3..raw.len() - 3].to_string();
    }
    let raw = match raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        Some(unquoted) => unquoted,
        None => raw,
    };
    interpolate(raw, ctx)
}

fn ordering(left: &str, right: &str) -> Option<Ordering> {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r),
        _ => Some(left.cmp(right)),
    }
}

fn compare(left: &str, op: &str, right: &str, groups: &mut Option<Vec<Value>>) -> bool {
    match op {
        "=" | "==" => left == right,
        "!=" => left != right,
        ">=" => matches!(
            ordering(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "<=" => matches!(
            ordering(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "has" => left.contains(right),
        "has_i" => left.to_lowercase().contains(&right.to_lowercase()),
        "matches" | "matches_i" => {
            let regex = match RegexBuilder::new(right)
                .case_insensitive(op == "matches_i")
                .build()
            {
                Ok(regex) => regex,
                Err(err) => {
                    warn!("{}", ExecutionError::from(err));
                    return false;
                }
            };
            match regex.captures(left) {
                Some(captures) => {
                    *groups = Some(
                        captures
                            .iter()
                            .map(|group| group.map_or(Value::Null, |m| Value::from(m.as_str())))
                            .collect(),
                    );
                    true
                }
                None => false,
            }
        }
        _ => false,
    }
}
