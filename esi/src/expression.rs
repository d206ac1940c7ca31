use log::{debug, warn};
use std::iter::Peekable;
use std::slice::Iter;
use std::str::Chars;

use crate::interpolate::interpolate;
use crate::{ExecutionError, FunctionRegistry, Result, Value, Variables};

/// The variables and functions visible while evaluating an expression.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    variables: &'a Variables,
    functions: &'a FunctionRegistry,
}

impl<'a> EvalContext<'a> {
    pub fn new(variables: &'a Variables, functions: &'a FunctionRegistry) -> Self {
        Self {
            variables,
            functions,
        }
    }

    pub fn variables(&self) -> &'a Variables {
        self.variables
    }

    pub fn functions(&self) -> &'a FunctionRegistry {
        self.functions
    }

    /// Resolves `name`, or `name{subkey}`. Anything missing is `Null`.
    pub fn lookup(&self, name: &str, subkey: Option<&str>) -> Value {
        match (self.variables.get(name), subkey) {
            (Some(value), None) => value.clone(),
            (Some(value), Some(key)) => value.subfield(key).cloned().unwrap_or(Value::Null),
            (None, _) => Value::Null,
        }
    }
}

/// Evaluates the `value` of an `esi:assign`.
///
/// A value starting with a quote is a literal with its outer quotes removed.
/// A value that is exactly one `$(...)` or `$fn(...)` keeps the resulting
/// value as is, so lists and dictionaries can be copied. Anything else is
/// substituted into a string.
pub fn evaluate_assignment(raw: &str, ctx: &EvalContext) -> Value {
    if let Some(literal) = raw.strip_prefix('\'') {
        return Value::from(literal.strip_suffix('\'').unwrap_or(literal));
    }

    let mut cur = raw.chars().peekable();
    if let Some(value) = try_evaluate_interpolated(&mut cur, ctx) {
        if cur.peek().is_none() {
            return match value {
                Value::Null => Value::from(""),
                value => value,
            };
        }
    }

    Value::String(interpolate(raw, ctx))
}

/// Tries to evaluate a `$(name{subkey})` reference or a registered `$fn(...)`
/// call at the cursor.
///
/// On success the cursor is moved past the expression. `None` means the text
/// at the cursor is not an expression and should be kept literally.
pub fn try_evaluate_interpolated(cur: &mut Peekable<Chars>, ctx: &EvalContext) -> Option<Value> {
    let mut lookahead = cur.clone();
    if lookahead.next() != Some('$') {
        return None;
    }

    let value = match lookahead.peek() {
        Some('(') => {
            lookahead.next();
            let (name, subkey) = get_variable(&mut lookahead)?;
            ctx.lookup(&name, subkey.as_deref())
        }
        Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
            let identifier = get_identifier(&mut lookahead);
            if !ctx.functions.contains(&identifier) || lookahead.peek() != Some(&'(') {
                return None;
            }
            let expr = match lex_arguments(&mut lookahead)
                .and_then(|tokens| parse_call(identifier, &tokens))
            {
                Ok(expr) => expr,
                Err(err) => {
                    debug!("not an expression: {}", err);
                    return None;
                }
            };
            match eval_expr(&expr, ctx) {
                Ok(value) => value,
                Err(err) => {
                    warn!("{}", err);
                    Value::Null
                }
            }
        }
        _ => return None,
    };

    *cur = lookahead;
    Some(value)
}

fn eval_expr(expr: &Expr, ctx: &EvalContext) -> Result<Value> {
    let result = match expr {
        Expr::Integer(i) => Value::Integer(*i),
        Expr::String(s) => Value::String(s.clone()),
        Expr::Variable(name, subkey) => ctx.lookup(name, subkey.as_deref()),
        Expr::Call(identifier, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, ctx)?);
            }
            ctx.functions.call(identifier, &values)?
        }
    };
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Integer(i64),
    String(String),
    Variable(String, Option<String>),
    Call(String, Vec<Expr>),
}

fn parse_call(identifier: String, tokens: &[Token]) -> Result<Expr> {
    let mut cur = tokens.iter().peekable();

    let expr = parse_arguments(identifier, &mut cur)?;
    if cur.peek().is_some() {
        return Err(ExecutionError::ExpressionParseError(
            "expected end of call".to_string(),
        ));
    }
    Ok(expr)
}

fn parse_expr(cur: &mut Peekable<Iter<Token>>) -> Result<Expr> {
    match cur.next() {
        Some(Token::Integer(i)) => Ok(Expr::Integer(*i)),
        Some(Token::String(s)) => Ok(Expr::String(s.clone())),
        Some(Token::Variable(name, subkey)) => Ok(Expr::Variable(name.clone(), subkey.clone())),
        Some(Token::Identifier(s)) => parse_arguments(s.clone(), cur),
        Some(_) => Err(ExecutionError::ExpressionParseError(
            "unexpected token starting expression".to_string(),
        )),
        None => Err(ExecutionError::ExpressionParseError(
            "unexpected end of tokens".to_string(),
        )),
    }
}

fn parse_arguments(identifier: String, cur: &mut Peekable<Iter<Token>>) -> Result<Expr> {
    if cur.next() != Some(&Token::OpenParen) {
        return Err(ExecutionError::ExpressionParseError(
            "unexpected token following identifier".to_string(),
        ));
    }

    let mut args = Vec::new();
    if cur.peek() == Some(&&Token::CloseParen) {
        cur.next();
        return Ok(Expr::Call(identifier, args));
    }
    loop {
        args.push(parse_expr(cur)?);
        match cur.next() {
            Some(Token::CloseParen) => break,
            Some(Token::Comma) => continue,
            _ => {
                return Err(ExecutionError::ExpressionParseError(
                    "unexpected token in arg list".to_string(),
                ))
            }
        }
    }
    Ok(Expr::Call(identifier, args))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Integer(i64),
    String(String),
    Variable(String, Option<String>),
    Identifier(String),
    OpenParen,
    CloseParen,
    Comma,
}

// Lexes a parenthesised argument list, stopping after its closing paren.
fn lex_arguments(cur: &mut Peekable<Chars>) -> Result<Vec<Token>> {
    let mut result = Vec::new();
    let mut depth = 0usize;

    while let Some(&c) = cur.peek() {
        match c {
            '(' => {
                cur.next();
                depth += 1;
                result.push(Token::OpenParen);
            }
            ')' => {
                cur.next();
                result.push(Token::CloseParen);
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(result);
                }
            }
            ',' => {
                cur.next();
                result.push(Token::Comma);
            }
            '\'' => {
                cur.next();
                result.push(get_string(cur)?);
            }
            '$' => {
                cur.next();
                match cur.peek() {
                    Some('(') => {
                        cur.next();
                        let (name, subkey) = get_variable(cur).ok_or_else(|| {
                            ExecutionError::ExpressionParseError(
                                "unterminated variable".to_string(),
                            )
                        })?;
                        result.push(Token::Variable(name, subkey));
                    }
                    Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                        result.push(Token::Identifier(get_identifier(cur)));
                    }
                    _ => {
                        return Err(ExecutionError::ExpressionParseError(
                            "unexpected character following '$'".to_string(),
                        ))
                    }
                }
            }
            '0'..='9' | '-' => {
                result.push(get_integer(cur)?);
            }
            c if c.is_whitespace() => {
                cur.next();
            }
            _ => {
                return Err(ExecutionError::ExpressionParseError(format!(
                    "unexpected character '{c}'"
                )))
            }
        }
    }

    Err(ExecutionError::ExpressionParseError(
        "unexpected eof in argument list".to_string(),
    ))
}

fn get_integer(cur: &mut Peekable<Chars>) -> Result<Token> {
    let mut buf = String::new();
    if cur.peek() == Some(&'-') {
        buf.push('-');
        cur.next();
    }
    while let Some(&c) = cur.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        buf.push(c);
        cur.next();
    }
    buf.parse()
        .map(Token::Integer)
        .map_err(|_| ExecutionError::ExpressionParseError("invalid number".to_string()))
}

fn get_identifier(cur: &mut Peekable<Chars>) -> String {
    let mut buf = String::new();

    while let Some(&c) = cur.peek() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {
                buf.push(c);
                cur.next();
            }
            _ => break,
        }
    }
    buf
}

// Reads a string whose opening quote has been consumed. `'''` strings are raw;
// in normal strings a backslash escapes the next character.
fn get_string(cur: &mut Peekable<Chars>) -> Result<Token> {
    let mut buf = String::new();
    let mut triple_tick = false;

    if cur.peek() == Some(&'\'') {
        // This is either an empty string, or the start of a triple tick string
        cur.next();
        if cur.peek() == Some(&'\'') {
            triple_tick = true;
            cur.next();
        } else {
            return Ok(Token::String(String::new()));
        }
    }

    while let Some(c) = cur.next() {
        match c {
            '\'' if !triple_tick => return Ok(Token::String(buf)),
            '\'' => {
                if cur.peek() == Some(&'\'') {
                    cur.next();
                    if cur.peek() == Some(&'\'') {
                        cur.next();
                        return Ok(Token::String(buf));
                    }
                    buf.push_str("''");
                } else {
                    buf.push('\'');
                }
            }
            '\\' if !triple_tick => match cur.next() {
                Some(escaped) => buf.push(escaped),
                None => break,
            },
            _ => buf.push(c),
        }
    }

    Err(ExecutionError::ExpressionParseError(
        "unexpected eof while parsing string".to_string(),
    ))
}

// Reads `name` or `name{subkey}` up to the first `)`, which is consumed.
fn get_variable(cur: &mut Peekable<Chars>) -> Option<(String, Option<String>)> {
    let mut buf = String::new();
    loop {
        match cur.next()? {
            ')' => break,
            c => buf.push(c),
        }
    }

    if let Some(open) = buf.rfind('{') {
        let key = &buf[open + 1..];
        if let Some(key) = key.strip_suffix('}') {
            if !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Some((buf[..open].to_string(), Some(key.to_string())));
            }
        }
    }
    Some((buf, None))
}
