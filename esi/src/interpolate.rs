use crate::expression::{try_evaluate_interpolated, EvalContext};

/// Substitutes every `$(name)`, `$(name{key})` and registered `$fn(...)`
/// expression in `input` with its string value.
///
/// Undefined variables become empty strings. A `$` that does not start an
/// expression is kept as is.
pub fn interpolate(input: &str, ctx: &EvalContext) -> String {
    if !input.contains('$') {
        return input.to_string();
    }

    let mut output = String::with_capacity(input.len());
    let mut cur = input.chars().peekable();

    while let Some(&c) = cur.peek() {
        if c == '$' {
            if let Some(value) = try_evaluate_interpolated(&mut cur, ctx) {
                output.push_str(&value.to_string());
                continue;
            }
        }
        output.push(c);
        cur.next();
    }

    output
}
