use crate::{ExecutionError, Result, Value};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

/// A library function callable as `$name(...)` from substituted text.
pub type EsiFunction = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// Name to function lookup consulted while substituting variables.
///
/// [`FunctionRegistry::default`] comes with the built-in string and list helpers;
/// [`FunctionRegistry::empty`] has none.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<EsiFunction>>,
}

impl FunctionRegistry {
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registers `function` under `name` (without the leading `$`), replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    #[allow(clippy::return_self_not_must_use)]
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        match self.functions.get(name) {
            Some(function) => function(args),
            None => Err(ExecutionError::FunctionError(format!(
                "unknown function: {name}"
            ))),
        }
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("lower", lower);
        registry.register("upper", upper);
        registry.register("lstrip", lstrip);
        registry.register("rstrip", rstrip);
        registry.register("strip", strip);
        registry.register("html_encode", html_encode);
        registry.register("html_decode", html_decode);
        registry.register("replace", replace);
        registry.register("join", join);
        registry.register("index", index);
        registry.register("rindex", rindex);
        registry.register("substr", substr);
        registry.register("dollar", |args: &[Value]| literal("dollar", args, "$"));
        registry.register("dquote", |args: &[Value]| literal("dquote", args, "\""));
        registry.register("squote", |args: &[Value]| literal("squote", args, "'"));
        registry.register("int", int);
        registry.register("str", string);
        registry.register("len", len);
        registry.register("list_delitem", list_delitem);
        registry.register("rand", rand);
        registry
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

fn check_arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(ExecutionError::FunctionError(format!(
            "wrong number of arguments to '{name}'"
        )));
    }
    Ok(())
}

fn integer_arg(name: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::String(s) => s.trim().parse().map_err(|_| {
            ExecutionError::FunctionError(format!("incorrect type passed to '{name}'"))
        }),
        _ => Err(ExecutionError::FunctionError(format!(
            "incorrect type passed to '{name}'"
        ))),
    }
}

fn literal(name: &str, args: &[Value], value: &str) -> Result<Value> {
    check_arity(name, args, 0, 0)?;
    Ok(Value::from(value))
}

pub fn lower(args: &[Value]) -> Result<Value> {
    check_arity("lower", args, 1, 1)?;
    Ok(Value::String(args[0].to_string().to_lowercase()))
}

pub fn upper(args: &[Value]) -> Result<Value> {
    check_arity("upper", args, 1, 1)?;
    Ok(Value::String(args[0].to_string().to_uppercase()))
}

pub fn lstrip(args: &[Value]) -> Result<Value> {
    check_arity("lstrip", args, 1, 1)?;
    Ok(Value::from(args[0].to_string().trim_start()))
}

pub fn rstrip(args: &[Value]) -> Result<Value> {
    check_arity("rstrip", args, 1, 1)?;
    Ok(Value::from(args[0].to_string().trim_end()))
}

pub fn strip(args: &[Value]) -> Result<Value> {
    check_arity("strip", args, 1, 1)?;
    Ok(Value::from(args[0].to_string().trim()))
}

pub fn html_encode(args: &[Value]) -> Result<Value> {
    check_arity("html_encode", args, 1, 1)?;
    Ok(Value::String(
        html_escape::encode_text(&args[0].to_string()).to_string(),
    ))
}

pub fn html_decode(args: &[Value]) -> Result<Value> {
    check_arity("html_decode", args, 1, 1)?;
    Ok(Value::String(
        html_escape::decode_html_entities(&args[0].to_string()).to_string(),
    ))
}

pub fn replace(args: &[Value]) -> Result<Value> {
    check_arity("replace", args, 3, 4)?;
    let haystack = args[0].to_string();
    let needle = args[1].to_string();
    let replacement = args[2].to_string();

    // count is optional, default to usize::MAX
    let count = match args.get(3) {
        Some(Value::Integer(count)) => usize::try_from(*count).unwrap_or(usize::MAX),
        Some(_) => {
            return Err(ExecutionError::FunctionError(
                "incorrect type passed to 'replace'".to_string(),
            ));
        }
        None => usize::MAX,
    };
    Ok(Value::String(haystack.replacen(&needle, &replacement, count)))
}

pub fn join(args: &[Value]) -> Result<Value> {
    check_arity("join", args, 1, 2)?;
    let Value::List(items) = &args[0] else {
        return Err(ExecutionError::FunctionError(
            "incorrect type passed to 'join'".to_string(),
        ));
    };
    let separator = args.get(1).map_or_else(|| " ".to_string(), Value::to_string);
    let words: Vec<String> = items.iter().map(Value::to_string).collect();
    Ok(Value::String(words.join(&separator)))
}

// Character (not byte) position of the match, or -1.
fn char_position(haystack: &str, byte_index: Option<usize>) -> Value {
    match byte_index {
        Some(i) => Value::Integer(haystack[..i].chars().count() as i64),
        None => Value::Integer(-1),
    }
}

pub fn index(args: &[Value]) -> Result<Value> {
    check_arity("index", args, 2, 2)?;
    let haystack = args[0].to_string();
    let needle = args[1].to_string();
    Ok(char_position(&haystack, haystack.find(&needle)))
}

pub fn rindex(args: &[Value]) -> Result<Value> {
    check_arity("rindex", args, 2, 2)?;
    let haystack = args[0].to_string();
    let needle = args[1].to_string();
    Ok(char_position(&haystack, haystack.rfind(&needle)))
}

/// `$substr(s, i[, j])`: from `i` (negative counts from the end) either `j`
/// characters, or up to `j` characters before the end when `j <= 0`.
pub fn substr(args: &[Value]) -> Result<Value> {
    check_arity("substr", args, 2, 3)?;
    let chars: Vec<char> = args[0].to_string().chars().collect();
    let len = chars.len() as i64;
    let i = integer_arg("substr", &args[1])?;
    let from_end = |n: i64| if n < 0 { (len + n).max(0) } else { n.min(len) };

    let (start, end) = match args.get(2) {
        None => (from_end(i), len),
        Some(j) => {
            let j = integer_arg("substr", j)?;
            let start = if i >= 0 { i } else { len + i };
            if j <= 0 {
                let a = start.clamp(0, len);
                let b = (len + j).clamp(0, len);
                (a.min(b), a.max(b))
            } else {
                let start = from_end(start);
                (start, (start + j).min(len))
            }
        }
    };

    Ok(Value::String(
        chars[start as usize..end as usize].iter().collect(),
    ))
}

/// Parses the leading integer of a string; anything unparseable becomes 0.
pub fn int(args: &[Value]) -> Result<Value> {
    check_arity("int", args, 1, 1)?;
    if let Value::Integer(i) = args[0] {
        return Ok(Value::Integer(i));
    }
    let s = args[0].to_string();
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    Ok(Value::Integer(
        digits[..end].parse::<i64>().map_or(0, |n| sign * n),
    ))
}

pub fn string(args: &[Value]) -> Result<Value> {
    check_arity("str", args, 1, 1)?;
    Ok(Value::String(args[0].to_string()))
}

pub fn len(args: &[Value]) -> Result<Value> {
    check_arity("len", args, 1, 1)?;
    Ok(match &args[0] {
        Value::String(s) => Value::Integer(s.chars().count() as i64),
        Value::List(items) => Value::Integer(items.len() as i64),
        Value::Dictionary(map) => Value::Integer(map.len() as i64),
        _ => Value::Null,
    })
}

/// Returns the list without the item at the given index.
pub fn list_delitem(args: &[Value]) -> Result<Value> {
    check_arity("list_delitem", args, 2, 2)?;
    let Value::List(items) = &args[0] else {
        return Err(ExecutionError::FunctionError(
            "incorrect type passed to 'list_delitem'".to_string(),
        ));
    };
    let index = integer_arg("list_delitem", &args[1])?;
    let mut items = items.clone();
    if let Ok(index) = usize::try_from(index) {
        if index < items.len() {
            items.remove(index);
        }
    }
    Ok(Value::List(items))
}

/// A random integer in `0..ceiling`, `ceiling` defaulting to 100000000.
pub fn rand(args: &[Value]) -> Result<Value> {
    check_arity("rand", args, 0, 1)?;
    let ceiling = match args.first() {
        Some(value) => integer_arg("rand", value)?,
        None => 100_000_000,
    };
    if ceiling <= 0 {
        return Ok(Value::Integer(0));
    }
    let mut buf = [0u8; 8];
    getrandom::fill(&mut buf)
        .map_err(|err| ExecutionError::FunctionError(format!("rand: {err}")))?;
    Ok(Value::Integer((u64::from_le_bytes(buf) % ceiling as u64) as i64))
}
