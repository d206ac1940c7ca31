use std::collections::HashMap;
use std::fmt;
use std::iter::FromIterator;
use std::sync::Arc;

/// Name of the variable recording that a `when` in the current `choose` block already matched.
pub const MATCHES: &str = "MATCHES";

/// A value bound in the ESI variable context.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Boolean(bool),
    List(Vec<Value>),
    Dictionary(HashMap<String, Value>),
    Null,
}

impl Value {
    pub fn to_bool(&self) -> bool {
        match self {
            Self::String(s) => !s.is_empty(),
            Self::Integer(i) => *i != 0,
            Self::Boolean(b) => *b,
            Self::List(_) | Self::Dictionary(_) => true,
            Self::Null => false,
        }
    }

    /// Looks up `key` inside a dictionary, or a decimal index inside a list.
    pub fn subfield(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dictionary(map) => map.get(key),
            Self::List(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Self::Dictionary(_) | Self::Null => Ok(()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(map: HashMap<String, Value>) -> Self {
        Self::Dictionary(map)
    }
}

/// The variable context of one interpretation pass.
///
/// A context is a layer of its own bindings over an optional, frozen parent.
/// Lookups walk outwards through the parents; writes always land in the
/// innermost layer, so a child created for an include can read everything
/// its caller could, while its own assignments never reach the caller.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    map: HashMap<String, Value>,
    parent: Option<Arc<Variables>>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        match value.into() {
            Value::Null => {}
            value => {
                self.map.insert(name.into(), value);
            }
        };
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.map.get(name) {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|parent| parent.get(name)),
        }
    }

    /// Whether `name` is bound in this layer, ignoring parents.
    pub fn contains_local(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub(crate) fn remove_local(&mut self, name: &str) -> Option<Value> {
        self.map.remove(name)
    }

    /// Puts back a binding previously taken with `remove_local`, or clears it.
    pub(crate) fn restore_local(&mut self, name: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                self.map.insert(name.to_string(), value);
            }
            None => {
                self.map.remove(name);
            }
        }
    }

    /// Creates an empty layer on top of a snapshot of this context.
    pub fn child(&self) -> Self {
        Self {
            map: HashMap::new(),
            parent: Some(Arc::new(self.clone())),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut variables = Self::new();
        for (name, value) in iter {
            variables.insert(name, value);
        }
        variables
    }
}

impl<const N: usize> From<[(String, Value); N]> for Variables {
    fn from(data: [(String, Value); N]) -> Self {
        Self {
            map: HashMap::from(data),
            parent: None,
        }
    }
}
