//! Spec tree values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered map used for every spec tree node.
pub type Map = BTreeMap<String, Value>;

/// A node of a component spec tree.
///
/// Deserializes from any YAML/JSON document; variants are tried in declaration
/// order, so `1` is an `Int` and `1.5` a `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(Map),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "array",
            Value::Map(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Value::String(s) => Some(s.as_str()), _ => None }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self { Value::Map(m) => Some(m), _ => None }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self { Value::Map(m) => Some(m), _ => None }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self { Value::List(l) => Some(l.as_slice()), _ => None }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    /// Follow a dotted path through nested maps, e.g. `auth.credentials.key`.
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        let mut cur = self;
        for seg in path.split('.') {
            if seg.is_empty() { return None; }
            cur = cur.as_map()?.get(seg)?;
        }
        Some(cur)
    }

    /// Total node count; used to bound document complexity.
    pub fn node_count(&self) -> usize {
        match self {
            Value::List(l) => 1 + l.iter().map(Value::node_count).sum::<usize>(),
            Value::Map(m) => 1 + m.values().map(Value::node_count).sum::<usize>(),
            _ => 1,
        }
    }

    /// Scalar rendering used for environment variables and CLI output.
    /// Collections render as compact JSON.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::List(_) | Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.render()) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self { Value::Float(f) }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self { Value::Map(m) }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self { Value::List(v.into_iter().map(Into::into).collect()) }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match v {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            J::String(s) => Value::String(s),
            J::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            J::Object(o) => Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

/// Build a `Value::Map` from literal pairs.
#[macro_export]
macro_rules! map {
    () => { $crate::Value::Map($crate::Map::new()) };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut m = $crate::Map::new();
        $( m.insert(($k).to_string(), $crate::Value::from($v)); )+
        $crate::Value::Map(m)
    }};
}
