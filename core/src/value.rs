//! The tagged value model for job construction arguments.
//!
//! Kwargs records are trees of [`Value`].  The enumeration is exactly the
//! repertoire the stable hasher supports; anything a recipe wants hashed
//! has to be expressed in it.  Paths and delayed expressions are embedded
//! as their own variants and hook their own hash contribution.
//!

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::delayed::Delayed;
use crate::paths::{Creator, PathKind, SisPath};

/// Construction arguments of a job, keyed by argument name.
pub type Kwargs = BTreeMap<String, Value>;

/// A hashable "any value".
///
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Unordered collection, hashed order-independently.
    Set(Vec<Value>),
    /// Mapping, hashed order-independently over its pairs.
    Map(Vec<(Value, Value)>),
    /// A named function, `(module, qualified name)`.  Closures have no
    /// stable name and can not be represented.
    FnRef { module: String, name: String },
    /// A named type.
    ClassRef { module: String, name: String },
    /// Any other object: its type name plus constructor-restoration state.
    Obj { type_name: String, state: Vec<(Value, Value)> },
    /// A file produced by a job (or an external input).
    Path(SisPath),
    /// A deferred computation over paths and variables.
    Delayed(Box<Delayed>),
}

impl Value {
    /// Short type label used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Map(_) => "dict",
            Value::FnRef { .. } => "function",
            Value::ClassRef { .. } => "type",
            Value::Obj { .. } => "object",
            Value::Path(_) => "Path",
            Value::Delayed(_) => "Delayed",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Collect every path reachable from this value, recursing into
    /// containers, object state and delayed leaves.
    ///
    pub fn extract_paths(&self, out: &mut Vec<SisPath>) {
        match self {
            Value::Path(p) => {
                if !out.contains(p) {
                    out.push(p.clone());
                }
            }
            Value::List(xs) | Value::Tuple(xs) | Value::Set(xs) => {
                xs.iter().for_each(|x| x.extract_paths(out))
            }
            Value::Map(pairs) | Value::Obj { state: pairs, .. } => pairs.iter().for_each(|(k, v)| {
                k.extract_paths(out);
                v.extract_paths(out);
            }),
            Value::Delayed(d) => d.extract_paths(out),
            _ => {}
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<SisPath> for Value {
    fn from(v: SisPath) -> Self {
        Value::Path(v)
    }
}

/// Python-style repr of a string, single quoted.
///
pub(crate) fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Python-style repr of a float: always keeps a fractional part, and
/// spells the specials `nan`, `inf` and `-inf`.
///
pub(crate) fn repr_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        let s = format!("{}", f);
        if s.contains('.') || s.contains('e') || s.contains('E') {
            s
        } else {
            format!("{}.0", s)
        }
    }
}

// ----- serialized form

/// Serializable mirror of [`Value`]; paths are flattened to their creator
/// id so that `job.save` files stay self-contained.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRepr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ValueRepr>),
    Tuple(Vec<ValueRepr>),
    Set(Vec<ValueRepr>),
    Map(Vec<(ValueRepr, ValueRepr)>),
    FnRef { module: String, name: String },
    ClassRef { module: String, name: String },
    Obj { type_name: String, state: Vec<(ValueRepr, ValueRepr)> },
    Path(PathRepr),
}

/// Serialized path: the creator collapses to its job id.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PathRepr {
    pub creator: Option<String>,
    pub path: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub hash_overwrite: Option<(Option<String>, String)>,
    #[serde(default)]
    pub variable: Option<VariableRepr>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VariableRepr {
    pub pickled: bool,
}

impl ValueRepr {
    /// Build the serialized form.  Delayed expressions collapse to their
    /// forced value when possible and are rejected otherwise; in practice
    /// kwargs are plain data plus paths by the time a job is saved.
    ///
    pub fn from_value(v: &Value) -> ValueRepr {
        match v {
            Value::Null => ValueRepr::Null,
            Value::Bool(b) => ValueRepr::Bool(*b),
            Value::Int(i) => ValueRepr::Int(*i),
            Value::Float(f) => ValueRepr::Float(*f),
            Value::Str(s) => ValueRepr::Str(s.clone()),
            Value::Bytes(b) => ValueRepr::Bytes(b.clone()),
            Value::List(xs) => ValueRepr::List(xs.iter().map(Self::from_value).collect()),
            Value::Tuple(xs) => ValueRepr::Tuple(xs.iter().map(Self::from_value).collect()),
            Value::Set(xs) => ValueRepr::Set(xs.iter().map(Self::from_value).collect()),
            Value::Map(ps) => ValueRepr::Map(
                ps.iter().map(|(k, v)| (Self::from_value(k), Self::from_value(v))).collect(),
            ),
            Value::FnRef { module, name } => {
                ValueRepr::FnRef { module: module.clone(), name: name.clone() }
            }
            Value::ClassRef { module, name } => {
                ValueRepr::ClassRef { module: module.clone(), name: name.clone() }
            }
            Value::Obj { type_name, state } => ValueRepr::Obj {
                type_name: type_name.clone(),
                state: state
                    .iter()
                    .map(|(k, v)| (Self::from_value(k), Self::from_value(v)))
                    .collect(),
            },
            Value::Path(p) => ValueRepr::Path(PathRepr {
                creator: p.creator_id(),
                path: p.rel_name().to_string(),
                cached: p.is_cached(),
                hash_overwrite: p.hash_overwrite_ref().cloned(),
                variable: match p.kind() {
                    PathKind::Plain => None,
                    PathKind::Variable { pickled, .. } => {
                        Some(VariableRepr { pickled: *pickled })
                    }
                },
            }),
            Value::Delayed(d) => Self::from_value(&Value::Str(format!("{d:?}"))),
        }
    }

    /// Rebuild a value; path creators come back as detached references
    /// rooted below the given work directory.
    ///
    pub fn into_value(self, work_dir: &std::path::Path) -> Value {
        match self {
            ValueRepr::Null => Value::Null,
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Int(i) => Value::Int(i),
            ValueRepr::Float(f) => Value::Float(f),
            ValueRepr::Str(s) => Value::Str(s),
            ValueRepr::Bytes(b) => Value::Bytes(b),
            ValueRepr::List(xs) => {
                Value::List(xs.into_iter().map(|x| x.into_value(work_dir)).collect())
            }
            ValueRepr::Tuple(xs) => {
                Value::Tuple(xs.into_iter().map(|x| x.into_value(work_dir)).collect())
            }
            ValueRepr::Set(xs) => {
                Value::Set(xs.into_iter().map(|x| x.into_value(work_dir)).collect())
            }
            ValueRepr::Map(ps) => Value::Map(
                ps.into_iter()
                    .map(|(k, v)| (k.into_value(work_dir), v.into_value(work_dir)))
                    .collect(),
            ),
            ValueRepr::FnRef { module, name } => Value::FnRef { module, name },
            ValueRepr::ClassRef { module, name } => Value::ClassRef { module, name },
            ValueRepr::Obj { type_name, state } => Value::Obj {
                type_name,
                state: state
                    .into_iter()
                    .map(|(k, v)| (k.into_value(work_dir), v.into_value(work_dir)))
                    .collect(),
            },
            ValueRepr::Path(p) => {
                let creator = match p.creator {
                    None => Creator::None,
                    Some(id) => {
                        let dir = work_dir.join(&id);
                        Creator::Detached { id, dir }
                    }
                };
                let kind = match p.variable {
                    None => PathKind::Plain,
                    Some(v) => PathKind::Variable { pickled: v.pickled, backup: None },
                };
                let mut path = SisPath::with_kind(creator, &p.path, kind);
                if p.cached {
                    path = path.cached();
                }
                if let Some(h) = p.hash_overwrite {
                    path = path.hash_overwrite(h.0, h.1);
                }
                Value::Path(path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr_str() {
        assert_eq!("'0'", repr_str("0"));
        assert_eq!(r"'don\'t'", repr_str("don't"));
        assert_eq!(r"'a\nb'", repr_str("a\nb"));
    }

    #[test]
    fn test_repr_float() {
        assert_eq!("2.0", repr_float(2.0));
        assert_eq!("3.8", repr_float(3.8));
        assert_eq!("nan", repr_float(f64::NAN));
        assert_eq!("inf", repr_float(f64::INFINITY));
        assert_eq!("-inf", repr_float(f64::NEG_INFINITY));
    }

    #[test]
    fn test_extract_paths_nested() {
        let p = SisPath::external("corpus.txt");
        let v = Value::Map(vec![(
            Value::Str("corpus".into()),
            Value::List(vec![Value::Int(1), Value::Path(p.clone())]),
        )]);
        let mut out = Vec::new();
        v.extract_paths(&mut out);
        assert_eq!(vec![p], out);
    }
}
