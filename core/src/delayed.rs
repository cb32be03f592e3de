//! Deferred arithmetic and formatting over paths and variables.
//!
//! Recipes compose expressions long before the producing jobs have run;
//! each composed operation is one node of a small tree, and evaluation
//! forces all leaves to their concrete values.  Hashing a delayed tree
//! hashes its leaves only, so identical expressions produce identical
//! digests.  Function nodes carry a named function, never a closure.
//!

use crate::error::{DelayedError, VariableError};
use crate::hash::{hash_delayed_bytes, sis_hash};
use crate::literal::repr_value;
use crate::paths::{PathKind, SisPath};
use crate::value::{repr_float, Value};

type DelayedFn = fn(Value) -> Result<Value, DelayedError>;

/// One node of a deferred expression.
///
#[derive(Clone, Debug, PartialEq)]
pub enum Delayed {
    Leaf(Value),
    Add(Box<Delayed>, Box<Delayed>),
    Sub(Box<Delayed>, Box<Delayed>),
    Mul(Box<Delayed>, Box<Delayed>),
    Mod(Box<Delayed>, Box<Delayed>),
    FloorDiv(Box<Delayed>, Box<Delayed>),
    Index(Box<Delayed>, i64),
    /// Render the forced value into a single-placeholder template.
    Format { inner: Box<Delayed>, template: String },
    Replace { inner: Box<Delayed>, from: String, to: String },
    /// Apply a named function to the forced value.
    Function { inner: Box<Delayed>, module: String, name: String, f: DelayedFn },
    /// Short-circuit to a backup value while the underlying variable is
    /// still unset.
    Fallback { inner: Box<Delayed>, backup: Value },
}

impl Delayed {
    pub fn new(v: impl Into<Value>) -> Self {
        Delayed::Leaf(v.into())
    }

    pub fn add(self, other: impl Into<Delayed>) -> Self {
        Delayed::Add(Box::new(self), Box::new(other.into()))
    }

    pub fn sub(self, other: impl Into<Delayed>) -> Self {
        Delayed::Sub(Box::new(self), Box::new(other.into()))
    }

    pub fn mul(self, other: impl Into<Delayed>) -> Self {
        Delayed::Mul(Box::new(self), Box::new(other.into()))
    }

    pub fn modulo(self, other: impl Into<Delayed>) -> Self {
        Delayed::Mod(Box::new(self), Box::new(other.into()))
    }

    pub fn floordiv(self, other: impl Into<Delayed>) -> Self {
        Delayed::FloorDiv(Box::new(self), Box::new(other.into()))
    }

    pub fn index(self, i: i64) -> Self {
        Delayed::Index(Box::new(self), i)
    }

    pub fn format(self, template: &str) -> Self {
        Delayed::Format { inner: Box::new(self), template: template.to_string() }
    }

    pub fn replace(self, from: &str, to: &str) -> Self {
        Delayed::Replace {
            inner: Box::new(self),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn function(self, module: &str, name: &str, f: DelayedFn) -> Self {
        Delayed::Function {
            inner: Box::new(self),
            module: module.to_string(),
            name: name.to_string(),
            f,
        }
    }

    pub fn fallback(self, backup: impl Into<Value>) -> Self {
        Delayed::Fallback { inner: Box::new(self), backup: backup.into() }
    }

    /// Force the expression to its concrete value.
    ///
    pub fn get(&self) -> Result<Value, DelayedError> {
        match self {
            Delayed::Leaf(v) => force(v),
            Delayed::Add(a, b) => binop("+", a.get()?, b.get()?),
            Delayed::Sub(a, b) => binop("-", a.get()?, b.get()?),
            Delayed::Mul(a, b) => binop("*", a.get()?, b.get()?),
            Delayed::Mod(a, b) => binop("%", a.get()?, b.get()?),
            Delayed::FloorDiv(a, b) => binop("//", a.get()?, b.get()?),
            Delayed::Index(a, i) => index(a.get()?, *i),
            Delayed::Format { inner, template } => {
                Ok(Value::Str(render_template(template, &inner.get()?)?))
            }
            Delayed::Replace { inner, from, to } => match inner.get()? {
                Value::Str(s) => Ok(Value::Str(s.replace(from.as_str(), to))),
                v => Err(DelayedError::BadOperands {
                    op: "replace",
                    lhs: v.type_name(),
                    rhs: "str",
                }),
            },
            Delayed::Function { inner, f, .. } => f(inner.get()?),
            Delayed::Fallback { inner, backup } => match inner.get() {
                Err(DelayedError::Variable(VariableError::NotSet(_))) => Ok(backup.clone()),
                other => other,
            },
        }
    }

    pub fn extract_paths(&self, out: &mut Vec<SisPath>) {
        match self {
            Delayed::Leaf(v) => v.extract_paths(out),
            Delayed::Add(a, b)
            | Delayed::Sub(a, b)
            | Delayed::Mul(a, b)
            | Delayed::Mod(a, b)
            | Delayed::FloorDiv(a, b) => {
                a.extract_paths(out);
                b.extract_paths(out);
            }
            Delayed::Index(a, _) => a.extract_paths(out),
            Delayed::Format { inner, .. }
            | Delayed::Replace { inner, .. }
            | Delayed::Function { inner, .. }
            | Delayed::Fallback { inner, .. } => inner.extract_paths(out),
        }
    }

    /// Node tag for the hash encoding.
    pub(crate) fn node_name(&self) -> &'static str {
        match self {
            Delayed::Leaf(_) => "Delayed",
            Delayed::Add(..) => "DelayedAdd",
            Delayed::Sub(..) => "DelayedSub",
            Delayed::Mul(..) => "DelayedMul",
            Delayed::Mod(..) => "DelayedMod",
            Delayed::FloorDiv(..) => "DelayedFloorDiv",
            Delayed::Index(..) => "DelayedGetItem",
            Delayed::Format { .. } => "DelayedFormat",
            Delayed::Replace { .. } => "DelayedReplace",
            Delayed::Function { .. } => "DelayedFunction",
            Delayed::Fallback { .. } => "DelayedFallback",
        }
    }

    /// Operand table contributing to the hash encoding.
    pub(crate) fn hash_state(&self) -> Vec<(&'static str, Vec<u8>)> {
        match self {
            Delayed::Leaf(v) => vec![("a", sis_hash(v))],
            Delayed::Add(a, b)
            | Delayed::Sub(a, b)
            | Delayed::Mul(a, b)
            | Delayed::Mod(a, b)
            | Delayed::FloorDiv(a, b) => {
                vec![("a", hash_delayed_bytes(a)), ("b", hash_delayed_bytes(b))]
            }
            Delayed::Index(a, i) => {
                vec![("a", hash_delayed_bytes(a)), ("b", sis_hash(&Value::Int(*i)))]
            }
            Delayed::Format { inner, template } => vec![
                ("string", hash_delayed_bytes(inner)),
                ("args", sis_hash(&Value::Str(template.clone()))),
            ],
            Delayed::Replace { inner, from, to } => vec![
                ("string", hash_delayed_bytes(inner)),
                ("args", sis_hash(&Value::Tuple(vec![
                    Value::Str(from.clone()),
                    Value::Str(to.clone()),
                ]))),
            ],
            Delayed::Function { inner, module, name, .. } => vec![
                ("string", hash_delayed_bytes(inner)),
                (
                    "func",
                    sis_hash(&Value::FnRef { module: module.clone(), name: name.clone() }),
                ),
            ],
            Delayed::Fallback { inner, backup } => {
                vec![("a", hash_delayed_bytes(inner)), ("b", sis_hash(backup))]
            }
        }
    }
}

impl From<Value> for Delayed {
    fn from(v: Value) -> Self {
        Delayed::Leaf(v)
    }
}

impl From<i64> for Delayed {
    fn from(v: i64) -> Self {
        Delayed::Leaf(Value::Int(v))
    }
}

impl From<&str> for Delayed {
    fn from(v: &str) -> Self {
        Delayed::Leaf(Value::Str(v.to_string()))
    }
}

impl From<SisPath> for Delayed {
    fn from(p: SisPath) -> Self {
        Delayed::Leaf(Value::Path(p))
    }
}

/// Force a leaf: paths become their on-disk location, variables their
/// stored value, nested delayed values recurse.
///
fn force(v: &Value) -> Result<Value, DelayedError> {
    match v {
        Value::Path(p) => match p.kind() {
            PathKind::Variable { .. } => Ok(p.read_value()?),
            PathKind::Plain => Ok(Value::Str(p.get_cached_path().to_string_lossy().into_owned())),
        },
        Value::Delayed(d) => d.get(),
        other => Ok(other.clone()),
    }
}

fn binop(op: &'static str, a: Value, b: Value) -> Result<Value, DelayedError> {
    use Value::*;
    let bad = |a: &Value, b: &Value| DelayedError::BadOperands {
        op,
        lhs: a.type_name(),
        rhs: b.type_name(),
    };
    match op {
        "+" => match (&a, &b) {
            (Int(x), Int(y)) => Ok(Int(x + y)),
            (Str(x), Str(y)) => Ok(Str(format!("{x}{y}"))),
            _ => numeric(op, &a, &b).ok_or_else(|| bad(&a, &b)),
        },
        "-" => match (&a, &b) {
            (Int(x), Int(y)) => Ok(Int(x - y)),
            _ => numeric(op, &a, &b).ok_or_else(|| bad(&a, &b)),
        },
        "*" => match (&a, &b) {
            (Int(x), Int(y)) => Ok(Int(x * y)),
            (Str(x), Int(y)) => Ok(Str(x.repeat((*y).max(0) as usize))),
            _ => numeric(op, &a, &b).ok_or_else(|| bad(&a, &b)),
        },
        "%" => match (&a, &b) {
            (Int(x), Int(y)) if *y != 0 => Ok(Int(x.rem_euclid(*y))),
            (Str(x), y) => Ok(Str(render_template(x, y)?)),
            _ => numeric(op, &a, &b).ok_or_else(|| bad(&a, &b)),
        },
        "//" => match (&a, &b) {
            (Int(x), Int(y)) if *y != 0 => Ok(Int(x.div_euclid(*y))),
            _ => numeric(op, &a, &b).ok_or_else(|| bad(&a, &b)),
        },
        _ => Err(bad(&a, &b)),
    }
}

fn numeric(op: &str, a: &Value, b: &Value) -> Option<Value> {
    let x = as_f64(a)?;
    let y = as_f64(b)?;
    let r = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "%" => ((x % y) + y) % y,
        "//" => (x / y).floor(),
        _ => return None,
    };
    Some(Value::Float(r))
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn index(v: Value, i: i64) -> Result<Value, DelayedError> {
    let wrap = |len: usize| -> Result<usize, DelayedError> {
        let idx = if i < 0 { i + len as i64 } else { i };
        if idx < 0 || idx as usize >= len {
            Err(DelayedError::IndexOutOfRange(i))
        } else {
            Ok(idx as usize)
        }
    };
    match v {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = wrap(chars.len())?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        Value::List(xs) | Value::Tuple(xs) => {
            let idx = wrap(xs.len())?;
            Ok(xs[idx].clone())
        }
        other => Err(DelayedError::BadOperands { op: "[]", lhs: other.type_name(), rhs: "int" }),
    }
}

/// Render a value into a single `{…}` placeholder.  Supports the common
/// format specs recipes use: `{}`, `{:04d}`, `{:05.1f}`, `{:s}`.
///
pub fn render_template(template: &str, value: &Value) -> Result<String, DelayedError> {
    let open = template
        .find('{')
        .ok_or_else(|| DelayedError::BadFormat(template.to_string()))?;
    let close = template[open..]
        .find('}')
        .map(|c| open + c)
        .ok_or_else(|| DelayedError::BadFormat(template.to_string()))?;
    let spec = template[open + 1..close].trim_start_matches(':');
    let rendered = apply_spec(spec, value)?;
    Ok(format!("{}{}{}", &template[..open], rendered, &template[close + 1..]))
}

fn apply_spec(spec: &str, value: &Value) -> Result<String, DelayedError> {
    if spec.is_empty() {
        return Ok(py_str(value));
    }
    let bad = || DelayedError::BadFormat(spec.to_string());

    let mut rest = spec;
    let zero_pad = rest.starts_with('0');
    if zero_pad {
        rest = &rest[1..];
    }
    let width_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let width: usize = if width_end > 0 { rest[..width_end].parse().map_err(|_| bad())? } else { 0 };
    rest = &rest[width_end..];
    let precision = if let Some(stripped) = rest.strip_prefix('.') {
        let p_end = stripped.find(|c: char| !c.is_ascii_digit()).unwrap_or(stripped.len());
        let p: usize = stripped[..p_end].parse().map_err(|_| bad())?;
        rest = &stripped[p_end..];
        Some(p)
    } else {
        None
    };

    let body = match rest {
        "f" => {
            let f = as_f64(value).ok_or_else(bad)?;
            format!("{:.*}", precision.unwrap_or(6), f)
        }
        "d" => match value {
            Value::Int(i) => i.to_string(),
            _ => return Err(bad()),
        },
        "s" | "" => py_str(value),
        _ => return Err(bad()),
    };

    Ok(pad(body, width, zero_pad))
}

fn pad(s: String, width: usize, zero: bool) -> String {
    if s.len() >= width {
        return s;
    }
    let fill = if zero { '0' } else { ' ' };
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) if zero => ("-", rest.to_string()),
        _ => ("", s),
    };
    let mut out = String::from(sign);
    for _ in 0..width - sign.len() - digits.len() {
        out.push(fill);
    }
    out.push_str(&digits);
    out
}

/// Python-style `str()` of a value.
///
pub fn py_str(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => repr_float(*f),
        Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        Value::Null => "None".to_string(),
        other => repr_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::short_hash;

    #[test]
    fn test_leaf_hash_equals_plain_hash() {
        let a = Delayed::new(3_i64);
        assert_eq!(
            short_hash(&Value::Delayed(Box::new(a)), 12),
            short_hash(&Value::Int(3), 12)
        );
    }

    #[test]
    fn test_composite_hash_differs_from_eager() {
        let delayed = Value::Delayed(Box::new(Delayed::new("foo").add(".bar")));
        let eager = Value::Str("foo.bar".to_string());
        assert_ne!(short_hash(&delayed, 12), short_hash(&eager, 12));
    }

    #[test]
    fn test_int_arithmetic() {
        let a = Delayed::new(3_i64);
        assert_eq!(Value::Int(7), a.clone().add(4).get().unwrap());
        assert_eq!(Value::Int(-1), a.clone().sub(4).get().unwrap());
        assert_eq!(Value::Int(12), a.clone().mul(4).get().unwrap());
        assert_eq!(Value::Int(1), a.clone().modulo(2).get().unwrap());
        assert_eq!(Value::Int(1), a.floordiv(2).get().unwrap());
    }

    #[test]
    fn test_string_ops() {
        let a = Delayed::new("foo");
        assert_eq!(Value::Str("foobar".into()), a.clone().add("bar").get().unwrap());
        assert_eq!(Value::Str("foofoofoo".into()), a.clone().mul(3).get().unwrap());
        assert_eq!(Value::Str("o".into()), a.index(1).get().unwrap());
        let b = Delayed::new("foobbb foo").replace("bbb", "bar");
        assert_eq!(Value::Str("foobar foo".into()), b.get().unwrap());
    }

    #[test]
    fn test_format() {
        assert_eq!(
            Value::Str("foo0003 foo".into()),
            Delayed::new(3_i64).format("foo{:04d} foo").get().unwrap()
        );
        assert_eq!(
            Value::Str("042.0".into()),
            Delayed::new(42_i64).format("{:05.1f}").get().unwrap()
        );
        assert_eq!(
            Value::Str("x=3".into()),
            Delayed::new(3_i64).format("x={}").get().unwrap()
        );
    }

    #[test]
    fn test_function_leaf() {
        fn double(v: Value) -> Result<Value, DelayedError> {
            match v {
                Value::Int(i) => Ok(Value::Int(i * 2)),
                other => Err(DelayedError::BadOperands {
                    op: "double",
                    lhs: other.type_name(),
                    rhs: "int",
                }),
            }
        }
        let d = Delayed::new(21_i64).function("recipe.tools", "double", double);
        assert_eq!(Value::Int(42), d.get().unwrap());
    }

    #[test]
    fn test_negative_modulo_follows_divisor() {
        assert_eq!(Value::Int(1), Delayed::new(-3_i64).modulo(2).get().unwrap());
    }

    #[test]
    fn test_variable_chain_with_fallback() {
        use crate::paths::Creator;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a");
        let var = SisPath::with_kind(
            Creator::None,
            file.to_str().unwrap(),
            PathKind::Variable { pickled: false, backup: None },
        );
        let expr = var
            .delayed()
            .add(4)
            .modulo(2)
            .mul(42)
            .format("{:05.1f}")
            .fallback(0);

        // unset variable: the fallback short-circuits
        assert_eq!(Value::Int(0), expr.get().unwrap());

        var.write_value(&Value::Int(3)).unwrap();
        assert_eq!(Value::Str("042.0".into()), expr.get().unwrap());
    }
}
