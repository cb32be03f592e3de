//! The stable hasher.
//!
//! Every value is serialized to a canonical byte string of the form
//! `(tag, body…)`; the job digest is a base-62 rendering of the SHA-256
//! of that string.  The encoding must never change: it is what makes a
//! job directory findable across runs, machines and releases.
//!

use sha2::{Digest, Sha256};

use crate::delayed::Delayed;
use crate::value::{repr_float, repr_str, Value};

/// Digest alphabet, 62 characters.
pub const HASH_CHARS: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Default digest length used as the job id suffix.
pub const DEFAULT_HASH_LENGTH: usize = 12;

/// Bodies longer than this collapse to their SHA-256 digest to bound the
/// representation.
const MAX_BODY_LEN: usize = 4096;

/// Canonical byte encoding of a value.
///
pub fn sis_hash(value: &Value) -> Vec<u8> {
    let mut parts: Vec<Vec<u8>> = vec![value.type_name().as_bytes().to_vec()];
    match value {
        Value::Null => {}
        Value::Bool(b) => parts.push(if *b { b"True".to_vec() } else { b"False".to_vec() }),
        Value::Int(i) => parts.push(i.to_string().into_bytes()),
        Value::Float(f) => parts.push(repr_float(*f).into_bytes()),
        Value::Str(s) => parts.push(repr_str(s).into_bytes()),
        Value::Bytes(b) => parts.push(b.clone()),
        Value::List(xs) | Value::Tuple(xs) => parts.extend(xs.iter().map(sis_hash)),
        Value::Set(xs) => {
            let mut encoded: Vec<Vec<u8>> = xs.iter().map(sis_hash).collect();
            encoded.sort();
            parts.extend(encoded);
        }
        Value::Map(pairs) => {
            let mut encoded: Vec<Vec<u8>> = pairs
                .iter()
                .map(|(k, v)| sis_hash(&Value::Tuple(vec![k.clone(), v.clone()])))
                .collect();
            encoded.sort();
            parts.extend(encoded);
        }
        // other objects: concrete type tag over their restoration state
        Value::Obj { type_name, state } => {
            return wrap(vec![
                type_name.as_bytes().to_vec(),
                sis_hash(&Value::Map(state.clone())),
            ]);
        }
        Value::FnRef { module, name } | Value::ClassRef { module, name } => {
            parts.push(sis_hash(&Value::Tuple(vec![
                Value::Str(module.clone()),
                Value::Str(name.clone()),
            ])));
        }
        // Paths and delayed expressions contribute their own encoding.
        Value::Path(p) => return p.hash_bytes(),
        Value::Delayed(d) => return hash_delayed(d),
    }

    wrap(parts)
}

/// `(a, b, c)` assembly plus the oversize collapse.
///
fn wrap(parts: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 2).sum::<usize>() + 2);
    out.push(b'(');
    for (pos, p) in parts.iter().enumerate() {
        if pos > 0 {
            out.extend_from_slice(b", ");
        }
        out.extend_from_slice(p);
    }
    out.push(b')');
    if out.len() > MAX_BODY_LEN {
        out = Sha256::digest(&out).to_vec();
    }
    out
}

/// Delayed trees hash through their leaves; operation nodes contribute
/// only their name and operand table.
///
fn hash_delayed(d: &Delayed) -> Vec<u8> {
    match d {
        Delayed::Leaf(v) => sis_hash(v),
        _ => {
            let mut pairs: Vec<Vec<u8>> = d
                .hash_state()
                .into_iter()
                .map(|(key, part)| {
                    wrap(vec![b"tuple".to_vec(), sis_hash(&Value::Str(key.to_string())), part])
                })
                .collect();
            pairs.sort();
            let mut state = vec![b"dict".to_vec()];
            state.extend(pairs);
            wrap(vec![d.node_name().as_bytes().to_vec(), wrap(state)])
        }
    }
}

pub(crate) fn hash_delayed_bytes(d: &Delayed) -> Vec<u8> {
    hash_delayed(d)
}

/// `n`-character base-62 digest of the canonical encoding.
///
pub fn short_hash(value: &Value, length: usize) -> String {
    short_hash_of_bytes(&sis_hash(value), length)
}

/// Same, over an already-encoded byte string.
///
pub fn short_hash_of_bytes(encoded: &[u8], length: usize) -> String {
    let mut digest = Sha256::digest(encoded).to_vec();
    let mut out = String::with_capacity(length);
    for _ in 0..length {
        out.push(HASH_CHARS[divmod(&mut digest, 62) as usize] as char);
    }
    out
}

/// In-place big-endian division of `num` by `by`, returning the
/// remainder.  Digits come out least significant first, matching the
/// historical digest format.
///
fn divmod(num: &mut [u8], by: u32) -> u32 {
    let mut rem: u32 = 0;
    for byte in num.iter_mut() {
        let cur = (rem << 8) | *byte as u32;
        *byte = (cur / by) as u8;
        rem = cur % by;
    }
    rem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::SisPath;

    fn h(v: Value) -> String {
        String::from_utf8(sis_hash(&v)).unwrap()
    }

    #[test]
    fn test_primitives() {
        assert_eq!("(NoneType)", h(Value::Null));
        assert_eq!("(bool, True)", h(Value::Bool(true)));
        assert_eq!("(int, 0)", h(Value::Int(0)));
        assert_eq!("(int, -1)", h(Value::Int(-1)));
        assert_eq!("(float, 2.0)", h(Value::Float(2.0)));
        assert_eq!("(str, '0')", h(Value::Str("0".into())));
        assert_eq!("(bytes, ab)", h(Value::Bytes(b"ab".to_vec())));
    }

    #[test]
    fn test_containers() {
        assert_eq!(
            "(list, (int, 1), (str, 'x'))",
            h(Value::List(vec![Value::Int(1), Value::Str("x".into())]))
        );
        assert_eq!(
            "(set, (int, -1), (int, 1), (int, 2))",
            h(Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(-1)]))
        );
        assert_eq!(
            "(dict, (tuple, (str, 'bar'), (int, -1)), (tuple, (str, 'foo'), (int, 1)))",
            h(Value::Map(vec![
                (Value::Str("foo".into()), Value::Int(1)),
                (Value::Str("bar".into()), Value::Int(-1)),
            ]))
        );
    }

    #[test]
    fn test_order_independence() {
        let a = Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let b = Value::Set(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(sis_hash(&a), sis_hash(&b));

        let d1 = Value::Map(vec![
            (Value::Str("a".into()), Value::Int(1)),
            (Value::Str("b".into()), Value::Int(2)),
        ]);
        let d2 = Value::Map(vec![
            (Value::Str("b".into()), Value::Int(2)),
            (Value::Str("a".into()), Value::Int(1)),
        ]);
        assert_eq!(sis_hash(&d1), sis_hash(&d2));
    }

    #[test]
    fn test_function_and_class() {
        assert_eq!(
            "(function, (tuple, (str, 'recipe.tools'), (str, 'b')))",
            h(Value::FnRef { module: "recipe.tools".into(), name: "b".into() })
        );
        assert_eq!(
            "(type, (tuple, (str, 'builtins'), (str, 'int')))",
            h(Value::ClassRef { module: "builtins".into(), name: "int".into() })
        );
    }

    #[test]
    fn test_object_state() {
        assert_eq!(
            "(PosixPath, (tuple, (str, '/etc/passwd')))",
            String::from_utf8(wrap(vec![
                b"PosixPath".to_vec(),
                sis_hash(&Value::Tuple(vec![Value::Str("/etc/passwd".into())])),
            ]))
            .unwrap()
        );
        assert_eq!(
            "(Point, (dict, (tuple, (str, 'x'), (int, 3))))",
            h(Value::Obj {
                type_name: "Point".into(),
                state: vec![(Value::Str("x".into()), Value::Int(3))],
            })
        );
    }

    #[test]
    fn test_path_hash_ignores_filesystem() {
        let p = SisPath::external("data/corpus.gz");
        assert_eq!(
            "(Path, (tuple, (NoneType), (str, 'data/corpus.gz')))",
            String::from_utf8(sis_hash(&Value::Path(p))).unwrap()
        );
    }

    #[test]
    fn test_oversize_body_collapses() {
        let v = Value::Bytes(vec![b'x'; 8000]);
        let encoded = sis_hash(&v);
        assert_eq!(32, encoded.len());
        assert_eq!(encoded, sis_hash(&v));
    }

    #[test]
    fn test_short_hash_shape() {
        let d = short_hash(&Value::Int(0), DEFAULT_HASH_LENGTH);
        assert_eq!(12, d.len());
        assert!(d.bytes().all(|c| HASH_CHARS.contains(&c)));
        // stable across calls
        assert_eq!(d, short_hash(&Value::Int(0), DEFAULT_HASH_LENGTH));
        // and sensitive to the value
        assert_ne!(d, short_hash(&Value::Int(1), DEFAULT_HASH_LENGTH));
    }

    #[test]
    fn test_divmod_little_endian_digits() {
        let mut n = vec![0u8, 0xFF]; // 255
        assert_eq!(255 % 62, divmod(&mut n, 62));
        assert_eq!(vec![0u8, (255 / 62) as u8], n);
    }
}
