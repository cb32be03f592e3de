//! Repr-style literal codec for values.
//!
//! Text-mode variables are stored as a human-readable literal and read
//! back by this parser.  Unlike JSON the format round-trips `nan` and
//! `inf`, which show up routinely in score variables.
//!

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, tag};
use nom::character::complete::{char, digit1, multispace0, none_of, one_of};
use nom::combinator::{all_consuming, map, opt, recognize, value as nom_value, verify};
use nom::multi::separated_list0;
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use nom::IResult;

use crate::value::{repr_float, repr_str, Value};

/// Python-style repr of a value.
///
pub fn repr_value(v: &Value) -> String {
    match v {
        Value::Null => "None".to_string(),
        Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => repr_float(*f),
        Value::Str(s) => repr_str(s),
        Value::Bytes(b) => format!("b{}", repr_str(&String::from_utf8_lossy(b))),
        Value::List(xs) => {
            format!("[{}]", xs.iter().map(repr_value).collect::<Vec<_>>().join(", "))
        }
        Value::Tuple(xs) => match xs.len() {
            1 => format!("({},)", repr_value(&xs[0])),
            _ => format!("({})", xs.iter().map(repr_value).collect::<Vec<_>>().join(", ")),
        },
        Value::Set(xs) => {
            if xs.is_empty() {
                "set()".to_string()
            } else {
                format!("{{{}}}", xs.iter().map(repr_value).collect::<Vec<_>>().join(", "))
            }
        }
        Value::Map(ps) => format!(
            "{{{}}}",
            ps.iter()
                .map(|(k, v)| format!("{}: {}", repr_value(k), repr_value(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::FnRef { module, name } | Value::ClassRef { module, name } => {
            format!("<{module}.{name}>")
        }
        Value::Obj { type_name, .. } => format!("<{type_name}>"),
        Value::Path(p) => format!("<Path {}>", p.rel_name()),
        Value::Delayed(_) => "<Delayed>".to_string(),
    }
}

/// Parse a literal back into a value.
///
pub fn parse_literal(input: &str) -> Result<Value, String> {
    match all_consuming(delimited(multispace0, literal, multispace0))(input) {
        Ok((_, v)) => Ok(v),
        Err(e) => Err(e.to_string()),
    }
}

fn literal(input: &str) -> IResult<&str, Value> {
    alt((
        nom_value(Value::Null, tag("None")),
        nom_value(Value::Bool(true), tag("True")),
        nom_value(Value::Bool(false), tag("False")),
        special_float,
        number,
        map(string, Value::Str),
        bytes_literal,
        list,
        tuple_literal,
        empty_set,
        map_or_set,
    ))(input)
}

fn special_float(input: &str) -> IResult<&str, Value> {
    alt((
        nom_value(Value::Float(f64::NAN), tag("nan")),
        nom_value(Value::Float(f64::NEG_INFINITY), tag("-inf")),
        nom_value(Value::Float(f64::INFINITY), tag("inf")),
    ))(input)
}

fn number(input: &str) -> IResult<&str, Value> {
    let (rest, text) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(preceded(char('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;
    let v = if text.contains('.') || text.contains('e') || text.contains('E') {
        Value::Float(text.parse().unwrap_or(f64::NAN))
    } else {
        match text.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(text.parse().unwrap_or(f64::NAN)),
        }
    };
    Ok((rest, v))
}

fn escapes(input: &str) -> IResult<&str, char> {
    alt((
        nom_value('\\', char('\\')),
        nom_value('\'', char('\'')),
        nom_value('"', char('"')),
        nom_value('\n', char('n')),
        nom_value('\t', char('t')),
        nom_value('\r', char('r')),
    ))(input)
}

fn single_quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('\''),
        map(opt(escaped_transform(none_of("\\'"), '\\', escapes)), Option::unwrap_or_default),
        char('\''),
    )(input)
}

fn double_quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(opt(escaped_transform(none_of("\\\""), '\\', escapes)), Option::unwrap_or_default),
        char('"'),
    )(input)
}

fn string(input: &str) -> IResult<&str, String> {
    alt((single_quoted, double_quoted))(input)
}

fn bytes_literal(input: &str) -> IResult<&str, Value> {
    map(preceded(char('b'), string), |s| Value::Bytes(s.into_bytes()))(input)
}

fn comma(input: &str) -> IResult<&str, ()> {
    nom_value((), tuple((multispace0, char(','), multispace0)))(input)
}

fn items(input: &str) -> IResult<&str, Vec<Value>> {
    terminated(separated_list0(comma, literal), opt(pair(multispace0, char(','))))(input)
}

fn list(input: &str) -> IResult<&str, Value> {
    map(
        delimited(
            pair(char('['), multispace0),
            items,
            pair(multispace0, char(']')),
        ),
        Value::List,
    )(input)
}

fn tuple_literal(input: &str) -> IResult<&str, Value> {
    map(
        delimited(
            pair(char('('), multispace0),
            items,
            pair(multispace0, char(')')),
        ),
        Value::Tuple,
    )(input)
}

fn empty_set(input: &str) -> IResult<&str, Value> {
    nom_value(Value::Set(vec![]), tag("set()"))(input)
}

/// `{…}` is a dict when its first entry carries a `:`, a set otherwise;
/// the empty braces are an empty dict, as always.
///
fn map_or_set(input: &str) -> IResult<&str, Value> {
    let entry = separated_pair(
        literal,
        tuple((multispace0, char(':'), multispace0)),
        literal,
    );
    let dict = map(
        delimited(
            pair(char('{'), multispace0),
            separated_list0(comma, entry),
            pair(multispace0, char('}')),
        ),
        Value::Map,
    );
    let set = map(
        delimited(
            pair(char('{'), multispace0),
            verify(items, |xs: &Vec<Value>| !xs.is_empty()),
            pair(multispace0, char('}')),
        ),
        Value::Set,
    );
    alt((dict, set))(input)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn roundtrip(v: Value) {
        let text = repr_value(&v);
        let back = parse_literal(&text).unwrap();
        assert_eq!(v, back, "through {text:?}");
    }

    #[rstest]
    #[case(Value::Null)]
    #[case(Value::Bool(true))]
    #[case(Value::Int(-42))]
    #[case(Value::Float(2.5))]
    #[case(Value::Float(f64::INFINITY))]
    #[case(Value::Float(f64::NEG_INFINITY))]
    #[case(Value::Str("hello 'quoted' world".into()))]
    #[case(Value::List(vec![Value::Int(1), Value::Str("x".into())]))]
    #[case(Value::Tuple(vec![Value::Int(1)]))]
    #[case(Value::Set(vec![Value::Int(1), Value::Int(2)]))]
    #[case(Value::Map(vec![(Value::Str("a".into()), Value::Float(0.5))]))]
    fn test_roundtrip(#[case] v: Value) {
        roundtrip(v);
    }

    #[test]
    fn test_nan_roundtrips() {
        let text = repr_value(&Value::Float(f64::NAN));
        assert_eq!("nan", text);
        match parse_literal(&text).unwrap() {
            Value::Float(f) => assert!(f.is_nan()),
            v => panic!("expected float, got {v:?}"),
        }
    }

    #[test]
    fn test_nested() {
        let v = parse_literal("{'scores': [1, 2.5, nan], 'ok': True}").unwrap();
        match v {
            Value::Map(ps) => {
                assert_eq!(2, ps.len());
                assert_eq!(Value::Str("scores".into()), ps[0].0);
            }
            v => panic!("expected map, got {v:?}"),
        }
    }

    #[test]
    fn test_trailing_comma_tuple() {
        assert_eq!(
            Value::Tuple(vec![Value::Int(1)]),
            parse_literal("(1,)").unwrap()
        );
    }

    #[test]
    fn test_empty_collections() {
        assert_eq!(Value::Map(vec![]), parse_literal("{}").unwrap());
        assert_eq!(Value::Set(vec![]), parse_literal("set()").unwrap());
        assert_eq!(Value::List(vec![]), parse_literal("[]").unwrap());
    }
}
