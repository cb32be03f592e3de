//! Parsers for the unit-suffixed strings found in requirement tables.
//!
//! Memory is normalised to GiB, wall time to hours.  Bare numbers are
//! passed through, matching what recipes have always written.
//!

use nom::branch::alt;
use nom::character::complete::{char, digit1, one_of};
use nom::combinator::{all_consuming, map, map_res, recognize};
use nom::number::complete::double;
use nom::sequence::{pair, tuple};
use nom::IResult;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum UnitError {
    #[error("invalid memory value: {0}")]
    Memory(String),
    #[error("invalid time value: {0}")]
    Time(String),
}

fn mem_value(input: &str) -> IResult<&str, f64> {
    let suffixed = map(pair(double, one_of("KMGT")), |(n, tag)| match tag {
        'T' => n * 1024.0,
        'G' => n,
        'M' => n / 1024.0,
        'K' => n / 1024.0 / 1024.0,
        _ => n,
    });
    alt((suffixed, double))(input)
}

/// Takes a string with size units and converts it into a float in GiB.
/// If only a number is given it is assumed to be gibibytes already.
///
pub fn str_to_gb(m: &str) -> Result<f64, UnitError> {
    match all_consuming(mem_value)(m.trim()) {
        Ok((_, v)) => Ok(v),
        Err(_) => Err(UnitError::Memory(m.to_string())),
    }
}

fn clock_value(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(tuple((digit1, char(':'), digit1, char(':'), digit1))),
        |s: &str| -> Result<f64, std::num::ParseIntError> {
            let mut it = s.split(':');
            let h: u64 = it.next().unwrap().parse()?;
            let m: u64 = it.next().unwrap().parse()?;
            let sec: u64 = it.next().unwrap().parse()?;
            Ok((h * 3600 + m * 60 + sec) as f64 / 3600.0)
        },
    )(input)
}

/// Takes a string and converts it into a float in hours.  Accepts either
/// a plain number of hours or a `H:M:S` clock value.
///
pub fn str_to_hours(t: &str) -> Result<f64, UnitError> {
    match all_consuming(alt((clock_value, double)))(t.trim()) {
        Ok((_, v)) => Ok(v),
        Err(_) => Err(UnitError::Time(t.to_string())),
    }
}

/// `1:02:03` style rendering of a number of seconds.
///
pub fn format_time(seconds: u64) -> String {
    let (minutes, s) = (seconds / 60, seconds % 60);
    let (h, m) = (minutes / 60, minutes % 60);
    format!("{}:{:02}:{:02}", h, m, s)
}

/// Human readable byte count.
///
pub fn format_bytes(b: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    let mut result = b;
    let mut residual = 0;
    let mut count = 0;
    while result >= 1024 && count < UNITS.len() - 1 {
        residual = result % 1024;
        result /= 1024;
        count += 1;
    }
    if count < 3 {
        format!("{}{}", result, UNITS[count])
    } else {
        format!("{:.2}{}", (result * 1024 + residual) as f64 / 1024.0, UNITS[count])
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("4", 4.0)]
    #[case("4G", 4.0)]
    #[case("512M", 0.5)]
    #[case("2T", 2048.0)]
    #[case("1048576K", 1.0)]
    #[case("2.5", 2.5)]
    fn test_str_to_gb(#[case] input: &str, #[case] val: f64) {
        assert_eq!(val, str_to_gb(input).unwrap());
    }

    #[test]
    fn test_str_to_gb_invalid() {
        assert!(str_to_gb("lots").is_err());
        assert!(str_to_gb("4X").is_err());
    }

    #[rstest]
    #[case("1", 1.0)]
    #[case("0.5", 0.5)]
    #[case("2:30:00", 2.5)]
    #[case("0:00:36", 0.01)]
    fn test_str_to_hours(#[case] input: &str, #[case] val: f64) {
        assert!((str_to_hours(input).unwrap() - val).abs() < 1e-9);
    }

    #[test]
    fn test_format_time() {
        assert_eq!("1:02:03", format_time(3723));
        assert_eq!("0:00:00", format_time(0));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!("100B", format_bytes(100));
        assert_eq!("2kB", format_bytes(2048));
        assert_eq!("4.00GB", format_bytes(4 * 1024 * 1024 * 1024));
    }
}
