//! Number codec - exact fixed-point decimal parsing
//!
//! Measurements are stored as `mantissa × 10^scale` so the database never sees
//! binary floating-point drift. Two decimal parsers exist:
//!
//! - `parse_decimal` (canonical): validates the text as an `f64`, then takes the
//!   digits of the shortest round-trip decimal expansion of that double, keeping
//!   at most 9 fractional digits (anything smaller than 1e-9 is truncated).
//! - `parse_legacy_decimal` / `parse_legacy_decimal_truncated`: string-direct
//!   parser with 32-bit mantissa and 8-bit scale limits, kept for deployments
//!   whose consumers still expect that range.
//!
//! Exactly one of them is active per process, selected through `DecimalCodec`.

use std::str::FromStr;

/// Maximum number of fractional digits kept by the canonical codec
pub const MAX_SCALE: usize = 9;

/// Comparison tolerance between a decimal and its reconstructed value
pub const EPSILON: f64 = 1e-9;

/// Exact decimal value: `mantissa × 10^scale`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Number {
    pub mantissa: i64,
    pub scale: i16,
}

impl Number {
    pub fn new(mantissa: i64, scale: i16) -> Self {
        Self { mantissa, scale }
    }

    /// Floating-point value of this number
    ///
    /// One correctly rounded decimal-to-binary conversion: a mantissa above
    /// 2^53 must not be rounded before the scale is applied.
    pub fn to_f64(&self) -> f64 {
        format!("{}e{}", self.mantissa, self.scale)
            .parse()
            .unwrap_or(f64::NAN)
    }

    /// True when both numbers reconstruct to values closer than `EPSILON`
    pub fn approx_eq(&self, other: &Number) -> bool {
        (self.to_f64() - other.to_f64()).abs() < EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Empty,
    Invalid(String),
    NotFinite(String),
    Overflow(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Empty => write!(f, "empty value"),
            CodecError::Invalid(s) => write!(f, "'{}' is not a number", s),
            CodecError::NotFinite(s) => write!(f, "'{}' is not a finite number", s),
            CodecError::Overflow(s) => write!(f, "'{}' is out of the storable range", s),
        }
    }
}

impl std::error::Error for CodecError {}

/// Strict base-10 `i64` parser
///
/// No surrounding whitespace, no trailing characters, no silent saturation.
pub fn parse_int64(text: &str) -> Result<i64, CodecError> {
    if text.is_empty() {
        return Err(CodecError::Empty);
    }
    text.parse::<i64>().map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow => {
            CodecError::Overflow(text.to_string())
        }
        _ => CodecError::Invalid(text.to_string()),
    })
}

fn parse_finite_f64(text: &str) -> Result<f64, CodecError> {
    if text.is_empty() {
        return Err(CodecError::Empty);
    }
    let value = text
        .parse::<f64>()
        .map_err(|_| CodecError::Invalid(text.to_string()))?;
    if !value.is_finite() {
        return Err(CodecError::NotFinite(text.to_string()));
    }
    Ok(value)
}

/// Canonical decimal parser
///
/// ```
/// use metric_store::codec::{parse_decimal, Number};
/// assert_eq!(parse_decimal("12.835").unwrap(), Number::new(12835, -3));
/// ```
pub fn parse_decimal(text: &str) -> Result<Number, CodecError> {
    let value = parse_finite_f64(text)?;
    number_from_f64(value).map_err(|_| CodecError::Overflow(text.to_string()))
}

/// Convert a finite double into a `Number`
///
/// Rust's `Display` for `f64` prints the shortest decimal string that parses
/// back to the same double and never switches to exponent notation, so the
/// digits below are exactly the decimal the producer most likely wrote.
pub fn number_from_f64(value: f64) -> Result<Number, CodecError> {
    if !value.is_finite() {
        return Err(CodecError::NotFinite(value.to_string()));
    }

    let text = format!("{}", value.abs());
    let (integral, fractional) = text.split_once('.').unwrap_or((text.as_str(), ""));

    // Integral part must fit: anything >= 2^63 prints as 19+ digits that overflow
    let mut mantissa = integral
        .parse::<i64>()
        .map_err(|_| CodecError::Overflow(text.clone()))?;

    let kept = &fractional[..fractional.len().min(MAX_SCALE)];
    let kept = kept.trim_end_matches('0');

    let mut scale: i16 = 0;
    for digit in kept.bytes() {
        let next = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(i64::from(digit - b'0')));
        match next {
            Some(m) => {
                mantissa = m;
                scale -= 1;
            }
            // Accumulator full: drop the remaining digits
            None => break,
        }
    }

    if value.is_sign_negative() {
        mantissa = -mantissa;
    }

    Ok(Number::new(mantissa, scale))
}

/// Legacy string-direct decimal parser (`i32` mantissa, `i8` scale)
///
/// The whole text must still be a valid finite double; the digits are then
/// read straight from the string without a floating-point round trip.
pub fn parse_legacy_decimal(text: &str) -> Result<Number, CodecError> {
    parse_finite_f64(text)?;

    let overflow = || CodecError::Overflow(text.to_string());
    let invalid = || CodecError::Invalid(text.to_string());

    let (integer_text, fraction_text) = match text.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (text, None),
    };

    let integer = integer_text.parse::<i32>().map_err(|_| invalid())?;
    let negative = integer_text.starts_with('-');

    let fraction_text = fraction_text.unwrap_or("").trim_end_matches('0');
    if fraction_text.is_empty() {
        return Ok(Number::new(i64::from(integer), 0));
    }
    if !fraction_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let digits = fraction_text.len();
    if digits > i8::MAX as usize {
        return Err(overflow());
    }
    let fraction = fraction_text.parse::<i64>().map_err(|_| overflow())?;

    let shifted = 10i64
        .checked_pow(digits as u32)
        .and_then(|p| i64::from(integer).checked_mul(p))
        .ok_or_else(overflow)?;
    let combined = if negative {
        shifted.checked_sub(fraction)
    } else {
        shifted.checked_add(fraction)
    }
    .ok_or_else(overflow)?;

    let mantissa = i32::try_from(combined).map_err(|_| overflow())?;
    Ok(Number::new(i64::from(mantissa), -(digits as i16)))
}

/// Legacy parser that coerces precision-heavy values into range
///
/// When the first attempt fails and the text has more than two fractional
/// digits, the fraction is cut to two digits and parsed again.
pub fn parse_legacy_decimal_truncated(text: &str) -> Result<Number, CodecError> {
    let first = match parse_legacy_decimal(text) {
        Ok(n) => return Ok(n),
        Err(e) => e,
    };

    let Some((integer, fraction)) = text.split_once('.') else {
        return Err(first);
    };
    let Some(kept) = fraction.get(..2).filter(|_| fraction.len() > 2) else {
        return Err(first);
    };
    let stripped = format!("{}.{}", integer, kept);
    parse_legacy_decimal(&stripped)
}

/// Active decimal codec for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecimalCodec {
    #[default]
    Exact,
    Legacy,
}

impl DecimalCodec {
    pub fn parse_decimal(&self, text: &str) -> Result<Number, CodecError> {
        match self {
            DecimalCodec::Exact => parse_decimal(text),
            DecimalCodec::Legacy => parse_legacy_decimal_truncated(text),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecimalCodec::Exact => "exact",
            DecimalCodec::Legacy => "legacy",
        }
    }
}

impl FromStr for DecimalCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(DecimalCodec::Exact),
            "legacy" => Ok(DecimalCodec::Legacy),
            other => Err(format!("unknown decimal codec '{}'", other)),
        }
    }
}

/// Normalize a metric value: integer path without a decimal point, decimal
/// path (through the active codec) otherwise
pub fn normalize_value(text: &str, codec: DecimalCodec) -> Result<Number, CodecError> {
    if text.contains('.') {
        codec.parse_decimal(text)
    } else {
        parse_int64(text).map(|v| Number::new(v, 0))
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_decimal_round_trip(
            integral in -1_000_000_000_000i64..=1_000_000_000_000,
            fraction in 0u32..1_000_000_000,
            digits in 0usize..=9,
        ) {
            let text = if digits == 0 {
                integral.to_string()
            } else {
                let fraction = format!("{:09}", fraction);
                format!("{}.{}", integral, &fraction[..digits])
            };

            // The stored digits are the shortest round-trip form of the double,
            // so reconstruction must land on exactly the same double
            let parsed = parse_decimal(&text).unwrap();
            let expected: f64 = text.parse().unwrap();
            prop_assert_eq!(parsed.to_f64(), expected, "{} parsed as {:?}", text, parsed);
        }
    }
}
