//! Per-cell scalar type classification.
//!
//! Distinguishes numeric from other text values without allocating. Used by
//! the typed accessors on `Field` and usable on its own for downstream schema
//! inference.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar types recognized for individual CSV fields.
///
/// Numeric variants are ordered by widening: `Int8 < Int16 < Int32 < Int64 <
/// Double`. An integer that overflows `Int64` is classified as `Double`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Empty string, or a string of only spaces.
    Null,
    /// Non-empty, non-numeric text.
    String,
    Int8,
    Int16,
    Int32,
    Int64,
    Double,
}

impl DataType {
    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_num(&self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::Double
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Null => "null",
            Self::String => "string",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Double => "double",
        };
        write!(f, "{s}")
    }
}

/// Classify a field using `.` as the decimal separator.
pub fn data_type(input: &[u8]) -> (DataType, Option<f64>) {
    data_type_with_separators(input, b".")
}

/// Classify a field, returning the parsed numeric value when there is one.
///
/// Rules:
/// - Leading and trailing spaces are ignored; a string of only spaces is
///   `Null`.
/// - A single leading `+` or `-` is accepted.
/// - Digits with at most one decimal separator, optionally followed by an
///   `e`/`E` exponent with an optional sign.
/// - Anything else is `String`. A malformed exponent makes the whole field
///   `String`.
///
/// Integer widths are picked as the smallest signed variant whose range
/// contains the value. The out value is always the wide floating-point
/// rendering, including for integers.
pub fn data_type_with_separators(input: &[u8], decimal_seps: &[u8]) -> (DataType, Option<f64>) {
    let len = input.len();
    let mut i = 0;

    while i < len && input[i] == b' ' {
        i += 1;
    }
    if i == len {
        return (DataType::Null, None);
    }

    let mut negative = false;
    match input[i] {
        b'+' => i += 1,
        b'-' => {
            negative = true;
            i += 1;
        }
        _ => (),
    }

    // Mantissa. The integral part is additionally accumulated exactly so that
    // width selection is correct all the way up to the i64 boundaries.
    let mut integral = 0f64;
    let mut decimal = 0f64;
    let mut int_acc: i128 = 0;
    let mut int_overflow = false;
    let mut places: i32 = 0;
    let mut has_digit = false;
    let mut saw_sep = false;

    while i < len {
        let b = input[i];
        if b.is_ascii_digit() {
            has_digit = true;
            let digit = (b - b'0') as i128;
            if saw_sep {
                places += 1;
                decimal += (digit as f64) / 10f64.powi(places);
            } else {
                integral = integral * 10.0 + digit as f64;
                match int_acc.checked_mul(10).and_then(|v| v.checked_add(digit)) {
                    Some(v) => int_acc = v,
                    None => int_overflow = true,
                }
            }
            i += 1;
        } else if !saw_sep && decimal_seps.contains(&b) {
            saw_sep = true;
            i += 1;
        } else {
            break;
        }
    }

    // Exponent.
    let mut exponent: Option<f64> = None;
    if i < len && (input[i] == b'e' || input[i] == b'E') && has_digit {
        i += 1;
        let mut exp_negative = false;
        if i < len && (input[i] == b'+' || input[i] == b'-') {
            exp_negative = input[i] == b'-';
            i += 1;
        }
        let mut exp = 0f64;
        let mut exp_digits = false;
        while i < len && input[i].is_ascii_digit() {
            exp = exp * 10.0 + (input[i] - b'0') as f64;
            exp_digits = true;
            i += 1;
        }
        if !exp_digits {
            return (DataType::String, None);
        }
        exponent = Some(if exp_negative { -exp } else { exp });
    }

    while i < len && input[i] == b' ' {
        i += 1;
    }
    if i != len || !has_digit {
        return (DataType::String, None);
    }

    let magnitude = integral + decimal;
    let mut value = if negative { -magnitude } else { magnitude };

    if let Some(exp) = exponent {
        value *= 10f64.powf(exp);
        return (DataType::Double, Some(value));
    }
    if saw_sep {
        return (DataType::Double, Some(value));
    }
    if int_overflow {
        return (DataType::Double, Some(value));
    }

    // Exact for integers, where repeated f64 accumulation could drift an ulp
    // near the i64 boundaries.
    let signed = if negative { -int_acc } else { int_acc };
    let value = signed as f64;
    let dtype = if i8::try_from(signed).is_ok() {
        DataType::Int8
    } else if i16::try_from(signed).is_ok() {
        DataType::Int16
    } else if i32::try_from(signed).is_ok() {
        DataType::Int32
    } else if i64::try_from(signed).is_ok() {
        DataType::Int64
    } else {
        DataType::Double
    };

    (dtype, Some(value))
}

/// Parse the boolean renderings accepted by the typed accessors.
pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "t" | "true" | "TRUE" | "T" => Some(true),
        "f" | "false" | "FALSE" | "F" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn expected_width(v: i128) -> DataType {
        if i8::try_from(v).is_ok() {
            DataType::Int8
        } else if i16::try_from(v).is_ok() {
            DataType::Int16
        } else if i32::try_from(v).is_ok() {
            DataType::Int32
        } else {
            DataType::Int64
        }
    }

    #[test]
    fn empty_is_null() {
        assert_eq!((DataType::Null, None), data_type(b""));
        assert_eq!((DataType::Null, None), data_type(b"   "));
    }

    #[test]
    fn padded_integer() {
        let (dtype, value) = data_type(b"  2018   ");
        assert_eq!(DataType::Int16, dtype);
        assert_eq!(Some(2018.0), value);
    }

    #[test]
    fn plain_double() {
        let (dtype, value) = data_type(b"3.14");
        assert_eq!(DataType::Double, dtype);
        assert!((value.unwrap() - 3.14).abs() < 1e-9);
    }

    #[test]
    fn scientific_notation() {
        let (dtype, value) = data_type(b"4.55E+10");
        assert_eq!(DataType::Double, dtype);
        let value = value.unwrap();
        assert!((value - 4.55e10).abs() / 4.55e10 < 1e-12);

        let (dtype, value) = data_type(b"1e5");
        assert_eq!(DataType::Double, dtype);
        assert!((value.unwrap() - 1e5).abs() < 1e-6);

        let (dtype, value) = data_type(b"2E-2");
        assert_eq!(DataType::Double, dtype);
        assert!((value.unwrap() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn malformed_exponent_is_string() {
        assert_eq!((DataType::String, None), data_type(b"4.55E000a"));
        assert_eq!((DataType::String, None), data_type(b"1e"));
        assert_eq!((DataType::String, None), data_type(b"1e+"));
    }

    #[test]
    fn phone_number_is_string() {
        assert_eq!((DataType::String, None), data_type(b"510-123-4567"));
    }

    #[test]
    fn internal_space_is_string() {
        assert_eq!((DataType::String, None), data_type(b"510 123"));
        assert_eq!((DataType::String, None), data_type(b"- 5"));
    }

    #[test]
    fn sign_handling() {
        assert_eq!(DataType::Int8, data_type(b"+5").0);
        let (dtype, value) = data_type(b"-5");
        assert_eq!(DataType::Int8, dtype);
        assert_eq!(Some(-5.0), value);
        assert_eq!((DataType::String, None), data_type(b"--5"));
        assert_eq!((DataType::String, None), data_type(b"+"));
    }

    #[test]
    fn width_boundaries() {
        assert_eq!(DataType::Int8, data_type(b"127").0);
        assert_eq!(DataType::Int16, data_type(b"128").0);
        assert_eq!(DataType::Int8, data_type(b"-128").0);
        assert_eq!(DataType::Int16, data_type(b"-129").0);
        assert_eq!(DataType::Int32, data_type(b"32768").0);
        assert_eq!(DataType::Int64, data_type(b"2147483648").0);
        assert_eq!(DataType::Int64, data_type(b"9223372036854775807").0);
        assert_eq!(DataType::Double, data_type(b"9223372036854775808").0);
    }

    #[test]
    fn leading_decimal_separator() {
        let (dtype, value) = data_type(b".5");
        assert_eq!(DataType::Double, dtype);
        assert_eq!(Some(0.5), value);
    }

    #[test]
    fn alternate_decimal_separators() {
        let (dtype, value) = data_type_with_separators(b"3,14", b",");
        assert_eq!(DataType::Double, dtype);
        assert!((value.unwrap() - 3.14).abs() < 1e-9);

        // Not in the separator set.
        assert_eq!(
            (DataType::String, None),
            data_type_with_separators(b"3.14", b",")
        );
    }

    proptest! {
        #[test]
        fn int8_range_classifies_int8(v: i8) {
            let s = v.to_string();
            let (dtype, value) = data_type(s.as_bytes());
            prop_assert_eq!(DataType::Int8, dtype);
            prop_assert_eq!(Some(v as f64), value);
        }

        #[test]
        fn i16_values_pick_smallest_width(v: i16) {
            let s = v.to_string();
            prop_assert_eq!(expected_width(v as i128), data_type(s.as_bytes()).0);
        }

        #[test]
        fn i32_values_pick_smallest_width(v: i32) {
            let s = v.to_string();
            prop_assert_eq!(expected_width(v as i128), data_type(s.as_bytes()).0);
        }

        #[test]
        fn i64_values_pick_smallest_width(v: i64) {
            let s = v.to_string();
            let (dtype, value) = data_type(s.as_bytes());
            prop_assert_eq!(expected_width(v as i128), dtype);
            prop_assert_eq!(Some(v as f64), value);
        }
    }
}
