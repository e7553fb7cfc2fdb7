//! The base type registry: primitive codecs for the numeric, bit-field,
//! string, date and time types of the bus dialect.
//!
//! Types are plain tagged variants looked up in a static table; encode and
//! decode are matches on the variant, so nothing is allocated per value.

mod datetime;
mod number;
mod string;

pub use datetime::{DateTimeKind, DateTimeType};
pub use number::{NumberType, DAY_NAMES};
pub use string::{StrKind, StrType};

/// Flag mask of the decimal-coded numeric kinds.
pub(crate) const BCD_FLAGS: u16 = number::BCD | number::HCD;

use core::fmt;

use crate::error::{Error, Result};

/// Length marker for adjustable-length fields declared as `*`
/// ("until end of payload").
pub const REMAIN_LEN: u8 = u8::MAX;

/// Maximum byte length of a single field.
pub const MAX_FIELD_LEN: u8 = 31;

/// The textual null token emitted for replacement values in line output.
pub const NULL_VALUE: &str = "-";

/// A decoded field value. Values stay typed inside the engine; the line and
/// JSON front-ends share the formatting below.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The replacement (null) value.
    Null,
    Int(i64),
    /// `precision` decimal digits; 0 renders the shortest form with a dot.
    Float { value: f64, precision: u8 },
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// JSON rendering: `null`, a bare number, or a quoted string.
    pub fn to_json(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float { .. } => self.to_string(),
            Value::Str(s) => format!("\"{}\"", s.replace('"', "'")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str(NULL_VALUE),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float { value, precision } => {
                if *precision > 0 {
                    write!(f, "{:.*}", *precision as usize, value)
                } else if *value == value.trunc() {
                    write!(f, "{:.1}", value)
                } else {
                    write!(f, "{}", value)
                }
            }
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// A primitive field type with its wire codec.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Str(StrType),
    DateTime(DateTimeType),
    Number(NumberType),
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Str(t) => t.name,
            DataType::DateTime(t) => t.name,
            DataType::Number(t) => t.name,
        }
    }

    /// The byte length a field of this type occupies. Bit fields report one
    /// byte here; sharing is resolved by the field set.
    pub fn byte_len(&self) -> u8 {
        match self {
            DataType::Str(t) => t.len,
            DataType::DateTime(t) => t.len,
            DataType::Number(t) => t.byte_len(),
        }
    }

    /// Whether the declared length was `*` (until end of payload).
    pub fn is_remain(&self) -> bool {
        matches!(self, DataType::Str(t) if t.len == REMAIN_LEN)
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, DataType::Str(t) if t.kind == StrKind::Ignore)
    }

    /// Bit width for bit fields, 0 for byte-aligned types.
    pub fn bit_count(&self) -> u8 {
        match self {
            DataType::Number(t) if t.bits < 8 => t.bits,
            _ => 0,
        }
    }

    /// Whether a value list may constrain this type (integer, no divisor).
    pub fn is_listable(&self) -> bool {
        match self {
            DataType::Number(t) => t.is_listable(),
            _ => false,
        }
    }

    /// Derives a new type with an additional divisor, numeric types only.
    pub fn derive(&self, divisor: i32) -> Result<DataType> {
        if divisor == 0 || divisor == 1 {
            return Ok(self.clone());
        }
        match self {
            DataType::Number(t) => Ok(DataType::Number(t.derive(divisor)?)),
            _ => Err(Error::invalid_arg("divisor on non-numeric type")),
        }
    }

    /// Decodes the field bytes starting at `data[0]`.
    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        match self {
            DataType::Str(t) => t.decode(data),
            DataType::DateTime(t) => t.decode(data),
            DataType::Number(t) => t.decode(data),
        }
    }

    /// Encodes one textual value, appending to `out`. Bit fields emit their
    /// bits positioned within a fresh byte; sharing a byte between adjacent
    /// bit fields is resolved by the field set.
    pub fn encode(&self, value: &str, out: &mut Vec<u8>) -> Result<()> {
        match self {
            DataType::Str(t) => t.encode(value, out),
            DataType::DateTime(t) => t.encode(value, out),
            DataType::Number(t) => t.encode(value, out),
        }
    }

    /// Raw integer read, numeric types only (used by value lists and
    /// conditions).
    pub fn read_raw(&self, data: &[u8]) -> Result<u32> {
        match self {
            DataType::Number(t) => t.read_raw(data),
            _ => Err(Error::invalid_arg("raw read on non-numeric type")),
        }
    }

    /// Raw integer write, numeric types only.
    pub fn write_raw(&self, raw: u32, out: &mut Vec<u8>) -> Result<()> {
        match self {
            DataType::Number(t) => t.write_raw(raw, out),
            _ => Err(Error::invalid_arg("raw write on non-numeric type")),
        }
    }

    pub fn replacement(&self) -> Option<u32> {
        match self {
            DataType::Number(t) => t.replacement,
            _ => None,
        }
    }
}

/// Looks up a base type by uppercase name and optional length.
///
/// `length` 0 selects the default length of the name; polymorphic names
/// (`BDA`, `HDA`, `BCD`, `HCD`) are disambiguated by it. For bit types the
/// length is the width in bits. [`REMAIN_LEN`] selects the open-ended
/// variant of adjustable types.
pub fn get(name: &str, length: u8) -> Result<DataType> {
    if let Some(bit) = name.strip_prefix("BI") {
        if bit.len() == 1 {
            if let Some(first_bit) = bit.chars().next().and_then(|c| c.to_digit(8)) {
                let width = if length == 0 { 1 } else { length };
                return number::bit_type(first_bit as u8, width)
                    .ok_or_else(|| Error::not_found(format!("field type {}:{}", name, length)));
            }
        }
    }
    let found = match name {
        "IGN" | "STR" | "NTS" | "HEX" => string::get(name, length),
        "BDA" | "HDA" | "DAY" | "DTM" | "BTI" | "HTI" | "VTI" | "BTM" | "HTM" | "VTM" | "MIN"
        | "TTM" | "TTH" | "TTQ" => datetime::get(name, length),
        _ => number::get(name, length),
    };
    found.ok_or_else(|| Error::not_found(format!("field type {}", name)))
}
