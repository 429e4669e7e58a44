use std::cmp::Ordering;
use std::fmt;

use pipeplan_error::{PlanError, Result};
use serde::{Deserialize, Serialize};

/// A single scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    /// Missing value.
    Null,

    /// True or false value
    Boolean(bool),

    /// Signed 64bit int
    Int64(i64),

    /// 64bit float
    Float64(f64),

    /// Utf-8 encoded string.
    Utf8(String),

    /// Binary
    Binary(Vec<u8>),
}

/// A row of values, positionally matching a tuple set's columns.
pub type Row = Vec<ScalarValue>;

impl ScalarValue {
    pub const fn datatype_name(&self) -> &'static str {
        match self {
            ScalarValue::Null => "null",
            ScalarValue::Boolean(_) => "boolean",
            ScalarValue::Int64(_) => "int64",
            ScalarValue::Float64(_) => "float64",
            ScalarValue::Utf8(_) => "utf8",
            ScalarValue::Binary(_) => "binary",
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn try_as_bool(&self) -> Result<bool> {
        match self {
            ScalarValue::Boolean(b) => Ok(*b),
            other => Err(cast_error(other, "boolean")),
        }
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            ScalarValue::Int64(v) => Ok(*v),
            other => Err(cast_error(other, "int64")),
        }
    }

    pub fn try_as_u64(&self) -> Result<u64> {
        let v = self.try_as_i64()?;
        u64::try_from(v).map_err(|_| PlanError::Execution(format!("{v} is negative")))
    }

    pub fn try_as_usize(&self) -> Result<usize> {
        let v = self.try_as_u64()?;
        usize::try_from(v).map_err(|_| PlanError::Execution(format!("{v} does not fit usize")))
    }

    pub fn try_as_f64(&self) -> Result<f64> {
        match self {
            ScalarValue::Float64(v) => Ok(*v),
            ScalarValue::Int64(v) => Ok(*v as f64),
            other => Err(cast_error(other, "float64")),
        }
    }

    pub fn try_as_str(&self) -> Result<&str> {
        match self {
            ScalarValue::Utf8(s) => Ok(s),
            other => Err(cast_error(other, "utf8")),
        }
    }

    /// Approximate in-memory size in bytes.
    pub fn size_bytes(&self) -> usize {
        let heap = match self {
            ScalarValue::Utf8(s) => s.len(),
            ScalarValue::Binary(b) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<ScalarValue>() + heap
    }

    /// Compare two values of the same type. Nulls and mismatched types are not
    /// comparable, except ints and floats which compare numerically.
    pub fn compare(&self, other: &ScalarValue) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => Some(a.cmp(b)),
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => Some(a.cmp(b)),
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => a.partial_cmp(b),
            (ScalarValue::Int64(a), ScalarValue::Float64(b)) => (*a as f64).partial_cmp(b),
            (ScalarValue::Float64(a), ScalarValue::Int64(b)) => a.partial_cmp(&(*b as f64)),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => Some(a.cmp(b)),
            (ScalarValue::Binary(a), ScalarValue::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Append a self-delimiting encoding of this value.
    ///
    /// Equal values always produce equal bytes, which makes the encoding
    /// usable as a hash key.
    pub fn write_key_bytes(&self, buf: &mut Vec<u8>) {
        match self {
            ScalarValue::Null => buf.push(0),
            ScalarValue::Boolean(b) => {
                buf.push(1);
                buf.push(*b as u8);
            }
            ScalarValue::Int64(v) => {
                buf.push(2);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            ScalarValue::Float64(v) => {
                buf.push(3);
                // Normalize negative zero so it matches positive zero.
                let v = if *v == 0.0 { 0.0 } else { *v };
                buf.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            ScalarValue::Utf8(s) => {
                buf.push(4);
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            ScalarValue::Binary(b) => {
                buf.push(5);
                buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                buf.extend_from_slice(b);
            }
        }
    }
}

fn cast_error(value: &ScalarValue, want: &str) -> PlanError {
    PlanError::Execution(format!(
        "expected {want} value, got {} ({value})",
        value.datatype_name()
    ))
}

/// Encode the key columns of a row for grouping. Nulls group together.
pub fn encode_group_key(row: &[ScalarValue], key_columns: &[usize]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key_columns.len() * 9);
    for &idx in key_columns {
        row[idx].write_key_bytes(&mut buf);
    }
    buf
}

/// Encode the key columns of a row for an equi-join.
///
/// Returns None if any key is null, null keys never match.
pub fn encode_join_key(row: &[ScalarValue], key_columns: &[usize]) -> Option<Vec<u8>> {
    if key_columns.iter().any(|&idx| row[idx].is_null()) {
        return None;
    }
    Some(encode_group_key(row, key_columns))
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "{v}"),
            ScalarValue::Binary(v) => {
                write!(f, "\\x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int64(value)
    }
}

impl From<u64> for ScalarValue {
    /// Saturates at `i64::MAX`.
    fn from(value: u64) -> Self {
        ScalarValue::Int64(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float64(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Utf8(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Utf8(value)
    }
}

impl From<Vec<u8>> for ScalarValue {
    fn from(value: Vec<u8>) -> Self {
        ScalarValue::Binary(value)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => ScalarValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bytes_distinguish_types() {
        let mut a = Vec::new();
        ScalarValue::Int64(1).write_key_bytes(&mut a);
        let mut b = Vec::new();
        ScalarValue::Float64(1.0).write_key_bytes(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn key_bytes_are_self_delimiting() {
        let row1: Row = vec!["ab".into(), "c".into()];
        let row2: Row = vec!["a".into(), "bc".into()];
        assert_ne!(
            encode_group_key(&row1, &[0, 1]),
            encode_group_key(&row2, &[0, 1])
        );
    }

    #[test]
    fn null_join_keys_do_not_encode() {
        let row: Row = vec![ScalarValue::Null, ScalarValue::Int64(4)];
        assert_eq!(None, encode_join_key(&row, &[0, 1]));
        assert!(encode_join_key(&row, &[1]).is_some());
    }

    #[test]
    fn compare_numeric_mixed() {
        assert_eq!(
            Some(Ordering::Less),
            ScalarValue::Int64(1).compare(&ScalarValue::Float64(1.5))
        );
        assert_eq!(None, ScalarValue::Int64(1).compare(&"a".into()));
    }

    #[test]
    fn untagged_json() {
        let row: Row = serde_json::from_str(r#"[null, true, 3, 2.5, "s"]"#).unwrap();
        assert_eq!(
            vec![
                ScalarValue::Null,
                ScalarValue::Boolean(true),
                ScalarValue::Int64(3),
                ScalarValue::Float64(2.5),
                ScalarValue::Utf8("s".to_string()),
            ],
            row
        );
    }
}
