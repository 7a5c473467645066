use std::cmp::Ordering;

use serde::Serialize;

/// Closed set of output types. Every mapped MySQL column resolves to exactly
/// one of these, independently of which sync strategy produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalType {
  Integer,
  Decimal,
  Float,
  Boolean,
  String,
  Bytes,
  Timestamp,
  Date,
  Time,
  Json,
  Geometry,
}

/// Maps a native column type, as reported by
/// `information_schema.columns.column_type` (e.g. `bigint(20) unsigned`,
/// `varchar(255)`, `enum('a','b')`), to its canonical type. Returns `None`
/// for native types with no mapping.
pub fn map_native_type(native_type: &str) -> Option<CanonicalType> {
  let native_type = native_type.trim().to_ascii_lowercase();
  let base = native_type
    .split(|c| c == '(' || c == ' ')
    .next()
    .unwrap_or_default();

  match base {
    "tinyint" if native_type.starts_with("tinyint(1)") => Some(CanonicalType::Boolean),
    "bit" if native_type.starts_with("bit(1)") => Some(CanonicalType::Boolean),
    "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => Some(CanonicalType::Integer),
    "decimal" | "numeric" => Some(CanonicalType::Decimal),
    "float" | "double" | "real" => Some(CanonicalType::Float),
    "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "enum" | "set" => {
      Some(CanonicalType::String)
    }
    "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" | "bit" => Some(CanonicalType::Bytes),
    "datetime" | "timestamp" => Some(CanonicalType::Timestamp),
    "date" => Some(CanonicalType::Date),
    "time" => Some(CanonicalType::Time),
    "json" => Some(CanonicalType::Json),
    "geometry" | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring" | "multipolygon"
    | "geometrycollection" | "geomcollection" => Some(CanonicalType::Geometry),
    _ => None,
  }
}

/// Declared width of a fixed-length `binary(n)` column. The server pads
/// stored values with trailing `0x00` up to this width.
pub fn fixed_binary_width(native_type: &str) -> Option<usize> {
  let native_type = native_type.trim().to_ascii_lowercase();
  let rest = native_type.strip_prefix("binary(")?;
  let digits = rest.split(')').next()?;
  digits.parse().ok()
}

pub fn is_unsigned(native_type: &str) -> bool {
  native_type.to_ascii_lowercase().contains(" unsigned")
}

/// A coerced value, ready for output. Temporal variants carry their
/// normalized textual form, `Decimal` carries the exact decimal string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Boolean(bool),
  Integer(i64),
  Unsigned(u64),
  Float(f64),
  Decimal(String),
  String(String),
  Bytes(Vec<u8>),
  Timestamp(String),
  Date(String),
  Time(String),
  Json(String),
  Geometry(Vec<u8>),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// JSON rendering for record messages. Byte payloads become UTF-8 text
  /// when they decode cleanly, hex otherwise. Geometry (WKB) is always hex.
  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::Null => serde_json::Value::Null,
      Value::Boolean(v) => serde_json::Value::Bool(*v),
      Value::Integer(v) => serde_json::Value::from(*v),
      Value::Unsigned(v) => serde_json::Value::from(*v),
      Value::Float(v) => serde_json::Number::from_f64(*v)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null),
      Value::Decimal(v) => serde_json::Value::String(v.clone()),
      Value::String(v) => serde_json::Value::String(v.clone()),
      Value::Bytes(v) => match std::str::from_utf8(v) {
        Ok(text) => serde_json::Value::String(text.to_string()),
        Err(_) => serde_json::Value::String(hex_string(v)),
      },
      Value::Timestamp(v) | Value::Date(v) | Value::Time(v) => serde_json::Value::String(v.clone()),
      Value::Json(v) => serde_json::Value::String(v.clone()),
      Value::Geometry(v) => serde_json::Value::String(hex_string(v)),
    }
  }

  /// Ordering between two values of the same canonical type, used for
  /// replication-key monotonicity checks. `None` when incomparable.
  pub fn compare(&self, other: &Value) -> Option<Ordering> {
    match (self, other) {
      (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
      (Value::Unsigned(a), Value::Unsigned(b)) => Some(a.cmp(b)),
      (Value::Integer(a), Value::Unsigned(b)) => Some((*a as i128).cmp(&(*b as i128))),
      (Value::Unsigned(a), Value::Integer(b)) => Some((*a as i128).cmp(&(*b as i128))),
      (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
      (Value::Decimal(a), Value::Decimal(b)) => {
        let a: f64 = a.parse().ok()?;
        let b: f64 = b.parse().ok()?;
        a.partial_cmp(&b)
      }
      (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
      (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
      (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
      (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
      _ => None,
    }
  }
}

pub(crate) fn hex_string(buffer: &[u8]) -> String {
  let mut out = String::with_capacity(buffer.len() * 2);
  for byte in buffer {
    out.push_str(&format!("{:02x}", byte));
  }
  out
}
