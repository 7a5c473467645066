//! Coerces raw source values into canonical values. Scan cells (text
//! protocol) and binlog row images both land here, and a given logical
//! value must coerce identically regardless of which path produced it.

use chrono::DateTime;

use crate::binlog;
use crate::catalog::ColumnDescriptor;
use crate::error::{Error, Result};
use crate::source::RowValue;
use crate::types::{CanonicalType, Value};

pub fn coerce_scan_value(raw: &RowValue, column: &ColumnDescriptor) -> Result<Value> {
  let bytes = match raw {
    None => return Ok(Value::Null),
    Some(bytes) => bytes.as_slice(),
  };

  let value = match column.canonical_type {
    CanonicalType::Boolean => {
      // bit(1) cells arrive as raw bytes, tinyint(1) cells as digits
      if column.native_type.to_ascii_lowercase().starts_with("bit") {
        Value::Boolean(bytes.iter().any(|b| *b != 0))
      } else {
        Value::Boolean(parse_text::<i64>(bytes, column)? != 0)
      }
    }
    CanonicalType::Integer => {
      if column.is_unsigned() {
        Value::Unsigned(parse_text(bytes, column)?)
      } else {
        Value::Integer(parse_text(bytes, column)?)
      }
    }
    CanonicalType::Float => Value::Float(parse_text(bytes, column)?),
    CanonicalType::Decimal => Value::Decimal(String::from_utf8_lossy(bytes).into_owned()),
    CanonicalType::String => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    CanonicalType::Bytes => Value::Bytes(strip_binary_pad(bytes.to_vec(), column)),
    CanonicalType::Timestamp => {
      let text = String::from_utf8_lossy(bytes);
      if text.starts_with("0000-00-00") {
        Value::Null
      } else {
        Value::Timestamp(normalize_timestamp_text(&text))
      }
    }
    CanonicalType::Date => {
      let text = String::from_utf8_lossy(bytes);
      if text.starts_with("0000-00-00") {
        Value::Null
      } else {
        Value::Date(text.into_owned())
      }
    }
    CanonicalType::Time => Value::Time(normalize_fraction(String::from_utf8_lossy(bytes).trim())),
    CanonicalType::Json => Value::Json(String::from_utf8_lossy(bytes).into_owned()),
    CanonicalType::Geometry => Value::Geometry(strip_srid_prefix(bytes.to_vec())),
  };
  Ok(value)
}

pub fn coerce_binlog_value(raw: binlog::Value, column: &ColumnDescriptor) -> Result<Value> {
  use binlog::Value as Raw;

  let value = match (column.canonical_type, raw) {
    (_, Raw::Null) => Value::Null,

    (CanonicalType::Boolean, Raw::Bit(bytes)) => Value::Boolean(bytes.iter().any(|b| *b != 0)),
    (CanonicalType::Boolean, Raw::I64(v)) => Value::Boolean(v != 0),
    (CanonicalType::Boolean, Raw::U64(v)) => Value::Boolean(v != 0),

    (CanonicalType::Integer, Raw::I64(v)) => Value::Integer(v),
    (CanonicalType::Integer, Raw::U64(v)) => Value::Unsigned(v),
    (CanonicalType::Integer, Raw::Year(v)) => Value::Integer(v as i64),

    (CanonicalType::Float, Raw::F64(v)) => Value::Float(v),
    (CanonicalType::Decimal, Raw::Decimal(v)) => Value::Decimal(v),

    // text columns ride the blob wire type in row images
    (CanonicalType::String, Raw::String(bytes) | Raw::Blob(bytes)) => {
      Value::String(String::from_utf8_lossy(&bytes).into_owned())
    }
    (CanonicalType::String, Raw::Enum(index)) => Value::String(index.to_string()),
    (CanonicalType::String, Raw::Set(mask)) => Value::String(mask.to_string()),

    (CanonicalType::Bytes, Raw::String(bytes) | Raw::Blob(bytes) | Raw::Bit(bytes)) => {
      Value::Bytes(strip_binary_pad(bytes, column))
    }

    (CanonicalType::Timestamp, Raw::DateTime { year: 0, month: 0, day: 0, .. }) => Value::Null,
    (
      CanonicalType::Timestamp,
      Raw::DateTime {
        year,
        month,
        day,
        hour,
        minute,
        second,
        micros,
      },
    ) => Value::Timestamp(format!(
      "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}{}+00:00",
      year,
      month,
      day,
      hour,
      minute,
      second,
      format_micros(micros)
    )),
    (CanonicalType::Timestamp, Raw::Timestamp { seconds: 0, micros: 0 }) => Value::Null,
    (CanonicalType::Timestamp, Raw::Timestamp { seconds, micros }) => {
      let datetime = DateTime::from_timestamp(seconds as i64, 0).ok_or_else(|| {
        Error::Protocol(format!("timestamp {} out of range on {}", seconds, column.name))
      })?;
      Value::Timestamp(format!(
        "{}{}+00:00",
        datetime.format("%Y-%m-%dT%H:%M:%S"),
        format_micros(micros)
      ))
    }

    (CanonicalType::Date, Raw::Date { year: 0, month: 0, day: 0 }) => Value::Null,
    (CanonicalType::Date, Raw::Date { year, month, day }) => {
      Value::Date(format!("{:04}-{:02}-{:02}", year, month, day))
    }

    (
      CanonicalType::Time,
      Raw::Time {
        negative,
        hours,
        minutes,
        seconds,
        micros,
      },
    ) => Value::Time(format!(
      "{}{:02}:{:02}:{:02}{}",
      if negative { "-" } else { "" },
      hours,
      minutes,
      seconds,
      format_micros(micros)
    )),

    (CanonicalType::Json, Raw::Json(text)) => Value::Json(text),
    (CanonicalType::Json, Raw::Blob(bytes)) => Value::Json(String::from_utf8_lossy(&bytes).into_owned()),

    (CanonicalType::Geometry, Raw::Blob(bytes)) => Value::Geometry(strip_srid_prefix(bytes)),

    (canonical_type, raw) => {
      return Err(Error::Protocol(format!(
        "cannot coerce {:?} into {:?} on column {}",
        raw, canonical_type, column.name
      )))
    }
  };
  Ok(value)
}

fn parse_text<T: std::str::FromStr>(bytes: &[u8], column: &ColumnDescriptor) -> Result<T> {
  std::str::from_utf8(bytes)
    .ok()
    .and_then(|text| text.trim().parse().ok())
    .ok_or_else(|| {
      Error::Protocol(format!(
        "cannot parse {:?} as {:?} on column {}",
        String::from_utf8_lossy(bytes),
        column.canonical_type,
        column.name
      ))
    })
}

/// Fixed-width binary columns are stored padded with trailing `0x00` up to
/// their declared width; the pad is storage, not data.
fn strip_binary_pad(mut bytes: Vec<u8>, column: &ColumnDescriptor) -> Vec<u8> {
  if column.fixed_binary_width().is_some() {
    while bytes.last() == Some(&0) {
      bytes.pop();
    }
  }
  bytes
}

/// Geometry values carry a 4-byte SRID before the WKB payload.
fn strip_srid_prefix(bytes: Vec<u8>) -> Vec<u8> {
  if bytes.len() >= 4 {
    bytes[4..].to_vec()
  } else {
    bytes
  }
}

fn format_micros(micros: u32) -> String {
  if micros == 0 {
    return String::new();
  }
  let digits = format!("{:06}", micros);
  format!(".{}", digits.trim_end_matches('0'))
}

fn normalize_timestamp_text(text: &str) -> String {
  let text = text.trim().replacen(' ', "T", 1);
  let body = text.strip_suffix("+00:00").unwrap_or(&text);
  format!("{}+00:00", normalize_fraction(body))
}

/// One rendering for fractional seconds on both sync paths: trailing zeros
/// dropped, a zero fraction dropped entirely.
fn normalize_fraction(text: &str) -> String {
  match text.split_once('.') {
    Some((whole, frac)) => {
      let frac = frac.trim_end_matches('0');
      if frac.is_empty() {
        whole.to_string()
      } else {
        format!("{}.{}", whole, frac)
      }
    }
    None => text.to_string(),
  }
}
