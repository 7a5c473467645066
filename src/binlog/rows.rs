use std::io;

use super::{json, ColumnType, RowsEvent, RowsKind, TableMapEvent};
use crate::buf_ext::BufExt;

/// A decoded binlog value. Temporals keep their packed components so the
/// coercer can format them; strings keep raw bytes because the column
/// charset is not resolved at this layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  U64(u64),
  I64(i64),
  F64(f64),
  Decimal(String),
  String(Vec<u8>),
  Blob(Vec<u8>),
  Bit(Vec<u8>),
  Json(String),
  Enum(u16),
  Set(u64),
  Year(u16),
  Date {
    year: u16,
    month: u8,
    day: u8,
  },
  Time {
    negative: bool,
    hours: u32,
    minutes: u8,
    seconds: u8,
    micros: u32,
  },
  DateTime {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
  },
  Timestamp {
    seconds: u32,
    micros: u32,
  },
}

/// One decoded row. Inserts carry `after`, deletes carry `before`, updates
/// carry both. Images are in table column order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
  pub before: Option<Vec<Value>>,
  pub after: Option<Vec<Value>>,
}

pub(super) fn decode_rows(event: &RowsEvent, table_map: &TableMapEvent) -> io::Result<Vec<RowImage>> {
  if event.column_count != table_map.column_count() {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      format!(
        "rows event has {} columns, table map has {}",
        event.column_count,
        table_map.column_count()
      ),
    ));
  }

  let mut b = event.rows_data();
  let mut images = vec![];
  while !b.is_empty() {
    let image = match event.kind {
      RowsKind::Insert => RowImage {
        before: None,
        after: Some(decode_image(&mut b, table_map, event.columns_present())?),
      },
      RowsKind::Delete => RowImage {
        before: Some(decode_image(&mut b, table_map, event.columns_present())?),
        after: None,
      },
      RowsKind::Update => RowImage {
        before: Some(decode_image(&mut b, table_map, event.columns_present())?),
        after: Some(decode_image(&mut b, table_map, event.columns_present_update())?),
      },
    };
    images.push(image);
  }
  Ok(images)
}

fn decode_image(b: &mut &[u8], table_map: &TableMapEvent, present: &[u8]) -> io::Result<Vec<Value>> {
  let column_count = table_map.column_count();
  let present_count = (0..column_count).filter(|i| bit_set(present, *i)).count();
  let null_bitmap = b.mysql_get_bytes((present_count + 7) / 8)?;

  let mut values = Vec::with_capacity(column_count);
  let mut image_index = 0;
  for i in 0..column_count {
    if !bit_set(present, i) {
      values.push(Value::Null);
      continue;
    }
    if bit_set(&null_bitmap, image_index) {
      values.push(Value::Null);
    } else {
      let (column_type, meta) = real_type(table_map.column_types[i], table_map.column_metas[i]);
      let labels = match column_type {
        ColumnType::MYSQL_TYPE_ENUM => table_map.enum_labels(typed_ordinal(table_map, i, ColumnType::MYSQL_TYPE_ENUM)),
        ColumnType::MYSQL_TYPE_SET => table_map.set_labels(typed_ordinal(table_map, i, ColumnType::MYSQL_TYPE_SET)),
        _ => None,
      };
      values.push(decode_value(b, column_type, meta, table_map.is_unsigned(i), labels)?);
    }
    image_index += 1;
  }
  Ok(values)
}

/// Ordinal of column `index` among the columns whose real type is `wanted`,
/// matching the order of the optional-metadata label lists.
fn typed_ordinal(table_map: &TableMapEvent, index: usize, wanted: ColumnType) -> usize {
  (0..index)
    .filter(|i| real_type(table_map.column_types[*i], table_map.column_metas[*i]).0 == wanted)
    .count()
}

/// MYSQL_TYPE_STRING packs the real column type into the metadata high
/// byte; long CHAR columns additionally steal two length bits from it.
fn real_type(column_type: ColumnType, meta: u16) -> (ColumnType, u16) {
  if column_type != ColumnType::MYSQL_TYPE_STRING || meta < 256 {
    return (column_type, meta);
  }
  let high = (meta >> 8) as u8;
  let low = meta & 0xff;
  if high & 0x30 != 0x30 {
    let length = low | (((high as u16) & 0x30) ^ 0x30) << 4;
    (ColumnType::try_from(high | 0x30).unwrap_or(column_type), length)
  } else {
    match ColumnType::try_from(high) {
      Ok(t @ (ColumnType::MYSQL_TYPE_ENUM | ColumnType::MYSQL_TYPE_SET)) => (t, low),
      _ => (column_type, low),
    }
  }
}

fn decode_value(
  b: &mut &[u8],
  column_type: ColumnType,
  meta: u16,
  unsigned: bool,
  labels: Option<&[String]>,
) -> io::Result<Value> {
  use ColumnType::*;

  let value = match column_type {
    MYSQL_TYPE_TINY => {
      let v = b.mysql_get_u8()?;
      if unsigned {
        Value::U64(v as u64)
      } else {
        Value::I64(v as i8 as i64)
      }
    }
    MYSQL_TYPE_SHORT => {
      let v = b.mysql_get_uint_le(2)?;
      if unsigned {
        Value::U64(v)
      } else {
        Value::I64(v as u16 as i16 as i64)
      }
    }
    MYSQL_TYPE_INT24 => {
      let v = b.mysql_get_uint_le(3)?;
      if unsigned {
        Value::U64(v)
      } else {
        Value::I64(((v as i64) << 40) >> 40)
      }
    }
    MYSQL_TYPE_LONG => {
      let v = b.mysql_get_uint_le(4)?;
      if unsigned {
        Value::U64(v)
      } else {
        Value::I64(v as u32 as i32 as i64)
      }
    }
    MYSQL_TYPE_LONGLONG => {
      let v = b.mysql_get_uint_le(8)?;
      if unsigned {
        Value::U64(v)
      } else {
        Value::I64(v as i64)
      }
    }
    MYSQL_TYPE_FLOAT => {
      let v = b.mysql_get_uint_le(4)? as u32;
      Value::F64(f32::from_le_bytes(v.to_le_bytes()) as f64)
    }
    MYSQL_TYPE_DOUBLE => {
      let v = b.mysql_get_uint_le(8)?;
      Value::F64(f64::from_le_bytes(v.to_le_bytes()))
    }
    MYSQL_TYPE_YEAR => {
      let v = b.mysql_get_u8()? as u16;
      Value::Year(if v == 0 { 0 } else { 1900 + v })
    }
    MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => {
      let v = b.mysql_get_uint_le(3)?;
      Value::Date {
        year: (v >> 9) as u16,
        month: ((v >> 5) & 0x0f) as u8,
        day: (v & 0x1f) as u8,
      }
    }
    MYSQL_TYPE_TIME => {
      let v = b.mysql_get_uint_le(3)?;
      let v = ((v as i64) << 40) >> 40;
      let negative = v < 0;
      let v = v.unsigned_abs();
      Value::Time {
        negative,
        hours: (v / 10000) as u32,
        minutes: ((v / 100) % 100) as u8,
        seconds: (v % 100) as u8,
        micros: 0,
      }
    }
    MYSQL_TYPE_TIME2 => {
      // 3 bytes big-endian, sign bit set for non-negative values
      let packed = b.mysql_get_uint_be(3)?;
      let negative = packed & 0x80_0000 == 0;
      let v = if negative {
        0x80_0000 - (packed & 0x7f_ffff)
      } else {
        packed & 0x7f_ffff
      };
      let micros = read_fractional_seconds(b, meta as u8)?;
      Value::Time {
        negative,
        hours: ((v >> 12) & 0x3ff) as u32,
        minutes: ((v >> 6) & 0x3f) as u8,
        seconds: (v & 0x3f) as u8,
        micros,
      }
    }
    MYSQL_TYPE_DATETIME => {
      let v = b.mysql_get_uint_le(8)?;
      let date = v / 1_000_000;
      let time = v % 1_000_000;
      Value::DateTime {
        year: (date / 10000) as u16,
        month: ((date / 100) % 100) as u8,
        day: (date % 100) as u8,
        hour: (time / 10000) as u8,
        minute: ((time / 100) % 100) as u8,
        second: (time % 100) as u8,
        micros: 0,
      }
    }
    MYSQL_TYPE_DATETIME2 => {
      // https://dev.mysql.com/doc/dev/mysql-server/latest/my__time_8h.html
      let packed = b.mysql_get_uint_be(5)?;
      let micros = read_fractional_seconds(b, meta as u8)?;
      let year_month = ((packed >> 22) & 0x1ffff) as u32;
      Value::DateTime {
        year: (year_month / 13) as u16,
        month: (year_month % 13) as u8,
        day: ((packed >> 17) & 0x1f) as u8,
        hour: ((packed >> 12) & 0x1f) as u8,
        minute: ((packed >> 6) & 0x3f) as u8,
        second: (packed & 0x3f) as u8,
        micros,
      }
    }
    MYSQL_TYPE_TIMESTAMP => {
      let seconds = b.mysql_get_uint_le(4)? as u32;
      Value::Timestamp { seconds, micros: 0 }
    }
    MYSQL_TYPE_TIMESTAMP2 => {
      let seconds = b.mysql_get_uint_be(4)? as u32;
      let micros = read_fractional_seconds(b, meta as u8)?;
      Value::Timestamp { seconds, micros }
    }
    MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING => {
      let len = if meta < 256 {
        b.mysql_get_u8()? as usize
      } else {
        b.mysql_get_uint_le(2)? as usize
      };
      Value::String(b.mysql_get_bytes(len)?)
    }
    MYSQL_TYPE_ENUM => {
      let index = b.mysql_get_uint_le(meta.clamp(1, 2) as usize)? as u16;
      match labels.and_then(|l| index.checked_sub(1).and_then(|i| l.get(i as usize))) {
        Some(label) => Value::String(label.as_bytes().to_vec()),
        None if index == 0 => Value::String(vec![]),
        None => Value::Enum(index),
      }
    }
    MYSQL_TYPE_SET => {
      let mask = b.mysql_get_uint_le(meta.clamp(1, 8) as usize)?;
      match labels {
        Some(labels) => {
          let members = labels
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, label)| label.as_str())
            .collect::<Vec<_>>();
          Value::String(members.join(",").into_bytes())
        }
        None => Value::Set(mask),
      }
    }
    MYSQL_TYPE_BIT => {
      let nbits = ((meta >> 8) * 8 + (meta & 0xff)) as usize;
      Value::Bit(b.mysql_get_bytes((nbits + 7) / 8)?)
    }
    MYSQL_TYPE_NEWDECIMAL => {
      let precision = (meta >> 8) as usize;
      let scale = (meta & 0xff) as usize;
      Value::Decimal(decode_decimal(b, precision, scale)?)
    }
    MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB
    | MYSQL_TYPE_GEOMETRY => {
      let len = b.mysql_get_uint_le(meta.clamp(1, 4) as usize)? as usize;
      Value::Blob(b.mysql_get_bytes(len)?)
    }
    MYSQL_TYPE_JSON => {
      let len = b.mysql_get_uint_le(meta.clamp(1, 4) as usize)? as usize;
      let data = b.mysql_get_bytes(len)?;
      Value::Json(json::decode(&data)?)
    }
    MYSQL_TYPE_NULL => Value::Null,
    t => {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unsupported column type {:?} in row image", t),
      ))
    }
  };
  Ok(value)
}

/// Fractional seconds trail the packed temporal in ceil(fsp/2) big-endian
/// bytes. The stored value always carries an even number of digits.
fn read_fractional_seconds(b: &mut &[u8], fsp: u8) -> io::Result<u32> {
  let nbytes = ((fsp + 1) / 2) as usize;
  if nbytes == 0 {
    return Ok(0);
  }
  let v = b.mysql_get_uint_be(nbytes)? as u32;
  Ok(v * 100u32.pow(3 - nbytes as u32))
}

// https://dev.mysql.com/doc/dev/mysql-server/latest/decimal_8cc.html
fn decode_decimal(b: &mut &[u8], precision: usize, scale: usize) -> io::Result<String> {
  const DIGITS_PER_WORD: usize = 9;
  const DIGITS_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

  let int_digits = precision.saturating_sub(scale);
  let int_words = int_digits / DIGITS_PER_WORD;
  let int_leftover = int_digits % DIGITS_PER_WORD;
  let frac_words = scale / DIGITS_PER_WORD;
  let frac_leftover = scale % DIGITS_PER_WORD;

  let total = int_words * 4 + DIGITS_TO_BYTES[int_leftover] + frac_words * 4 + DIGITS_TO_BYTES[frac_leftover];
  let mut data = b.mysql_get_bytes(total)?;
  if data.is_empty() {
    return Ok("0".to_string());
  }

  let negative = data[0] & 0x80 == 0;
  data[0] ^= 0x80;
  if negative {
    for byte in &mut data {
      *byte = !*byte;
    }
  }

  let mut d = data.as_slice();
  let mut int_groups = vec![];
  if int_leftover > 0 {
    int_groups.push(d.mysql_get_uint_be(DIGITS_TO_BYTES[int_leftover])? as u32);
  }
  for _ in 0..int_words {
    int_groups.push(d.mysql_get_uint_be(4)? as u32);
  }

  let mut out = String::new();
  if negative {
    out.push('-');
  }
  let mut leading = true;
  for group in int_groups {
    if leading && group == 0 {
      continue;
    }
    if leading {
      out.push_str(&group.to_string());
      leading = false;
    } else {
      out.push_str(&format!("{:09}", group));
    }
  }
  if leading {
    out.push('0');
  }

  if scale > 0 {
    out.push('.');
    for _ in 0..frac_words {
      out.push_str(&format!("{:09}", d.mysql_get_uint_be(4)? as u32));
    }
    if frac_leftover > 0 {
      let group = d.mysql_get_uint_be(DIGITS_TO_BYTES[frac_leftover])? as u32;
      out.push_str(&format!("{:0width$}", group, width = frac_leftover));
    }
  }

  Ok(out)
}

fn bit_set(bitmap: &[u8], index: usize) -> bool {
  bitmap.get(index / 8).map(|byte| byte & (1 << (index % 8)) != 0).unwrap_or(false)
}
