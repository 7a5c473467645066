//! MySQL binary JSON (the storage format row images carry for `json`
//! columns) rendered back to JSON text.
//!
//! https://dev.mysql.com/doc/dev/mysql-server/latest/json__binary_8h.html

use std::io;

use serde_json::{Map, Number, Value};

use crate::buf_ext::BufExt;
use crate::types::hex_string;

pub fn decode(data: &[u8]) -> io::Result<String> {
  if data.is_empty() {
    return Ok("null".to_string());
  }
  let value = parse(data[0], &data[1..])?;
  serde_json::to_string(&value).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn parse(value_type: u8, data: &[u8]) -> io::Result<Value> {
  let mut b = data;
  match value_type {
    0x00 => parse_object(data, false),
    0x01 => parse_object(data, true),
    0x02 => parse_array(data, false),
    0x03 => parse_array(data, true),
    0x04 => parse_literal(b.mysql_get_u8()?),
    0x05 => Ok(Value::from(b.mysql_get_uint_le(2)? as u16 as i16)),
    0x06 => Ok(Value::from(b.mysql_get_uint_le(2)? as u16)),
    0x07 => Ok(Value::from(b.mysql_get_uint_le(4)? as u32 as i32)),
    0x08 => Ok(Value::from(b.mysql_get_uint_le(4)? as u32)),
    0x09 => Ok(Value::from(b.mysql_get_uint_le(8)? as i64)),
    0x0a => Ok(Value::from(b.mysql_get_uint_le(8)?)),
    0x0b => {
      let bits = b.mysql_get_uint_le(8)?;
      let v = f64::from_le_bytes(bits.to_le_bytes());
      Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
    }
    0x0c => {
      let len = read_varint(&mut b)?;
      let bytes = b.mysql_get_bytes(len)?;
      let text = String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
      Ok(Value::String(text))
    }
    0x0f => {
      // opaque value (decimals, temporals); carried as hex text
      let _field_type = b.mysql_get_u8()?;
      let len = read_varint(&mut b)?;
      let bytes = b.mysql_get_bytes(len)?;
      Ok(Value::String(hex_string(&bytes)))
    }
    t => Err(io::Error::new(
      io::ErrorKind::InvalidData,
      format!("unknown json value type {:#04x}", t),
    )),
  }
}

fn parse_literal(v: u8) -> io::Result<Value> {
  match v {
    0x00 => Ok(Value::Null),
    0x01 => Ok(Value::Bool(true)),
    0x02 => Ok(Value::Bool(false)),
    v => Err(io::Error::new(
      io::ErrorKind::InvalidData,
      format!("unknown json literal {:#04x}", v),
    )),
  }
}

// Offsets inside objects and arrays are relative to the first byte of the
// count field, i.e. to `data` as passed here.
fn parse_object(data: &[u8], large: bool) -> io::Result<Value> {
  let offset_size = if large { 4 } else { 2 };
  let mut b = data;
  let count = b.mysql_get_uint_le(offset_size)? as usize;
  let _size = b.mysql_get_uint_le(offset_size)? as usize;

  let mut keys = Vec::with_capacity(count);
  for _ in 0..count {
    let key_offset = b.mysql_get_uint_le(offset_size)? as usize;
    let key_len = b.mysql_get_uint_le(2)? as usize;
    let key_bytes = slice_at(data, key_offset, key_len)?;
    let key = String::from_utf8(key_bytes.to_vec()).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    keys.push(key);
  }

  let mut object = Map::with_capacity(count);
  for key in keys {
    let value = parse_entry(&mut b, data, large, offset_size)?;
    object.insert(key, value);
  }
  Ok(Value::Object(object))
}

fn parse_array(data: &[u8], large: bool) -> io::Result<Value> {
  let offset_size = if large { 4 } else { 2 };
  let mut b = data;
  let count = b.mysql_get_uint_le(offset_size)? as usize;
  let _size = b.mysql_get_uint_le(offset_size)? as usize;

  let mut array = Vec::with_capacity(count);
  for _ in 0..count {
    array.push(parse_entry(&mut b, data, large, offset_size)?);
  }
  Ok(Value::Array(array))
}

fn parse_entry(b: &mut &[u8], data: &[u8], large: bool, offset_size: usize) -> io::Result<Value> {
  let value_type = b.mysql_get_u8()?;
  let inlined = matches!(value_type, 0x04 | 0x05 | 0x06) || (large && matches!(value_type, 0x07 | 0x08));
  if inlined {
    if b.len() < offset_size {
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated inlined json value"));
    }
    let value = parse(value_type, *b)?;
    *b = &b[offset_size..];
    Ok(value)
  } else {
    let offset = b.mysql_get_uint_le(offset_size)? as usize;
    if offset > data.len() {
      return Err(io::Error::new(io::ErrorKind::InvalidData, "json value offset out of range"));
    }
    parse(value_type, &data[offset..])
  }
}

fn slice_at(data: &[u8], offset: usize, len: usize) -> io::Result<&[u8]> {
  data
    .get(offset..offset + len)
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "json key offset out of range"))
}

fn read_varint(b: &mut &[u8]) -> io::Result<usize> {
  let mut value = 0usize;
  let mut shift = 0;
  loop {
    let byte = b.mysql_get_u8()?;
    value |= ((byte & 0x7f) as usize) << shift;
    if byte & 0x80 == 0 {
      return Ok(value);
    }
    shift += 7;
  }
}
