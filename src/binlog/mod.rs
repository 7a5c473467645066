pub mod json;
pub mod rows;

use std::io;

use crate::buf_ext::BufExt;

pub use rows::{RowImage, Value};

// https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__column__definition__flags.html
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
  MYSQL_TYPE_DECIMAL = 0x00,
  MYSQL_TYPE_TINY = 0x01,
  MYSQL_TYPE_SHORT = 0x02,
  MYSQL_TYPE_LONG = 0x03,
  MYSQL_TYPE_FLOAT = 0x04,
  MYSQL_TYPE_DOUBLE = 0x05,
  MYSQL_TYPE_NULL = 0x06,
  MYSQL_TYPE_TIMESTAMP = 0x07,
  MYSQL_TYPE_LONGLONG = 0x08,
  MYSQL_TYPE_INT24 = 0x09,
  MYSQL_TYPE_DATE = 0x0a,
  MYSQL_TYPE_TIME = 0x0b,
  MYSQL_TYPE_DATETIME = 0x0c,
  MYSQL_TYPE_YEAR = 0x0d,
  MYSQL_TYPE_NEWDATE = 0x0e,
  MYSQL_TYPE_VARCHAR = 0x0f,
  MYSQL_TYPE_BIT = 0x10,
  MYSQL_TYPE_TIMESTAMP2 = 0x11,
  MYSQL_TYPE_DATETIME2 = 0x12,
  MYSQL_TYPE_TIME2 = 0x13,
  MYSQL_TYPE_JSON = 0xf5,
  MYSQL_TYPE_NEWDECIMAL = 0xf6,
  MYSQL_TYPE_ENUM = 0xf7,
  MYSQL_TYPE_SET = 0xf8,
  MYSQL_TYPE_TINY_BLOB = 0xf9,
  MYSQL_TYPE_MEDIUM_BLOB = 0xfa,
  MYSQL_TYPE_LONG_BLOB = 0xfb,
  MYSQL_TYPE_BLOB = 0xfc,
  MYSQL_TYPE_VAR_STRING = 0xfd,
  MYSQL_TYPE_STRING = 0xfe,
  MYSQL_TYPE_GEOMETRY = 0xff,
}

impl ColumnType {
  /// Numeric columns are the ones covered by the SIGNEDNESS bitmap of the
  /// table map's optional metadata, in column order.
  pub fn is_numeric(&self) -> bool {
    use ColumnType::*;
    matches!(
      self,
      MYSQL_TYPE_TINY
        | MYSQL_TYPE_SHORT
        | MYSQL_TYPE_INT24
        | MYSQL_TYPE_LONG
        | MYSQL_TYPE_LONGLONG
        | MYSQL_TYPE_FLOAT
        | MYSQL_TYPE_DOUBLE
        | MYSQL_TYPE_DECIMAL
        | MYSQL_TYPE_NEWDECIMAL
        | MYSQL_TYPE_YEAR
    )
  }
}

impl TryFrom<u8> for ColumnType {
  type Error = io::Error;

  fn try_from(value: u8) -> io::Result<Self> {
    use ColumnType::*;
    let column_type = match value {
      0x00 => MYSQL_TYPE_DECIMAL,
      0x01 => MYSQL_TYPE_TINY,
      0x02 => MYSQL_TYPE_SHORT,
      0x03 => MYSQL_TYPE_LONG,
      0x04 => MYSQL_TYPE_FLOAT,
      0x05 => MYSQL_TYPE_DOUBLE,
      0x06 => MYSQL_TYPE_NULL,
      0x07 => MYSQL_TYPE_TIMESTAMP,
      0x08 => MYSQL_TYPE_LONGLONG,
      0x09 => MYSQL_TYPE_INT24,
      0x0a => MYSQL_TYPE_DATE,
      0x0b => MYSQL_TYPE_TIME,
      0x0c => MYSQL_TYPE_DATETIME,
      0x0d => MYSQL_TYPE_YEAR,
      0x0e => MYSQL_TYPE_NEWDATE,
      0x0f => MYSQL_TYPE_VARCHAR,
      0x10 => MYSQL_TYPE_BIT,
      0x11 => MYSQL_TYPE_TIMESTAMP2,
      0x12 => MYSQL_TYPE_DATETIME2,
      0x13 => MYSQL_TYPE_TIME2,
      0xf5 => MYSQL_TYPE_JSON,
      0xf6 => MYSQL_TYPE_NEWDECIMAL,
      0xf7 => MYSQL_TYPE_ENUM,
      0xf8 => MYSQL_TYPE_SET,
      0xf9 => MYSQL_TYPE_TINY_BLOB,
      0xfa => MYSQL_TYPE_MEDIUM_BLOB,
      0xfb => MYSQL_TYPE_LONG_BLOB,
      0xfc => MYSQL_TYPE_BLOB,
      0xfd => MYSQL_TYPE_VAR_STRING,
      0xfe => MYSQL_TYPE_STRING,
      0xff => MYSQL_TYPE_GEOMETRY,
      v => {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          format!("unknown column type {:#04x}", v),
        ))
      }
    };
    Ok(column_type)
  }
}

bitflags::bitflags! {
  // https://dev.mysql.com/doc/dev/mysql-server/latest/classbinary__log_1_1Rows__event.html
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct RowsFlags: u16 {
    const END_OF_STATEMENT = 0x0001;
    const NO_FOREIGN_KEY_CHECKS = 0x0002;
    const NO_UNIQUE_KEY_CHECKS = 0x0004;
    const ROW_HAS_A_COLUMNS = 0x0008;
  }
}

/// The 19-byte header every binlog event starts with. `log_position` is the
/// offset of the event that follows, i.e. the position a consumer that has
/// fully processed this event should checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHeader {
  pub timestamp: u32,
  pub server_id: u32,
  pub event_size: u32,
  pub log_position: u32,
  pub flags: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
  pub header: EventHeader,
  pub event: Event,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  Rotate(RotateEvent),
  Format(FormatDescriptionEvent),
  TableMap(TableMapEvent),
  Insert(RowsEvent),
  Update(RowsEvent),
  Delete(RowsEvent),
  Heartbeat,
  /// Event kinds the engine tolerates but does not decode (queries,
  /// transaction markers, GTIDs). The header still advances the position.
  Unsupported(u8),
}

impl EventPacket {
  /// Parses one raw event packet as framed by the server: an OK byte, the
  /// event header, then the event body. Assumes checksums are off.
  pub fn parse(buffer: impl AsRef<[u8]>) -> io::Result<EventPacket> {
    let mut b = buffer.as_ref();

    match b.mysql_get_u8()? {
      0x00 => {}
      v => {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          format!("expected OK byte, got {:#04x}", v),
        ))
      }
    }

    let timestamp = b.mysql_get_uint_le(4)? as u32;
    let event_type = b.mysql_get_u8()?;
    let server_id = b.mysql_get_uint_le(4)? as u32;
    let event_size = b.mysql_get_uint_le(4)? as u32;
    let log_position = b.mysql_get_uint_le(4)? as u32;
    let flags = b.mysql_get_uint_le(2)? as u16;

    let header = EventHeader {
      timestamp,
      server_id,
      event_size,
      log_position,
      flags,
    };

    let event = match event_type {
      0x04 => Event::Rotate(RotateEvent::parse(b)?),
      0x0f => Event::Format(FormatDescriptionEvent::parse(b)?),
      0x13 => Event::TableMap(TableMapEvent::parse(b)?),
      0x17 | 0x1e => Event::Insert(RowsEvent::parse(b, RowsKind::Insert, event_type >= 0x1e)?),
      0x18 | 0x1f => Event::Update(RowsEvent::parse(b, RowsKind::Update, event_type >= 0x1e)?),
      0x19 | 0x20 => Event::Delete(RowsEvent::parse(b, RowsKind::Delete, event_type >= 0x1e)?),
      0x1b => Event::Heartbeat,
      v => Event::Unsupported(v),
    };

    Ok(EventPacket { header, event })
  }
}

// https://dev.mysql.com/doc/dev/mysql-server/latest/classbinary__log_1_1Rotate__event.html
#[derive(Debug, Clone, PartialEq)]
pub struct RotateEvent {
  pub next_log_position: u64,
  pub next_log_file: String,
}

impl RotateEvent {
  fn parse(mut b: &[u8]) -> io::Result<RotateEvent> {
    let next_log_position = b.mysql_get_uint_le(8)?;
    let next_log_file = b.mysql_get_fixed_length_string(b.len())?;
    Ok(RotateEvent {
      next_log_position,
      next_log_file,
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescriptionEvent {
  pub version: u16,
  pub server_version: String,
  pub create_timestamp: u32,
  pub event_header_length: u8,
}

impl FormatDescriptionEvent {
  fn parse(mut b: &[u8]) -> io::Result<FormatDescriptionEvent> {
    let version = b.mysql_get_uint_le(2)? as u16;
    let server_version = b.mysql_get_fixed_length_string(50)?;
    let server_version = server_version.trim_end_matches('\0').to_string();
    let create_timestamp = b.mysql_get_uint_le(4)? as u32;
    let event_header_length = b.mysql_get_u8()?;
    Ok(FormatDescriptionEvent {
      version,
      server_version,
      create_timestamp,
      event_header_length,
    })
  }
}

// https://dev.mysql.com/doc/dev/mysql-server/latest/classbinary__log_1_1Table__map__event.html
#[derive(Debug, Clone, PartialEq)]
pub struct TableMapEvent {
  pub table_id: u64,
  pub flags: u16,
  pub schema: String,
  pub table: String,
  pub column_types: Vec<ColumnType>,
  pub column_metas: Vec<u16>,
  null_bitmap: Vec<u8>,
  signedness: Vec<u8>,
  column_names: Vec<String>,
  enum_str_values: Vec<Vec<String>>,
  set_str_values: Vec<Vec<String>>,
}

impl TableMapEvent {
  fn parse(mut b: &[u8]) -> io::Result<TableMapEvent> {
    let table_id = b.mysql_get_uint_le(6)?;
    let flags = b.mysql_get_uint_le(2)? as u16;

    let schema_len = b.mysql_get_u8()? as usize;
    let schema = b.mysql_get_fixed_length_string(schema_len)?;
    b.mysql_get_u8()?;

    let table_len = b.mysql_get_u8()? as usize;
    let table = b.mysql_get_fixed_length_string(table_len)?;
    b.mysql_get_u8()?;

    let column_count = b.mysql_get_lenc_uint()? as usize;
    let mut column_types = Vec::with_capacity(column_count);
    for _ in 0..column_count {
      column_types.push(ColumnType::try_from(b.mysql_get_u8()?)?);
    }

    let metadata_len = b.mysql_get_lenc_uint()? as usize;
    let metadata = b.mysql_get_bytes(metadata_len)?;
    let mut m = metadata.as_slice();
    let mut column_metas = Vec::with_capacity(column_count);
    for column_type in &column_types {
      column_metas.push(Self::parse_meta(&mut m, *column_type)?);
    }

    let null_bitmap = b.mysql_get_bytes((column_count + 7) / 8)?;

    let mut signedness = vec![];
    let mut column_names = vec![];
    let mut enum_str_values = vec![];
    let mut set_str_values = vec![];

    // Optional metadata TLVs, present when binlog_row_metadata=FULL.
    // https://dev.mysql.com/doc/dev/mysql-server/latest/classbinary__log_1_1Table__map__event.html#Table_table_map_event_optional_metadata
    while !b.is_empty() {
      let field_type = b.mysql_get_u8()?;
      let field_len = b.mysql_get_lenc_uint()? as usize;
      let payload = b.mysql_get_bytes(field_len)?;
      match field_type {
        0x01 => signedness = payload,
        0x04 => {
          let mut p = payload.as_slice();
          while !p.is_empty() {
            column_names.push(p.mysql_get_lenc_string()?);
          }
        }
        0x05 => set_str_values = Self::parse_str_value_sets(&mut payload.as_slice())?,
        0x06 => enum_str_values = Self::parse_str_value_sets(&mut payload.as_slice())?,
        _ => {}
      }
    }

    Ok(TableMapEvent {
      table_id,
      flags,
      schema,
      table,
      column_types,
      column_metas,
      null_bitmap,
      signedness,
      column_names,
      enum_str_values,
      set_str_values,
    })
  }

  fn parse_meta(m: &mut &[u8], column_type: ColumnType) -> io::Result<u16> {
    use ColumnType::*;
    let meta = match column_type {
      MYSQL_TYPE_FLOAT | MYSQL_TYPE_DOUBLE | MYSQL_TYPE_JSON | MYSQL_TYPE_GEOMETRY | MYSQL_TYPE_TINY_BLOB
      | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB => m.mysql_get_u8()? as u16,
      MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING => m.mysql_get_uint_le(2)? as u16,
      // byte order matters: STRING packs the real type in the high byte.
      MYSQL_TYPE_STRING | MYSQL_TYPE_ENUM | MYSQL_TYPE_SET => {
        let high = m.mysql_get_u8()? as u16;
        let low = m.mysql_get_u8()? as u16;
        (high << 8) | low
      }
      MYSQL_TYPE_NEWDECIMAL => {
        let precision = m.mysql_get_u8()? as u16;
        let scale = m.mysql_get_u8()? as u16;
        (precision << 8) | scale
      }
      MYSQL_TYPE_BIT => {
        let bits = m.mysql_get_u8()? as u16;
        let bytes = m.mysql_get_u8()? as u16;
        (bytes << 8) | bits
      }
      MYSQL_TYPE_TIMESTAMP2 | MYSQL_TYPE_DATETIME2 | MYSQL_TYPE_TIME2 => m.mysql_get_u8()? as u16,
      _ => 0,
    };
    Ok(meta)
  }

  fn parse_str_value_sets(p: &mut &[u8]) -> io::Result<Vec<Vec<String>>> {
    let mut sets = vec![];
    while !p.is_empty() {
      let count = p.mysql_get_lenc_uint()? as usize;
      let mut values = Vec::with_capacity(count);
      for _ in 0..count {
        values.push(p.mysql_get_lenc_string()?);
      }
      sets.push(values);
    }
    Ok(sets)
  }

  pub fn column_count(&self) -> usize {
    self.column_types.len()
  }

  pub fn is_nullable(&self, index: usize) -> bool {
    self
      .null_bitmap
      .get(index / 8)
      .map(|byte| byte & (1 << (index % 8)) != 0)
      .unwrap_or(false)
  }

  /// Signedness of a column, looked up through the numeric-column bitmap
  /// (MSB first, one bit per numeric column in ordinal order).
  pub fn is_unsigned(&self, index: usize) -> bool {
    if !self.column_types.get(index).map(ColumnType::is_numeric).unwrap_or(false) {
      return false;
    }
    let numeric_index = self.column_types[..index].iter().filter(|t| t.is_numeric()).count();
    self
      .signedness
      .get(numeric_index / 8)
      .map(|byte| byte & (0x80 >> (numeric_index % 8)) != 0)
      .unwrap_or(false)
  }

  pub fn column_name(&self, index: usize) -> Option<&str> {
    self.column_names.get(index).map(String::as_str)
  }

  pub fn column_names(&self) -> &[String] {
    &self.column_names
  }

  /// Labels for the n-th enum-typed column of the table, when the server
  /// shipped them in the optional metadata.
  pub fn enum_labels(&self, enum_index: usize) -> Option<&[String]> {
    self.enum_str_values.get(enum_index).map(Vec::as_slice)
  }

  pub fn set_labels(&self, set_index: usize) -> Option<&[String]> {
    self.set_str_values.get(set_index).map(Vec::as_slice)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
  Insert,
  Update,
  Delete,
}

// https://dev.mysql.com/doc/dev/mysql-server/latest/classbinary__log_1_1Rows__event.html
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
  pub table_id: u64,
  pub flags: RowsFlags,
  pub kind: RowsKind,
  pub column_count: usize,
  columns_present: Vec<u8>,
  columns_present_update: Vec<u8>,
  rows_data: Vec<u8>,
}

impl RowsEvent {
  fn parse(mut b: &[u8], kind: RowsKind, v2: bool) -> io::Result<RowsEvent> {
    let table_id = b.mysql_get_uint_le(6)?;
    let flags = RowsFlags::from_bits_retain(b.mysql_get_uint_le(2)? as u16);

    if v2 {
      let extra_len = b.mysql_get_uint_le(2)? as usize;
      if extra_len > 2 {
        b.mysql_get_bytes(extra_len - 2)?;
      }
    }

    let column_count = b.mysql_get_lenc_uint()? as usize;
    let bitmap_len = (column_count + 7) / 8;
    let columns_present = b.mysql_get_bytes(bitmap_len)?;
    let columns_present_update = if kind == RowsKind::Update {
      b.mysql_get_bytes(bitmap_len)?
    } else {
      vec![]
    };
    let rows_data = b.to_vec();

    Ok(RowsEvent {
      table_id,
      flags,
      kind,
      column_count,
      columns_present,
      columns_present_update,
      rows_data,
    })
  }

  pub(crate) fn columns_present(&self) -> &[u8] {
    &self.columns_present
  }

  pub(crate) fn columns_present_update(&self) -> &[u8] {
    &self.columns_present_update
  }

  pub(crate) fn rows_data(&self) -> &[u8] {
    &self.rows_data
  }

  /// Decodes the row images against the table map that preceded this event
  /// in the stream.
  pub fn rows(&self, table_map: &TableMapEvent) -> io::Result<Vec<RowImage>> {
    rows::decode_rows(self, table_map)
  }
}
