use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::source::RowSource;
use crate::types::{self, CanonicalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
  FullTable,
  Incremental,
  LogBased,
}

/// What the host asks to replicate: one table, one strategy, and for
/// incremental streams the column to cursor on.
#[derive(Debug, Clone)]
pub struct StreamSelection {
  pub schema: String,
  pub table: String,
  pub sync_mode: SyncMode,
  pub replication_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
  pub name: String,
  #[serde(rename = "type")]
  pub canonical_type: CanonicalType,
  pub native_type: String,
  pub nullable: bool,
}

impl ColumnDescriptor {
  pub fn is_unsigned(&self) -> bool {
    types::is_unsigned(&self.native_type)
  }

  pub fn fixed_binary_width(&self) -> Option<usize> {
    types::fixed_binary_width(&self.native_type)
  }
}

#[derive(Debug, Clone)]
pub struct Stream {
  pub schema: String,
  pub table: String,
  pub columns: Vec<ColumnDescriptor>,
  pub key_columns: Vec<String>,
  pub sync_mode: SyncMode,
  pub replication_key: Option<String>,
}

impl Stream {
  pub fn stream_id(&self) -> String {
    format!("{}.{}", self.schema, self.table)
  }

  pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
    self.columns.iter().find(|c| c.name == name)
  }

  /// Stable digest of the discovered column layout (names and native
  /// types, in ordinal order). Stored in log-based bookmarks so a layout
  /// change across runs is caught before any row image is decoded.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha1::new();
    for column in &self.columns {
      hasher.update(column.name.as_bytes());
      hasher.update(b":");
      hasher.update(column.native_type.as_bytes());
      hasher.update(b"\n");
    }
    types::hex_string(&hasher.finalize())
  }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
  pub streams: Vec<Stream>,
}

impl Catalog {
  pub fn stream(&self, schema: &str, table: &str) -> Option<&Stream> {
    self.streams.iter().find(|s| s.schema == schema && s.table == table)
  }

  pub fn replace(&mut self, stream: Stream) {
    match self
      .streams
      .iter_mut()
      .find(|s| s.schema == stream.schema && s.table == stream.table)
    {
      Some(existing) => *existing = stream,
      None => self.streams.push(stream),
    }
  }
}

/// Discovers every selected stream. A stream whose layout cannot be mapped
/// or validated is excluded and reported; the remaining streams proceed.
pub async fn discover<R: RowSource>(
  source: &mut R,
  selections: &[StreamSelection],
) -> Result<(Catalog, Vec<Error>)> {
  let mut catalog = Catalog::default();
  let mut excluded = vec![];

  for selection in selections {
    match discover_stream(source, selection).await {
      Ok(stream) => {
        debug!(
          stream = %stream.stream_id(),
          columns = stream.columns.len(),
          "discovered stream"
        );
        catalog.streams.push(stream);
      }
      Err(err) if err.is_transient() => return Err(err),
      Err(err) => {
        warn!(schema = %selection.schema, table = %selection.table, error = %err, "stream excluded");
        excluded.push(err);
      }
    }
  }

  Ok((catalog, excluded))
}

/// Discovers a single stream's live layout. Also used mid-pass when the
/// log-based strategy detects drift.
pub async fn discover_stream<R: RowSource>(source: &mut R, selection: &StreamSelection) -> Result<Stream> {
  let stream_id = format!("{}.{}", selection.schema, selection.table);

  let sql = format!(
    "SELECT column_name, column_type, is_nullable, column_key \
     FROM information_schema.columns \
     WHERE table_schema = {} AND table_name = {} \
     ORDER BY ordinal_position",
    escape_string_literal(&selection.schema),
    escape_string_literal(&selection.table),
  );
  let results = source.query(&sql).await?;

  if results.rows_len() == 0 {
    return Err(Error::SchemaMismatch {
      stream: stream_id,
      detail: "table not found".into(),
    });
  }

  let mut columns = vec![];
  let mut key_columns = vec![];
  for row in results.rows() {
    let name = cell_text(row, 0);
    let native_type = cell_text(row, 1);
    let nullable = cell_text(row, 2).eq_ignore_ascii_case("YES");
    let column_key = cell_text(row, 3);

    let canonical_type = types::map_native_type(&native_type).ok_or_else(|| Error::TypeMapping {
      stream: stream_id.clone(),
      column: name.clone(),
      native_type: native_type.clone(),
    })?;

    if column_key.eq_ignore_ascii_case("PRI") {
      key_columns.push(name.clone());
    }
    columns.push(ColumnDescriptor {
      name,
      canonical_type,
      native_type,
      nullable,
    });
  }

  let stream = Stream {
    schema: selection.schema.clone(),
    table: selection.table.clone(),
    columns,
    key_columns,
    sync_mode: selection.sync_mode,
    replication_key: selection.replication_key.clone(),
  };

  validate_stream(&stream)?;
  Ok(stream)
}

fn validate_stream(stream: &Stream) -> Result<()> {
  match stream.sync_mode {
    SyncMode::LogBased if stream.key_columns.is_empty() => Err(Error::SchemaMismatch {
      stream: stream.stream_id(),
      detail: "log-based replication requires a primary key".into(),
    }),
    SyncMode::Incremental => {
      let key = stream.replication_key.as_deref().ok_or_else(|| Error::SchemaMismatch {
        stream: stream.stream_id(),
        detail: "incremental replication requires a replication key".into(),
      })?;
      if stream.column(key).is_none() {
        return Err(Error::SchemaMismatch {
          stream: stream.stream_id(),
          detail: format!("replication key {} is not a column", key),
        });
      }
      Ok(())
    }
    _ => Ok(()),
  }
}

fn cell_text(row: &[crate::source::RowValue], index: usize) -> String {
  row
    .get(index)
    .and_then(|cell| cell.as_deref())
    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    .unwrap_or_default()
}

pub(crate) fn escape_identifier(name: &str) -> String {
  format!("`{}`", name.replace('`', "``"))
}

pub(crate) fn escape_string_literal(value: &str) -> String {
  format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::source::{QueryResults, RowValue};
  use std::collections::VecDeque;
  use std::io;

  struct ScriptedSource {
    responses: VecDeque<QueryResults>,
  }

  impl RowSource for ScriptedSource {
    async fn query(&mut self, _sql: &str) -> io::Result<QueryResults> {
      self
        .responses
        .pop_front()
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted response"))
    }
  }

  fn column_row(name: &str, native_type: &str, nullable: &str, key: &str) -> Vec<RowValue> {
    vec![
      Some(name.as_bytes().to_vec()),
      Some(native_type.as_bytes().to_vec()),
      Some(nullable.as_bytes().to_vec()),
      Some(key.as_bytes().to_vec()),
    ]
  }

  fn columns_result(rows: Vec<Vec<RowValue>>) -> QueryResults {
    QueryResults {
      columns: vec![
        "column_name".into(),
        "column_type".into(),
        "is_nullable".into(),
        "column_key".into(),
      ],
      values: rows.into_iter().flatten().collect(),
    }
  }

  #[tokio::test]
  async fn test_discover_stream() {
    let mut source = ScriptedSource {
      responses: VecDeque::from([columns_result(vec![
        column_row("id", "int(11)", "NO", "PRI"),
        column_row("flag", "bit(1)", "YES", ""),
        column_row("b", "binary(4)", "YES", ""),
      ])]),
    };
    let selection = StreamSelection {
      schema: "app".into(),
      table: "users".into(),
      sync_mode: SyncMode::LogBased,
      replication_key: None,
    };

    let stream = discover_stream(&mut source, &selection).await.unwrap();
    assert_eq!(stream.stream_id(), "app.users");
    assert_eq!(stream.key_columns, vec!["id"]);
    assert_eq!(stream.columns[1].canonical_type, CanonicalType::Boolean);
    assert_eq!(stream.columns[2].fixed_binary_width(), Some(4));
  }

  #[tokio::test]
  async fn test_discover_unmapped_type_excludes_stream() {
    let mut source = ScriptedSource {
      responses: VecDeque::from([
        columns_result(vec![column_row("id", "int(11)", "NO", "PRI")]),
        columns_result(vec![column_row("weird", "whatever(3)", "YES", "")]),
      ]),
    };
    let selections = vec![
      StreamSelection {
        schema: "app".into(),
        table: "users".into(),
        sync_mode: SyncMode::FullTable,
        replication_key: None,
      },
      StreamSelection {
        schema: "app".into(),
        table: "oddities".into(),
        sync_mode: SyncMode::FullTable,
        replication_key: None,
      },
    ];

    let (catalog, excluded) = discover(&mut source, &selections).await.unwrap();
    assert_eq!(catalog.streams.len(), 1);
    assert_eq!(excluded.len(), 1);
    assert!(matches!(&excluded[0], Error::TypeMapping { column, .. } if column == "weird"));
  }

  #[tokio::test]
  async fn test_log_based_requires_primary_key() {
    let mut source = ScriptedSource {
      responses: VecDeque::from([columns_result(vec![column_row("v", "int(11)", "YES", "")])]),
    };
    let selection = StreamSelection {
      schema: "app".into(),
      table: "no_pk".into(),
      sync_mode: SyncMode::LogBased,
      replication_key: None,
    };

    let err = discover_stream(&mut source, &selection).await.unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch { .. }));
  }

  #[test]
  fn test_fingerprint_tracks_layout() {
    let descriptor = |name: &str, native: &str| ColumnDescriptor {
      name: name.into(),
      canonical_type: CanonicalType::Integer,
      native_type: native.into(),
      nullable: false,
    };
    let mut stream = Stream {
      schema: "app".into(),
      table: "users".into(),
      columns: vec![descriptor("id", "int(11)")],
      key_columns: vec!["id".into()],
      sync_mode: SyncMode::LogBased,
      replication_key: None,
    };
    let before = stream.fingerprint();
    stream.columns.push(descriptor("age", "int(11)"));
    assert_ne!(stream.fingerprint(), before);
  }

  #[test]
  fn test_escaping() {
    assert_eq!(escape_identifier("a`b"), "`a``b`");
    assert_eq!(escape_string_literal("o'clock"), "'o''clock'");
  }
}
