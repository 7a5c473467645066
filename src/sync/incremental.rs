use tracing::{debug, warn};

use crate::catalog::{escape_identifier, Stream};
use crate::coerce;
use crate::error::{Error, Result};
use crate::sink::{Message, Operation, Sink};
use crate::source::RowSource;
use crate::state::{Bookmark, State};
use crate::sync::{self, SyncOptions};
use crate::types::Value;

/// Scans rows in replication-key order, resuming from the bookmarked key.
/// The first page after a resume is inclusive of the bookmarked value, so
/// rows that share the bookmark key and committed after the previous run
/// are not lost; later pages advance strictly. Rows at a key that was
/// already emitted may repeat, deletes are invisible.
pub async fn sync_stream<R: RowSource, S: Sink>(
  source: &mut R,
  sink: &mut S,
  stream: &Stream,
  state: &mut State,
  options: &SyncOptions,
) -> Result<u64> {
  let stream_id = stream.stream_id();
  let replication_key = stream.replication_key.clone().ok_or_else(|| Error::SchemaMismatch {
    stream: stream_id.clone(),
    detail: "incremental replication requires a replication key".into(),
  })?;
  let key_column = stream.column(&replication_key).ok_or_else(|| Error::SchemaMismatch {
    stream: stream_id.clone(),
    detail: format!("replication key {} is not a column", replication_key),
  })?;
  let key_index = stream.columns.iter().position(|c| c.name == replication_key).unwrap_or(0);

  let mut cursor = match state.bookmark(&stream_id) {
    Some(Bookmark::Incremental {
      replication_key: bookmarked_key,
      last_value,
    }) if bookmarked_key == &replication_key => last_value.clone(),
    Some(Bookmark::Incremental {
      replication_key: bookmarked_key,
      ..
    }) => {
      warn!(
        stream = %stream_id,
        old_key = %bookmarked_key,
        new_key = %replication_key,
        "replication key changed, restarting from the beginning"
      );
      None
    }
    _ => None,
  };

  let mut last_seen: Option<Value> = None;
  let mut rows_emitted = 0u64;
  let mut inclusive = cursor.is_some();

  loop {
    let sql = select_sql(stream, &replication_key, cursor.as_ref(), inclusive, options.batch_size);
    let results = sync::query_with_retries(source, &sql, options).await?;
    sync::verify_layout(stream, &results.columns)?;

    let page_len = results.rows_len();
    for row in results.rows() {
      let mut values = Vec::with_capacity(stream.columns.len());
      for (cell, column) in row.iter().zip(&stream.columns) {
        values.push(coerce::coerce_scan_value(cell, column)?);
      }

      let key_value = coerce::coerce_scan_value(&row[key_index], key_column)?;
      if let Some(previous) = &last_seen {
        if key_value.compare(previous) == Some(std::cmp::Ordering::Less) {
          warn!(stream = %stream_id, key = %replication_key, "replication key is not monotonic");
        }
      }
      last_seen = Some(key_value);

      sink
        .emit(&Message::Record {
          stream: stream_id.clone(),
          operation: Operation::Insert,
          record: sync::record_map(stream, &values),
          before: None,
        })
        .await?;
      rows_emitted += 1;

      cursor = Some(match &row[key_index] {
        Some(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        None => serde_json::Value::Null,
      });
    }

    if page_len > 0 {
      state.set_bookmark(
        stream_id.clone(),
        Bookmark::Incremental {
          replication_key: replication_key.clone(),
          last_value: cursor.clone(),
        },
      );
      sync::emit_state(sink, state).await?;
    }

    if page_len < options.batch_size {
      break;
    }
    inclusive = false;
  }

  debug!(stream = %stream_id, rows = rows_emitted, "incremental scan complete");
  Ok(rows_emitted)
}

fn select_sql(
  stream: &Stream,
  replication_key: &str,
  cursor: Option<&serde_json::Value>,
  inclusive: bool,
  batch_size: usize,
) -> String {
  let columns = stream
    .columns
    .iter()
    .map(|c| escape_identifier(&c.name))
    .collect::<Vec<_>>()
    .join(", ");
  let key = escape_identifier(replication_key);

  let mut sql = format!(
    "SELECT {} FROM {}.{}",
    columns,
    escape_identifier(&stream.schema),
    escape_identifier(&stream.table)
  );
  if let Some(cursor) = cursor {
    let op = if inclusive { ">=" } else { ">" };
    sql.push_str(&format!(" WHERE {} {} {}", key, op, sync::sql_literal(cursor)));
  }
  sql.push_str(&format!(" ORDER BY {} LIMIT {}", key, batch_size));
  sql
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::catalog::{ColumnDescriptor, SyncMode};
  use crate::types::CanonicalType;

  fn stream() -> Stream {
    let descriptor = |name: &str, native: &str, canonical| ColumnDescriptor {
      name: name.into(),
      canonical_type: canonical,
      native_type: native.into(),
      nullable: false,
    };
    Stream {
      schema: "app".into(),
      table: "orders".into(),
      columns: vec![
        descriptor("id", "int(11)", CanonicalType::Integer),
        descriptor("updated_at", "datetime", CanonicalType::Timestamp),
      ],
      key_columns: vec!["id".into()],
      sync_mode: SyncMode::Incremental,
      replication_key: Some("updated_at".into()),
    }
  }

  #[test]
  fn test_select_sql_first_run() {
    let sql = select_sql(&stream(), "updated_at", None, false, 500);
    assert_eq!(
      sql,
      "SELECT `id`, `updated_at` FROM `app`.`orders` ORDER BY `updated_at` LIMIT 500"
    );
  }

  #[test]
  fn test_select_sql_resume_is_inclusive() {
    let cursor = serde_json::json!("2023-05-01 00:00:00");
    let sql = select_sql(&stream(), "updated_at", Some(&cursor), true, 500);
    assert_eq!(
      sql,
      "SELECT `id`, `updated_at` FROM `app`.`orders` WHERE `updated_at` >= '2023-05-01 00:00:00' ORDER BY `updated_at` LIMIT 500"
    );
  }

  #[test]
  fn test_select_sql_pagination_is_strict() {
    let cursor = serde_json::json!("2023-05-01 00:00:00");
    let sql = select_sql(&stream(), "updated_at", Some(&cursor), false, 500);
    assert!(sql.contains("`updated_at` > '2023-05-01 00:00:00'"));
  }
}
