use tracing::{debug, info};

use crate::catalog::{escape_identifier, Stream};
use crate::coerce;
use crate::error::Result;
use crate::sink::{Message, Operation, Sink};
use crate::source::RowSource;
use crate::state::{Bookmark, State};
use crate::sync::{self, SyncOptions};

/// Snapshots a table in primary-key order, one bounded page at a time.
/// Streams with a primary key resume mid-scan from the bookmarked key;
/// streams without one are scanned in a single unordered pass and restart
/// from the top if interrupted.
pub async fn sync_stream<R: RowSource, S: Sink>(
  source: &mut R,
  sink: &mut S,
  stream: &Stream,
  state: &mut State,
  options: &SyncOptions,
) -> Result<u64> {
  let stream_id = stream.stream_id();
  let resumable = !stream.key_columns.is_empty();

  let (mut cursor, log_position) = match state.bookmark(&stream_id) {
    Some(Bookmark::FullTable {
      last_pk_fetched,
      initial_complete: false,
      log_position,
    }) if resumable => (last_pk_fetched.clone(), log_position.clone()),
    Some(Bookmark::FullTable { log_position, .. }) => (None, log_position.clone()),
    _ => (None, None),
  };
  if cursor.is_some() {
    info!(stream = %stream_id, "resuming interrupted scan");
  }

  let key_indexes = stream
    .key_columns
    .iter()
    .filter_map(|key| stream.columns.iter().position(|c| &c.name == key))
    .collect::<Vec<_>>();

  let mut rows_emitted = 0u64;
  loop {
    let sql = select_sql(stream, cursor.as_deref(), options.batch_size, resumable);
    let results = sync::query_with_retries(source, &sql, options).await?;
    sync::verify_layout(stream, &results.columns)?;

    let page_len = results.rows_len();
    for row in results.rows() {
      let mut values = Vec::with_capacity(stream.columns.len());
      for (cell, column) in row.iter().zip(&stream.columns) {
        values.push(coerce::coerce_scan_value(cell, column)?);
      }
      sink
        .emit(&Message::Record {
          stream: stream_id.clone(),
          operation: Operation::Insert,
          record: sync::record_map(stream, &values),
          before: None,
        })
        .await?;
      rows_emitted += 1;

      if resumable {
        cursor = Some(
          key_indexes
            .iter()
            .map(|i| match &row[*i] {
              Some(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
              None => serde_json::Value::Null,
            })
            .collect(),
        );
      }
    }

    if resumable && page_len == options.batch_size {
      state.set_bookmark(
        stream_id.clone(),
        Bookmark::FullTable {
          last_pk_fetched: cursor.clone(),
          initial_complete: false,
          log_position: log_position.clone(),
        },
      );
      sync::emit_state(sink, state).await?;
      continue;
    }
    break;
  }

  state.set_bookmark(
    stream_id.clone(),
    Bookmark::FullTable {
      last_pk_fetched: None,
      initial_complete: true,
      log_position,
    },
  );
  sync::emit_state(sink, state).await?;

  debug!(stream = %stream_id, rows = rows_emitted, "scan complete");
  Ok(rows_emitted)
}

fn select_sql(stream: &Stream, cursor: Option<&[serde_json::Value]>, batch_size: usize, resumable: bool) -> String {
  let columns = stream
    .columns
    .iter()
    .map(|c| escape_identifier(&c.name))
    .collect::<Vec<_>>()
    .join(", ");
  let keys = stream
    .key_columns
    .iter()
    .map(|k| escape_identifier(k))
    .collect::<Vec<_>>()
    .join(", ");

  let mut sql = format!(
    "SELECT {} FROM {}.{}",
    columns,
    escape_identifier(&stream.schema),
    escape_identifier(&stream.table)
  );
  if let Some(cursor) = cursor {
    let literals = cursor.iter().map(sync::sql_literal).collect::<Vec<_>>().join(", ");
    sql.push_str(&format!(" WHERE ({}) > ({})", keys, literals));
  }
  if resumable {
    sql.push_str(&format!(" ORDER BY {} LIMIT {}", keys, batch_size));
  }
  sql
}
