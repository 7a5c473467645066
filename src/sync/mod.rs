pub mod full_table;
pub mod incremental;
pub mod log_based;

use std::time::Duration;

use tracing::warn;

use crate::catalog::{self, StreamSelection, SyncMode};
use crate::error::{Error, Result};
use crate::sink::{Message, Sink};
use crate::source::{QueryResults, ReplicationSource, RowSource};
use crate::state::{Bookmark, LogPosition, State};
use crate::types::Value;

#[derive(Debug, Clone)]
pub struct SyncOptions {
  /// Rows per scan page and per log-based checkpoint interval.
  pub batch_size: usize,
  /// Bound on consecutive reconnect attempts for transient failures.
  pub max_retries: u32,
  pub retry_backoff: Duration,
  /// Replication reads idle longer than this reconnect instead of failing.
  pub read_timeout: Duration,
}

impl Default for SyncOptions {
  fn default() -> SyncOptions {
    SyncOptions {
      batch_size: 1000,
      max_retries: 5,
      retry_backoff: Duration::from_millis(250),
      read_timeout: Duration::from_secs(30),
    }
  }
}

#[derive(Debug, Default)]
pub struct SyncSummary {
  pub rows_emitted: u64,
  /// Stream-scoped errors that excluded a stream without aborting the run.
  pub excluded: Vec<Error>,
}

/// Runs one complete sync pass: discovery, schema messages, full-table and
/// incremental streams in selection order, initial snapshots for log-based
/// streams, then a single shared log-based pass to the position the source
/// was at when the pass started.
pub async fn run<R, P, S>(
  row_source: &mut R,
  replication: &mut P,
  sink: &mut S,
  selections: &[StreamSelection],
  state: &mut State,
  options: &SyncOptions,
) -> Result<SyncSummary>
where
  R: RowSource,
  P: ReplicationSource,
  S: Sink,
{
  let (mut catalog, excluded) = catalog::discover(row_source, selections).await?;
  let mut summary = SyncSummary {
    rows_emitted: 0,
    excluded,
  };

  for stream in &catalog.streams {
    sink.emit(&Message::schema(stream)).await?;
  }

  for stream in &catalog.streams {
    let stream_id = stream.stream_id();
    let outcome = match stream.sync_mode {
      SyncMode::FullTable => full_table::sync_stream(row_source, sink, stream, state, options).await,
      SyncMode::Incremental => incremental::sync_stream(row_source, sink, stream, state, options).await,
      SyncMode::LogBased => snapshot_log_based_stream(row_source, sink, stream, state, options).await,
    };
    match outcome {
      Ok(rows) => summary.rows_emitted += rows,
      Err(err @ (Error::TypeMapping { .. } | Error::SchemaMismatch { .. })) => {
        warn!(stream = %stream_id, error = %err, "stream excluded mid-run");
        summary.excluded.push(err);
      }
      Err(err) => return Err(err),
    }
  }

  summary.rows_emitted += log_based::sync_streams(row_source, replication, sink, &mut catalog, state, options).await?;

  Ok(summary)
}

/// Initial snapshot for a log-based stream. The log position is captured
/// before the first scanned row so the tail pass starts at-or-before the
/// snapshot, never after it.
async fn snapshot_log_based_stream<R: RowSource, S: Sink>(
  row_source: &mut R,
  sink: &mut S,
  stream: &crate::catalog::Stream,
  state: &mut State,
  options: &SyncOptions,
) -> Result<u64> {
  let stream_id = stream.stream_id();

  if let Some(Bookmark::LogBased { .. }) = state.bookmark(&stream_id) {
    return Ok(0);
  }

  // A completed snapshot that crashed before its bookmark converted still
  // carries the position captured before the scan; hand it off as-is
  // instead of scanning the table again.
  if let Some(Bookmark::FullTable {
    initial_complete: true,
    log_position: Some(position),
    ..
  }) = state.bookmark(&stream_id)
  {
    let position = position.clone();
    state.set_bookmark(
      stream_id,
      Bookmark::LogBased {
        position,
        schema_fingerprint: stream.fingerprint(),
      },
    );
    emit_state(sink, state).await?;
    return Ok(0);
  }

  let snapshot_in_progress = matches!(
    state.bookmark(&stream_id),
    Some(Bookmark::FullTable {
      initial_complete: false,
      log_position: Some(_),
      ..
    })
  );
  if !snapshot_in_progress {
    let position = fetch_log_position(row_source, options).await?;
    state.set_bookmark(
      stream_id.clone(),
      Bookmark::FullTable {
        last_pk_fetched: None,
        initial_complete: false,
        log_position: Some(position),
      },
    );
  }

  let rows = full_table::sync_stream(row_source, sink, stream, state, options).await?;

  let position = match state.bookmark(&stream_id) {
    Some(Bookmark::FullTable {
      log_position: Some(position),
      ..
    }) => position.clone(),
    _ => fetch_log_position(row_source, options).await?,
  };
  state.set_bookmark(
    stream_id,
    Bookmark::LogBased {
      position,
      schema_fingerprint: stream.fingerprint(),
    },
  );
  emit_state(sink, state).await?;

  Ok(rows)
}

/// Current head of the replication log, read over the row connection.
pub(crate) async fn fetch_log_position<R: RowSource>(source: &mut R, options: &SyncOptions) -> Result<LogPosition> {
  let results = query_with_retries(source, "SHOW MASTER STATUS", options).await?;
  let row = results
    .rows()
    .next()
    .ok_or_else(|| Error::Protocol("binary logging is not enabled on the source".into()))?;

  let log_file = row
    .first()
    .and_then(|cell| cell.as_deref())
    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    .ok_or_else(|| Error::Protocol("malformed log status row".into()))?;
  let log_position = row
    .get(1)
    .and_then(|cell| cell.as_deref())
    .and_then(|bytes| std::str::from_utf8(bytes).ok())
    .and_then(|text| text.parse().ok())
    .ok_or_else(|| Error::Protocol("malformed log status row".into()))?;

  Ok(LogPosition { log_file, log_position })
}

pub(crate) async fn query_with_retries<R: RowSource>(
  source: &mut R,
  sql: &str,
  options: &SyncOptions,
) -> Result<QueryResults> {
  let mut attempts = 0;
  loop {
    match source.query(sql).await {
      Ok(results) => return Ok(results),
      Err(err) => {
        let err = Error::from(err);
        if !err.is_transient() || attempts >= options.max_retries {
          return Err(err);
        }
        attempts += 1;
        warn!(attempt = attempts, error = %err, "query failed, retrying");
        tokio::time::sleep(options.retry_backoff).await;
      }
    }
  }
}

pub(crate) async fn emit_state<S: Sink>(sink: &mut S, state: &State) -> Result<()> {
  sink
    .emit(&Message::State { value: state.snapshot() })
    .await
    .map_err(Error::from)
}

/// Result sets must come back in the discovered column layout; anything
/// else means the table changed under the scan.
pub(crate) fn verify_layout(stream: &crate::catalog::Stream, columns: &[String]) -> Result<()> {
  let expected = stream.columns.iter().map(|c| c.name.as_str());
  if columns.len() != stream.columns.len() || !expected.eq(columns.iter().map(String::as_str)) {
    return Err(Error::SchemaMismatch {
      stream: stream.stream_id(),
      detail: format!("scan returned columns {:?}", columns),
    });
  }
  Ok(())
}

pub(crate) fn record_map(
  stream: &crate::catalog::Stream,
  values: &[Value],
) -> serde_json::Map<String, serde_json::Value> {
  stream
    .columns
    .iter()
    .zip(values)
    .map(|(column, value)| (column.name.clone(), value.to_json()))
    .collect()
}

/// Renders a bookmarked cursor value into a SQL literal. Cursor values are
/// stored as the raw text the source returned, so a quoted literal always
/// compares correctly on the source's side.
pub(crate) fn sql_literal(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::Number(n) => n.to_string(),
    serde_json::Value::String(s) => catalog::escape_string_literal(s),
    serde_json::Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
    _ => "NULL".to_string(),
  }
}
