use std::collections::HashMap;
use std::io;

use chrono::DateTime;
use tracing::{debug, info, warn};

use crate::binlog::{Event, EventHeader, EventPacket, RowsEvent, RowsFlags, RowsKind, TableMapEvent};
use crate::catalog::{self, Catalog, Stream, StreamSelection, SyncMode};
use crate::coerce;
use crate::error::{Error, Result};
use crate::sink::{Message, Operation, Sink};
use crate::source::{ReplicationSource, RowSource};
use crate::state::{Bookmark, LogPosition, State};
use crate::sync::{self, SyncOptions};
use crate::types::Value;

/// Per-stream drift lifecycle. Rows are only decoded for streams in
/// `Stable`; a stream whose rediscovery failed stays in `Rediscovering`
/// and its events are skipped until a later table map retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriftState {
  Stable,
  DriftDetected,
  Rediscovering,
}

/// Tails the replication log for every log-based stream that has completed
/// its initial snapshot, from the most advanced valid bookmark up to the
/// position the source reported when the pass started.
pub async fn sync_streams<R, P, S>(
  row_source: &mut R,
  replication: &mut P,
  sink: &mut S,
  catalog: &mut Catalog,
  state: &mut State,
  options: &SyncOptions,
) -> Result<u64>
where
  R: RowSource,
  P: ReplicationSource,
  S: Sink,
{
  let mut resume: Option<LogPosition> = None;
  let mut tracked = vec![];
  for stream in &catalog.streams {
    if stream.sync_mode != SyncMode::LogBased {
      continue;
    }
    let stream_id = stream.stream_id();
    if let Some(Bookmark::LogBased {
      position,
      schema_fingerprint,
    }) = state.bookmark(&stream_id)
    {
      if *schema_fingerprint != stream.fingerprint() {
        info!(stream = %stream_id, "column layout changed since the last run");
      }
      resume = Some(match resume.take() {
        Some(r) if r >= *position => r,
        _ => position.clone(),
      });
      tracked.push(stream_id);
    }
  }
  let Some(resume) = resume else {
    return Ok(0);
  };

  let target = sync::fetch_log_position(row_source, options).await?;
  if resume >= target {
    debug!(position = %resume, "replication log already consumed to target");
    return Ok(0);
  }
  info!(from = %resume, to = %target, "tailing replication log");

  connect_with_retries(replication, &resume, options).await?;

  let mut current = resume.clone();
  let mut committed = resume;
  let mut table_maps: HashMap<u64, TableMapEvent> = HashMap::new();
  let mut drift_states: HashMap<String, DriftState> = HashMap::new();
  let mut rows_emitted = 0u64;
  let mut since_checkpoint = 0u64;
  let mut skipped = 0u64;
  let mut attempts = 0u32;

  loop {
    let bytes = match tokio::time::timeout(options.read_timeout, replication.recv()).await {
      Err(_) => {
        attempts += 1;
        if attempts > options.max_retries {
          return Err(Error::Connection(io::Error::new(
            io::ErrorKind::TimedOut,
            "replication stream idle past the read timeout",
          )));
        }
        warn!(attempt = attempts, "replication read timed out, reconnecting");
        connect_with_retries(replication, &committed, options).await?;
        current = committed.clone();
        table_maps.clear();
        continue;
      }
      Ok(None) => break,
      Ok(Some(Err(err))) => {
        let err = Error::from(err);
        if !err.is_transient() || attempts >= options.max_retries {
          return Err(err);
        }
        attempts += 1;
        warn!(attempt = attempts, error = %err, "replication stream error, reconnecting");
        tokio::time::sleep(options.retry_backoff).await;
        connect_with_retries(replication, &committed, options).await?;
        current = committed.clone();
        table_maps.clear();
        continue;
      }
      Ok(Some(Ok(bytes))) => bytes,
    };
    attempts = 0;

    let packet = EventPacket::parse(&bytes)?;
    match packet.event {
      Event::Rotate(v) => {
        current = LogPosition {
          log_file: v.next_log_file,
          log_position: v.next_log_position,
        };
      }
      Event::TableMap(table_map) => {
        handle_table_map(row_source, sink, catalog, state, &mut drift_states, &mut table_maps, table_map).await?;
        advance(&mut current, &packet.header);
      }
      Event::Insert(v) | Event::Update(v) | Event::Delete(v) => {
        let stmt_end = v.flags.contains(RowsFlags::END_OF_STATEMENT);
        let skipped_before = skipped;
        let emitted = handle_rows(
          sink,
          catalog,
          &tracked,
          &drift_states,
          &table_maps,
          &packet.header,
          v,
          &mut skipped,
        )
        .await?;
        rows_emitted += emitted;
        // skipped events count toward the cadence too, so a long run of
        // untracked-table traffic still advances the committed position
        since_checkpoint += emitted + (skipped - skipped_before);
        advance(&mut current, &packet.header);

        if stmt_end && since_checkpoint >= options.batch_size as u64 {
          checkpoint(state, catalog, &tracked, &current);
          committed = current.clone();
          sync::emit_state(sink, state).await?;
          since_checkpoint = 0;
        }
      }
      Event::Format(_) | Event::Heartbeat | Event::Unsupported(_) => {
        advance(&mut current, &packet.header);
      }
    }

    if current >= target {
      break;
    }
  }

  checkpoint(state, catalog, &tracked, &current);
  sync::emit_state(sink, state).await?;

  debug!(rows = rows_emitted, skipped, position = %current, "log pass complete");
  Ok(rows_emitted)
}

async fn handle_table_map<R: RowSource, S: Sink>(
  row_source: &mut R,
  sink: &mut S,
  catalog: &mut Catalog,
  state: &State,
  drift_states: &mut HashMap<String, DriftState>,
  table_maps: &mut HashMap<u64, TableMapEvent>,
  table_map: TableMapEvent,
) -> Result<()> {
  let stream = catalog
    .stream(&table_map.schema, &table_map.table)
    .filter(|s| s.sync_mode == SyncMode::LogBased);

  if let Some(stream) = stream {
    let stream_id = stream.stream_id();
    if detect_drift(stream, &table_map) {
      info!(stream = %stream_id, "schema drift detected");
      drift_states.insert(stream_id.clone(), DriftState::DriftDetected);
      // push current progress downstream before the layout changes hands
      sync::emit_state(sink, state).await?;

      drift_states.insert(stream_id.clone(), DriftState::Rediscovering);
      let selection = StreamSelection {
        schema: stream.schema.clone(),
        table: stream.table.clone(),
        sync_mode: SyncMode::LogBased,
        replication_key: stream.replication_key.clone(),
      };
      match catalog::discover_stream(row_source, &selection).await {
        Ok(new_stream) => {
          sink.emit(&Message::schema(&new_stream)).await?;
          catalog.replace(new_stream);
          drift_states.insert(stream_id, DriftState::Stable);
        }
        Err(err) if err.is_transient() => return Err(err),
        Err(err) => {
          warn!(stream = %stream_id, error = %err, "rediscovery failed, stream paused");
        }
      }
    }
  }

  table_maps.insert(table_map.table_id, table_map);
  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_rows<S: Sink>(
  sink: &mut S,
  catalog: &Catalog,
  tracked: &[String],
  drift_states: &HashMap<String, DriftState>,
  table_maps: &HashMap<u64, TableMapEvent>,
  header: &EventHeader,
  event: RowsEvent,
  skipped: &mut u64,
) -> Result<u64> {
  let Some(table_map) = table_maps.get(&event.table_id) else {
    *skipped += 1;
    return Ok(0);
  };
  let stream = catalog
    .stream(&table_map.schema, &table_map.table)
    .filter(|s| s.sync_mode == SyncMode::LogBased);
  let Some(stream) = stream else {
    *skipped += 1;
    return Ok(0);
  };
  let stream_id = stream.stream_id();
  if !tracked.contains(&stream_id)
    || drift_states.get(&stream_id).copied().unwrap_or(DriftState::Stable) != DriftState::Stable
  {
    *skipped += 1;
    return Ok(0);
  }

  let mut emitted = 0u64;
  for image in event.rows(table_map)? {
    let message = match event.kind {
      RowsKind::Insert => {
        let after = coerce_image(stream, image.after.unwrap_or_default())?;
        Message::Record {
          stream: stream_id.clone(),
          operation: Operation::Insert,
          record: sync::record_map(stream, &after),
          before: None,
        }
      }
      RowsKind::Update => {
        let before = coerce_image(stream, image.before.unwrap_or_default())?;
        let after = coerce_image(stream, image.after.unwrap_or_default())?;
        Message::Record {
          stream: stream_id.clone(),
          operation: Operation::Update,
          record: sync::record_map(stream, &after),
          before: Some(sync::record_map(stream, &before)),
        }
      }
      RowsKind::Delete => {
        let before = coerce_image(stream, image.before.unwrap_or_default())?;
        let mut record = sync::record_map(stream, &before);
        record.insert("_deleted_at".into(), serde_json::json!(event_timestamp(header)));
        Message::Record {
          stream: stream_id.clone(),
          operation: Operation::Delete,
          record,
          before: None,
        }
      }
    };
    sink.emit(&message).await?;
    emitted += 1;
  }
  Ok(emitted)
}

fn coerce_image(stream: &Stream, values: Vec<crate::binlog::Value>) -> Result<Vec<Value>> {
  if values.len() != stream.columns.len() {
    return Err(Error::SchemaMismatch {
      stream: stream.stream_id(),
      detail: format!(
        "row image has {} columns, stream has {}",
        values.len(),
        stream.columns.len()
      ),
    });
  }
  values
    .into_iter()
    .zip(&stream.columns)
    .map(|(value, column)| coerce::coerce_binlog_value(value, column))
    .collect()
}

/// A layout change shows up as a column-count change, or as a name change
/// when the server ships column names in the table map.
fn detect_drift(stream: &Stream, table_map: &TableMapEvent) -> bool {
  if table_map.column_count() != stream.columns.len() {
    return true;
  }
  let names = table_map.column_names();
  !names.is_empty()
    && names
      .iter()
      .map(String::as_str)
      .ne(stream.columns.iter().map(|c| c.name.as_str()))
}

fn advance(current: &mut LogPosition, header: &EventHeader) {
  if header.log_position > 0 {
    current.log_position = header.log_position as u64;
  }
}

fn checkpoint(state: &mut State, catalog: &Catalog, tracked: &[String], position: &LogPosition) {
  for stream in &catalog.streams {
    let stream_id = stream.stream_id();
    if stream.sync_mode == SyncMode::LogBased && tracked.contains(&stream_id) {
      state.set_bookmark(
        stream_id,
        Bookmark::LogBased {
          position: position.clone(),
          schema_fingerprint: stream.fingerprint(),
        },
      );
    }
  }
}

fn event_timestamp(header: &EventHeader) -> String {
  DateTime::from_timestamp(header.timestamp as i64, 0)
    .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S+00:00").to_string())
    .unwrap_or_default()
}

async fn connect_with_retries<P: ReplicationSource>(
  replication: &mut P,
  position: &LogPosition,
  options: &SyncOptions,
) -> Result<()> {
  let mut attempts = 0;
  loop {
    match replication.connect(position).await {
      Ok(()) => return Ok(()),
      Err(err @ Error::PurgedPosition { .. }) => return Err(err),
      Err(err) if err.is_transient() && attempts < options.max_retries => {
        attempts += 1;
        warn!(attempt = attempts, error = %err, "replication connect failed, retrying");
        tokio::time::sleep(options.retry_backoff).await;
      }
      Err(err) => return Err(err),
    }
  }
}
