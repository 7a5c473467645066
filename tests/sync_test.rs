use std::collections::VecDeque;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use tapioca::catalog::{StreamSelection, SyncMode};
use tapioca::sink::{Message, Operation, Sink};
use tapioca::source::{QueryResults, ReplicationSource, RowSource, RowValue};
use tapioca::state::{Bookmark, LogPosition, State};
use tapioca::sync::{self, SyncOptions};
use tapioca::Error;

const TABLE_MAP_EVENT: u8 = 0x13;
const WRITE_ROWS_EVENT: u8 = 0x1e;
const UPDATE_ROWS_EVENT: u8 = 0x1f;
const DELETE_ROWS_EVENT: u8 = 0x20;
const XID_EVENT: u8 = 0x10;

fn lenc(out: &mut BytesMut, v: u64) {
  if v <= 250 {
    out.put_u8(v as u8);
  } else {
    out.put_u8(0xfc);
    out.put_u16_le(v as u16);
  }
}

fn packet(timestamp: u32, event_type: u8, log_position: u32, body: &[u8]) -> Bytes {
  let mut out = BytesMut::new();
  out.put_u8(0x00);
  out.put_u32_le(timestamp);
  out.put_u8(event_type);
  out.put_u32_le(1);
  out.put_u32_le(19 + body.len() as u32);
  out.put_u32_le(log_position);
  out.put_u16_le(0);
  out.put_slice(body);
  out.freeze()
}

/// column = (wire type, metadata bytes)
fn table_map_body(table_id: u64, schema: &str, table: &str, columns: &[(u8, Vec<u8>)], names: &[&str]) -> Vec<u8> {
  let mut out = BytesMut::new();
  out.put_uint_le(table_id, 6);
  out.put_u16_le(1);
  out.put_u8(schema.len() as u8);
  out.put_slice(schema.as_bytes());
  out.put_u8(0);
  out.put_u8(table.len() as u8);
  out.put_slice(table.as_bytes());
  out.put_u8(0);
  lenc(&mut out, columns.len() as u64);
  for (wire_type, _) in columns {
    out.put_u8(*wire_type);
  }
  let metadata = columns.iter().flat_map(|(_, m)| m.clone()).collect::<Vec<_>>();
  lenc(&mut out, metadata.len() as u64);
  out.put_slice(&metadata);
  out.put_slice(&vec![0u8; (columns.len() + 7) / 8]);
  if !names.is_empty() {
    let mut payload = BytesMut::new();
    for name in names {
      lenc(&mut payload, name.len() as u64);
      payload.put_slice(name.as_bytes());
    }
    out.put_u8(0x04);
    lenc(&mut out, payload.len() as u64);
    out.put_slice(&payload);
  }
  out.to_vec()
}

fn rows_body(table_id: u64, column_count: usize, images: &[&[u8]], update: bool) -> Vec<u8> {
  let mut out = BytesMut::new();
  out.put_uint_le(table_id, 6);
  out.put_u16_le(0x0001);
  out.put_u16_le(2);
  lenc(&mut out, column_count as u64);
  let present = vec![0xffu8; (column_count + 7) / 8];
  out.put_slice(&present);
  if update {
    out.put_slice(&present);
  }
  for image in images {
    out.put_slice(image);
  }
  out.to_vec()
}

/// row image with an int id and a varchar value, nothing null
fn id_value_image(id: i32, value: &str) -> Vec<u8> {
  let mut out = vec![0u8];
  out.extend_from_slice(&id.to_le_bytes());
  out.push(value.len() as u8);
  out.extend_from_slice(value.as_bytes());
  out
}

struct FakeRowSource {
  /// (substring the SQL must contain, response)
  script: VecDeque<(&'static str, QueryResults)>,
  queries: Vec<String>,
}

impl FakeRowSource {
  fn new(script: Vec<(&'static str, QueryResults)>) -> FakeRowSource {
    FakeRowSource {
      script: script.into(),
      queries: vec![],
    }
  }
}

impl RowSource for FakeRowSource {
  async fn query(&mut self, sql: &str) -> io::Result<QueryResults> {
    self.queries.push(sql.to_string());
    let (needle, response) = self
      .script
      .pop_front()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unexpected query: {}", sql)))?;
    if !sql.contains(needle) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("expected query containing {:?}, got {:?}", needle, sql),
      ));
    }
    Ok(response)
  }
}

struct FakeReplicationSource {
  /// (position the event ends at, raw packet)
  events: Vec<(u64, Bytes)>,
  cursor: usize,
  retention_floor: Option<LogPosition>,
}

impl FakeReplicationSource {
  fn new(events: Vec<(u64, Bytes)>) -> FakeReplicationSource {
    FakeReplicationSource {
      events,
      cursor: 0,
      retention_floor: None,
    }
  }
}

impl ReplicationSource for FakeReplicationSource {
  async fn connect(&mut self, position: &LogPosition) -> tapioca::Result<()> {
    if let Some(floor) = &self.retention_floor {
      if position < floor {
        return Err(Error::PurgedPosition {
          requested: position.clone(),
        });
      }
    }
    self.cursor = self.events.iter().position(|(p, _)| *p > position.log_position).unwrap_or(self.events.len());
    Ok(())
  }

  async fn recv(&mut self) -> Option<io::Result<Bytes>> {
    let event = self.events.get(self.cursor)?;
    self.cursor += 1;
    Some(Ok(event.1.clone()))
  }
}

#[derive(Default)]
struct CollectingSink {
  messages: Vec<Message>,
}

impl Sink for CollectingSink {
  async fn emit(&mut self, message: &Message) -> io::Result<()> {
    self.messages.push(message.clone());
    Ok(())
  }
}

fn columns_response(rows: &[(&str, &str, &str, &str)]) -> QueryResults {
  QueryResults {
    columns: vec![
      "column_name".into(),
      "column_type".into(),
      "is_nullable".into(),
      "column_key".into(),
    ],
    values: rows
      .iter()
      .flat_map(|(name, native, nullable, key)| {
        vec![
          Some(name.as_bytes().to_vec()),
          Some(native.as_bytes().to_vec()),
          Some(nullable.as_bytes().to_vec()),
          Some(key.as_bytes().to_vec()),
        ]
      })
      .collect(),
  }
}

fn master_status(file: &str, position: u64) -> QueryResults {
  QueryResults {
    columns: vec!["File".into(), "Position".into()],
    values: vec![
      Some(file.as_bytes().to_vec()),
      Some(position.to_string().into_bytes()),
    ],
  }
}

fn data_response(columns: &[&str], rows: Vec<Vec<RowValue>>) -> QueryResults {
  QueryResults {
    columns: columns.iter().map(|c| c.to_string()).collect(),
    values: rows.into_iter().flatten().collect(),
  }
}

fn records(messages: &[Message]) -> Vec<&Message> {
  messages.iter().filter(|m| matches!(m, Message::Record { .. })).collect()
}

#[tokio::test]
async fn test_full_table_end_to_end() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[
        ("id", "int(11)", "NO", "PRI"),
        ("flag", "bit(1)", "YES", ""),
        ("b", "binary(4)", "YES", ""),
        ("t", "time", "YES", ""),
      ]),
    ),
    (
      "FROM `app`.`t`",
      data_response(
        &["id", "flag", "b", "t"],
        vec![vec![
          Some(b"1".to_vec()),
          Some(vec![0x01]),
          Some(b"AB\x00\x00".to_vec()),
          Some(b"25:00:00".to_vec()),
        ]],
      ),
    ),
  ]);
  let mut replication = FakeReplicationSource::new(vec![]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::FullTable,
    replication_key: None,
  }];

  let summary = sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  assert_eq!(summary.rows_emitted, 1);
  assert!(summary.excluded.is_empty());

  assert!(matches!(&sink.messages[0], Message::Schema { stream, .. } if stream == "app.t"));
  match &sink.messages[1] {
    Message::Record {
      stream,
      operation,
      record,
      before,
    } => {
      assert_eq!(stream, "app.t");
      assert_eq!(*operation, Operation::Insert);
      assert!(before.is_none());
      assert_eq!(
        serde_json::Value::Object(record.clone()),
        serde_json::json!({"id": 1, "flag": true, "b": "AB", "t": "25:00:00"})
      );
    }
    m => panic!("unexpected message {:?}", m),
  }
  assert!(matches!(&sink.messages[2], Message::State { .. }));

  assert_eq!(
    state.bookmark("app.t"),
    Some(&Bookmark::FullTable {
      last_pk_fetched: None,
      initial_complete: true,
      log_position: None,
    })
  );
}

#[tokio::test]
async fn test_full_table_resumes_from_bookmark() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI"), ("v", "varchar(16)", "YES", "")]),
    ),
    (
      "WHERE (`id`) > ('2')",
      data_response(
        &["id", "v"],
        vec![
          vec![Some(b"3".to_vec()), Some(b"c".to_vec())],
          vec![Some(b"4".to_vec()), Some(b"d".to_vec())],
        ],
      ),
    ),
    (
      "WHERE (`id`) > ('4')",
      data_response(&["id", "v"], vec![vec![Some(b"5".to_vec()), Some(b"e".to_vec())]]),
    ),
  ]);
  let mut replication = FakeReplicationSource::new(vec![]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::FullTable {
      last_pk_fetched: Some(vec![serde_json::json!("2")]),
      initial_complete: false,
      log_position: None,
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::FullTable,
    replication_key: None,
  }];
  let options = SyncOptions {
    batch_size: 2,
    ..SyncOptions::default()
  };

  let summary = sync::run(&mut rows, &mut replication, &mut sink, &selections, &mut state, &options)
    .await
    .unwrap();

  // rows 1 and 2 were committed before the crash and are not re-emitted
  assert_eq!(summary.rows_emitted, 3);
  assert!(rows.queries[1].ends_with("ORDER BY `id` LIMIT 2"));
  let emitted = records(&sink.messages);
  assert_eq!(emitted.len(), 3);
  assert_eq!(
    state.bookmark("app.t"),
    Some(&Bookmark::FullTable {
      last_pk_fetched: None,
      initial_complete: true,
      log_position: None,
    })
  );
}

#[tokio::test]
async fn test_incremental_resume_is_inclusive() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI"), ("seq", "int(11)", "NO", "")]),
    ),
    (
      "WHERE `seq` >= '5'",
      data_response(
        &["id", "seq"],
        vec![
          vec![Some(b"10".to_vec()), Some(b"5".to_vec())],
          vec![Some(b"11".to_vec()), Some(b"6".to_vec())],
        ],
      ),
    ),
  ]);
  let mut replication = FakeReplicationSource::new(vec![]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::Incremental {
      replication_key: "seq".into(),
      last_value: Some(serde_json::json!("5")),
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::Incremental,
    replication_key: Some("seq".into()),
  }];

  let summary = sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  assert_eq!(summary.rows_emitted, 2);
  assert_eq!(
    state.bookmark("app.t"),
    Some(&Bookmark::Incremental {
      replication_key: "seq".into(),
      last_value: Some(serde_json::json!("6")),
    })
  );
}

#[tokio::test]
async fn test_log_based_preserves_event_order() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI"), ("v", "varchar(16)", "YES", "")]),
    ),
    ("SHOW MASTER STATUS", master_status("mysql-bin.000001", 1000)),
  ]);

  let columns = [(0x03u8, vec![]), (0x0fu8, vec![0x10, 0x00])];
  let table_map = table_map_body(9, "app", "t", &columns, &["id", "v"]);
  let insert = rows_body(9, 2, &[&id_value_image(1, "a")], false);
  let mut update_images = id_value_image(1, "a");
  update_images.extend_from_slice(&id_value_image(1, "b"));
  let update = rows_body(9, 2, &[&update_images], true);
  let delete = rows_body(9, 2, &[&id_value_image(1, "b")], false);

  let mut replication = FakeReplicationSource::new(vec![
    (200, packet(1700000000, TABLE_MAP_EVENT, 200, &table_map)),
    (300, packet(1700000000, WRITE_ROWS_EVENT, 300, &insert)),
    (400, packet(1700000001, UPDATE_ROWS_EVENT, 400, &update)),
    (500, packet(1700000002, DELETE_ROWS_EVENT, 500, &delete)),
    (1000, packet(1700000003, XID_EVENT, 1000, &[])),
  ]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::LogBased {
      position: "mysql-bin.000001/100".parse().unwrap(),
      schema_fingerprint: "stale".into(),
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::LogBased,
    replication_key: None,
  }];

  let summary = sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  assert_eq!(summary.rows_emitted, 3);
  let emitted = records(&sink.messages);
  assert_eq!(emitted.len(), 3);

  match emitted[0] {
    Message::Record { operation, record, .. } => {
      assert_eq!(*operation, Operation::Insert);
      assert_eq!(record["id"], serde_json::json!(1));
      assert_eq!(record["v"], serde_json::json!("a"));
    }
    m => panic!("unexpected message {:?}", m),
  }
  match emitted[1] {
    Message::Record {
      operation,
      record,
      before,
      ..
    } => {
      assert_eq!(*operation, Operation::Update);
      assert_eq!(record["v"], serde_json::json!("b"));
      assert_eq!(before.as_ref().unwrap()["v"], serde_json::json!("a"));
    }
    m => panic!("unexpected message {:?}", m),
  }
  match emitted[2] {
    Message::Record { operation, record, .. } => {
      assert_eq!(*operation, Operation::Delete);
      assert_eq!(record["v"], serde_json::json!("b"));
      assert!(record.contains_key("_deleted_at"));
    }
    m => panic!("unexpected message {:?}", m),
  }

  match state.bookmark("app.t") {
    Some(Bookmark::LogBased { position, .. }) => {
      assert_eq!(position.to_string(), "mysql-bin.000001/1000");
    }
    b => panic!("unexpected bookmark {:?}", b),
  }
}

#[tokio::test]
async fn test_log_based_schema_drift_emits_schema_before_records() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI"), ("v", "varchar(16)", "YES", "")]),
    ),
    ("SHOW MASTER STATUS", master_status("mysql-bin.000001", 1000)),
    // rediscovery after the drift
    (
      "information_schema.columns",
      columns_response(&[
        ("id", "int(11)", "NO", "PRI"),
        ("v", "varchar(16)", "YES", ""),
        ("extra", "int(11)", "YES", ""),
      ]),
    ),
  ]);

  let wide_columns = [(0x03u8, vec![]), (0x0fu8, vec![0x10, 0x00]), (0x03u8, vec![])];
  let table_map = table_map_body(9, "app", "t", &wide_columns, &["id", "v", "extra"]);
  let mut image = id_value_image(7, "x");
  image.extend_from_slice(&42i32.to_le_bytes());
  let insert = rows_body(9, 3, &[&image], false);

  let mut replication = FakeReplicationSource::new(vec![
    (200, packet(1700000000, TABLE_MAP_EVENT, 200, &table_map)),
    (1000, packet(1700000000, WRITE_ROWS_EVENT, 1000, &insert)),
  ]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::LogBased {
      position: "mysql-bin.000001/100".parse().unwrap(),
      schema_fingerprint: "stale".into(),
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::LogBased,
    replication_key: None,
  }];

  sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  let schema_positions = sink
    .messages
    .iter()
    .enumerate()
    .filter(|(_, m)| matches!(m, Message::Schema { .. }))
    .map(|(i, _)| i)
    .collect::<Vec<_>>();
  assert_eq!(schema_positions.len(), 2, "drift re-emits the stream schema");

  let record_position = sink
    .messages
    .iter()
    .position(|m| matches!(m, Message::Record { .. }))
    .unwrap();
  assert!(schema_positions[1] < record_position);

  match &sink.messages[record_position] {
    Message::Record { record, .. } => {
      assert_eq!(record["extra"], serde_json::json!(42));
    }
    m => panic!("unexpected message {:?}", m),
  }
}

#[tokio::test]
async fn test_purged_position_is_fatal_and_distinct() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI")]),
    ),
    ("SHOW MASTER STATUS", master_status("mysql-bin.000005", 1000)),
  ]);
  let mut replication = FakeReplicationSource::new(vec![]);
  replication.retention_floor = Some("mysql-bin.000004/4".parse().unwrap());
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::LogBased {
      position: "mysql-bin.000001/100".parse().unwrap(),
      schema_fingerprint: "stale".into(),
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::LogBased,
    replication_key: None,
  }];

  let err = sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap_err();

  assert!(matches!(err, Error::PurgedPosition { .. }));
  assert!(!err.is_transient());
}

#[tokio::test]
async fn test_crash_resume_replays_nothing_already_committed() {
  let columns = [(0x03u8, vec![]), (0x0fu8, vec![0x10, 0x00])];
  let table_map = table_map_body(9, "app", "t", &columns, &["id", "v"]);
  let discovery = [("id", "int(11)", "NO", "PRI"), ("v", "varchar(16)", "YES", "")];

  // first run consumes the log to position 500
  let mut rows = FakeRowSource::new(vec![
    ("information_schema.columns", columns_response(&discovery)),
    ("SHOW MASTER STATUS", master_status("mysql-bin.000001", 500)),
  ]);
  let mut replication = FakeReplicationSource::new(vec![
    (200, packet(0, TABLE_MAP_EVENT, 200, &table_map)),
    (
      500,
      packet(0, WRITE_ROWS_EVENT, 500, &rows_body(9, 2, &[&id_value_image(1, "a")], false)),
    ),
  ]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::LogBased {
      position: "mysql-bin.000001/100".parse().unwrap(),
      schema_fingerprint: "stale".into(),
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::LogBased,
    replication_key: None,
  }];

  sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  // second run restarts from the committed state and sees new events only
  let mut rows = FakeRowSource::new(vec![
    ("information_schema.columns", columns_response(&discovery)),
    ("SHOW MASTER STATUS", master_status("mysql-bin.000001", 900)),
  ]);
  let mut replication = FakeReplicationSource::new(vec![
    (200, packet(0, TABLE_MAP_EVENT, 200, &table_map)),
    (
      500,
      packet(0, WRITE_ROWS_EVENT, 500, &rows_body(9, 2, &[&id_value_image(1, "a")], false)),
    ),
    (600, packet(0, TABLE_MAP_EVENT, 600, &table_map)),
    (
      900,
      packet(0, WRITE_ROWS_EVENT, 900, &rows_body(9, 2, &[&id_value_image(2, "b")], false)),
    ),
  ]);
  let mut sink = CollectingSink::default();

  let summary = sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  assert_eq!(summary.rows_emitted, 1);
  match records(&sink.messages)[0] {
    Message::Record { record, .. } => assert_eq!(record["id"], serde_json::json!(2)),
    m => panic!("unexpected message {:?}", m),
  }
}

#[tokio::test]
async fn test_completed_snapshot_is_not_rescanned() {
  // crash window: the scan finished and recorded its start position, but
  // the bookmark never converted to log-based
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI")]),
    ),
    ("SHOW MASTER STATUS", master_status("mysql-bin.000001", 1000)),
  ]);
  let mut replication = FakeReplicationSource::new(vec![]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::FullTable {
      last_pk_fetched: None,
      initial_complete: true,
      log_position: Some("mysql-bin.000001/100".parse().unwrap()),
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::LogBased,
    replication_key: None,
  }];

  let summary = sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  // no SELECT against the table: discovery and the log target only
  assert_eq!(rows.queries.len(), 2);
  assert_eq!(summary.rows_emitted, 0);
  assert!(records(&sink.messages).is_empty());
  match state.bookmark("app.t") {
    Some(Bookmark::LogBased { position, .. }) => {
      assert_eq!(position.to_string(), "mysql-bin.000001/100");
    }
    b => panic!("unexpected bookmark {:?}", b),
  }
}

#[tokio::test]
async fn test_incremental_narrow_result_is_schema_mismatch() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI"), ("seq", "int(11)", "NO", "")]),
    ),
    (
      "ORDER BY `seq`",
      data_response(&["id"], vec![vec![Some(b"10".to_vec())]]),
    ),
  ]);
  let mut replication = FakeReplicationSource::new(vec![]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::Incremental,
    replication_key: Some("seq".into()),
  }];

  let summary = sync::run(
    &mut rows,
    &mut replication,
    &mut sink,
    &selections,
    &mut state,
    &SyncOptions::default(),
  )
  .await
  .unwrap();

  assert_eq!(summary.rows_emitted, 0);
  assert_eq!(summary.excluded.len(), 1);
  assert!(matches!(&summary.excluded[0], Error::SchemaMismatch { .. }));
  assert!(records(&sink.messages).is_empty());
}

#[tokio::test]
async fn test_skipped_events_advance_checkpoint() {
  let mut rows = FakeRowSource::new(vec![
    (
      "information_schema.columns",
      columns_response(&[("id", "int(11)", "NO", "PRI"), ("v", "varchar(16)", "YES", "")]),
    ),
    ("SHOW MASTER STATUS", master_status("mysql-bin.000001", 1000)),
  ]);

  let columns = [(0x03u8, vec![]), (0x0fu8, vec![0x10, 0x00])];
  let tracked_map = table_map_body(9, "app", "t", &columns, &["id", "v"]);
  let untracked_map = table_map_body(8, "app", "other", &columns, &["id", "v"]);

  let mut replication = FakeReplicationSource::new(vec![
    (200, packet(0, TABLE_MAP_EVENT, 200, &untracked_map)),
    (
      300,
      packet(0, WRITE_ROWS_EVENT, 300, &rows_body(8, 2, &[&id_value_image(1, "a")], false)),
    ),
    (400, packet(0, TABLE_MAP_EVENT, 400, &tracked_map)),
    (
      1000,
      packet(0, WRITE_ROWS_EVENT, 1000, &rows_body(9, 2, &[&id_value_image(2, "b")], false)),
    ),
  ]);
  let mut sink = CollectingSink::default();
  let mut state = State::new();
  state.set_bookmark(
    "app.t",
    Bookmark::LogBased {
      position: "mysql-bin.000001/100".parse().unwrap(),
      schema_fingerprint: "stale".into(),
    },
  );
  let selections = vec![StreamSelection {
    schema: "app".into(),
    table: "t".into(),
    sync_mode: SyncMode::LogBased,
    replication_key: None,
  }];
  let options = SyncOptions {
    batch_size: 1,
    ..SyncOptions::default()
  };

  let summary = sync::run(&mut rows, &mut replication, &mut sink, &selections, &mut state, &options)
    .await
    .unwrap();

  assert_eq!(summary.rows_emitted, 1);

  // the untracked-table statement alone advanced the committed position
  let committed_mid_run = sink.messages.iter().any(|m| match m {
    Message::State { value } => {
      value["bookmarks"]["app.t"]["position"]["log_position"] == serde_json::json!(300)
    }
    _ => false,
  });
  assert!(committed_mid_run, "no checkpoint at the skipped statement boundary");

  match state.bookmark("app.t") {
    Some(Bookmark::LogBased { position, .. }) => {
      assert_eq!(position.to_string(), "mysql-bin.000001/1000");
    }
    b => panic!("unexpected bookmark {:?}", b),
  }
}
