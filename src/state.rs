use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A position in the source's replication log, `<file>/<offset>`.
/// Ordering is by file name, then offset; log files rotate with
/// monotonically increasing suffixes so lexicographic file order is
/// chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
  pub log_file: String,
  pub log_position: u64,
}

impl fmt::Display for LogPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.log_file, self.log_position)
  }
}

impl FromStr for LogPosition {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (log_file, log_position) = s
      .split_once('/')
      .ok_or_else(|| format!("invalid log position {:?}, expected <file>/<offset>", s))?;
    let log_file = log_file.to_string();
    let log_position = log_position.parse().map_err(|_| format!("invalid log offset {:?}", s))?;
    Ok(LogPosition { log_file, log_position })
  }
}

/// Per-stream resumption cursor. The variant pins the strategy the stream
/// was last synced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Bookmark {
  FullTable {
    /// Primary-key values of the last emitted row, in key order. Absent
    /// before the first checkpoint and after completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_pk_fetched: Option<Vec<serde_json::Value>>,
    initial_complete: bool,
    /// For streams that tail the log after their snapshot: the head
    /// position captured before the scan's first row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_position: Option<LogPosition>,
  },
  Incremental {
    replication_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_value: Option<serde_json::Value>,
  },
  LogBased {
    position: LogPosition,
    /// Fingerprint of the discovered column layout the bookmark was taken
    /// under. A mismatch on resume forces rediscovery before decoding.
    schema_fingerprint: String,
  },
}

/// The sole source of truth for resumption. Single-writer: only the sync
/// worker mutates it, and only after the rows a bookmark covers have been
/// emitted downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
  bookmarks: BTreeMap<String, Bookmark>,
}

impl State {
  pub fn new() -> State {
    State::default()
  }

  pub fn bookmark(&self, stream_id: &str) -> Option<&Bookmark> {
    self.bookmarks.get(stream_id)
  }

  pub fn set_bookmark(&mut self, stream_id: impl Into<String>, bookmark: Bookmark) {
    self.bookmarks.insert(stream_id.into(), bookmark);
  }

  pub fn clear_bookmark(&mut self, stream_id: &str) {
    self.bookmarks.remove(stream_id);
  }

  pub fn bookmarks(&self) -> impl Iterator<Item = (&String, &Bookmark)> {
    self.bookmarks.iter()
  }

  pub fn snapshot(&self) -> serde_json::Value {
    serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_log_position_parse_and_display() {
    let position = "mysql-bin.000003/154".parse::<LogPosition>().unwrap();
    assert_eq!(position.log_file, "mysql-bin.000003");
    assert_eq!(position.log_position, 154);
    assert_eq!(position.to_string(), "mysql-bin.000003/154");

    assert!("mysql-bin.000003".parse::<LogPosition>().is_err());
    assert!("mysql-bin.000003/x".parse::<LogPosition>().is_err());
  }

  #[test]
  fn test_log_position_ordering() {
    let a = "mysql-bin.000003/400".parse::<LogPosition>().unwrap();
    let b = "mysql-bin.000004/4".parse::<LogPosition>().unwrap();
    let c = "mysql-bin.000004/500".parse::<LogPosition>().unwrap();
    assert!(a < b);
    assert!(b < c);
  }

  #[test]
  fn test_state_round_trip() {
    let mut state = State::new();
    state.set_bookmark(
      "app.users",
      Bookmark::LogBased {
        position: "mysql-bin.000001/4".parse().unwrap(),
        schema_fingerprint: "d0b425e00e15a0d36ffde2f0a1b1b6e4c2e1b1e0".into(),
      },
    );
    state.set_bookmark(
      "app.orders",
      Bookmark::Incremental {
        replication_key: "updated_at".into(),
        last_value: Some(serde_json::json!("2023-05-01T00:00:00+00:00")),
      },
    );

    let snapshot = state.snapshot();
    let restored: State = serde_json::from_value(snapshot).unwrap();
    assert_eq!(restored, state);
  }
}
