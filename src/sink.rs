use std::io;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::catalog::{ColumnDescriptor, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Insert,
  Update,
  Delete,
}

/// The three message kinds the engine emits, in the order consumers rely
/// on: a stream's schema before its first record, state after bookmarks
/// advance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  Schema {
    stream: String,
    columns: Vec<ColumnDescriptor>,
    key_columns: Vec<String>,
  },
  Record {
    stream: String,
    operation: Operation,
    record: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<serde_json::Map<String, serde_json::Value>>,
  },
  State {
    value: serde_json::Value,
  },
}

impl Message {
  pub fn schema(stream: &Stream) -> Message {
    Message::Schema {
      stream: stream.stream_id(),
      columns: stream.columns.clone(),
      key_columns: stream.key_columns.clone(),
    }
  }
}

/// Where emitted messages go. Emission is the commit point: a bookmark may
/// only cover rows whose records a sink call has already accepted.
pub trait Sink {
  fn emit(&mut self, message: &Message) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

/// Writes messages as JSON lines, one message per line.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
  writer: W,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
  pub fn new(writer: W) -> JsonLinesSink<W> {
    JsonLinesSink { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl JsonLinesSink<tokio::io::Stdout> {
  pub fn stdout() -> JsonLinesSink<tokio::io::Stdout> {
    JsonLinesSink::new(tokio::io::stdout())
  }
}

impl<W: AsyncWrite + Unpin + Send> Sink for JsonLinesSink<W> {
  async fn emit(&mut self, message: &Message) -> io::Result<()> {
    let mut line = serde_json::to_vec(message).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    line.push(b'\n');
    self.writer.write_all(&line).await?;
    self.writer.flush().await
  }
}
