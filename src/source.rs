use std::io;

use bytes::Bytes;

use crate::error::Result;
use crate::state::LogPosition;

/// A single cell of a text-protocol result set. `None` is SQL NULL. Cells
/// are raw bytes, not strings, because binary columns are not valid UTF-8.
pub type RowValue = Option<Vec<u8>>;

/// Column-major-free result set: `values` holds rows back to back, each
/// `columns.len()` cells wide.
#[derive(Debug, Clone, Default)]
pub struct QueryResults {
  pub columns: Vec<String>,
  pub values: Vec<RowValue>,
}

impl QueryResults {
  pub fn rows_len(&self) -> usize {
    if self.columns.is_empty() {
      0
    } else {
      self.values.len() / self.columns.len()
    }
  }

  pub fn rows(&self) -> impl Iterator<Item = &[RowValue]> {
    self.values.chunks_exact(self.columns.len().max(1))
  }

  pub fn column_index(&self, name: &str) -> Option<usize> {
    self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
  }
}

/// Query capability over an established session. Implementations own the
/// connection, credentials and session setup; retries here re-issue the
/// statement on the same source.
pub trait RowSource {
  fn query(&mut self, sql: &str) -> impl std::future::Future<Output = io::Result<QueryResults>> + Send;
}

/// Replication-stream capability. `connect` opens the stream at a position;
/// `recv` yields raw self-delimiting event packets (an OK byte followed by
/// the event header and body), exactly as the server frames them. The
/// session is expected to run with checksums off and full row metadata on.
pub trait ReplicationSource {
  fn connect(&mut self, position: &LogPosition) -> impl std::future::Future<Output = Result<()>> + Send;

  fn recv(&mut self) -> impl std::future::Future<Output = Option<io::Result<Bytes>>> + Send;
}
