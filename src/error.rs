use std::{fmt, io};

use crate::state::LogPosition;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
  /// A native column type with no canonical mapping. Scoped to a single stream.
  TypeMapping {
    stream: String,
    column: String,
    native_type: String,
  },

  /// Transient connection failure. Retried with reconnect up to a bound.
  Connection(io::Error),

  /// The requested replication position is no longer retained by the source.
  /// Not retryable, requires an operator-driven full resync.
  PurgedPosition { requested: LogPosition },

  /// The live table layout no longer matches the discovered stream.
  SchemaMismatch { stream: String, detail: String },

  /// Malformed or truncated wire data.
  Protocol(String),
}

impl Error {
  pub fn is_transient(&self) -> bool {
    matches!(self, Error::Connection(_))
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Error::TypeMapping {
        stream,
        column,
        native_type,
      } => {
        write!(f, "no canonical mapping for {}.{} ({})", stream, column, native_type)
      }
      Error::Connection(err) => write!(f, "connection error: {}", err),
      Error::PurgedPosition { requested } => {
        write!(f, "replication position {} has been purged from the source", requested)
      }
      Error::SchemaMismatch { stream, detail } => write!(f, "schema mismatch on {}: {}", stream, detail),
      Error::Protocol(detail) => write!(f, "protocol error: {}", detail),
    }
  }
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Error::Connection(err) => Some(err),
      _ => None,
    }
  }
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => Error::Protocol(err.to_string()),
      _ => Error::Connection(err),
    }
  }
}
