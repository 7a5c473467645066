pub mod binlog;
mod buf_ext;
pub mod catalog;
pub mod coerce;
mod error;
pub mod sink;
pub mod source;
pub mod state;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
