//! Common types for the courier routing-graph toolchain

pub mod error;

pub use error::{truncate_message, GraphError, Result, MAX_ERROR_MESSAGE_LEN};
