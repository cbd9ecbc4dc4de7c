//! Error taxonomy for the fleet control plane.
//!
//! Every error surfaced across a request boundary carries one of the
//! kinds below. `ErrorCode` gives each failure a stable,
//! loggable identity within its kind; `ApiError` is what HTTP handlers
//! actually return.

pub mod catalog;

pub use catalog::{ApiError, ErrorCode, ErrorKind};
