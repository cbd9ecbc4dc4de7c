//! Shared types and error taxonomy for the fleet control plane.
//!
//! Everything in this crate is pure data and pure logic: no I/O, no
//! database access. `fleetd` binds these types to Postgres and HTTP.

pub mod errors;
pub mod image;
pub mod types;

pub use errors::{ApiError, ErrorCode};
pub use image::ImageRef;
