//! Core domain model for prospect.
//!
//! This crate defines the row model flowing through the enrichment
//! engine (input rows, fixed-shape enrichment results), the registry
//! types returned by upstream collaborators, and the SQLite schema that
//! backs the durable response cache.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod model;
pub mod schema;

pub use error::{Error, Result};
