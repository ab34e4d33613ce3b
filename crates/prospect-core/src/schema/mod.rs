pub mod db;
pub mod migrations;

pub use db::{CacheEntry, CacheStats, Database};
