pub mod cache;
pub mod config;
pub mod enrich;
pub mod info;

pub use enrich::run_enrich;
pub use info::show_info;
