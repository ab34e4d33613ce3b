pub mod registry;
pub mod result;
pub mod row;

pub use registry::{Address, Coordinates, Filing, FilingLinks, Headcount, Profile};
pub use result::{EnrichmentResult, OutputSchema};
pub use row::{EntityColumns, InputRow};
