//! In-memory index over a BIDS dataset: entity parsing, filtered lookups,
//! nearest-file resolution and sidecar metadata.

mod entities;
mod error;
mod layout;
mod query;

pub use entities::{is_numeric, long_name, parse_entities, split_extension, values_equal, Entities};
pub use error::{LayoutError, Result};
pub use layout::{BidsFile, BidsLayout, NearestOptions};
pub use query::{EntityFilter, Query};
