//! Region metadata and backend address allocation.
//!
//! This library provides:
//! - `RegionCode`: validated two-letter egress region identifiers
//! - A static region table with display labels (`label_for`, `name_for`)
//! - `RegionPool`: the fixed, ordered set of regions served by one proxy,
//!   each bound to a reserved loopback port
//!
//! Everything here is immutable once constructed and can be shared across
//! tasks without locking.

mod error;
mod pool;
mod table;

pub use error::RegionError;
pub use pool::{PoolEntry, RegionPool, DEFAULT_BASE_PORT, LOOPBACK_HOST};
pub use table::{
    all_regions, is_known, label_for, name_for, RegionCode, RegionInfo, DEFAULT_LABEL, DEFAULT_NAME,
    REGIONS,
};
