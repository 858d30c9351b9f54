//! Error types for region parsing and pool construction.

use thiserror::Error;

/// Errors that can occur when building a region pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// The region code is not two ASCII letters.
    #[error("invalid region code: {0:?}")]
    InvalidCode(String),

    /// The pool has no regions.
    #[error("region pool is empty")]
    EmptyPool,

    /// The same region appears twice in the pool.
    #[error("duplicate region in pool: {0}")]
    DuplicateRegion(String),

    /// The pool does not fit in the port range starting at `base_port`.
    #[error("port range overflow: {count} regions starting at port {base_port} exceed 65535")]
    PortRangeOverflow { base_port: u16, count: usize },

    /// Requested pool size is zero or larger than the pool.
    #[error("invalid pool size {requested} (pool has {available} regions)")]
    InvalidPoolSize { requested: usize, available: usize },
}
