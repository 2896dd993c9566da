//! Error type for table construction and allocation.

use thiserror::Error;

/// Errors surfaced across the crate boundary.
///
/// Caller contract violations (double release, dereferencing a stale
/// handle, re-entering a table from one of its own hooks) are not
/// represented here; they are programming errors detected in debug builds.
#[derive(Debug, Error)]
pub enum Error {
    /// Table or pool construction received impossible sizes/limits.
    #[error("invalid table config: {reason}")]
    InvalidConfig { reason: String },

    /// The pool has no free slot and no entry could be evicted within the
    /// retry bound. Returned from `must_get` only.
    #[error("object pool exhausted: no free slot and no evictable entry")]
    Exhausted,
}

pub type Result<T> = core::result::Result<T, Error>;
