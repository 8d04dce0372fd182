//! Recoverable error kinds surfaced by cache construction and iteration.
//!
//! Everything past construction is infallible by design: event handling
//! silently ignores untracked tables, and a rematch may empty the cache but
//! never fails. Internal invariant violations are programmer errors and
//! assert instead.

use thiserror::Error;

/// Errors surfaced to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A term uses a named variable, a non-wildcard variable reference, or a
    /// filter inout declaration. The cache is not constructed.
    #[error("unsupported term at index {term}: {reason}")]
    UnsupportedTerm {
        /// Index of the offending term in the query signature.
        term: usize,
        /// Human-readable description of the unsupported shape.
        reason: &'static str,
    },

    /// Cascade combined with a user grouping, or the grouping configured
    /// more than once.
    #[error("invalid grouping: {0}")]
    InvalidGrouping(&'static str),

    /// The ordering component does not appear as a required term of the
    /// query.
    #[error("order_by component is not matched by a required query term")]
    OrderByNotQueried,

    /// Construction was attempted while the world is tearing down.
    #[error("world is shutting down")]
    WorldShuttingDown,

    /// A group window was requested on an iterator that already yielded.
    #[error("cannot reposition an iterator that is already in progress")]
    InvalidIteratorState,
}
