use std::io;

use thiserror::Error;

/// Convenience alias for fallible bootstrap operations.
pub type Result<T> = std::result::Result<T, RingError>;

/// Errors raised while publishing or discovering a ring.
///
/// These only occur during bootstrap (region creation, discovery, mapping).
/// Once a [`Producer`](crate::Producer) or [`Consumer`](crate::Consumer)
/// exists, the data plane never fails: every runtime condition is expressed
/// through [`ReadStatus`](crate::ReadStatus).
#[derive(Debug, Error)]
pub enum RingError {
    /// The logical ring name cannot be used as a shared-memory object name.
    #[error("invalid ring name {name:?}: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A region identifier does not fit a 128-byte discovery field.
    #[error("path {path:?} does not fit a {limit}-byte discovery field")]
    PathTooLong {
        /// The identifier that was too long.
        path: String,
        /// Capacity of the discovery field, including the NUL terminator.
        limit: usize,
    },

    /// An OS-level shared-memory operation failed.
    #[error("{op} failed for {path:?}: {source}")]
    Os {
        /// The failing syscall.
        op: &'static str,
        /// The object or path the syscall was applied to.
        path: String,
        /// The underlying OS error.
        source: io::Error,
    },

    /// The discovery record does not advertise one of the expected regions.
    #[error("discovery record for {name:?} has no {field} identifier")]
    MissingPath {
        /// The logical ring name.
        name: String,
        /// Which field was empty ("buffer" or "info").
        field: &'static str,
    },

    /// A mapped region is smaller than the layout both ends agreed on.
    ///
    /// This is the fatal configuration mismatch of a consumer compiled with
    /// a different payload type or capacity than the producer.
    #[error("region {path:?} is {actual} bytes, expected at least {expected}")]
    RegionTooSmall {
        /// The region that was opened.
        path: String,
        /// Bytes required by the compiled-in layout.
        expected: u64,
        /// Bytes actually present.
        actual: u64,
    },
}
