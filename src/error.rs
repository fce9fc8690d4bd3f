//! Typed error taxonomy shared by the engine, model and storage port.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IpamError>;

/// Error taxonomy for all engine, model and storage operations.
///
/// Every operation returns exactly one of these kinds; no partial mutation is
/// ever observable behind an error because persistence happens through single
/// version-checked writes.
#[derive(Debug, Error)]
pub enum IpamError {
    /// The CIDR string is malformed or not the canonical network address.
    #[error("invalid cidr: {0}")]
    InvalidCidr(String),
    /// A child prefix length does not subdivide the parent.
    #[error("invalid subdivision: {0}")]
    InvalidSubdivision(String),
    /// A caller-specified target lies outside the parent block.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// The prefix is in the wrong mode for the request, e.g. acquiring an
    /// address from a prefix that has been split into child blocks.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The requested record does not exist; carries the backend's native
    /// not-found cause.
    #[error("unable to read prefix: {0}")]
    NotFound(String),
    /// A new root prefix would overlap an existing one.
    #[error("{0} overlaps existing prefix {1}")]
    Overlap(String, String),
    /// The requested child prefix or address is already owned by someone.
    #[error("already allocated: {0}")]
    AlreadyAllocated(String),
    /// Release of a child prefix or address that was never acquired.
    #[error("not allocated: {0}")]
    NotAllocated(String),
    /// The prefix still has allocated child prefixes.
    #[error("prefix {0} has allocated child prefixes")]
    HasChildren(String),
    /// The prefix still has addresses in use.
    #[error("prefix {0} has allocated ips")]
    HasIps(String),
    /// No free child block or address exists; retrying cannot help.
    #[error("no capacity: {0}")]
    NoCapacity(String),
    /// A version-checked write lost against a concurrent update. Absorbed by
    /// the retry coordinator; callers only observe it as [`IpamError::Exhausted`]
    /// once the retry budget is spent.
    #[error("version conflict on {0}")]
    VersionConflict(String),
    /// The retry budget was spent without the write landing.
    #[error("operation not possible after {0} retries")]
    Exhausted(u32),
    /// The caller's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,
    /// The caller's deadline expired mid-operation.
    #[error("deadline exceeded")]
    Timeout,
    /// Encoding or decoding a prefix record failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}
