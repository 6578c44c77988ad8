use thiserror::Error;

/// Canonical FireQuery error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FqError::InvalidConfig`]: configuration/topology/path contract violations
/// - [`FqError::Query`]: request shape issues discovered before any data is read
/// - [`FqError::Data`]: partition loading failures that abort a node (not per-row skips)
/// - [`FqError::Rpc`]: downstream call or transport failures
/// - [`FqError::Unavailable`]: a required coordination surface is absent at startup
/// - [`FqError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum FqError {
    /// Invalid or inconsistent process configuration.
    ///
    /// Examples:
    /// - missing/unreadable config file
    /// - chunk sizes below 1, unknown role, malformed edges
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed query request.
    ///
    /// Examples:
    /// - `date_start > date_end`
    /// - bounding box outside ±90/±180
    /// - undecodable delegation payload
    #[error("query error: {0}")]
    Query(String),

    /// Partition data source failures that abort the node or the call.
    ///
    /// Per-row parse failures and missing date directories are warnings, not
    /// this variant; this covers a missing data root or an unreadable file set.
    #[error("data error: {0}")]
    Data(String),

    /// Downstream RPC call or transport failures.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// A required shared surface (status board) is not reachable at startup.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard FireQuery result alias.
pub type Result<T> = std::result::Result<T, FqError>;
