use thiserror::Error;

/// Primary error type for Vellum engine operations.
///
/// The taxonomy is closed: every failure the engine can report maps to one
/// of these variants, and every variant maps to a stable numeric
/// [`ErrorCode`]. External surfaces (HTTP/RPC servers) translate codes to
/// transport statuses; the engine itself never looks past the code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VellumError {
    /// Requested entity (namespace, item, meta key, index) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid argument or malformed input supplied by the caller.
    #[error("{0}")]
    Params(String),

    /// Internal invariant violation surfaced to the caller.
    #[error("logic error: {0}")]
    Logic(String),

    /// Operation conflicts with existing state (duplicate PK, aggregation
    /// vs. select-filter mix, composite component drop).
    #[error("conflict: {0}")]
    Conflict(String),

    /// SQL text could not be parsed.
    #[error("{0}")]
    ParseSql(String),

    /// Binary query stream could not be decoded.
    #[error("{0}")]
    ParseBin(String),

    /// Query was valid but failed during execution.
    #[error("query execution failed: {0}")]
    QueryExec(String),

    /// Write refused by replication role (slave / read-only namespace).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The namespace was atomically replaced (copy-on-write commit) while
    /// the caller held the old handle. The operation must be retried.
    #[error("namespace invalidated: {0}")]
    NamespaceInvalidated(String),

    /// State is not valid for the requested operation (storage format
    /// mismatch, WAL record out of window, fatal replication status).
    #[error("not valid: {0}")]
    NotValid(String),

    /// The transaction was already committed or rolled back by a
    /// subsequent commit on the same namespace.
    #[error("transaction invalidated by subsequent commit")]
    TxInvalidatedBySubsequentCommit,
}

/// Numeric codes for the closed error taxonomy.
///
/// `Ok = 0` is reserved for the success path of wire protocols and never
/// constructed from a [`VellumError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result (wire protocol only).
    Ok = 0,
    /// Entity not found.
    NotFound = 1,
    /// Invalid parameters.
    Params = 2,
    /// Internal logic error.
    Logic = 3,
    /// State conflict.
    Conflict = 4,
    /// SQL parse failure.
    ParseSql = 5,
    /// Binary query parse failure.
    ParseBin = 6,
    /// Query execution failure.
    QueryExec = 7,
    /// Write refused by role.
    Forbidden = 8,
    /// Namespace swapped out from under the caller.
    NamespaceInvalidated = 9,
    /// State not valid for the operation.
    NotValid = 10,
    /// Transaction invalidated by a later commit.
    TxInvalidatedBySubsequentCommit = 11,
}

impl VellumError {
    /// Map this error to its stable numeric code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Params(_) => ErrorCode::Params,
            Self::Logic(_) => ErrorCode::Logic,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::ParseSql(_) => ErrorCode::ParseSql,
            Self::ParseBin(_) => ErrorCode::ParseBin,
            Self::QueryExec(_) => ErrorCode::QueryExec,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NamespaceInvalidated(_) => ErrorCode::NamespaceInvalidated,
            Self::NotValid(_) => ErrorCode::NotValid,
            Self::TxInvalidatedBySubsequentCommit => ErrorCode::TxInvalidatedBySubsequentCommit,
        }
    }

    /// Whether retrying the same call may succeed without caller changes.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NamespaceInvalidated(_) | Self::TxInvalidatedBySubsequentCommit
        )
    }

    /// Create a `NotFound` error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a `Params` error.
    pub fn params(msg: impl Into<String>) -> Self {
        Self::Params(msg.into())
    }

    /// Create a `Logic` error.
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// Create a `Conflict` error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a `ParseSql` error.
    pub fn parse_sql(msg: impl Into<String>) -> Self {
        Self::ParseSql(msg.into())
    }

    /// Create a `ParseBin` error.
    pub fn parse_bin(msg: impl Into<String>) -> Self {
        Self::ParseBin(msg.into())
    }

    /// Create a `QueryExec` error.
    pub fn query_exec(msg: impl Into<String>) -> Self {
        Self::QueryExec(msg.into())
    }

    /// Create a `Forbidden` error.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a `NamespaceInvalidated` error.
    pub fn namespace_invalidated(msg: impl Into<String>) -> Self {
        Self::NamespaceInvalidated(msg.into())
    }

    /// Create a `NotValid` error.
    pub fn not_valid(msg: impl Into<String>) -> Self {
        Self::NotValid(msg.into())
    }
}

impl From<std::io::Error> for VellumError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else {
            Self::NotValid(format!("I/O error: {err}"))
        }
    }
}

/// Result type alias using [`VellumError`].
pub type Result<T> = std::result::Result<T, VellumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_message() {
        let err = VellumError::parse_sql("unexpected 'FORM' at position 9");
        assert_eq!(err.to_string(), "unexpected 'FORM' at position 9");

        let err = VellumError::conflict("PK index already exists");
        assert_eq!(err.to_string(), "conflict: PK index already exists");
    }

    #[test]
    fn code_mapping_is_total_and_stable() {
        assert_eq!(VellumError::not_found("x").code(), ErrorCode::NotFound);
        assert_eq!(VellumError::params("x").code(), ErrorCode::Params);
        assert_eq!(VellumError::logic("x").code(), ErrorCode::Logic);
        assert_eq!(VellumError::conflict("x").code(), ErrorCode::Conflict);
        assert_eq!(VellumError::parse_sql("x").code(), ErrorCode::ParseSql);
        assert_eq!(VellumError::parse_bin("x").code(), ErrorCode::ParseBin);
        assert_eq!(VellumError::query_exec("x").code(), ErrorCode::QueryExec);
        assert_eq!(VellumError::forbidden("x").code(), ErrorCode::Forbidden);
        assert_eq!(
            VellumError::namespace_invalidated("x").code(),
            ErrorCode::NamespaceInvalidated
        );
        assert_eq!(VellumError::not_valid("x").code(), ErrorCode::NotValid);
        assert_eq!(
            VellumError::TxInvalidatedBySubsequentCommit.code(),
            ErrorCode::TxInvalidatedBySubsequentCommit
        );
    }

    #[test]
    fn code_values() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::NotFound as i32, 1);
        assert_eq!(ErrorCode::QueryExec as i32, 7);
        assert_eq!(ErrorCode::TxInvalidatedBySubsequentCommit as i32, 11);
    }

    #[test]
    fn transient_errors() {
        assert!(VellumError::namespace_invalidated("swap").is_transient());
        assert!(VellumError::TxInvalidatedBySubsequentCommit.is_transient());
        assert!(!VellumError::params("bad").is_transient());
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: VellumError = io.into();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: VellumError = io.into();
        assert_eq!(err.code(), ErrorCode::NotValid);
    }
}
