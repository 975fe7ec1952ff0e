//! Classified errors for the sync core.
//!
//! An [`ErrorMetadata`] can be attached to an anyhow error chain via
//! `.context(e /* ErrorMetadata */)`. The `short_msg` is the stable wire
//! code surfaced in push/pull responses (e.g. `UNKNOWN_TABLE`); the `msg` is
//! a developer-facing description. Use [`ErrorMetadataAnyhowExt`] to recover
//! the classification from an `anyhow::Error` at the protocol boundary.

use std::borrow::Cow;

use http::StatusCode;

/// Wire code for a conflict outcome. Conflicts are first-class outcomes, not
/// errors, but the stable string is shared with the error taxonomy.
pub const CONFLICT: &str = "CONFLICT";

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Stable SCREAMING_SNAKE wire code, usable in tests for string matching.
    /// Eg `UNKNOWN_TABLE`.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,

    Overloaded,
    OperationalInternalServerError,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::OperationalInternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client should retry the same request after a backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Overloaded | ErrorCode::OperationalInternalServerError
        )
    }
}

impl ErrorMetadata {
    /// Bad request. Maps to 400 in HTTP. Non-retriable.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Forbidden. Maps to 403 in HTTP. Non-retriable.
    pub fn forbidden(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: "FORBIDDEN".into(),
            msg: msg.into(),
        }
    }

    /// The server (or a partition) is temporarily unable to take the
    /// request. Maps to 503. Retriable with backoff.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Known operational source of downtime. Maps to 500. Retriable.
    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: "INTERNAL_SERVER_ERROR".into(),
            msg: "An internal server error occurred. Please try again.".into(),
        }
    }

    /// A push referenced a table with no registered handler.
    pub fn unknown_table(table: &str) -> Self {
        Self::bad_request(
            "UNKNOWN_TABLE",
            format!("No table handler is registered for table \"{table}\""),
        )
    }

    /// A write was attempted against a read-only table handler.
    pub fn read_only(table: &str) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: "READ_ONLY".into(),
            msg: format!("Table \"{table}\" is read-only").into(),
        }
    }

    /// Malformed or protocol-violating request.
    pub fn invalid_request(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::bad_request("INVALID_REQUEST", msg)
    }

    /// A required request field is absent. The wire code embeds the field
    /// name, e.g. `MISSING_CLIENT_ID`.
    pub fn missing_field(field: &str) -> Self {
        Self::bad_request(
            format!("MISSING_{}", field.to_uppercase()),
            format!("Required field \"{field}\" is missing"),
        )
    }

    /// A bootstrap token referenced a snapshot chunk past its expiry.
    pub fn bootstrap_expired() -> Self {
        Self::not_found(
            "BOOTSTRAP_EXPIRED",
            "The snapshot this bootstrap was reading has expired; restart the bootstrap",
        )
    }

    /// A fetched chunk body failed sha256 verification after decoding.
    pub fn chunk_checksum_mismatch(expected: &str, actual: &str) -> Self {
        Self::bad_request(
            "CHUNK_CHECKSUM_MISMATCH",
            format!("Chunk body hash {actual} does not match declared {expected}"),
        )
    }

    /// The SQL proxy has no connections left in its budget.
    pub fn proxy_connection_limit(limit: usize) -> Self {
        Self::overloaded(
            "PROXY_CONNECTION_LIMIT",
            format!("All {limit} proxy connections are in use"),
        )
    }
}

/// Recover an [`ErrorMetadata`] classification from an anyhow chain.
pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn short_msg(&self) -> Option<&str>;
    fn is_retriable(&self) -> bool;
    fn http_status(&self) -> StatusCode;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        // Finds the metadata whether it is the root error or was attached
        // anywhere in the chain via `.context(metadata)`.
        self.downcast_ref::<ErrorMetadata>()
    }

    fn short_msg(&self) -> Option<&str> {
        self.error_metadata().map(|m| m.short_msg.as_ref())
    }

    fn is_retriable(&self) -> bool {
        self.error_metadata()
            .map(|m| m.code.is_retriable())
            // Unclassified errors are internal faults; let the client retry.
            .unwrap_or(true)
    }

    fn http_status(&self) -> StatusCode {
        self.error_metadata()
            .map(|m| m.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_metadata_survives_anyhow_chain() {
        let err: anyhow::Error = anyhow::anyhow!("low level io failure")
            .context(ErrorMetadata::unknown_table("tasks"))
            .context("while handling push");
        assert_eq!(err.short_msg(), Some("UNKNOWN_TABLE"));
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_missing_field_code() {
        let md = ErrorMetadata::missing_field("client_id");
        assert_eq!(md.short_msg, "MISSING_CLIENT_ID");
    }

    #[test]
    fn test_retriability() {
        assert!(ErrorMetadata::proxy_connection_limit(8)
            .code
            .is_retriable());
        assert!(!ErrorMetadata::read_only("tasks").code.is_retriable());
        let unclassified = anyhow::anyhow!("socket closed");
        assert!(unclassified.is_retriable());
    }
}
