use thiserror::Error;

/// Error kinds specific to a sync session, carried by [`VaultError::Sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Busy,
    Timeout,
    FramingError,
    CryptoMismatch,
    PeerAbort,
    Cancelled,
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncErrorKind::Busy => "busy",
            SyncErrorKind::Timeout => "timeout",
            SyncErrorKind::FramingError => "framing_error",
            SyncErrorKind::CryptoMismatch => "crypto_mismatch",
            SyncErrorKind::PeerAbort => "peer_abort",
            SyncErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Tagged error values surfaced across the core API boundary.
///
/// `Decrypt` never carries the underlying AEAD failure detail — a tag
/// mismatch is reported identically regardless of cause, so callers can't
/// learn anything about *why* decryption failed.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no user is registered on this device")]
    NotRegistered,
    #[error("a user is already registered on this device")]
    AlreadyRegistered,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("too many attempts, retry after {0}s")]
    TooManyAttempts(u64),
    #[error("session has expired")]
    SessionExpired,
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },
    #[error("not found")]
    NotFound,
    #[error("conflicting state")]
    Conflict,
    #[error("data integrity check failed")]
    Decrypt,
    #[error("store error: {0}")]
    Store(String),
    #[error("sync error: {0}")]
    Sync(SyncErrorKind),
}

impl VaultError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        tracing::error!(error = %e, "store error");
        VaultError::Store(e.to_string())
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
