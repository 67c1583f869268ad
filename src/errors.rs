use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unsupported import format: {0}")]
    UnsupportedFormat(String),
    #[error("malformed source: {0}")]
    MalformedSource(String),
    #[error("{kind} not found: {name}")]
    UnresolvedReference { kind: ReferenceKind, name: String },
    #[error("backend rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("route geometry unavailable: {0}")]
    Geometry(String),
    #[error("map operation failed: {0}")]
    Map(String),
    #[error(transparent)]
    Network(reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Xlsx(#[from] calamine::XlsxError),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Municipality,
    Company,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::Municipality => f.write_str("municipality"),
            ReferenceKind::Company => f.write_str("company"),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout
        } else {
            AppError::Network(err)
        }
    }
}

impl AppError {
    /// Transport-level failures, as opposed to a backend that answered with a rejection.
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Network(_) | AppError::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_reference_reads_naturally() {
        let err = AppError::UnresolvedReference {
            kind: ReferenceKind::Municipality,
            name: "Atlantis".into(),
        };
        assert_eq!(err.to_string(), "municipality not found: Atlantis");
        assert!(!err.is_transport());
    }

    #[test]
    fn classifies_transport_errors() {
        assert!(AppError::Timeout.is_transport());
        assert!(AppError::Cancelled.is_cancelled());
        assert!(!AppError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_transport());
    }
}
