//! Error kinds surfaced by the Join Server.
//!
//! Nonce and MIC failures are reported verbatim so that a misbehaving
//! device can be told apart from a misconfigured server. Registry and
//! storage failures are wrapped as `Internal`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed protocol fields, version mismatch, JoinEUI outside the
    /// configured prefixes, or a rejected DevNonce.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is missing required payload, or its structure is
    /// impossible for the call (protocol corruption rather than misuse).
    #[error("data loss: {0}")]
    DataLoss(String),

    /// MIC mismatch, or the caller is not authorized for this device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The caller did not present cluster-level authentication.
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A requested key is absent from the stored envelope.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The JoinNonce space of the device is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An optimistic commit lost a race. The same DevNonce must not be
    /// retried.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Wraps a registry/storage failure.
    pub fn registry(cause: impl Into<anyhow::Error>) -> Self {
        Error::Internal(cause.into().context("registry operation failed"))
    }

    /// Stable identifier of the error kind, for wire responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::DataLoss(_) => "data_loss",
            Error::PermissionDenied(_) => "permission_denied",
            Error::Unauthenticated => "unauthenticated",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Aborted(_) => "aborted",
            Error::Internal(_) => "internal",
        }
    }
}
