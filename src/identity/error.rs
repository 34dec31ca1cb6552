use crate::store::StoreError;
use thiserror::Error;

/// Failure classes surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input, bad credentials or a business rule violation.
    #[error("{0}")]
    Client(String),
    /// The referenced record does not exist or has expired.
    #[error("{0}")]
    NotFound(String),
    /// Verification code mismatch. Converted into [`Error::Client`] once the
    /// failed attempt has been recorded; seeing it outside the engine is a bug.
    #[error("{0}")]
    VerifyFailed(String),
    /// A defect or store inconsistency. The detail stays in the source chain.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    NotFound,
    VerifyFailed,
    Internal,
}

impl Error {
    pub(crate) fn client(message: impl Into<String>) -> Self {
        Self::Client(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Client(_) => ErrorKind::Client,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::VerifyFailed(_) => ErrorKind::VerifyFailed,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for failures that signal a bug rather than a caller mistake.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(self.kind(), ErrorKind::Internal | ErrorKind::VerifyFailed)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
