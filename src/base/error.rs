use crate::ctrl::LockMode;

#[derive(Debug, Display, Error, From)]
pub enum HlmError {
    // -- Argument Errors --
    #[display("Invalid argument `{name}`: {reason}")]
    InvalidArgument {
        name: &'static str,
        reason: &'static str,
    },
    #[display("Invalid prime lock mode: {_0} (only Shared and Exclusive are supported)")]
    InvalidPrimeLockMode(#[error(not(source))] LockMode),

    // -- Lifecycle Errors --
    #[display("Lock manager is already open for owner {_0}")]
    AlreadyOpen(#[error(not(source))] String),
    #[display("Lock manager is still closing and cannot be opened yet")]
    StillClosing,
    #[display("No tokio runtime available to drive lock expiration timers")]
    NoRuntime,

    // -- Prime Lock Errors --
    #[from]
    #[display("Timed out waiting for the prime lock: {}", _0)]
    PrimeLockTimeout(tokio::time::error::Elapsed),
    #[from]
    #[display("Prime lock closed while waiting: {}", _0)]
    PrimeLockClosed(tokio::sync::AcquireError),
}

impl HlmError {
    pub(crate) const fn invalid_argument(name: &'static str, reason: &'static str) -> Self {
        Self::InvalidArgument { name, reason }
    }
}

pub type HlmResult<T> = Result<T, HlmError>;
