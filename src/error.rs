//! Defines the closed error taxonomy carried by every core operation --- [`Error`].

/// Result of core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the metadata service, the lock manager, the payload
/// index and the storage backends.
///
/// Protocol adapters map these onto wire status codes; the core never
/// invents protocol-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No such file, directory, share or record. The name or identifier
    /// specified does not exist.
    #[error("no such entry")]
    NotFound,
    /// The entry specified already exists.
    #[error("entry already exists")]
    AlreadyExists,
    /// The caller specified a non-directory in a directory operation.
    #[error("not a directory")]
    NotDirectory,
    /// The caller specified a directory in a non-directory operation.
    #[error("is a directory")]
    IsDirectory,
    /// An attempt was made to remove or replace a directory that was not
    /// empty.
    #[error("directory not empty")]
    NotEmpty,
    /// The opaque file handle failed internal consistency checks.
    #[error("invalid file handle")]
    InvalidHandle,
    /// Invalid or unsupported argument for an operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The requested access mask exceeds the mask granted to the caller.
    /// Contrast with [`Error::PrivilegeRequired`], which restricts itself
    /// to operations no unprivileged user may perform.
    #[error("permission denied")]
    PermissionDenied,
    /// The operation was not allowed because the caller is not a
    /// privileged user (root), regardless of file permission bits.
    #[error("operation requires privileged caller")]
    PrivilegeRequired,
    /// A non-blocking lock acquisition found a conflicting holder.
    /// Carries a description of the conflicting owner.
    #[error("lock held by {owner}")]
    WouldBlock {
        /// Description of the conflicting lock owner.
        owner: String,
    },
    /// A blocking lock wait was cancelled by the caller or timed out.
    #[error("lock wait abandoned")]
    Conflict,
    /// The handle points at an entry that has been destroyed.
    #[error("stale file handle")]
    Stale,
    /// A modifying operation was attempted on a read-only share, or the
    /// write was forbidden by an access-control list.
    #[error("read-only file system")]
    ReadOnly,
    /// A hard backend fault occurred while processing the operation.
    /// `retryable` marks transient serialization or deadlock faults that
    /// the transaction retry loop may re-run.
    #[error("i/o error: {message}")]
    Io {
        /// Human-readable cause.
        message: String,
        /// Whether re-running the transaction closure may succeed.
        retryable: bool,
    },
    /// The caller's deadline expired or its cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// A quota, connection pool or slot table limit was reached.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
}

impl Error {
    /// Builds a non-retryable backend fault.
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io { message: message.into(), retryable: false }
    }

    /// Builds a backend fault the transaction retry loop may re-run.
    pub fn io_retryable(message: impl Into<String>) -> Self {
        Error::Io { message: message.into(), retryable: true }
    }

    /// Tells whether re-running the failed transaction closure may
    /// succeed. Only transient backend faults qualify; everything else in
    /// the taxonomy is a final outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io { retryable: true, .. })
    }
}
