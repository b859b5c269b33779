use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Module information unavailable: {0}")]
    ModuleInfoUnavailable(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signature not found: {0}")]
    SignatureNotFound(String),

    #[error("Expected {expected} patch sites, scan found {actual}")]
    UnexpectedSiteCount { expected: usize, actual: usize },

    #[error("No zero-filled span of {required} bytes at the end of the code section")]
    InsufficientCaveSpace { required: usize },

    #[error("Relative call from {site:#x} to {target:#x} exceeds 32-bit displacement range")]
    RelativeCallOutOfRange { site: u64, target: u64 },

    #[error("Pointer {pointer:#x} does not fit into a {width}-byte literal")]
    PointerTruncated { pointer: u64, width: usize },

    #[error("Failed to change memory protection at {address:#x}: {message}")]
    ProtectionChangeFailed { address: u64, message: String },

    #[error("Memory access failed at address {address:#x}: {message}")]
    MemoryAccessFailed { address: u64, message: String },

    #[error("Patch sequence already applied")]
    PatchAlreadyApplied,

    #[error("Failed to attach hook: {0}")]
    HookAttachFailed(String),

    #[error("Hook transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error means a scan produced no usable result.
    ///
    /// Scan failures are non-fatal to the host: the caller skips the
    /// feature and leaves the process running.
    pub fn is_scan_failure(&self) -> bool {
        matches!(
            self,
            Error::SignatureNotFound(_) | Error::UnexpectedSiteCount { .. }
        )
    }
}
