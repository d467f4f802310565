use thiserror::Error;

/// Failure kinds surfaced by the update engine.
///
/// Script steps are best-effort and never abort an update, so
/// `ScriptStepFailed` only shows up in logs. `Cancelled` is not a failure
/// either; the orchestrator maps it to a silent return to `Outdated`.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("updater configuration not found: {0}")]
    ConfigMissing(String),

    #[error("manifest malformed: {0}")]
    ManifestMalformed(String),

    #[error("cannot connect to any update mirror")]
    MirrorExhausted,

    #[error("download failed: {0}")]
    TransportFailed(String),

    #[error("hash mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("script step failed: {0}")]
    ScriptStepFailed(String),

    #[error("filesystem operation failed: {0}")]
    FilesystemFailed(String),

    #[error("timed out waiting for the client exclusion lock")]
    MutexTimeout,

    #[error("launcher executable not found: {0}")]
    LauncherMissing(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("too many retries for {0}")]
    TooManyRetries(String),
}

pub type Result<T> = std::result::Result<T, UpdateError>;

impl UpdateError {
    /// True for the per-file failures the download engine retries once
    /// before giving up on the whole update.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::TransportFailed(_)
                | UpdateError::HashMismatch { .. }
                | UpdateError::DecompressFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_per_file_failures_only() {
        assert!(UpdateError::TransportFailed("x".into()).is_retryable());
        assert!(
            UpdateError::HashMismatch {
                file: "a".into(),
                expected: "1".into(),
                actual: "2".into(),
            }
            .is_retryable()
        );
        assert!(!UpdateError::Cancelled.is_retryable());
        assert!(!UpdateError::MirrorExhausted.is_retryable());
    }
}
