/// Where the installation stands relative to the server, as observed by the
/// host. Transitions are driven exclusively by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionState {
    /// Nothing known yet, or the last operation failed.
    Unknown,
    UpToDate,
    Outdated,
    /// Local files do not correspond to any version the server offers; the
    /// host decides how to surface this.
    Mismatched,
    UpdateCheckInProgress,
    UpdateInProgress,
}

/// Notifications pushed to the host over the channel handed to the
/// orchestrator at construction. The host thread only observes; all state
/// is written by the update worker.
#[derive(Clone, Debug)]
pub enum UpdaterEvent {
    /// The in-memory local manifest changed (verification or rescan).
    FileIdentifiersUpdated,
    LocalFileCheckProgressChanged {
        done: usize,
        total: usize,
    },
    CustomComponentsOutdated,
    LocalFileVersionsChecked,
    UpdateCompleted,
    UpdateFailed(String),
    VersionStateChanged(VersionState),
    /// A planned file was committed; carries the fetched archive name when
    /// the file was served archived.
    FileDownloadCompleted {
        archive_name: Option<String>,
    },
    /// The second stage has been spawned; the host should exit.
    Restart,
    UpdateProgressChanged {
        current_file: String,
        file_percent: f32,
        total_percent: f32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_states_keep_their_declared_order() {
        assert!(VersionState::Unknown < VersionState::UpToDate);
        assert!(VersionState::UpToDate < VersionState::Outdated);
        assert!(VersionState::Mismatched < VersionState::UpdateCheckInProgress);
        assert!(VersionState::UpdateCheckInProgress < VersionState::UpdateInProgress);
    }
}
