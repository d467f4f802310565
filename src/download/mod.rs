use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use log::{debug, info, warn};

use crate::components::CustomComponent;
use crate::decompress::decompress_file;
use crate::error::{Result, UpdateError};
use crate::hashing::{identifiers_match, try_file_identifier};
use crate::manifest::FileEntry;
use crate::paths::{self, ARCHIVE_EXTENSION};
use crate::transport::{ProgressCallback, Transport, UserAgent};
use crate::util::canonical_slashes;

/// Executes a reconciliation plan: fetch, verify, decompress, verify again,
/// and leave the result in the staging area. Each file gets two attempts;
/// the second failure aborts the whole update.
pub struct DownloadEngine<'a> {
    root: &'a Path,
    transport: &'a mut Transport,
    user_agent: &'a UserAgent,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> DownloadEngine<'a> {
    pub fn new(
        root: &'a Path,
        transport: &'a mut Transport,
        user_agent: &'a UserAgent,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self { root, transport, user_agent, cancel }
    }

    /// Download one planned entry into the staging area. Returns the name of
    /// the archive that was fetched, when the entry was served archived.
    pub async fn fetch_entry(
        &mut self,
        mirror_url: &str,
        entry: &FileEntry,
        mut progress: ProgressCallback<'_, '_>,
    ) -> Result<Option<String>> {
        let final_path = paths::staged_path(self.root, &entry.path);
        let mut url = format!("{mirror_url}{}", canonical_slashes(&entry.path));
        let archive = if entry.archived() {
            url.push_str(ARCHIVE_EXTENSION);
            Some(ArchiveStep {
                path: archive_sibling(&final_path),
                identifier: entry.archive_identifier.clone(),
            })
        } else {
            None
        };

        for attempt in 1..=2 {
            match self
                .run_pipeline(&url, &final_path, &entry.identifier, archive.as_ref(), progress.as_deref_mut())
                .await
            {
                Ok(()) => {
                    info!("download: {} committed to staging", entry.path);
                    return Ok(archive
                        .map(|_| format!("{}{ARCHIVE_EXTENSION}", entry.path)));
                }
                Err(err) if err.is_retryable() => {
                    warn!("download: attempt {attempt} for {} failed: {err}", entry.path);
                }
                Err(err) => return Err(err),
            }
        }
        Err(UpdateError::TooManyRetries(entry.path.clone()))
    }

    /// Download a custom component straight to its installation location.
    /// Same pipeline as tracked files, but no staging directory and no plan
    /// participation.
    pub async fn fetch_component(
        &mut self,
        mirror_url: &str,
        component: &CustomComponent,
        mut progress: ProgressCallback<'_, '_>,
    ) -> Result<()> {
        let final_path = paths::join_relative(self.root, &component.local_path);
        let mut url = if component.download_path_is_absolute {
            component.download_path.clone()
        } else {
            format!("{mirror_url}{}", component.download_path)
        };
        let archive = if component.archived {
            if !component.no_archive_extension_on_download_path {
                url.push_str(ARCHIVE_EXTENSION);
            }
            Some(ArchiveStep {
                path: archive_sibling(&final_path),
                identifier: component.remote_archive_identifier.clone(),
            })
        } else {
            None
        };

        for attempt in 1..=2 {
            match self
                .run_pipeline(
                    &url,
                    &final_path,
                    &component.remote_identifier,
                    archive.as_ref(),
                    progress.as_deref_mut(),
                )
                .await
            {
                Ok(()) => {
                    info!("download: component {} installed", component.ini_name);
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        "download: attempt {attempt} for component {} failed: {err}",
                        component.ini_name
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(UpdateError::TooManyRetries(component.ini_name.clone()))
    }

    /// One attempt: reuse an intact file when possible, otherwise fetch,
    /// then verify / decompress / verify.
    async fn run_pipeline(
        &mut self,
        url: &str,
        final_path: &Path,
        identifier: &str,
        archive: Option<&ArchiveStep>,
        mut progress: ProgressCallback<'_, '_>,
    ) -> Result<()> {
        // A file that already hashes to the target identifier needs nothing.
        if hash_matches(final_path, identifier).await {
            debug!("download: {} already intact, skipping", final_path.display());
            return Ok(());
        }

        match archive {
            Some(step) => {
                // A leftover archive that still verifies skips the network.
                if !hash_matches(&step.path, &step.identifier).await {
                    self.transport
                        .download(url, &step.path, self.user_agent, progress.as_deref_mut(), &self.cancel)
                        .await?;
                    verify_or_remove(&step.path, &step.identifier).await?;
                }
                decompress_file(&step.path, final_path, self.cancel.clone()).await?;
                let _ = tokio::fs::remove_file(&step.path).await;
            }
            None => {
                self.transport
                    .download(url, final_path, self.user_agent, progress.as_deref_mut(), &self.cancel)
                    .await?;
            }
        }

        verify_or_remove(final_path, identifier).await
    }
}

struct ArchiveStep {
    path: PathBuf,
    identifier: String,
}

fn archive_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(ARCHIVE_EXTENSION);
    PathBuf::from(name)
}

async fn identifier_of(path: &Path) -> Option<String> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || try_file_identifier(&path))
        .await
        .ok()
        .flatten()
}

async fn hash_matches(path: &Path, expected: &str) -> bool {
    if !path.exists() {
        return false;
    }
    identifier_of(path)
        .await
        .map(|actual| identifiers_match(&actual, expected))
        .unwrap_or(false)
}

/// Verify a downloaded file against its identifier, deleting it on
/// mismatch so a retry starts clean.
async fn verify_or_remove(path: &Path, expected: &str) -> Result<()> {
    let actual = identifier_of(path).await.unwrap_or_default();
    if identifiers_match(&actual, expected) {
        return Ok(());
    }
    warn!(
        "download: {} hashed to {actual}, expected {expected}; removing",
        path.display()
    );
    let _ = tokio::fs::remove_file(path).await;
    Err(UpdateError::HashMismatch {
        file: path.display().to_string(),
        expected: expected.to_owned(),
        actual,
    })
}
