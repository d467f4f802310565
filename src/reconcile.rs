use std::path::Path;

use log::{debug, info};

use crate::components::CustomComponent;
use crate::hashing::{identifiers_match, try_file_identifier};
use crate::manifest::{FileEntry, Manifest};
use crate::paths::join_relative;

/// Ordered download work list produced by reconciliation.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub entries: Vec<FileEntry>,
    /// Sum of the wire sizes: archive kilobytes for archived entries,
    /// plaintext kilobytes otherwise.
    pub total_kb: u64,
}

impl Plan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: FileEntry) {
        self.total_kb += u64::from(entry.download_size());
        self.entries.push(entry);
    }
}

/// Ignore masks are case-insensitive substring matches against the
/// uppercased path, not globs, despite the name.
#[must_use]
pub fn is_ignored(path: &str, masks: &[String]) -> bool {
    let upper = path.to_uppercase();
    masks
        .iter()
        .any(|mask| !mask.is_empty() && upper.contains(&mask.to_uppercase()))
}

/// Diff the local tree and local manifest against the server manifest.
///
/// A server entry is enqueued when the physical file is missing, when the
/// local manifest disagrees with the server identifier, or (for files the
/// local manifest does not track) when the on-disk content hashes
/// differently. Files the local manifest vouches for are not rehashed here;
/// that is the job of the pre-download local verification pass.
#[must_use]
pub fn build_plan(root: &Path, local: &Manifest, server: &Manifest) -> Plan {
    let mut plan = Plan::default();

    for entry in &server.files {
        let disk_path = join_relative(root, &entry.path);
        match local.file(&entry.path) {
            Some(tracked) => {
                if !disk_path.exists() {
                    debug!("plan: {} missing on disk", entry.path);
                    plan.push(entry.clone());
                } else if !identifiers_match(&tracked.identifier, &entry.identifier) {
                    debug!("plan: {} tracked as {}", entry.path, tracked.identifier);
                    plan.push(entry.clone());
                }
            }
            None => {
                if disk_path.exists() {
                    let actual = try_file_identifier(&disk_path);
                    let intact = actual
                        .map(|id| identifiers_match(&id, &entry.identifier))
                        .unwrap_or(false);
                    if !intact {
                        debug!("plan: {} untracked and stale", entry.path);
                        plan.push(entry.clone());
                    }
                } else {
                    debug!("plan: {} untracked and absent", entry.path);
                    plan.push(entry.clone());
                }
            }
        }
    }

    info!("plan: {} files, {} KB", plan.entries.len(), plan.total_kb);
    plan
}

/// Repair the local manifest against reality before planning downloads:
/// entries for vanished files are dropped and every remaining non-ignored
/// entry is rehashed, overwriting a stale identifier with the actual one.
pub fn verify_local_file_versions(
    root: &Path,
    manifest: &mut Manifest,
    ignore_masks: &[String],
    mut progress: impl FnMut(usize, usize),
) {
    let total = manifest.files.len();
    let mut checked = 0usize;
    manifest.files.retain_mut(|entry| {
        checked += 1;
        progress(checked, total);
        if is_ignored(&entry.path, ignore_masks) {
            return true;
        }
        let disk_path = join_relative(root, &entry.path);
        if !disk_path.exists() {
            debug!("verify: dropping vanished {}", entry.path);
            return false;
        }
        match try_file_identifier(&disk_path) {
            Some(actual) => entry.identifier = actual,
            None => return false,
        }
        true
    });
}

/// A component is outdated when its payload is on disk but its identifiers
/// diverge from the server's.
#[must_use]
pub fn components_outdated(root: &Path, components: &[CustomComponent]) -> bool {
    components.iter().any(|c| {
        c.initialized
            && join_relative(root, &c.local_path).exists()
            && !c.remote_identifier.eq_ignore_ascii_case(&c.local_identifier)
    })
}
