use std::io;
use std::path::Path;

use log::{debug, info, warn};

use crate::error::UpdateError;
use crate::inifile::IniFile;
use crate::paths::join_relative;

/// The mutation sections of `preupdateexec` / `updateexec`, in the exact
/// order they are processed.
const SECTION_ORDER: &[&str] = &[
    "Delete",
    "Rename",
    "RenameFolder",
    "RenameAndMerge",
    "DeleteFolder",
    "ForceDeleteFolder",
    "DeleteFolderIfEmpty",
    "CreateFolder",
];

/// Run a downloaded mutation script against the installation and delete the
/// script file afterwards.
///
/// Every operation is best-effort: a failing key is logged and the rest of
/// the script still runs. All paths are installation-relative.
pub fn run_script_file(root: &Path, script_path: &Path) {
    let ini = match IniFile::read(script_path) {
        Ok(ini) => ini,
        Err(err) => {
            warn!("script: unable to read {}: {err}", script_path.display());
            return;
        }
    };
    info!("script: running {}", script_path.display());
    apply(root, &ini);
    if let Err(err) = std::fs::remove_file(script_path) {
        warn!("script: unable to remove {}: {err}", script_path.display());
    }
}

fn apply(root: &Path, ini: &IniFile) {
    for &section in SECTION_ORDER {
        for key in ini.keys(section) {
            let value = ini.get(section, key).unwrap_or("");
            if let Err(err) = apply_one(root, section, key, value) {
                let err = UpdateError::ScriptStepFailed(format!("[{section}] {key}: {err}"));
                warn!("script: {err}");
            }
        }
    }
}

fn apply_one(root: &Path, section: &str, key: &str, value: &str) -> io::Result<()> {
    match section {
        "Delete" => delete_file(&join_relative(root, key)),
        "Rename" => rename(&join_relative(root, key), &join_relative(root, value)),
        "RenameFolder" => rename(&join_relative(root, key), &join_relative(root, value)),
        "RenameAndMerge" => {
            rename_and_merge(&join_relative(root, key), &join_relative(root, value))
        }
        "DeleteFolder" | "ForceDeleteFolder" => delete_folder(&join_relative(root, key)),
        "DeleteFolderIfEmpty" => delete_folder_if_empty(&join_relative(root, key)),
        "CreateFolder" => create_folder(&join_relative(root, key)),
        _ => Ok(()),
    }
}

fn delete_file(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    debug!("script: deleting {}", path.display());
    std::fs::remove_file(path)
}

fn rename(source: &Path, target: &Path) -> io::Result<()> {
    if !source.exists() {
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    debug!("script: moving {} -> {}", source.display(), target.display());
    std::fs::rename(source, target)
}

/// Move a directory into `target`; when `target` already exists, merge the
/// source's files into it, discarding sources that would collide.
fn rename_and_merge(source: &Path, target: &Path) -> io::Result<()> {
    if !source.exists() {
        return Ok(());
    }
    if !target.exists() {
        return rename(source, target);
    }
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let destination = target.join(entry.file_name());
        if destination.exists() {
            debug!("script: merge drops duplicate {}", entry.path().display());
            std::fs::remove_file(entry.path())?;
        } else {
            std::fs::rename(entry.path(), destination)?;
        }
    }
    Ok(())
}

fn delete_folder(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    debug!("script: deleting folder {}", path.display());
    std::fs::remove_dir_all(path)
}

/// Delete the directory only when it holds no files; remaining
/// subdirectories count as empty enough.
fn delete_folder_if_empty(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(path)? {
        if entry?.file_type()?.is_file() {
            return Ok(());
        }
    }
    std::fs::remove_dir_all(path)
}

fn create_folder(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
}
