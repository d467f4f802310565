use std::path::{Path, PathBuf};

/// Authoritative local manifest at the installation root.
pub const VERSION_FILE: &str = "version";
/// Freshly downloaded server manifest, promoted to `version` on completion.
pub const TEMP_VERSION_FILE: &str = "version_u";
/// Staging area mirroring the installation tree.
pub const STAGING_DIR: &str = "Updater";
pub const RESOURCES_DIR: &str = "Resources";
pub const UPDATER_CONFIG_FILE: &str = "UpdaterConfig.ini";
/// Pre-`Resources` mirror list, one `url,name,location` line per mirror.
pub const LEGACY_CONFIG_FILE: &str = "updateconfig.ini";
pub const CLIENT_DEFINITIONS_FILE: &str = "ClientDefinitions.ini";
pub const PRE_UPDATE_SCRIPT: &str = "preupdateexec";
pub const UPDATE_SCRIPT: &str = "updateexec";
pub const ARCHIVE_EXTENSION: &str = ".lzma";
/// Staged theme override, promoted to `INI/Theme.ini` during finalize.
pub const THEME_STAGE_FILE: &str = "Theme_c.ini";
pub const THEME_TARGET_FILE: &str = "INI/Theme.ini";

#[cfg(windows)]
pub const SECOND_STAGE_BINARY: &str = "SecondStageUpdater.exe";
#[cfg(not(windows))]
pub const SECOND_STAGE_BINARY: &str = "SecondStageUpdater";

/// Join an installation-relative, forward-slash path onto a root directory,
/// translating separators to the platform's own.
#[must_use]
pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in relative.split(['/', '\\']).filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

#[must_use]
pub fn local_manifest_path(root: &Path) -> PathBuf {
    root.join(VERSION_FILE)
}

#[must_use]
pub fn temp_manifest_path(root: &Path) -> PathBuf {
    root.join(TEMP_VERSION_FILE)
}

#[must_use]
pub fn staging_dir(root: &Path) -> PathBuf {
    root.join(STAGING_DIR)
}

/// Location a planned file is staged at before the second stage promotes it.
#[must_use]
pub fn staged_path(root: &Path, relative: &str) -> PathBuf {
    join_relative(&staging_dir(root), relative)
}

#[must_use]
pub fn resources_dir(root: &Path) -> PathBuf {
    root.join(RESOURCES_DIR)
}

#[must_use]
pub fn updater_config_path(root: &Path) -> PathBuf {
    resources_dir(root).join(UPDATER_CONFIG_FILE)
}

#[must_use]
pub fn legacy_config_path(root: &Path) -> PathBuf {
    root.join(LEGACY_CONFIG_FILE)
}

#[must_use]
pub fn client_definitions_path(root: &Path) -> PathBuf {
    resources_dir(root).join(CLIENT_DEFINITIONS_FILE)
}

#[must_use]
pub fn second_stage_path(root: &Path) -> PathBuf {
    resources_dir(root).join(SECOND_STAGE_BINARY)
}

#[must_use]
pub fn staged_second_stage_path(root: &Path) -> PathBuf {
    staging_dir(root).join(RESOURCES_DIR).join(SECOND_STAGE_BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_relative_paths_with_either_separator() {
        let root = Path::new("/game");
        assert_eq!(
            join_relative(root, "INI/Theme.ini"),
            Path::new("/game").join("INI").join("Theme.ini")
        );
        assert_eq!(
            join_relative(root, "Maps\\Custom\\a.map"),
            Path::new("/game").join("Maps").join("Custom").join("a.map")
        );
        assert_eq!(join_relative(root, "game.dat"), Path::new("/game").join("game.dat"));
    }

    #[test]
    fn stages_under_updater_directory() {
        let root = Path::new("/game");
        assert_eq!(
            staged_path(root, "Resources/binaries.pkg"),
            Path::new("/game")
                .join("Updater")
                .join("Resources")
                .join("binaries.pkg")
        );
    }
}
