use std::path::Path;

use log::{info, warn};

use crate::components::CustomComponent;
use crate::error::{Result, UpdateError};
use crate::inifile::IniFile;
use crate::mirrors::UpdateMirror;
use crate::paths;

const SETTINGS_SECTION: &str = "Settings";
const MIRRORS_SECTION: &str = "DownloadMirrors";
const COMPONENTS_SECTION: &str = "CustomComponents";

/// Files matching these masks are trusted by identifier during local
/// verification instead of being rehashed. Masks are substring matches, not
/// globs.
pub const DEFAULT_IGNORE_MASKS: &[&str] = &[".rtf", ".txt", "Theme.ini", "gui_settings.xml"];

/// Parsed `Resources/UpdaterConfig.ini` (or the legacy `updateconfig.ini`
/// mirror list when the former is absent).
#[derive(Debug, Clone, Default)]
pub struct UpdaterConfig {
    pub ignore_masks: Vec<String>,
    pub mirrors: Vec<UpdateMirror>,
    pub components: Vec<CustomComponent>,
}

impl UpdaterConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = paths::updater_config_path(root);
        if config_path.exists() {
            return Ok(Self::from_ini(&IniFile::read(&config_path)?));
        }

        let legacy_path = paths::legacy_config_path(root);
        if legacy_path.exists() {
            info!("config: falling back to legacy mirror list {}", legacy_path.display());
            return Self::from_legacy(&legacy_path);
        }

        Err(UpdateError::ConfigMissing(format!(
            "neither {} nor {} exists",
            config_path.display(),
            legacy_path.display()
        )))
    }

    fn from_ini(ini: &IniFile) -> Self {
        let mut ignore_masks = ini.fields(SETTINGS_SECTION, "IgnoreMasks");
        ignore_masks.retain(|m| !m.is_empty());
        if ignore_masks.is_empty() {
            ignore_masks = DEFAULT_IGNORE_MASKS.iter().map(|m| (*m).to_owned()).collect();
        }

        let mut mirrors = Vec::new();
        for key in ini.keys(MIRRORS_SECTION) {
            match UpdateMirror::from_fields(&ini.fields(MIRRORS_SECTION, key)) {
                Some(mirror) => mirrors.push(mirror),
                None => warn!("config: skipping malformed mirror entry {key:?}"),
            }
        }

        let mut components = Vec::new();
        for key in ini.keys(COMPONENTS_SECTION) {
            match CustomComponent::from_fields(&ini.fields(COMPONENTS_SECTION, key)) {
                Some(component) => components.push(component),
                None => warn!("config: skipping malformed component entry {key:?}"),
            }
        }

        Self { ignore_masks, mirrors, components }
    }

    /// Legacy format: one `url,name,location` line per mirror, no sections.
    fn from_legacy(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            UpdateError::FilesystemFailed(format!("unable to read {}: {e}", path.display()))
        })?;

        let mut mirrors = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let fields: Vec<String> = line.split(',').map(|f| f.trim().to_owned()).collect();
            match UpdateMirror::from_fields(&fields) {
                Some(mirror) => mirrors.push(mirror),
                None => warn!("config: skipping malformed legacy mirror line {line:?}"),
            }
        }

        Ok(Self {
            ignore_masks: DEFAULT_IGNORE_MASKS.iter().map(|m| (*m).to_owned()).collect(),
            mirrors,
            components: Vec::new(),
        })
    }
}
