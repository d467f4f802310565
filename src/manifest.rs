use std::path::Path;

use log::{debug, warn};

use crate::error::Result;
use crate::inifile::IniFile;
use crate::util::canonical_slashes;

const DTA_SECTION: &str = "DTA";
const FILE_VERSIONS_SECTION: &str = "FileVersions";
const ARCHIVED_FILES_SECTION: &str = "ArchivedFiles";
const ADD_ONS_SECTION: &str = "AddOns";

/// Not-a-version marker; an updater version of `N/A` never triggers the
/// manual-update gate.
pub const NO_VERSION: &str = "N/A";

/// One tracked file: installation-relative path, content identifier, and
/// optional archived form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntry {
    /// Forward-slash canonical, installation-relative.
    pub path: String,
    /// Content hash in the manifest's textual form.
    pub identifier: String,
    /// Plaintext size in kilobytes, 0 if unknown.
    pub size: u32,
    /// Hash of the compressed form, empty when the file is served plain.
    pub archive_identifier: String,
    /// Compressed size in kilobytes, 0 when not archived.
    pub archive_size: u32,
}

impl FileEntry {
    #[must_use]
    pub fn archived(&self) -> bool {
        !self.archive_identifier.is_empty()
    }

    /// Kilobytes fetched over the wire for this entry.
    #[must_use]
    pub fn download_size(&self) -> u32 {
        if self.archived() { self.archive_size } else { self.size }
    }
}

/// An immutable snapshot of a `version` file. Each version check parses a
/// fresh server manifest; entries are replaced, never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub game_version: String,
    pub updater_version: String,
    pub manual_download_url: String,
    pub files: Vec<FileEntry>,
    /// Optional components, keyed by component name in `path`.
    pub add_ons: Vec<FileEntry>,
}

impl Manifest {
    pub fn parse(ini: &IniFile) -> Self {
        let mut files = Vec::new();
        for key in ini.keys(FILE_VERSIONS_SECTION) {
            let fields = ini.fields(FILE_VERSIONS_SECTION, key);
            let Some(entry) = entry_from_fields(key, &fields) else {
                warn!("manifest: skipping malformed file entry {key:?}");
                continue;
            };
            files.push(entry);
        }

        let mut add_ons = Vec::new();
        for key in ini.keys(ADD_ONS_SECTION) {
            let fields = ini.fields(ADD_ONS_SECTION, key);
            let Some(entry) = entry_from_fields(key, &fields) else {
                warn!("manifest: skipping malformed add-on entry {key:?}");
                continue;
            };
            add_ons.push(entry);
        }

        for key in ini.keys(ARCHIVED_FILES_SECTION) {
            let canonical = canonical_slashes(key);
            let Some(entry) = files
                .iter_mut()
                .chain(add_ons.iter_mut())
                .find(|f| f.path == canonical)
            else {
                debug!("manifest: archive listed for untracked file {key:?}");
                continue;
            };
            let fields = ini.fields(ARCHIVED_FILES_SECTION, key);
            if fields.len() < 2 || fields[0].is_empty() {
                warn!("manifest: skipping malformed archive entry {key:?}");
                continue;
            }
            entry.archive_identifier = fields[0].clone();
            entry.archive_size = fields[1].parse().unwrap_or(0);
        }

        Self {
            game_version: ini.get_or(DTA_SECTION, "Version", "").to_owned(),
            updater_version: ini.get_or(DTA_SECTION, "UpdaterVersion", NO_VERSION).to_owned(),
            manual_download_url: ini.get_or(DTA_SECTION, "ManualDownloadURL", "").to_owned(),
            files,
            add_ons,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(Self::parse(&IniFile::read(path)?))
    }

    /// Read a manifest, treating a missing or unreadable file as an empty
    /// install (nothing tracked, no version).
    #[must_use]
    pub fn read_or_default(path: &Path) -> Self {
        match Self::read(path) {
            Ok(manifest) => manifest,
            Err(err) => {
                debug!("manifest: no local manifest at {}: {err}", path.display());
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    #[must_use]
    pub fn add_on(&self, name: &str) -> Option<&FileEntry> {
        self.add_ons.iter().find(|a| a.path == name)
    }
}

fn entry_from_fields(key: &str, fields: &[String]) -> Option<FileEntry> {
    if fields.len() < 2 || fields[0].is_empty() {
        return None;
    }
    Some(FileEntry {
        path: canonical_slashes(key),
        identifier: fields[0].clone(),
        size: fields[1].parse().unwrap_or(0),
        ..FileEntry::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_MANIFEST: &str = "[DTA]\n\
        Version=1.17\n\
        UpdaterVersion=2\n\
        ManualDownloadURL=https://example.invalid/client\n\
        [FileVersions]\n\
        game.dat=41421,120\n\
        INI\\Rules.ini=778,4\n\
        broken_entry=justonefield\n\
        [ArchivedFiles]\n\
        game.dat=90210,48\n\
        phantom.dat=1,1\n\
        [AddOns]\n\
        MapPack=5150,2048\n";

    #[test]
    fn parses_headers_and_file_entries() {
        let manifest = Manifest::parse(&IniFile::parse(SERVER_MANIFEST));
        assert_eq!(manifest.game_version, "1.17");
        assert_eq!(manifest.updater_version, "2");
        assert_eq!(manifest.manual_download_url, "https://example.invalid/client");
        assert_eq!(manifest.files.len(), 2);

        let rules = manifest.file("INI/Rules.ini").unwrap();
        assert_eq!(rules.identifier, "778");
        assert_eq!(rules.size, 4);
        assert!(!rules.archived());
    }

    #[test]
    fn merges_archive_identifiers_onto_tracked_files() {
        let manifest = Manifest::parse(&IniFile::parse(SERVER_MANIFEST));
        let game = manifest.file("game.dat").unwrap();
        assert!(game.archived());
        assert_eq!(game.archive_identifier, "90210");
        assert_eq!(game.archive_size, 48);
        assert_eq!(game.download_size(), 48);
    }

    #[test]
    fn skips_malformed_entries() {
        let manifest = Manifest::parse(&IniFile::parse(SERVER_MANIFEST));
        assert!(manifest.file("broken_entry").is_none());
    }

    #[test]
    fn parses_add_ons() {
        let manifest = Manifest::parse(&IniFile::parse(SERVER_MANIFEST));
        let pack = manifest.add_on("MapPack").unwrap();
        assert_eq!(pack.identifier, "5150");
        assert_eq!(pack.size, 2048);
    }

    #[test]
    fn missing_manifest_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::read_or_default(&dir.path().join("version"));
        assert!(manifest.files.is_empty());
        assert_eq!(manifest.game_version, "");
        assert_eq!(manifest.updater_version, NO_VERSION);
    }
}
