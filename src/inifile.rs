use std::path::Path;

use log::debug;

use crate::error::{Result, UpdateError};

/// Sectioned key/value store covering the manifest, config, and script
/// dialect: `[Section]` headers, `key=value` pairs, bare keys without a
/// value, duplicate keys resolved last-write-wins, and values that are
/// ordered comma-separated field lists.
///
/// The parser tolerates a UTF-8 BOM, CRLF and LF line endings, blank lines,
/// and full-line `;` comments. Section and key order are preserved.
#[derive(Debug, Clone, Default)]
pub struct IniFile {
    sections: Vec<Section>,
}

#[derive(Debug, Clone)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl IniFile {
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut sections: Vec<Section> = Vec::new();
        let mut current: Option<usize> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r').trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                // A repeated header re-opens the existing section.
                current = Some(match sections.iter().position(|s| s.name == name) {
                    Some(index) => index,
                    None => {
                        sections.push(Section {
                            name: name.to_owned(),
                            entries: Vec::new(),
                        });
                        sections.len() - 1
                    }
                });
                continue;
            }

            let Some(index) = current else {
                // Key/value data before the first header has no home.
                debug!("ini: ignoring orphan line {line:?}");
                continue;
            };
            let section = &mut sections[index];

            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, ""),
            };
            match section.entries.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.to_owned(),
                None => section.entries.push((key.to_owned(), value.to_owned())),
            }
        }

        Self { sections }
    }

    /// Read and parse a file, surfacing read failures as filesystem errors.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            UpdateError::FilesystemFailed(format!("unable to read {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&String::from_utf8_lossy(&bytes)))
    }

    #[must_use]
    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.name == name)
    }

    /// Keys of a section in file order; empty when the section is absent.
    pub fn keys<'a>(&'a self, section: &str) -> impl Iterator<Item = &'a str> {
        self.sections
            .iter()
            .filter(move |s| s.name == section)
            .flat_map(|s| s.entries.iter().map(|(k, _)| k.as_str()))
    }

    #[must_use]
    pub fn get<'a>(&'a self, section: &str, key: &str) -> Option<&'a str> {
        self.sections
            .iter()
            .find(|s| s.name == section)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    /// The value split on `,` into trimmed fields; empty when the key is
    /// absent.
    #[must_use]
    pub fn fields(&self, section: &str, key: &str) -> Vec<String> {
        match self.get(section, key) {
            Some(value) if !value.is_empty() => {
                value.split(',').map(|f| f.trim().to_owned()).collect()
            }
            _ => Vec::new(),
        }
    }
}
