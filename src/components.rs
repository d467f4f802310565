use crate::util::canonical_slashes;

/// An optional downloadable module, configured in `[CustomComponents]` and
/// versioned through the manifest's `[AddOns]` section with the same
/// hashing rules as tracked files.
#[derive(Debug, Clone, Default)]
pub struct CustomComponent {
    /// Unique key shared between the config and the manifest.
    pub ini_name: String,
    pub display_name: String,
    /// URL path relative to the mirror, or an absolute URL.
    pub download_path: String,
    /// Installation-relative destination.
    pub local_path: String,
    pub download_path_is_absolute: bool,
    pub no_archive_extension_on_download_path: bool,

    // Runtime state, refreshed by each version check.
    pub remote_size: u32,
    pub remote_archive_size: u32,
    pub remote_identifier: String,
    pub remote_archive_identifier: String,
    pub local_identifier: String,
    pub archived: bool,
    pub initialized: bool,
    pub is_being_downloaded: bool,
}

impl CustomComponent {
    /// Build from a `display,ini_name,download_path,local_path[,no_ext]`
    /// field list.
    #[must_use]
    pub fn from_fields(fields: &[String]) -> Option<Self> {
        if fields.len() < 4 || fields[1].is_empty() || fields[3].is_empty() {
            return None;
        }
        let download_path = fields[2].clone();
        let download_path_is_absolute =
            download_path.starts_with("http://") || download_path.starts_with("https://");
        let no_archive_extension_on_download_path = fields
            .get(4)
            .map(|flag| flag.eq_ignore_ascii_case("true") || flag == "1")
            .unwrap_or(false);
        Some(Self {
            display_name: fields[0].clone(),
            ini_name: fields[1].clone(),
            download_path: canonical_slashes(&download_path),
            local_path: canonical_slashes(&fields[3]),
            download_path_is_absolute,
            no_archive_extension_on_download_path,
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| (*p).to_owned()).collect()
    }

    #[test]
    fn parses_relative_component() {
        let c = CustomComponent::from_fields(&fields(&[
            "Map Pack",
            "MapPack",
            "addons\\mappack.pkg",
            "Maps\\mappack.pkg",
        ]))
        .unwrap();
        assert_eq!(c.display_name, "Map Pack");
        assert_eq!(c.ini_name, "MapPack");
        assert_eq!(c.download_path, "addons/mappack.pkg");
        assert_eq!(c.local_path, "Maps/mappack.pkg");
        assert!(!c.download_path_is_absolute);
        assert!(!c.no_archive_extension_on_download_path);
    }

    #[test]
    fn detects_absolute_urls_and_extension_flag() {
        let c = CustomComponent::from_fields(&fields(&[
            "Voice Pack",
            "VoicePack",
            "https://cdn.example/voicepack.pkg",
            "Audio/voicepack.pkg",
            "True",
        ]))
        .unwrap();
        assert!(c.download_path_is_absolute);
        assert!(c.no_archive_extension_on_download_path);
    }

    #[test]
    fn rejects_short_field_lists() {
        assert!(CustomComponent::from_fields(&fields(&["a", "b", "c"])).is_none());
    }
}
