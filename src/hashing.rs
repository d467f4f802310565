use std::io::Read;
use std::path::Path;

use log::warn;

use crate::error::{Result, UpdateError};

const READ_CHUNK: usize = 64 * 1024;

/// Compute the content identifier of a file.
///
/// The identifier is the manifest's textual digest form: each byte of the
/// file's MD5 digest rendered in decimal and concatenated. Existing
/// manifests carry exactly this form, so it must not change.
pub fn file_identifier(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        UpdateError::FilesystemFailed(format!("unable to open {}: {e}", path.display()))
    })?;

    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buffer).map_err(|e| {
            UpdateError::FilesystemFailed(format!("read error on {}: {e}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }

    Ok(digest_identifier(&context.compute().0))
}

/// Like [`file_identifier`], but reduces any failure to "identifier
/// unavailable", which callers treat as "not intact".
#[must_use]
pub fn try_file_identifier(path: &Path) -> Option<String> {
    match file_identifier(path) {
        Ok(identifier) => Some(identifier),
        Err(err) => {
            warn!("hash: identifier unavailable for {}: {err}", path.display());
            None
        }
    }
}

/// Identifier comparison is case-insensitive string equality; an empty
/// identifier never matches anything.
#[must_use]
pub fn identifiers_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && a.eq_ignore_ascii_case(b)
}

fn digest_identifier(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 3);
    for byte in digest {
        out.push_str(&byte.to_string());
    }
    out
}
