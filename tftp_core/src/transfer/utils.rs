use std::path::{Path, PathBuf};

use crate::transfer::constants::{COMPRESSED_SUFFIX, MAX_FILENAME_LENGTH};

/// Check that a requested file name stays inside the store root.
///
/// Returns the reason for rejection so callers can log it or send it back
/// to the peer.
pub fn validate_file_name(file_name: &str) -> Result<(), &'static str> {
    if file_name.trim().is_empty() {
        return Err("empty file name");
    }
    if file_name == "." || file_name == ".." {
        return Err("invalid file name");
    }
    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err("file name too long");
    }
    if file_name.contains(['/', '\\']) {
        return Err("path separators are not allowed");
    }
    if file_name.chars().any(|c| c.is_control()) {
        return Err("control characters are not allowed");
    }
    Ok(())
}

/// Path of the temporary compressed copy of `path`
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(COMPRESSED_SUFFIX);
    PathBuf::from(name)
}

/// Inverse of [`compressed_path`]; `None` if `path` lacks the suffix
pub fn decompressed_path(path: &Path) -> Option<PathBuf> {
    let name = path.to_str()?;
    name.strip_suffix(COMPRESSED_SUFFIX)
        .filter(|stem| !stem.is_empty())
        .map(PathBuf::from)
}
