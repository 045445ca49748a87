//! Tarball repack boundary
//!
//! Normalizes a fetched upstream file into its canonical name inside a
//! target directory. Formats that would need re-compression are refused;
//! conversion belongs to the external repack utility. Placing a tarball
//! where an identical file already exists is a no-op; a differing file is
//! a conflict.

use std::path::{Path, PathBuf};

use crate::error::SourceError;

/// Compression format of a supported tarball, from its file name.
pub fn tarball_format(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some("gz")
    } else if name.ends_with(".tar.bz2") {
        Some("bz2")
    } else if name.ends_with(".tar.xz") {
        Some("xz")
    } else if name.ends_with(".tar.lzma") {
        Some("lzma")
    } else {
        None
    }
}

/// Place `source` into `target_dir` under `desired_name`.
///
/// Fails with UnsupportedRepackFormat when the source is not a tarball we
/// can pass through unchanged, and with TarballConflict when a different
/// file already occupies the target path.
pub fn repack(
    source: &Path,
    desired_name: &str,
    target_dir: &Path,
) -> Result<PathBuf, SourceError> {
    if tarball_format(source).is_none() {
        return Err(SourceError::UnsupportedRepackFormat {
            location: source.display().to_string(),
        });
    }
    let target = target_dir.join(desired_name);
    if target.exists() {
        let existing = std::fs::read(&target)?;
        let incoming = std::fs::read(source)?;
        if existing == incoming {
            return Ok(target);
        }
        return Err(SourceError::TarballConflict { path: target });
    }
    std::fs::copy(source, &target)?;
    Ok(target)
}
