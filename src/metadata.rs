//! Read-only inspection of the packaging tree
//!
//! This module provides:
//! - Upstream repository location from debian/upstream/metadata
//! - VCS location splitting ("URL -b branch [subpath]")
//! - Build type detection (normal / native / merge)
//! - Files-Excluded extraction from debian/copyright
//! - Layout sanity checks (control files in root, upstream source presence)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use debversion::Version;
use regex::Regex;

use crate::error::MergeError;

/// How the source package is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildType {
    /// Upstream source bundled, packaging in debian/
    Normal,
    /// No separate upstream concept
    Native,
    /// Packaging-only branch; upstream fetched at build time
    Merge,
}

/// An upstream branch location split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsLocation {
    pub url: String,
    pub branch: Option<String>,
    pub subpath: Option<String>,
}

fn base_dir(root: &Path, subpath: &str) -> PathBuf {
    if subpath.is_empty() {
        root.to_path_buf()
    } else {
        root.join(subpath)
    }
}

/// Split a VCS location of the form "URL [-b branch] [subpath]".
pub fn split_vcs_url(location: &str) -> VcsLocation {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?P<url>\S+)(?:\s+-b\s+(?P<branch>\S+))?(?:\s+\[(?P<subpath>[^\]]+)\])?$")
            .unwrap()
    });
    match re.captures(location.trim()) {
        Some(caps) => VcsLocation {
            url: caps["url"].to_string(),
            branch: caps.name("branch").map(|m| m.as_str().to_string()),
            subpath: caps.name("subpath").map(|m| m.as_str().to_string()),
        },
        None => VcsLocation {
            url: location.trim().to_string(),
            branch: None,
            subpath: None,
        },
    }
}

/// Read the upstream repository location (and browse URL) from
/// debian/upstream/metadata. Returns None when the file or field is absent.
pub fn upstream_repository(
    root: &Path,
    subpath: &str,
) -> Result<Option<(String, Option<String>)>, MergeError> {
    let path = base_dir(root, subpath)
        .join("debian")
        .join("upstream")
        .join("metadata");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(MergeError::UpstreamMetadataSyntax {
                path,
                message: e.to_string(),
            })
        }
    };

    let mut repository = None;
    let mut browse = None;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') || line.starts_with("---") {
            continue;
        }
        if line.starts_with(char::is_whitespace) || line.starts_with('-') {
            // Continuation or list item of a field we do not consume.
            continue;
        }
        let (key, value) = match line.split_once(':') {
            Some(parts) => parts,
            None => {
                return Err(MergeError::UpstreamMetadataSyntax {
                    path,
                    message: format!("expected 'Key: value', got: {}", line),
                })
            }
        };
        match key.trim() {
            "Repository" => repository = Some(unquote(value.trim()).to_string()),
            "Repository-Browse" => browse = Some(unquote(value.trim()).to_string()),
            _ => {}
        }
    }

    Ok(repository
        .filter(|r| !r.is_empty())
        .map(|r| (r, browse.filter(|b| !b.is_empty()))))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Read debian/source/format, if present.
pub fn source_format(root: &Path, subpath: &str) -> Option<String> {
    let path = base_dir(root, subpath).join("debian").join("source").join("format");
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// True if the tree versions anything besides the packaging directory.
pub fn tree_contains_upstream_source(root: &Path, subpath: &str) -> bool {
    let base = base_dir(root, subpath);
    let entries = match std::fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "debian" || name == ".git" {
            continue;
        }
        return true;
    }
    false
}

/// True when control files live directly in the tree root rather than
/// under debian/ (LarstIQ layout).
pub fn control_files_in_root(root: &Path, subpath: &str) -> bool {
    let base = base_dir(root, subpath);
    if base.join("debian").exists() {
        return false;
    }
    base.join("control").exists() || base.join("changelog").exists()
}

/// Determine the build type, from debian/source/format when present, else
/// guessed from the version shape and tree contents.
pub fn guess_build_type(
    root: &Path,
    subpath: &str,
    version: &Version,
    contains_upstream_source: bool,
) -> Result<BuildType, MergeError> {
    let format = source_format(root, subpath);
    let has_revision = version.debian_revision.is_some();

    if let Some(format) = format {
        if format.contains("(native)") {
            if has_revision {
                return Err(MergeError::InconsistentSourceFormat {
                    message: format!(
                        "native source format but version {} has a debian revision",
                        version
                    ),
                });
            }
            return Ok(BuildType::Native);
        }
        if format.contains("(quilt)") && !has_revision {
            return Err(MergeError::InconsistentSourceFormat {
                message: format!(
                    "non-native source format but version {} has no debian revision",
                    version
                ),
            });
        }
    }

    if !has_revision {
        return Ok(BuildType::Native);
    }
    if !contains_upstream_source {
        return Ok(BuildType::Merge);
    }
    Ok(BuildType::Normal)
}

/// Globs listed in the Files-Excluded field of debian/copyright, if any.
pub fn files_excluded(root: &Path, subpath: &str) -> Result<Option<Vec<String>>, MergeError> {
    let path = base_dir(root, subpath).join("debian").join("copyright");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(MergeError::Tree(crate::error::TreeError::Io(e)))
        }
    };

    let mut globs: Vec<String> = Vec::new();
    let mut in_field = false;
    for line in text.lines() {
        if in_field {
            if line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
                globs.extend(line.split_whitespace().map(|s| s.to_string()));
                continue;
            }
            break;
        }
        if let Some(value) = line.strip_prefix("Files-Excluded:") {
            globs.extend(value.split_whitespace().map(|s| s.to_string()));
            in_field = true;
        }
    }

    if globs.is_empty() {
        Ok(None)
    } else {
        Ok(Some(globs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_split_vcs_url_plain() {
        let loc = split_vcs_url("https://example.com/foo.git");
        assert_eq!(loc.url, "https://example.com/foo.git");
        assert!(loc.branch.is_none());
        assert!(loc.subpath.is_none());
    }

    #[test]
    fn test_split_vcs_url_with_branch_and_subpath() {
        let loc = split_vcs_url("https://example.com/foo.git -b main [lib]");
        assert_eq!(loc.url, "https://example.com/foo.git");
        assert_eq!(loc.branch.as_deref(), Some("main"));
        assert_eq!(loc.subpath.as_deref(), Some("lib"));
    }

    #[test]
    fn test_upstream_repository_absent() {
        let dir = TempDir::new().unwrap();
        assert!(upstream_repository(dir.path(), "").unwrap().is_none());
    }

    #[test]
    fn test_upstream_repository_present() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "debian/upstream/metadata",
            "---\nName: foo\nRepository: https://example.com/foo.git\nRepository-Browse: https://example.com/foo\n",
        );
        let (url, browse) = upstream_repository(dir.path(), "").unwrap().unwrap();
        assert_eq!(url, "https://example.com/foo.git");
        assert_eq!(browse.as_deref(), Some("https://example.com/foo"));
    }

    #[test]
    fn test_upstream_repository_syntax_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "debian/upstream/metadata", "not a mapping line\n");
        let err = upstream_repository(dir.path(), "").unwrap_err();
        assert!(matches!(err, MergeError::UpstreamMetadataSyntax { .. }));
    }

    #[test]
    fn test_guess_build_type_from_format() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "debian/source/format", "3.0 (native)\n");
        let v = Version::from_str("1.0").unwrap();
        assert_eq!(
            guess_build_type(dir.path(), "", &v, true).unwrap(),
            BuildType::Native
        );
    }

    #[test]
    fn test_guess_build_type_inconsistent() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "debian/source/format", "3.0 (native)\n");
        let v = Version::from_str("1.0-1").unwrap();
        assert!(matches!(
            guess_build_type(dir.path(), "", &v, true),
            Err(MergeError::InconsistentSourceFormat { .. })
        ));
    }

    #[test]
    fn test_guess_build_type_native_from_version() {
        let dir = TempDir::new().unwrap();
        let v = Version::from_str("1.0").unwrap();
        assert_eq!(
            guess_build_type(dir.path(), "", &v, true).unwrap(),
            BuildType::Native
        );
    }

    #[test]
    fn test_guess_build_type_merge_without_upstream_source() {
        let dir = TempDir::new().unwrap();
        let v = Version::from_str("1.0-1").unwrap();
        assert_eq!(
            guess_build_type(dir.path(), "", &v, false).unwrap(),
            BuildType::Merge
        );
    }

    #[test]
    fn test_tree_contains_upstream_source() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "debian/changelog", "x");
        assert!(!tree_contains_upstream_source(dir.path(), ""));
        write(dir.path(), "src/main.c", "int main() {}\n");
        assert!(tree_contains_upstream_source(dir.path(), ""));
    }

    #[test]
    fn test_control_files_in_root() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "changelog", "x");
        assert!(control_files_in_root(dir.path(), ""));
        write(dir.path(), "debian/changelog", "x");
        assert!(!control_files_in_root(dir.path(), ""));
    }

    #[test]
    fn test_files_excluded() {
        let dir = TempDir::new().unwrap();
        assert!(files_excluded(dir.path(), "").unwrap().is_none());

        write(
            dir.path(),
            "debian/copyright",
            "Format: https://www.debian.org/doc/packaging-manuals/copyright-format/1.0/\n\
             Files-Excluded: vendor/* minified.js\n  docs/nonfree.pdf\nComment: repacked\n",
        );
        let globs = files_excluded(dir.path(), "").unwrap().unwrap();
        assert_eq!(globs, vec!["vendor/*", "minified.js", "docs/nonfree.pdf"]);
    }
}
