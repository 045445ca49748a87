//! Post-merge packaging maintenance
//!
//! This module provides:
//! - update_packaging: notes about packaging references that the new
//!   upstream version invalidated
//! - refresh_quilt_patches: re-apply and refresh the quilt patch series
//!   through the external quilt tool

use std::process::{Command, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use crate::error::MergeError;
use crate::tree::PackagingTree;

/// Inspect packaging files for references the upstream update broke.
///
/// Returns human-readable notes; an empty list means nothing was noticed.
pub fn update_packaging(tree: &PackagingTree, subpath: &str) -> Vec<String> {
    let base = tree.abspath(subpath);
    let debian = base.join("debian");
    let mut notes = Vec::new();

    let entries = match std::fs::read_dir(&debian) {
        Ok(entries) => entries,
        Err(_) => return notes,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".install") && name != "install" {
            continue;
        }
        let content = match std::fs::read_to_string(entry.path()) {
            Ok(content) => content,
            Err(_) => continue,
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let source = line.split_whitespace().next().unwrap_or("");
            if source.contains('*') || source.starts_with("debian/") {
                continue;
            }
            if !base.join(source).exists() {
                notes.push(format!(
                    "debian/{} references {} which no longer exists upstream",
                    name, source
                ));
            }
        }
    }
    notes
}

fn quilt(tree: &PackagingTree, subpath: &str, args: &[&str]) -> Result<(bool, String), MergeError> {
    let cwd = tree.abspath(subpath);
    let output = Command::new("quilt")
        .args(args)
        .current_dir(&cwd)
        .env("QUILT_PATCHES", "debian/patches")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| MergeError::QuiltRefreshFailed {
            message: format!("failed to run quilt: {}", e),
        })?;
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.success(), text))
}

fn failing_patch(output: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Applying patch (\S+)").unwrap());
    re.captures_iter(output)
        .last()
        .map(|caps| caps[1].to_string())
}

/// Refresh the quilt patch series against the merged upstream source.
///
/// Pushes each patch in turn, refreshing as it goes, then pops the whole
/// series again and commits the result.
pub fn refresh_quilt_patches(
    tree: &PackagingTree,
    subpath: &str,
    committer: Option<&str>,
) -> Result<(), MergeError> {
    info!("Refreshing quilt patches.");
    loop {
        let (ok, output) = quilt(tree, subpath, &["push"])?;
        if !ok {
            // Exit status 2 with no applicable patch means the series is done.
            if output.contains("File series fully applied")
                || output.contains("No series file found")
                || output.contains("No patches in series")
            {
                break;
            }
            if output.contains("does not apply") || output.contains("can't be applied") {
                return Err(MergeError::QuiltPatchDoesNotApply {
                    patch: failing_patch(&output).unwrap_or_else(|| "unknown".to_string()),
                });
            }
            return Err(MergeError::QuiltRefreshFailed {
                message: output.lines().last().unwrap_or("quilt push failed").to_string(),
            });
        }
        let (ok, output) = quilt(tree, subpath, &["refresh"])?;
        if !ok {
            return Err(MergeError::QuiltRefreshFailed {
                message: output.lines().last().unwrap_or("quilt refresh failed").to_string(),
            });
        }
    }
    let _ = quilt(tree, subpath, &["pop", "-a"]);
    let pc = tree.abspath(subpath).join(".pc");
    if pc.exists() {
        let _ = std::fs::remove_dir_all(pc);
    }
    tree.commit("Refresh patches.", committer)?;
    Ok(())
}

/// Whether the packaging carries a quilt patch series.
pub fn has_patch_series(tree: &PackagingTree, subpath: &str) -> bool {
    tree.abspath(subpath)
        .join("debian")
        .join("patches")
        .join("series")
        .exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, PackagingTree) {
        let dir = TempDir::new().unwrap();
        let status = Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["init", "-q"])
            .status()
            .unwrap();
        assert!(status.success());
        let (tree, _) = PackagingTree::open_containing(dir.path()).unwrap();
        (dir, tree)
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_update_packaging_no_debian_dir() {
        let (_dir, tree) = init_repo();
        assert!(update_packaging(&tree, "").is_empty());
    }

    #[test]
    fn test_update_packaging_notes_missing_paths() {
        let (dir, tree) = init_repo();
        write(dir.path(), "debian/foo.install", "bin/tool usr/bin\nshare/* usr/share\n");
        write(dir.path(), "present", "x");
        let notes = update_packaging(&tree, "");
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("bin/tool"));
    }

    #[test]
    fn test_update_packaging_existing_paths_quiet() {
        let (dir, tree) = init_repo();
        write(dir.path(), "debian/foo.install", "bin/tool usr/bin\n");
        write(dir.path(), "bin/tool", "#!/bin/sh\n");
        assert!(update_packaging(&tree, "").is_empty());
    }

    #[test]
    fn test_has_patch_series() {
        let (dir, tree) = init_repo();
        assert!(!has_patch_series(&tree, ""));
        write(dir.path(), "debian/patches/series", "fix.patch\n");
        assert!(has_patch_series(&tree, ""));
    }

    #[test]
    fn test_failing_patch() {
        let output = "Applying patch fix-build.patch\npatching file Makefile\nApplying patch other.patch\nerror";
        assert_eq!(failing_patch(output).as_deref(), Some("other.patch"));
        assert!(failing_patch("nothing here").is_none());
    }
}
