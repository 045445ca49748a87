//! Upstream source backed by the watch-file scanner
//!
//! The scanner itself is the external uscan tool, driven in DEHS mode so
//! its results and error conditions can be consumed reliably. This module
//! only locates the watch specification, invokes the scanner, extracts the
//! fields it needs, and classifies scanner failures (absent watch file,
//! syntax errors, signature verification, no matching hrefs).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::SourceError;
use crate::repack::{repack, tarball_format};
use crate::source::UpstreamFetcher;
use crate::version::{debianize_upstream_version, upstream_tarball_name};

/// A watch-file scan of the packaging tree
#[derive(Clone, Debug)]
pub struct WatchSource {
    package_dir: PathBuf,
    skip_signatures: bool,
}

/// Fields extracted from DEHS scanner output
#[derive(Debug, Default)]
struct Dehs {
    status: Option<String>,
    upstream_version: Option<String>,
    target_paths: Vec<String>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

fn tag_re(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{0}>(.*?)</{0}>", tag)).unwrap()
}

fn parse_dehs(output: &str) -> Dehs {
    static STATUS: OnceLock<Regex> = OnceLock::new();
    static VERSION: OnceLock<Regex> = OnceLock::new();
    static TARGET: OnceLock<Regex> = OnceLock::new();
    static ERRORS: OnceLock<Regex> = OnceLock::new();
    static WARNINGS: OnceLock<Regex> = OnceLock::new();

    let mut dehs = Dehs::default();
    if let Some(caps) = STATUS.get_or_init(|| tag_re("status")).captures(output) {
        dehs.status = Some(caps[1].trim().to_string());
    }
    if let Some(caps) = VERSION
        .get_or_init(|| tag_re("upstream-version"))
        .captures(output)
    {
        dehs.upstream_version = Some(caps[1].trim().to_string());
    }
    for caps in TARGET
        .get_or_init(|| tag_re("target-path"))
        .captures_iter(output)
    {
        dehs.target_paths.push(caps[1].trim().to_string());
    }
    for caps in ERRORS
        .get_or_init(|| tag_re("errors"))
        .captures_iter(output)
    {
        dehs.errors.push(caps[1].trim().to_string());
    }
    for caps in WARNINGS
        .get_or_init(|| tag_re("warnings"))
        .captures_iter(output)
    {
        dehs.warnings.push(caps[1].trim().to_string());
    }
    dehs
}

/// Map scanner diagnostics to the error taxonomy, if they indicate failure.
fn classify_failure(dehs: &Dehs, stderr: &str) -> Option<SourceError> {
    let mut text = dehs.errors.join("\n");
    if !dehs.warnings.is_empty() {
        text.push('\n');
        text.push_str(&dehs.warnings.join("\n"));
    }
    text.push('\n');
    text.push_str(stderr);

    if text.contains("signature") && (text.contains("did not verify") || text.contains("verification failed"))
        || text.contains("OpenPGP signature did not verify")
    {
        return Some(SourceError::SignatureVerification {
            message: first_line(&text),
        });
    }
    if text.contains("syntax error") || text.contains("malformed watch") {
        return Some(SourceError::WatchSyntax {
            message: first_line(&text),
        });
    }
    if text.contains("no matching files for watch line")
        || text.contains("no matching hrefs")
    {
        return Some(SourceError::WatchLineWithoutMatches {
            line: first_line(&text),
        });
    }
    if !dehs.errors.is_empty() {
        return Some(SourceError::UScan {
            message: dehs.errors.join("; "),
        });
    }
    None
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

impl WatchSource {
    /// Create a watch source for the tree, failing with NoWatchFile when
    /// no watch specification exists.
    pub fn from_tree(
        root: &Path,
        subpath: &str,
        top_level: bool,
        skip_signatures: bool,
    ) -> Result<Self, SourceError> {
        let package_dir = if subpath.is_empty() {
            root.to_path_buf()
        } else {
            root.join(subpath)
        };
        let watch_path = if top_level {
            package_dir.join("watch")
        } else {
            package_dir.join("debian").join("watch")
        };
        if !watch_path.exists() {
            return Err(SourceError::NoWatchFile);
        }
        Ok(Self {
            package_dir,
            skip_signatures,
        })
    }

    fn run_uscan(&self, extra: &[&str]) -> Result<(Dehs, String), SourceError> {
        let mut cmd = Command::new("uscan");
        cmd.current_dir(&self.package_dir)
            .arg("--dehs")
            .args(extra)
            .stdin(Stdio::null());
        if self.skip_signatures {
            cmd.arg("--skip-signature");
        }
        let output = cmd.output().map_err(|e| SourceError::UScan {
            message: format!("failed to run uscan: {}", e),
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok((parse_dehs(&stdout), stderr))
    }
}

#[async_trait]
impl UpstreamFetcher for WatchSource {
    fn describe(&self) -> String {
        "watch file scan".to_string()
    }

    async fn get_latest_version(
        &self,
        package: &str,
        _floor_version: Option<&str>,
    ) -> Result<(String, String), SourceError> {
        let (dehs, stderr) = self.run_uscan(&["--report"])?;
        if let Some(status) = &dehs.status {
            tracing::debug!("uscan status: {}", status);
        }
        if let Some(err) = classify_failure(&dehs, &stderr) {
            return Err(err);
        }
        match dehs.upstream_version {
            Some(raw) if !raw.is_empty() => {
                let normalized = debianize_upstream_version(&raw);
                Ok((raw, normalized))
            }
            _ => Err(SourceError::NotFound {
                package: package.to_string(),
                source_name: self.describe(),
            }),
        }
    }

    async fn fetch_tarballs(
        &self,
        package: &str,
        version: &str,
        target_dir: &Path,
        _components: &[Option<String>],
    ) -> Result<Vec<PathBuf>, SourceError> {
        let destdir = target_dir.to_string_lossy().to_string();
        let (dehs, stderr) = self.run_uscan(&[
            "--download",
            "--download-version",
            version,
            "--rename",
            "--destdir",
            &destdir,
        ])?;
        if let Some(err) = classify_failure(&dehs, &stderr) {
            return Err(err);
        }

        let mut downloaded: Vec<PathBuf> = dehs
            .target_paths
            .iter()
            .map(|p| {
                let path = PathBuf::from(p);
                if path.is_absolute() {
                    path
                } else {
                    self.package_dir.join(path)
                }
            })
            .filter(|p| p.exists())
            .collect();
        if downloaded.is_empty() {
            // Fall back to scanning the destination directory.
            if let Ok(entries) = std::fs::read_dir(target_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.contains(version) && tarball_format(&path).is_some() {
                        downloaded.push(path);
                    }
                }
            }
        }
        downloaded.retain(|p| tarball_format(p).is_some());

        if downloaded.is_empty() {
            return Err(SourceError::VersionNotPresent {
                package: package.to_string(),
                version: version.to_string(),
                source_name: self.describe(),
            });
        }

        static COMPONENT: OnceLock<Regex> = OnceLock::new();
        let component_re = COMPONENT
            .get_or_init(|| Regex::new(r"\.orig-([A-Za-z0-9_]+)\.tar").unwrap());

        let mut results = Vec::new();
        for path in downloaded {
            let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
            let component = component_re
                .captures(&name)
                .map(|caps| caps[1].to_string());
            let format = tarball_format(&path);
            let desired =
                upstream_tarball_name(package, version, component.as_deref(), format);
            results.push(repack(&path, &desired, target_dir)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEHS_NEWER: &str = "\
<dehs>
<package>foo</package>
<debian-uversion>1.0</debian-uversion>
<upstream-version>1.1</upstream-version>
<upstream-url>https://example.com/foo-1.1.tar.gz</upstream-url>
<status>newer package available</status>
</dehs>
";

    #[test]
    fn test_parse_dehs() {
        let dehs = parse_dehs(DEHS_NEWER);
        assert_eq!(dehs.upstream_version.as_deref(), Some("1.1"));
        assert_eq!(dehs.status.as_deref(), Some("newer package available"));
        assert!(dehs.errors.is_empty());
    }

    #[test]
    fn test_parse_dehs_errors() {
        let dehs = parse_dehs("<dehs><errors>uscan: no matching hrefs for watch line</errors></dehs>");
        assert_eq!(dehs.errors.len(), 1);
        let err = classify_failure(&dehs, "").unwrap();
        assert!(matches!(err, SourceError::WatchLineWithoutMatches { .. }));
    }

    #[test]
    fn test_classify_signature_failure() {
        let dehs = parse_dehs(
            "<dehs><errors>OpenPGP signature did not verify.</errors></dehs>",
        );
        let err = classify_failure(&dehs, "").unwrap();
        assert!(matches!(err, SourceError::SignatureVerification { .. }));
    }

    #[test]
    fn test_classify_syntax_error() {
        let dehs = Dehs {
            errors: vec!["uscan: syntax error in debian/watch line 3".to_string()],
            ..Default::default()
        };
        let err = classify_failure(&dehs, "").unwrap();
        assert!(matches!(err, SourceError::WatchSyntax { .. }));
    }

    #[test]
    fn test_classify_generic_error() {
        let dehs = Dehs {
            errors: vec!["something else went wrong".to_string()],
            ..Default::default()
        };
        let err = classify_failure(&dehs, "").unwrap();
        assert!(matches!(err, SourceError::UScan { .. }));
    }

    #[test]
    fn test_classify_clean() {
        let dehs = parse_dehs(DEHS_NEWER);
        assert!(classify_failure(&dehs, "").is_none());
    }

    #[test]
    fn test_from_tree_requires_watch_file() {
        let dir = TempDir::new().unwrap();
        let err = WatchSource::from_tree(dir.path(), "", false, false).unwrap_err();
        assert!(matches!(err, SourceError::NoWatchFile));

        std::fs::create_dir_all(dir.path().join("debian")).unwrap();
        std::fs::write(
            dir.path().join("debian").join("watch"),
            "version=4\nhttps://example.com/ foo-(.*)\\.tar\\.gz\n",
        )
        .unwrap();
        assert!(WatchSource::from_tree(dir.path(), "", false, false).is_ok());
    }

    #[test]
    fn test_from_tree_top_level_watch() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("watch"), "version=4\n").unwrap();
        assert!(WatchSource::from_tree(dir.path(), "", true, false).is_ok());
    }
}
