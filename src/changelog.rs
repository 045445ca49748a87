//! Debian changelog access
//!
//! Only the pieces the merge driver needs: the head entry (package, version,
//! target distributions), a generated-file guard, and appending the entry
//! for a newly merged upstream version. The file is always re-read from disk
//! after a merge; in-memory state is never trusted across a merge boundary.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::Utc;
use debversion::Version;
use regex::Regex;

use crate::error::MergeError;

fn head_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+) \(([^)]+)\) ([^;]+);").unwrap())
}

/// The newest entry of a changelog
#[derive(Debug, Clone)]
pub struct ChangelogEntry {
    /// Source package name
    pub package: String,
    /// Full package version (epoch, upstream, debian revision)
    pub version: Version,
    /// Target distributions of the entry
    pub distributions: String,
}

/// A changelog file with its parsed head entry
#[derive(Debug, Clone)]
pub struct Changelog {
    path: PathBuf,
    text: String,
    head: ChangelogEntry,
}

impl Changelog {
    /// Read and parse the changelog at `path`.
    pub fn read(path: &Path) -> Result<Self, MergeError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MergeError::MissingChangelog {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(MergeError::UnparseableChangelog {
                    message: e.to_string(),
                })
            }
        };
        let head = parse_head(&text)?;
        Ok(Self {
            path: path.to_path_buf(),
            text,
            head,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package(&self) -> &str {
        &self.head.package
    }

    pub fn version(&self) -> &Version {
        &self.head.version
    }

    pub fn distributions(&self) -> &str {
        &self.head.distributions
    }

    /// Upstream portion of the head version.
    pub fn upstream_version(&self) -> &str {
        &self.head.version.upstream_version
    }

    /// Refuse to edit generated changelogs (template sibling or marker).
    pub fn check_not_generated(&self) -> Result<(), MergeError> {
        let template = PathBuf::from(format!("{}.in", self.path.display()));
        if template.exists() {
            return Err(MergeError::ChangelogGeneratedFile {
                path: self.path.clone(),
                template_path: template.display().to_string(),
                template_type: "in".to_string(),
            });
        }
        if let Some(first) = self.text.lines().next() {
            if first.contains("DO NOT EDIT") {
                return Err(MergeError::ChangelogGeneratedFile {
                    path: self.path.clone(),
                    template_path: self.path.display().to_string(),
                    template_type: "marker".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Record `new_version` with the given entry lines.
    ///
    /// An UNRELEASED head block is updated in place; otherwise a new
    /// UNRELEASED block is prepended. The result is written back to disk.
    pub fn add_version(
        &mut self,
        new_version: &str,
        lines: &[String],
        committer: &str,
    ) -> Result<(), MergeError> {
        let parse = |v: &str| {
            Version::from_str(v).map_err(|e| MergeError::UnparseableChangelog {
                message: e.to_string(),
            })
        };
        let version = parse(new_version)?;

        if self.head.distributions == "UNRELEASED" {
            self.update_head_in_place(new_version, lines)?;
        } else {
            self.prepend_block(new_version, lines, committer);
        }
        self.head = ChangelogEntry {
            package: self.head.package.clone(),
            version,
            distributions: "UNRELEASED".to_string(),
        };
        std::fs::write(&self.path, &self.text).map_err(|e| MergeError::UnparseableChangelog {
            message: format!("failed to write changelog: {}", e),
        })
    }

    fn update_head_in_place(
        &mut self,
        new_version: &str,
        lines: &[String],
    ) -> Result<(), MergeError> {
        let first_nl = self.text.find('\n').unwrap_or(self.text.len());
        let first_line = &self.text[..first_nl];
        let new_first = head_re()
            .replace(first_line, |caps: &regex::Captures| {
                format!("{} ({}) {};", &caps[1], new_version, &caps[3])
            })
            .to_string();

        let trailer_at = self.text.find("\n -- ").ok_or_else(|| {
            MergeError::UnparseableChangelog {
                message: "head entry has no trailer line".to_string(),
            }
        })?;
        let mut body = self.text[first_nl..trailer_at].trim_end().to_string();
        for line in lines {
            body.push_str(&format!("\n  * {}", line));
        }
        self.text = format!(
            "{}{}\n\n{}",
            new_first,
            body,
            &self.text[trailer_at + 1..]
        );
        Ok(())
    }

    fn prepend_block(&mut self, new_version: &str, lines: &[String], committer: &str) {
        let mut block = format!(
            "{} ({}) UNRELEASED; urgency=low\n\n",
            self.head.package, new_version
        );
        for line in lines {
            block.push_str(&format!("  * {}\n", line));
        }
        block.push_str(&format!(
            "\n -- {}  {}\n\n",
            committer,
            Utc::now().to_rfc2822()
        ));
        self.text = format!("{}{}", block, self.text);
    }
}

fn parse_head(text: &str) -> Result<ChangelogEntry, MergeError> {
    let first_line = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| MergeError::UnparseableChangelog {
            message: "changelog is empty".to_string(),
        })?;
    let caps = head_re()
        .captures(first_line)
        .ok_or_else(|| MergeError::UnparseableChangelog {
            message: format!("unparseable head line: {}", first_line),
        })?;
    let version =
        Version::from_str(&caps[2]).map_err(|e| MergeError::UnparseableChangelog {
            message: format!("invalid version {}: {}", &caps[2], e),
        })?;
    Ok(ChangelogEntry {
        package: caps[1].to_string(),
        version,
        distributions: caps[3].trim().to_string(),
    })
}

/// Locate the changelog under `subpath`, returning it together with the
/// top-level flag (changelog directly in subpath rather than debian/).
pub fn find_changelog(root: &Path, subpath: &str) -> Result<(Changelog, bool), MergeError> {
    let base = if subpath.is_empty() {
        root.to_path_buf()
    } else {
        root.join(subpath)
    };
    let debian_path = base.join("debian").join("changelog");
    if debian_path.exists() {
        return Ok((Changelog::read(&debian_path)?, false));
    }
    let top_path = base.join("changelog");
    if top_path.exists() && !base.join("debian").exists() {
        return Ok((Changelog::read(&top_path)?, true));
    }
    Err(MergeError::MissingChangelog { path: debian_path })
}
