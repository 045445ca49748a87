//! Upstream source backed by an upstream-tracking branch
//!
//! Release versions resolve to history points through tag conventions;
//! snapshot versions are synthesized from the branch tip. Tarballs are
//! produced either by exporting the resolved revision directly or by
//! running a configured dist command inside an exported tree. Fetched
//! objects land in the packaging repository, which also makes them
//! available to the ancestry checks of the finder.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::OnceLock;

use async_trait::async_trait;
use debversion::Version;
use regex::Regex;
use tempfile::TempDir;

use crate::error::{SourceError, TreeError};
use crate::repack::{repack, tarball_format};
use crate::source::UpstreamFetcher;
use crate::tree::{PackagingTree, RevisionId};
use crate::version::{debianize_upstream_version, upstream_tarball_name, VersionKind};

/// How many of the newest release tags to consider when anchoring a
/// snapshot version to its base release.
const SNAPSHOT_BASE_CANDIDATES: usize = 5;

/// An upstream branch, addressed by URL (possibly a local path)
#[derive(Clone, Debug)]
pub struct BranchSource {
    tree: PackagingTree,
    url: String,
    branch: Option<String>,
    subpath: Option<String>,
    browse: Option<String>,
    version_kind: VersionKind,
    dist_command: Option<String>,
}

fn snapshot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+git\d{8}\.([0-9a-f]+)$").unwrap())
}

impl BranchSource {
    /// Open an upstream branch, probing reachability.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        tree: &PackagingTree,
        url: &str,
        branch: Option<String>,
        subpath: Option<String>,
        browse: Option<String>,
        version_kind: VersionKind,
        dist_command: Option<String>,
    ) -> Result<Self, TreeError> {
        tree.ls_remote(url)?;
        Ok(Self {
            tree: tree.clone(),
            url: url.to_string(),
            branch,
            subpath,
            browse,
            version_kind,
            dist_command,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn browse(&self) -> Option<&str> {
        self.browse.as_deref()
    }

    fn tree_err(&self, err: TreeError) -> SourceError {
        SourceError::Network {
            url: self.url.clone(),
            message: err.to_string(),
        }
    }

    /// Remote tags, preferring peeled object ids.
    fn remote_tags(&self) -> Result<BTreeMap<String, RevisionId>, TreeError> {
        let refs = self.tree.ls_remote(&self.url)?;
        let mut tags: BTreeMap<String, RevisionId> = BTreeMap::new();
        for (sha, name) in refs {
            if let Some(tag) = name.strip_prefix("refs/tags/") {
                match tag.strip_suffix("^{}") {
                    Some(base) => {
                        tags.insert(base.to_string(), sha);
                    }
                    None => {
                        tags.entry(tag.to_string()).or_insert(sha);
                    }
                }
            }
        }
        Ok(tags)
    }

    /// Upstream version a release tag denotes, if it denotes one.
    fn tag_version(package: &str, tag: &str) -> Option<(String, Version)> {
        let mut rest = tag;
        for prefix in [
            "upstream/".to_string(),
            format!("{}-", package),
            format!("{}_", package),
            "release-".to_string(),
            "rel-".to_string(),
        ] {
            if let Some(stripped) = rest.strip_prefix(prefix.as_str()) {
                rest = stripped;
                break;
            }
        }
        if (rest.starts_with('v') || rest.starts_with('V'))
            && rest[1..].starts_with(|c: char| c.is_ascii_digit())
        {
            rest = &rest[1..];
        }
        if !rest.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        let normalized = debianize_upstream_version(rest);
        let parsed = Version::from_str(&normalized).ok()?;
        Some((rest.to_string(), parsed))
    }

    /// Tag names that may record `version` upstream.
    fn candidate_tags(package: &str, version: &str) -> Vec<String> {
        let mut names = vec![
            version.to_string(),
            format!("v{}", version),
            format!("upstream/{}", version),
            format!("release-{}", version),
            format!("{}-{}", package, version),
        ];
        if version.contains('~') {
            let mangled = version.replace('~', "_");
            names.push(mangled.clone());
            names.push(format!("v{}", mangled));
            names.push(format!("upstream/{}", mangled));
        }
        names
    }

    /// Resolve an upstream version to a revision in this branch.
    pub fn version_as_revision(
        &self,
        package: &str,
        version: &str,
    ) -> Result<RevisionId, SourceError> {
        let tags = self.remote_tags().map_err(|e| self.tree_err(e))?;
        for candidate in Self::candidate_tags(package, version) {
            if tags.contains_key(&candidate) {
                let refname = format!("refs/tags/{}", candidate);
                return self
                    .tree
                    .fetch_ref(&self.url, &refname)
                    .map_err(|e| self.tree_err(e));
            }
        }

        if let Some(caps) = snapshot_re().captures(version) {
            let short = caps[1].to_string();
            // Make sure the branch objects are present, then resolve.
            let _ = self.fetch_tip();
            if let Some(revid) = self
                .tree
                .rev_parse(&short)
                .map_err(|e| self.tree_err(e))?
            {
                return Ok(revid);
            }
        }

        Err(SourceError::VersionNotPresent {
            package: package.to_string(),
            version: version.to_string(),
            source_name: self.describe(),
        })
    }

    /// Resolve an upstream version to the full per-component revision set.
    pub fn version_as_revisions(
        &self,
        package: &str,
        version: &str,
    ) -> Result<Vec<(Option<String>, RevisionId)>, SourceError> {
        Ok(vec![(None, self.version_as_revision(package, version)?)])
    }

    fn fetch_tip(&self) -> Result<RevisionId, SourceError> {
        let refname = match &self.branch {
            Some(branch) => format!("refs/heads/{}", branch),
            None => "HEAD".to_string(),
        };
        self.tree
            .fetch_ref(&self.url, &refname)
            .map_err(|e| self.tree_err(e))
    }

    fn latest_release(&self, package: &str) -> Result<(String, String), SourceError> {
        let tags = self.remote_tags().map_err(|e| self.tree_err(e))?;
        let best = tags
            .keys()
            .filter_map(|tag| Self::tag_version(package, tag))
            .max_by(|a, b| a.1.cmp(&b.1));
        match best {
            Some((raw, parsed)) => Ok((raw, parsed.to_string())),
            None => Err(SourceError::NotFound {
                package: package.to_string(),
                source_name: self.describe(),
            }),
        }
    }

    fn snapshot_version(
        &self,
        package: &str,
        floor_version: Option<&str>,
    ) -> Result<(String, String), SourceError> {
        let tip = self.fetch_tip()?;

        let tags = self.remote_tags().map_err(|e| self.tree_err(e))?;
        let mut releases: Vec<(String, Version, String)> = tags
            .keys()
            .filter_map(|tag| {
                Self::tag_version(package, tag).map(|(raw, parsed)| (raw, parsed, tag.clone()))
            })
            .collect();
        releases.sort_by(|a, b| b.1.cmp(&a.1));

        let mut base = None;
        for (_, parsed, tag) in releases.into_iter().take(SNAPSHOT_BASE_CANDIDATES) {
            let refname = format!("refs/tags/{}", tag);
            let revid = match self.tree.fetch_ref(&self.url, &refname) {
                Ok(revid) => revid,
                Err(_) => continue,
            };
            if self
                .tree
                .is_ancestor(&revid, &tip)
                .map_err(|e| self.tree_err(e))?
            {
                base = Some(parsed.to_string());
                break;
            }
        }
        let base = base.unwrap_or_else(|| {
            floor_version
                .map(|floor| {
                    let stripped = snapshot_re().replace(floor, "").to_string();
                    crate::version::strip_dfsg_suffix(&stripped).to_string()
                })
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0.0.0".to_string())
        });

        let date = self
            .tree
            .commit_datestamp(&tip)
            .map_err(|e| self.tree_err(e))?;
        let short = self
            .tree
            .short_revid(&tip)
            .map_err(|e| self.tree_err(e))?;
        let version = format!("{}+git{}.{}", base, date, short);
        Ok((version.clone(), version))
    }

    /// Export tarballs for an already-resolved revision set.
    pub fn fetch_tarballs_for_revisions(
        &self,
        package: &str,
        version: &str,
        target_dir: &Path,
        revisions: &[(Option<String>, RevisionId)],
    ) -> Result<Vec<PathBuf>, SourceError> {
        let mut out = Vec::new();
        for (component, revid) in revisions {
            let treeish = match &self.subpath {
                Some(subpath) if !subpath.is_empty() => format!("{}:{}", revid, subpath),
                _ => revid.clone(),
            };
            if component.is_none() && self.dist_command.is_some() {
                out.push(self.run_dist_command(&treeish, package, version, target_dir)?);
                continue;
            }
            let name =
                upstream_tarball_name(package, version, component.as_deref(), Some("gz"));
            let dest = target_dir.join(&name);
            let prefix = format!("{}-{}", package, version);
            self.tree
                .export_tarball(&treeish, &prefix, &dest)
                .map_err(|e| self.tree_err(e))?;
            out.push(dest);
        }
        Ok(out)
    }

    fn run_dist_command(
        &self,
        treeish: &str,
        package: &str,
        version: &str,
        target_dir: &Path,
    ) -> Result<PathBuf, SourceError> {
        let command = self.dist_command.as_deref().unwrap();
        let tmp = TempDir::new()?;
        let export = tmp.path().join(format!("{}-{}", package, version));
        std::fs::create_dir(&export)?;
        self.tree
            .export_to_dir(treeish, &export)
            .map_err(|e| self.tree_err(e))?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&export)
            .env("PACKAGE", package)
            .env("VERSION", version)
            .env("DIST_TARGET", target_dir)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(SourceError::DistCommandFailed {
                command: command.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // The command may write into DIST_TARGET or alongside the export.
        for dir in [target_dir, tmp.path(), &export] {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.contains(version) && tarball_format(&path).is_some() {
                        let format = tarball_format(&path);
                        let desired =
                            upstream_tarball_name(package, version, None, format);
                        return Ok(repack(&path, &desired, target_dir)?);
                    }
                }
            }
        }
        Err(SourceError::DistCommandFailed {
            command: command.to_string(),
            message: "command completed but produced no tarball".to_string(),
        })
    }
}

#[async_trait]
impl UpstreamFetcher for BranchSource {
    fn describe(&self) -> String {
        format!("upstream branch {}", self.url)
    }

    async fn get_latest_version(
        &self,
        package: &str,
        floor_version: Option<&str>,
    ) -> Result<(String, String), SourceError> {
        match self.version_kind {
            VersionKind::Release => self.latest_release(package),
            VersionKind::Snapshot => self.snapshot_version(package, floor_version),
        }
    }

    async fn fetch_tarballs(
        &self,
        package: &str,
        version: &str,
        target_dir: &Path,
        _components: &[Option<String>],
    ) -> Result<Vec<PathBuf>, SourceError> {
        let revid = self.version_as_revision(package, version)?;
        self.fetch_tarballs_for_revisions(package, version, target_dir, &[(None, revid)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed in {:?}", args, dir);
    }

    fn init_upstream_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-q", "-b", "main"]);
        git(dir.path(), &["config", "user.name", "Up Stream"]);
        git(dir.path(), &["config", "user.email", "up@example.com"]);
        std::fs::write(dir.path().join("README"), "hello 1.0\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "release 1.0"]);
        git(dir.path(), &["tag", "v1.0"]);
        std::fs::write(dir.path().join("README"), "hello 1.1\n").unwrap();
        git(dir.path(), &["add", "-A"]);
        git(dir.path(), &["commit", "-q", "-m", "release 1.1"]);
        git(dir.path(), &["tag", "v1.1"]);
        dir
    }

    fn init_packaging_tree() -> (TempDir, PackagingTree) {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-q", "-b", "main"]);
        git(dir.path(), &["config", "user.name", "Pkg"]);
        git(dir.path(), &["config", "user.email", "pkg@example.com"]);
        let (tree, _) = PackagingTree::open_containing(dir.path()).unwrap();
        (dir, tree)
    }

    #[test]
    fn test_tag_version() {
        assert!(BranchSource::tag_version("foo", "v1.2.3").is_some());
        assert!(BranchSource::tag_version("foo", "1.2.3").is_some());
        assert!(BranchSource::tag_version("foo", "upstream/1.2.3").is_some());
        assert!(BranchSource::tag_version("foo", "foo-1.2.3").is_some());
        assert!(BranchSource::tag_version("foo", "nightly").is_none());
        let (raw, parsed) = BranchSource::tag_version("foo", "release-2.0").unwrap();
        assert_eq!(raw, "2.0");
        assert_eq!(parsed.to_string(), "2.0");
    }

    #[test]
    fn test_open_unreachable() {
        let (_dir, tree) = init_packaging_tree();
        let err = BranchSource::open(
            &tree,
            "/nonexistent/repo/path",
            None,
            None,
            None,
            VersionKind::Release,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TreeError::BranchOpen { .. }));
    }

    #[tokio::test]
    async fn test_latest_release_from_tags() {
        let upstream = init_upstream_repo();
        let (_dir, tree) = init_packaging_tree();
        let source = BranchSource::open(
            &tree,
            &upstream.path().to_string_lossy(),
            None,
            None,
            None,
            VersionKind::Release,
            None,
        )
        .unwrap();

        let (raw, normalized) = source.get_latest_version("foo", None).await.unwrap();
        assert_eq!(raw, "1.1");
        assert_eq!(normalized, "1.1");
    }

    #[tokio::test]
    async fn test_version_as_revision_and_export() {
        let upstream = init_upstream_repo();
        let (_dir, tree) = init_packaging_tree();
        let source = BranchSource::open(
            &tree,
            &upstream.path().to_string_lossy(),
            None,
            None,
            None,
            VersionKind::Release,
            None,
        )
        .unwrap();

        let revid = source.version_as_revision("foo", "1.1").unwrap();
        assert!(!revid.is_empty());

        let target = TempDir::new().unwrap();
        let paths = source
            .fetch_tarballs("foo", "1.1", target.path(), &[None])
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("foo_1.1.orig.tar.gz"));
        assert!(paths[0].exists());
    }

    #[tokio::test]
    async fn test_version_not_present() {
        let upstream = init_upstream_repo();
        let (_dir, tree) = init_packaging_tree();
        let source = BranchSource::open(
            &tree,
            &upstream.path().to_string_lossy(),
            None,
            None,
            None,
            VersionKind::Release,
            None,
        )
        .unwrap();

        let err = source.version_as_revision("foo", "9.9").unwrap_err();
        assert!(matches!(err, SourceError::VersionNotPresent { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_version() {
        let upstream = init_upstream_repo();
        let (_dir, tree) = init_packaging_tree();
        let source = BranchSource::open(
            &tree,
            &upstream.path().to_string_lossy(),
            Some("main".to_string()),
            None,
            None,
            VersionKind::Snapshot,
            None,
        )
        .unwrap();

        let (raw, normalized) = source.get_latest_version("foo", Some("1.0")).await.unwrap();
        assert_eq!(raw, normalized);
        assert!(normalized.starts_with("1.1+git"), "got {}", normalized);
    }
}
