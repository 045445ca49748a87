//! Packaging tree adapter over the git command line
//!
//! This module provides the tree/branch operations the merge driver
//! consumes: opening the containing repository, a scoped exclusive write
//! lock, ancestry queries, merging with conflict enumeration, committing,
//! exporting, and importing upstream tarballs as synthetic commits tagged
//! `upstream/<version>` (which doubles as the previously-imported-revision
//! lookup). Tarball extraction is delegated to the external tar tool; no
//! compression is performed in-process.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use regex::Regex;
use tempfile::TempDir;

use crate::error::{Conflict, TreeError};

/// Opaque revision identifier (git object id)
pub type RevisionId = String;

/// A revision created by importing one upstream component
#[derive(Debug, Clone)]
pub struct ImportedRevision {
    /// Component name; None for the main tarball
    pub component: Option<String>,
    /// Tag under which the import is recorded
    pub tag: String,
    /// The import commit
    pub revid: RevisionId,
}

/// Outcome of merging a revision into the working tree
#[derive(Debug)]
pub enum TreeMergeOutcome {
    /// Merge applied without conflicts; changes left uncommitted
    Clean,
    /// Merge applied but left conflicts in the working tree
    Conflicted(Vec<Conflict>),
    /// The revision is already contained in the current history
    AlreadyMerged,
}

/// Tag name under which an upstream version import is recorded.
///
/// Characters git refuses in refnames are mapped the way gbp does.
pub fn upstream_tag_name(version: &str) -> String {
    format!("upstream/{}", version.replace('~', "_").replace(':', "%"))
}

/// Exclusive write lock on a packaging tree; released on drop.
#[derive(Debug)]
pub struct TreeLock {
    path: PathBuf,
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A git-backed packaging working tree
#[derive(Debug, Clone)]
pub struct PackagingTree {
    root: PathBuf,
}

impl PackagingTree {
    /// Open the repository containing `start`, returning the tree and the
    /// subpath of `start` within it.
    pub fn open_containing(start: &Path) -> Result<(Self, String), TreeError> {
        let start = start
            .canonicalize()
            .map_err(|_| TreeError::NotARepository {
                path: start.to_path_buf(),
            })?;
        let mut dir = start.clone();
        loop {
            if dir.join(".git").exists() {
                let subpath = start
                    .strip_prefix(&dir)
                    .unwrap_or(Path::new(""))
                    .to_string_lossy()
                    .to_string();
                return Ok((Self { root: dir }, subpath));
            }
            if !dir.pop() {
                return Err(TreeError::NotARepository { path: start });
            }
        }
    }

    /// Root of the working tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abspath(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    fn run(&self, args: &[&str]) -> Result<Output, TreeError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(TreeError::Io)?;
        Ok(output)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output, TreeError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(TreeError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn stdout_line(&self, args: &[&str]) -> Result<String, TreeError> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Take the exclusive write lock for this tree.
    ///
    /// A second concurrent invocation fails fast with LockContention
    /// rather than interleaving.
    pub fn lock_write(&self) -> Result<TreeLock, TreeError> {
        let path = self.git_dir().join("upmerge.lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(TreeLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(TreeError::LockContention { path })
            }
            Err(e) => Err(TreeError::Io(e)),
        }
    }

    /// Current branch tip, or None on an unborn branch.
    pub fn last_revision(&self) -> Result<Option<RevisionId>, TreeError> {
        let output = self.run(&["rev-parse", "-q", "--verify", "HEAD"])?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Whether `ancestor` is an ancestor of `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, TreeError> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(TreeError::Git {
                command: "merge-base --is-ancestor".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    /// Whether the working tree has uncommitted changes.
    pub fn has_pending_changes(&self) -> Result<bool, TreeError> {
        let output = self.run_checked(&["status", "--porcelain"])?;
        Ok(!output.stdout.is_empty())
    }

    /// Abandon an uncommitted merge, restoring the pre-merge state.
    pub fn reset_pending_merge(&self) -> Result<(), TreeError> {
        if self.git_dir().join("MERGE_HEAD").exists() {
            let _ = self.run(&["merge", "--abort"]);
            let _ = std::fs::remove_file(self.git_dir().join("MERGE_HEAD"));
            let _ = std::fs::remove_file(self.git_dir().join("MERGE_MSG"));
        }
        Ok(())
    }

    /// Merge `revid` into the working tree without committing.
    pub fn merge_revision(&self, revid: &str) -> Result<TreeMergeOutcome, TreeError> {
        let output = self.run(&["merge", "--no-commit", "--no-ff", revid])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            if stdout.contains("Already up to date") {
                return Ok(TreeMergeOutcome::AlreadyMerged);
            }
            return Ok(TreeMergeOutcome::Clean);
        }
        let conflicts = self.conflicts()?;
        if conflicts.is_empty() {
            return Err(TreeError::Git {
                command: format!("merge --no-commit --no-ff {}", revid),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(TreeMergeOutcome::Conflicted(conflicts))
    }

    /// Enumerate unresolved conflicts in the working tree.
    pub fn conflicts(&self) -> Result<Vec<Conflict>, TreeError> {
        let output = self.run_checked(&["status", "--porcelain"])?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut conflicts = Vec::new();
        for line in text.lines() {
            if line.len() < 4 {
                continue;
            }
            let status = &line[..2];
            let path = line[3..].to_string();
            let kind = match status {
                "UU" => "text conflict",
                "AA" => "duplicate",
                "DD" | "AU" | "UA" | "DU" | "UD" => "contents conflict",
                _ => continue,
            };
            conflicts.push(Conflict {
                path,
                kind: kind.to_string(),
            });
        }
        Ok(conflicts)
    }

    /// Stage everything and commit; returns the new revision.
    pub fn commit(
        &self,
        message: &str,
        committer: Option<&str>,
    ) -> Result<RevisionId, TreeError> {
        self.run_checked(&["add", "-A"])?;
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.root)
            .args(["commit", "--quiet", "-m", message])
            .stdin(Stdio::null());
        apply_identity(&mut cmd, committer);
        let output = cmd.output().map_err(TreeError::Io)?;
        if !output.status.success() {
            return Err(TreeError::Git {
                command: "commit".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.stdout_line(&["rev-parse", "HEAD"])
    }

    /// Resolve an arbitrary revision specifier, if possible.
    pub fn rev_parse(&self, spec: &str) -> Result<Option<RevisionId>, TreeError> {
        let spec = format!("{}^{{commit}}", spec);
        let output = self.run(&["rev-parse", "-q", "--verify", &spec])?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Committer date of a revision as YYYYMMDD.
    pub fn commit_datestamp(&self, revid: &str) -> Result<String, TreeError> {
        self.stdout_line(&["log", "-1", "--format=%cd", "--date=format:%Y%m%d", revid])
    }

    /// Abbreviated form of a revision id.
    pub fn short_revid(&self, revid: &str) -> Result<String, TreeError> {
        self.stdout_line(&["rev-parse", "--short", revid])
    }

    /// Resolve a tag to a commit, if present.
    pub fn lookup_tag(&self, tag: &str) -> Result<Option<RevisionId>, TreeError> {
        let spec = format!("refs/tags/{}^{{commit}}", tag);
        let output = self.run(&["rev-parse", "-q", "--verify", &spec])?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Create a tag pointing at `revid`.
    pub fn tag(&self, name: &str, revid: &str) -> Result<(), TreeError> {
        self.run_checked(&["tag", name, revid])?;
        Ok(())
    }

    /// List refs of a remote location without fetching objects.
    pub fn ls_remote(&self, url: &str) -> Result<Vec<(RevisionId, String)>, TreeError> {
        let output = self.run(&["ls-remote", url])?;
        if !output.status.success() {
            return Err(TreeError::BranchOpen {
                url: url.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(sha), Some(name)) => Some((sha.to_string(), name.to_string())),
                    _ => None,
                }
            })
            .collect())
    }

    /// Fetch a single ref from a remote location into this repository and
    /// return the fetched revision.
    pub fn fetch_ref(&self, url: &str, refname: &str) -> Result<RevisionId, TreeError> {
        let output = self.run(&["fetch", "--no-tags", url, refname])?;
        if !output.status.success() {
            return Err(TreeError::BranchOpen {
                url: url.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.stdout_line(&["rev-parse", "FETCH_HEAD^{commit}"])
    }

    /// Export the content of `revid` into `dest` (which must exist).
    pub fn export_to_dir(&self, revid: &str, dest: &Path) -> Result<(), TreeError> {
        let tmp = TempDir::new().map_err(TreeError::Io)?;
        let archive = tmp.path().join("export.tar");
        let archive_arg = archive.to_string_lossy().to_string();
        self.run_checked(&["archive", "--format=tar", "-o", &archive_arg, revid])?;
        run_tar(&["-xf", &archive_arg, "-C", &dest.to_string_lossy()])?;
        Ok(())
    }

    /// Export `revid` as a gzipped tarball at `dest` with the given prefix.
    pub fn export_tarball(
        &self,
        revid: &str,
        prefix: &str,
        dest: &Path,
    ) -> Result<(), TreeError> {
        let prefix_arg = format!("--prefix={}/", prefix);
        let dest_arg = dest.to_string_lossy().to_string();
        self.run_checked(&[
            "archive",
            "--format=tar.gz",
            &prefix_arg,
            "-o",
            &dest_arg,
            revid,
        ])?;
        Ok(())
    }

    /// Import a tarball as a synthetic commit with the given parents and
    /// record it under the upstream tag for `version`.
    pub fn import_tarball(
        &self,
        tarball: &Path,
        component: Option<&str>,
        version: &str,
        parents: &[RevisionId],
        files_excluded: Option<&[String]>,
        committer: Option<&str>,
    ) -> Result<ImportedRevision, TreeError> {
        let tmp = TempDir::new().map_err(TreeError::Io)?;
        let unpack = tmp.path().join("src");
        std::fs::create_dir(&unpack).map_err(TreeError::Io)?;
        run_tar(&[
            "-xf",
            &tarball.to_string_lossy(),
            "-C",
            &unpack.to_string_lossy(),
        ])?;
        let content_root = single_subdirectory(&unpack).unwrap_or(unpack);

        if let Some(globs) = files_excluded {
            remove_excluded(&content_root, globs)?;
        }

        let index = tmp.path().join("index");
        let git_dir = self.git_dir();
        let plumbing = |args: &[&str], cwd: &Path| -> Result<Output, TreeError> {
            let output = Command::new("git")
                .arg("--git-dir")
                .arg(&git_dir)
                .arg("--work-tree")
                .arg(&content_root)
                .args(args)
                .current_dir(cwd)
                .env("GIT_INDEX_FILE", &index)
                .stdin(Stdio::null())
                .output()
                .map_err(TreeError::Io)?;
            if !output.status.success() {
                return Err(TreeError::Git {
                    command: args.join(" "),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(output)
        };

        plumbing(&["add", "-A", "."], &content_root)?;
        let tree_output = plumbing(&["write-tree"], &content_root)?;
        let tree_id = String::from_utf8_lossy(&tree_output.stdout).trim().to_string();

        let message = format!("Import upstream version {}", version);
        let mut cmd = Command::new("git");
        cmd.arg("--git-dir").arg(&git_dir).arg("commit-tree").arg(&tree_id);
        for parent in parents {
            cmd.args(["-p", parent]);
        }
        cmd.args(["-m", &message]).stdin(Stdio::null());
        apply_identity(&mut cmd, committer);
        let output = cmd.output().map_err(TreeError::Io)?;
        if !output.status.success() {
            return Err(TreeError::Git {
                command: "commit-tree".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let revid = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let tag = match component {
            Some(component) => format!("{}-{}", upstream_tag_name(version), component),
            None => upstream_tag_name(version),
        };
        self.tag(&tag, &revid)?;

        Ok(ImportedRevision {
            component: component.map(|c| c.to_string()),
            tag,
            revid,
        })
    }

    /// Committer identity configured for this repository, if any.
    pub fn committer_identity(&self) -> Result<Option<String>, TreeError> {
        let output = self.run(&["var", "GIT_COMMITTER_IDENT"])?;
        if !output.status.success() {
            return Ok(None);
        }
        let ident = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ident
            .rfind('>')
            .map(|end| ident[..=end].trim().to_string()))
    }

    /// Revision under which `version` was previously imported, if any.
    pub fn lookup_imported_revision(
        &self,
        version: &str,
    ) -> Result<Option<ImportedRevision>, TreeError> {
        let tag = upstream_tag_name(version);
        Ok(self.lookup_tag(&tag)?.map(|revid| ImportedRevision {
            component: None,
            tag,
            revid,
        }))
    }
}

fn run_tar(args: &[&str]) -> Result<(), TreeError> {
    let output = Command::new("tar")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(TreeError::Io)?;
    if !output.status.success() {
        return Err(TreeError::Git {
            command: format!("tar {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn apply_identity(cmd: &mut Command, committer: Option<&str>) {
    if let Some((name, email)) = committer.and_then(split_identity) {
        cmd.env("GIT_AUTHOR_NAME", &name)
            .env("GIT_AUTHOR_EMAIL", &email)
            .env("GIT_COMMITTER_NAME", &name)
            .env("GIT_COMMITTER_EMAIL", &email);
    }
}

fn split_identity(identity: &str) -> Option<(String, String)> {
    let re = Regex::new(r"^(.*?)\s*<([^>]+)>$").unwrap();
    let caps = re.captures(identity.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// If `dir` contains exactly one entry and it is a directory, return it.
fn single_subdirectory(dir: &Path) -> Option<PathBuf> {
    let mut entries = std::fs::read_dir(dir).ok()?.flatten();
    let first = entries.next()?;
    if entries.next().is_some() {
        return None;
    }
    let path = first.path();
    if path.is_dir() {
        Some(path)
    } else {
        None
    }
}

/// Delete files matching any of the DFSG exclusion globs.
fn remove_excluded(root: &Path, globs: &[String]) -> Result<(), TreeError> {
    let patterns: Vec<Regex> = globs.iter().filter_map(|g| glob_to_regex(g).ok()).collect();
    let mut stack = vec![root.to_path_buf()];
    let mut matched: Vec<PathBuf> = Vec::new();
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).map_err(TreeError::Io)?.flatten() {
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            if patterns.iter().any(|p| p.is_match(&rel)) {
                matched.push(path);
            } else if path.is_dir() {
                stack.push(path);
            }
        }
    }
    for path in matched {
        if path.is_dir() {
            std::fs::remove_dir_all(&path).map_err(TreeError::Io)?;
        } else {
            std::fs::remove_file(&path).map_err(TreeError::Io)?;
        }
    }
    Ok(())
}

fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            '?' => pattern.push_str("[^/]"),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> (TempDir, PackagingTree) {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .arg("-C")
                .arg(dir.path())
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.name", "Test"]);
        run(&["config", "user.email", "test@example.com"]);
        let (tree, _) = PackagingTree::open_containing(dir.path()).unwrap();
        (dir, tree)
    }

    #[test]
    fn test_open_containing_subpath() {
        let (dir, _) = init_repo();
        let sub = dir.path().join("a").join("b");
        std::fs::create_dir_all(&sub).unwrap();
        let (tree, subpath) = PackagingTree::open_containing(&sub).unwrap();
        assert_eq!(tree.root(), dir.path().canonicalize().unwrap());
        assert_eq!(subpath, format!("a{}b", std::path::MAIN_SEPARATOR));
    }

    #[test]
    fn test_open_containing_not_a_repo() {
        let dir = TempDir::new().unwrap();
        let err = PackagingTree::open_containing(dir.path()).unwrap_err();
        assert!(matches!(err, TreeError::NotARepository { .. }));
    }

    #[test]
    fn test_lock_contention() {
        let (_dir, tree) = init_repo();
        let lock = tree.lock_write().unwrap();
        let err = tree.lock_write().unwrap_err();
        assert!(matches!(err, TreeError::LockContention { .. }));
        drop(lock);
        assert!(tree.lock_write().is_ok());
    }

    #[test]
    fn test_commit_and_last_revision() {
        let (dir, tree) = init_repo();
        assert!(tree.last_revision().unwrap().is_none());
        std::fs::write(dir.path().join("file"), "content").unwrap();
        let revid = tree
            .commit("initial", Some("Jane <jane@example.com>"))
            .unwrap();
        assert_eq!(tree.last_revision().unwrap(), Some(revid));
        assert!(!tree.has_pending_changes().unwrap());
    }

    #[test]
    fn test_upstream_tag_name() {
        assert_eq!(upstream_tag_name("1.0"), "upstream/1.0");
        assert_eq!(upstream_tag_name("1.0~rc1"), "upstream/1.0_rc1");
    }

    #[test]
    fn test_split_identity() {
        assert_eq!(
            split_identity("Jane Doe <jane@example.com>"),
            Some(("Jane Doe".to_string(), "jane@example.com".to_string()))
        );
        assert!(split_identity("no email").is_none());
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("vendor/*").unwrap();
        assert!(re.is_match("vendor/x.js"));
        assert!(!re.is_match("vendor/sub/x.js"));
        let re = glob_to_regex("docs/**").unwrap();
        assert!(re.is_match("docs/a/b/c"));
        let re = glob_to_regex("*.min.js").unwrap();
        assert!(re.is_match("jquery.min.js"));
        assert!(!re.is_match("lib/jquery.min.js"));
    }

    #[test]
    fn test_import_tarball_and_merge() {
        let (dir, tree) = init_repo();

        // Seed the packaging branch with upstream 1.0 content plus debian/.
        std::fs::write(dir.path().join("README"), "version 1.0\n").unwrap();
        let base = tree.commit("Import upstream version 1.0", None).unwrap();
        tree.tag(&upstream_tag_name("1.0"), &base).unwrap();
        std::fs::create_dir_all(dir.path().join("debian")).unwrap();
        std::fs::write(dir.path().join("debian").join("rules"), "#!/usr/bin/make -f\n")
            .unwrap();
        tree.commit("packaging", None).unwrap();

        // Build a 1.1 tarball.
        let work = TempDir::new().unwrap();
        let src = work.path().join("pkg-1.1");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("README"), "version 1.1\n").unwrap();
        let tarball = work.path().join("pkg_1.1.orig.tar.gz");
        let tarball_arg = tarball.to_string_lossy().to_string();
        let dir_arg = work.path().to_string_lossy().to_string();
        let status = Command::new("tar")
            .args(["-czf", tarball_arg.as_str(), "-C", dir_arg.as_str(), "pkg-1.1"])
            .status()
            .unwrap();
        assert!(status.success());

        let imported = tree
            .import_tarball(&tarball, None, "1.1", &[base], None, None)
            .unwrap();
        assert_eq!(imported.tag, "upstream/1.1");
        assert!(tree
            .lookup_imported_revision("1.1")
            .unwrap()
            .is_some());

        match tree.merge_revision(&imported.revid).unwrap() {
            TreeMergeOutcome::Clean => {}
            other => panic!("expected clean merge, got {:?}", other),
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README")).unwrap(),
            "version 1.1\n"
        );
        assert!(tree.has_pending_changes().unwrap());
        tree.commit("Merge new upstream release 1.1", None).unwrap();
        assert!(!tree.has_pending_changes().unwrap());
    }

    #[test]
    fn test_merge_already_merged() {
        let (dir, tree) = init_repo();
        std::fs::write(dir.path().join("file"), "x").unwrap();
        let revid = tree.commit("initial", None).unwrap();
        match tree.merge_revision(&revid).unwrap() {
            TreeMergeOutcome::AlreadyMerged => {}
            other => panic!("expected already merged, got {:?}", other),
        }
    }
}
