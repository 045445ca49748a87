//! Error taxonomy using thiserror
//!
//! Error hierarchy:
//! - SourceError: upstream source resolution/fetch failures
//! - TreeError: packaging tree (VCS adapter) failures
//! - MergeError: the top-level taxonomy reported to automated callers
//!
//! Every MergeError variant that represents a classified failure carries a
//! stable result code plus the transient flag, hint, stage and structured
//! details consumed by outcome reporting. Variants without a code propagate
//! to the caller unclassified.

use std::path::PathBuf;

use serde_json::json;
use thiserror::Error;

use crate::version::VersionKind;

/// A single conflict produced by a tree merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Path of the conflicted file, relative to the tree root
    pub path: String,
    /// Conflict kind ("text conflict", "contents conflict", "duplicate")
    pub kind: String,
}

/// Errors raised while resolving or fetching upstream source
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source exposes no discoverable version at all
    #[error("no upstream version found for '{package}' in {source_name}")]
    NotFound { package: String, source_name: String },

    /// This specific version can not be produced by this source
    #[error("version {version} of '{package}' not present in {source_name}")]
    VersionNotPresent {
        package: String,
        version: String,
        source_name: String,
    },

    /// The packaging tree carries no watch specification
    #[error("no watch file present")]
    NoWatchFile,

    /// The scanner matched no download links for the requested version
    #[error("no matching hrefs for upstream version {version}")]
    NoMatchingHrefs { version: String },

    /// A watch line produced no matches at all
    #[error("watch line found no matches: {line}")]
    WatchLineWithoutMatches { line: String },

    /// The watch specification could not be parsed
    #[error("watch file syntax error: {message}")]
    WatchSyntax { message: String },

    /// Upstream signature verification failed
    #[error("upstream signature verification failed: {message}")]
    SignatureVerification { message: String },

    /// uscan failed for a reason we can not classify further
    #[error("uscan failed: {message}")]
    UScan { message: String },

    /// Transport-level failure after retries
    #[error("failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    /// Unexpected HTTP status
    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// The dist command exited unsuccessfully
    #[error("dist command '{command}' failed: {message}")]
    DistCommandFailed { command: String, message: String },

    /// The fetched file is not in a format the repack step can pass through
    #[error("unable to repack {location} to a supported tarball format")]
    UnsupportedRepackFormat { location: String },

    /// A different file already exists where the tarball would be placed
    #[error("target file {path} already exists with different contents")]
    TarballConflict { path: PathBuf },

    /// Filesystem error during fetch
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the packaging tree adapter
#[derive(Error, Debug)]
pub enum TreeError {
    /// No version control repository was found at or above the path
    #[error("not a version controlled tree: {path}")]
    NotARepository { path: PathBuf },

    /// Another invocation holds the tree lock
    #[error("packaging tree is locked by another process: {path}")]
    LockContention { path: PathBuf },

    /// A git invocation failed
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    /// A remote branch could not be opened or enumerated
    #[error("unable to open branch {url}: {message}")]
    BranchOpen { url: String, message: String },

    /// Filesystem error in the adapter
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error taxonomy for upstream merge operations
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("control files live in root rather than debian/ (LarstIQ mode)")]
    ControlFilesInRoot,

    #[error("package {package} is native; unable to merge new upstream")]
    PackageIsNative { package: String, version: String },

    #[error("packaging branch for {package} does not carry upstream sources")]
    UpstreamNotBundled { package: String },

    #[error("inconsistencies in type of package: {message}")]
    InconsistentSourceFormat { message: String },

    #[error("{source_name} reported invalid format version string {version}")]
    InvalidFormatUpstreamVersion { version: String, source_name: String },

    #[error("the upstream branch at {location} was unavailable: {reason}")]
    UpstreamBranchUnavailable { location: String, reason: String },

    #[error("the upstream branch location ({url}) is invalid: {reason}")]
    UpstreamBranchLocationInvalid { url: String, reason: String },

    #[error("upstream branch location unknown")]
    UpstreamBranchUnknown,

    #[error("no watch file is present, but uscan was required")]
    NoWatchFile,

    #[error(
        "no debian/watch file or Repository in debian/upstream/metadata \
         to retrieve new upstream version from"
    )]
    NoUpstreamLocationsKnown { package: String },

    #[error("unable to find new upstream source")]
    NewUpstreamMissing,

    #[error("last upstream version {version} already imported")]
    AlreadyImported {
        version: String,
        version_kind: VersionKind,
    },

    #[error("last upstream version {version} already merged")]
    AlreadyMerged { version: String },

    #[error("new release {version} is available, but does not contain changes")]
    ReleaseWithoutChanges { version: String },

    #[error("a newer upstream release ({old}) has already been imported; found: {new}")]
    NewerVersionAlreadyImported { old: String, new: String },

    #[error("there was a big jump in upstream versions: {old} => {new}")]
    BigVersionJump { old: String, new: String },

    #[error("merging upstream version {version} resulted in conflicts")]
    MergeConflicted {
        version: String,
        conflicts: Vec<Conflict>,
    },

    #[error("upstream version {version} not in upstream branch {branch}")]
    VersionMissingInUpstreamBranch { branch: String, version: String },

    #[error("previous upstream version {version} missing (tag: {tag})")]
    PreviousVersionTagMissing { version: String, tag: String },

    #[error(
        "new upstream version ({package}/{version}) found, but was missing \
         when retrieved as tarball from {source_name}"
    )]
    NewUpstreamTarballMissing {
        package: String,
        version: String,
        source_name: String,
    },

    #[error("missing upstream tarball for {package} {version}")]
    MissingUpstreamTarball { package: String, version: String },

    #[error(
        "the target file {path} already exists and differs from the new \
         upstream tarball"
    )]
    TarballConflict { path: PathBuf },

    #[error(
        "changelog file can't be updated because it is generated \
         (template type: {template_type}, path: {template_path})"
    )]
    ChangelogGeneratedFile {
        path: PathBuf,
        template_path: String,
        template_type: String,
    },

    #[error("missing changelog: {path}")]
    MissingChangelog { path: PathBuf },

    #[error("unable to parse changelog: {message}")]
    UnparseableChangelog { message: String },

    #[error("unable to repack file {location} to supported tarball format")]
    UnsupportedRepackFormat { location: String },

    #[error("uscan failed: {message}")]
    UScanFailed { message: String },

    #[error("upstream signature verification failed: {message}")]
    SignatureVerificationFailed { message: String },

    #[error("uscan did not find matches for line: {line}")]
    WatchLineWithoutMatches { line: String },

    #[error("watch file syntax error: {message}")]
    WatchSyntaxError { message: String },

    #[error("unable to parse {path}: {message}")]
    UpstreamMetadataSyntax { path: PathBuf, message: String },

    #[error("dist command '{command}' failed: {message}")]
    DistCommandFailed { command: String, message: String },

    #[error("quilt patch {patch} no longer applies")]
    QuiltPatchDoesNotApply { patch: String },

    #[error("an error occurred refreshing quilt patches: {message}")]
    QuiltRefreshFailed { message: String },

    #[error("packaging tree is locked by another process: {path}")]
    LockContention { path: PathBuf },

    #[error("no space left on device: {message}")]
    NoSpaceOnDevice { message: String },

    /// Unclassified source failure; propagates to the caller
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Unclassified tree failure; propagates to the caller
    #[error(transparent)]
    Tree(TreeError),
}

impl From<TreeError> for MergeError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::LockContention { path } => MergeError::LockContention { path },
            other => MergeError::Tree(other),
        }
    }
}

impl MergeError {
    /// Stable result code for classified failures; None propagates raw.
    pub fn code(&self) -> Option<&'static str> {
        use MergeError::*;
        Some(match self {
            ControlFilesInRoot => "control-files-in-root",
            PackageIsNative { .. } => "native-package",
            UpstreamNotBundled { .. } => "upstream-not-bundled",
            InconsistentSourceFormat { .. } => "inconsistent-source-format",
            InvalidFormatUpstreamVersion { .. } => "invalid-upstream-version-format",
            UpstreamBranchUnavailable { .. } => "upstream-branch-unavailable",
            UpstreamBranchLocationInvalid { .. } => "upstream-branch-invalid",
            UpstreamBranchUnknown => "upstream-branch-unknown",
            NoWatchFile => "no-watch-file",
            NoUpstreamLocationsKnown { .. } => "no-upstream-locations-known",
            NewUpstreamMissing => "new-upstream-missing",
            AlreadyImported { .. } => "nothing-to-do",
            AlreadyMerged { .. } => "nothing-to-do",
            ReleaseWithoutChanges { .. } => "nothing-to-do",
            NewerVersionAlreadyImported { .. } => "newer-upstream-version-already-imported",
            BigVersionJump { .. } => "big-version-jump",
            MergeConflicted { .. } => "upstream-merged-conflicts",
            VersionMissingInUpstreamBranch { .. } => {
                "upstream-version-missing-in-upstream-branch"
            }
            PreviousVersionTagMissing { .. } => "previous-upstream-missing",
            NewUpstreamTarballMissing { .. } => "new-upstream-tarball-missing",
            MissingUpstreamTarball { .. } => "missing-upstream-tarball",
            TarballConflict { .. } => "tarball-conflict",
            ChangelogGeneratedFile { .. } => "changelog-generated-file",
            MissingChangelog { .. } => "missing-changelog",
            UnparseableChangelog { .. } => "unparseable-changelog",
            UnsupportedRepackFormat { .. } => "unsupported-repack-format",
            UScanFailed { .. } => "uscan-error",
            SignatureVerificationFailed { .. } => {
                "upstream-pgp-signature-verification-failed"
            }
            WatchLineWithoutMatches { .. } => "uscan-watch-line-without-matches",
            WatchSyntaxError { .. } => "watch-syntax-error",
            UpstreamMetadataSyntax { .. } => "upstream-metadata-syntax-error",
            DistCommandFailed { .. } => "dist-command-failed",
            QuiltPatchDoesNotApply { .. } => "quilt-patch-out-of-date",
            QuiltRefreshFailed { .. } => "quilt-refresh-error",
            LockContention { .. } => "lock-contention",
            NoSpaceOnDevice { .. } => "no-space-on-device",
            Source(_) | Tree(_) => return None,
        })
    }

    /// Whether retrying later might succeed; None when unknown.
    pub fn transient(&self) -> Option<bool> {
        use MergeError::*;
        match self {
            ControlFilesInRoot
            | PackageIsNative { .. }
            | UpstreamNotBundled { .. }
            | InconsistentSourceFormat { .. }
            | InvalidFormatUpstreamVersion { .. }
            | UpstreamBranchLocationInvalid { .. }
            | UpstreamBranchUnknown
            | NoWatchFile
            | AlreadyImported { .. }
            | AlreadyMerged { .. }
            | ReleaseWithoutChanges { .. }
            | NewerVersionAlreadyImported { .. }
            | BigVersionJump { .. }
            | MergeConflicted { .. }
            | VersionMissingInUpstreamBranch { .. }
            | PreviousVersionTagMissing { .. }
            | TarballConflict { .. }
            | MissingChangelog { .. }
            | UnparseableChangelog { .. }
            | UnsupportedRepackFormat { .. }
            | WatchLineWithoutMatches { .. }
            | WatchSyntaxError { .. }
            | UpstreamMetadataSyntax { .. }
            | DistCommandFailed { .. }
            | QuiltRefreshFailed { .. } => Some(false),
            LockContention { .. } => Some(true),
            _ => None,
        }
    }

    /// Remediation hint for the operator, where one exists.
    pub fn hint(&self) -> Option<String> {
        match self {
            MergeError::AlreadyImported {
                version_kind: VersionKind::Release,
                ..
            } => Some("Import a snapshot by specifying --snapshot.".to_string()),
            MergeError::UpstreamBranchUnknown => {
                Some("Set 'Repository' field in debian/upstream/metadata?".to_string())
            }
            MergeError::TarballConflict { .. } => Some(
                "Either delete the target file, or use it as the upstream location."
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Pipeline stage the failure belongs to, where meaningful.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            MergeError::DistCommandFailed { .. } => Some("dist"),
            _ => None,
        }
    }

    /// Structured details payload for the machine-readable record.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            MergeError::MergeConflicted { conflicts, .. } => Some(json!({
                "conflicts": conflicts
                    .iter()
                    .map(|c| vec![c.path.clone(), c.kind.clone()])
                    .collect::<Vec<_>>(),
            })),
            _ => None,
        }
    }

    /// The upstream version the failure is about, when known.
    pub fn upstream_version(&self) -> Option<&str> {
        use MergeError::*;
        match self {
            AlreadyImported { version, .. }
            | AlreadyMerged { version }
            | ReleaseWithoutChanges { version }
            | MergeConflicted { version, .. }
            | NewUpstreamTarballMissing { version, .. } => Some(version),
            NewerVersionAlreadyImported { new, .. } | BigVersionJump { new, .. } => Some(new),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_version_jump_code() {
        let err = MergeError::BigVersionJump {
            old: "1.0".to_string(),
            new: "8.0".to_string(),
        };
        assert_eq!(err.code(), Some("big-version-jump"));
        assert_eq!(err.transient(), Some(false));
        assert_eq!(err.upstream_version(), Some("8.0"));
        assert!(err.to_string().contains("1.0 => 8.0"));
    }

    #[test]
    fn test_already_imported_release_hint() {
        let err = MergeError::AlreadyImported {
            version: "1.2".to_string(),
            version_kind: VersionKind::Release,
        };
        assert_eq!(err.code(), Some("nothing-to-do"));
        assert!(err.hint().unwrap().contains("--snapshot"));
    }

    #[test]
    fn test_already_imported_snapshot_no_hint() {
        let err = MergeError::AlreadyImported {
            version: "1.2".to_string(),
            version_kind: VersionKind::Snapshot,
        };
        assert!(err.hint().is_none());
    }

    #[test]
    fn test_merge_conflicted_details() {
        let err = MergeError::MergeConflicted {
            version: "1.1".to_string(),
            conflicts: vec![Conflict {
                path: "debian/changelog".to_string(),
                kind: "text conflict".to_string(),
            }],
        };
        let details = err.details().unwrap();
        assert_eq!(
            details["conflicts"][0][0].as_str().unwrap(),
            "debian/changelog"
        );
        assert_eq!(err.code(), Some("upstream-merged-conflicts"));
    }

    #[test]
    fn test_dist_command_stage() {
        let err = MergeError::DistCommandFailed {
            command: "make dist".to_string(),
            message: "exit status 2".to_string(),
        };
        assert_eq!(err.stage(), Some("dist"));
        assert_eq!(err.code(), Some("dist-command-failed"));
    }

    #[test]
    fn test_lock_contention_is_transient() {
        let err: MergeError = TreeError::LockContention {
            path: PathBuf::from("/tmp/x"),
        }
        .into();
        assert_eq!(err.code(), Some("lock-contention"));
        assert_eq!(err.transient(), Some(true));
    }

    #[test]
    fn test_unclassified_tree_error_propagates() {
        let err: MergeError = TreeError::Git {
            command: "status".to_string(),
            stderr: "boom".to_string(),
        }
        .into();
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::VersionNotPresent {
            package: "pkg".to_string(),
            version: "1.1".to_string(),
            source_name: "watch file scan".to_string(),
        };
        assert!(err.to_string().contains("not present"));
    }
}
