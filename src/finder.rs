//! New-upstream finder
//!
//! Orchestrates the upstream source resolvers: picks the primary source,
//! cross-references the upstream-tracking branch, decides the new version
//! number and whether upstream history is carried into the packaging
//! branch, and applies the DFSG suffix policy. Read-only on the packaging
//! tree; all mutation happens in the merge driver.

use std::str::FromStr;

use debversion::Version;
use tracing::{info, warn};

use crate::error::{MergeError, SourceError};
use crate::metadata;
use crate::source::{BranchSource, TarballSource, UpstreamSource, WatchSource};
use crate::tree::{PackagingTree, RevisionId};
use crate::version::{
    add_dfsg_suffix, debianize_upstream_version, is_big_version_jump, matches_release,
    parse_upstream_version, strip_dfsg_suffix, VersionKind,
};

/// Inputs steering upstream resolution
#[derive(Debug, Clone, Default)]
pub struct FinderOptions {
    /// Explicit upstream location (branch or tarball); overrides discovery
    pub location: Option<String>,
    /// Upstream version currently in the changelog
    pub old_upstream_version: Option<String>,
    /// Explicitly requested new upstream version
    pub new_upstream_version: Option<String>,
    pub version_kind: VersionKind,
    /// Tolerate an unreachable upstream branch (release mode only)
    pub allow_ignore_upstream_branch: bool,
    /// Explicit include-upstream-history decision; None = detect
    pub include_upstream_history: Option<bool>,
    pub force_big_version_jump: bool,
    /// Fail rather than fall back when no watch file exists
    pub require_uscan: bool,
    pub skip_signatures: bool,
    /// Control files live directly in the subpath
    pub top_level: bool,
    /// Command for building tarballs from exported source trees
    pub dist_command: Option<String>,
}

/// Outcome of upstream resolution, consumed once by the merge driver
#[derive(Debug)]
pub struct ResolutionResult {
    pub primary_source: UpstreamSource,
    /// Normalized new upstream version, including any DFSG suffix
    pub new_upstream_version: String,
    pub upstream_revisions: Option<Vec<(Option<String>, RevisionId)>>,
    pub upstream_branch_source: Option<BranchSource>,
    pub upstream_branch_url: Option<String>,
    pub upstream_branch_browse: Option<String>,
    pub files_excluded: Option<Vec<String>>,
    pub include_upstream_history: bool,
}

/// Map a resolver failure onto the reporting taxonomy.
pub fn classify_source(err: SourceError) -> MergeError {
    match err {
        SourceError::SignatureVerification { message } => {
            MergeError::SignatureVerificationFailed { message }
        }
        SourceError::WatchSyntax { message } => MergeError::WatchSyntaxError { message },
        SourceError::WatchLineWithoutMatches { line } => {
            MergeError::WatchLineWithoutMatches { line }
        }
        SourceError::UScan { message } => MergeError::UScanFailed { message },
        SourceError::UnsupportedRepackFormat { location } => {
            MergeError::UnsupportedRepackFormat { location }
        }
        SourceError::TarballConflict { path } => MergeError::TarballConflict { path },
        SourceError::DistCommandFailed { command, message } => {
            MergeError::DistCommandFailed { command, message }
        }
        other => MergeError::Source(other),
    }
}

fn detect_include_upstream_history(
    tree: &PackagingTree,
    branch_source: &BranchSource,
    package: &str,
    old_upstream_version: Option<&str>,
) -> bool {
    let old = match old_upstream_version {
        Some(old) => old,
        None => return false,
    };
    let revision = match branch_source.version_as_revision(package, old) {
        Ok(revision) => revision,
        Err(_) => {
            warn!(
                "Old upstream version {} is not present in upstream branch {}. \
                 Unable to determine whether upstream history is normally \
                 included. Assuming no.",
                old,
                branch_source.url()
            );
            return false;
        }
    };
    let tip = match tree.last_revision() {
        Ok(Some(tip)) => tip,
        _ => return false,
    };
    let included = tree.is_ancestor(&revision, &tip).unwrap_or(false);
    if included {
        info!(
            "Including upstream history, since previous upstream version ({}) \
             is present in packaging branch history.",
            old
        );
    } else {
        info!(
            "Not including upstream history, since previous upstream version \
             ({}) is not present in packaging branch history.",
            old
        );
    }
    included
}

/// Resolve which upstream source to use and what version to merge.
pub async fn find_new_upstream(
    tree: &PackagingTree,
    subpath: &str,
    package: &str,
    opts: &FinderOptions,
) -> Result<ResolutionResult, MergeError> {
    // Upstream-tracking branch, from packaging metadata.
    let mut upstream_branch_source: Option<BranchSource> = None;
    let mut upstream_branch_url = None;
    let mut upstream_branch_browse = None;
    if let Some((location, browse)) = metadata::upstream_repository(tree.root(), subpath)? {
        let vcs = metadata::split_vcs_url(&location);
        let invalid = vcs.url.contains("://") && url::Url::parse(&vcs.url).is_err();
        let tolerate = opts.version_kind != VersionKind::Snapshot
            && opts.allow_ignore_upstream_branch;
        if invalid {
            if !tolerate {
                return Err(MergeError::UpstreamBranchLocationInvalid {
                    url: vcs.url,
                    reason: "not a valid URL".to_string(),
                });
            }
            warn!("Upstream branch location {} invalid; ignoring.", vcs.url);
        } else {
            match BranchSource::open(
                tree,
                &vcs.url,
                vcs.branch,
                vcs.subpath,
                browse.clone(),
                opts.version_kind,
                opts.dist_command.clone(),
            ) {
                Ok(source) => {
                    upstream_branch_url = Some(source.url().to_string());
                    upstream_branch_browse = browse;
                    upstream_branch_source = Some(source);
                }
                Err(err) => {
                    if !tolerate {
                        return Err(MergeError::UpstreamBranchUnavailable {
                            location,
                            reason: err.to_string(),
                        });
                    }
                    warn!("Upstream branch {} inaccessible; ignoring. {}", location, err);
                }
            }
        }
    }

    // Primary source selection.
    let mut primary_is_upstream_branch = false;
    let primary_source = if let Some(location) = &opts.location {
        match BranchSource::open(
            tree,
            location,
            None,
            None,
            None,
            opts.version_kind,
            opts.dist_command.clone(),
        ) {
            Ok(source) => UpstreamSource::Branch(source),
            Err(_) => UpstreamSource::Tarball(
                TarballSource::new(location, opts.new_upstream_version.as_deref())
                    .map_err(classify_source)?,
            ),
        }
    } else if opts.version_kind == VersionKind::Snapshot {
        match &upstream_branch_source {
            Some(source) => {
                primary_is_upstream_branch = true;
                UpstreamSource::Branch(source.clone())
            }
            None => return Err(MergeError::UpstreamBranchUnknown),
        }
    } else {
        match WatchSource::from_tree(
            tree.root(),
            subpath,
            opts.top_level,
            opts.skip_signatures,
        ) {
            Ok(source) => UpstreamSource::Watch(source),
            Err(SourceError::NoWatchFile) => {
                let source = match &upstream_branch_source {
                    Some(source) => source,
                    None => {
                        return Err(MergeError::NoUpstreamLocationsKnown {
                            package: package.to_string(),
                        })
                    }
                };
                if opts.require_uscan {
                    return Err(MergeError::NoWatchFile);
                }
                primary_is_upstream_branch = true;
                UpstreamSource::Branch(source.clone())
            }
            Err(err) => return Err(classify_source(err)),
        }
    };

    // New version resolution.
    let new_upstream_version = match &opts.new_upstream_version {
        Some(version) => debianize_upstream_version(version),
        None => {
            match primary_source
                .get_latest_version(package, opts.old_upstream_version.as_deref())
                .await
            {
                Ok((_raw, normalized)) => normalized,
                Err(SourceError::NotFound { .. }) => return Err(MergeError::NewUpstreamMissing),
                Err(err) => return Err(classify_source(err)),
            }
        }
    };
    if new_upstream_version.is_empty() {
        return Err(MergeError::NewUpstreamMissing);
    }
    // dpkg forbids versions not starting with a digit; refuse early.
    if parse_upstream_version(&new_upstream_version).is_err() {
        return Err(MergeError::InvalidFormatUpstreamVersion {
            version: new_upstream_version,
            source_name: primary_source.describe(),
        });
    }

    // No-op and regression guards.
    if let Some(old) = &opts.old_upstream_version {
        if strip_dfsg_suffix(old) == strip_dfsg_suffix(&new_upstream_version) {
            return Err(MergeError::AlreadyImported {
                version: new_upstream_version,
                version_kind: opts.version_kind,
            });
        }
        if let (Ok(old_parsed), Ok(new_parsed)) = (
            Version::from_str(old),
            Version::from_str(&new_upstream_version),
        ) {
            if old_parsed > new_parsed {
                if opts.version_kind == VersionKind::Release
                    && matches_release(old, &new_upstream_version)
                {
                    return Err(MergeError::AlreadyImported {
                        version: new_upstream_version,
                        version_kind: opts.version_kind,
                    });
                }
                return Err(MergeError::NewerVersionAlreadyImported {
                    old: old.clone(),
                    new: new_upstream_version,
                });
            }
        }
        if is_big_version_jump(old, &new_upstream_version) && !opts.force_big_version_jump {
            return Err(MergeError::BigVersionJump {
                old: old.clone(),
                new: new_upstream_version,
            });
        }
    }

    info!("Using version string {}.", new_upstream_version);

    // Decide whether upstream history is carried.
    let include_upstream_history = match opts.include_upstream_history {
        Some(include) => include,
        None => match &upstream_branch_source {
            Some(source) => detect_include_upstream_history(
                tree,
                source,
                package,
                opts.old_upstream_version.as_deref(),
            ),
            None => false,
        },
    };
    if !include_upstream_history {
        upstream_branch_source = None;
    }

    // Resolve revisions for the new version in the upstream branch.
    let mut upstream_revisions = None;
    if let Some(source) = &upstream_branch_source {
        match source.version_as_revisions(package, &new_upstream_version) {
            Ok(revisions) => upstream_revisions = Some(revisions),
            Err(SourceError::VersionNotPresent { .. }) => {
                if primary_is_upstream_branch || !opts.allow_ignore_upstream_branch {
                    return Err(MergeError::VersionMissingInUpstreamBranch {
                        branch: source.url().to_string(),
                        version: new_upstream_version,
                    });
                }
                warn!(
                    "Upstream version {} is not in upstream branch {}. \
                     Not merging from upstream branch.",
                    new_upstream_version,
                    source.url()
                );
                upstream_branch_source = None;
            }
            Err(err) => return Err(classify_source(err)),
        }
    }

    // DFSG-excluded files force a repack suffix.
    let files_excluded = metadata::files_excluded(tree.root(), subpath)?;
    let new_upstream_version = if files_excluded.is_some() {
        let suffixed =
            add_dfsg_suffix(&new_upstream_version, opts.old_upstream_version.as_deref());
        info!(
            "Adding DFSG suffix since upstream files are excluded: {}",
            suffixed
        );
        suffixed
    } else {
        new_upstream_version
    };

    Ok(ResolutionResult {
        primary_source,
        new_upstream_version,
        upstream_revisions,
        upstream_branch_source,
        upstream_branch_url,
        upstream_branch_browse,
        files_excluded,
        include_upstream_history,
    })
}
