//! Import/merge driver
//!
//! Two entry points sharing the finder: import_upstream brings a new
//! upstream version into history without touching the working tree's
//! packaging, merge_upstream additionally merges it into the working tree
//! and updates the changelog. Merge results are classified (clean,
//! conflicted, already merged, already imported with recovery) and the
//! changelog is always re-read after the merge, since the merge itself may
//! have altered it.

use std::path::Path;

use tempfile::TempDir;
use tracing::info;

use crate::changelog::find_changelog;
use crate::config::Config;
use crate::error::{Conflict, MergeError, SourceError};
use crate::finder::{classify_source, find_new_upstream, FinderOptions, ResolutionResult};
use crate::metadata::{self, BuildType};
use crate::repack::repack;
use crate::tree::{upstream_tag_name, ImportedRevision, PackagingTree, RevisionId, TreeMergeOutcome};
use crate::version::{initial_debian_revision, new_package_version, VersionKind};

/// Parameters shared by the import and merge entry points
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub version_kind: VersionKind,
    pub location: Option<String>,
    pub new_upstream_version: Option<String>,
    pub distribution: String,
    pub allow_ignore_upstream_branch: bool,
    pub include_upstream_history: Option<bool>,
    pub force_big_version_jump: bool,
    pub debian_revision: Option<String>,
    pub require_uscan: bool,
    pub skip_signatures: bool,
    pub skip_empty: bool,
}

impl Default for UpstreamRequest {
    fn default() -> Self {
        Self {
            version_kind: VersionKind::Release,
            location: None,
            new_upstream_version: None,
            distribution: "unstable".to_string(),
            allow_ignore_upstream_branch: true,
            include_upstream_history: None,
            force_big_version_jump: false,
            debian_revision: None,
            require_uscan: false,
            skip_signatures: false,
            skip_empty: false,
        }
    }
}

/// Result of a completed import
#[derive(Debug)]
pub struct ImportOutcome {
    pub old_upstream_version: String,
    pub new_upstream_version: String,
    pub upstream_branch_url: Option<String>,
    pub upstream_branch_browse: Option<String>,
    pub upstream_revisions: Option<Vec<(Option<String>, RevisionId)>>,
    pub imported_revisions: Vec<ImportedRevision>,
    pub include_upstream_history: bool,
}

/// Result of a completed merge
#[derive(Debug)]
pub struct MergeOutcome {
    pub old_upstream_version: String,
    pub new_upstream_version: String,
    pub old_revision: Option<RevisionId>,
    pub new_revision: RevisionId,
    pub upstream_branch_url: Option<String>,
    pub upstream_branch_browse: Option<String>,
    pub upstream_revisions: Option<Vec<(Option<String>, RevisionId)>>,
    pub imported_revisions: Vec<ImportedRevision>,
    pub include_upstream_history: bool,
}

struct Preamble {
    package: String,
    old_upstream_version: String,
    epoch: Option<u32>,
    top_level: bool,
    build_type: BuildType,
}

fn prepare(tree: &PackagingTree, subpath: &str) -> Result<Preamble, MergeError> {
    let (changelog, top_level) = find_changelog(tree.root(), subpath)?;
    let contains_upstream_source =
        metadata::tree_contains_upstream_source(tree.root(), subpath);
    let build_type = metadata::guess_build_type(
        tree.root(),
        subpath,
        changelog.version(),
        contains_upstream_source,
    )?;
    Ok(Preamble {
        package: changelog.package().to_string(),
        old_upstream_version: changelog.upstream_version().to_string(),
        epoch: changelog.version().epoch,
        top_level,
        build_type,
    })
}

fn finder_options(req: &UpstreamRequest, preamble: &Preamble, config: &Config) -> FinderOptions {
    FinderOptions {
        location: req.location.clone(),
        old_upstream_version: Some(preamble.old_upstream_version.clone()),
        new_upstream_version: req.new_upstream_version.clone(),
        version_kind: req.version_kind,
        allow_ignore_upstream_branch: req.allow_ignore_upstream_branch,
        include_upstream_history: req.include_upstream_history,
        force_big_version_jump: req.force_big_version_jump,
        require_uscan: req.require_uscan,
        skip_signatures: req.skip_signatures,
        top_level: preamble.top_level,
        dist_command: config.dist_command.clone(),
    }
}

/// Fetch tarballs from the primary source, falling back to the upstream
/// branch when the finder already resolved revisions there.
///
/// `broad_fallback` additionally treats no-matching-hrefs as a fallback
/// trigger (the import entry point does; the merge entry point does not).
async fn fetch_with_fallback(
    resolution: &ResolutionResult,
    package: &str,
    fetch_dir: &Path,
    components: &[Option<String>],
    broad_fallback: bool,
) -> Result<Vec<std::path::PathBuf>, SourceError> {
    let version = &resolution.new_upstream_version;
    match resolution
        .primary_source
        .fetch_tarballs(package, version, fetch_dir, components)
        .await
    {
        Ok(paths) => Ok(paths),
        Err(err) => {
            let fallback_trigger = matches!(err, SourceError::VersionNotPresent { .. })
                || (broad_fallback && matches!(err, SourceError::NoMatchingHrefs { .. }));
            if !fallback_trigger {
                return Err(err);
            }
            match (&resolution.upstream_revisions, &resolution.upstream_branch_source) {
                (Some(revisions), Some(branch)) => branch.fetch_tarballs_for_revisions(
                    package,
                    version,
                    fetch_dir,
                    revisions,
                ),
                _ => Err(err),
            }
        }
    }
}

/// Normalize fetched tarballs into a fresh orig directory.
fn stage_tarballs(
    fetched: &[std::path::PathBuf],
    orig_dir: &Path,
) -> Result<Vec<std::path::PathBuf>, MergeError> {
    let mut staged = Vec::new();
    for path in fetched {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MergeError::UnsupportedRepackFormat {
                location: path.display().to_string(),
            })?;
        staged.push(repack(path, name, orig_dir).map_err(classify_source)?);
    }
    Ok(staged)
}

fn component_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let idx = name.find(".orig-")?;
    let rest = &name[idx + ".orig-".len()..];
    rest.split('.').next().map(|c| c.to_string())
}

/// Parents for the main import commit: the previous import plus, when
/// history is carried, the resolved upstream revisions.
fn import_parents(
    tree: &PackagingTree,
    old_upstream_version: &str,
    resolution: &ResolutionResult,
) -> Result<Vec<RevisionId>, MergeError> {
    let mut parents = Vec::new();
    if let Some(previous) = tree.lookup_imported_revision(old_upstream_version)? {
        parents.push(previous.revid);
    }
    if resolution.include_upstream_history {
        if let Some(revisions) = &resolution.upstream_revisions {
            for (component, revid) in revisions {
                if component.is_none() && !parents.contains(revid) {
                    parents.push(revid.clone());
                }
            }
        }
    }
    Ok(parents)
}

fn do_import(
    tree: &PackagingTree,
    tarballs: &[std::path::PathBuf],
    version: &str,
    parents: &[RevisionId],
    files_excluded: Option<&[String]>,
    committer: Option<&str>,
) -> Result<Vec<ImportedRevision>, MergeError> {
    let mut imported = Vec::new();
    for path in tarballs {
        let component = component_of(path);
        let parents: &[RevisionId] = if component.is_none() { parents } else { &[] };
        imported.push(tree.import_tarball(
            path,
            component.as_deref(),
            version,
            parents,
            files_excluded,
            committer,
        )?);
    }
    Ok(imported)
}

/// Import a new upstream version into the packaging history.
///
/// Never touches the changelog or the working tree content.
pub async fn import_upstream(
    tree: &PackagingTree,
    subpath: &str,
    config: &Config,
    req: &UpstreamRequest,
) -> Result<ImportOutcome, MergeError> {
    let preamble = prepare(tree, subpath)?;
    if preamble.build_type == BuildType::Merge {
        return Err(MergeError::UpstreamNotBundled {
            package: preamble.package,
        });
    }
    if preamble.build_type == BuildType::Native {
        return Err(MergeError::PackageIsNative {
            package: preamble.package,
            version: preamble.old_upstream_version,
        });
    }

    let opts = finder_options(req, &preamble, config);
    let resolution = find_new_upstream(tree, subpath, &preamble.package, &opts).await?;
    let version = resolution.new_upstream_version.clone();

    if tree.lookup_tag(&upstream_tag_name(&version))?.is_some() {
        return Err(MergeError::AlreadyImported {
            version,
            version_kind: req.version_kind,
        });
    }

    let components = vec![None];
    let workdir = TempDir::new().map_err(SourceError::Io)?;
    let fetch_dir = workdir.path().join("initial");
    let orig_dir = workdir.path().join("orig");
    std::fs::create_dir(&fetch_dir).map_err(SourceError::Io)?;
    std::fs::create_dir(&orig_dir).map_err(SourceError::Io)?;

    let fetched = fetch_with_fallback(&resolution, &preamble.package, &fetch_dir, &components, true)
        .await
        .map_err(classify_source)?;
    let tarballs = stage_tarballs(&fetched, &orig_dir)?;

    let parents = import_parents(tree, &preamble.old_upstream_version, &resolution)?;
    let imported = do_import(
        tree,
        &tarballs,
        &version,
        &parents,
        resolution.files_excluded.as_deref(),
        config.committer.as_deref(),
    )?;

    Ok(ImportOutcome {
        old_upstream_version: preamble.old_upstream_version,
        new_upstream_version: version,
        upstream_branch_url: resolution.upstream_branch_url,
        upstream_branch_browse: resolution.upstream_branch_browse,
        upstream_revisions: resolution.upstream_revisions,
        imported_revisions: imported,
        include_upstream_history: resolution.include_upstream_history,
    })
}

/// Merge a new upstream version into the working tree and record it in
/// the changelog.
pub async fn merge_upstream(
    tree: &PackagingTree,
    subpath: &str,
    config: &Config,
    req: &UpstreamRequest,
) -> Result<MergeOutcome, MergeError> {
    let preamble = prepare(tree, subpath)?;
    if preamble.build_type == BuildType::Native {
        return Err(MergeError::PackageIsNative {
            package: preamble.package,
            version: preamble.old_upstream_version,
        });
    }
    let need_upstream_tarball = preamble.build_type != BuildType::Merge;
    let old_revision = tree.last_revision()?;

    let opts = finder_options(req, &preamble, config);
    let resolution = find_new_upstream(tree, subpath, &preamble.package, &opts).await?;
    let version = resolution.new_upstream_version.clone();

    let mut conflicts: Vec<Conflict> = Vec::new();
    let mut imported: Vec<ImportedRevision> = Vec::new();

    if need_upstream_tarball {
        if let Some(previous) = tree.lookup_imported_revision(&version)? {
            // Import happened previously but was never merged into the
            // working tree; recover with a direct merge from that point.
            match tree.merge_revision(&previous.revid)? {
                TreeMergeOutcome::AlreadyMerged => {
                    return Err(MergeError::AlreadyMerged { version })
                }
                TreeMergeOutcome::Clean => {}
                TreeMergeOutcome::Conflicted(found) => conflicts = found,
            }
            imported.push(previous);
        } else {
            let components = vec![None];
            let workdir = TempDir::new().map_err(SourceError::Io)?;
            let fetch_dir = workdir.path().join("initial");
            let orig_dir = workdir.path().join("orig");
            std::fs::create_dir(&fetch_dir).map_err(SourceError::Io)?;
            std::fs::create_dir(&orig_dir).map_err(SourceError::Io)?;

            let fetched = match fetch_with_fallback(
                &resolution,
                &preamble.package,
                &fetch_dir,
                &components,
                false,
            )
            .await
            {
                Ok(paths) => paths,
                Err(SourceError::VersionNotPresent {
                    package,
                    version,
                    source_name,
                }) => {
                    return Err(MergeError::NewUpstreamTarballMissing {
                        package,
                        version,
                        source_name,
                    })
                }
                Err(err) => return Err(classify_source(err)),
            };
            let tarballs = stage_tarballs(&fetched, &orig_dir)?;

            let parents = import_parents(tree, &preamble.old_upstream_version, &resolution)?;
            if parents.is_empty() {
                return Err(MergeError::PreviousVersionTagMissing {
                    tag: upstream_tag_name(&preamble.old_upstream_version),
                    version: preamble.old_upstream_version,
                });
            }
            imported = do_import(
                tree,
                &tarballs,
                &version,
                &parents,
                resolution.files_excluded.as_deref(),
                config.committer.as_deref(),
            )?;

            let main = imported
                .iter()
                .find(|r| r.component.is_none())
                .map(|r| r.revid.clone())
                .unwrap_or_else(|| imported[0].revid.clone());
            match tree.merge_revision(&main)? {
                TreeMergeOutcome::AlreadyMerged => {
                    return Err(MergeError::AlreadyMerged { version })
                }
                TreeMergeOutcome::Clean => {}
                TreeMergeOutcome::Conflicted(found) => conflicts = found,
            }
        }
    }

    if req.skip_empty && !tree.has_pending_changes()? {
        tree.reset_pending_merge()?;
        return Err(MergeError::ReleaseWithoutChanges { version });
    }

    // Re-read the changelog: the merge may have altered it. Conflicts in
    // the changelog itself take priority in the error reported.
    let (mut changelog, _top_level) = match find_changelog(tree.root(), subpath) {
        Ok(found) => found,
        Err(err) => {
            if !conflicts.is_empty() {
                return Err(MergeError::MergeConflicted {
                    version: preamble.old_upstream_version,
                    conflicts,
                });
            }
            return Err(err);
        }
    };

    {
        use std::str::FromStr;
        let old_parsed = debversion::Version::from_str(&preamble.old_upstream_version);
        let new_parsed = debversion::Version::from_str(&version);
        if let (Ok(old_parsed), Ok(new_parsed)) = (old_parsed, new_parsed) {
            if old_parsed >= new_parsed {
                if !conflicts.is_empty() {
                    return Err(MergeError::MergeConflicted {
                        version: preamble.old_upstream_version,
                        conflicts,
                    });
                }
                return Err(MergeError::AlreadyMerged { version });
            }
        }
    }

    changelog.check_not_generated()?;
    let debian_revision = req
        .debian_revision
        .clone()
        .unwrap_or_else(|| initial_debian_revision(&req.distribution));
    let new_package_version = new_package_version(&version, &debian_revision, preamble.epoch);
    let entry_line = match req.version_kind {
        VersionKind::Release => format!("New upstream release {}.", version),
        VersionKind::Snapshot => format!("New upstream snapshot {}.", version),
    };
    let committer = match &config.committer {
        Some(committer) => committer.clone(),
        None => tree
            .committer_identity()?
            .unwrap_or_else(|| "upmerge <upmerge@localhost>".to_string()),
    };
    // Under the "leave" changelog policy only the version is recorded; the
    // entry body is left for the external changelog tooling.
    let lines = if config.update_changelog {
        vec![entry_line.clone()]
    } else {
        Vec::new()
    };
    changelog.add_version(&new_package_version, &lines, &committer)?;

    if !need_upstream_tarball {
        info!("The changelog has been updated for the new version.");
    } else if !conflicts.is_empty() {
        return Err(MergeError::MergeConflicted { version, conflicts });
    }

    let new_revision = tree.commit(&entry_line, config.committer.as_deref())?;

    Ok(MergeOutcome {
        old_upstream_version: preamble.old_upstream_version,
        new_upstream_version: version,
        old_revision,
        new_revision,
        upstream_branch_url: resolution.upstream_branch_url,
        upstream_branch_browse: resolution.upstream_branch_browse,
        upstream_revisions: resolution.upstream_revisions,
        imported_revisions: imported,
        include_upstream_history: resolution.include_upstream_history,
    })
}
