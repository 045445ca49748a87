//! CLI argument parsing module for upmerge

use clap::Parser;

use crate::config::Config;
use crate::merge::UpstreamRequest;
use crate::version::VersionKind;

/// Merge a new upstream release into a Debian packaging branch
#[derive(Parser, Debug, Clone)]
#[command(name = "upmerge", about = "Merge new upstream releases into Debian packaging branches")]
pub struct CliArgs {
    #[arg(long, hide = true)]
    pub trust_package: bool,

    /// Only import a new version, do not merge
    #[arg(long)]
    pub import_only: bool,

    /// Attempt to update packaging to upstream changes
    #[arg(long)]
    pub update_packaging: bool,

    /// Merge a new upstream snapshot rather than a release
    #[arg(long)]
    pub snapshot: bool,

    /// Refresh quilt patches after the upstream merge
    #[arg(long)]
    pub refresh_patches: bool,

    /// Command to run to create a tarball from the source tree
    #[arg(long)]
    pub dist_command: Option<String>,

    /// Force inclusion of upstream branch history
    #[arg(long, overrides_with = "no_include_upstream_history")]
    pub include_upstream_history: bool,

    /// Do not include upstream branch history
    #[arg(long, overrides_with = "include_upstream_history")]
    pub no_include_upstream_history: bool,

    /// Force through big version jumps
    #[arg(long)]
    pub force_big_version_jump: bool,

    /// Debian revision to use (e.g. "1" or "0ubuntu1")
    #[arg(long)]
    pub debian_revision: Option<String>,

    /// Require that uscan provides the tarball
    #[arg(long)]
    pub require_uscan: bool,

    /// Location of the upstream source
    /// (defaults to reading debian/upstream/metadata)
    #[arg(long)]
    pub upstream_location: Option<String>,

    /// Upstream version to merge (defaults to the latest available)
    #[arg(long)]
    pub version: Option<String>,

    /// Distribution used when computing the initial debian revision
    #[arg(long, default_value = "unstable")]
    pub distribution: String,

    /// Enable verbose output
    #[arg(long)]
    pub verbose: bool,

    /// Skip signature validation
    #[arg(long)]
    pub skip_signatures: bool,

    /// Skip releases without changes
    #[arg(long)]
    pub skip_empty: bool,

    /// Version kind to merge
    #[arg(long, value_enum, default_value_t = VersionKind::Release)]
    pub version_kind: VersionKind,
}

impl CliArgs {
    /// The effective version kind; --snapshot wins over --version-kind.
    pub fn effective_version_kind(&self) -> VersionKind {
        if self.snapshot {
            VersionKind::Snapshot
        } else {
            self.version_kind
        }
    }

    /// Three-state include-upstream-history choice; None means detect.
    pub fn include_upstream_history_choice(&self) -> Option<bool> {
        if self.include_upstream_history {
            Some(true)
        } else if self.no_include_upstream_history {
            Some(false)
        } else {
            None
        }
    }

    /// Build the driver request from the parsed arguments.
    pub fn to_request(&self, _config: &Config) -> UpstreamRequest {
        UpstreamRequest {
            version_kind: self.effective_version_kind(),
            location: self.upstream_location.clone(),
            new_upstream_version: self.version.clone(),
            distribution: self.distribution.clone(),
            allow_ignore_upstream_branch: true,
            include_upstream_history: self.include_upstream_history_choice(),
            force_big_version_jump: self.force_big_version_jump,
            debian_revision: self.debian_revision.clone(),
            require_uscan: self.require_uscan,
            skip_signatures: self.skip_signatures,
            skip_empty: self.skip_empty,
        }
    }
}
