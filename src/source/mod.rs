//! Upstream source resolvers
//!
//! This module provides:
//! - The UpstreamFetcher capability interface {get_latest_version,
//!   fetch_tarballs}
//! - A closed set of source variants: explicit tarball location, watch-file
//!   scan, upstream branch
//! - Explicit dispatch over the variants (no dynamic probing)

mod branch;
mod http;
mod tarball;
mod watch;

pub use branch::BranchSource;
pub use http::HttpClient;
pub use tarball::TarballSource;
pub use watch::WatchSource;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::SourceError;

/// Capability interface every upstream source provides
#[async_trait]
pub trait UpstreamFetcher {
    /// Human-readable identity for logs and error messages
    fn describe(&self) -> String;

    /// Latest version available from this source, at or above the floor.
    ///
    /// Returns the raw version string as the source exposes it together
    /// with its normalized (debianized) form. Fails with NotFound when the
    /// source exposes no discoverable version.
    async fn get_latest_version(
        &self,
        package: &str,
        floor_version: Option<&str>,
    ) -> Result<(String, String), SourceError>;

    /// Fetch the tarball component(s) for a specific version into
    /// `target_dir`, returning the produced paths.
    ///
    /// Fails with VersionNotPresent when this exact version can not be
    /// produced. Writes only into `target_dir` and never reports success
    /// with a partially populated directory. Fetching the same version
    /// twice yields byte-identical results.
    async fn fetch_tarballs(
        &self,
        package: &str,
        version: &str,
        target_dir: &Path,
        components: &[Option<String>],
    ) -> Result<Vec<PathBuf>, SourceError>;
}

/// The closed set of upstream source kinds
#[derive(Clone, Debug)]
pub enum UpstreamSource {
    /// A user-supplied tarball path or URL
    Tarball(TarballSource),
    /// A debian/watch scan
    Watch(WatchSource),
    /// An upstream-tracking branch
    Branch(BranchSource),
}

impl UpstreamSource {
    pub fn describe(&self) -> String {
        match self {
            UpstreamSource::Tarball(s) => s.describe(),
            UpstreamSource::Watch(s) => s.describe(),
            UpstreamSource::Branch(s) => s.describe(),
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, UpstreamSource::Branch(_))
    }

    pub async fn get_latest_version(
        &self,
        package: &str,
        floor_version: Option<&str>,
    ) -> Result<(String, String), SourceError> {
        match self {
            UpstreamSource::Tarball(s) => s.get_latest_version(package, floor_version).await,
            UpstreamSource::Watch(s) => s.get_latest_version(package, floor_version).await,
            UpstreamSource::Branch(s) => s.get_latest_version(package, floor_version).await,
        }
    }

    pub async fn fetch_tarballs(
        &self,
        package: &str,
        version: &str,
        target_dir: &Path,
        components: &[Option<String>],
    ) -> Result<Vec<PathBuf>, SourceError> {
        match self {
            UpstreamSource::Tarball(s) => {
                s.fetch_tarballs(package, version, target_dir, components).await
            }
            UpstreamSource::Watch(s) => {
                s.fetch_tarballs(package, version, target_dir, components).await
            }
            UpstreamSource::Branch(s) => {
                s.fetch_tarballs(package, version, target_dir, components).await
            }
        }
    }
}
