//! Upstream source backed by an explicit tarball path or URL
//!
//! The version is taken from the constructor when supplied, otherwise
//! parsed out of the file name. Fetching copies (or downloads) the file and
//! normalizes it through the repack boundary into the canonical orig name.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::SourceError;
use crate::repack::{repack, tarball_format};
use crate::source::http::HttpClient;
use crate::source::UpstreamFetcher;
use crate::version::{debianize_upstream_version, upstream_tarball_name};

/// A user-supplied tarball location
#[derive(Clone, Debug)]
pub struct TarballSource {
    location: String,
    version: Option<String>,
    client: HttpClient,
}

fn name_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:.*?[-_])?v?(\d[A-Za-z0-9.+~-]*?)(?:\.orig)?\.(?:tar\.(?:gz|bz2|xz|lzma)|tgz)$",
        )
        .unwrap()
    })
}

impl TarballSource {
    pub fn new(location: &str, version: Option<&str>) -> Result<Self, SourceError> {
        Ok(Self {
            location: location.to_string(),
            version: version.map(|v| v.to_string()),
            client: HttpClient::new()?,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    fn basename(&self) -> String {
        let trimmed = self.location.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((_, name)) => name.to_string(),
            None => trimmed.to_string(),
        }
    }

    fn resolve_version(&self) -> Option<String> {
        if let Some(version) = &self.version {
            return Some(version.clone());
        }
        name_version_re()
            .captures(&self.basename())
            .map(|caps| caps[1].to_string())
    }
}

#[async_trait]
impl UpstreamFetcher for TarballSource {
    fn describe(&self) -> String {
        format!("tarball {}", self.location)
    }

    async fn get_latest_version(
        &self,
        package: &str,
        _floor_version: Option<&str>,
    ) -> Result<(String, String), SourceError> {
        match self.resolve_version() {
            Some(raw) => {
                let normalized = debianize_upstream_version(&raw);
                Ok((raw, normalized))
            }
            None => Err(SourceError::NotFound {
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
        let ours = self
            .resolve_version()
            .map(|v| debianize_upstream_version(&v));
        if let Some(ours) = &ours {
            if ours != version {
                return Err(SourceError::VersionNotPresent {
                    package: package.to_string(),
                    version: version.to_string(),
                    source_name: self.describe(),
                });
            }
        }

        let basename = self.basename();
        let format = tarball_format(Path::new(&basename)).ok_or_else(|| {
            SourceError::UnsupportedRepackFormat {
                location: self.location.clone(),
            }
        })?;
        let desired = upstream_tarball_name(package, version, None, Some(format));

        let path = if self.is_remote() {
            let staging = target_dir.join(&basename);
            if let Err(e) = self.client.download(&self.location, &staging).await {
                let _ = std::fs::remove_file(&staging);
                return Err(match e {
                    SourceError::HttpStatus { status: 404, .. } => {
                        SourceError::VersionNotPresent {
                            package: package.to_string(),
                            version: version.to_string(),
                            source_name: self.describe(),
                        }
                    }
                    other => other,
                });
            }
            let result = repack(&staging, &desired, target_dir);
            if staging != target_dir.join(&desired) {
                let _ = std::fs::remove_file(&staging);
            }
            result?
        } else {
            let source = PathBuf::from(&self.location);
            if !source.exists() {
                return Err(SourceError::VersionNotPresent {
                    package: package.to_string(),
                    version: version.to_string(),
                    source_name: self.describe(),
                });
            }
            repack(&source, &desired, target_dir)?
        };

        Ok(vec![path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_version_from_explicit() {
        let source = TarballSource::new("/tmp/foo.tar.gz", Some("2.0")).unwrap();
        let (raw, normalized) = source.get_latest_version("foo", None).await.unwrap();
        assert_eq!(raw, "2.0");
        assert_eq!(normalized, "2.0");
    }

    #[tokio::test]
    async fn test_version_from_filename() {
        let source = TarballSource::new("/tmp/foo-1.2.3.tar.gz", None).unwrap();
        let (raw, _) = source.get_latest_version("foo", None).await.unwrap();
        assert_eq!(raw, "1.2.3");

        let source = TarballSource::new("/tmp/foo_1.4.orig.tar.xz", None).unwrap();
        let (raw, _) = source.get_latest_version("foo", None).await.unwrap();
        assert_eq!(raw, "1.4");

        let source = TarballSource::new("https://example.com/dl/bar-v2.0.tgz", None).unwrap();
        let (raw, _) = source.get_latest_version("bar", None).await.unwrap();
        assert_eq!(raw, "2.0");
    }

    #[tokio::test]
    async fn test_version_unparseable() {
        let source = TarballSource::new("/tmp/foo.tar.gz", None).unwrap();
        let err = source.get_latest_version("foo", None).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_local_tarball() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("foo-1.1.tar.gz");
        std::fs::write(&tarball, b"bytes").unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let source = TarballSource::new(&tarball.to_string_lossy(), None).unwrap();
        let paths = source
            .fetch_tarballs("foo", "1.1", &target, &[None])
            .await
            .unwrap();
        assert_eq!(paths, vec![target.join("foo_1.1.orig.tar.gz")]);
    }

    #[tokio::test]
    async fn test_fetch_idempotent() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("foo-1.1.tar.gz");
        std::fs::write(&tarball, b"bytes").unwrap();
        let source = TarballSource::new(&tarball.to_string_lossy(), None).unwrap();

        let target_a = dir.path().join("a");
        let target_b = dir.path().join("b");
        std::fs::create_dir(&target_a).unwrap();
        std::fs::create_dir(&target_b).unwrap();
        let a = source
            .fetch_tarballs("foo", "1.1", &target_a, &[None])
            .await
            .unwrap();
        let b = source
            .fetch_tarballs("foo", "1.1", &target_b, &[None])
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(&a[0]).unwrap(),
            std::fs::read(&b[0]).unwrap()
        );

        // Fetching again into the same populated directory is a no-op.
        let again = source
            .fetch_tarballs("foo", "1.1", &target_a, &[None])
            .await
            .unwrap();
        assert_eq!(again, a);
    }

    #[tokio::test]
    async fn test_fetch_wrong_version() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("foo-1.1.tar.gz");
        std::fs::write(&tarball, b"bytes").unwrap();
        let source = TarballSource::new(&tarball.to_string_lossy(), None).unwrap();

        let err = source
            .fetch_tarballs("foo", "2.0", dir.path(), &[None])
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::VersionNotPresent { .. }));
    }
}
