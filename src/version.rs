//! Version policy for upstream merges
//!
//! This module provides:
//! - Big-version-jump detection (safety valve for suspicious upstream jumps)
//! - DFSG suffix handling for repacked tarballs
//! - Upstream version string normalization ("debianization")
//! - Package version composition (epoch / upstream / debian revision)
//! - Action value scores consumed by the calling automation

use std::str::FromStr;

use debversion::Version;
use regex::Regex;
use std::sync::OnceLock;

/// Kind of upstream version being merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VersionKind {
    /// A tagged/published upstream release
    #[default]
    Release,
    /// An arbitrary upstream branch commit
    Snapshot,
}

impl std::fmt::Display for VersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionKind::Release => write!(f, "release"),
            VersionKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Value score reported for a successful import, per version kind
pub fn import_value(kind: VersionKind) -> i64 {
    match kind {
        VersionKind::Release => 20,
        VersionKind::Snapshot => 10,
    }
}

/// Value score reported for a successful merge, per version kind
pub fn merge_value(kind: VersionKind) -> i64 {
    match kind {
        VersionKind::Release => 40,
        VersionKind::Snapshot => 30,
    }
}

fn dfsg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+(dfsg|ds)\.?\d*$").unwrap())
}

/// Returns true if the jump from `old` to `new` looks suspiciously large.
///
/// Only the leading numeric component of each version is considered: the
/// jump is "big" iff old's major is positive and new's major is more than
/// five times it. Versions without a numeric leading component can not be
/// classified and yield false. Callers can override the outcome with a
/// force flag.
pub fn is_big_version_jump(old_upstream_version: &str, new_upstream_version: &str) -> bool {
    let major = |v: &str| -> Option<u64> {
        v.split('.').next().and_then(|s| s.parse::<u64>().ok())
    };
    match (major(old_upstream_version), major(new_upstream_version)) {
        (Some(old_major), Some(new_major)) => old_major > 0 && new_major > 5 * old_major,
        _ => false,
    }
}

/// Strip a DFSG repack suffix (`+dfsg2`, `+dfsg.1`, `+ds1`, ...) if present.
pub fn strip_dfsg_suffix(version: &str) -> &str {
    match dfsg_re().find(version) {
        Some(m) => &version[..m.start()],
        None => version,
    }
}

/// Append a DFSG suffix to `version`, matching the style the package used
/// previously when one is visible in `old_version`.
///
/// Re-adding to a version that already carries a suffix replaces it, so the
/// operation is idempotent for an unchanged underlying version.
pub fn add_dfsg_suffix(version: &str, old_version: Option<&str>) -> String {
    let style = match old_version {
        Some(old) if old.contains("+dfsg.") => "+dfsg.1",
        Some(old) if old.contains("+ds") && dfsg_re().is_match(old) => "+ds1",
        _ => "+dfsg1",
    };
    format!("{}{}", strip_dfsg_suffix(version), style)
}

/// Returns true if `old` denotes the release `new` or a derivative of it
/// (a snapshot or repack suffixed form), so that `old >= new` means the
/// release has effectively been imported already.
pub fn matches_release(old_upstream_version: &str, new_upstream_version: &str) -> bool {
    let old = strip_dfsg_suffix(old_upstream_version);
    let new = strip_dfsg_suffix(new_upstream_version);
    old == new
        || old.starts_with(&format!("{}+", new))
        || old.starts_with(&format!("{}~", new))
}

/// Mangle a raw upstream version string into one acceptable to dpkg.
///
/// Strips common tag prefixes, replaces underscores, and turns pre-release
/// markers into `~` forms so they sort before the final release.
pub fn debianize_upstream_version(version: &str) -> String {
    let mut v = version.trim().to_string();
    for prefix in ["release-", "version-", "v."] {
        if let Some(rest) = v.strip_prefix(prefix) {
            v = rest.to_string();
        }
    }
    if v.starts_with('v') && v[1..].starts_with(|c: char| c.is_ascii_digit()) {
        v = v[1..].to_string();
    }
    if v.contains('_') && !v.contains('.') {
        v = v.replace('_', ".");
    }
    static PRE: OnceLock<Regex> = OnceLock::new();
    let pre = PRE.get_or_init(|| Regex::new(r"[-_.]?(rc|alpha|beta|pre)\.?(\d*)$").unwrap());
    if let Some(c) = pre.captures(&v) {
        let marker = c.get(1).unwrap().as_str();
        let num = c.get(2).unwrap().as_str();
        let head = &v[..c.get(0).unwrap().start()];
        v = format!("{}~{}{}", head, marker, num);
    }
    v
}

/// Compose a full package version from an upstream version, a debian
/// revision and an optional inherited epoch.
pub fn new_package_version(
    upstream_version: &str,
    debian_revision: &str,
    epoch: Option<u32>,
) -> String {
    match epoch {
        Some(epoch) => format!("{}:{}-{}", epoch, upstream_version, debian_revision),
        None => format!("{}-{}", upstream_version, debian_revision),
    }
}

/// The debian revision to use for the first upload of a new upstream
/// version to `distribution`.
pub fn initial_debian_revision(distribution: &str) -> String {
    if distribution.to_lowercase().contains("ubuntu") {
        "0ubuntu1".to_string()
    } else {
        "1".to_string()
    }
}

/// Name of the upstream tarball for the given package and version.
///
/// `component` is None for the main tarball; `format` defaults to gz.
pub fn upstream_tarball_name(
    package: &str,
    version: &str,
    component: Option<&str>,
    format: Option<&str>,
) -> String {
    let format = format.unwrap_or("gz");
    let mut name = format!("{}_{}.orig", package, version);
    if let Some(component) = component {
        name.push('-');
        name.push_str(component);
    }
    format!("{}.tar.{}", name, format)
}

/// Parse an upstream version string, validating it the way dpkg would.
pub fn parse_upstream_version(version: &str) -> Result<Version, String> {
    if !version.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("version {} does not start with a digit", version));
    }
    Version::from_str(version).map_err(|e| e.to_string())
}
