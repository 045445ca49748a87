//! Process configuration captured once at startup
//!
//! The environment is consulted exactly once, in main, to build a Config
//! that is threaded through every call. No other module reads ambient
//! process state.
//!
//! Recognized variables:
//! - SVP_API=1: machine-readable mode
//! - SVP_RESULT: path the structured result record is written to
//! - COMMITTER: committer identity ("Name <email>")
//! - DEBFULLNAME / DEBEMAIL: fallback identity pieces
//! - DEB_UPDATE_CHANGELOG: "leave" suppresses the gbp-style entry handling
//! - DIST: default dist command, overridden by --dist-command

use std::path::PathBuf;

/// Runtime configuration derived from the process environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Write a structured result record on exit
    pub machine_readable: bool,
    /// Where the structured record goes
    pub result_path: Option<PathBuf>,
    /// Committer identity for created commits ("Name <email>")
    pub committer: Option<String>,
    /// Whether changelog handling is managed here (false: "leave" policy)
    pub update_changelog: bool,
    /// Command used to build a tarball from an exported source tree
    pub dist_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine_readable: false,
            result_path: None,
            committer: None,
            update_changelog: true,
            dist_command: None,
        }
    }
}

impl Config {
    /// Capture configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Capture configuration through an injectable variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let machine_readable = get("SVP_API").as_deref() == Some("1");
        let result_path = get("SVP_RESULT").map(PathBuf::from);

        let committer = get("COMMITTER").or_else(|| {
            match (get("DEBFULLNAME"), get("DEBEMAIL")) {
                (Some(name), Some(email)) => Some(format!("{} <{}>", name, email)),
                _ => None,
            }
        });

        let update_changelog = get("DEB_UPDATE_CHANGELOG").as_deref() != Some("leave");

        Self {
            machine_readable,
            result_path,
            committer,
            update_changelog,
            dist_command: get("DIST").filter(|s| !s.is_empty()),
        }
    }

    /// True when a structured record can actually be written.
    pub fn reporting_enabled(&self) -> bool {
        self.machine_readable && self.result_path.is_some()
    }
}
