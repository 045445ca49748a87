//! Outcome reporting
//!
//! This module provides:
//! - The machine-readable failure record {result_code, hint, transient,
//!   stage, description, versions, details, context}
//! - The machine-readable success records for imports and merges
//! - The always-present human-readable log line
//!
//! Records are only written when the configuration captured a result path
//! (machine-readable mode); logging happens unconditionally.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::config::Config;
use crate::error::MergeError;
use crate::merge::{ImportOutcome, MergeOutcome};
use crate::version::{import_value, merge_value, VersionKind};

/// Versions of the tools involved, for the result record.
pub fn versions_dict() -> BTreeMap<String, String> {
    let mut versions = BTreeMap::new();
    versions.insert("upmerge".to_string(), env!("CARGO_PKG_VERSION").to_string());
    versions
}

#[derive(Serialize)]
struct FailureRecord {
    result_code: String,
    hint: Option<String>,
    transient: Option<bool>,
    stage: Option<String>,
    description: String,
    versions: BTreeMap<String, String>,
    details: Option<Value>,
    context: Map<String, Value>,
}

#[derive(Serialize)]
struct SuccessRecord {
    value: i64,
    description: String,
    #[serde(rename = "commit-message", skip_serializing_if = "Option::is_none")]
    commit_message: Option<String>,
    context: Map<String, Value>,
    versions: BTreeMap<String, String>,
}

fn write_record<T: Serialize>(config: &Config, record: &T) {
    if !config.reporting_enabled() {
        return;
    }
    let path = config.result_path.as_ref().unwrap();
    match serde_json::to_string(record) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                error!("failed to write result record to {}: {}", path.display(), e);
            }
        }
        Err(e) => error!("failed to serialize result record: {}", e),
    }
}

/// Report a classified failure; `code` must be the error's stable code.
pub fn report_fatal(config: &Config, code: &str, err: &MergeError) {
    let mut context = Map::new();
    if let Some(version) = err.upstream_version() {
        context.insert(
            "upstream_version".to_string(),
            Value::String(version.to_string()),
        );
    }
    let record = FailureRecord {
        result_code: code.to_string(),
        hint: err.hint(),
        transient: err.transient(),
        stage: err.stage().map(|s| s.to_string()),
        description: err.to_string(),
        versions: versions_dict(),
        details: err.details(),
        context,
    };
    write_record(config, &record);
    error!("{}", record.description);
    if let Some(hint) = &record.hint {
        info!("{}", hint);
    }
}

fn success_context(
    old_upstream_version: &str,
    new_upstream_version: &str,
    upstream_branch_url: Option<&str>,
    upstream_branch_browse: Option<&str>,
    include_upstream_history: bool,
    notes: &[String],
) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert(
        "old_upstream_version".to_string(),
        Value::String(old_upstream_version.to_string()),
    );
    context.insert(
        "upstream_version".to_string(),
        Value::String(new_upstream_version.to_string()),
    );
    if let Some(url) = upstream_branch_url {
        context.insert(
            "upstream_branch_url".to_string(),
            Value::String(url.to_string()),
        );
    }
    if let Some(browse) = upstream_branch_browse {
        context.insert(
            "upstream_branch_browse".to_string(),
            Value::String(browse.to_string()),
        );
    }
    context.insert(
        "include_upstream_history".to_string(),
        Value::Bool(include_upstream_history),
    );
    if !notes.is_empty() {
        context.insert(
            "notes".to_string(),
            Value::Array(notes.iter().map(|n| Value::String(n.clone())).collect()),
        );
    }
    context
}

/// Report a successful import.
pub fn report_import_success(
    config: &Config,
    outcome: &ImportOutcome,
    version_kind: VersionKind,
) {
    info!(
        "Imported new upstream version {} (previous: {})",
        outcome.new_upstream_version, outcome.old_upstream_version
    );
    let record = SuccessRecord {
        value: import_value(version_kind),
        description: format!(
            "Imported new upstream version {}",
            outcome.new_upstream_version
        ),
        commit_message: None,
        context: success_context(
            &outcome.old_upstream_version,
            &outcome.new_upstream_version,
            outcome.upstream_branch_url.as_deref(),
            outcome.upstream_branch_browse.as_deref(),
            outcome.include_upstream_history,
            &[],
        ),
        versions: versions_dict(),
    };
    write_record(config, &record);
}

/// Report a successful merge.
pub fn report_merge_success(
    config: &Config,
    outcome: &MergeOutcome,
    version_kind: VersionKind,
    notes: &[String],
) {
    info!(
        "Merged new upstream version {} (previous: {})",
        outcome.new_upstream_version, outcome.old_upstream_version
    );
    let record = SuccessRecord {
        value: merge_value(version_kind),
        description: format!(
            "Merged new upstream version {}",
            outcome.new_upstream_version
        ),
        commit_message: Some(format!(
            "Merge new upstream release {}",
            outcome.new_upstream_version
        )),
        context: success_context(
            &outcome.old_upstream_version,
            &outcome.new_upstream_version,
            outcome.upstream_branch_url.as_deref(),
            outcome.upstream_branch_browse.as_deref(),
            outcome.include_upstream_history,
            notes,
        ),
        versions: versions_dict(),
    };
    write_record(config, &record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Conflict;
    use tempfile::TempDir;

    fn reporting_config(dir: &TempDir) -> Config {
        Config {
            machine_readable: true,
            result_path: Some(dir.path().join("result.json")),
            ..Default::default()
        }
    }

    fn read_record(dir: &TempDir) -> Value {
        let text = std::fs::read_to_string(dir.path().join("result.json")).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_failure_record_schema() {
        let dir = TempDir::new().unwrap();
        let config = reporting_config(&dir);
        let err = MergeError::BigVersionJump {
            old: "1.0".to_string(),
            new: "8.0".to_string(),
        };
        report_fatal(&config, err.code().unwrap(), &err);

        let record = read_record(&dir);
        assert_eq!(record["result_code"], "big-version-jump");
        assert_eq!(record["transient"], false);
        assert_eq!(record["context"]["upstream_version"], "8.0");
        assert!(record["description"].as_str().unwrap().contains("big jump"));
        assert!(record["versions"]["upmerge"].is_string());
        assert!(record["details"].is_null());
    }

    #[test]
    fn test_failure_record_conflict_details() {
        let dir = TempDir::new().unwrap();
        let config = reporting_config(&dir);
        let err = MergeError::MergeConflicted {
            version: "1.1".to_string(),
            conflicts: vec![Conflict {
                path: "README".to_string(),
                kind: "text conflict".to_string(),
            }],
        };
        report_fatal(&config, err.code().unwrap(), &err);

        let record = read_record(&dir);
        assert_eq!(record["result_code"], "upstream-merged-conflicts");
        assert_eq!(record["details"]["conflicts"][0][0], "README");
        assert_eq!(record["details"]["conflicts"][0][1], "text conflict");
    }

    #[test]
    fn test_no_record_without_machine_mode() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            machine_readable: false,
            result_path: Some(dir.path().join("result.json")),
            ..Default::default()
        };
        let err = MergeError::NewUpstreamMissing;
        report_fatal(&config, err.code().unwrap(), &err);
        assert!(!dir.path().join("result.json").exists());
    }

    #[test]
    fn test_merge_success_record() {
        let dir = TempDir::new().unwrap();
        let config = reporting_config(&dir);
        let outcome = MergeOutcome {
            old_upstream_version: "1.0".to_string(),
            new_upstream_version: "1.1".to_string(),
            old_revision: Some("a".to_string()),
            new_revision: "b".to_string(),
            upstream_branch_url: Some("https://example.com/foo.git".to_string()),
            upstream_branch_browse: None,
            upstream_revisions: None,
            imported_revisions: Vec::new(),
            include_upstream_history: true,
        };
        report_merge_success(&config, &outcome, VersionKind::Release, &["note".to_string()]);

        let record = read_record(&dir);
        assert_eq!(record["value"], 40);
        assert_eq!(record["commit-message"], "Merge new upstream release 1.1");
        assert_eq!(record["context"]["upstream_version"], "1.1");
        assert_eq!(
            record["context"]["upstream_branch_url"],
            "https://example.com/foo.git"
        );
        assert_eq!(record["context"]["include_upstream_history"], true);
        assert_eq!(record["context"]["notes"][0], "note");
    }

    #[test]
    fn test_import_success_record() {
        let dir = TempDir::new().unwrap();
        let config = reporting_config(&dir);
        let outcome = ImportOutcome {
            old_upstream_version: "1.0".to_string(),
            new_upstream_version: "1.1".to_string(),
            upstream_branch_url: None,
            upstream_branch_browse: None,
            upstream_revisions: None,
            imported_revisions: Vec::new(),
            include_upstream_history: false,
        };
        report_import_success(&config, &outcome, VersionKind::Snapshot);

        let record = read_record(&dir);
        assert_eq!(record["value"], 10);
        assert!(record.get("commit-message").is_none());
        assert_eq!(record["context"]["old_upstream_version"], "1.0");
    }
}
