//! upmerge - merge new upstream releases into Debian packaging branches
//!
//! Exit code 0 on success; 1 on every classified failure. In
//! machine-readable mode a structured result record is written for the
//! calling automation.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use upmerge::cli::CliArgs;
use upmerge::config::Config;
use upmerge::error::MergeError;
use upmerge::merge::{import_upstream, merge_upstream};
use upmerge::metadata;
use upmerge::packaging::{has_patch_series, refresh_quilt_patches, update_packaging};
use upmerge::report::{report_fatal, report_import_success, report_merge_success};
use upmerge::tree::PackagingTree;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(args.verbose);

    let mut config = Config::from_env();
    if args.dist_command.is_some() {
        config.dist_command = args.dist_command.clone();
    }

    match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Classify an ENOSPC anywhere in the error chain explicitly.
fn reclassify_enospc(err: MergeError) -> MergeError {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = cause {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::StorageFull {
                return MergeError::NoSpaceOnDevice {
                    message: err.to_string(),
                };
            }
        }
        cause = e.source();
    }
    err
}

/// Report a classified failure and fail; propagate unclassified errors.
fn fail(config: &Config, err: MergeError) -> anyhow::Result<ExitCode> {
    let err = reclassify_enospc(err);
    match err.code() {
        Some(code) => {
            report_fatal(config, code, &err);
            Ok(ExitCode::FAILURE)
        }
        None => Err(err.into()),
    }
}

async fn run(args: CliArgs, config: Config) -> anyhow::Result<ExitCode> {
    let (tree, subpath) = PackagingTree::open_containing(Path::new("."))?;

    if metadata::control_files_in_root(tree.root(), &subpath) {
        return fail(&config, MergeError::ControlFilesInRoot);
    }

    let _lock = match tree.lock_write() {
        Ok(lock) => lock,
        Err(err) => return fail(&config, err.into()),
    };

    let req = args.to_request(&config);
    let version_kind = args.effective_version_kind();

    if args.import_only {
        match import_upstream(&tree, &subpath, &config, &req).await {
            Ok(outcome) => {
                report_import_success(&config, &outcome, version_kind);
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => fail(&config, err),
        }
    } else {
        match merge_upstream(&tree, &subpath, &config, &req).await {
            Ok(outcome) => {
                let mut notes = Vec::new();
                if args.update_packaging {
                    notes = update_packaging(&tree, &subpath);
                    for note in &notes {
                        info!("{}", note);
                    }
                }
                if args.refresh_patches && has_patch_series(&tree, &subpath) {
                    if let Err(err) = refresh_quilt_patches(
                        &tree,
                        &subpath,
                        config.committer.as_deref(),
                    ) {
                        return fail(&config, err);
                    }
                }
                report_merge_success(&config, &outcome, version_kind, &notes);
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => fail(&config, err),
        }
    }
}
