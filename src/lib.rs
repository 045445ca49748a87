//! upmerge - merge new upstream releases into Debian packaging branches
//!
//! This library provides the core functionality for resolving a new
//! upstream release (from an upstream branch, a watch-file scan, or an
//! explicit tarball location), importing or merging it into a packaging
//! branch, updating the changelog, and reporting the outcome in a
//! machine-readable way.

pub mod changelog;
pub mod cli;
pub mod config;
pub mod error;
pub mod finder;
pub mod merge;
pub mod metadata;
pub mod packaging;
pub mod repack;
pub mod report;
pub mod source;
pub mod tree;
pub mod version;
