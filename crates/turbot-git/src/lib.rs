//! # turbot-git
//!
//! Version control and dependency install layer for Turbot deploys.
//!
//! This crate provides:
//! - Git command execution abstraction (real and mock executors)
//! - `VersionControl`: current commit, pull, restore-to-commit
//! - `PackageInstaller`: the dependency install step (command and mock)

mod command;
mod installer;
mod vcs;

pub use command::{GitCommand, GitExecutor, GitOutput, MockGitExecutor};
pub use installer::{CommandInstaller, MockInstaller, PackageInstaller};
pub use vcs::VersionControl;
