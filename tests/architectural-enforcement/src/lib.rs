//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the eventcast crates:
//! - No sleep() calls in production code; timers wait on deadlines or intervals
//!
//! These tests are designed to catch violations early in the development cycle.

use std::path::PathBuf;

/// Source directories of the production crates, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["eventcast/core/src", "eventcast/daemon/src"];

/// Absolute path of a directory inside the workspace
pub fn workspace_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join(relative)
}
