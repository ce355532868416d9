// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared helpers for config tests.

use crate::{config::DroverConfig, errors::ConfigParseError};
use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;

/// Sets up a temporary workspace with the given config contents at
/// `.config/drover.toml`, returning the workspace root.
pub(super) fn temp_workspace(dir: &Utf8TempDir, config_contents: &str) -> Utf8PathBuf {
    let root = dir.path().to_path_buf();
    let config_dir = root.join(".config");
    std::fs::create_dir_all(&config_dir).expect("config dir created");
    std::fs::write(
        config_dir.join("drover.toml").as_std_path(),
        config_contents,
    )
    .expect("config file written");
    root
}

/// Loads a config from the given contents, written to a temporary workspace.
pub(super) fn load_config(
    dir: &Utf8TempDir,
    config_contents: &str,
) -> Result<DroverConfig, ConfigParseError> {
    let root = temp_workspace(dir, config_contents);
    DroverConfig::from_sources(root, None)
}

/// Formats an error along with its source chain.
pub(super) fn display_error_chain(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        out.push_str(": ");
        out.push_str(&err.to_string());
        source = err.source();
    }
    out
}
