// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by drover.

use camino::{Utf8Path, Utf8PathBuf};
use config::ConfigError;
use drover_filtering::errors::{FiltersetParseErrors, ParseSingleError};
use std::{collections::BTreeSet, fmt, sync::Arc};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse drover config at `{config_file}`")]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing the config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error("error building config")]
    BuildError(#[source] Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error("error deserializing config")]
    DeserializeError(#[source] Box<serde_path_to_error::Error<ConfigError>>),

    /// The config contained keys drover doesn't know about.
    ///
    /// A mistyped policy field that was silently ignored would change run
    /// behavior, so loading fails instead.
    #[error("unknown configuration keys: {}", display_keys(.keys))]
    UnknownConfigKeys {
        /// The unknown keys, as dotted paths.
        keys: BTreeSet<String>,
    },

    /// One or more override filters failed to parse.
    #[error("invalid filter expressions:\n{}", display_filter_errors(.0))]
    InvalidFilter(Vec<InvalidFilterError>),
}

fn display_keys(keys: &BTreeSet<String>) -> String {
    let keys: Vec<_> = keys.iter().map(|k| k.as_str()).collect();
    keys.join(", ")
}

fn display_filter_errors(errors: &[InvalidFilterError]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for error in errors {
        let _ = writeln!(out, "  - {error}");
    }
    out
}

/// An override filter expression that failed to parse.
#[derive(Clone, Debug, Error)]
#[error(
    "in profile `{profile_name}`, override {index}: invalid filter `{}`",
    .errors.input
)]
pub struct InvalidFilterError {
    /// The name of the profile the override was defined under.
    pub profile_name: String,

    /// The index of the override within the profile (declaration order).
    pub index: usize,

    /// The errors that occurred while parsing the filter.
    pub errors: FiltersetParseErrors,
}

impl InvalidFilterError {
    /// Returns miette diagnostics for each individual parse error, with the
    /// filter input attached as source code.
    pub fn reports(&self) -> impl Iterator<Item = miette::Report> + '_ {
        self.errors.errors.iter().map(|error| {
            miette::Report::new(error.clone()).with_source_code(self.errors.input.clone())
        })
    }

    /// Returns the individual parse errors.
    pub fn parse_errors(&self) -> &[ParseSingleError] {
        &self.errors.errors
    }
}

/// The selected profile was not found in the config.
#[derive(Clone, Debug, Error)]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

impl fmt::Display for ProfileNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "profile '{}' not found (known profiles: {})",
            self.profile,
            self.all_profiles.join(", ")
        )
    }
}

/// An error that occurred while building a test runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// An error occurred while setting up signal handlers.
    #[error("error setting up signal handler")]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),
}

/// Errors that occurred while executing a test run.
///
/// The callback may have failed, and runner tasks may have panicked; both are
/// collected here.
#[derive(Debug)]
pub struct TestRunnerExecuteErrors<E> {
    /// The first error returned by the reporter callback, if any.
    pub report_error: Option<E>,

    /// Join errors from runner tasks (typically panics).
    pub join_errors: Vec<tokio::task::JoinError>,
}

impl<E: fmt::Debug> fmt::Display for TestRunnerExecuteErrors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error executing test run")?;
        if let Some(report_error) = &self.report_error {
            write!(f, "; callback error: {report_error:?}")?;
        }
        if !self.join_errors.is_empty() {
            write!(f, "; {} runner task(s) failed", self.join_errors.len())?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug> std::error::Error for TestRunnerExecuteErrors<E> {}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);

/// An error that occurred while starting a test subprocess.
///
/// Spawn failures are treated as failed attempts: they consume a retry and
/// never abort the run.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ChildStartError {
    /// An error occurred while spawning the process.
    #[error("error spawning child process")]
    Spawn(#[source] Arc<std::io::Error>),
}

/// An error that occurred while parsing a test-threads value.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct TestThreadsParseError {
    message: String,
}

impl TestThreadsParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An error that occurred while parsing a max-fail value.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct MaxFailParseError {
    message: String,
}

impl MaxFailParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
