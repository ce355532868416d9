// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{
        deserialize_fail_fast, deserialize_retry_policy, deserialize_slow_timeout, CompiledByProfile,
        CompiledData, DeserializedOverride, MaxFail, RetryPolicy, SlowTimeout, TestSettings,
        TestThreads, ThreadsRequired,
    },
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
    reporter::TestOutputDisplay,
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, File, FileFormat};
use drover_filtering::TestQuery;
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    sync::LazyLock,
};
use tracing::warn;

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall configuration for drover.
///
/// This is the root data structure for drover configuration. Most runner
/// configuration is managed through named [profiles](EvaluatableProfile),
/// obtained through the [`profile`](Self::profile) method.
///
/// The set of profiles is an immutable value: load it once at startup and
/// pass it (or a profile borrowed from it) into the runner. There is no
/// process-wide registry.
#[derive(Clone, Debug)]
pub struct DroverConfig {
    workspace_root: Utf8PathBuf,
    inner: DroverConfigImpl,
    compiled: CompiledByProfile,
}

impl DroverConfig {
    /// The default location of the config within the workspace:
    /// `.config/drover.toml`.
    pub const CONFIG_PATH: &'static str = ".config/drover.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default
    /// config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the drover config from the given file, or if not specified from
    /// `.config/drover.toml` in the workspace root.
    ///
    /// If no config file is specified and the workspace doesn't have
    /// `.config/drover.toml`, uses the default config options.
    pub fn from_sources(
        workspace_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let workspace_root = workspace_root.into();
        let (inner, compiled) = Self::read_from_sources(&workspace_root, config_file)?;
        Ok(Self {
            workspace_root,
            inner,
            compiled,
        })
    }

    /// Returns the workspace root for this config.
    pub fn workspace_root(&self) -> &Utf8Path {
        &self.workspace_root
    }

    /// Returns the profile with the given name, or an error if a profile was
    /// specified but not found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<EvaluatableProfile<'_>, ProfileNotFound> {
        self.make_profile(name.as_ref())
    }

    // ---
    // Helper methods
    // ---

    fn read_from_sources(
        workspace_root: &Utf8Path,
        file: Option<&Utf8Path>,
    ) -> Result<(DroverConfigImpl, CompiledByProfile), ConfigParseError> {
        let (config_file, source) = match file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = workspace_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        // Unknown keys are a hard error, not a warning: a mistyped policy
        // field that was silently ignored would change run behavior.
        if !unknown.is_empty() {
            return Err(ConfigParseError::new(
                &config_file,
                ConfigParseErrorKind::UnknownConfigKeys { keys: unknown },
            ));
        }

        let inner = config.into_config_impl();
        let compiled = CompiledByProfile::new(&inner)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        Ok((inner, compiled))
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn make_profile(&self, name: &str) -> Result<EvaluatableProfile<'_>, ProfileNotFound> {
        let custom_profile = self.inner.get_profile(name)?;

        // The default profile's overrides are chained before the selected
        // profile's own: resolution is last-match-wins, so the selected
        // profile takes precedence.
        let mut compiled_data = self.compiled.default.clone();
        if let Some(data) = self.compiled.other.get(name) {
            compiled_data = compiled_data.chain(data.clone());
        }

        Ok(EvaluatableProfile {
            name: name.to_owned(),
            default_profile: &self.inner.default_profile,
            custom_profile,
            compiled_data,
        })
    }

    /// This returns a tuple of (config, unknown paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(DroverConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: DroverConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // Both serde_path_to_error and the latest versions of the
                // config crate report the key. We drop the key from the config
                // error for consistency.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// A configuration profile for drover: the base policy plus compiled
/// overrides.
///
/// Returned by [`DroverConfig::profile`].
#[derive(Clone, Debug)]
pub struct EvaluatableProfile<'cfg> {
    name: String,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
    compiled_data: CompiledData,
}

/// Returns a config field from an EvaluatableProfile, checking the custom
/// profile first and falling back to the default profile.
macro_rules! profile_field {
    ($eval_prof:ident.$field:ident) => {
        $eval_prof
            .custom_profile
            .and_then(|p| p.$field)
            .unwrap_or($eval_prof.default_profile.$field)
    };
}

impl<'cfg> EvaluatableProfile<'cfg> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the retry policy for this profile.
    pub fn retries(&self) -> RetryPolicy {
        profile_field!(self.retries)
    }

    /// Returns the total concurrency budget for this profile.
    pub fn test_threads(&self) -> TestThreads {
        profile_field!(self.test_threads)
    }

    /// Returns the number of slots required for each test.
    pub fn threads_required(&self) -> ThreadsRequired {
        profile_field!(self.threads_required)
    }

    /// Returns the time after which tests are treated as slow for this
    /// profile.
    pub fn slow_timeout(&self) -> SlowTimeout {
        profile_field!(self.slow_timeout)
    }

    /// Returns the failure output config for this profile.
    pub fn failure_output(&self) -> TestOutputDisplay {
        profile_field!(self.failure_output)
    }

    /// Returns the max-fail config for this profile.
    pub fn max_fail(&self) -> MaxFail {
        profile_field!(self.max_fail)
    }

    /// Returns the fully resolved settings for an individual test.
    ///
    /// Resolution is deterministic and side-effect-free: repeated calls with
    /// the same query return the same settings.
    pub fn settings_for(&self, query: &TestQuery<'_>) -> TestSettings {
        TestSettings::new(self, query)
    }

    pub(crate) fn compiled_data(&self) -> &CompiledData {
        &self.compiled_data
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DroverConfigImpl {
    default_profile: DefaultProfileImpl,
    other_profiles: HashMap<String, CustomProfileImpl>,
}

impl DroverConfigImpl {
    fn get_profile(&self, profile: &str) -> Result<Option<&CustomProfileImpl>, ProfileNotFound> {
        let custom_profile = match profile {
            DroverConfig::DEFAULT_PROFILE => None,
            other => Some(
                self.other_profiles
                    .get(other)
                    .ok_or_else(|| ProfileNotFound::new(profile, self.all_profiles()))?,
            ),
        };
        Ok(custom_profile)
    }

    fn all_profiles(&self) -> impl Iterator<Item = &str> {
        self.other_profiles
            .keys()
            .map(|key| key.as_str())
            .chain(std::iter::once(DroverConfig::DEFAULT_PROFILE))
    }

    pub(crate) fn default_profile(&self) -> &DefaultProfileImpl {
        &self.default_profile
    }

    pub(crate) fn other_profiles(&self) -> impl Iterator<Item = (&str, &CustomProfileImpl)> {
        self.other_profiles
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
}

#[derive(Clone, Debug, Deserialize)]
struct DroverConfigDeserialize {
    #[serde(rename = "profile")]
    profiles: HashMap<String, CustomProfileImpl>,
}

impl DroverConfigDeserialize {
    fn into_config_impl(mut self) -> DroverConfigImpl {
        let p = self
            .profiles
            .remove("default")
            .expect("default profile should exist");
        let default_profile = DefaultProfileImpl::new(p);

        DroverConfigImpl {
            default_profile,
            other_profiles: self.profiles,
        }
    }
}

/// The default profile: present in the embedded default config, so every
/// field is guaranteed to be populated.
#[derive(Clone, Debug)]
pub(crate) struct DefaultProfileImpl {
    test_threads: TestThreads,
    threads_required: ThreadsRequired,
    retries: RetryPolicy,
    slow_timeout: SlowTimeout,
    failure_output: TestOutputDisplay,
    max_fail: MaxFail,
    overrides: Vec<DeserializedOverride>,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            test_threads: p
                .test_threads
                .expect("test-threads present in default profile"),
            threads_required: p
                .threads_required
                .expect("threads-required present in default profile"),
            retries: p.retries.expect("retries present in default profile"),
            slow_timeout: p
                .slow_timeout
                .expect("slow-timeout present in default profile"),
            failure_output: p
                .failure_output
                .expect("failure-output present in default profile"),
            max_fail: p.max_fail.expect("fail-fast present in default profile"),
            overrides: p.overrides,
        }
    }

    pub(crate) fn overrides(&self) -> &[DeserializedOverride] {
        &self.overrides
    }
}

/// A custom profile: sparse, with unset fields falling back to the default
/// profile.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct CustomProfileImpl {
    #[serde(default, deserialize_with = "deserialize_retry_policy")]
    retries: Option<RetryPolicy>,
    #[serde(default)]
    test_threads: Option<TestThreads>,
    #[serde(default)]
    threads_required: Option<ThreadsRequired>,
    #[serde(default)]
    failure_output: Option<TestOutputDisplay>,
    #[serde(
        default,
        rename = "fail-fast",
        deserialize_with = "deserialize_fail_fast"
    )]
    max_fail: Option<MaxFail>,
    #[serde(default, deserialize_with = "deserialize_slow_timeout")]
    slow_timeout: Option<SlowTimeout>,
    #[serde(default)]
    overrides: Vec<DeserializedOverride>,
}

impl CustomProfileImpl {
    pub(crate) fn overrides(&self) -> &[DeserializedOverride] {
        &self.overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_helpers::*;
    use camino_tempfile::tempdir;
    use indoc::indoc;

    #[test]
    fn default_config_is_valid() {
        let default_config = DroverConfig::make_default_config()
            .build()
            .expect("default config is always valid");

        let mut unknown = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            unknown.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(default_config, &mut cb);
        let deserialized: DroverConfigDeserialize =
            serde_path_to_error::deserialize(ignored_de).expect("default config is always valid");

        // Make sure there aren't any unknown keys in the default config,
        // since it is embedded/shipped with this binary.
        assert!(
            unknown.is_empty(),
            "found unknown keys in default config: {unknown:?}"
        );

        let impl_ = deserialized.into_config_impl();
        assert_eq!(impl_.default_profile().overrides().len(), 0);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let workspace_dir = tempdir().unwrap();
        // No .config/drover.toml is written.
        let config = DroverConfig::from_sources(workspace_dir.path().to_path_buf(), None)
            .expect("missing config file is fine");
        let profile = config.profile(DroverConfig::DEFAULT_PROFILE).unwrap();

        assert_eq!(profile.retries(), RetryPolicy::new_without_delay(0));
        assert_eq!(profile.threads_required(), ThreadsRequired::Count(1));
        assert_eq!(profile.max_fail(), MaxFail::All);
        assert_eq!(profile.failure_output(), TestOutputDisplay::Immediate);
    }

    #[test]
    fn unknown_profile_errors_and_lists_known_profiles() {
        let config_contents = indoc! {r#"
            [profile.ci]
            retries = 2
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();

        let err = config.profile("nightly").expect_err("profile is unknown");
        let message = err.to_string();
        assert!(message.contains("nightly"), "message: {message}");
        assert!(message.contains("ci"), "message: {message}");
        assert!(message.contains("default"), "message: {message}");
    }

    #[test]
    fn custom_profile_falls_back_to_default_profile() {
        let config_contents = indoc! {r#"
            [profile.default]
            retries = 2
            slow-timeout = { period = "30s" }

            [profile.ci]
            retries = 5
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();
        let ci = config.profile("ci").unwrap();

        // Set in the ci profile.
        assert_eq!(ci.retries(), RetryPolicy::new_without_delay(5));
        // Set in the default profile only.
        assert_eq!(
            ci.slow_timeout().period,
            std::time::Duration::from_secs(30)
        );
        // Set in neither: comes from the embedded defaults.
        assert_eq!(ci.failure_output(), TestOutputDisplay::Immediate);
    }

    #[test]
    fn unknown_top_level_key_fails_load() {
        let config_contents = indoc! {r#"
            [profile.default]
            retrees = 2
        "#};

        let workspace_dir = tempdir().unwrap();
        let err = load_config(&workspace_dir, config_contents).expect_err("load fails");
        match err.kind() {
            ConfigParseErrorKind::UnknownConfigKeys { keys } => {
                assert!(
                    keys.iter().any(|k| k.contains("retrees")),
                    "unexpected keys: {keys:?}"
                );
            }
            other => panic!("expected UnknownConfigKeys, got {other:?}"),
        }
    }
}
