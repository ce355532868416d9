// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{
        deserialize_retry_policy, deserialize_slow_timeout, DroverConfigImpl, EvaluatableProfile,
        RetryPolicy, SlowTimeout, ThreadsRequired,
    },
    errors::{ConfigParseErrorKind, InvalidFilterError},
    reporter::TestOutputDisplay,
};
use drover_filtering::{Filterset, TestQuery};
use serde::Deserialize;
use std::collections::HashMap;

/// Settings for an individual test: its fully resolved policy.
///
/// Returned by [`EvaluatableProfile::settings_for`]. Every field is
/// populated; fields not set by a matching override fall back to the
/// profile.
#[derive(Clone, Debug)]
pub struct TestSettings {
    threads_required: ThreadsRequired,
    retries: RetryPolicy,
    slow_timeout: SlowTimeout,
    failure_output: TestOutputDisplay,
}

impl TestSettings {
    /// Returns the number of slots required for this test.
    pub fn threads_required(&self) -> ThreadsRequired {
        self.threads_required
    }

    /// Returns the retry policy for this test.
    pub fn retries(&self) -> RetryPolicy {
        self.retries
    }

    /// Returns the slow timeout for this test.
    pub fn slow_timeout(&self) -> SlowTimeout {
        self.slow_timeout
    }

    /// Returns the failure output setting for this test.
    pub fn failure_output(&self) -> TestOutputDisplay {
        self.failure_output
    }

    pub(crate) fn new(profile: &EvaluatableProfile<'_>, query: &TestQuery<'_>) -> Self {
        let mut threads_required = None;
        let mut retries = None;
        let mut slow_timeout = None;
        let mut failure_output = None;

        // Overrides are merged field by field, in declaration order, with
        // later-declared matching overrides winning for any field they set.
        // (The compiled list places the default profile's overrides before
        // the selected profile's own, so the selected profile wins ties.)
        for override_ in &profile.compiled_data().overrides {
            if let Some(filter) = &override_.filter {
                if !filter.matches(query) {
                    continue;
                }
                // If no filterset is specified, this override matches all tests.
            }
            if let Some(t) = override_.data.threads_required {
                threads_required = Some(t);
            }
            if let Some(r) = override_.data.retries {
                retries = Some(r);
            }
            if let Some(s) = override_.data.slow_timeout {
                slow_timeout = Some(s);
            }
            if let Some(f) = override_.data.failure_output {
                failure_output = Some(f);
            }
        }

        // If no overrides were found, use the profile defaults.
        let threads_required = threads_required.unwrap_or_else(|| profile.threads_required());
        let retries = retries.unwrap_or_else(|| profile.retries());
        let slow_timeout = slow_timeout.unwrap_or_else(|| profile.slow_timeout());
        let failure_output = failure_output.unwrap_or_else(|| profile.failure_output());

        TestSettings {
            threads_required,
            retries,
            slow_timeout,
            failure_output,
        }
    }
}

/// Compiled override data for every profile in a config.
#[derive(Clone, Debug, Default)]
pub(crate) struct CompiledByProfile {
    pub(crate) default: CompiledData,
    pub(crate) other: HashMap<String, CompiledData>,
}

impl CompiledByProfile {
    pub(crate) fn new(config: &DroverConfigImpl) -> Result<Self, ConfigParseErrorKind> {
        let mut errors = vec![];
        let default = CompiledData::new(
            "default",
            config.default_profile().overrides(),
            &mut errors,
        );
        let other: HashMap<_, _> = config
            .other_profiles()
            .map(|(profile_name, profile)| {
                (
                    profile_name.to_owned(),
                    CompiledData::new(profile_name, profile.overrides(), &mut errors),
                )
            })
            .collect();

        if errors.is_empty() {
            Ok(Self { default, other })
        } else {
            Err(ConfigParseErrorKind::InvalidFilter(errors))
        }
    }
}

/// Compiled override data for a single profile.
#[derive(Clone, Debug, Default)]
pub(crate) struct CompiledData {
    pub(crate) overrides: Vec<CompiledOverride>,
}

impl CompiledData {
    fn new(
        profile_name: &str,
        overrides: &[DeserializedOverride],
        errors: &mut Vec<InvalidFilterError>,
    ) -> Self {
        let overrides = overrides
            .iter()
            .enumerate()
            .filter_map(|(index, source)| {
                CompiledOverride::new(profile_name, index, source, errors)
            })
            .collect();
        Self { overrides }
    }

    /// Appends `other`'s overrides after `self`'s. Since resolution is
    /// last-match-wins, `other` takes precedence.
    pub(crate) fn chain(mut self, other: Self) -> Self {
        self.overrides.extend(other.overrides);
        self
    }
}

/// A single override, with its filterset parsed.
#[derive(Clone, Debug)]
pub(crate) struct CompiledOverride {
    pub(crate) filter: Option<Filterset>,
    pub(crate) data: ProfileOverrideData,
}

impl CompiledOverride {
    fn new(
        profile_name: &str,
        index: usize,
        source: &DeserializedOverride,
        errors: &mut Vec<InvalidFilterError>,
    ) -> Option<Self> {
        let filter = match &source.filter {
            Some(input) => match Filterset::parse(input) {
                Ok(filter) => Some(filter),
                Err(parse_errors) => {
                    errors.push(InvalidFilterError {
                        profile_name: profile_name.to_owned(),
                        index,
                        errors: parse_errors,
                    });
                    return None;
                }
            },
            None => None,
        };

        Some(Self {
            filter,
            data: ProfileOverrideData {
                threads_required: source.threads_required,
                retries: source.retries,
                slow_timeout: source.slow_timeout,
                failure_output: source.failure_output,
            },
        })
    }
}

/// The sparse policy patch carried by an override.
#[derive(Clone, Debug)]
pub(crate) struct ProfileOverrideData {
    pub(crate) threads_required: Option<ThreadsRequired>,
    pub(crate) retries: Option<RetryPolicy>,
    pub(crate) slow_timeout: Option<SlowTimeout>,
    pub(crate) failure_output: Option<TestOutputDisplay>,
}

/// An override as deserialized from the config file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct DeserializedOverride {
    /// The filterset that selects the tests this override applies to.
    /// Omitted = applies to every test.
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    threads_required: Option<ThreadsRequired>,
    #[serde(default, deserialize_with = "deserialize_retry_policy")]
    retries: Option<RetryPolicy>,
    #[serde(default, deserialize_with = "deserialize_slow_timeout")]
    slow_timeout: Option<SlowTimeout>,
    #[serde(default)]
    failure_output: Option<TestOutputDisplay>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_helpers::*;
    use camino_tempfile::tempdir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::{collections::BTreeSet, num::NonZeroUsize, time::Duration};

    #[test]
    fn last_matching_override_wins_field_by_field() {
        let config_contents = indoc! {r#"
            [[profile.default.overrides]]
            filter = "test(my_test)"
            slow-timeout = { period = "120s" }
            retries = 1

            [[profile.default.overrides]]
            filter = "test(=my_test)"
            retries = 5
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();
        let profile = config.profile("default").unwrap();

        let tags = BTreeSet::new();
        let query = TestQuery {
            package_name: "my-package",
            test_name: "my_test",
            tags: &tags,
        };
        let settings = profile.settings_for(&query);

        // Both overrides match: the later one wins for retries, the earlier
        // one still supplies slow-timeout, and unset fields come from the
        // profile.
        assert_eq!(settings.retries(), RetryPolicy::new_without_delay(5));
        assert_eq!(settings.slow_timeout().period, Duration::from_secs(120));
        assert_eq!(settings.threads_required().compute(8), 1);
    }

    #[test]
    fn estimator_scenario_resolves_all_fields() {
        // A profile shaped like the one that drove this engine's design:
        // fixed retries with a delay, plus an override for one long-running
        // test.
        let config_contents = indoc! {r#"
            [profile.default]
            retries = { backoff = "fixed", count = 3, delay = "1s" }

            [[profile.default.overrides]]
            filter = "test(test_full_estimator)"
            slow-timeout = { period = "10m", terminate-after = 3 }
            threads-required = 4
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();
        let profile = config.profile("default").unwrap();

        let tags = BTreeSet::new();
        let query = TestQuery {
            package_name: "estimator",
            test_name: "test_full_estimator",
            tags: &tags,
        };
        let settings = profile.settings_for(&query);

        assert_eq!(settings.threads_required(), ThreadsRequired::Count(4));
        assert_eq!(settings.slow_timeout().period, Duration::from_secs(600));
        assert_eq!(
            settings.slow_timeout().terminate_after,
            Some(NonZeroUsize::new(3).unwrap())
        );
        // Retries are inherited from the profile.
        assert_eq!(
            settings.retries(),
            RetryPolicy::Fixed {
                count: 3,
                delay: Duration::from_secs(1),
                jitter: false,
            }
        );

        // A test the override doesn't match inherits everything.
        let other_query = TestQuery {
            package_name: "estimator",
            test_name: "test_costs",
            tags: &tags,
        };
        let other_settings = profile.settings_for(&other_query);
        assert_eq!(other_settings.threads_required(), ThreadsRequired::Count(1));
        assert_eq!(
            other_settings.slow_timeout().period,
            Duration::from_secs(60)
        );
        assert_eq!(other_settings.slow_timeout().terminate_after, None);
    }

    #[test]
    fn no_matching_override_inherits_base() {
        let config_contents = indoc! {r#"
            [profile.default]
            retries = 2
            slow-timeout = { period = "45s", terminate-after = 2, grace-period = "5s" }
            threads-required = 2
            failure-output = "final"

            [[profile.default.overrides]]
            filter = "package(some-other-package)"
            retries = 9
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();
        let profile = config.profile("default").unwrap();

        let tags = BTreeSet::new();
        let query = TestQuery {
            package_name: "my-package",
            test_name: "my_test",
            tags: &tags,
        };
        let settings = profile.settings_for(&query);

        assert_eq!(settings.retries(), RetryPolicy::new_without_delay(2));
        assert_eq!(settings.slow_timeout().period, Duration::from_secs(45));
        assert_eq!(
            settings.slow_timeout().terminate_after,
            Some(NonZeroUsize::new(2).unwrap())
        );
        assert_eq!(settings.slow_timeout().grace_period, Duration::from_secs(5));
        assert_eq!(settings.threads_required(), ThreadsRequired::Count(2));
        assert_eq!(settings.failure_output(), TestOutputDisplay::Final);
    }

    #[test]
    fn profile_overrides_win_over_default_profile_overrides() {
        let config_contents = indoc! {r#"
            [[profile.default.overrides]]
            filter = "test(shared)"
            retries = 2

            [profile.ci]

            [[profile.ci.overrides]]
            filter = "test(shared)"
            retries = 4
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();

        let tags = BTreeSet::new();
        let query = TestQuery {
            package_name: "p",
            test_name: "test_shared",
            tags: &tags,
        };

        let ci = config.profile("ci").unwrap();
        assert_eq!(
            ci.settings_for(&query).retries(),
            RetryPolicy::new_without_delay(4)
        );

        // The default profile only sees its own overrides.
        let default = config.profile("default").unwrap();
        assert_eq!(
            default.settings_for(&query).retries(),
            RetryPolicy::new_without_delay(2)
        );
    }

    #[test]
    fn filterless_override_applies_to_all_tests() {
        let config_contents = indoc! {r#"
            [[profile.default.overrides]]
            failure-output = "never"
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();
        let profile = config.profile("default").unwrap();

        let tags = BTreeSet::new();
        let query = TestQuery {
            package_name: "anything",
            test_name: "test_anything",
            tags: &tags,
        };
        assert_eq!(
            profile.settings_for(&query).failure_output(),
            TestOutputDisplay::Never
        );
    }

    #[test]
    fn tag_override_applies_by_tag() {
        let config_contents = indoc! {r#"
            [[profile.default.overrides]]
            filter = "tag(heavy)"
            threads-required = "num-cpus"
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();
        let profile = config.profile("default").unwrap();

        let heavy: BTreeSet<String> = ["heavy".to_owned()].into_iter().collect();
        let light = BTreeSet::new();

        let heavy_query = TestQuery {
            package_name: "p",
            test_name: "test_big",
            tags: &heavy,
        };
        let light_query = TestQuery {
            package_name: "p",
            test_name: "test_big",
            tags: &light,
        };

        assert_eq!(
            profile.settings_for(&heavy_query).threads_required(),
            ThreadsRequired::NumCpus
        );
        assert_eq!(
            profile.settings_for(&light_query).threads_required(),
            ThreadsRequired::Count(1)
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let config_contents = indoc! {r#"
            [profile.default]
            retries = 1

            [[profile.default.overrides]]
            filter = "test(a) or test(b)"
            retries = 3
        "#};

        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents).unwrap();
        let profile = config.profile("default").unwrap();

        let tags = BTreeSet::new();
        let query = TestQuery {
            package_name: "p",
            test_name: "test_a",
            tags: &tags,
        };

        let first = profile.settings_for(&query);
        for _ in 0..16 {
            let settings = profile.settings_for(&query);
            assert_eq!(settings.retries(), first.retries());
            assert_eq!(settings.threads_required(), first.threads_required());
            assert_eq!(settings.slow_timeout(), first.slow_timeout());
            assert_eq!(settings.failure_output(), first.failure_output());
        }
    }

    #[test]
    fn invalid_filter_fails_load() {
        let config_contents = indoc! {r#"
            [[profile.default.overrides]]
            filter = "test(foo"
            retries = 2
        "#};

        let workspace_dir = tempdir().unwrap();
        let err = load_config(&workspace_dir, config_contents).expect_err("load fails");
        match err.kind() {
            ConfigParseErrorKind::InvalidFilter(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].profile_name, "default");
                assert_eq!(errors[0].index, 0);
                assert!(!errors[0].parse_errors().is_empty());
            }
            other => panic!("expected InvalidFilter, got {other:?}"),
        }
    }

    #[test]
    fn unknown_override_field_fails_load() {
        let config_contents = indoc! {r#"
            [[profile.default.overrides]]
            filter = "test(foo)"
            leak-timeout = "5s"
        "#};

        let workspace_dir = tempdir().unwrap();
        let err = load_config(&workspace_dir, config_contents).expect_err("load fails");
        match err.kind() {
            ConfigParseErrorKind::UnknownConfigKeys { keys } => {
                assert!(
                    keys.iter().any(|k| k.contains("leak-timeout")),
                    "unexpected keys: {keys:?}"
                );
            }
            other => panic!("expected UnknownConfigKeys, got {other:?}"),
        }
    }
}
