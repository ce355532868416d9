// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::MaxFailParseError;
use serde::Deserialize;
use std::{cmp::Ordering, fmt, str::FromStr};

/// Type for the fail-fast config key.
///
/// Once this many tests have a non-pass final status, no new tests are
/// admitted; tests already running are allowed to drain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MaxFail {
    /// Allow a specific number of tests to fail before stopping the run.
    Count(usize),

    /// Run all tests. Equivalent to `fail-fast = false`.
    All,
}

impl MaxFail {
    /// Returns the max-fail corresponding to the fail-fast setting.
    pub fn from_fail_fast(fail_fast: bool) -> Self {
        if fail_fast {
            Self::Count(1)
        } else {
            Self::All
        }
    }

    /// Returns true if the max-fail has been exceeded.
    pub fn is_exceeded(&self, failed: usize) -> bool {
        match self {
            Self::Count(n) => failed >= *n,
            Self::All => false,
        }
    }
}

impl FromStr for MaxFail {
    type Err = MaxFailParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.to_lowercase() == "all" {
            return Ok(Self::All);
        }

        match s.parse::<isize>() {
            Err(e) => Err(MaxFailParseError::new(format!("Error: {e} parsing {s}"))),
            Ok(j) if j <= 0 => Err(MaxFailParseError::new("max-fail may not be <= 0")),
            Ok(j) => Ok(MaxFail::Count(j as usize)),
        }
    }
}

impl fmt::Display for MaxFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Count(n) => write!(f, "{n}"),
        }
    }
}

/// Deserializes the `fail-fast` key: either a boolean or a positive integer
/// max-fail count.
pub(crate) fn deserialize_fail_fast<'de, D>(deserializer: D) -> Result<Option<MaxFail>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;

    impl serde::de::Visitor<'_> for V {
        type Value = Option<MaxFail>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a boolean or a positive integer")
        }

        fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(MaxFail::from_fail_fast(v)))
        }

        // Note that TOML uses i64, not u64.
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            match v.cmp(&0) {
                Ordering::Greater => Ok(Some(MaxFail::Count(v as usize))),
                Ordering::Equal | Ordering::Less => Err(serde::de::Error::invalid_value(
                    serde::de::Unexpected::Signed(v),
                    &self,
                )),
            }
        }
    }

    deserializer.deserialize_any(V)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_helpers::*, DroverConfig};
    use camino_tempfile::tempdir;
    use indoc::indoc;
    use test_case::test_case;

    #[test]
    fn maxfail_from_str() {
        let successes = [
            ("all", MaxFail::All),
            ("ALL", MaxFail::All),
            ("1", MaxFail::Count(1)),
        ];
        let failures = ["-1", "0", "foo"];

        for (input, output) in successes {
            assert_eq!(
                MaxFail::from_str(input).unwrap_or_else(|err| panic!(
                    "expected input '{input}' to succeed, failed with: {err}"
                )),
                output,
            );
        }
        for input in failures {
            MaxFail::from_str(input)
                .expect_err(&format!("expected input '{input}' to fail"));
        }
    }

    #[test]
    fn maxfail_exceeded() {
        assert!(!MaxFail::All.is_exceeded(1000));
        assert!(!MaxFail::Count(2).is_exceeded(1));
        assert!(MaxFail::Count(2).is_exceeded(2));
        assert!(MaxFail::Count(2).is_exceeded(3));
    }

    #[test_case(
        indoc! {r#"
            [profile.custom]
            fail-fast = true
        "#},
        Some(MaxFail::Count(1))

        ; "true means stop after the first failure"
    )]
    #[test_case(
        indoc! {r#"
            [profile.custom]
            fail-fast = false
        "#},
        Some(MaxFail::All)

        ; "false means run everything"
    )]
    #[test_case(
        indoc! {r#"
            [profile.custom]
            fail-fast = 3
        "#},
        Some(MaxFail::Count(3))

        ; "integer max-fail"
    )]
    #[test_case(
        indoc! {r#"
            [profile.custom]
            fail-fast = 0
        "#},
        None

        ; "zero is invalid"
    )]
    fn parse_fail_fast(config_contents: &str, expected: Option<MaxFail>) {
        let workspace_dir = tempdir().unwrap();
        let config = load_config(&workspace_dir, config_contents);
        match expected {
            None => assert!(config.is_err()),
            Some(max_fail) => {
                let config = config.unwrap();
                assert_eq!(config.profile("custom").unwrap().max_fail(), max_fail);
                // The default profile is unaffected.
                assert_eq!(
                    config
                        .profile(DroverConfig::DEFAULT_PROFILE)
                        .unwrap()
                        .max_fail(),
                    MaxFail::All,
                );
            }
        }
    }
}
