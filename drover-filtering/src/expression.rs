// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{FiltersetParseErrors, ParseSingleError},
    parsing::{self, new_span, DisplayParsedRegex, DisplayParsedString, ExprResult, ParsedExpr},
};
use miette::SourceSpan;
use std::{collections::BTreeSet, fmt};

/// Matcher for a name.
///
/// Used for test names, package names and tags.
#[derive(Clone, Debug)]
pub enum NameMatcher {
    /// Exact value.
    Equal {
        /// The value to match against.
        value: String,

        /// Whether the value was implicit (no `=` prefix in the input).
        implicit: bool,
    },

    /// Simple contains test.
    Contains {
        /// The value to match against.
        value: String,

        /// Whether the value was implicit (no `~` prefix in the input).
        implicit: bool,
    },

    /// Test against a regex.
    Regex(regex::Regex),
}

impl NameMatcher {
    pub(crate) fn implicit_equal(value: String) -> Self {
        Self::Equal {
            value,
            implicit: true,
        }
    }

    pub(crate) fn implicit_contains(value: String) -> Self {
        Self::Contains {
            value,
            implicit: true,
        }
    }

    pub(crate) fn is_match(&self, input: &str) -> bool {
        match self {
            Self::Equal { value, .. } => value == input,
            Self::Contains { value, .. } => input.contains(value),
            Self::Regex(reg) => reg.is_match(input),
        }
    }
}

impl PartialEq for NameMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Equal {
                    value: v1,
                    implicit: i1,
                },
                Self::Equal {
                    value: v2,
                    implicit: i2,
                },
            ) => v1 == v2 && i1 == i2,
            (
                Self::Contains {
                    value: v1,
                    implicit: i1,
                },
                Self::Contains {
                    value: v2,
                    implicit: i2,
                },
            ) => v1 == v2 && i1 == i2,
            (Self::Regex(r1), Self::Regex(r2)) => r1.as_str() == r2.as_str(),
            _ => false,
        }
    }
}

impl Eq for NameMatcher {}

impl fmt::Display for NameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal { value, implicit } => write!(
                f,
                "{}{}",
                if *implicit { "" } else { "=" },
                DisplayParsedString(value)
            ),
            Self::Contains { value, implicit } => write!(
                f,
                "{}{}",
                if *implicit { "" } else { "~" },
                DisplayParsedString(value)
            ),
            Self::Regex(r) => write!(f, "/{}/", DisplayParsedRegex(r)),
        }
    }
}

/// A leaf set in a filterset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FiltersetLeaf {
    /// All tests matching a name.
    ///
    /// The implicit matcher is *contains*: `test(foo)` selects every test
    /// whose name has `foo` as a substring. Use `test(=foo)` for an exact
    /// match. This is a fixed contract.
    Test(NameMatcher, SourceSpan),

    /// All tests in packages matching a name.
    ///
    /// The implicit matcher is *equality*: `package(foo)` selects tests in
    /// the package named exactly `foo`.
    Package(NameMatcher, SourceSpan),

    /// All tests carrying a tag matching a name.
    ///
    /// The implicit matcher is *equality*.
    Tag(NameMatcher, SourceSpan),

    /// All tests.
    All,

    /// No tests.
    None,
}

impl fmt::Display for FiltersetLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test(matcher, _) => write!(f, "test({matcher})"),
            Self::Package(matcher, _) => write!(f, "package({matcher})"),
            Self::Tag(matcher, _) => write!(f, "tag({matcher})"),
            Self::All => write!(f, "all()"),
            Self::None => write!(f, "none()"),
        }
    }
}

/// A query passed into [`Filterset::matches`]: the metadata of a single test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TestQuery<'a> {
    /// The name of the package the test belongs to.
    pub package_name: &'a str,

    /// The name of the test.
    pub test_name: &'a str,

    /// The tags declared on the test.
    pub tags: &'a BTreeSet<String>,
}

/// A filterset that has been parsed into a typed AST.
///
/// Used to select the tests an override applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filterset {
    /// Accepts every test not in the given expression.
    Not(Box<Filterset>),
    /// Accepts every test in either given expression.
    Union(Box<Filterset>, Box<Filterset>),
    /// Accepts every test in both given expressions.
    Intersection(Box<Filterset>, Box<Filterset>),
    /// Accepts every test in a set.
    Set(FiltersetLeaf),
}

impl FiltersetLeaf {
    fn matches(&self, query: &TestQuery<'_>) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Test(matcher, _) => matcher.is_match(query.test_name),
            Self::Package(matcher, _) => matcher.is_match(query.package_name),
            Self::Tag(matcher, _) => query.tags.iter().any(|tag| matcher.is_match(tag)),
        }
    }
}

impl Filterset {
    /// Parses a filterset, returning every error found in the input on
    /// failure.
    pub fn parse(input: &str) -> Result<Filterset, FiltersetParseErrors> {
        let mut errors = Vec::new();
        match parsing::parse(new_span(input, &mut errors)) {
            Ok(ExprResult::Valid(expr)) => {
                if errors.is_empty() {
                    Ok(compile(expr))
                } else {
                    Err(FiltersetParseErrors::new(input, errors))
                }
            }
            Ok(ExprResult::Error) => Err(FiltersetParseErrors::new(input, errors)),
            Err(_) => {
                // According to our parsing strategy we should never produce an
                // Err(_): recovery pushes an error into the state and returns a
                // valid result instead.
                Err(FiltersetParseErrors::new(
                    input,
                    vec![ParseSingleError::Unknown],
                ))
            }
        }
    }

    /// Returns true if the given test is accepted by this filterset.
    ///
    /// This is a pure function of the filterset and the query: it cannot
    /// fail, and repeated calls with the same inputs return the same answer.
    pub fn matches(&self, query: &TestQuery<'_>) -> bool {
        match self {
            Self::Set(set) => set.matches(query),
            Self::Not(expr) => !expr.matches(query),
            Self::Union(expr_1, expr_2) => expr_1.matches(query) || expr_2.matches(query),
            Self::Intersection(expr_1, expr_2) => expr_1.matches(query) && expr_2.matches(query),
        }
    }
}

/// Lowers a parsed expression into an evaluatable filterset, dropping
/// operator and parenthesization detail.
fn compile(expr: ParsedExpr) -> Filterset {
    match expr {
        ParsedExpr::Not(_, expr) => Filterset::Not(Box::new(compile(*expr))),
        ParsedExpr::Union(_, a, b) => {
            Filterset::Union(Box::new(compile(*a)), Box::new(compile(*b)))
        }
        ParsedExpr::Intersection(_, a, b) => {
            Filterset::Intersection(Box::new(compile(*a)), Box::new(compile(*b)))
        }
        ParsedExpr::Parens(expr) => compile(*expr),
        ParsedExpr::Set(set) => Filterset::Set(set),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn query<'a>(package: &'a str, test: &'a str, tags: &'a BTreeSet<String>) -> TestQuery<'a> {
        TestQuery {
            package_name: package,
            test_name: test,
            tags,
        }
    }

    fn tag_set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test_case("test_full_estimator", true ; "name containing the needle matches")]
    #[test_case("full_estimator", true ; "exact name matches")]
    #[test_case("test_estimator", false ; "name missing the needle does not match")]
    fn test_name_is_substring_match(test_name: &str, matches: bool) {
        let expr = Filterset::parse("test(full_estimator)").unwrap();
        let tags = BTreeSet::new();

        assert_eq!(expr.matches(&query("estimator", test_name, &tags)), matches);
    }

    #[test]
    fn test_name_equal_match_is_exact() {
        let expr = Filterset::parse("test(=full_estimator)").unwrap();
        let tags = BTreeSet::new();

        assert!(expr.matches(&query("estimator", "full_estimator", &tags)));
        assert!(!expr.matches(&query("estimator", "test_full_estimator", &tags)));
    }

    #[test]
    fn package_is_exact_match() {
        let expr = Filterset::parse("package(estimator)").unwrap();
        let tags = BTreeSet::new();

        assert!(expr.matches(&query("estimator", "test_1", &tags)));
        assert!(!expr.matches(&query("estimator-helpers", "test_1", &tags)));

        // Substring package matches require an explicit ~.
        let expr = Filterset::parse("package(~estimator)").unwrap();
        assert!(expr.matches(&query("estimator-helpers", "test_1", &tags)));
    }

    #[test]
    fn tag_matches_any_declared_tag() {
        let expr = Filterset::parse("tag(slow)").unwrap();

        let slow = tag_set(&["db", "slow"]);
        let fast = tag_set(&["db"]);
        let empty = BTreeSet::new();

        assert!(expr.matches(&query("pkg", "test_1", &slow)));
        assert!(!expr.matches(&query("pkg", "test_1", &fast)));
        assert!(!expr.matches(&query("pkg", "test_1", &empty)));
    }

    #[test]
    fn combinators() {
        let tags = BTreeSet::new();
        let expr = Filterset::parse("test(foo) and not package(bar)").unwrap();
        assert!(expr.matches(&query("baz", "test_foo", &tags)));
        assert!(!expr.matches(&query("bar", "test_foo", &tags)));

        let expr = Filterset::parse("package(a) or package(b)").unwrap();
        assert!(expr.matches(&query("a", "t", &tags)));
        assert!(expr.matches(&query("b", "t", &tags)));
        assert!(!expr.matches(&query("c", "t", &tags)));

        let expr = Filterset::parse("(package(a) | package(b)) & test(x)").unwrap();
        assert!(expr.matches(&query("a", "test_x", &tags)));
        assert!(!expr.matches(&query("a", "test_y", &tags)));
    }

    #[test]
    fn all_and_none() {
        let tags = BTreeSet::new();
        assert!(Filterset::parse("all()")
            .unwrap()
            .matches(&query("p", "t", &tags)));
        assert!(!Filterset::parse("none()")
            .unwrap()
            .matches(&query("p", "t", &tags)));
        assert!(Filterset::parse("not none()")
            .unwrap()
            .matches(&query("p", "t", &tags)));
    }

    #[test]
    fn regex_matcher() {
        let tags = BTreeSet::new();
        let expr = Filterset::parse("test(/^test_[0-9]+$/)").unwrap();
        assert!(expr.matches(&query("p", "test_42", &tags)));
        assert!(!expr.matches(&query("p", "test_abc", &tags)));
    }

    #[test]
    fn matches_is_deterministic() {
        let expr = Filterset::parse("test(foo) or tag(slow)").unwrap();
        let tags = tag_set(&["slow"]);
        let q = query("p", "test_bar", &tags);
        let first = expr.matches(&q);
        for _ in 0..16 {
            assert_eq!(expr.matches(&q), first);
        }
    }
}
