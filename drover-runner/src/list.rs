// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The list of tests handed to the scheduler.
//!
//! Test discovery is out of scope for this crate: an external component
//! supplies a [`TestList`] of [`TestCase`]s, each carrying the metadata used
//! for policy resolution (package name, test name, tags) plus the command to
//! execute.

use camino::Utf8PathBuf;
use drover_filtering::TestQuery;
use std::{cmp::Ordering, collections::BTreeSet, fmt};

/// The command to run for a single test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestCommand {
    /// The program to execute.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// The working directory to execute the program in, if any.
    pub cwd: Option<Utf8PathBuf>,

    /// Extra environment variables to set.
    pub env: Vec<(String, String)>,
}

impl TestCommand {
    /// Creates a new command with no arguments, working directory or
    /// environment.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }
}

/// A single test known to the scheduler.
///
/// Created at discovery time and never mutated afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestCase {
    /// The name of the package the test belongs to.
    pub package_name: String,

    /// The name of the test.
    pub name: String,

    /// The tags declared on the test.
    pub tags: BTreeSet<String>,

    /// The command to run the test with.
    pub command: TestCommand,
}

/// List of tests to run, in discovery order.
#[derive(Clone, Debug, Default)]
pub struct TestList {
    test_cases: Vec<TestCase>,
}

impl TestList {
    /// Creates a new test list.
    pub fn new(test_cases: impl IntoIterator<Item = TestCase>) -> Self {
        Self {
            test_cases: test_cases.into_iter().collect(),
        }
    }

    /// Returns the number of tests that will be run.
    pub fn run_count(&self) -> usize {
        self.test_cases.len()
    }

    /// Iterates over the tests in discovery order.
    pub fn iter_tests(&self) -> impl Iterator<Item = TestInstance<'_>> + '_ {
        self.test_cases.iter().map(TestInstance::new)
    }
}

/// Represents a single test during a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TestInstance<'a> {
    /// The name of the test.
    pub name: &'a str,

    /// The name of the package the test belongs to.
    pub package_name: &'a str,

    case: &'a TestCase,
}

impl<'a> TestInstance<'a> {
    fn new(case: &'a TestCase) -> Self {
        Self {
            name: &case.name,
            package_name: &case.package_name,
            case,
        }
    }

    /// Returns the identifier for this test instance.
    pub fn id(&self) -> TestInstanceId<'a> {
        TestInstanceId {
            package_name: self.package_name,
            test_name: self.name,
        }
    }

    /// Returns the query used to resolve settings for this test.
    pub fn to_test_query(&self) -> TestQuery<'a> {
        TestQuery {
            package_name: self.package_name,
            test_name: self.name,
            tags: &self.case.tags,
        }
    }

    /// Creates the command to run this test.
    pub(crate) fn make_command(&self) -> std::process::Command {
        let command = &self.case.command;
        let mut cmd = std::process::Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(command.env.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

/// A unique identifier for a test: the package name plus the test name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TestInstanceId<'a> {
    /// The name of the package the test belongs to.
    pub package_name: &'a str,

    /// The name of the test.
    pub test_name: &'a str,
}

impl Ord for TestInstanceId<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.package_name, self.test_name).cmp(&(other.package_name, other.test_name))
    }
}

impl PartialOrd for TestInstanceId<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TestInstanceId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.package_name, self.test_name)
    }
}
