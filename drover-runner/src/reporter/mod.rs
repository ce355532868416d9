// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Report the results of a test run: the event stream produced by the runner
//! and the aggregation of those events into a final report.

mod aggregator;
pub mod events;

pub use aggregator::{AttemptReport, FinalStatus, RunAggregator, RunReport, TestReport};
pub use events::TestOutputDisplay;
