// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time-related utilities for the runner.

mod stopwatch;

pub(crate) use stopwatch::*;
