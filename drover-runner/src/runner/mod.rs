// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`], which schedules tests
//! into a bounded pool of concurrency slots and supervises each of them under
//! its resolved policy.

mod dispatcher;
mod executor;
mod imp;
mod internal_events;
mod os;

pub use imp::*;

use dispatcher::*;
use executor::*;
use internal_events::*;
use os::*;
