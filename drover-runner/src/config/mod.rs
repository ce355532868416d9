// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for drover.
//!
//! Profiles are defined in `.config/drover.toml`, layered over an embedded
//! default config. Each profile carries a fully populated base policy plus an
//! ordered list of filter-scoped overrides; see
//! [`EvaluatableProfile::settings_for`] for how the effective policy for a
//! single test is resolved.

mod imp;
mod max_fail;
mod overrides;
mod retry_policy;
mod slow_timeout;
#[cfg(test)]
mod test_helpers;
mod test_threads;
mod threads_required;

pub use imp::{get_num_cpus, DroverConfig, EvaluatableProfile};
pub use max_fail::MaxFail;
pub use overrides::TestSettings;
pub use retry_policy::RetryPolicy;
pub use slow_timeout::SlowTimeout;
pub use test_threads::TestThreads;
pub use threads_required::ThreadsRequired;

pub(crate) use imp::DroverConfigImpl;
pub(crate) use max_fail::deserialize_fail_fast;
pub(crate) use overrides::{CompiledByProfile, CompiledData, DeserializedOverride};
pub(crate) use retry_policy::deserialize_retry_policy;
pub(crate) use slow_timeout::deserialize_slow_timeout;
