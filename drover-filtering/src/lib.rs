// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logic for parsing and evaluating the filter expressions used by drover
//! profile overrides.
//!
//! A filterset such as `test(estimator) and package(=runtime)` selects the
//! tests an override applies to. Expressions are parsed once when a profile
//! is loaded and evaluated as a typed AST afterwards.

pub mod errors;
mod expression;
mod parsing;

pub use expression::{Filterset, FiltersetLeaf, NameMatcher, TestQuery};
pub use parsing::{AndOperator, NotOperator, OrOperator, ParsedExpr};
