// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced while parsing filtersets.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

/// An error that occurred while parsing a filterset.
///
/// Contains all the errors found in the input, not just the first one: the
/// parser recovers and keeps going so that every problem can be reported at
/// once.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct FiltersetParseErrors {
    /// The input string.
    pub input: String,

    /// The parse errors returned.
    pub errors: Vec<ParseSingleError>,
}

impl FiltersetParseErrors {
    pub(crate) fn new(input: impl Into<String>, errors: Vec<ParseSingleError>) -> Self {
        Self {
            input: input.into(),
            errors,
        }
    }
}

/// A single error that occurred while parsing a filterset.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq)]
#[non_exhaustive]
pub enum ParseSingleError {
    /// An invalid regex was encountered.
    #[error("invalid regex")]
    InvalidRegex {
        /// The part of the input that failed.
        #[label("{}", message)]
        span: SourceSpan,

        /// A message indicating the failure.
        message: String,
    },

    /// An invalid regex was encountered but we couldn't determine a better
    /// error message.
    #[error("invalid regex")]
    InvalidRegexWithoutMessage(#[label("invalid regex")] SourceSpan),

    /// A regex string was not closed.
    #[error("expected close regex")]
    ExpectedCloseRegex(#[label("missing '/'")] SourceSpan),

    /// An invalid matcher string was encountered.
    #[error("invalid string")]
    InvalidString(#[label("invalid string")] SourceSpan),

    /// An invalid escape character was encountered.
    #[error("invalid escape character")]
    InvalidEscapeCharacter(#[label("invalid escape character")] SourceSpan),

    /// An open parenthesis `(` was expected but not found.
    #[error("expected open parenthesis")]
    ExpectedOpenParenthesis(#[label("missing '('")] SourceSpan),

    /// A close parenthesis `)` was expected but not found.
    #[error("expected close parenthesis")]
    ExpectedCloseParenthesis(#[label("missing ')'")] SourceSpan),

    /// An expression was expected in this position but not found.
    #[error("expected filtering expression")]
    ExpectedExpr(#[label("missing expression")] SourceSpan),

    /// The expression was expected to end here but some extra input was found.
    #[error("expected end of expression")]
    ExpectedEndOfExpression(#[label("unparsed input")] SourceSpan),

    /// This set doesn't take an argument.
    #[error("unexpected argument")]
    UnexpectedArgument(#[label("this set doesn't take an argument")] SourceSpan),

    /// An unexpected comma was encountered.
    #[error("unexpected comma")]
    UnexpectedComma(#[label("filtersets don't allow comma-separated arguments")] SourceSpan),

    /// An invalid OR operator was encountered.
    #[error("invalid OR operator")]
    InvalidOrOperator(#[label("filtersets use 'or' or '|', not '||'")] SourceSpan),

    /// An invalid AND operator was encountered.
    #[error("invalid AND operator")]
    InvalidAndOperator(#[label("filtersets use 'and' or '&', not '&&'")] SourceSpan),

    /// An unknown parsing error occurred.
    #[error("unknown parsing error")]
    Unknown,
}

impl ParseSingleError {
    pub(crate) fn invalid_regex(input: &str, start: usize, end: usize) -> Self {
        // Use regex-syntax to parse the input so that we get better error messages.
        match regex_syntax::Parser::new().parse(input) {
            Ok(_) => {
                // It is weird that a regex failed to parse with regex but succeeded with
                // regex-syntax, but we can't do better.
                Self::InvalidRegexWithoutMessage((start, end - start).into())
            }
            Err(err) => {
                let (message, span) = match &err {
                    regex_syntax::Error::Parse(err) => (format!("{}", err.kind()), err.span()),
                    regex_syntax::Error::Translate(err) => (format!("{}", err.kind()), err.span()),
                    _ => return Self::InvalidRegexWithoutMessage((start, end - start).into()),
                };

                // This isn't perfect because it doesn't account for "\/", but it'll do for now.
                let err_start = start + span.start.offset;
                let err_end = start + span.end.offset;

                Self::InvalidRegex {
                    span: (err_start, err_end - err_start).into(),
                    message,
                }
            }
        }
    }
}

/// Parser state threaded through the input, collecting errors as they are
/// encountered.
#[derive(Debug)]
pub(crate) struct State<'a> {
    errors: &'a mut Vec<ParseSingleError>,
}

impl<'a> State<'a> {
    pub(crate) fn new(errors: &'a mut Vec<ParseSingleError>) -> Self {
        Self { errors }
    }

    pub(crate) fn report_error(&mut self, error: ParseSingleError) {
        self.errors.push(error);
    }
}
