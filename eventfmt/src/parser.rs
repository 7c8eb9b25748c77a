// SPDX-License-Identifier: Apache-2.0
//
// Copyright (C) 2024, ARM Limited and contributors.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may
// not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parsing-related utilities shared by the format, declaration and print fmt grammars.

use core::{
    fmt::{Debug, Display, Formatter},
    ops::Range,
};
use std::string::String as StdString;

use nom::{
    AsChar as _, Finish as _, Parser,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, recognize, verify},
    error::{ContextError, ErrorKind, FromExternalError, ParseError},
    sequence::{delimited, pair},
};
use nom_language::error::{VerboseError, VerboseErrorKind, convert_error};

/// nom error type used by all the grammars of this crate.
pub type VerboseNomError<'i> = VerboseError<&'i [u8]>;

/// Result of a parser working on a byte slice and reporting `T` semantic errors.
pub type PResult<'i, O, T> = nom::IResult<&'i [u8], O, NomError<T, VerboseNomError<'i>>>;

/// Build a user-facing error from a plain nom parse error.
pub trait FromParseError<I, E>: Sized {
    fn from_parse_error(input: I, err: &E) -> Self;
}

/// Parse error including a backtrace of nested [VerboseErrorKind] along with their location in
/// the input.
#[derive(Clone, PartialEq, Eq)]
pub struct VerboseParseError {
    input: StdString,
    errors: Vec<(Range<usize>, VerboseErrorKind)>,
}

impl VerboseParseError {
    pub fn new<I: AsRef<[u8]>>(input: I, err: &VerboseNomError<'_>) -> Self {
        let input = input.as_ref();
        let base = input.as_ptr() as usize;
        let errors = err
            .errors
            .iter()
            .filter_map(|(s, kind)| {
                // Only keep locations that are part of the reported input.
                let start = (s.as_ptr() as usize).checked_sub(base)?;
                let end = start + s.len();
                (end <= input.len()).then(|| (start..end, kind.clone()))
            })
            .collect();

        VerboseParseError {
            input: StdString::from_utf8_lossy(input).into_owned(),
            errors,
        }
    }
}

impl Debug for VerboseParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "VerboseParseError {{{self}}}")
    }
}

/// Display the parse error with its "context backtrace".
impl Display for VerboseParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        let input = self.input.as_str();
        let mut seen_context = false;
        let errors: Vec<_> = self
            .errors
            .iter()
            // Keep the leaf-most levels up to the first context, then only the levels with a
            // context.
            .filter(|(_, kind)| match kind {
                VerboseErrorKind::Context(..) => {
                    seen_context = true;
                    true
                }
                _ => !seen_context,
            })
            // Lossy UTF-8 decoding can shift byte offsets, ignore the ranges that do not map
            // to valid substrings anymore.
            .filter_map(|(range, kind)| Some((input.get(range.clone())?, kind.clone())))
            .collect();

        if errors.is_empty() {
            write!(f, "error while parsing: {input:?}")
        } else {
            let inner = VerboseError { errors };
            write!(
                f,
                "error while parsing:\n{input}\n{}",
                convert_error(input, inner)
            )
        }
    }
}

/// Tie together a nom error and some user-defined error data.
#[derive(Debug)]
pub struct NomError<T, E> {
    /// User-defined data.
    pub data: Option<T>,
    /// nom error, such as [VerboseError]
    pub inner: E,
}

impl<I, T, E> ParseError<I> for NomError<T, E>
where
    I: Clone,
    E: ParseError<I>,
{
    #[inline]
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        NomError {
            data: None,
            inner: E::from_error_kind(input, kind),
        }
    }

    #[inline]
    fn from_char(input: I, c: char) -> Self {
        NomError {
            data: None,
            inner: E::from_char(input, c),
        }
    }

    #[inline]
    fn append(input: I, kind: ErrorKind, other: Self) -> Self {
        NomError {
            inner: E::append(input, kind, other.inner),
            data: other.data,
        }
    }

    #[inline]
    fn or(self, other: Self) -> Self {
        NomError {
            data: other.data.or(self.data),
            inner: self.inner.or(other.inner),
        }
    }
}

impl<I, T, E> FromExternalError<I, T> for NomError<T, E>
where
    E: ParseError<I>,
{
    #[inline]
    fn from_external_error(input: I, kind: ErrorKind, e: T) -> Self {
        NomError {
            data: Some(e),
            inner: E::from_error_kind(input, kind),
        }
    }
}

impl<I, T, E> ContextError<I> for NomError<T, E>
where
    E: ContextError<I>,
{
    #[inline]
    fn add_context(input: I, ctx: &'static str, other: Self) -> Self {
        NomError {
            data: other.data,
            inner: E::add_context(input, ctx, other.inner),
        }
    }
}

/// Extend [nom::Parser] with some methods.
pub trait NomParserExt<'i, O, T>: Parser<&'i [u8], Output = O, Error = NomError<T, VerboseNomError<'i>>>
where
    T: FromParseError<&'i [u8], VerboseNomError<'i>>,
{
    /// Parse the input and return a simple [Result].
    ///
    /// The parser is expected to consume all input, otherwise an error is returned.
    #[inline]
    fn parse_finish(&mut self, input: &'i [u8]) -> Result<O, T> {
        let mut parser = all_consuming(|input| self.parse(input));
        match parser.parse(input).finish() {
            Ok((_, x)) => Ok(x),
            Err(err) => match err.data {
                Some(data) => Err(data),
                None => Err(T::from_parse_error(input, &err.inner)),
            },
        }
    }
}

impl<'i, O, T, P> NomParserExt<'i, O, T> for P
where
    P: Parser<&'i [u8], Output = O, Error = NomError<T, VerboseNomError<'i>>>,
    T: FromParseError<&'i [u8], VerboseNomError<'i>>,
{
}

#[inline]
pub fn to_str(s: &[u8]) -> StdString {
    StdString::from_utf8_lossy(s).into_owned()
}

/// Wraps a [nom::Parser] to parse optional whitespaces before and after.
pub fn lexeme<'i, O, E, P>(inner: P) -> impl Parser<&'i [u8], Output = O, Error = E>
where
    E: ParseError<&'i [u8]>,
    P: Parser<&'i [u8], Output = O, Error = E>,
{
    delimited(multispace0, inner, multispace0)
}

/// Wraps a [nom::Parser] to parse parenthesis around it.
pub fn parenthesized<'i, O, E, P>(parser: P) -> impl Parser<&'i [u8], Output = O, Error = E>
where
    E: ParseError<&'i [u8]>,
    P: Parser<&'i [u8], Output = O, Error = E>,
{
    delimited(lexeme(char('(')), parser, lexeme(char(')')))
}

/// Parse a C identifier.
pub fn identifier<'i, E>(input: &'i [u8]) -> nom::IResult<&'i [u8], &'i [u8], E>
where
    E: ParseError<&'i [u8]>,
{
    recognize(pair(
        take_while1(|c: u8| c.is_alpha() || c == b'_'),
        take_while(|c: u8| c.is_alphanum() || c == b'_'),
    ))
    .parse(input)
}

/// Parse the C identifier `kw`, and nothing longer than that, e.g. `int` will not match `integer`.
pub fn keyword<'i, E>(kw: &'static str) -> impl Parser<&'i [u8], Output = &'i [u8], Error = E>
where
    E: ParseError<&'i [u8]>,
{
    verify(identifier, move |id: &[u8]| id == kw.as_bytes())
}

/// Similar to [nom::combinator::map_res] but does not backtrack in case `f` returns an error.
///
/// The grammars are non-ambiguous at the places this is used, so a semantic error must be
/// reported as-is instead of letting an `alt()` try the next branch and report a confusing
/// syntax error.
pub fn map_res_cut<I: Clone, O1, O2, E, E2, F, G>(
    mut parser: F,
    mut f: G,
) -> impl Parser<I, Output = O2, Error = E>
where
    F: Parser<I, Output = O1, Error = E>,
    G: FnMut(O1) -> Result<O2, E2>,
    E: ParseError<I> + FromExternalError<I, E2>,
{
    move |input: I| {
        let i = input.clone();
        let (input, x) = parser.parse(input)?;
        match f(x) {
            Ok(x) => Ok((input, x)),
            Err(err) => Err(nom::Err::Failure(E::from_external_error(
                i,
                ErrorKind::MapRes,
                err,
            ))),
        }
    }
}

/// Craft an [nom::IResult] failure from the given error and input.
#[inline]
pub fn failure<I, O, E, E2>(input: I, err: E) -> nom::IResult<I, O, E2>
where
    E2: FromExternalError<I, E>,
{
    Err(nom::Err::Failure(E2::from_external_error(
        input,
        ErrorKind::Fail,
        err,
    )))
}
