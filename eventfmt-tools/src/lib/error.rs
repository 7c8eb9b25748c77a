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

use std::{error::Error, fmt, io};

use eventfmt::{
    event::FormatError,
    print::{PrintError, PrintFmtError},
};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ToolError {
    #[error("Error while loading data: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to parse event: {0}")]
    FormatError(#[from] FormatError),

    #[error("Error while compiling the print fmt: {0}")]
    PrintFmtError(#[from] PrintFmtError),

    #[error("Error while printing record: {0}")]
    PrintError(#[from] PrintError),

    #[error("Invalid long size: {0} bytes, expected 4 or 8")]
    InvalidLongSize(usize),
}

impl From<fmt::Error> for ToolError {
    #[inline]
    fn from(err: fmt::Error) -> Self {
        ToolError::PrintError(err.into())
    }
}

/// Errors collected while processing, reported all at once at the end.
#[derive(Debug)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> Default for MultiError<E> {
    #[inline]
    fn default() -> Self {
        MultiError { errors: Vec::new() }
    }
}

impl<E> MultiError<E> {
    pub fn new<I: IntoIterator<Item = E>>(errors: I) -> Self {
        MultiError {
            errors: errors.into_iter().collect(),
        }
    }

    #[inline]
    pub fn push(&mut self, err: E) {
        self.errors.push(err)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> impl IntoIterator<Item = &E> {
        &self.errors
    }

    /// `Ok(())` if no error was collected.
    pub fn into_result(self) -> Result<(), Self> {
        match self.is_empty() {
            true => Ok(()),
            false => Err(self),
        }
    }
}

impl<E: fmt::Display> MultiError<E> {
    /// JSON report of the errors, as written by `--errors-json`.
    pub fn to_json(&self) -> serde_json::Value {
        let errors: Vec<_> = self.errors.iter().map(ToString::to_string).collect();
        serde_json::json!({
            "errors": errors,
        })
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for err in &self.errors {
            err.fmt(f)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> Error for MultiError<E> {}

macro_rules! multi_error_from {
    ($($src:ty),* $(,)?) => {
        $(
            impl From<$src> for MultiError<ToolError> {
                #[inline]
                fn from(err: $src) -> Self {
                    MultiError::new([err.into()])
                }
            }
        )*
    };
}

multi_error_from!(
    ToolError,
    io::Error,
    fmt::Error,
    FormatError,
    PrintFmtError,
    PrintError,
);
