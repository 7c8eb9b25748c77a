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

//! Error plumbing shared by all the modules.

/// Text substituted in rendered output for anything that could not be decoded or evaluated.
pub const FAILED_TO_PARSE: &str = "[FAILED TO PARSE]";

/// Implement `From<$src> for $dst` by boxing the converted source error in `$dst::$variant`.
///
/// Most errors nest other error types. Boxing them keeps the size of the enums small so that
/// `Result<T, E>` stays cheap on the hot decoding paths.
macro_rules! convert_err_impl {
    ($src:path => $dst:ident :: $variant:ident) => {
        impl From<$src> for $dst {
            #[inline]
            fn from(err: $src) -> Self {
                $dst::$variant(Box::new(err.into()))
            }
        }
    };
}
pub(crate) use convert_err_impl;
