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

use std::io::Write;

use eventfmt::{print::StringWriter, session::Session};

use crate::error::{MultiError, ToolError};

/// Print a line for `record` with the name of its event followed by the rendered print fmt.
///
/// With `raw`, the content of every field is appended as `name=value`. Errors do not stop the
/// printing: whatever could not be decoded is replaced by a marker and the errors are returned
/// once the line is complete.
pub fn print_record<W: Write>(
    session: &Session,
    record: &[u8],
    raw: bool,
    out: W,
) -> Result<(), MultiError<ToolError>> {
    let mut errors = MultiError::default();
    let mut out = StringWriter::new(out);

    let desc = session.event_of_record(record)?;
    write!(&mut out, "{}:{}: ", desc.system, desc.name)?;

    if let Err(err) = session.print_event(record, &mut out) {
        errors.push(err.into());
    }

    if raw {
        for field in desc.common.iter().chain(desc.fields.iter()) {
            write!(&mut out, " {}=", field.name)?;
            if let Err(err) = field.print_content(record, session.abi(), &mut out) {
                write!(&mut out, "{}", eventfmt::error::FAILED_TO_PARSE)?;
                errors.push(err.into());
            }
        }
    }
    writeln!(&mut out)?;
    out.into_inner().flush()?;
    errors.into_result()
}
