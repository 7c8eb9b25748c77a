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

use eventfmt::{
    event::{DataLoc, EventDesc, FieldFmt, FieldKind, LocEncoding},
    session::Session,
};

use crate::error::{MultiError, ToolError};

fn kind_name(kind: &FieldKind) -> &'static str {
    let loc_name = |loc: &DataLoc| match (loc.relative, loc.encoding) {
        (false, LocEncoding::OffsetLen) => "__data_loc",
        (false, LocEncoding::OffsetOnly) => "__data_loc (legacy)",
        (true, LocEncoding::OffsetLen) => "__rel_loc",
        (true, LocEncoding::OffsetOnly) => "__rel_loc (legacy)",
    };
    match kind {
        FieldKind::Fixed => "fixed",
        FieldKind::DynamicLoc(loc) => loc_name(loc),
        FieldKind::DynamicBitmask(loc) => match loc.relative {
            false => "__data_loc bitmask",
            true => "__rel_loc bitmask",
        },
    }
}

fn describe_field<W: Write>(field: &FieldFmt, out: &mut W) -> Result<(), ToolError> {
    writeln!(
        out,
        "    {}: offset={} size={} {} {} ({})",
        field.name,
        field.offset,
        field.size,
        field.signedness,
        kind_name(&field.kind),
        field.declaration,
    )?;
    Ok(())
}

/// Write a summary of the event, and check that its print fmt compiles with the session ABI.
pub fn describe_event<W: Write>(
    session: &Session,
    desc: &EventDesc,
    mut out: W,
) -> Result<(), MultiError<ToolError>> {
    writeln!(&mut out, "system: {}", desc.system)?;
    writeln!(&mut out, "name: {}", desc.name)?;
    writeln!(&mut out, "ID: {}", desc.id)?;
    writeln!(&mut out, "common fields:")?;
    for field in &desc.common {
        describe_field(field, &mut out)?;
    }
    writeln!(&mut out, "fields:")?;
    for field in &desc.fields {
        describe_field(field, &mut out)?;
    }
    writeln!(&mut out, "print fmt: {}", desc.print_fmt)?;

    match desc.print_fmt(session.abi(), session.log()) {
        Ok(print_fmt) => {
            writeln!(&mut out, "    arguments: {}", print_fmt.args.len())?;
            Ok(())
        }
        Err(err) => {
            writeln!(&mut out, "    Error while compiling the print fmt: {err}")?;
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use eventfmt::abi::{Abi, Endianness, LongSize};
    use pretty_assertions::assert_eq;

    use super::*;

    const CPUMASK_FMT: &str = "name: cpumask
ID: 3
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:__data_loc cpumask_t *[] cpumask;\toffset:8;\tsize:4;\tsigned:0;

print fmt: \"cpumask=%s\", __get_cpumask(cpumask)
";

    fn describe(format: &str) -> (String, Result<(), MultiError<ToolError>>) {
        let mut session = Session::new(Abi::new(Endianness::Little, Some(LongSize::Bits64)));
        let id = session.register_event(format, "sched").unwrap();
        let mut out = Vec::new();
        let res = describe_event(&session, session.event(id).unwrap(), &mut out);
        (String::from_utf8(out).unwrap(), res)
    }

    #[test]
    fn describe_event_test() {
        let (out, res) = describe(CPUMASK_FMT);
        assert!(res.is_ok());
        assert_eq!(
            out,
            "system: sched
name: cpumask
ID: 3
common fields:
    common_type: offset=0 size=2 unsigned fixed (unsigned short common_type)
    common_pid: offset=4 size=4 signed fixed (int common_pid)
fields:
    cpumask: offset=8 size=4 unsigned __data_loc bitmask (__data_loc cpumask_t *[] cpumask)
print fmt: \"cpumask=%s\", __get_cpumask(cpumask)
    arguments: 1
"
        );
    }

    #[test]
    fn describe_error_test() {
        let (out, res) = describe(&CPUMASK_FMT.replace("__get_cpumask(cpumask)", "__get_cpumask(nope)"));
        assert!(out.ends_with("    Error while compiling the print fmt: Unknown field: nope\n"));
        let errors = res.unwrap_err();
        assert_eq!(errors.errors().into_iter().count(), 1);
    }
}
