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

//! Event format descriptions, as found in `/sys/kernel/tracing/events/*/*/format`.

use core::borrow::Borrow;
use std::{collections::BTreeSet, string::String as StdString};

use bitflags::bitflags;
use nom::{
    Parser,
    branch::alt,
    bytes::complete::{is_not, tag, take_till},
    character::complete::{char, line_ending, multispace0, not_line_ending, space0},
    combinator::{eof, rest},
    error::context,
    multi::{many0, many1},
    sequence::{preceded, terminated},
};
use once_cell::sync::OnceCell;

use crate::{
    abi::{Abi, MemOffset, MemSize, Signedness},
    cparser::{self, ArrayKind, CParseError, DynamicKind, Identifier, Type},
    error::convert_err_impl,
    parser::{
        FromParseError, NomError, NomParserExt as _, PResult, VerboseNomError, VerboseParseError,
        identifier, map_res_cut, to_str,
    },
    print::{PrintFmt, PrintFmtError},
};

/// ID of an event, unique within a session.
pub type EventId = u16;

/// Errors while parsing an event format.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FormatError {
    #[error("Malformed event format: {0}")]
    Malformed(StdString),

    #[error("Field \"{0}\" is defined more than once")]
    DuplicateField(Identifier),

    #[error("Could not parse field declaration: {0}")]
    InvalidDeclaration(Box<CParseError>),
}

convert_err_impl!(CParseError => FormatError::InvalidDeclaration);

impl<'i> FromParseError<&'i [u8], VerboseNomError<'i>> for FormatError {
    fn from_parse_error(input: &'i [u8], err: &VerboseNomError<'i>) -> Self {
        FormatError::Malformed(VerboseParseError::new(input, err).to_string())
    }
}

/// Encoding of the location word of a dynamic field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocEncoding {
    /// 4 bytes: `len << 16 | offset`
    OffsetLen,
    /// 2 bytes holding only the offset. The data is a NUL-terminated string.
    OffsetOnly,
}

/// Location of the data of a dynamic field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataLoc {
    /// The offset is counted from the end of the location field rather than from the start of
    /// the record (`__rel_loc`).
    pub relative: bool,
    pub encoding: LocEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKind {
    /// Data stored at the field offset.
    Fixed,
    /// `__data_loc` and `__rel_loc` arrays.
    DynamicLoc(DataLoc),
    /// Dynamic array of a kernel bitmap type, such as a `cpumask_t`.
    DynamicBitmask(DataLoc),
}

bitflags! {
    /// Properties of a field that drive the way its raw content is printed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct FieldFlags: u8 {
        const SIGNED = 1 << 0;
        /// The declared type mentions `long`, including `long long`.
        const LONG = 1 << 1;
        const POINTER = 1 << 2;
        const STRING = 1 << 3;
        const ARRAY = 1 << 4;
        const DYNAMIC = 1 << 5;
    }
}

/// Format of a field of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFmt {
    /// Declaration as written in the format, including the field name.
    pub declaration: StdString,
    pub name: Identifier,
    pub typ: Type,
    /// Offset of the field in the record.
    pub offset: MemOffset,
    /// Size of the field in the record. For dynamic fields, this is the size of the location.
    pub size: MemSize,
    pub signedness: Signedness,
    pub kind: FieldKind,
    pub flags: FieldFlags,
}

/// Give unknown typedefs and enums an integer type based on the properties of the field.
fn fixup_type(typ: Type, size: MemSize, signedness: Signedness) -> Type {
    let int_type = || match (size, signedness) {
        (1, Signedness::Unsigned) => Type::U8,
        (1, Signedness::Signed) => Type::I8,
        (2, Signedness::Unsigned) => Type::U16,
        (2, Signedness::Signed) => Type::I16,
        (4, Signedness::Unsigned) => Type::U32,
        (4, Signedness::Signed) => Type::I32,
        (8, Signedness::Unsigned) => Type::U64,
        (8, Signedness::Signed) => Type::I64,
        _ => Type::Unknown,
    };

    match typ {
        Type::Typedef(typ, id) if *typ == Type::Unknown => Type::Typedef(Box::new(int_type()), id),
        Type::Enum(typ, id) if *typ == Type::Unknown => Type::Enum(Box::new(int_type()), id),
        Type::Array(typ, ArrayKind::Fixed(None)) => {
            // Symbolic array sizes are recovered from the size of the field, as long as the
            // size of the items does not depend on the ABI.
            let count = typ
                .size(&Abi::default())
                .ok()
                .flatten()
                .filter(|item_size| *item_size > 0)
                .map(|item_size| size / item_size);
            Type::Array(typ, ArrayKind::Fixed(count))
        }
        typ => typ,
    }
}

impl FieldFmt {
    /// Build a field format from the properties found on a `field:` line.
    pub fn new(
        declaration: &str,
        offset: MemOffset,
        size: MemSize,
        signedness: Signedness,
    ) -> Result<Self, FormatError> {
        let decl = cparser::declaration.parse_finish(declaration.as_bytes())?;
        let typ = fixup_type(decl.typ, size, signedness);

        // The width of long types depends on the ABI so the "signed:" property was computed by
        // the kernel for its own ABI. The declared type is authoritative.
        let signedness = match typ.is_long_sized() {
            true => typ.signedness().unwrap_or(signedness),
            false => signedness,
        };

        let kind = match &typ {
            Type::Array(item, ArrayKind::Dynamic(kind)) | Type::DynamicScalar(item, kind) => {
                let loc = DataLoc {
                    relative: *kind == DynamicKind::DynamicRel,
                    encoding: match size {
                        2 => LocEncoding::OffsetOnly,
                        _ => LocEncoding::OffsetLen,
                    },
                };
                match item.is_bitmap() {
                    true => FieldKind::DynamicBitmask(loc),
                    false => FieldKind::DynamicLoc(loc),
                }
            }
            _ => FieldKind::Fixed,
        };

        let mut flags = FieldFlags::empty();
        flags.set(FieldFlags::SIGNED, signedness.is_signed());
        flags.set(
            FieldFlags::LONG,
            declaration
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .any(|word| word == "long"),
        );
        flags.set(
            FieldFlags::POINTER,
            matches!(typ.resolve(), Type::Pointer(_)),
        );
        flags.set(FieldFlags::STRING, typ.is_string());
        flags.set(FieldFlags::ARRAY, matches!(typ, Type::Array(..)));
        flags.set(FieldFlags::DYNAMIC, kind != FieldKind::Fixed);

        Ok(FieldFmt {
            declaration: declaration.trim().into(),
            name: decl.identifier,
            typ,
            offset,
            size,
            signedness,
            kind,
            flags,
        })
    }
}

/// Ordered list of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructFmt {
    pub fields: Vec<FieldFmt>,
}

impl StructFmt {
    pub fn field_by_name<Q>(&self, name: &Q) -> Option<&FieldFmt>
    where
        Q: ?Sized,
        Identifier: Borrow<Q> + PartialEq<Q>,
    {
        self.fields.iter().find(|&field| &field.name == name.borrow())
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &FieldFmt> {
        self.fields.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse a list of `field:` lines, ignoring blank lines.
    pub fn parse(input: &[u8]) -> Result<Self, FormatError> {
        let lines = preceded(multispace0, many1(field_section_line)).parse_finish(input)?;
        let fields = lines
            .into_iter()
            .flatten()
            .map(RawField::into_field_fmt)
            .collect::<Result<Vec<_>, _>>()?;
        check_duplicates(&fields)?;
        Ok(StructFmt { fields })
    }
}

impl<'a> IntoIterator for &'a StructFmt {
    type Item = &'a FieldFmt;
    type IntoIter = core::slice::Iter<'a, FieldFmt>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// How the fields of an event format are split between the common fields shared by all events
/// and the event-specific fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommonSplit {
    /// The first group of fields is common if there is more than one blank-line separated
    /// group, which is the layout used by the kernel.
    #[default]
    BlankLine,
    /// The first `n` fields are common.
    Count(usize),
    /// All fields are event-specific.
    None,
}

/// Description of an event.
#[derive(Debug, Clone)]
pub struct EventDesc {
    pub id: EventId,
    pub system: Identifier,
    pub name: Identifier,
    /// Fields shared by all events.
    pub common: StructFmt,
    /// Event-specific fields.
    pub fields: StructFmt,
    /// Verbatim text of the print fmt.
    pub print_fmt: StdString,
    pub(crate) compiled_print_fmt: OnceCell<(Abi, Result<PrintFmt, PrintFmtError>)>,
}

// The compiled print fmt is a cache derived from the other attributes.
impl PartialEq<Self> for EventDesc {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.system == other.system
            && self.name == other.name
            && self.common == other.common
            && self.fields == other.fields
            && self.print_fmt == other.print_fmt
    }
}

impl Eq for EventDesc {}

impl EventDesc {
    /// Parse an event format, splitting common fields with [CommonSplit::default].
    #[inline]
    pub fn parse<I: AsRef<[u8]>>(input: I, system: &str) -> Result<Self, FormatError> {
        Self::parse_with(input, system, CommonSplit::default())
    }

    pub fn parse_with<I: AsRef<[u8]>>(
        input: I,
        system: &str,
        split: CommonSplit,
    ) -> Result<Self, FormatError> {
        let (name, id, lines, print_fmt) = event_desc.parse_finish(input.as_ref())?;

        let mut groups: Vec<Vec<FieldFmt>> = vec![Vec::new()];
        for line in lines {
            match line {
                Some(field) => {
                    if let Some(group) = groups.last_mut() {
                        group.push(field.into_field_fmt()?)
                    }
                }
                None => groups.push(Vec::new()),
            }
        }
        groups.retain(|group| !group.is_empty());

        let nr_fields: usize = groups.iter().map(Vec::len).sum();
        if nr_fields == 0 {
            return Err(FormatError::Malformed(format!(
                "event \"{name}\" does not have any field"
            )));
        }

        let (common, fields) = match split {
            CommonSplit::BlankLine if groups.len() > 1 => {
                let mut groups = groups.into_iter();
                let common = groups.next().unwrap_or_default();
                (common, groups.flatten().collect())
            }
            CommonSplit::BlankLine | CommonSplit::None => {
                (Vec::new(), groups.into_iter().flatten().collect())
            }
            CommonSplit::Count(n) => {
                let mut fields: Vec<_> = groups.into_iter().flatten().collect();
                let specific = fields.split_off(n.min(fields.len()));
                (fields, specific)
            }
        };

        check_duplicates(common.iter().chain(fields.iter()))?;

        Ok(EventDesc {
            id,
            system: system.into(),
            name: name.as_str().into(),
            common: StructFmt { fields: common },
            fields: StructFmt { fields },
            print_fmt,
            compiled_print_fmt: OnceCell::new(),
        })
    }

    /// Event-specific field.
    #[inline]
    pub fn find_field(&self, name: &str) -> Option<&FieldFmt> {
        self.fields.field_by_name(name)
    }

    /// Common field.
    #[inline]
    pub fn find_common_field(&self, name: &str) -> Option<&FieldFmt> {
        self.common.field_by_name(name)
    }

    /// Event-specific field, or common field if no event-specific field has that name.
    #[inline]
    pub fn find_any_field(&self, name: &str) -> Option<&FieldFmt> {
        self.find_field(name)
            .or_else(|| self.find_common_field(name))
    }

    /// Forget the compiled print fmt, e.g. after a change of ABI.
    #[inline]
    pub(crate) fn reset_cache(&mut self) {
        self.compiled_print_fmt = OnceCell::new();
    }
}

fn check_duplicates<'a, I>(fields: I) -> Result<(), FormatError>
where
    I: IntoIterator<Item = &'a FieldFmt>,
{
    let mut seen = BTreeSet::new();
    for field in fields {
        if !seen.insert(&field.name) {
            return Err(FormatError::DuplicateField(field.name.clone()));
        }
    }
    Ok(())
}

//////////////////////
// Grammar
//////////////////////

type FResult<'i, O> = PResult<'i, O, FormatError>;

struct RawField<'i> {
    declaration: &'i [u8],
    props: Vec<(&'i [u8], &'i [u8])>,
}

impl RawField<'_> {
    fn into_field_fmt(self) -> Result<FieldFmt, FormatError> {
        let declaration = to_str(self.declaration);
        let get = |name: &str| {
            self.props
                .iter()
                .find(|(key, _)| *key == name.as_bytes())
                .map(|(_, value)| {
                    let value = to_str(value);
                    value.trim().parse::<usize>().map_err(|_| {
                        FormatError::Malformed(format!(
                            "invalid value for property \"{name}\" of field \"{declaration}\": {value:?}"
                        ))
                    })
                })
                .transpose()
        };
        let required = |name: &str| -> Result<usize, FormatError> {
            get(name)?.ok_or_else(|| {
                FormatError::Malformed(format!(
                    "property \"{name}\" is missing for field \"{declaration}\""
                ))
            })
        };

        let offset = required("offset")?;
        let size = required("size")?;
        let signedness = match get("signed")? {
            Some(x) if x > 0 => Signedness::Signed,
            _ => Signedness::Unsigned,
        };
        FieldFmt::new(&declaration, offset, size, signedness)
    }
}

fn line_end(input: &[u8]) -> FResult<'_, &[u8]> {
    alt((line_ending, eof)).parse(input)
}

/// Line of the form `key: value`, returning the value.
fn header_line<'i>(
    key: &'static str,
) -> impl Parser<&'i [u8], Output = &'i [u8], Error = NomError<FormatError, VerboseNomError<'i>>> {
    context(
        key,
        preceded(
            (multispace0, tag(key), space0),
            terminated(not_line_ending, line_end),
        ),
    )
}

fn field_line(input: &[u8]) -> FResult<'_, RawField<'_>> {
    context(
        "field",
        (
            preceded((space0, tag("field:")), terminated(is_not(";\n"), char(';'))),
            many0(preceded(
                space0,
                (
                    terminated(identifier, char(':')),
                    terminated(take_till(|c| c == b';' || c == b'\n'), char(';')),
                ),
            )),
            space0,
            line_end,
        ),
    )
    .map(|(declaration, props, _, _)| RawField { declaration, props })
    .parse(input)
}

/// A field line, or [None] for blank lines separating groups of fields.
fn field_section_line(input: &[u8]) -> FResult<'_, Option<RawField<'_>>> {
    alt((
        terminated(space0, line_ending).map(|_| None),
        field_line.map(Some),
    ))
    .parse(input)
}

type RawEventDesc<'i> = (StdString, EventId, Vec<Option<RawField<'i>>>, StdString);

fn event_desc(input: &[u8]) -> FResult<'_, RawEventDesc<'_>> {
    context(
        "event format",
        (
            map_res_cut(header_line("name:"), |name| {
                let name = to_str(name).trim().to_owned();
                match name.is_empty() {
                    true => Err(FormatError::Malformed("empty event name".into())),
                    false => Ok(name),
                }
            }),
            map_res_cut(header_line("ID:"), |id| {
                let id = to_str(id);
                id.trim().parse::<EventId>().map_err(|_| {
                    FormatError::Malformed(format!("invalid event ID: {:?}", id.trim()))
                })
            }),
            header_line("format:"),
            many0(field_section_line),
            context(
                "print fmt",
                preceded((multispace0, tag("print fmt:"), space0), rest),
            ),
        ),
    )
    .map(|(name, id, _, lines, print_fmt)| (name, id, lines, to_str(print_fmt).trim_end().to_owned()))
    .parse(input)
}
