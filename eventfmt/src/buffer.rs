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

//! Decoding of the fields of a binary record.

use core::fmt;
use std::{borrow::Cow, string::String as StdString};

use crate::{
    abi::{Abi, MemOffset, MemSize},
    cinterp::{Bitmap, ByteArray, Value, cast_int},
    cparser::{Identifier, Type},
    event::{DataLoc, FieldFlags, FieldFmt, FieldKind, LocEncoding},
    print::PrintError,
};

/// Errors while decoding a field of a record.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FieldError {
    #[error("Data of {size} bytes at offset {offset} is out of the bounds of a {len} bytes record")]
    OutOfBounds {
        offset: MemOffset,
        size: MemSize,
        len: MemSize,
    },

    #[error("Size of the long type is not defined")]
    UndefinedLongSize,

    #[error("Legacy data location is only supported for strings, not for field \"{0}\"")]
    UnsupportedLegacyLoc(Identifier),

    #[error("Data location of field \"{name}\" has an unsupported size: {size}")]
    InvalidLocation { name: Identifier, size: MemSize },
}

/// Slice `size` bytes of `record` starting at `offset`.
#[inline]
fn slice(record: &[u8], offset: MemOffset, size: MemSize) -> Result<&[u8], FieldError> {
    offset
        .checked_add(size)
        .and_then(|end| record.get(offset..end))
        .ok_or(FieldError::OutOfBounds {
            offset,
            size,
            len: record.len(),
        })
}

fn str_value(data: &[u8]) -> Value<'_> {
    let data = match data.iter().position(|c| *c == 0) {
        Some(end) => &data[..end],
        None => data,
    };
    Value::Str(StdString::from_utf8_lossy(data))
}

impl FieldFmt {
    /// Size of the scalar value stored in the field. Long-sized types take the size mandated by
    /// the ABI rather than the size recorded in the format.
    pub fn value_size(&self, abi: &Abi) -> Result<MemSize, FieldError> {
        match self.kind {
            FieldKind::Fixed if self.typ.is_long_sized() => abi.long_bytes(),
            _ => Ok(self.size),
        }
    }

    fn data_loc<'a>(&self, record: &'a [u8], loc: DataLoc, abi: &Abi) -> Result<&'a [u8], FieldError> {
        let raw = slice(record, self.offset, self.size)?;
        let base = match loc.relative {
            true => self.offset + self.size,
            false => 0,
        };
        let rebase = |offset: MemOffset| {
            offset.checked_add(base).ok_or(FieldError::OutOfBounds {
                offset,
                size: 0,
                len: record.len(),
            })
        };

        match loc.encoding {
            LocEncoding::OffsetLen => {
                let word = match abi.endianness.parse_u32(raw) {
                    Some((_, word)) if self.size == 4 => word,
                    _ => {
                        return Err(FieldError::InvalidLocation {
                            name: self.name.clone(),
                            size: self.size,
                        });
                    }
                };
                let offset = rebase((word & 0xffff) as MemOffset)?;
                slice(record, offset, (word >> 16) as MemSize)
            }
            LocEncoding::OffsetOnly => {
                if !self.flags.contains(FieldFlags::STRING) {
                    return Err(FieldError::UnsupportedLegacyLoc(self.name.clone()));
                }
                let offset = match abi.endianness.parse_u16(raw) {
                    Some((_, offset)) => rebase(offset.into())?,
                    None => {
                        return Err(FieldError::InvalidLocation {
                            name: self.name.clone(),
                            size: self.size,
                        });
                    }
                };
                let data = record.get(offset..).ok_or(FieldError::OutOfBounds {
                    offset,
                    size: 0,
                    len: record.len(),
                })?;
                // The length is not recorded, so the string spans up to its NUL terminator.
                let len = match data.iter().position(|c| *c == 0) {
                    Some(end) => end + 1,
                    None => data.len(),
                };
                Ok(&data[..len])
            }
        }
    }

    /// Raw bytes of the field. For dynamic fields, this is the data pointed at by the location
    /// rather than the location itself.
    pub fn dynamic_data<'a>(&self, record: &'a [u8], abi: &Abi) -> Result<&'a [u8], FieldError> {
        match self.kind {
            FieldKind::Fixed => slice(record, self.offset, self.size),
            FieldKind::DynamicLoc(loc) | FieldKind::DynamicBitmask(loc) => {
                self.data_loc(record, loc, abi)
            }
        }
    }

    /// Decode the value of the field in `record`.
    pub fn decode<'a>(&self, record: &'a [u8], abi: &Abi) -> Result<Value<'a>, FieldError> {
        let is_string = self.flags.contains(FieldFlags::STRING);
        match self.kind {
            FieldKind::Fixed => match self.typ.resolve() {
                Type::Array(..) => {
                    let data = slice(record, self.offset, self.size)?;
                    Ok(match is_string {
                        true => str_value(data),
                        false => Value::U8Array(Cow::Borrowed(data)),
                    })
                }
                _ => {
                    let size = self.value_size(abi)?;
                    let data = slice(record, self.offset, size)?;
                    Ok(match abi.endianness.parse_uint(data, size) {
                        Some((_, x)) => cast_int(x, size, self.signedness.is_signed()),
                        None => Value::U8Array(Cow::Borrowed(data)),
                    })
                }
            },
            FieldKind::DynamicLoc(_) => {
                let data = self.dynamic_data(record, abi)?;
                Ok(match is_string {
                    true => str_value(data),
                    false => Value::U8Array(Cow::Borrowed(data)),
                })
            }
            FieldKind::DynamicBitmask(_) => Ok(Value::Bitmap(Bitmap::from_bytes(
                self.dynamic_data(record, abi)?,
                abi,
            ))),
        }
    }

    /// Print the raw content of the field the way it is displayed when the print fmt cannot be
    /// used.
    pub fn print_content<W>(&self, record: &[u8], abi: &Abi, out: &mut W) -> Result<(), PrintError>
    where
        W: fmt::Write + ?Sized,
    {
        let hex = self.flags.contains(FieldFlags::POINTER);
        let long = self.flags.contains(FieldFlags::LONG);

        match self.decode(record, abi)? {
            Value::I64Scalar(x) if hex => write!(out, "0x{:x}", x as u64),
            Value::I64Scalar(x) if long && self.value_size(abi)? == 4 => {
                write!(out, "0x{:x}", x as u32)
            }
            Value::I64Scalar(x) => write!(out, "{x}"),
            Value::U64Scalar(x) if hex || long => write!(out, "0x{x:x}"),
            Value::U64Scalar(x) => write!(out, "{x}"),
            Value::Str(s) => out.write_str(&s),
            Value::U8Array(arr) => write!(out, "{}", ByteArray(&arr)),
            Value::Bitmap(bitmap) => write!(out, "{}", ByteArray(bitmap.as_bytes())),
        }?;
        Ok(())
    }
}
