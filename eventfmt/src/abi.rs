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

//! Session-wide decoding settings of the machine that produced the trace.

use core::fmt;

use crate::buffer::FieldError;

/// Size of a memory area, in bytes.
pub type MemSize = usize;
/// Offset in a record, in bytes.
pub type MemOffset = usize;

/// Endianness of the kernel that produced the records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endianness {
    Big,
    Little,
}

macro_rules! parse_N {
    ($name:ident, $typ:ty) => {
        #[doc = concat!("Parse a [", stringify!($typ), "] at the beginning of `input`, following the `Self` endianness.")]
        #[inline]
        pub fn $name<'a>(&self, input: &'a [u8]) -> Option<(&'a [u8], $typ)> {
            const N: usize = core::mem::size_of::<$typ>();
            let (arr, input) = input.split_first_chunk::<N>()?;
            let x = match self {
                Endianness::Big => <$typ>::from_be_bytes(*arr),
                Endianness::Little => <$typ>::from_le_bytes(*arr),
            };
            Some((input, x))
        }
    };
}

impl Endianness {
    /// Return the native endianness of the machine running this library.
    #[inline]
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// Returns [true] if `Self` is the native endianness.
    #[inline]
    pub fn is_native(&self) -> bool {
        self == &Self::native()
    }

    parse_N!(parse_u64, u64);
    parse_N!(parse_u32, u32);
    parse_N!(parse_u16, u16);
    parse_N!(parse_u8, u8);

    /// Parse an unsigned integer of `size` bytes. Sizes other than 1, 2, 4 and 8 are rejected.
    #[inline]
    pub fn parse_uint<'a>(&self, input: &'a [u8], size: MemSize) -> Option<(&'a [u8], u64)> {
        match size {
            1 => self.parse_u8(input).map(|(i, x)| (i, x.into())),
            2 => self.parse_u16(input).map(|(i, x)| (i, x.into())),
            4 => self.parse_u32(input).map(|(i, x)| (i, x.into())),
            8 => self.parse_u64(input),
            _ => None,
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            Endianness::Big => "big endian",
            Endianness::Little => "little endian",
        })
    }
}

/// Size of the *long* C type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LongSize {
    /// 4 bytes long
    Bits32,
    /// 8 bytes long
    Bits64,
}

/// Convert the size of the *long* type to a size in bytes.
impl From<LongSize> for u64 {
    fn from(size: LongSize) -> Self {
        match size {
            LongSize::Bits32 => 4,
            LongSize::Bits64 => 8,
        }
    }
}

/// Convert the size of the *long* type to a size in bytes.
impl From<LongSize> for usize {
    fn from(size: LongSize) -> Self {
        match size {
            LongSize::Bits32 => 4,
            LongSize::Bits64 => 8,
        }
    }
}

/// Convert the a size in bytes to a [LongSize].
impl TryFrom<usize> for LongSize {
    /// If the conversion fails, the byte size is returned.
    type Error = usize;

    fn try_from(size: usize) -> Result<Self, Self::Error> {
        match size {
            4 => Ok(LongSize::Bits32),
            8 => Ok(LongSize::Bits64),
            x => Err(x),
        }
    }
}

/// Signedness of an integer type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signedness {
    Signed,
    Unsigned,
}

impl Signedness {
    #[inline]
    pub fn is_signed(&self) -> bool {
        matches!(self, Signedness::Signed)
    }
}

impl fmt::Display for Signedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            Signedness::Signed => "signed",
            Signedness::Unsigned => "unsigned",
        })
    }
}

/// Decoding settings of the kernel that produced the records.
///
/// Both settings can be overridden independently of the machine running the decoder, so that a
/// recording captured on another architecture can be decoded. An undefined `long_size` makes any
/// decoding that depends on it fail with [FieldError::UndefinedLongSize] rather than guessing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Abi {
    pub endianness: Endianness,
    pub long_size: Option<LongSize>,
}

impl Default for Abi {
    #[inline]
    fn default() -> Self {
        Abi {
            endianness: Endianness::native(),
            long_size: None,
        }
    }
}

impl Abi {
    #[inline]
    pub fn new(endianness: Endianness, long_size: Option<LongSize>) -> Self {
        Abi {
            endianness,
            long_size,
        }
    }

    /// Size in bytes of the *long* C type.
    #[inline]
    pub fn long_bytes(&self) -> Result<MemSize, FieldError> {
        self.long_size
            .map(Into::into)
            .ok_or(FieldError::UndefinedLongSize)
    }

    /// Size in bytes of a machine word used to store bitmaps. Bitmaps are arrays of *unsigned
    /// long*, but unlike scalars they can still be decoded when the long size is unknown since
    /// their human rendering does not depend on it for the common 8 bytes layout.
    #[inline]
    pub(crate) fn bitmap_chunk(&self) -> MemSize {
        match self.long_size {
            Some(size) => size.into(),
            None => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_int_test() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0xff];

        assert_eq!(
            Endianness::Little.parse_u32(&buf),
            Some((&buf[4..], 0x04030201))
        );
        assert_eq!(
            Endianness::Big.parse_u32(&buf),
            Some((&buf[4..], 0x01020304))
        );
        assert_eq!(Endianness::Big.parse_u16(&buf[3..]), Some((&buf[5..], 0x04ff)));
        assert_eq!(Endianness::Little.parse_u64(&buf), None);
        assert_eq!(Endianness::Little.parse_uint(&buf, 3), None);
        assert_eq!(
            Endianness::Little.parse_uint(&buf, 1),
            Some((&buf[1..], 0x01))
        );
    }

    #[test]
    fn long_size_test() {
        assert_eq!(LongSize::try_from(4), Ok(LongSize::Bits32));
        assert_eq!(LongSize::try_from(8), Ok(LongSize::Bits64));
        assert_eq!(LongSize::try_from(2), Err(2));

        let abi = Abi::new(Endianness::Little, None);
        assert_eq!(abi.long_bytes(), Err(FieldError::UndefinedLongSize));
        assert_eq!(abi.bitmap_chunk(), 8);

        let abi = Abi::new(Endianness::Little, Some(LongSize::Bits32));
        assert_eq!(abi.long_bytes(), Ok(4));
        assert_eq!(abi.bitmap_chunk(), 4);
    }
}
