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

//! Pretty print records according to the printk-style format string of their event.

use core::fmt;
use std::{borrow::Cow, io, string::String as StdString};

use bitflags::bitflags;
use itertools::Itertools as _;
use nom::{
    Parser,
    branch::alt,
    bytes::complete::{is_not, tag, take, take_while},
    character::complete::{char, u32 as txt_u32},
    combinator::{cut, opt, success},
    error::context,
    multi::many0,
    sequence::preceded,
};

use crate::{
    abi::{Abi, MemSize},
    buffer::FieldError,
    cinterp::{BasicEnv, Bitmap, BufferEnv, EvalError, Value, cast_int},
    cparser::{self, CParseError, Expr, Identifier},
    error::{FAILED_TO_PARSE, convert_err_impl},
    event::EventDesc,
    logging::Log,
    parser::{
        FromParseError, NomParserExt as _, PResult, VerboseNomError, VerboseParseError,
        map_res_cut, to_str,
    },
};

/// Wrap a [io::Write] to also have a [fmt::Write] implementation writing UTF-8.
pub struct StringWriter<W> {
    inner: W,
}

impl<W> StringWriter<W> {
    #[inline]
    pub fn new(inner: W) -> Self {
        StringWriter { inner }
    }

    #[inline]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> io::Write for StringWriter<W> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: io::Write> fmt::Write for StringWriter<W> {
    #[inline]
    fn write_str(&mut self, s: &str) -> Result<(), fmt::Error> {
        io::Write::write_all(self, s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// Errors detected when parsing and compiling a print fmt.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PrintFmtError {
    #[error("Could not parse the print fmt: {0}")]
    SyntaxError(Box<CParseError>),

    #[error("Unknown function-like macro: {0}")]
    UnknownAccessor(Identifier),

    #[error("Wrong number of arguments for {context}: expected {expected} but got {found}")]
    ArityMismatch {
        context: Identifier,
        expected: usize,
        found: usize,
    },

    #[error("Unknown field: {0}")]
    UnknownField(Identifier),

    #[error("Expected string literal: {0}")]
    NotAStringLiteral(StdString),

    #[error("Illegal specifier: {0}")]
    IllegalSpecifier(StdString),

    #[error("Invalid argument for {0}(): {1}")]
    InvalidAccessorArg(Identifier, StdString),

    #[error("Size of {0} is not known")]
    UnknownSize(StdString),

    #[error("Could not decode field: {0}")]
    Field(Box<FieldError>),
}

convert_err_impl!(FieldError => PrintFmtError::Field);

impl From<CParseError> for PrintFmtError {
    fn from(err: CParseError) -> Self {
        match err {
            CParseError::UnknownAccessor(name) => PrintFmtError::UnknownAccessor(name),
            CParseError::AccessorArity {
                name,
                expected,
                found,
            } => PrintFmtError::ArityMismatch {
                context: name,
                expected,
                found,
            },
            CParseError::InvalidAccessorArg(name, msg) => {
                PrintFmtError::InvalidAccessorArg(name, msg)
            }
            err => PrintFmtError::SyntaxError(Box::new(err)),
        }
    }
}

impl<'i> FromParseError<&'i [u8], VerboseNomError<'i>> for PrintFmtError {
    fn from_parse_error(input: &'i [u8], err: &VerboseNomError<'i>) -> Self {
        PrintFmtError::SyntaxError(Box::new(CParseError::ParseError(Box::new(
            VerboseParseError::new(input, err),
        ))))
    }
}

/// Main error type when printing records.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PrintError {
    #[error("Missing value to interpolate in the format string")]
    MissingValue,

    #[error("No event registered with ID {0}")]
    UnknownEvent(u64),

    #[error("Could not find the common_type field identifying the event of the record")]
    NoEventType,

    #[error("Value cannot be formatted as an integer: {}", match .0 {
        Some(val) => val.to_string(),
        None => "<no value>".into()
    })]
    NotAnInteger(Option<Value<'static>>),

    #[error("Value cannot be formatted as a string: {}", match .0 {
        Some(val) => val.to_string(),
        None => "<no value>".into()
    })]
    NotAString(Option<Value<'static>>),

    #[error("Value cannot be formatted as a buffer: {}", match .0 {
        Some(val) => val.to_string(),
        None => "<no value>".into()
    })]
    NotABuffer(Option<Value<'static>>),

    #[error("Error while formatting string: {0}")]
    Fmt(Box<fmt::Error>),

    #[error("Could not use the print fmt: {0}")]
    PrintFmt(Box<PrintFmtError>),

    #[error("Error while evaluating expression: {0}")]
    Eval(Box<EvalError>),

    #[error("Error while decoding field: {0}")]
    Field(Box<FieldError>),
}

convert_err_impl!(fmt::Error => PrintError::Fmt);
convert_err_impl!(PrintFmtError => PrintError::PrintFmt);
convert_err_impl!(EvalError => PrintError::Eval);
convert_err_impl!(FieldError => PrintError::Field);

/// Largest width or precision honored when printing a value, larger ones are clamped.
pub const MAX_PRINT_WIDTH: usize = (1 << 15) - 1;

/// Width specifier of a printk-style format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintWidth {
    Unmodified,
    Fixed(usize),
    /// `*`, taken from the argument list.
    Dynamic,
}

/// Precision specifier of a printk-style format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintPrecision {
    Unmodified,
    Fixed(usize),
    /// `.*`, taken from the argument list.
    Dynamic,
}

bitflags! {
    /// Flags specifier of a printk-style format string.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrintFlags: u8 {
        /// #
        const BasePrefix = 1;

        /// -
        const LeftJustify = 2;

        /// +
        const PositiveSign = 4;

        /// space
        const SignPlaceholder = 8;

        /// 0
        const ZeroPad = 16;
    }
}

/// Length modifier of an integer conversion, deciding the width the value is truncated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthModifier {
    /// No modifier: `int`
    Int,
    /// `hh`
    Char,
    /// `h`
    Short,
    /// `l`
    Long,
    /// `ll` and `L`
    LongLong,
    /// `z`, `j` and `t`
    Size,
}

impl LengthModifier {
    fn size(&self, abi: &Abi) -> MemSize {
        match self {
            LengthModifier::Char => 1,
            LengthModifier::Short => 2,
            LengthModifier::Int => 4,
            LengthModifier::Long => abi.long_size.map(Into::into).unwrap_or(8),
            LengthModifier::LongLong | LengthModifier::Size => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HexBufferSeparator {
    /// Default separator: space
    Space,
    /// `C`: colon
    C,
    /// `D`: dash
    D,
    /// `N`: no separator
    N,
}

impl HexBufferSeparator {
    fn as_str(&self) -> &'static str {
        match self {
            HexBufferSeparator::Space => " ",
            HexBufferSeparator::C => ":",
            HexBufferSeparator::D => "-",
            HexBufferSeparator::N => "",
        }
    }
}

/// Conversion of a printk-style format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintSpecifier {
    /// `%d` and `%i`
    Dec,
    /// `%u`
    Unsigned,
    Oct,
    Hex,
    UpperHex,
    Char,
    Str,
    /// `%p` and the kernel extensions without a dedicated rendering, such as `%pS` or `%pK`.
    Pointer,
    /// `%*ph`
    HexBuffer(HexBufferSeparator),
    /// `%*pb` (hex words), `%*pbl` (list of bits)
    Bitmap { list: bool },
}

/// Atom of a printk-style format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintAtom {
    /// A fixed string is e.g. "foobar" where no non-escaped % appears
    Fixed(StdString),
    /// Variable atoms specify how to interpolate a runtime value into the format string.
    Variable {
        print_spec: PrintSpecifier,
        length: LengthModifier,
        flags: PrintFlags,
        width: PrintWidth,
        precision: PrintPrecision,
    },
}

/// Parsed printk-style format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintFmtStr {
    pub atoms: Vec<PrintAtom>,
}

impl PrintFmtStr {
    /// Parse a printk-style format string.
    #[inline]
    pub fn parse(fmt: &str) -> Result<Self, PrintFmtError> {
        print_fmt_str.parse_finish(fmt.as_bytes())
    }

    /// Number of arguments consumed by the format string, including the dynamic widths and
    /// precisions.
    pub fn nr_args(&self) -> usize {
        self.atoms
            .iter()
            .map(|atom| match atom {
                PrintAtom::Fixed(_) => 0,
                PrintAtom::Variable {
                    width, precision, ..
                } => {
                    1 + usize::from(*width == PrintWidth::Dynamic)
                        + usize::from(*precision == PrintPrecision::Dynamic)
                }
            })
            .sum()
    }

    /// Interpolate the provided values and write the result to `out`.
    ///
    /// A value that cannot be evaluated or formatted is replaced by [FAILED_TO_PARSE] and the
    /// rest of the string is still printed. The last of these errors is returned.
    pub fn interpolate_values<'v, W, I>(
        &self,
        abi: &Abi,
        out: &mut W,
        values: I,
    ) -> Result<(), PrintError>
    where
        W: fmt::Write + ?Sized,
        I: IntoIterator<Item = Result<Value<'v>, EvalError>>,
    {
        let mut values = values.into_iter();
        let mut next_value = || -> Result<Value<'v>, PrintError> {
            Ok(values.next().ok_or(PrintError::MissingValue)??)
        };

        let mut res = Ok(());
        for atom in &self.atoms {
            match atom {
                PrintAtom::Fixed(s) => out.write_str(s)?,
                PrintAtom::Variable {
                    print_spec,
                    length,
                    flags,
                    width,
                    precision,
                } => {
                    let mut flags = *flags;
                    // Arguments are consumed even if one of them fails, so that the following
                    // conversions stay aligned with their values.
                    let width = match width {
                        PrintWidth::Unmodified => Ok(0),
                        PrintWidth::Fixed(x) => Ok(*x),
                        PrintWidth::Dynamic => next_value().and_then(|val| {
                            let x = int_arg(&val, LengthModifier::Int, true, abi)?;
                            // A negative width is a left-justification flag.
                            if x.negative {
                                flags |= PrintFlags::LeftJustify;
                            }
                            Ok(usize::try_from(x.magnitude).unwrap_or(usize::MAX))
                        }),
                    };
                    let precision = match precision {
                        PrintPrecision::Unmodified => Ok(None),
                        PrintPrecision::Fixed(x) => Ok(Some(*x)),
                        PrintPrecision::Dynamic => next_value().and_then(|val| {
                            let x = int_arg(&val, LengthModifier::Int, true, abi)?;
                            // A negative precision is taken as if it was omitted.
                            Ok(match x.negative {
                                true => None,
                                false => Some(usize::try_from(x.magnitude).unwrap_or(usize::MAX)),
                            })
                        }),
                    };
                    let value = next_value();

                    let printed = match (width, precision, value) {
                        (Ok(width), Ok(precision), Ok(value)) => {
                            let conversion = Conversion {
                                print_spec: *print_spec,
                                length: *length,
                                flags,
                                width,
                                precision,
                            };
                            conversion.print(abi, value, out)
                        }
                        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => Err(err),
                    };

                    match printed {
                        Ok(()) => {}
                        Err(PrintError::Fmt(err)) => return Err(PrintError::Fmt(err)),
                        Err(err) => {
                            out.write_str(FAILED_TO_PARSE)?;
                            res = Err(err);
                        }
                    }
                }
            }
        }
        res
    }
}

/// Integer ready to be formatted.
#[derive(Debug, Clone, Copy)]
struct IntArg {
    negative: bool,
    magnitude: u64,
}

/// Truncate the integer value to the width of the conversion and reinterpret it with the
/// conversion's signedness.
fn int_arg(
    val: &Value<'_>,
    length: LengthModifier,
    signed: bool,
    abi: &Abi,
) -> Result<IntArg, PrintError> {
    let x = match val {
        Value::U64Scalar(x) => *x,
        Value::I64Scalar(x) => *x as u64,
        val => return Err(PrintError::NotAnInteger(Some(val.clone().into_static()))),
    };
    Ok(match cast_int(x, length.size(abi), signed) {
        Value::I64Scalar(x) => IntArg {
            negative: x < 0,
            magnitude: x.unsigned_abs(),
        },
        Value::U64Scalar(x) => IntArg {
            negative: false,
            magnitude: x,
        },
        val => return Err(PrintError::NotAnInteger(Some(val))),
    })
}

/// Write `s` padded to `width` characters, up to [MAX_PRINT_WIDTH].
fn pad<W: fmt::Write + ?Sized>(
    out: &mut W,
    s: &str,
    width: usize,
    flags: PrintFlags,
) -> Result<(), fmt::Error> {
    let width = width.min(MAX_PRINT_WIDTH);
    match flags.contains(PrintFlags::LeftJustify) {
        true => write!(out, "{s:<width$}"),
        false => write!(out, "{s:>width$}"),
    }
}

/// Kernel hex rendering of a bitmap: 32 bits words separated by commas, most significant
/// first.
fn write_bitmap_hex<W: fmt::Write + ?Sized>(
    out: &mut W,
    bitmap: &Bitmap<'_>,
) -> Result<(), fmt::Error> {
    let nr_bits = bitmap.as_bytes().len() * 8;
    let mut words = vec![0u32; nr_bits.div_ceil(32)];
    for bit in bitmap.iter() {
        if let Some(word) = words.get_mut(bit / 32) {
            *word |= 1 << (bit % 32);
        }
    }
    let last = words.len().saturating_sub(1);
    for (i, word) in words.iter().enumerate().rev() {
        let digits = match i == last {
            true => (nr_bits - 32 * i).div_ceil(4),
            false => {
                out.write_char(',')?;
                8
            }
        };
        write!(out, "{word:0digits$x}")?;
    }
    Ok(())
}

/// Fully resolved conversion, with dynamic width and precision already evaluated.
struct Conversion {
    print_spec: PrintSpecifier,
    length: LengthModifier,
    flags: PrintFlags,
    width: usize,
    precision: Option<usize>,
}

impl Conversion {
    fn print<W: fmt::Write + ?Sized>(
        &self,
        abi: &Abi,
        val: Value<'_>,
        out: &mut W,
    ) -> Result<(), PrintError> {
        let (width, flags) = (self.width, self.flags);
        match self.print_spec {
            spec @ (PrintSpecifier::Dec
            | PrintSpecifier::Unsigned
            | PrintSpecifier::Oct
            | PrintSpecifier::Hex
            | PrintSpecifier::UpperHex) => {
                let x = int_arg(&val, self.length, spec == PrintSpecifier::Dec, abi)?;
                self.print_integer(x, out)?;
            }
            PrintSpecifier::Char => {
                let c = match &val {
                    Value::Str(s) => s.chars().next().unwrap_or('\0'),
                    val => char::from(int_arg(val, LengthModifier::Char, false, abi)?.magnitude as u8),
                };
                pad(out, c.encode_utf8(&mut [0; 4]), width, flags)?;
            }
            PrintSpecifier::Str => {
                let s: Cow<'_, str> = match &val {
                    Value::Str(s) => Cow::Borrowed(s),
                    Value::U8Array(arr) => StdString::from_utf8_lossy(
                        arr.split(|c| *c == 0).next().unwrap_or_default(),
                    ),
                    Value::Bitmap(bitmap) => Cow::Owned(bitmap.to_string()),
                    val => return Err(PrintError::NotAString(Some(val.clone().into_static()))),
                };
                let s: &str = &s;
                let s = match self.precision {
                    Some(precision) => match s.char_indices().nth(precision) {
                        Some((end, _)) => &s[..end],
                        None => s,
                    },
                    None => s,
                };
                pad(out, s, width, flags)?;
            }
            PrintSpecifier::Pointer => match &val {
                Value::U64Scalar(_) | Value::I64Scalar(_) => {
                    let x = int_arg(&val, LengthModifier::Long, false, abi)?;
                    pad(out, &format!("0x{:x}", x.magnitude), width, flags)?;
                }
                Value::Str(s) => pad(out, s, width, flags)?,
                Value::Bitmap(bitmap) => pad(out, &bitmap.to_string(), width, flags)?,
                Value::U8Array(arr) => {
                    let s = arr.iter().format_with(":", |x, f| f(&format_args!("{x:02x}")));
                    write!(out, "{s}")?;
                }
            },
            PrintSpecifier::HexBuffer(sep) => {
                let bytes = val
                    .to_bytes()
                    .ok_or_else(|| PrintError::NotABuffer(Some(val.clone().into_static())))?;
                let n = if width == 0 { bytes.len() } else { width };
                let s = bytes
                    .iter()
                    .take(n)
                    .format_with(sep.as_str(), |x, f| f(&format_args!("{x:02x}")));
                write!(out, "{s}")?;
            }
            PrintSpecifier::Bitmap { list } => {
                let bitmap = match val {
                    Value::Bitmap(bitmap) => bitmap,
                    Value::U8Array(arr) => Bitmap::new(arr, abi),
                    val => return Err(PrintError::NotABuffer(Some(val.into_static()))),
                };
                match list {
                    true => write!(out, "{bitmap}")?,
                    false => write_bitmap_hex(out, &bitmap)?,
                }
            }
        }
        Ok(())
    }

    fn print_integer<W: fmt::Write + ?Sized>(
        &self,
        x: IntArg,
        out: &mut W,
    ) -> Result<(), fmt::Error> {
        let flags = self.flags;
        let mut digits = match self.print_spec {
            PrintSpecifier::Hex => format!("{:x}", x.magnitude),
            PrintSpecifier::UpperHex => format!("{:X}", x.magnitude),
            PrintSpecifier::Oct => format!("{:o}", x.magnitude),
            _ => format!("{}", x.magnitude),
        };
        if let Some(precision) = self.precision.map(|x| x.min(MAX_PRINT_WIDTH)) {
            if precision == 0 && x.magnitude == 0 {
                digits.clear();
            } else if digits.len() < precision {
                digits = format!("{digits:0>precision$}");
            }
        }

        let is_dec = self.print_spec == PrintSpecifier::Dec;
        let sign = if x.negative {
            "-"
        } else if is_dec && flags.contains(PrintFlags::PositiveSign) {
            "+"
        } else if is_dec && flags.contains(PrintFlags::SignPlaceholder) {
            " "
        } else {
            ""
        };
        let prefix = match (flags.contains(PrintFlags::BasePrefix), self.print_spec) {
            (true, PrintSpecifier::Hex) if x.magnitude != 0 => "0x",
            (true, PrintSpecifier::UpperHex) if x.magnitude != 0 => "0X",
            (true, PrintSpecifier::Oct) if !digits.starts_with('0') => "0",
            _ => "",
        };

        let len = sign.len() + prefix.len() + digits.len();
        let padding = self.width.min(MAX_PRINT_WIDTH).saturating_sub(len);
        if flags.contains(PrintFlags::LeftJustify) {
            write!(out, "{sign}{prefix}{digits}{:padding$}", "")
        } else if flags.contains(PrintFlags::ZeroPad) && self.precision.is_none() {
            write!(out, "{sign}{prefix}{:0>padding$}{digits}", "")
        } else {
            write!(out, "{:padding$}{sign}{prefix}{digits}", "")
        }
    }
}

/// Print fmt of an event, with its format string parsed and its arguments compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintFmt {
    pub fmt: PrintFmtStr,
    pub args: Vec<Expr>,
}

impl PrintFmt {
    /// Parse and compile the print fmt of `desc`.
    pub fn new(desc: &EventDesc, abi: &Abi, log: &Log) -> Result<Self, PrintFmtError> {
        let src = desc.print_fmt.trim_start();
        if !src.starts_with('"') {
            return Err(PrintFmtError::NotAStringLiteral(src.into()));
        }

        let statement = cparser::print_fmt_statement.parse_finish(src.as_bytes())?;
        let trailing = to_str(statement.trailing);
        let trailing = trailing.trim();
        if !trailing.is_empty() {
            log.warn(format_args!(
                "{}:{}: ignoring trailing text after the print fmt arguments: {trailing:?}",
                desc.system, desc.name
            ));
        }

        let fmt = PrintFmtStr::parse(&statement.fmt)?;
        let expected = fmt.nr_args();
        let found = statement.args.len();
        if expected != found {
            return Err(PrintFmtError::ArityMismatch {
                context: "print fmt".into(),
                expected,
                found,
            });
        }

        let env = BasicEnv::new(desc, abi);
        let args = statement
            .args
            .into_iter()
            .map(|arg| arg.compile(&env))
            .collect::<Result<_, _>>()?;
        Ok(PrintFmt { fmt, args })
    }

    /// Evaluate the arguments against `record` and interpolate them in the format string.
    pub fn interpolate<W>(
        &self,
        desc: &EventDesc,
        abi: &Abi,
        record: &[u8],
        out: &mut W,
    ) -> Result<(), PrintError>
    where
        W: fmt::Write + ?Sized,
    {
        let env = BufferEnv::new(desc, abi, record);
        self.fmt
            .interpolate_values(abi, out, self.args.iter().map(|arg| arg.eval(&env)))
    }
}

impl EventDesc {
    /// Compiled print fmt of the event.
    ///
    /// The print fmt is compiled on first use and cached along with `abi`, including when
    /// compilation fails. Later calls with another `abi` compile a fresh print fmt that is not
    /// cached.
    pub fn print_fmt(&self, abi: &Abi, log: &Log) -> Result<Cow<'_, PrintFmt>, PrintFmtError> {
        let (cached_abi, compiled) = self
            .compiled_print_fmt
            .get_or_init(|| (*abi, PrintFmt::new(self, abi, log)));
        if cached_abi == abi {
            compiled.as_ref().map(Cow::Borrowed).map_err(Clone::clone)
        } else {
            PrintFmt::new(self, abi, log).map(Cow::Owned)
        }
    }

    /// Print `name=value` for each event-specific field, using the raw content of the field.
    pub fn print_fields<W>(&self, record: &[u8], abi: &Abi, out: &mut W) -> Result<(), PrintError>
    where
        W: fmt::Write + ?Sized,
    {
        let mut res = Ok(());
        for (i, field) in self.fields.iter().enumerate() {
            if i != 0 {
                out.write_char(' ')?;
            }
            write!(out, "{}=", field.name)?;
            match field.print_content(record, abi, out) {
                Ok(()) => {}
                Err(PrintError::Fmt(err)) => return Err(PrintError::Fmt(err)),
                Err(err) => {
                    out.write_str(FAILED_TO_PARSE)?;
                    res = Err(err);
                }
            }
        }
        res
    }

    /// Print `record` according to the print fmt of the event.
    ///
    /// If the print fmt cannot be used, [FAILED_TO_PARSE] is printed followed by the content of
    /// each event-specific field, and the print fmt error is returned.
    pub fn print_info<W>(
        &self,
        record: &[u8],
        abi: &Abi,
        log: &Log,
        out: &mut W,
    ) -> Result<(), PrintError>
    where
        W: fmt::Write + ?Sized,
    {
        match self.print_fmt(abi, log) {
            Ok(print_fmt) => print_fmt.interpolate(self, abi, record, out),
            Err(err) => {
                out.write_str(FAILED_TO_PARSE)?;
                if !self.fields.is_empty() {
                    out.write_char(' ')?;
                }
                // The raw fields are a fallback, the print fmt error is the one to report.
                match self.print_fields(record, abi, out) {
                    Err(PrintError::Fmt(err)) => Err(PrintError::Fmt(err)),
                    _ => Err(err.into()),
                }
            }
        }
    }

    /// Render `record` to a string. Errors are logged and leave [FAILED_TO_PARSE] in the
    /// output.
    pub fn render(&self, record: &[u8], abi: &Abi, log: &Log) -> StdString {
        let mut out = StdString::new();
        if let Err(err) = self.print_info(record, abi, log, &mut out) {
            log.info(format_args!(
                "{}:{}: could not render record: {err}",
                self.system, self.name
            ));
        }
        out
    }
}

//////////////////////
// Grammar
//////////////////////

type PfResult<'i, O> = PResult<'i, O, PrintFmtError>;

fn print_flags(input: &[u8]) -> PfResult<'_, PrintFlags> {
    context(
        "flag",
        many0(alt((
            char('-').map(|_| PrintFlags::LeftJustify),
            char('+').map(|_| PrintFlags::PositiveSign),
            char(' ').map(|_| PrintFlags::SignPlaceholder),
            char('#').map(|_| PrintFlags::BasePrefix),
            char('0').map(|_| PrintFlags::ZeroPad),
        ))),
    )
    .map(PrintFlags::from_iter)
    .parse(input)
}

fn print_width(input: &[u8]) -> PfResult<'_, PrintWidth> {
    context(
        "width",
        alt((
            char('*').map(|_| PrintWidth::Dynamic),
            txt_u32.map(|x| PrintWidth::Fixed(x as usize)),
            success(PrintWidth::Unmodified),
        )),
    )
    .parse(input)
}

fn print_precision(input: &[u8]) -> PfResult<'_, PrintPrecision> {
    context(
        "precision",
        alt((
            preceded(
                char('.'),
                alt((
                    char('*').map(|_| PrintPrecision::Dynamic),
                    // No value after the dot is same as an explicit 0
                    opt(txt_u32).map(|x| PrintPrecision::Fixed(x.unwrap_or(0) as usize)),
                )),
            ),
            success(PrintPrecision::Unmodified),
        )),
    )
    .parse(input)
}

fn length_modifier(input: &[u8]) -> PfResult<'_, LengthModifier> {
    alt((
        tag("hh").map(|_| LengthModifier::Char),
        tag("h").map(|_| LengthModifier::Short),
        tag("ll").map(|_| LengthModifier::LongLong),
        tag("l").map(|_| LengthModifier::Long),
        tag("L").map(|_| LengthModifier::LongLong),
        alt((tag("z"), tag("Z"), tag("j"), tag("t"))).map(|_| LengthModifier::Size),
        success(LengthModifier::Int),
    ))
    .parse(input)
}

fn pointer_specifier(ext: &[u8]) -> PrintSpecifier {
    match ext {
        [b'h', sep @ ..] => PrintSpecifier::HexBuffer(match sep.first() {
            Some(b'C') => HexBufferSeparator::C,
            Some(b'D') => HexBufferSeparator::D,
            Some(b'N') => HexBufferSeparator::N,
            _ => HexBufferSeparator::Space,
        }),
        [b'b', rest @ ..] => PrintSpecifier::Bitmap {
            list: rest.first() == Some(&b'l'),
        },
        _ => PrintSpecifier::Pointer,
    }
}

fn conversion(input: &[u8]) -> PfResult<'_, PrintSpecifier> {
    context(
        "conversion",
        alt((
            // The kernel skips all the alphanumeric characters following %p
            preceded(char('p'), take_while(|c: u8| c.is_ascii_alphanumeric()))
                .map(pointer_specifier),
            map_res_cut(take(1usize), |c: &[u8]| match c {
                b"d" | b"i" => Ok(PrintSpecifier::Dec),
                b"u" => Ok(PrintSpecifier::Unsigned),
                b"o" => Ok(PrintSpecifier::Oct),
                b"x" => Ok(PrintSpecifier::Hex),
                b"X" => Ok(PrintSpecifier::UpperHex),
                b"c" => Ok(PrintSpecifier::Char),
                b"s" => Ok(PrintSpecifier::Str),
                c => Err(PrintFmtError::IllegalSpecifier(format!("%{}", to_str(c)))),
            }),
        )),
    )
    .parse(input)
}

fn print_atom(input: &[u8]) -> PfResult<'_, PrintAtom> {
    alt((
        preceded(
            char('%'),
            cut(context(
                "specifier",
                alt((
                    char('%').map(|_| PrintAtom::Fixed("%".into())),
                    (
                        print_flags,
                        print_width,
                        print_precision,
                        length_modifier,
                        conversion,
                    )
                        .map(|(flags, width, precision, length, print_spec)| {
                            PrintAtom::Variable {
                                print_spec,
                                length,
                                flags,
                                width,
                                precision,
                            }
                        }),
                )),
            )),
        ),
        context("fixed", is_not("%")).map(|s: &[u8]| PrintAtom::Fixed(to_str(s))),
    ))
    .parse(input)
}

fn print_fmt_str(input: &[u8]) -> PfResult<'_, PrintFmtStr> {
    context("printk format string", many0(print_atom))
        .map(|atoms| PrintFmtStr {
            // Merge consecutive PrintAtom::Fixed together
            atoms: atoms
                .into_iter()
                .coalesce(|prev, curr| match (prev, curr) {
                    (PrintAtom::Fixed(mut prev), PrintAtom::Fixed(curr)) => {
                        prev.push_str(&curr);
                        Ok(PrintAtom::Fixed(prev))
                    }
                    (prev, curr) => Err((prev, curr)),
                })
                .collect(),
        })
        .parse(input)
}
