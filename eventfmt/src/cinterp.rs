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

//! Evaluation of the C expressions of print fmt arguments.

use core::fmt;
use std::{borrow::Cow, string::String as StdString};

use itertools::Itertools as _;

use crate::{
    abi::{Abi, Endianness, MemSize},
    buffer::FieldError,
    cparser::{Accessor, BinaryOp, Expr, Identifier, Type, UnaryOp},
    error::convert_err_impl,
    event::{EventDesc, FieldFmt, FieldKind},
    print::PrintFmtError,
};

/// Errors while evaluating an expression against a record.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvalError {
    #[error("Illegal type of value: {}", match .0 {
        Some(val) => val.to_string(),
        None => "<no value>".into()
    })]
    IllegalType(Option<Value<'static>>),

    #[error("Division by zero")]
    DivByZero,

    #[error("Unknown field: {0}")]
    UnknownField(Identifier),

    #[error("Size of {0} is not known")]
    UnknownSize(StdString),

    #[error("Could not decode field: {0}")]
    Field(Box<FieldError>),
}

convert_err_impl!(FieldError => EvalError::Field);

/// Kernel bitmap value, such as a `cpumask_t`.
///
/// The bitmap is an array of *unsigned long* words, bit `i` of word `n` being bit
/// `n * word_bits + i` of the bitmap.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bitmap<'a> {
    data: Cow<'a, [u8]>,
    chunk_size: MemSize,
    endianness: Endianness,
}

impl<'a> Bitmap<'a> {
    pub fn new(data: Cow<'a, [u8]>, abi: &Abi) -> Self {
        let chunk_size = match abi.bitmap_chunk() {
            chunk if data.len() % chunk == 0 => chunk,
            // Fallback on bytes when the storage is not made of whole words.
            _ => 1,
        };
        Bitmap {
            data,
            chunk_size,
            endianness: abi.endianness,
        }
    }

    #[inline]
    pub fn from_bytes(data: &'a [u8], abi: &Abi) -> Self {
        Self::new(Cow::Borrowed(data), abi)
    }

    /// Bytes of the bitmap, in storage order.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Iterate over the index of the bits that are set, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let chunk_size = self.chunk_size;
        self.data
            .chunks_exact(chunk_size)
            .enumerate()
            .flat_map(move |(i, chunk)| {
                let word = match self.endianness.parse_uint(chunk, chunk_size) {
                    Some((_, word)) => word,
                    None => 0,
                };
                let base = i * chunk_size * 8;
                (0..chunk_size * 8)
                    .filter(move |bit| (word >> bit) & 1 == 1)
                    .map(move |bit| base + bit)
            })
    }

    pub fn into_static(self) -> Bitmap<'static> {
        Bitmap {
            data: Cow::Owned(self.data.into_owned()),
            chunk_size: self.chunk_size,
            endianness: self.endianness,
        }
    }
}

/// List of the bits set, with ranges for consecutive bits, e.g. `0-3,8,10-11`.
impl fmt::Display for Bitmap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let mut range_start = None;
        let mut prev = None;
        let mut sep = "";

        let mut print_range = |range_start, prev, sep| match range_start {
            Some(range_start) if range_start == prev => {
                write!(f, "{sep}{prev}")
            }
            None => write!(f, "{sep}{prev}"),
            Some(range_start) => {
                write!(f, "{sep}{range_start}-{prev}")
            }
        };

        for curr in self.iter() {
            match prev {
                None => range_start = Some(curr),
                Some(prev) => {
                    if curr != prev + 1 {
                        print_range(range_start, prev, sep)?;
                        sep = ",";
                        range_start = Some(curr);
                    }
                }
            };
            prev = Some(curr);
        }
        if let Some(prev) = prev {
            print_range(range_start, prev, sep)?
        }
        Ok(())
    }
}

/// Raw bytes displayed as `ARRAY[xx, xx, ...]`.
pub(crate) struct ByteArray<'a>(pub &'a [u8]);

impl fmt::Display for ByteArray<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "ARRAY[{}]",
            self.0
                .iter()
                .format_with(", ", |byte, f| f(&format_args!("{byte:02x}")))
        )
    }
}

/// Value of an expression or of a field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value<'a> {
    /// Unsigned integer value.
    U64Scalar(u64),
    /// Signed integer value.
    I64Scalar(i64),
    /// String, without its NUL terminator.
    Str(Cow<'a, str>),
    /// Array of bytes.
    U8Array(Cow<'a, [u8]>),
    /// Kernel bitmap, such as `cpumask_t`
    Bitmap(Bitmap<'a>),
}

impl<'a> Value<'a> {
    /// Convert char array values to a [&str].
    pub fn to_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::U8Array(arr) => arr
                .split(|c| *c == 0)
                .next()
                .and_then(|s| core::str::from_utf8(s).ok()),
            _ => None,
        }
    }

    /// Bytes of array-like values.
    pub fn to_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::U8Array(arr) => Some(arr),
            Value::Bitmap(bitmap) => Some(bitmap.as_bytes()),
            _ => None,
        }
    }

    /// Create a static value, which is sometimes necessary to store in some containers such as
    /// errors.
    pub fn into_static(self) -> Value<'static> {
        match self {
            Value::U64Scalar(x) => Value::U64Scalar(x),
            Value::I64Scalar(x) => Value::I64Scalar(x),
            Value::Str(s) => Value::Str(Cow::Owned(s.into_owned())),
            Value::U8Array(arr) => Value::U8Array(Cow::Owned(arr.into_owned())),
            Value::Bitmap(bitmap) => Value::Bitmap(bitmap.into_static()),
        }
    }

    /// Truthiness of the value as a C condition. Non-integer values are backed by a non-NULL
    /// pointer in C.
    #[inline]
    pub fn is_true(&self) -> bool {
        match self {
            Value::U64Scalar(x) => *x != 0,
            Value::I64Scalar(x) => *x != 0,
            _ => true,
        }
    }

    fn to_int(&self) -> Result<Int, EvalError> {
        match self {
            Value::U64Scalar(x) => Ok(Int::Unsigned(*x)),
            Value::I64Scalar(x) => Ok(Int::Signed(*x)),
            val => Err(EvalError::IllegalType(Some(val.clone().into_static()))),
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Value::U64Scalar(x) => write!(f, "{x}"),
            Value::I64Scalar(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            Value::U8Array(arr) => write!(f, "{}", ByteArray(arr)),
            Value::Bitmap(bitmap) => write!(f, "{bitmap}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Int {
    Signed(i64),
    Unsigned(u64),
}

impl Int {
    #[inline]
    fn bits(self) -> u64 {
        match self {
            Int::Signed(x) => x as u64,
            Int::Unsigned(x) => x,
        }
    }
}

/// Truncate `x` to `size` bytes and reinterpret it with the given signedness.
pub(crate) fn cast_int(x: u64, size: MemSize, signed: bool) -> Value<'static> {
    let bits = size.saturating_mul(8);
    if bits >= 64 || bits == 0 {
        match signed {
            true => Value::I64Scalar(x as i64),
            false => Value::U64Scalar(x),
        }
    } else {
        let shift = 64 - bits;
        match signed {
            true => Value::I64Scalar(((x << shift) as i64) >> shift),
            false => Value::U64Scalar((x << shift) >> shift),
        }
    }
}

/// Environment expressions are compiled in.
pub trait CompileEnv {
    fn abi(&self) -> &Abi;
    fn field_fmt(&self, name: &str) -> Option<&FieldFmt>;
}

/// Environment expressions are evaluated in.
pub trait EvalEnv: CompileEnv {
    /// Content of the record being decoded.
    fn event_data(&self) -> &[u8];
}

/// [CompileEnv] of an event.
#[derive(Debug, Clone, Copy)]
pub struct BasicEnv<'a> {
    abi: &'a Abi,
    desc: &'a EventDesc,
}

impl<'a> BasicEnv<'a> {
    #[inline]
    pub fn new(desc: &'a EventDesc, abi: &'a Abi) -> Self {
        BasicEnv { abi, desc }
    }
}

impl CompileEnv for BasicEnv<'_> {
    #[inline]
    fn abi(&self) -> &Abi {
        self.abi
    }

    #[inline]
    fn field_fmt(&self, name: &str) -> Option<&FieldFmt> {
        self.desc.find_any_field(name)
    }
}

/// [EvalEnv] of a record of an event.
#[derive(Debug, Clone, Copy)]
pub struct BufferEnv<'a> {
    env: BasicEnv<'a>,
    data: &'a [u8],
}

impl<'a> BufferEnv<'a> {
    #[inline]
    pub fn new(desc: &'a EventDesc, abi: &'a Abi, data: &'a [u8]) -> Self {
        BufferEnv {
            env: BasicEnv::new(desc, abi),
            data,
        }
    }
}

impl CompileEnv for BufferEnv<'_> {
    #[inline]
    fn abi(&self) -> &Abi {
        self.env.abi()
    }

    #[inline]
    fn field_fmt(&self, name: &str) -> Option<&FieldFmt> {
        self.env.field_fmt(name)
    }
}

impl EvalEnv for BufferEnv<'_> {
    #[inline]
    fn event_data(&self) -> &[u8] {
        self.data
    }
}

/// Size of the operand of `sizeof()`, [None] if it cannot be known statically.
fn sizeof<E: CompileEnv + ?Sized>(expr: &Expr, env: &E) -> Result<Option<MemSize>, FieldError> {
    match expr {
        Expr::SizeofType(typ) | Expr::Cast(typ, _) => typ.size(env.abi()),
        Expr::SizeofExpr(expr) => sizeof(expr, env),
        Expr::Field(name) => match env.field_fmt(name) {
            Some(field) => field.value_size(env.abi()).map(Some),
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

fn eval_binop(op: BinaryOp, lhs: Int, rhs: Int) -> Result<Value<'static>, EvalError> {
    macro_rules! binop {
        ($x:expr, $y:expr, $ctor:path) => {{
            let (x, y) = ($x, $y);
            let bool = |b: bool| Value::I64Scalar(b.into());
            let shift = (y as u64 & 63) as u32;
            match op {
                BinaryOp::Mul => $ctor(x.wrapping_mul(y)),
                BinaryOp::Div if y == 0 => return Err(EvalError::DivByZero),
                BinaryOp::Div => $ctor(x.wrapping_div(y)),
                BinaryOp::Mod if y == 0 => return Err(EvalError::DivByZero),
                BinaryOp::Mod => $ctor(x.wrapping_rem(y)),
                BinaryOp::Add => $ctor(x.wrapping_add(y)),
                BinaryOp::Sub => $ctor(x.wrapping_sub(y)),
                BinaryOp::LShift => $ctor(x.wrapping_shl(shift)),
                BinaryOp::RShift => $ctor(x.wrapping_shr(shift)),
                BinaryOp::Lo => bool(x < y),
                BinaryOp::Hi => bool(x > y),
                BinaryOp::LoEq => bool(x <= y),
                BinaryOp::HiEq => bool(x >= y),
                BinaryOp::Eq => bool(x == y),
                BinaryOp::NEq => bool(x != y),
                BinaryOp::BitAnd => $ctor(x & y),
                BinaryOp::BitXor => $ctor(x ^ y),
                BinaryOp::BitOr => $ctor(x | y),
                BinaryOp::And => bool(x != 0 && y != 0),
                BinaryOp::Or => bool(x != 0 || y != 0),
            }
        }};
    }

    Ok(match (lhs, rhs) {
        (Int::Signed(x), Int::Signed(y)) => binop!(x, y, Value::I64Scalar),
        // The usual arithmetic conversions make the operation unsigned as soon as one of the
        // operands is unsigned.
        (lhs, rhs) => binop!(lhs.bits(), rhs.bits(), Value::U64Scalar),
    })
}

/// Convert the value to `typ`, for integer types. Other values are left untouched.
fn cast<'a>(typ: &Type, val: Value<'a>, abi: &Abi) -> Result<Value<'a>, EvalError> {
    let x = match val.to_int() {
        Ok(x) => x.bits(),
        Err(_) => return Ok(val),
    };
    let (size, signed) = match typ.resolve() {
        Type::Bool => return Ok(Value::U64Scalar((x != 0).into())),
        Type::Char | Type::I8 => (1, true),
        Type::U8 => (1, false),
        Type::I16 => (2, true),
        Type::U16 => (2, false),
        Type::I32 => (4, true),
        Type::U32 => (4, false),
        Type::I64 => (8, true),
        Type::U64 => (8, false),
        Type::Long(signedness) => (abi.long_bytes()?, signedness.is_signed()),
        Type::Pointer(_) => (abi.long_bytes()?, false),
        _ => return Ok(val),
    };
    Ok(cast_int(x, size, signed))
}

impl Expr {
    /// Check the expression against the fields of the event and fold the constant parts that
    /// depend on the ABI, such as `sizeof()`.
    ///
    /// Both compilation and evaluation recurse over the tree. The depth of parsed expressions
    /// is bounded by [MAX_NESTING](crate::cparser::MAX_NESTING) and
    /// [MAX_EXPR_DEPTH](crate::cparser::MAX_EXPR_DEPTH).
    pub fn compile<E: CompileEnv + ?Sized>(self, env: &E) -> Result<Expr, PrintFmtError> {
        let recurse = |expr: Box<Expr>| -> Result<Box<Expr>, PrintFmtError> {
            Ok(Box::new(expr.compile(env)?))
        };
        let check_field = |name: Identifier| match env.field_fmt(&name) {
            Some(_) => Ok(name),
            None => Err(PrintFmtError::UnknownField(name)),
        };
        let sizeof = |expr: Expr| -> Result<Expr, PrintFmtError> {
            match sizeof(&expr, env)? {
                Some(size) => Ok(Expr::IntConstant(Type::U64, size as u64)),
                None => Err(PrintFmtError::UnknownSize(format!("{expr:?}"))),
            }
        };

        Ok(match self {
            expr @ (Expr::IntConstant(..) | Expr::StringLiteral(_)) => expr,
            Expr::Field(name) => Expr::Field(check_field(name)?),
            expr @ (Expr::SizeofType(_) | Expr::SizeofExpr(_)) => {
                // Validate field names before looking at their size.
                let expr = match expr {
                    Expr::SizeofExpr(inner) => Expr::SizeofExpr(recurse(inner)?),
                    expr => expr,
                };
                sizeof(expr)?
            }
            Expr::Unary(op, expr) => Expr::Unary(op, recurse(expr)?),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(op, recurse(lhs)?, recurse(rhs)?),
            Expr::Ternary(cond, lhs, rhs) => {
                Expr::Ternary(recurse(cond)?, recurse(lhs)?, recurse(rhs)?)
            }
            Expr::Cast(typ, expr) => Expr::Cast(typ, recurse(expr)?),
            Expr::Accessor(accessor) => Expr::Accessor(match accessor {
                Accessor::Str(name) => Accessor::Str(check_field(name)?),
                Accessor::DynamicArray(name) => Accessor::DynamicArray(check_field(name)?),
                Accessor::DynamicArrayLen(name) => Accessor::DynamicArrayLen(check_field(name)?),
                Accessor::Bitmask(name) => Accessor::Bitmask(check_field(name)?),
                Accessor::Symbolic(val, table) => Accessor::Symbolic(
                    recurse(val)?,
                    table
                        .into_iter()
                        .map(|(key, s)| Ok((key.compile(env)?, s)))
                        .collect::<Result<_, PrintFmtError>>()?,
                ),
                Accessor::Flags(val, sep, table) => Accessor::Flags(
                    recurse(val)?,
                    sep,
                    table
                        .into_iter()
                        .map(|(key, s)| Ok((key.compile(env)?, s)))
                        .collect::<Result<_, PrintFmtError>>()?,
                ),
                Accessor::Hex {
                    buf,
                    len,
                    separated,
                } => Accessor::Hex {
                    buf: recurse(buf)?,
                    len: recurse(len)?,
                    separated,
                },
            }),
        })
    }

    /// Evaluate the expression against the record of `env`.
    pub fn eval<'a, E: EvalEnv + ?Sized>(&'a self, env: &'a E) -> Result<Value<'a>, EvalError> {
        let field = |name: &Identifier| {
            env.field_fmt(name)
                .ok_or_else(|| EvalError::UnknownField(name.clone()))
        };
        let decode = |name: &Identifier| -> Result<Value<'a>, EvalError> {
            Ok(field(name)?.decode(env.event_data(), env.abi())?)
        };

        match self {
            Expr::IntConstant(typ, x) => Ok(match typ.signedness() {
                Some(signedness) if signedness.is_signed() => Value::I64Scalar(*x as i64),
                _ => Value::U64Scalar(*x),
            }),
            Expr::StringLiteral(s) => Ok(Value::Str(Cow::Borrowed(s))),
            Expr::Field(name) => decode(name),

            Expr::SizeofType(_) | Expr::SizeofExpr(_) => match sizeof(self, env)? {
                Some(size) => Ok(Value::U64Scalar(size as u64)),
                None => Err(EvalError::UnknownSize(format!("{self:?}"))),
            },

            Expr::Unary(UnaryOp::Bang, expr) => {
                Ok(Value::I64Scalar((!expr.eval(env)?.is_true()).into()))
            }
            Expr::Unary(op, expr) => {
                let val = expr.eval(env)?;
                Ok(match (op, val.to_int()?) {
                    (UnaryOp::Minus, Int::Signed(x)) => Value::I64Scalar(x.wrapping_neg()),
                    (UnaryOp::Minus, Int::Unsigned(x)) => Value::U64Scalar(x.wrapping_neg()),
                    (UnaryOp::Tilde, Int::Signed(x)) => Value::I64Scalar(!x),
                    (UnaryOp::Tilde, Int::Unsigned(x)) => Value::U64Scalar(!x),
                    (UnaryOp::Plus | UnaryOp::Bang, _) => val,
                })
            }

            Expr::Binary(BinaryOp::And, lhs, rhs) => Ok(Value::I64Scalar(
                (lhs.eval(env)?.is_true() && rhs.eval(env)?.is_true()).into(),
            )),
            Expr::Binary(BinaryOp::Or, lhs, rhs) => Ok(Value::I64Scalar(
                (lhs.eval(env)?.is_true() || rhs.eval(env)?.is_true()).into(),
            )),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(env)?.to_int()?;
                let rhs = rhs.eval(env)?.to_int()?;
                eval_binop(*op, lhs, rhs)
            }

            Expr::Ternary(cond, lhs, rhs) => match cond.eval(env)?.is_true() {
                true => lhs.eval(env),
                false => rhs.eval(env),
            },
            Expr::Cast(typ, expr) => cast(typ, expr.eval(env)?, env.abi()),

            Expr::Accessor(accessor) => match accessor {
                Accessor::Str(name) => Ok(match decode(name)? {
                    Value::U8Array(arr) => {
                        let s = match arr {
                            Cow::Borrowed(arr) => {
                                let arr = arr.split(|c| *c == 0).next().unwrap_or(arr);
                                StdString::from_utf8_lossy(arr)
                            }
                            Cow::Owned(arr) => Cow::Owned(
                                StdString::from_utf8_lossy(
                                    arr.split(|c| *c == 0).next().unwrap_or(&arr),
                                )
                                .into_owned(),
                            ),
                        };
                        Value::Str(s)
                    }
                    val => val,
                }),
                Accessor::DynamicArray(name) => decode(name),
                Accessor::DynamicArrayLen(name) => {
                    let field = field(name)?;
                    let len = match field.kind {
                        FieldKind::Fixed => field.size,
                        _ => field.dynamic_data(env.event_data(), env.abi())?.len(),
                    };
                    Ok(Value::U64Scalar(len as u64))
                }
                Accessor::Bitmask(name) => Ok(match decode(name)? {
                    Value::U8Array(arr) => Value::Bitmap(Bitmap::new(arr, env.abi())),
                    Value::Str(Cow::Borrowed(s)) => {
                        Value::Bitmap(Bitmap::from_bytes(s.as_bytes(), env.abi()))
                    }
                    Value::Str(Cow::Owned(s)) => {
                        Value::Bitmap(Bitmap::new(Cow::Owned(s.into_bytes()), env.abi()))
                    }
                    val => val,
                }),
                Accessor::Symbolic(val, table) => {
                    let x = val.eval(env)?.to_int()?.bits();
                    for (key, s) in table {
                        if key.eval(env)?.to_int()?.bits() == x {
                            return Ok(Value::Str(Cow::Borrowed(s)));
                        }
                    }
                    Ok(Value::Str(Cow::Owned(format!("0x{x:x}"))))
                }
                Accessor::Flags(val, sep, table) => {
                    let x = val.eval(env)?.to_int()?.bits();
                    let mut out = StdString::new();
                    let mut remaining = x;
                    for (key, s) in table {
                        let key = key.eval(env)?.to_int()?.bits();
                        if key == 0 {
                            if x == 0 {
                                return Ok(Value::Str(Cow::Borrowed(s)));
                            }
                        } else if remaining & key == key {
                            if !out.is_empty() {
                                out.push_str(sep);
                            }
                            out.push_str(s);
                            remaining &= !key;
                        }
                    }
                    if remaining != 0 {
                        if !out.is_empty() {
                            out.push_str(sep);
                        }
                        out.push_str(&format!("0x{remaining:x}"));
                    }
                    Ok(Value::Str(Cow::Owned(out)))
                }
                Accessor::Hex {
                    buf,
                    len,
                    separated,
                } => {
                    let buf = buf.eval(env)?;
                    let len = len.eval(env)?.to_int()?.bits();
                    let bytes = buf
                        .to_bytes()
                        .ok_or_else(|| EvalError::IllegalType(Some(buf.clone().into_static())))?;
                    let len = bytes.len().min(usize::try_from(len).unwrap_or(usize::MAX));
                    let sep = if *separated { " " } else { "" };
                    let s = bytes[..len]
                        .iter()
                        .format_with(sep, |byte, f| f(&format_args!("{byte:02x}")))
                        .to_string();
                    Ok(Value::Str(Cow::Owned(s)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        abi::LongSize,
        cparser,
        event::tests::{CPUMASK_FMT, DYN_STR_FMT, sizeof_fmt},
        parser::NomParserExt as _,
    };

    fn parse_expr(src: &str) -> Expr {
        cparser::expr.parse_finish(src.as_bytes()).unwrap()
    }

    fn dyn_str_record() -> Vec<u8> {
        let mut data = vec![1, 0, 0, 0, 0, 0, 0, 0];
        data.extend((-42i32).to_le_bytes());
        data.extend([16, 0, 6, 0]);
        data.extend(b"hello\0");
        data.extend([0, 0]);
        data
    }

    fn eval(desc: &EventDesc, abi: &Abi, data: &[u8], src: &str) -> Result<String, EvalError> {
        let env = BufferEnv::new(desc, abi, data);
        let expr = parse_expr(src).compile(&env).unwrap();
        expr.eval(&env).map(|val| val.to_string())
    }

    #[test]
    fn bitmap_test() {
        let abi = Abi::new(Endianness::Little, Some(LongSize::Bits64));
        let test = |data: &[u8], expected: &str| {
            assert_eq!(Bitmap::from_bytes(data, &abi).to_string(), expected);
        };

        test(&[0xff; 8], "0-63");
        test(&[0; 8], "");
        test(&[0x01, 0x80, 0, 0, 0, 0, 0, 0], "0,15");
        test(&[0x01, 0, 0x80, 0, 0, 0, 0, 0], "0,23");
        test(&[0x01, 0, 0, 0, 0, 0, 0, 0x80], "0,63");
        test(&[0b0000_1111, 0b0000_1101, 0, 0, 0, 0, 0, 0], "0-3,8,10-11");
        // Not a whole number of words
        test(&[0x03, 0x01, 0x80], "0-1,8,23");

        let big = Abi::new(Endianness::Big, Some(LongSize::Bits32));
        let bitmap = Bitmap::from_bytes(&[0, 0, 0, 0x01, 0x80, 0, 0, 0], &big);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 63]);
    }

    #[test]
    fn byte_array_test() {
        assert_eq!(ByteArray(&[0xff, 0x0a, 0]).to_string(), "ARRAY[ff, 0a, 00]");
        assert_eq!(ByteArray(&[]).to_string(), "ARRAY[]");
    }

    #[test]
    fn cast_int_test() {
        assert_eq!(cast_int(0xff, 1, true), Value::I64Scalar(-1));
        assert_eq!(cast_int(0x1ff, 1, false), Value::U64Scalar(0xff));
        assert_eq!(cast_int(0xffff_ffff, 4, true), Value::I64Scalar(-1));
        assert_eq!(cast_int(u64::MAX, 8, false), Value::U64Scalar(u64::MAX));
        assert_eq!(cast_int(u64::MAX, 8, true), Value::I64Scalar(-1));
    }

    #[test]
    fn eval_test() {
        let desc = EventDesc::parse(DYN_STR_FMT, "test").unwrap();
        let abi = Abi::new(Endianness::Little, Some(LongSize::Bits64));
        let data = dyn_str_record();
        let test = |src: &str, expected: &str| {
            assert_eq!(eval(&desc, &abi, &data, src), Ok(expected.to_string()), "{src}");
        };

        test("REC->irq", "-42");
        test("irq", "-42");
        test("REC->common_type", "1");
        test("__get_str(name)", "hello");
        test("__get_dynamic_array_len(name)", "6");
        test("REC->irq + 2", "-40");
        test("REC->irq * 2 - 1", "-85");
        test("REC->irq / 4", "-10");
        test("REC->irq % 4", "-2");
        test("-REC->irq", "42");
        test("~0", "-1");
        test("!REC->irq", "0");
        test("!!REC->irq", "1");
        test("1 << 4 | 1", "17");
        test("0xf0 >> 4 & 0x3", "3");
        test("5 ^ 1", "4");
        test("REC->irq < 0", "1");
        test("REC->irq >= 0", "0");
        test("REC->irq == -42", "1");
        test("REC->irq != -42", "0");
        test("REC->irq && 0", "0");
        test("0 || REC->irq", "1");
        test("REC->irq < 0 ? 10 : 20", "10");
        test("REC->irq ?: 20", "-42");
        test("(unsigned char)REC->irq", "214");
        test("(unsigned int)REC->irq", "4294967254");
        test("(unsigned long)REC->irq", "18446744073709551574");
        test("(bool)REC->irq", "1");
        // Mixing signed and unsigned operands gives an unsigned result.
        test("REC->irq + 1U", "18446744073709551575");
        test("1U - 2", "18446744073709551615");
        test("sizeof(int)", "4");
        test("sizeof(REC->irq)", "4");
        test("__print_symbolic(REC->common_type, { 0, \"zero\" }, { 1, \"one\" })", "one");
        test("__print_symbolic(3, { 0, \"zero\" }, { 1, \"one\" })", "0x3");
        test("__print_flags(5, \"|\", { 1, \"A\" }, { 2, \"B\" }, { 4, \"C\" })", "A|C");
        test("__print_flags(9, \"|\", { 1, \"A\" }, { 2, \"B\" })", "A|0x8");
        test("__print_flags(0, \"|\", { 0, \"NONE\" }, { 1, \"A\" })", "NONE");
        test("__print_hex(__get_dynamic_array(name), 3)", "68 65 6c");
        test("__print_hex_str(__get_dynamic_array(name), 100)", "68656c6c6f");
    }

    #[test]
    fn eval_error_test() {
        let desc = EventDesc::parse(DYN_STR_FMT, "test").unwrap();
        let abi = Abi::new(Endianness::Little, None);
        let data = dyn_str_record();

        assert_eq!(eval(&desc, &abi, &data, "REC->irq / 0"), Err(EvalError::DivByZero));
        assert_eq!(eval(&desc, &abi, &data, "REC->irq % 0"), Err(EvalError::DivByZero));
        assert!(matches!(
            eval(&desc, &abi, &data, "__get_str(name) + 1"),
            Err(EvalError::IllegalType(_))
        ));
        assert_eq!(
            eval(&desc, &abi, &data, "(long)REC->irq"),
            Err(EvalError::Field(Box::new(FieldError::UndefinedLongSize)))
        );
        assert!(matches!(
            eval(&desc, &abi, &data[..10], "REC->name"),
            Err(EvalError::Field(_))
        ));
    }

    #[test]
    fn bitmask_accessor_test() {
        let desc = EventDesc::parse(CPUMASK_FMT, "test").unwrap();
        let abi = Abi::new(Endianness::Little, Some(LongSize::Bits64));
        let mut data = vec![3, 0, 0, 0, 0, 0, 0, 0, 16, 0, 8, 0, 0, 0, 0, 0];
        data.extend([0x55; 8]);

        let evens = (0..64).step_by(2).map(|x| x.to_string()).join(",");
        assert_eq!(eval(&desc, &abi, &data, "__get_cpumask(cpumask)"), Ok(evens));
    }

    #[test]
    fn compile_test() {
        let desc = EventDesc::parse(sizeof_fmt(23), "test").unwrap();
        let compile = |abi: &Abi, src: &str| parse_expr(src).compile(&BasicEnv::new(&desc, abi));

        let abi64 = Abi::new(Endianness::Little, Some(LongSize::Bits64));
        let abi32 = Abi::new(Endianness::Little, Some(LongSize::Bits32));
        let undefined = Abi::new(Endianness::Little, None);
        let size = |size| Ok(Expr::IntConstant(Type::U64, size));

        assert_eq!(compile(&abi64, "sizeof(long)"), size(8));
        assert_eq!(compile(&abi32, "sizeof(unsigned long)"), size(4));
        assert_eq!(compile(&abi32, "sizeof(long long)"), size(8));
        assert_eq!(compile(&abi32, "sizeof(char *)"), size(4));
        assert_eq!(compile(&undefined, "sizeof(short)"), size(2));
        assert_eq!(compile(&undefined, "sizeof(REC->s8)"), size(8));
        assert_eq!(
            compile(&undefined, "sizeof(long)"),
            Err(PrintFmtError::Field(Box::new(FieldError::UndefinedLongSize)))
        );
        assert_eq!(
            compile(&abi64, "REC->nope + 1"),
            Err(PrintFmtError::UnknownField("nope".into()))
        );
        assert_eq!(
            compile(&abi64, "sizeof(REC->nope)"),
            Err(PrintFmtError::UnknownField("nope".into()))
        );
        assert_eq!(
            compile(&abi64, "__get_str(nope)"),
            Err(PrintFmtError::UnknownField("nope".into()))
        );
        assert_eq!(
            compile(&abi64, "REC->s4 ? 1 : 2"),
            Ok(parse_expr("REC->s4 ? 1 : 2"))
        );
    }
}
