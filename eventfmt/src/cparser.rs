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

//! C language parser for the subset of C found in event formats: field declarations and the
//! expressions used as print fmt arguments.

use std::{cell::Cell, string::String as StdString};

use nom::{
    Parser,
    branch::alt,
    bytes::complete::{is_not, tag, take, take_while, take_while_m_n, take_while1},
    character::complete::{char, digit1, hex_digit1, multispace0, oct_digit0},
    combinator::{cut, map_opt, not, opt, recognize, rest},
    error::context,
    multi::{fold_many0, many0, many1, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
};

use crate::{
    abi::{Abi, MemSize, Signedness},
    buffer::FieldError,
    parser::{
        FromParseError, NomError, PResult, VerboseNomError, VerboseParseError, failure,
        identifier, keyword, lexeme, map_res_cut, parenthesized, to_str,
    },
};

/// Identifier of a C symbol, field or event.
pub type Identifier = smartstring::alias::String;

/// Maximum number of nested parenthesized, unary and conditional expressions accepted by the
/// parser.
pub const MAX_NESTING: usize = 32;

/// Maximum depth of a parsed expression tree.
pub const MAX_EXPR_DEPTH: usize = 64;

/// Typedefs of kernel bitmaps, rendered as a list of set bits.
const BITMAP_TYPEDEFS: &[&str] = &[
    "cpumask_t",
    "nodemask_t",
    "dma_cap_mask_t",
    "pnp_irq_mask_t",
];

/// Location encoding keyword in front of a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DynamicKind {
    /// `__data_loc`: the location is counted from the beginning of the record.
    Dynamic,
    /// `__rel_loc`: the location is counted from the end of the location field.
    DynamicRel,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArrayKind {
    /// Fixed size array. The size is [None] when it is given by a symbolic constant.
    Fixed(Option<usize>),
    /// Flexible array member `[]`.
    ZeroLength,
    /// Array stored elsewhere in the record, see [DynamicKind].
    Dynamic(DynamicKind),
}

/// C type of a field or of a cast/sizeof operand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    Void,
    Bool,
    /// Plain `char`, whose signedness is left to the ABI.
    Char,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    /// C `long`, sized by [Abi::long_size].
    Long(Signedness),
    /// Type that could not be resolved yet.
    Unknown,
    Typedef(Box<Type>, Identifier),
    Enum(Box<Type>, Identifier),
    Struct(Identifier),
    Pointer(Box<Type>),
    Array(Box<Type>, ArrayKind),
    /// `__data_loc` scalar, without array brackets.
    DynamicScalar(Box<Type>, DynamicKind),
}

impl Type {
    /// Strip typedef and enum layers.
    #[inline]
    pub fn resolve(&self) -> &Type {
        match self {
            Type::Typedef(typ, _) | Type::Enum(typ, _) => typ.resolve(),
            typ => typ,
        }
    }

    /// Size of the type in bytes, or [None] if it cannot be known.
    pub fn size(&self, abi: &Abi) -> Result<Option<MemSize>, FieldError> {
        Ok(match self {
            Type::Bool | Type::Char | Type::U8 | Type::I8 => Some(1),
            Type::U16 | Type::I16 => Some(2),
            Type::U32 | Type::I32 => Some(4),
            Type::U64 | Type::I64 => Some(8),
            Type::Long(_) | Type::Pointer(_) => Some(abi.long_bytes()?),
            Type::Typedef(typ, _) | Type::Enum(typ, _) => typ.size(abi)?,
            Type::Array(typ, ArrayKind::Fixed(Some(n))) => typ.size(abi)?.map(|size| size * n),
            Type::Void
            | Type::Unknown
            | Type::Struct(_)
            | Type::Array(..)
            | Type::DynamicScalar(..) => None,
        })
    }

    /// Signedness of integer types.
    pub fn signedness(&self) -> Option<Signedness> {
        match self.resolve() {
            Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Long(Signedness::Signed) => {
                Some(Signedness::Signed)
            }
            Type::Bool
            | Type::U8
            | Type::U16
            | Type::U32
            | Type::U64
            | Type::Long(Signedness::Unsigned)
            | Type::Pointer(_) => Some(Signedness::Unsigned),
            _ => None,
        }
    }

    /// Whether the size of the type is the size of the C *long* type.
    #[inline]
    pub fn is_long_sized(&self) -> bool {
        matches!(self.resolve(), Type::Long(_) | Type::Pointer(_))
    }

    /// Whether the type is an array of characters, i.e. a string.
    #[inline]
    pub fn is_string(&self) -> bool {
        match self {
            Type::Array(typ, _) | Type::DynamicScalar(typ, _) => matches!(**typ, Type::Char),
            _ => false,
        }
    }

    /// Whether the type is a kernel bitmap, or a pointer to one.
    pub fn is_bitmap(&self) -> bool {
        match self {
            Type::Pointer(typ) => typ.is_bitmap(),
            Type::Typedef(_, name) => BITMAP_TYPEDEFS.contains(&name.as_str()),
            Type::Struct(name) => name == "cpumask",
            _ => false,
        }
    }
}

/// Declaration of a field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Declaration {
    pub identifier: Identifier,
    pub typ: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnaryOp {
    Minus,
    Plus,
    /// `~`
    Tilde,
    /// `!`
    Bang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinaryOp {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    LShift,
    RShift,
    Lo,
    Hi,
    LoEq,
    HiEq,
    Eq,
    NEq,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

/// Function-like macros that can appear in a print fmt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Accessor {
    /// `__get_str(field)`
    Str(Identifier),
    /// `__get_dynamic_array(field)`
    DynamicArray(Identifier),
    /// `__get_dynamic_array_len(field)`
    DynamicArrayLen(Identifier),
    /// `__get_cpumask(field)` and `__get_bitmask(field)`
    Bitmask(Identifier),
    /// `__print_symbolic(value, {key, "name"}, ...)`
    Symbolic(Box<Expr>, Vec<(Expr, StdString)>),
    /// `__print_flags(value, "separator", {key, "name"}, ...)`
    Flags(Box<Expr>, StdString, Vec<(Expr, StdString)>),
    /// `__print_hex(buffer, len)`, with a separator unless it is `__print_hex_str()`
    Hex {
        buf: Box<Expr>,
        len: Box<Expr>,
        separated: bool,
    },
}

/// Expression tree of print fmt arguments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    IntConstant(Type, u64),
    StringLiteral(StdString),
    /// Event field, either spelled `REC->name` or just `name`.
    Field(Identifier),

    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Cast(Type, Box<Expr>),

    SizeofType(Type),
    SizeofExpr(Box<Expr>),

    Accessor(Accessor),
}

impl Expr {
    #[inline]
    pub fn record_field(name: &str) -> Self {
        Expr::Field(name.into())
    }

    /// Depth of the expression tree, a leaf having a depth of 1.
    pub fn depth(&self) -> usize {
        let children = match self {
            Expr::IntConstant(..) | Expr::StringLiteral(_) | Expr::Field(_) | Expr::SizeofType(_) => {
                return 1;
            }
            Expr::Unary(_, expr) | Expr::Cast(_, expr) | Expr::SizeofExpr(expr) => expr.depth(),
            Expr::Binary(_, lhs, rhs) => lhs.depth().max(rhs.depth()),
            Expr::Ternary(cond, then, els) => cond.depth().max(then.depth()).max(els.depth()),
            Expr::Accessor(accessor) => match accessor {
                Accessor::Str(_)
                | Accessor::DynamicArray(_)
                | Accessor::DynamicArrayLen(_)
                | Accessor::Bitmask(_) => 0,
                Accessor::Symbolic(val, table) | Accessor::Flags(val, _, table) => table
                    .iter()
                    .map(|(key, _)| key.depth())
                    .fold(val.depth(), usize::max),
                Accessor::Hex { buf, len, .. } => buf.depth().max(len.depth()),
            },
        };
        children + 1
    }
}

/// Errors while parsing C declarations and expressions.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CParseError {
    #[error("Could not parse C code: {0}")]
    ParseError(Box<VerboseParseError>),

    #[error("Declaration does not have an identifier: {0}")]
    DeclarationWithoutIdentifier(StdString),

    #[error("Invalid type in declaration: {0}")]
    InvalidType(StdString),

    #[error("Unexpected token after the identifier in declaration: {0}")]
    UnexpectedToken(StdString),

    #[error("Invalid integer constant: {0}")]
    InvalidIntegerConstant(StdString),

    #[error("Character constant out of range: {0}")]
    CharOutOfRange(u32),

    #[error("Unknown function-like macro: {0}")]
    UnknownAccessor(Identifier),

    #[error("{name}() expects {expected} argument(s) but got {found}")]
    AccessorArity {
        name: Identifier,
        expected: usize,
        found: usize,
    },

    #[error("Invalid argument for {0}(): {1}")]
    InvalidAccessorArg(Identifier, StdString),

    #[error("Expression nested deeper than {0} levels")]
    NestingTooDeep(usize),
}

impl<'i> FromParseError<&'i [u8], VerboseNomError<'i>> for CParseError {
    fn from_parse_error(input: &'i [u8], err: &VerboseNomError<'i>) -> Self {
        CParseError::ParseError(Box::new(VerboseParseError::new(input, err)))
    }
}

type CResult<'i, O> = PResult<'i, O, CParseError>;

//////////////////////
// Types
//////////////////////

/// Keywords that are part of a type specifier. Known typedefs are not keywords, so that they
/// can still be used as identifiers.
fn is_type_keyword(word: &[u8]) -> bool {
    matches!(
        word,
        b"unsigned"
            | b"signed"
            | b"short"
            | b"long"
            | b"int"
            | b"char"
            | b"bool"
            | b"_Bool"
            | b"void"
            | b"struct"
            | b"union"
            | b"enum"
    )
}

#[inline]
fn is_qualifier(word: &[u8]) -> bool {
    matches!(
        word,
        b"const" | b"volatile" | b"__user" | b"__iomem" | b"__rcu" | b"__percpu"
    )
}

fn known_typedef(name: &[u8]) -> Option<Type> {
    let typedef = |typ, name: &str| Type::Typedef(Box::new(typ), name.into());
    Some(match name {
        b"u8" | b"__u8" | b"uint8_t" | b"u_int8_t" => Type::U8,
        b"s8" | b"__s8" | b"int8_t" => Type::I8,
        b"u16" | b"__u16" | b"uint16_t" | b"u_int16_t" => Type::U16,
        b"s16" | b"__s16" | b"int16_t" => Type::I16,
        b"u32" | b"__u32" | b"uint32_t" | b"u_int32_t" => Type::U32,
        b"s32" | b"__s32" | b"int32_t" => Type::I32,
        b"u64" | b"__u64" | b"uint64_t" | b"u_int64_t" => Type::U64,
        b"s64" | b"__s64" | b"int64_t" => Type::I64,
        b"pid_t" => typedef(Type::I32, "pid_t"),
        b"uid_t" => typedef(Type::U32, "uid_t"),
        b"gid_t" => typedef(Type::U32, "gid_t"),
        b"size_t" => typedef(Type::Long(Signedness::Unsigned), "size_t"),
        b"ssize_t" => typedef(Type::Long(Signedness::Signed), "ssize_t"),
        b"uintptr_t" => typedef(Type::Long(Signedness::Unsigned), "uintptr_t"),
        b"loff_t" => typedef(Type::I64, "loff_t"),
        _ => return None,
    })
}

/// Build the base type out of the words of a type specifier, e.g. `unsigned long long`.
fn base_type(words: &[&[u8]]) -> Result<Type, CParseError> {
    let invalid = || {
        let words: Vec<_> = words.iter().map(|w| to_str(w)).collect();
        CParseError::InvalidType(words.join(" "))
    };

    match words {
        [b"struct" | b"union", name] => Ok(Type::Struct(to_str(name).into())),
        [b"enum", name] => Ok(Type::Enum(Box::new(Type::Unknown), to_str(name).into())),
        [name] if !is_type_keyword(name) => Ok(known_typedef(name)
            .unwrap_or_else(|| Type::Typedef(Box::new(Type::Unknown), to_str(name).into()))),
        _ => {
            let mut signedness = None;
            let (mut short, mut long, mut int, mut char, mut bool, mut void) =
                (0, 0, 0, 0, 0, 0);
            for word in words {
                match *word {
                    b"unsigned" if signedness.is_none() => {
                        signedness = Some(Signedness::Unsigned)
                    }
                    b"signed" if signedness.is_none() => signedness = Some(Signedness::Signed),
                    b"short" => short += 1,
                    b"long" => long += 1,
                    b"int" => int += 1,
                    b"char" => char += 1,
                    b"bool" | b"_Bool" => bool += 1,
                    b"void" => void += 1,
                    _ => return Err(invalid()),
                }
            }

            let signed = signedness != Some(Signedness::Unsigned);
            let pick = |signed_typ, unsigned_typ| if signed { signed_typ } else { unsigned_typ };
            match (short, long, int, char, bool, void) {
                (0, 0, 0 | 1, 0, 0, 0) => Ok(pick(Type::I32, Type::U32)),
                (1, 0, 0 | 1, 0, 0, 0) => Ok(pick(Type::I16, Type::U16)),
                (0, 1, 0 | 1, 0, 0, 0) => Ok(Type::Long(if signed {
                    Signedness::Signed
                } else {
                    Signedness::Unsigned
                })),
                (0, 2, 0 | 1, 0, 0, 0) => Ok(pick(Type::I64, Type::U64)),
                (0, 0, 0, 1, 0, 0) => Ok(match signedness {
                    None => Type::Char,
                    Some(Signedness::Signed) => Type::I8,
                    Some(Signedness::Unsigned) => Type::U8,
                }),
                (0, 0, 0, 0, 1, 0) if signedness.is_none() => Ok(Type::Bool),
                (0, 0, 0, 0, 0, 1) if signedness.is_none() => Ok(Type::Void),
                _ => Err(invalid()),
            }
        }
    }
}

/// Whether the words can only be a type name. Unknown typedefs are rejected so that a
/// parenthesized field name is not mistaken for a cast.
fn is_type_name(words: &[&[u8]]) -> bool {
    match words {
        [] => false,
        [b"struct" | b"union" | b"enum", _] => true,
        [name] if known_typedef(name).is_some() => true,
        words => words.iter().all(|w| is_type_keyword(w)),
    }
}

/// Type name as found in casts and `sizeof()`, e.g. `unsigned long` or `struct foo *`.
fn type_name(input: &[u8]) -> CResult<'_, Type> {
    map_opt(
        (
            many1(lexeme(identifier)),
            many0(lexeme(terminated(char('*'), not(char('='))))),
        ),
        |(words, stars): (Vec<&[u8]>, Vec<char>)| {
            let words: Vec<_> = words.into_iter().filter(|w| !is_qualifier(w)).collect();
            if is_type_name(&words) {
                let typ = base_type(&words).ok()?;
                Some(
                    stars
                        .into_iter()
                        .fold(typ, |typ, _| Type::Pointer(Box::new(typ))),
                )
            } else {
                None
            }
        },
    )
    .parse(input)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeclToken<'i> {
    Word(&'i [u8]),
    Star,
    Array(Option<&'i [u8]>),
}

fn array_kind(size: Option<&[u8]>) -> ArrayKind {
    let size = size.map(|s| to_str(s).trim().to_owned());
    match size.as_deref() {
        None | Some("") => ArrayKind::ZeroLength,
        Some(size) => ArrayKind::Fixed(size.parse().ok()),
    }
}

fn build_declaration(decl: &[u8], tokens: Vec<DeclToken<'_>>) -> Result<Declaration, CParseError> {
    let mut dynamic = None;
    let tokens: Vec<_> = tokens
        .into_iter()
        .filter(|token| match token {
            DeclToken::Word(b"__data_loc") => {
                dynamic = Some(DynamicKind::Dynamic);
                false
            }
            DeclToken::Word(b"__rel_loc") => {
                dynamic = Some(DynamicKind::DynamicRel);
                false
            }
            DeclToken::Word(word) => !is_qualifier(word),
            _ => true,
        })
        .collect();

    let name_pos = tokens
        .iter()
        .rposition(|token| matches!(token, DeclToken::Word(word) if !is_type_keyword(word)))
        .ok_or_else(|| CParseError::DeclarationWithoutIdentifier(to_str(decl)))?;

    let identifier = match tokens[name_pos] {
        DeclToken::Word(name) => to_str(name).into(),
        _ => return Err(CParseError::DeclarationWithoutIdentifier(to_str(decl))),
    };

    let mut words = Vec::new();
    let mut stars = 0;
    let mut arrays = Vec::new();
    for token in &tokens[..name_pos] {
        match token {
            DeclToken::Word(word) if arrays.is_empty() && stars == 0 => words.push(*word),
            DeclToken::Star if arrays.is_empty() => stars += 1,
            DeclToken::Array(size) => arrays.push(array_kind(*size)),
            _ => return Err(CParseError::InvalidType(to_str(decl))),
        }
    }
    for token in &tokens[name_pos + 1..] {
        match token {
            DeclToken::Array(size) => arrays.push(array_kind(*size)),
            _ => return Err(CParseError::UnexpectedToken(to_str(decl))),
        }
    }

    let typ = if words.is_empty() {
        match (dynamic, stars, arrays.len()) {
            // Older kernels emit "__data_loc name" for dynamic strings.
            (Some(kind), 0, 0) => Type::Array(Box::new(Type::Char), ArrayKind::Dynamic(kind)),
            _ => return Err(CParseError::InvalidType(to_str(decl))),
        }
    } else {
        let typ = base_type(&words)?;
        let typ = (0..stars).fold(typ, |typ, _| Type::Pointer(Box::new(typ)));
        let typ = arrays
            .into_iter()
            .rev()
            .fold(typ, |typ, kind| Type::Array(Box::new(typ), kind));

        match (dynamic, typ) {
            (None, typ) => typ,
            (Some(kind), Type::Array(typ, _)) => Type::Array(typ, ArrayKind::Dynamic(kind)),
            (Some(kind), typ) => Type::DynamicScalar(Box::new(typ), kind),
        }
    };

    Ok(Declaration { identifier, typ })
}

/// Declaration of an event field, as found after `field:` in the format.
pub fn declaration(input: &[u8]) -> CResult<'_, Declaration> {
    let decl = input;
    context(
        "declaration",
        map_res_cut(
            many1(lexeme(alt((
                char('*').map(|_| DeclToken::Star),
                delimited(char('['), opt(is_not("]")), char(']')).map(DeclToken::Array),
                identifier.map(DeclToken::Word),
            )))),
            move |tokens| build_declaration(decl, tokens),
        ),
    )
    .parse(input)
}

//////////////////////
// Literals
//////////////////////

fn escape_sequence(input: &[u8]) -> CResult<'_, u8> {
    preceded(
        char('\\'),
        alt((
            map_res_cut(
                take_while_m_n(1, 3, |c: u8| (b'0'..=b'7').contains(&c)),
                |digits: &[u8]| {
                    let x = digits
                        .iter()
                        .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
                    u8::try_from(x).map_err(|_| CParseError::CharOutOfRange(x))
                },
            ),
            preceded(
                char('x'),
                map_res_cut(hex_digit1, |digits: &[u8]| {
                    let x = u32::from_str_radix(&to_str(digits), 16).unwrap_or(u32::MAX);
                    u8::try_from(x).map_err(|_| CParseError::CharOutOfRange(x))
                }),
            ),
            take(1usize).map(|c: &[u8]| match c[0] {
                b'n' => b'\n',
                b't' => b'\t',
                b'r' => b'\r',
                b'a' => 0x07,
                b'b' => 0x08,
                b'f' => 0x0c,
                b'v' => 0x0b,
                b'e' => 0x1b,
                c => c,
            }),
        )),
    )
    .parse(input)
}

/// Parse a sequence of adjacent string literals, which are concatenated like in C.
pub fn string_literal(input: &[u8]) -> CResult<'_, StdString> {
    context(
        "string literal",
        many1(lexeme(delimited(
            char('"'),
            fold_many0(
                alt((
                    escape_sequence.map(|c| vec![c]),
                    take_while1(|c| c != b'"' && c != b'\\').map(|s: &[u8]| s.to_vec()),
                )),
                Vec::new,
                |mut acc, chunk| {
                    acc.extend(chunk);
                    acc
                },
            ),
            cut(char('"')),
        ))),
    )
    .map(|chunks: Vec<Vec<u8>>| to_str(&chunks.concat()))
    .parse(input)
}

fn int_constant(input: &[u8]) -> CResult<'_, Expr> {
    context(
        "integer constant",
        map_res_cut(
            lexeme((
                alt((
                    preceded(alt((tag("0x"), tag("0X"))), hex_digit1).map(|s| (s, 16)),
                    recognize(pair(char('0'), oct_digit0)).map(|s| (s, 8)),
                    digit1.map(|s| (s, 10)),
                )),
                take_while(|c| matches!(c, b'u' | b'U' | b'l' | b'L')),
            )),
            |((digits, radix), suffix): ((&[u8], u32), &[u8])| {
                let x = u64::from_str_radix(&to_str(digits), radix)
                    .map_err(|_| CParseError::InvalidIntegerConstant(to_str(digits)))?;
                let unsigned = suffix.iter().any(|c| matches!(c, b'u' | b'U'));
                let typ = if unsigned || x > i64::MAX as u64 {
                    Type::U64
                } else {
                    Type::I64
                };
                Ok(Expr::IntConstant(typ, x))
            },
        ),
    )
    .parse(input)
}

fn char_constant(input: &[u8]) -> CResult<'_, Expr> {
    context(
        "char constant",
        lexeme(delimited(
            char('\''),
            alt((
                escape_sequence,
                take(1usize).map(|c: &[u8]| c[0]),
            )),
            char('\''),
        )),
    )
    .map(|c| Expr::IntConstant(Type::I32, c.into()))
    .parse(input)
}

//////////////////////
// Expressions
//////////////////////

thread_local! {
    static NESTING: Cell<usize> = const { Cell::new(0) };
}

/// Marks one level of recursion of the expression grammar, for as long as it is alive.
struct NestingGuard;

impl NestingGuard {
    fn enter() -> Option<Self> {
        NESTING.with(|nesting| {
            let level = nesting.get();
            if level >= MAX_NESTING {
                None
            } else {
                nesting.set(level + 1);
                Some(NestingGuard)
            }
        })
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        NESTING.with(|nesting| nesting.set(nesting.get().saturating_sub(1)));
    }
}

enum CallArg {
    Expr(Expr),
    Braced(Vec<Expr>),
}

fn build_accessor(name: &[u8], args: Vec<CallArg>) -> Result<Expr, CParseError> {
    let name: Identifier = to_str(name).into();
    let found = args.len();
    let arity = |expected| {
        if found == expected {
            Ok(())
        } else {
            Err(CParseError::AccessorArity {
                name: name.clone(),
                expected,
                found,
            })
        }
    };
    let invalid = |what: &str| CParseError::InvalidAccessorArg(name.clone(), what.into());

    let mut args = args.into_iter();
    let mut expr_arg = || match args.next() {
        Some(CallArg::Expr(expr)) => Ok(expr),
        _ => Err(invalid("expected an expression")),
    };

    let accessor = match name.as_str() {
        "__get_str" | "__get_rel_str" | "__get_dynamic_array" | "__get_rel_dynamic_array"
        | "__get_dynamic_array_len" | "__get_rel_dynamic_array_len" | "__get_cpumask"
        | "__get_rel_cpumask" | "__get_bitmask" | "__get_rel_bitmask" => {
            arity(1)?;
            let field = match expr_arg()? {
                Expr::Field(field) => field,
                _ => return Err(invalid("expected a field name")),
            };
            match name.as_str() {
                "__get_str" | "__get_rel_str" => Accessor::Str(field),
                "__get_dynamic_array" | "__get_rel_dynamic_array" => {
                    Accessor::DynamicArray(field)
                }
                "__get_dynamic_array_len" | "__get_rel_dynamic_array_len" => {
                    Accessor::DynamicArrayLen(field)
                }
                _ => Accessor::Bitmask(field),
            }
        }
        "__print_hex" | "__print_hex_str" => {
            arity(2)?;
            Accessor::Hex {
                buf: Box::new(expr_arg()?),
                len: Box::new(expr_arg()?),
                separated: name == "__print_hex",
            }
        }
        "__print_symbolic" | "__print_symbolic_u64" | "__print_flags" | "__print_flags_u64" => {
            let flags = name.starts_with("__print_flags");
            let min = if flags { 2 } else { 1 };
            if found < min {
                arity(min)?;
            }
            let val = Box::new(expr_arg()?);
            let sep = if flags {
                match expr_arg()? {
                    Expr::StringLiteral(s) => s,
                    _ => return Err(invalid("expected a separator string")),
                }
            } else {
                StdString::new()
            };
            let table = args
                .map(|arg| match arg {
                    CallArg::Braced(pair) => match <[Expr; 2]>::try_from(pair) {
                        Ok([key, Expr::StringLiteral(s)]) => Ok((key, s)),
                        _ => Err(invalid("expected a {value, \"name\"} pair")),
                    },
                    CallArg::Expr(_) => Err(invalid("expected a {value, \"name\"} pair")),
                })
                .collect::<Result<Vec<_>, _>>()?;

            if flags {
                Accessor::Flags(val, sep, table)
            } else {
                Accessor::Symbolic(val, table)
            }
        }
        _ => return Err(CParseError::UnknownAccessor(name.clone())),
    };
    Ok(Expr::Accessor(accessor))
}

fn call_arg(input: &[u8]) -> CResult<'_, CallArg> {
    alt((
        delimited(
            lexeme(char('{')),
            separated_list1(lexeme(char(',')), expr),
            lexeme(char('}')),
        )
        .map(CallArg::Braced),
        expr.map(CallArg::Expr),
    ))
    .parse(input)
}

fn primary_expr(input: &[u8]) -> CResult<'_, Expr> {
    lexeme(alt((
        context(
            "event field",
            preceded(
                (keyword("REC"), lexeme(tag("->"))),
                cut(identifier),
            )
            .map(|name| Expr::Field(to_str(name).into())),
        ),
        context(
            "function-like macro",
            map_res_cut(
                (
                    lexeme(identifier),
                    parenthesized(separated_list0(lexeme(char(',')), call_arg)),
                ),
                |(name, args)| build_accessor(name, args),
            ),
        ),
        identifier.map(|name| Expr::Field(to_str(name).into())),
        int_constant,
        char_constant,
        string_literal.map(Expr::StringLiteral),
        parenthesized(expr),
    )))
    .parse(input)
}

/// Match a punctuator that is not the prefix of a longer one, e.g. `&` but not `&&`.
fn punctuator<'i>(
    punct: &'static str,
    not_followed_by: &'static [u8],
) -> impl Parser<&'i [u8], Output = &'i [u8], Error = NomError<CParseError, VerboseNomError<'i>>>
{
    lexeme(terminated(
        tag(punct),
        not(take_while_m_n(1, 1, move |c| not_followed_by.contains(&c))),
    ))
}

fn unary_expr(input: &[u8]) -> CResult<'_, Expr> {
    let Some(_guard) = NestingGuard::enter() else {
        return failure(input, CParseError::NestingTooDeep(MAX_NESTING));
    };
    let unary = |punct: &'static str, not_followed_by: &'static [u8], op: UnaryOp| {
        preceded(punctuator(punct, not_followed_by), unary_expr)
            .map(move |expr| Expr::Unary(op, Box::new(expr)))
    };

    alt((
        unary("-", b"->=", UnaryOp::Minus),
        unary("+", b"+=", UnaryOp::Plus),
        unary("~", b"", UnaryOp::Tilde),
        unary("!", b"=", UnaryOp::Bang),
        context(
            "sizeof",
            preceded(
                lexeme(keyword("sizeof")),
                cut(alt((
                    parenthesized(type_name).map(Expr::SizeofType),
                    unary_expr.map(|expr| Expr::SizeofExpr(Box::new(expr))),
                ))),
            ),
        ),
        context(
            "cast",
            (parenthesized(type_name), unary_expr)
                .map(|(typ, expr)| Expr::Cast(typ, Box::new(expr))),
        ),
        primary_expr,
    ))
    .parse(input)
}

type OpTable = &'static [(&'static str, &'static [u8], BinaryOp)];

/// Parse a left-associative chain of binary operators of the same precedence level.
///
/// The chain is folded into a left-leaning tree, whose depth is capped at [MAX_EXPR_DEPTH].
fn left_assoc<'i>(
    operand: fn(&'i [u8]) -> CResult<'i, Expr>,
    ops: OpTable,
) -> impl Parser<&'i [u8], Output = Expr, Error = NomError<CParseError, VerboseNomError<'i>>> {
    move |input: &'i [u8]| -> CResult<'i, Expr> {
        let op = |input: &'i [u8]| -> Option<(&'i [u8], BinaryOp)> {
            ops.iter().find_map(|&(punct, not_followed_by, op)| {
                let res: CResult<'i, _> = punctuator(punct, not_followed_by).parse(input);
                res.ok().map(|(input, _)| (input, op))
            })
        };

        let (mut input, mut lhs) = operand(input)?;
        while let Some((rest, binop)) = op(input) {
            let (rest, rhs) = cut(operand).parse(rest)?;
            lhs = Expr::Binary(binop, Box::new(lhs), Box::new(rhs));
            if lhs.depth() > MAX_EXPR_DEPTH {
                return failure(input, CParseError::NestingTooDeep(MAX_EXPR_DEPTH));
            }
            input = rest;
        }
        Ok((input, lhs))
    }
}

macro_rules! binary_level {
    ($name:ident, $operand:ident, [$(($punct:literal, $not_followed_by:literal, $op:ident)),* $(,)?]) => {
        fn $name(input: &[u8]) -> CResult<'_, Expr> {
            left_assoc($operand, &[$(($punct, $not_followed_by as &[u8], BinaryOp::$op)),*]).parse(input)
        }
    };
}

binary_level!(multiplicative_expr, unary_expr, [
    ("*", b"=", Mul),
    ("/", b"=", Div),
    ("%", b"=", Mod),
]);
binary_level!(additive_expr, multiplicative_expr, [
    ("+", b"+=", Add),
    ("-", b"->=", Sub),
]);
binary_level!(shift_expr, additive_expr, [
    ("<<", b"=", LShift),
    (">>", b"=", RShift),
]);
binary_level!(relational_expr, shift_expr, [
    ("<=", b"", LoEq),
    (">=", b"", HiEq),
    ("<", b"<=", Lo),
    (">", b">=", Hi),
]);
binary_level!(equality_expr, relational_expr, [
    ("==", b"", Eq),
    ("!=", b"", NEq),
]);
binary_level!(and_expr, equality_expr, [("&", b"&=", BitAnd)]);
binary_level!(xor_expr, and_expr, [("^", b"=", BitXor)]);
binary_level!(or_expr, xor_expr, [("|", b"|=", BitOr)]);
binary_level!(logical_and_expr, or_expr, [("&&", b"", And)]);
binary_level!(logical_or_expr, logical_and_expr, [("||", b"", Or)]);

fn conditional_expr(input: &[u8]) -> CResult<'_, Expr> {
    let Some(_guard) = NestingGuard::enter() else {
        return failure(input, CParseError::NestingTooDeep(MAX_NESTING));
    };
    let (input, cond) = logical_or_expr(input)?;
    let (input, branches) = opt(preceded(
        lexeme(char('?')),
        cut(context(
            "ternary",
            (opt(expr), preceded(lexeme(char(':')), conditional_expr)),
        )),
    ))
    .parse(input)?;

    let expr = match branches {
        None => cond,
        Some((Some(then), els)) => Expr::Ternary(Box::new(cond), Box::new(then), Box::new(els)),
        // GNU extension: "x ?: y" is "x ? x : y"
        Some((None, els)) => Expr::Ternary(
            Box::new(cond.clone()),
            Box::new(cond),
            Box::new(els),
        ),
    };
    Ok((input, expr))
}

/// C expression, without the comma operator.
pub fn expr(input: &[u8]) -> CResult<'_, Expr> {
    context("expression", conditional_expr).parse(input)
}

/// Parsed but not yet validated print fmt statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintFmtStatement<'i> {
    pub fmt: StdString,
    pub args: Vec<Expr>,
    /// Unparsed input after the last argument.
    pub trailing: &'i [u8],
}

/// Parse the content of the `print fmt:` line: a string literal followed by the arguments.
pub fn print_fmt_statement(input: &[u8]) -> CResult<'_, PrintFmtStatement<'_>> {
    context(
        "print fmt",
        (
            multispace0,
            string_literal,
            many0(preceded(lexeme(char(',')), cut(expr))),
            rest,
        ),
    )
    .map(|(_, fmt, args, trailing)| PrintFmtStatement {
        fmt,
        args,
        trailing,
    })
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{NomParserExt as _, tests::test_parser};

    fn field(name: &str) -> Box<Expr> {
        Box::new(Expr::record_field(name))
    }

    fn int(x: u64) -> Box<Expr> {
        Box::new(Expr::IntConstant(Type::I64, x))
    }

    #[test]
    fn declaration_test() {
        let test = |src: &[u8], name: &str, typ: Type| {
            test_parser(
                Declaration {
                    identifier: name.into(),
                    typ,
                },
                src,
                declaration,
            )
        };

        test(b"unsigned short common_type", "common_type", Type::U16);
        test(b"int common_pid", "common_pid", Type::I32);
        test(b"unsigned char common_flags", "common_flags", Type::U8);
        test(b"long long s8", "s8", Type::I64);
        test(b"unsigned long long u8", "u8", Type::U64);
        test(b"unsigned x", "x", Type::U32);
        test(
            b"unsigned long ip",
            "ip",
            Type::Long(Signedness::Unsigned),
        );
        test(b"long delta", "delta", Type::Long(Signedness::Signed));
        test(b"u64 ts", "ts", Type::U64);
        test(
            b"pid_t pid",
            "pid",
            Type::Typedef(Box::new(Type::I32), "pid_t".into()),
        );
        test(
            b"gfp_t gfp_flags",
            "gfp_flags",
            Type::Typedef(Box::new(Type::Unknown), "gfp_t".into()),
        );
        test(
            b"const char * name",
            "name",
            Type::Pointer(Box::new(Type::Char)),
        );
        test(
            b"struct task_struct *prev",
            "prev",
            Type::Pointer(Box::new(Type::Struct("task_struct".into()))),
        );
        test(
            b"char comm[16]",
            "comm",
            Type::Array(Box::new(Type::Char), ArrayKind::Fixed(Some(16))),
        );
        test(
            b"char comm[TASK_COMM_LEN]",
            "comm",
            Type::Array(Box::new(Type::Char), ArrayKind::Fixed(None)),
        );
        test(
            b"u32 data[2][3]",
            "data",
            Type::Array(
                Box::new(Type::Array(Box::new(Type::U32), ArrayKind::Fixed(Some(3)))),
                ArrayKind::Fixed(Some(2)),
            ),
        );
        test(
            b"__data_loc char[] name",
            "name",
            Type::Array(
                Box::new(Type::Char),
                ArrayKind::Dynamic(DynamicKind::Dynamic),
            ),
        );
        test(
            b"__rel_loc u8[] buf",
            "buf",
            Type::Array(
                Box::new(Type::U8),
                ArrayKind::Dynamic(DynamicKind::DynamicRel),
            ),
        );
        test(
            b"__data_loc name",
            "name",
            Type::Array(
                Box::new(Type::Char),
                ArrayKind::Dynamic(DynamicKind::Dynamic),
            ),
        );
        test(
            b"__data_loc cpumask_t *[] cpumask",
            "cpumask",
            Type::Array(
                Box::new(Type::Pointer(Box::new(Type::Typedef(
                    Box::new(Type::Unknown),
                    "cpumask_t".into(),
                )))),
                ArrayKind::Dynamic(DynamicKind::Dynamic),
            ),
        );
    }

    #[test]
    fn declaration_error_test() {
        assert!(matches!(
            declaration.parse_finish(b"unsigned long"),
            Err(CParseError::DeclarationWithoutIdentifier(_))
        ));
        assert!(matches!(
            declaration.parse_finish(b"int foo *"),
            Err(CParseError::UnexpectedToken(_))
        ));
        assert!(matches!(
            declaration.parse_finish(b"short char x"),
            Err(CParseError::InvalidType(_))
        ));
        assert!(declaration.parse_finish(b"int x;").is_err());
    }

    #[test]
    fn bitmap_type_test() {
        let decl = declaration
            .parse_finish(b"__data_loc cpumask_t *[] cpumask")
            .unwrap();
        match decl.typ {
            Type::Array(elem, ArrayKind::Dynamic(_)) => assert!(elem.is_bitmap()),
            typ => panic!("unexpected type: {typ:?}"),
        }

        let decl = declaration.parse_finish(b"__data_loc char[] name").unwrap();
        assert!(decl.typ.is_string());
        assert!(!decl.typ.is_bitmap());
    }

    #[test]
    fn string_literal_test() {
        let test = |src: &[u8], expected: &str| test_parser(expected.to_owned(), src, string_literal);

        test(br#""foo""#, "foo");
        test(br#""""#, "");
        test(br#""irq=%d handler=%s""#, "irq=%d handler=%s");
        test(br#""a\tb\n""#, "a\tb\n");
        test(br#""\"quoted\"""#, "\"quoted\"");
        test(br#""\101\x42""#, "AB");
        test(br#""foo" "bar""#, "foobar");
    }

    #[test]
    fn expr_test() {
        let test = |src: &[u8], expected: Expr| test_parser(expected, src, expr);

        test(b"REC->irq", Expr::record_field("irq"));
        test(b" REC -> irq ", Expr::record_field("irq"));
        test(b"irq", Expr::record_field("irq"));
        test(b"42", Expr::IntConstant(Type::I64, 42));
        test(b"0x2aUL", Expr::IntConstant(Type::U64, 42));
        test(b"052", Expr::IntConstant(Type::I64, 42));
        test(b"'a'", Expr::IntConstant(Type::I32, 97));
        test(
            b"1 + 2 * 3",
            Expr::Binary(
                BinaryOp::Add,
                int(1),
                Box::new(Expr::Binary(BinaryOp::Mul, int(2), int(3))),
            ),
        );
        test(
            b"1 - 2 - 3",
            Expr::Binary(
                BinaryOp::Sub,
                Box::new(Expr::Binary(BinaryOp::Sub, int(1), int(2))),
                int(3),
            ),
        );
        test(
            b"REC->a & 1 && REC->b",
            Expr::Binary(
                BinaryOp::And,
                Box::new(Expr::Binary(BinaryOp::BitAnd, field("a"), int(1))),
                field("b"),
            ),
        );
        test(
            b"REC->a << 2 < 3",
            Expr::Binary(
                BinaryOp::Lo,
                Box::new(Expr::Binary(BinaryOp::LShift, field("a"), int(2))),
                int(3),
            ),
        );
        test(
            b"-REC->a",
            Expr::Unary(UnaryOp::Minus, field("a")),
        );
        test(
            b"!(REC->a != 2)",
            Expr::Unary(
                UnaryOp::Bang,
                Box::new(Expr::Binary(BinaryOp::NEq, field("a"), int(2))),
            ),
        );
        test(
            b"REC->a ? 1 : REC->b ? 2 : 3",
            Expr::Ternary(
                field("a"),
                int(1),
                Box::new(Expr::Ternary(field("b"), int(2), int(3))),
            ),
        );
        test(
            b"REC->a ?: 3",
            Expr::Ternary(field("a"), field("a"), int(3)),
        );
        test(
            b"(unsigned int)REC->a",
            Expr::Cast(Type::U32, field("a")),
        );
        test(b"(REC->a)", Expr::record_field("a"));
        test(b"(a)", Expr::record_field("a"));
        test(
            b"sizeof(unsigned long)",
            Expr::SizeofType(Type::Long(Signedness::Unsigned)),
        );
        test(b"sizeof(long long)", Expr::SizeofType(Type::I64));
        test(b"sizeof(REC->s4)", Expr::SizeofExpr(field("s4")));
        test(
            b"__get_str(name)",
            Expr::Accessor(Accessor::Str("name".into())),
        );
        test(
            b"__get_cpumask(REC->cpumask)",
            Expr::Accessor(Accessor::Bitmask("cpumask".into())),
        );
        test(
            b"__print_symbolic(REC->vec, { 0, \"HI\" }, { 1, \"TIMER\" })",
            Expr::Accessor(Accessor::Symbolic(
                field("vec"),
                vec![
                    (Expr::IntConstant(Type::I64, 0), "HI".into()),
                    (Expr::IntConstant(Type::I64, 1), "TIMER".into()),
                ],
            )),
        );
        test(
            b"__print_flags(REC->flags, \"|\", { 1, \"A\" })",
            Expr::Accessor(Accessor::Flags(
                field("flags"),
                "|".into(),
                vec![(Expr::IntConstant(Type::I64, 1), "A".into())],
            )),
        );
    }

    #[test]
    fn accessor_error_test() {
        assert_eq!(
            expr.parse_finish(b"__get_foo(name)"),
            Err(CParseError::UnknownAccessor("__get_foo".into()))
        );
        assert_eq!(
            expr.parse_finish(b"__get_str(a, b)"),
            Err(CParseError::AccessorArity {
                name: "__get_str".into(),
                expected: 1,
                found: 2,
            })
        );
        assert!(matches!(
            expr.parse_finish(b"__get_str(1 + 2)"),
            Err(CParseError::InvalidAccessorArg(..))
        ));
    }

    #[test]
    fn nesting_limit_test() {
        let parse = |src: String| expr.parse_finish(src.as_bytes());
        let too_deep = Err(CParseError::NestingTooDeep(MAX_NESTING));

        let parens = |depth: usize| format!("{}REC->a{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse(parens(8)), Ok(Expr::record_field("a")));
        assert_eq!(parse(parens(1000)), too_deep);
        // The nesting level is restored after an error.
        assert_eq!(parse(parens(8)), Ok(Expr::record_field("a")));

        assert_eq!(parse(format!("{}1", "~".repeat(1000))), too_deep);
        assert_eq!(parse(format!("{}1", "(int)".repeat(1000))), too_deep);
        assert_eq!(parse(format!("{}3", "1 ? 2 : ".repeat(1000))), too_deep);

        let sum = |n: usize| format!("1{}", " + 1".repeat(n));
        assert_eq!(parse(sum(10)).map(|expr| expr.depth()), Ok(11));
        assert_eq!(
            parse(sum(1000)),
            Err(CParseError::NestingTooDeep(MAX_EXPR_DEPTH))
        );
    }

    #[test]
    fn depth_test() {
        let depth = |src: &[u8]| expr.parse_finish(src).unwrap().depth();

        assert_eq!(depth(b"REC->a"), 1);
        assert_eq!(depth(b"1 + 2 * 3"), 3);
        assert_eq!(depth(b"-(unsigned int)REC->a"), 3);
        assert_eq!(depth(b"__get_str(name)"), 1);
        assert_eq!(
            depth(b"__print_symbolic(REC->vec, { 0, \"HI\" }, { 1 << 2, \"TIMER\" })"),
            3
        );
    }

    #[test]
    fn print_fmt_statement_test() {
        let stmt = print_fmt_statement
            .parse_finish(br#""irq=%d handler=%s", REC->irq, __get_str(name)"#)
            .unwrap();
        assert_eq!(stmt.fmt, "irq=%d handler=%s");
        assert_eq!(
            stmt.args,
            vec![
                Expr::record_field("irq"),
                Expr::Accessor(Accessor::Str("name".into())),
            ]
        );
        assert_eq!(stmt.trailing, b"");

        let stmt = print_fmt_statement
            .parse_finish(br#""%d", sizeof(REC->u8))"#)
            .unwrap();
        assert_eq!(stmt.args, vec![Expr::SizeofExpr(field("u8"))]);
        assert_eq!(stmt.trailing, b")");

        assert!(print_fmt_statement.parse_finish(b"REC->irq").is_err());
    }
}
