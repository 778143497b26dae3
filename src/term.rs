//! Erlang terms.
//!
//! [`Term`] is a closed sum over one struct per Erlang data type. Every
//! variant knows how to travel through the External Term Format via
//! [`Term::decode`] and [`Term::encode`] (see the [`codec`](crate::codec)
//! module for the wire details).
use num_bigint::BigInt;
use num_traits::ToPrimitive as _;
use std::io::{Read, Write};

use crate::codec::{self, DecodeError, DecodeOptions, EncodeError};

/// The maximum number of characters in an atom name.
///
/// Longer names are truncated silently, both on construction and on decode.
pub const MAX_ATOM_LEN: usize = 255;

/// An Erlang term.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum Term {
    Atom(Atom),
    FixInteger(FixInteger),
    BigInteger(BigInteger),
    Float(Float),
    Str(Str),
    Binary(Binary),
    BitBinary(BitBinary),
    Pid(Pid),
    Port(Port),
    Reference(Reference),
    ExternalFun(ExternalFun),
    InternalFun(InternalFun),
    Tuple(Tuple),
    List(List),
    ImproperList(ImproperList),
    Map(Map),
}

impl Term {
    /// Decodes one term from `reader`.
    ///
    /// A leading version tag (`131`) is skipped if present.
    pub fn decode<R: Read>(reader: R) -> Result<Self, DecodeError> {
        codec::Decoder::new(reader).decode()
    }

    /// Decodes one term from `reader` with non-default options.
    pub fn decode_with<R: Read>(reader: R, options: DecodeOptions) -> Result<Self, DecodeError> {
        codec::Decoder::with_options(reader, options).decode()
    }

    /// Encodes this term into `writer`, preceded by the version tag.
    pub fn encode<W: Write>(&self, writer: W) -> Result<(), EncodeError> {
        codec::Encoder::new(writer).encode(self)
    }

    /// Encodes this term as a compressed external term.
    ///
    /// Terms whose plain encoding is shorter than five bytes are written
    /// uncompressed, as compression could only grow them.
    pub fn encode_compressed<W: Write>(&self, writer: W) -> Result<(), EncodeError> {
        codec::Encoder::new(writer).encode_compressed(self)
    }

    /// Returns a structural hash of this term.
    ///
    /// Terms that compare equal hash equally; in particular the hash does not
    /// depend on the insertion order of map entries nor on whether an integer
    /// is held as a [`FixInteger`] or a [`BigInteger`].
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = JenkinsHasher::new();
        self.hash_term(&mut hasher);
        hasher.finish()
    }

    /// Tries to read this term as an `i32`.
    pub fn to_i32(&self) -> Result<i32, RangeError> {
        match self {
            Self::FixInteger(x) => Ok(x.value),
            Self::BigInteger(x) => x.to_i32(),
            _ => Err(RangeError::new(self, "i32")),
        }
    }

    /// Tries to read this term as a `u32`.
    pub fn to_u32(&self) -> Result<u32, RangeError> {
        match self {
            Self::FixInteger(x) => u32::try_from(x.value).map_err(|_| RangeError::new(self, "u32")),
            Self::BigInteger(x) => x.to_u32(),
            _ => Err(RangeError::new(self, "u32")),
        }
    }

    /// Tries to read this term as a `u64`.
    pub fn to_u64(&self) -> Result<u64, RangeError> {
        match self {
            Self::FixInteger(x) => u64::try_from(x.value).map_err(|_| RangeError::new(self, "u64")),
            Self::BigInteger(x) => x.to_u64(),
            _ => Err(RangeError::new(self, "u64")),
        }
    }

    /// Returns `true` if this term is the empty list.
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::List(list) if list.is_nil())
    }

    fn hash_term(&self, h: &mut JenkinsHasher) {
        match self {
            Self::Atom(x) => {
                h.write_u8(1);
                h.write_bytes(x.name.as_bytes());
            }
            Self::FixInteger(x) => hash_i64(h, i64::from(x.value)),
            Self::BigInteger(x) => match x.value.to_i64() {
                Some(v) => hash_i64(h, v),
                None => {
                    let (sign, bytes) = x.value.to_bytes_le();
                    h.write_u8(3);
                    h.write_u8((sign == num_bigint::Sign::Minus) as u8);
                    h.write_bytes(&bytes);
                }
            },
            Self::Float(x) => {
                h.write_u8(4);
                // 0.0 and -0.0 compare equal, so they must hash equally too.
                let v = if x.value == 0.0 { 0.0 } else { x.value };
                h.write_u64(v.to_bits());
            }
            Self::Str(x) => {
                h.write_u8(5);
                h.write_bytes(x.value.as_bytes());
            }
            Self::Binary(x) => {
                h.write_u8(6);
                h.write_bytes(&x.bytes);
            }
            Self::BitBinary(x) => {
                h.write_u8(7);
                h.write_u8(x.pad_bits);
                h.write_bytes(&x.bytes);
            }
            Self::Pid(x) => {
                h.write_u8(8);
                h.write_bytes(x.node.name.as_bytes());
                h.write_u32(x.id);
                h.write_u32(x.serial);
                h.write_u32(x.creation);
            }
            Self::Port(x) => {
                h.write_u8(9);
                h.write_bytes(x.node.name.as_bytes());
                h.write_u32(x.id);
                h.write_u32(x.creation);
            }
            Self::Reference(x) => {
                h.write_u8(10);
                h.write_bytes(x.node.name.as_bytes());
                for &id in &x.ids {
                    h.write_u32(id);
                }
                h.write_u32(x.creation);
            }
            Self::ExternalFun(x) => {
                h.write_u8(11);
                h.write_bytes(x.module.name.as_bytes());
                h.write_bytes(x.function.name.as_bytes());
                h.write_u8(x.arity);
            }
            Self::InternalFun(x) => {
                h.write_u8(12);
                match x {
                    InternalFun::Old {
                        module,
                        pid,
                        free_vars,
                        index,
                        uniq,
                    } => {
                        h.write_u8(0);
                        h.write_bytes(module.name.as_bytes());
                        Term::Pid(pid.clone()).hash_term(h);
                        h.write_u32(*index as u32);
                        h.write_u32(*uniq as u32);
                        for v in free_vars {
                            v.hash_term(h);
                        }
                    }
                    InternalFun::New {
                        module,
                        arity,
                        pid,
                        free_vars,
                        index,
                        uniq,
                        old_index,
                        old_uniq,
                    } => {
                        h.write_u8(1);
                        h.write_bytes(module.name.as_bytes());
                        h.write_u8(*arity);
                        Term::Pid(pid.clone()).hash_term(h);
                        h.write_u32(*index);
                        h.write_bytes(uniq);
                        h.write_u32(*old_index as u32);
                        h.write_u32(*old_uniq as u32);
                        for v in free_vars {
                            v.hash_term(h);
                        }
                    }
                }
            }
            Self::Tuple(x) => {
                h.write_u8(13);
                h.write_u32(x.elements.len() as u32);
                for e in &x.elements {
                    e.hash_term(h);
                }
            }
            Self::List(x) => {
                h.write_u8(14);
                for e in &x.elements {
                    e.hash_term(h);
                }
            }
            Self::ImproperList(x) => {
                h.write_u8(14);
                for e in &x.elements {
                    e.hash_term(h);
                }
                h.write_u8(15);
                x.last.hash_term(h);
            }
            Self::Map(x) => {
                // Entry hashes are combined with a commutative operation so
                // the result is independent of insertion order.
                let mut sum = 0u64;
                for (k, v) in &x.entries {
                    let mut eh = JenkinsHasher::new();
                    k.hash_term(&mut eh);
                    v.hash_term(&mut eh);
                    sum = sum.wrapping_add(eh.finish());
                }
                h.write_u8(16);
                h.write_u32(x.entries.len() as u32);
                h.write_u64(sum);
            }
        }
    }
}

fn hash_i64(h: &mut JenkinsHasher, v: i64) {
    h.write_u8(2);
    h.write_u64(v as u64);
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // A fix integer and a big integer holding the same value are the
            // same Erlang integer; the split is a representation detail.
            (Self::FixInteger(a), Self::BigInteger(b))
            | (Self::BigInteger(b), Self::FixInteger(a)) => b.value == BigInt::from(a.value),
            (Self::Atom(a), Self::Atom(b)) => a == b,
            (Self::FixInteger(a), Self::FixInteger(b)) => a == b,
            (Self::BigInteger(a), Self::BigInteger(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::BitBinary(a), Self::BitBinary(b)) => a == b,
            (Self::Pid(a), Self::Pid(b)) => a == b,
            (Self::Port(a), Self::Port(b)) => a == b,
            (Self::Reference(a), Self::Reference(b)) => a == b,
            (Self::ExternalFun(a), Self::ExternalFun(b)) => a == b,
            (Self::InternalFun(a), Self::InternalFun(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::ImproperList(a), Self::ImproperList(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Atom(x) => x.fmt(f),
            Self::FixInteger(x) => x.fmt(f),
            Self::BigInteger(x) => x.fmt(f),
            Self::Float(x) => x.fmt(f),
            Self::Str(x) => x.fmt(f),
            Self::Binary(x) => x.fmt(f),
            Self::BitBinary(x) => x.fmt(f),
            Self::Pid(x) => x.fmt(f),
            Self::Port(x) => x.fmt(f),
            Self::Reference(x) => x.fmt(f),
            Self::ExternalFun(x) => x.fmt(f),
            Self::InternalFun(x) => x.fmt(f),
            Self::Tuple(x) => x.fmt(f),
            Self::List(x) => x.fmt(f),
            Self::ImproperList(x) => x.fmt(f),
            Self::Map(x) => x.fmt(f),
        }
    }
}

macro_rules! impl_term_conversions {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Term {
            fn from(x: $ty) -> Self {
                Term::$variant(x)
            }
        }

        impl TryFrom<Term> for $ty {
            type Error = Term;

            fn try_from(term: Term) -> Result<Self, Term> {
                if let Term::$variant(x) = term {
                    Ok(x)
                } else {
                    Err(term)
                }
            }
        }
    };
}

impl_term_conversions!(Atom, Atom);
impl_term_conversions!(FixInteger, FixInteger);
impl_term_conversions!(BigInteger, BigInteger);
impl_term_conversions!(Float, Float);
impl_term_conversions!(Str, Str);
impl_term_conversions!(Binary, Binary);
impl_term_conversions!(BitBinary, BitBinary);
impl_term_conversions!(Pid, Pid);
impl_term_conversions!(Port, Port);
impl_term_conversions!(Reference, Reference);
impl_term_conversions!(ExternalFun, ExternalFun);
impl_term_conversions!(InternalFun, InternalFun);
impl_term_conversions!(Tuple, Tuple);
impl_term_conversions!(List, List);
impl_term_conversions!(ImproperList, ImproperList);
impl_term_conversions!(Map, Map);

/// Error raised by the narrow integer accessors.
#[derive(Debug, thiserror::Error)]
#[error("the term {term} does not fit into {requested}")]
pub struct RangeError {
    /// Printable form of the offending term.
    pub term: String,

    /// The requested narrow type.
    pub requested: &'static str,
}

impl RangeError {
    fn new(term: &Term, requested: &'static str) -> Self {
        Self {
            term: term.to_string(),
            requested,
        }
    }
}

/// An atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom {
    /// The name of this atom, at most [`MAX_ATOM_LEN`] characters.
    pub name: String,
}

impl Atom {
    /// Makes a new atom, silently truncating `name` to [`MAX_ATOM_LEN`]
    /// characters.
    pub fn new<T: Into<String>>(name: T) -> Self {
        let mut name = name.into();
        if let Some((i, _)) = name.char_indices().nth(MAX_ATOM_LEN) {
            name.truncate(i);
        }
        Self { name }
    }
}

impl From<&str> for Atom {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Atom {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let bare = self
            .name
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_lowercase())
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@');
        if bare {
            write!(f, "{}", self.name)
        } else {
            write!(f, "'{}'", self.name.replace('\'', "\\'"))
        }
    }
}

/// An integer that fits into 32 signed bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixInteger {
    /// The value of this integer.
    pub value: i32,
}

impl From<i32> for FixInteger {
    fn from(value: i32) -> Self {
        Self { value }
    }
}

impl std::fmt::Display for FixInteger {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// An arbitrary-precision integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BigInteger {
    /// The value of this integer.
    pub value: BigInt,
}

impl BigInteger {
    /// Tries to read this integer as an `i32`.
    pub fn to_i32(&self) -> Result<i32, RangeError> {
        self.value.to_i32().ok_or_else(|| self.range_error("i32"))
    }

    /// Tries to read this integer as a `u32`.
    pub fn to_u32(&self) -> Result<u32, RangeError> {
        self.value.to_u32().ok_or_else(|| self.range_error("u32"))
    }

    /// Tries to read this integer as a `u64`.
    pub fn to_u64(&self) -> Result<u64, RangeError> {
        self.value.to_u64().ok_or_else(|| self.range_error("u64"))
    }

    fn range_error(&self, requested: &'static str) -> RangeError {
        RangeError {
            term: self.value.to_string(),
            requested,
        }
    }
}

impl From<BigInt> for BigInteger {
    fn from(value: BigInt) -> Self {
        Self { value }
    }
}

impl From<i64> for BigInteger {
    fn from(value: i64) -> Self {
        Self {
            value: BigInt::from(value),
        }
    }
}

impl From<u64> for BigInteger {
    fn from(value: u64) -> Self {
        Self {
            value: BigInt::from(value),
        }
    }
}

impl std::fmt::Display for BigInteger {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A 64-bit floating point number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Float {
    /// The value of this float.
    pub value: f64,
}

impl From<f64> for Float {
    fn from(value: f64) -> Self {
        Self { value }
    }
}

impl std::fmt::Display for Float {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

/// A string.
///
/// Erlang has no string type of its own; on the wire a string is either the
/// compact `STRING_EXT` form (when every character fits into a byte) or a
/// plain list of code point integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Str {
    /// The characters of this string.
    pub value: String,
}

impl From<&str> for Str {
    fn from(value: &str) -> Self {
        Self {
            value: value.to_owned(),
        }
    }
}

impl From<String> for Str {
    fn from(value: String) -> Self {
        Self { value }
    }
}

impl std::fmt::Display for Str {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

/// A byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Binary {
    /// The bytes of this binary.
    pub bytes: Vec<u8>,
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&[u8]> for Binary {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_owned(),
        }
    }
}

impl std::fmt::Display for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<<")?;
        for (i, b) in self.bytes.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", b)?;
        }
        write!(f, ">>")
    }
}

/// A bit string whose length is not necessarily a multiple of eight.
///
/// `pad_bits` is the number of unused low bits in the last byte. The unused
/// bits are always zero; the constructor clears them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitBinary {
    /// The bytes of this bit string.
    pub bytes: Vec<u8>,

    /// The number of unused low bits in the last byte, in `0..=7`.
    pub pad_bits: u8,
}

impl BitBinary {
    /// Makes a new bit string, zeroing the trailing pad bits of `bytes`.
    pub fn new(mut bytes: Vec<u8>, pad_bits: u8) -> Self {
        let pad_bits = if bytes.is_empty() { 0 } else { pad_bits & 7 };
        if let Some(last) = bytes.last_mut() {
            *last &= 0xFFu8 << pad_bits;
        }
        Self { bytes, pad_bits }
    }

    /// The number of bits in this bit string.
    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8 - usize::from(self.pad_bits)
    }
}

impl std::fmt::Display for BitBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<<")?;
        for (i, b) in self.bytes.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            if i + 1 == self.bytes.len() && self.pad_bits > 0 {
                write!(f, "{}:{}", b >> self.pad_bits, 8 - self.pad_bits)?;
            } else {
                write!(f, "{}", b)?;
            }
        }
        write!(f, ">>")
    }
}

/// A process identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid {
    /// The name of the node this pid belongs to.
    pub node: Atom,

    /// Process number.
    pub id: u32,

    /// Serial number, bumped every time `id` wraps around.
    pub serial: u32,

    /// The creation of the owning node incarnation.
    pub creation: u32,
}

impl Pid {
    /// Makes a new pid.
    pub fn new<T: Into<Atom>>(node: T, id: u32, serial: u32, creation: u32) -> Self {
        Self {
            node: node.into(),
            id,
            serial,
            creation,
        }
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<{}.{}.{}>", self.node.name, self.id, self.serial)
    }
}

/// A port identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    /// The name of the node this port belongs to.
    pub node: Atom,

    /// Port number.
    pub id: u32,

    /// The creation of the owning node incarnation.
    pub creation: u32,
}

impl Port {
    /// Makes a new port.
    pub fn new<T: Into<Atom>>(node: T, id: u32, creation: u32) -> Self {
        Self {
            node: node.into(),
            id,
            creation,
        }
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#Port<{}.{}>", self.node.name, self.id)
    }
}

/// A reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// The name of the node this reference belongs to.
    pub node: Atom,

    /// One to three identifier words.
    pub ids: Vec<u32>,

    /// The creation of the owning node incarnation.
    pub creation: u32,
}

impl Reference {
    /// Makes a new reference.
    pub fn new<T: Into<Atom>>(node: T, ids: Vec<u32>, creation: u32) -> Self {
        Self {
            node: node.into(),
            ids,
            creation,
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#Ref<{}", self.node.name)?;
        for id in &self.ids {
            write!(f, ".{}", id)?;
        }
        write!(f, ">")
    }
}

/// An external fun, i.e. `fun Module:Function/Arity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalFun {
    /// The module exporting this fun.
    pub module: Atom,

    /// The function name.
    pub function: Atom,

    /// The arity of this fun.
    pub arity: u8,
}

impl std::fmt::Display for ExternalFun {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "fun {}:{}/{}",
            self.module.name, self.function.name, self.arity
        )
    }
}

/// A fun created inside a module.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum InternalFun {
    /// The old (pre R6) fun representation.
    Old {
        module: Atom,
        pid: Pid,
        free_vars: Vec<Term>,
        index: i32,
        uniq: i32,
    },

    /// The `NEW_FUN_EXT` representation.
    New {
        module: Atom,
        arity: u8,
        pid: Pid,
        free_vars: Vec<Term>,
        index: u32,
        uniq: [u8; 16],
        old_index: i32,
        old_uniq: i32,
    },
}

impl std::fmt::Display for InternalFun {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Old { module, uniq, .. } => write!(f, "#Fun<{}.{}>", module.name, uniq),
            Self::New {
                module,
                index,
                old_uniq,
                ..
            } => write!(f, "#Fun<{}.{}.{}>", module.name, index, old_uniq),
        }
    }
}

/// A fixed-length ordered sequence of terms.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tuple {
    /// The elements of this tuple.
    pub elements: Vec<Term>,
}

impl Tuple {
    /// Makes the empty tuple.
    pub fn nil() -> Self {
        Self::default()
    }
}

impl From<Vec<Term>> for Tuple {
    fn from(elements: Vec<Term>) -> Self {
        Self { elements }
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "}}")
    }
}

/// A proper list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct List {
    /// The elements of this list.
    pub elements: Vec<Term>,
}

impl List {
    /// Makes the empty list.
    pub fn nil() -> Self {
        Self::default()
    }

    /// Returns `true` if this is the empty list.
    pub fn is_nil(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns the tail obtained by dropping the first `n` elements, or
    /// `None` if the list has fewer than `n` elements.
    ///
    /// `nth_tail(len)` is the empty slice, i.e. the nil tail. This is a view
    /// into the list and costs O(1).
    pub fn nth_tail(&self, n: usize) -> Option<&[Term]> {
        self.elements.get(n..)
    }
}

impl From<Vec<Term>> for List {
    fn from(elements: Vec<Term>) -> Self {
        Self { elements }
    }
}

impl std::fmt::Display for List {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "]")
    }
}

/// A list with a non-nil tail.
#[derive(Debug, Clone, PartialEq)]
pub struct ImproperList {
    /// The leading elements of this list, never empty.
    pub elements: Vec<Term>,

    /// The tail, never the empty list.
    pub last: Box<Term>,
}

impl std::fmt::Display for ImproperList {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.elements.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "|{}]", self.last)
    }
}

/// A mapping from terms to terms.
///
/// Keys are unique under term equality and the insertion order is
/// irrelevant: two maps with the same entries compare equal no matter how
/// they were built.
#[derive(Debug, Clone, Default)]
pub struct Map {
    /// The entries of this map.
    pub entries: Vec<(Term, Term)>,
}

impl Map {
    /// Makes an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing the value of an equal key if present.
    pub fn insert(&mut self, key: Term, value: Term) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &Term) -> Option<&Term> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// The number of entries in this map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if this map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<(Term, Term)>> for Map {
    fn from(entries: Vec<(Term, Term)>) -> Self {
        let mut map = Self::new();
        for (k, v) in entries {
            map.insert(k, v);
        }
        map
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k) == Some(v))
    }
}

impl std::fmt::Display for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{{")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{} => {}", k, v)?;
        }
        write!(f, "}}")
    }
}

// Jenkins one-at-a-time, widened to a 64-bit state.
struct JenkinsHasher {
    state: u64,
}

impl JenkinsHasher {
    fn new() -> Self {
        Self { state: 0 }
    }

    fn write_u8(&mut self, v: u8) {
        let mut h = self.state.wrapping_add(u64::from(v));
        h = h.wrapping_add(h << 10);
        self.state = h ^ (h >> 6);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_u8(b);
        }
    }

    fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn finish(&self) -> u64 {
        let mut h = self.state;
        h = h.wrapping_add(h << 3);
        h ^= h >> 11;
        h.wrapping_add(h << 15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i32) -> Term {
        Term::from(FixInteger::from(v))
    }

    #[test]
    fn atom_name_is_truncated() {
        let atom = Atom::new("a".repeat(256));
        assert_eq!(atom.name.len(), 255);

        let short = Atom::new("hello");
        assert_eq!(short.name, "hello");
    }

    #[test]
    fn bit_binary_pad_bits_are_zeroed() {
        let bits = BitBinary::new(vec![0xFE], 3);
        assert_eq!(bits.bytes, [0xF8]);
        assert_eq!(bits.bit_len(), 5);
    }

    #[test]
    fn nth_tail_returns_every_suffix() {
        let list = List::from(vec![int(1), int(2), int(3)]);
        assert_eq!(list.nth_tail(0), Some([int(1), int(2), int(3)].as_slice()));
        assert_eq!(list.nth_tail(1), Some([int(2), int(3)].as_slice()));
        assert_eq!(list.nth_tail(2), Some([int(3)].as_slice()));
        let nil: [Term; 0] = [];
        assert_eq!(list.nth_tail(3), Some(nil.as_slice()));
        assert_eq!(list.nth_tail(4), None);
    }

    #[test]
    fn map_equality_ignores_insertion_order() {
        let a = Map::from(vec![
            (Term::from(Atom::new("x")), int(1)),
            (Term::from(Atom::new("y")), int(2)),
        ]);
        let b = Map::from(vec![
            (Term::from(Atom::new("y")), int(2)),
            (Term::from(Atom::new("x")), int(1)),
        ]);
        assert_eq!(a, b);
        assert_eq!(
            Term::from(a).structural_hash(),
            Term::from(b).structural_hash()
        );
    }

    #[test]
    fn map_insert_replaces_equal_keys() {
        let mut map = Map::new();
        map.insert(Term::from(Atom::new("k")), int(1));
        map.insert(Term::from(Atom::new("k")), int(2));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&Term::from(Atom::new("k"))), Some(&int(2)));
    }

    #[test]
    fn fix_and_big_integers_compare_and_hash_equally() {
        let fix = int(1234);
        let big = Term::from(BigInteger::from(1234i64));
        assert_eq!(fix, big);
        assert_eq!(fix.structural_hash(), big.structural_hash());
    }

    #[test]
    fn zero_floats_hash_equally() {
        let pos = Term::from(Float::from(0.0));
        let neg = Term::from(Float::from(-0.0));
        assert_eq!(pos, neg);
        assert_eq!(pos.structural_hash(), neg.structural_hash());
    }

    #[test]
    fn narrow_accessors_check_ranges() {
        assert_eq!(int(42).to_u32().unwrap(), 42);
        assert!(int(-1).to_u32().is_err());
        assert!(Term::from(BigInteger::from(u64::MAX)).to_i32().is_err());
        assert_eq!(Term::from(BigInteger::from(u64::MAX)).to_u64().unwrap(), u64::MAX);
        assert!(Term::from(Atom::new("x")).to_i32().is_err());
    }
}
