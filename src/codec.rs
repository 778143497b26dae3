//! External Term Format codec.
//!
//! This module reads and writes the binary representation of [`Term`]s as
//! described in the
//! [External Term Format](https://www.erlang.org/doc/apps/erts/erl_ext_dist.html)
//! section of the ERTS documentation.
//!
//! The encoder always emits the modern forms (`NEW_PID_EXT`, `NEW_PORT_EXT`,
//! `NEWER_REFERENCE_EXT`, `NEW_FLOAT_EXT`, two-byte-length UTF-8 atoms and
//! the smallest integer representation); the decoder additionally accepts
//! every legacy form still seen on the wire.
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive as _;
use std::io::{Read, Write};

use crate::term::{
    Atom, BigInteger, Binary, BitBinary, ExternalFun, FixInteger, Float, ImproperList,
    InternalFun, List, Map, Pid, Port, Reference, Str, Term, Tuple,
};

/// The version tag preceding an external term at the outermost level.
pub const VERSION_TAG: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const BIT_BINARY_EXT: u8 = 77;
const COMPRESSED_TERM: u8 = 80;
const ATOM_CACHE_REF: u8 = 82;
const NEW_PID_EXT: u8 = 88;
const NEW_PORT_EXT: u8 = 89;
const NEWER_REFERENCE_EXT: u8 = 90;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const REFERENCE_EXT: u8 = 101;
const PORT_EXT: u8 = 102;
const PID_EXT: u8 = 103;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const NEW_FUN_EXT: u8 = 112;
const EXPORT_EXT: u8 = 113;
const NEW_REFERENCE_EXT: u8 = 114;
const MAP_EXT: u8 = 116;
const FUN_EXT: u8 = 117;
const SMALL_ATOM_UTF8_EXT: u8 = 118;
const ATOM_UTF8_EXT: u8 = 119;

// Compressing anything shorter cannot shrink it.
const MIN_COMPRESSED_SIZE: usize = 5;

/// Possible errors while decoding a term.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Unknown or unsupported tag byte.
    #[error("unknown term tag {tag}")]
    UnknownTag {
        /// The offending tag.
        tag: u8,
    },

    /// A nested term had an unexpected type.
    #[error("unexpected term {value}: expected {expected}")]
    UnexpectedType {
        /// The term that was actually decoded.
        value: Term,

        /// What the surrounding term required here.
        expected: String,
    },

    /// Malformed 31-byte ASCII float.
    #[error("malformed float text {text:?}")]
    InvalidFloat {
        /// The text that failed to parse.
        text: String,
    },

    /// A big integer arity exceeding what this platform can hold.
    #[error("too large big integer ({arity} magnitude bytes)")]
    TooLargeBigInteger {
        /// The declared magnitude size.
        arity: u64,
    },

    /// A bit string whose last-byte bit count is outside `0..=8`.
    #[error("invalid bit string tail bits {value}")]
    InvalidTailBits {
        /// The declared number of used bits in the last byte.
        value: u8,
    },

    /// A bit string whose unused trailing bits are not zero.
    #[error("non-zero pad bits in bit string (last byte {last_byte:#04x})")]
    NonZeroPadBits {
        /// The offending last byte.
        last_byte: u8,
    },

    /// The inflated size of a compressed term did not match its header.
    #[error("compressed term size mismatch: header says {expected} bytes, got {actual}")]
    CompressedSizeMismatch {
        /// The size declared in the header.
        expected: usize,

        /// The size actually inflated.
        actual: usize,
    },

    /// Malformed UTF-8 in an atom name.
    #[error("atom name is not valid UTF-8")]
    InvalidUtf8,

    /// I/O error (including truncated input).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Possible errors while encoding a term.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options controlling how terms are decoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeOptions {
    integer_lists_as_strings: bool,
}

impl DecodeOptions {
    /// Makes the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, a proper list whose elements are all valid code point
    /// integers is surfaced as a [`Str`] instead of a [`List`].
    ///
    /// If any element is not such an integer the list is decoded as a plain
    /// list, as without the option.
    pub fn integer_lists_as_strings(mut self, value: bool) -> Self {
        self.integer_lists_as_strings = value;
        self
    }
}

/// Streaming decoder for external terms.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
    options: DecodeOptions,
}

impl<R: Read> Decoder<R> {
    /// Makes a new decoder with default options.
    pub fn new(reader: R) -> Self {
        Self::with_options(reader, DecodeOptions::default())
    }

    /// Makes a new decoder.
    pub fn with_options(reader: R, options: DecodeOptions) -> Self {
        Self { reader, options }
    }

    /// Decodes one term.
    pub fn decode(mut self) -> Result<Term, DecodeError> {
        self.decode_term()
    }

    fn decode_term(&mut self) -> Result<Term, DecodeError> {
        let mut tag = self.reader.read_u8()?;
        // The version tag can only ever start a term, so skipping it here is
        // idempotent no matter how deep we are.
        if tag == VERSION_TAG {
            tag = self.reader.read_u8()?;
        }
        self.decode_tagged(tag)
    }

    fn decode_tagged(&mut self, tag: u8) -> Result<Term, DecodeError> {
        match tag {
            SMALL_INTEGER_EXT => {
                let v = self.reader.read_u8()?;
                Ok(Term::from(FixInteger::from(i32::from(v))))
            }
            INTEGER_EXT => {
                let v = self.reader.read_i32::<BigEndian>()?;
                Ok(Term::from(FixInteger::from(v)))
            }
            SMALL_BIG_EXT => {
                let n = u64::from(self.reader.read_u8()?);
                self.decode_big_integer(n)
            }
            LARGE_BIG_EXT => {
                let n = u64::from(self.reader.read_u32::<BigEndian>()?);
                self.decode_big_integer(n)
            }
            FLOAT_EXT => {
                let mut buf = [0; 31];
                self.reader.read_exact(&mut buf)?;
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                let text = std::str::from_utf8(&buf[..end])
                    .map_err(|_| DecodeError::InvalidFloat {
                        text: String::from_utf8_lossy(&buf).into_owned(),
                    })?
                    .trim();
                let value: f64 = text.parse().map_err(|_| DecodeError::InvalidFloat {
                    text: text.to_owned(),
                })?;
                Ok(Term::from(Float::from(value)))
            }
            NEW_FLOAT_EXT => {
                let bits = self.reader.read_u64::<BigEndian>()?;
                Ok(Term::from(Float::from(f64::from_bits(bits))))
            }
            ATOM_EXT => {
                let len = usize::from(self.reader.read_u16::<BigEndian>()?);
                let bytes = self.read_vec(len)?;
                Ok(Term::from(Atom::new(latin1_to_string(&bytes))))
            }
            ATOM_UTF8_EXT => {
                let len = usize::from(self.reader.read_u16::<BigEndian>()?);
                self.decode_utf8_atom(len)
            }
            SMALL_ATOM_UTF8_EXT => {
                let len = usize::from(self.reader.read_u8()?);
                self.decode_utf8_atom(len)
            }
            ATOM_CACHE_REF => {
                // Atom caches are never negotiated; the index carries no
                // information for us.
                let _index = self.reader.read_u8()?;
                Ok(Term::from(Atom::new("")))
            }
            PID_EXT => {
                let node = self.decode_atom()?;
                let id = self.reader.read_u32::<BigEndian>()? & 0x7FFF;
                let serial = self.reader.read_u32::<BigEndian>()? & 0x1FFF;
                let creation = u32::from(self.reader.read_u8()?) & 0x3;
                Ok(Term::from(Pid::new(node, id, serial, creation)))
            }
            NEW_PID_EXT => {
                let node = self.decode_atom()?;
                let id = self.reader.read_u32::<BigEndian>()?;
                let serial = self.reader.read_u32::<BigEndian>()?;
                let creation = self.reader.read_u32::<BigEndian>()?;
                Ok(Term::from(Pid::new(node, id, serial, creation)))
            }
            PORT_EXT => {
                let node = self.decode_atom()?;
                let id = self.reader.read_u32::<BigEndian>()? & 0x0FFF_FFFF;
                let creation = u32::from(self.reader.read_u8()?) & 0x3;
                Ok(Term::from(Port::new(node, id, creation)))
            }
            NEW_PORT_EXT => {
                let node = self.decode_atom()?;
                let id = self.reader.read_u32::<BigEndian>()?;
                let creation = self.reader.read_u32::<BigEndian>()?;
                Ok(Term::from(Port::new(node, id, creation)))
            }
            REFERENCE_EXT => {
                let node = self.decode_atom()?;
                let id = self.reader.read_u32::<BigEndian>()? & 0x3_FFFF;
                let creation = u32::from(self.reader.read_u8()?) & 0x3;
                Ok(Term::from(Reference::new(node, vec![id], creation)))
            }
            NEW_REFERENCE_EXT => {
                let n = usize::from(self.reader.read_u16::<BigEndian>()?);
                let node = self.decode_atom()?;
                let creation = u32::from(self.reader.read_u8()?) & 0x3;
                let mut ids = Vec::with_capacity(n);
                for _ in 0..n {
                    ids.push(self.reader.read_u32::<BigEndian>()?);
                }
                if let Some(first) = ids.first_mut() {
                    *first &= 0x3_FFFF;
                }
                Ok(Term::from(Reference::new(node, ids, creation)))
            }
            NEWER_REFERENCE_EXT => {
                let n = usize::from(self.reader.read_u16::<BigEndian>()?);
                let node = self.decode_atom()?;
                let creation = self.reader.read_u32::<BigEndian>()?;
                let mut ids = Vec::with_capacity(n);
                for _ in 0..n {
                    ids.push(self.reader.read_u32::<BigEndian>()?);
                }
                Ok(Term::from(Reference::new(node, ids, creation)))
            }
            SMALL_TUPLE_EXT => {
                let arity = usize::from(self.reader.read_u8()?);
                self.decode_tuple(arity)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.reader.read_u32::<BigEndian>()? as usize;
                self.decode_tuple(arity)
            }
            NIL_EXT => Ok(Term::from(List::nil())),
            STRING_EXT => {
                let len = usize::from(self.reader.read_u16::<BigEndian>()?);
                let bytes = self.read_vec(len)?;
                Ok(Term::from(Str::from(latin1_to_string(&bytes))))
            }
            LIST_EXT => {
                let n = self.reader.read_u32::<BigEndian>()? as usize;
                let mut elements = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    elements.push(self.decode_term()?);
                }
                let last = self.decode_term()?;
                if last.is_nil() {
                    if self.options.integer_lists_as_strings {
                        if let Some(s) = integer_list_to_string(&elements) {
                            return Ok(Term::from(Str::from(s)));
                        }
                    }
                    Ok(Term::from(List::from(elements)))
                } else {
                    Ok(Term::from(ImproperList {
                        elements,
                        last: Box::new(last),
                    }))
                }
            }
            BINARY_EXT => {
                let len = self.reader.read_u32::<BigEndian>()? as usize;
                let bytes = self.read_vec(len)?;
                Ok(Term::from(Binary::from(bytes)))
            }
            BIT_BINARY_EXT => {
                let len = self.reader.read_u32::<BigEndian>()? as usize;
                let tail_bits = self.reader.read_u8()?;
                let bytes = self.read_vec(len)?;
                let pad_bits = match (len, tail_bits) {
                    (0, 0) => 0,
                    (_, 1..=8) => 8 - tail_bits,
                    _ => return Err(DecodeError::InvalidTailBits { value: tail_bits }),
                };
                if let Some(&last) = bytes.last() {
                    if last & !(0xFFu8 << pad_bits) != 0 {
                        return Err(DecodeError::NonZeroPadBits { last_byte: last });
                    }
                }
                Ok(Term::from(BitBinary::new(bytes, pad_bits)))
            }
            MAP_EXT => {
                let n = self.reader.read_u32::<BigEndian>()? as usize;
                let mut map = Map::new();
                for _ in 0..n {
                    let key = self.decode_term()?;
                    let value = self.decode_term()?;
                    map.insert(key, value);
                }
                Ok(Term::from(map))
            }
            EXPORT_EXT => {
                let module = self.decode_atom()?;
                let function = self.decode_atom()?;
                let arity = self.decode_integer("fun arity")?;
                let arity = u8::try_from(arity).map_err(|_| DecodeError::UnexpectedType {
                    value: Term::from(FixInteger::from(arity)),
                    expected: "arity in 0..=255".to_owned(),
                })?;
                Ok(Term::from(ExternalFun {
                    module,
                    function,
                    arity,
                }))
            }
            FUN_EXT => {
                let num_free = self.reader.read_u32::<BigEndian>()? as usize;
                let pid = self.decode_pid()?;
                let module = self.decode_atom()?;
                let index = self.decode_integer("fun index")?;
                let uniq = self.decode_integer("fun uniq")?;
                let mut free_vars = Vec::with_capacity(num_free.min(4096));
                for _ in 0..num_free {
                    free_vars.push(self.decode_term()?);
                }
                Ok(Term::from(InternalFun::Old {
                    module,
                    pid,
                    free_vars,
                    index,
                    uniq,
                }))
            }
            NEW_FUN_EXT => {
                // The size field duplicates information that the stream
                // already carries, so it is read and discarded.
                let _size = self.reader.read_u32::<BigEndian>()?;
                let arity = self.reader.read_u8()?;
                let mut uniq = [0; 16];
                self.reader.read_exact(&mut uniq)?;
                let index = self.reader.read_u32::<BigEndian>()?;
                let num_free = self.reader.read_u32::<BigEndian>()? as usize;
                let module = self.decode_atom()?;
                let old_index = self.decode_integer("fun old index")?;
                let old_uniq = self.decode_integer("fun old uniq")?;
                let pid = self.decode_pid()?;
                let mut free_vars = Vec::with_capacity(num_free.min(4096));
                for _ in 0..num_free {
                    free_vars.push(self.decode_term()?);
                }
                Ok(Term::from(InternalFun::New {
                    module,
                    arity,
                    pid,
                    free_vars,
                    index,
                    uniq,
                    old_index,
                    old_uniq,
                }))
            }
            COMPRESSED_TERM => {
                let size = self.reader.read_u32::<BigEndian>()? as usize;
                let mut inflated = Vec::new();
                let mut decoder = flate2::read::ZlibDecoder::new(&mut self.reader);
                (&mut decoder)
                    .take(size as u64 + 1)
                    .read_to_end(&mut inflated)?;
                if inflated.len() != size {
                    return Err(DecodeError::CompressedSizeMismatch {
                        expected: size,
                        actual: inflated.len(),
                    });
                }
                Decoder::with_options(&inflated[..], self.options).decode()
            }
            tag => Err(DecodeError::UnknownTag { tag }),
        }
    }

    fn decode_tuple(&mut self, arity: usize) -> Result<Term, DecodeError> {
        let mut elements = Vec::with_capacity(arity.min(4096));
        for _ in 0..arity {
            elements.push(self.decode_term()?);
        }
        Ok(Term::from(Tuple::from(elements)))
    }

    fn decode_big_integer(&mut self, n: u64) -> Result<Term, DecodeError> {
        let n = usize::try_from(n).map_err(|_| DecodeError::TooLargeBigInteger { arity: n })?;
        let sign = match self.reader.read_u8()? {
            0 => Sign::Plus,
            _ => Sign::Minus,
        };
        let magnitude = self.read_vec(n)?;
        let value = BigInt::from_bytes_le(sign, &magnitude);
        Ok(Term::from(BigInteger::from(value)))
    }

    fn decode_utf8_atom(&mut self, len: usize) -> Result<Term, DecodeError> {
        let bytes = self.read_vec(len)?;
        let name = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(Term::from(Atom::new(name)))
    }

    fn decode_atom(&mut self) -> Result<Atom, DecodeError> {
        let term = self.decode_term()?;
        term.try_into().map_err(|value| DecodeError::UnexpectedType {
            value,
            expected: "atom".to_owned(),
        })
    }

    fn decode_pid(&mut self) -> Result<Pid, DecodeError> {
        let term = self.decode_term()?;
        term.try_into().map_err(|value| DecodeError::UnexpectedType {
            value,
            expected: "pid".to_owned(),
        })
    }

    fn decode_integer(&mut self, expected: &str) -> Result<i32, DecodeError> {
        let term = self.decode_term()?;
        match term.to_i32() {
            Ok(v) => Ok(v),
            Err(_) => Err(DecodeError::UnexpectedType {
                value: term,
                expected: expected.to_owned(),
            }),
        }
    }

    // Reads `len` bytes without trusting `len` for the allocation size, so a
    // lying length prefix on a short stream fails with `UnexpectedEof`
    // instead of exhausting memory.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        let mut buf = Vec::new();
        (&mut self.reader).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected eof",
            )
            .into());
        }
        Ok(buf)
    }
}

fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn integer_list_to_string(elements: &[Term]) -> Option<String> {
    let mut s = String::with_capacity(elements.len());
    for element in elements {
        let code = match element {
            Term::FixInteger(x) => u32::try_from(x.value).ok()?,
            _ => return None,
        };
        s.push(char::from_u32(code)?);
    }
    Some(s)
}

/// Streaming encoder for external terms.
#[derive(Debug)]
pub struct Encoder<W> {
    writer: W,
}

impl<W: Write> Encoder<W> {
    /// Makes a new encoder.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encodes one term, preceded by the version tag.
    pub fn encode(mut self, term: &Term) -> Result<(), EncodeError> {
        self.writer.write_u8(VERSION_TAG)?;
        self.encode_term(term)
    }

    /// Encodes one term as a compressed external term.
    ///
    /// Falls back to the plain encoding when the term is too small for
    /// compression to pay off.
    pub fn encode_compressed(mut self, term: &Term) -> Result<(), EncodeError> {
        let mut plain = Vec::new();
        Encoder::new(&mut plain).encode_term(term)?;

        self.writer.write_u8(VERSION_TAG)?;
        if plain.len() < MIN_COMPRESSED_SIZE {
            self.writer.write_all(&plain)?;
            return Ok(());
        }
        self.writer.write_u8(COMPRESSED_TERM)?;
        self.writer.write_u32::<BigEndian>(plain.len() as u32)?;
        let mut deflater =
            flate2::write::ZlibEncoder::new(&mut self.writer, flate2::Compression::default());
        deflater.write_all(&plain)?;
        deflater.finish()?;
        Ok(())
    }

    fn encode_term(&mut self, term: &Term) -> Result<(), EncodeError> {
        match term {
            Term::Atom(x) => self.encode_atom(x),
            Term::FixInteger(x) => self.encode_fix_integer(x.value),
            Term::BigInteger(x) => self.encode_big_integer(&x.value),
            Term::Float(x) => {
                self.writer.write_u8(NEW_FLOAT_EXT)?;
                self.writer.write_u64::<BigEndian>(x.value.to_bits())?;
                Ok(())
            }
            Term::Str(x) => self.encode_str(x),
            Term::Binary(x) => {
                self.writer.write_u8(BINARY_EXT)?;
                self.writer.write_u32::<BigEndian>(x.bytes.len() as u32)?;
                self.writer.write_all(&x.bytes)?;
                Ok(())
            }
            Term::BitBinary(x) => {
                self.writer.write_u8(BIT_BINARY_EXT)?;
                self.writer.write_u32::<BigEndian>(x.bytes.len() as u32)?;
                let tail_bits = if x.bytes.is_empty() { 0 } else { 8 - x.pad_bits };
                self.writer.write_u8(tail_bits)?;
                self.writer.write_all(&x.bytes)?;
                Ok(())
            }
            Term::Pid(x) => {
                self.writer.write_u8(NEW_PID_EXT)?;
                self.encode_atom(&x.node)?;
                self.writer.write_u32::<BigEndian>(x.id)?;
                self.writer.write_u32::<BigEndian>(x.serial)?;
                self.writer.write_u32::<BigEndian>(x.creation)?;
                Ok(())
            }
            Term::Port(x) => {
                self.writer.write_u8(NEW_PORT_EXT)?;
                self.encode_atom(&x.node)?;
                self.writer.write_u32::<BigEndian>(x.id)?;
                self.writer.write_u32::<BigEndian>(x.creation)?;
                Ok(())
            }
            Term::Reference(x) => {
                self.writer.write_u8(NEWER_REFERENCE_EXT)?;
                self.writer.write_u16::<BigEndian>(x.ids.len() as u16)?;
                self.encode_atom(&x.node)?;
                self.writer.write_u32::<BigEndian>(x.creation)?;
                for &id in &x.ids {
                    self.writer.write_u32::<BigEndian>(id)?;
                }
                Ok(())
            }
            Term::ExternalFun(x) => {
                self.writer.write_u8(EXPORT_EXT)?;
                self.encode_atom(&x.module)?;
                self.encode_atom(&x.function)?;
                self.encode_fix_integer(i32::from(x.arity))?;
                Ok(())
            }
            Term::InternalFun(x) => self.encode_internal_fun(x),
            Term::Tuple(x) => {
                if x.elements.len() <= 0xFF {
                    self.writer.write_u8(SMALL_TUPLE_EXT)?;
                    self.writer.write_u8(x.elements.len() as u8)?;
                } else {
                    self.writer.write_u8(LARGE_TUPLE_EXT)?;
                    self.writer.write_u32::<BigEndian>(x.elements.len() as u32)?;
                }
                for e in &x.elements {
                    self.encode_term(e)?;
                }
                Ok(())
            }
            Term::List(x) => {
                if x.is_nil() {
                    self.writer.write_u8(NIL_EXT)?;
                    return Ok(());
                }
                self.writer.write_u8(LIST_EXT)?;
                self.writer.write_u32::<BigEndian>(x.elements.len() as u32)?;
                for e in &x.elements {
                    self.encode_term(e)?;
                }
                self.writer.write_u8(NIL_EXT)?;
                Ok(())
            }
            Term::ImproperList(x) => {
                self.writer.write_u8(LIST_EXT)?;
                self.writer.write_u32::<BigEndian>(x.elements.len() as u32)?;
                for e in &x.elements {
                    self.encode_term(e)?;
                }
                self.encode_term(&x.last)?;
                Ok(())
            }
            Term::Map(x) => {
                self.writer.write_u8(MAP_EXT)?;
                self.writer.write_u32::<BigEndian>(x.entries.len() as u32)?;
                for (k, v) in &x.entries {
                    self.encode_term(k)?;
                    self.encode_term(v)?;
                }
                Ok(())
            }
        }
    }

    fn encode_atom(&mut self, atom: &Atom) -> Result<(), EncodeError> {
        let bytes = atom.name.as_bytes();
        self.writer.write_u8(ATOM_UTF8_EXT)?;
        self.writer.write_u16::<BigEndian>(bytes.len() as u16)?;
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn encode_fix_integer(&mut self, value: i32) -> Result<(), EncodeError> {
        if let Ok(v) = u8::try_from(value) {
            self.writer.write_u8(SMALL_INTEGER_EXT)?;
            self.writer.write_u8(v)?;
        } else {
            self.writer.write_u8(INTEGER_EXT)?;
            self.writer.write_i32::<BigEndian>(value)?;
        }
        Ok(())
    }

    fn encode_big_integer(&mut self, value: &BigInt) -> Result<(), EncodeError> {
        if let Some(v) = value.to_i32() {
            return self.encode_fix_integer(v);
        }
        let (sign, magnitude) = value.to_bytes_le();
        if magnitude.len() <= 0xFF {
            self.writer.write_u8(SMALL_BIG_EXT)?;
            self.writer.write_u8(magnitude.len() as u8)?;
        } else {
            self.writer.write_u8(LARGE_BIG_EXT)?;
            self.writer.write_u32::<BigEndian>(magnitude.len() as u32)?;
        }
        self.writer.write_u8((sign == Sign::Minus) as u8)?;
        self.writer.write_all(&magnitude)?;
        Ok(())
    }

    fn encode_str(&mut self, s: &Str) -> Result<(), EncodeError> {
        let compact = s.value.chars().count() <= 0xFFFF
            && s.value.chars().all(|c| u32::from(c) <= 0xFF);
        if compact {
            let bytes: Vec<u8> = s.value.chars().map(|c| u32::from(c) as u8).collect();
            self.writer.write_u8(STRING_EXT)?;
            self.writer.write_u16::<BigEndian>(bytes.len() as u16)?;
            self.writer.write_all(&bytes)?;
        } else {
            self.writer.write_u8(LIST_EXT)?;
            self.writer
                .write_u32::<BigEndian>(s.value.chars().count() as u32)?;
            for c in s.value.chars() {
                self.encode_fix_integer(u32::from(c) as i32)?;
            }
            self.writer.write_u8(NIL_EXT)?;
        }
        Ok(())
    }

    fn encode_internal_fun(&mut self, fun: &InternalFun) -> Result<(), EncodeError> {
        match fun {
            InternalFun::Old {
                module,
                pid,
                free_vars,
                index,
                uniq,
            } => {
                self.writer.write_u8(FUN_EXT)?;
                self.writer.write_u32::<BigEndian>(free_vars.len() as u32)?;
                self.encode_term(&Term::Pid(pid.clone()))?;
                self.encode_atom(module)?;
                self.encode_fix_integer(*index)?;
                self.encode_fix_integer(*uniq)?;
                for v in free_vars {
                    self.encode_term(v)?;
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
                let mut body = Vec::new();
                {
                    let mut enc = Encoder::new(&mut body);
                    enc.writer.write_u8(*arity)?;
                    enc.writer.write_all(uniq)?;
                    enc.writer.write_u32::<BigEndian>(*index)?;
                    enc.writer.write_u32::<BigEndian>(free_vars.len() as u32)?;
                    enc.encode_atom(module)?;
                    enc.encode_fix_integer(*old_index)?;
                    enc.encode_fix_integer(*old_uniq)?;
                    enc.encode_term(&Term::Pid(pid.clone()))?;
                    for v in free_vars {
                        enc.encode_term(v)?;
                    }
                }
                self.writer.write_u8(NEW_FUN_EXT)?;
                self.writer.write_u32::<BigEndian>(4 + body.len() as u32)?;
                self.writer.write_all(&body)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(term: &Term) -> Vec<u8> {
        let mut buf = Vec::new();
        term.encode(&mut buf).expect("encode failed");
        buf
    }

    fn decode(bytes: &[u8]) -> Term {
        Term::decode(bytes).expect("decode failed")
    }

    fn assert_round_trip(term: Term) {
        assert_eq!(decode(&encode(&term)), term);
    }

    fn int(v: i32) -> Term {
        Term::from(FixInteger::from(v))
    }

    fn big(v: i128) -> Term {
        Term::from(BigInteger::from(BigInt::from(v)))
    }

    #[test]
    fn atom_encoding_is_bit_exact() {
        let bytes = encode(&Term::from(Atom::new("hello")));
        assert_eq!(bytes, [131, 119, 0, 5, 104, 101, 108, 108, 111]);
        assert_eq!(decode(&bytes), Term::from(Atom::new("hello")));
    }

    #[test]
    fn atom_is_truncated_on_decode() {
        let mut bytes = vec![131, 100, 1, 0];
        bytes.extend(std::iter::repeat(b'a').take(256));
        let atom: Atom = decode(&bytes).try_into().expect("not an atom");
        assert_eq!(atom.name.len(), 255);
    }

    #[test]
    fn legacy_atom_tags_decode() {
        // ATOM_EXT carries Latin-1.
        let term = decode(&[131, 100, 0, 2, 0xE5, 0x71]);
        assert_eq!(term, Term::from(Atom::new("\u{E5}q")));

        // SMALL_ATOM_UTF8_EXT carries a one-byte length.
        let term = decode(&[131, 118, 2, b'o', b'k']);
        assert_eq!(term, Term::from(Atom::new("ok")));
    }

    #[test]
    fn integer_encoding_is_bit_exact() {
        assert_eq!(encode(&int(42)), [131, 97, 42]);
        assert_eq!(encode(&int(-1)), [131, 98, 255, 255, 255, 255]);
        assert_eq!(encode(&int(300)), [131, 98, 0, 0, 1, 44]);
    }

    #[test]
    fn integer_round_trip_covers_representation_boundaries() {
        for value in [0, 255, 256, -1, i32::MAX as i128, i32::MIN as i128] {
            assert_round_trip(big(value));
            if let Ok(v) = i32::try_from(value) {
                assert_round_trip(int(v));
            }
        }
        for value in [
            1i128 << 31,
            1i128 << 64,
            -(1i128 << 64),
        ] {
            assert_round_trip(big(value));
        }
    }

    #[test]
    fn big_integers_canonicalize_to_the_smallest_form() {
        assert_eq!(encode(&big(7)), [131, 97, 7]);
        assert_eq!(encode(&big(-2)), [131, 98, 255, 255, 255, 254]);
        // 2^32 needs five magnitude bytes.
        assert_eq!(encode(&big(1 << 32)), [131, 110, 5, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn floats_round_trip_in_the_modern_form() {
        let term = Term::from(Float::from(1.5));
        assert_eq!(encode(&term), [131, 70, 0x3F, 0xF8, 0, 0, 0, 0, 0, 0]);
        assert_round_trip(term);
        assert_round_trip(Term::from(Float::from(-123.456e78)));
    }

    #[test]
    fn legacy_ascii_float_decodes() {
        let mut bytes = vec![131, 99];
        let mut text = b"1.50000000000000000000e+00".to_vec();
        text.resize(31, 0);
        bytes.extend(text);
        assert_eq!(decode(&bytes), Term::from(Float::from(1.5)));
    }

    #[test]
    fn string_round_trip_at_length_boundaries() {
        for len in [0usize, 1, 255, 65535] {
            let term = Term::from(Str::from("x".repeat(len)));
            assert_round_trip(term);
        }
    }

    #[test]
    fn long_and_wide_strings_round_trip_as_code_point_lists() {
        let options = DecodeOptions::new().integer_lists_as_strings(true);
        for value in ["y".repeat(65536), "smile \u{1F600}".to_owned()] {
            let term = Term::from(Str::from(value));
            let bytes = encode(&term);
            assert_eq!(bytes[1], 108);
            assert_eq!(Term::decode_with(&bytes[..], options).expect("decode"), term);
        }
    }

    #[test]
    fn integer_lists_stay_lists_when_not_parseable_as_strings() {
        let options = DecodeOptions::new().integer_lists_as_strings(true);
        let term = Term::from(List::from(vec![int(0x110000), int(65)]));
        let bytes = encode(&term);
        assert_eq!(Term::decode_with(&bytes[..], options).expect("decode"), term);
    }

    #[test]
    fn tuple_of_pid_and_string_is_bit_exact() {
        let term = Term::from(Tuple::from(vec![
            Term::from(Pid::new("a", 1, 0, 0)),
            Term::from(Str::from("ok")),
        ]));
        let bytes = encode(&term);
        assert_eq!(
            bytes,
            [
                131, 104, 2, // small tuple of arity 2
                88, 119, 0, 1, b'a', 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, // new pid
                107, 0, 2, b'o', b'k', // 8-bit string
            ]
        );
        let decoded: Tuple = decode(&bytes).try_into().expect("not a tuple");
        assert_eq!(decoded.elements[0], Term::from(Pid::new("a", 1, 0, 0)));
        assert_eq!(decoded.elements[1], Term::from(Str::from("ok")));
    }

    #[test]
    fn legacy_identifier_tags_decode_with_masks() {
        // PID_EXT: id and serial keep 15 and 13 bits, creation two.
        let mut bytes = vec![131, 103, 119, 0, 1, b'n'];
        bytes.extend([0xFF, 0xFF, 0xFF, 0xFF]); // id
        bytes.extend([0xFF, 0xFF, 0xFF, 0xFF]); // serial
        bytes.push(0xFF); // creation
        assert_eq!(decode(&bytes), Term::from(Pid::new("n", 0x7FFF, 0x1FFF, 3)));

        // PORT_EXT: 28-bit id.
        let mut bytes = vec![131, 102, 119, 0, 1, b'n'];
        bytes.extend([0xFF, 0xFF, 0xFF, 0xFF]);
        bytes.push(0xFF);
        assert_eq!(decode(&bytes), Term::from(Port::new("n", 0x0FFF_FFFF, 3)));

        // REFERENCE_EXT: 18-bit id.
        let mut bytes = vec![131, 101, 119, 0, 1, b'n'];
        bytes.extend([0xFF, 0xFF, 0xFF, 0xFF]);
        bytes.push(0xFF);
        assert_eq!(
            decode(&bytes),
            Term::from(Reference::new("n", vec![0x3_FFFF], 3))
        );
    }

    #[test]
    fn identifiers_round_trip() {
        assert_round_trip(Term::from(Pid::new("foo@bar", 38, 0, 5)));
        assert_round_trip(Term::from(Port::new("foo@bar", 7, 9)));
        assert_round_trip(Term::from(Reference::new("foo@bar", vec![1, 2, 3], 4)));
    }

    #[test]
    fn containers_round_trip() {
        assert_round_trip(Term::from(Tuple::nil()));
        assert_round_trip(Term::from(Tuple::from(vec![int(1), Term::from(Atom::new("two"))])));
        assert_round_trip(Term::from(List::nil()));
        assert_round_trip(Term::from(List::from(vec![int(1), int(2), int(3000)])));
        assert_round_trip(Term::from(ImproperList {
            elements: vec![int(1), int(2)],
            last: Box::new(Term::from(Atom::new("tail"))),
        }));
        assert_round_trip(Term::from(Map::from(vec![
            (Term::from(Atom::new("k")), int(1)),
            (int(2), Term::from(List::from(vec![int(3)]))),
        ])));
    }

    #[test]
    fn binaries_and_bit_strings_round_trip() {
        assert_round_trip(Term::from(Binary::from(vec![0, 1, 2, 255])));
        assert_round_trip(Term::from(Binary::from(Vec::new())));
        assert_round_trip(Term::from(BitBinary::new(vec![0xAB, 0xC0], 5)));
    }

    #[test]
    fn non_zero_pad_bits_are_rejected() {
        // Three used bits, but the low five are not zero.
        let bytes = [131, 77, 0, 0, 0, 1, 3, 0xFF];
        assert!(matches!(
            Term::decode(&bytes[..]),
            Err(DecodeError::NonZeroPadBits { last_byte: 0xFF })
        ));
    }

    #[test]
    fn funs_round_trip() {
        assert_round_trip(Term::from(ExternalFun {
            module: Atom::new("erlang"),
            function: Atom::new("self"),
            arity: 0,
        }));
        assert_round_trip(Term::from(InternalFun::Old {
            module: Atom::new("m"),
            pid: Pid::new("n", 1, 2, 3),
            free_vars: vec![int(9)],
            index: 4,
            uniq: 5,
        }));
        assert_round_trip(Term::from(InternalFun::New {
            module: Atom::new("m"),
            arity: 2,
            pid: Pid::new("n", 1, 2, 3),
            free_vars: vec![int(9), Term::from(Atom::new("free"))],
            index: 4,
            uniq: [7; 16],
            old_index: 1,
            old_uniq: 2,
        }));
    }

    #[test]
    fn compressed_terms_round_trip() {
        let term = Term::from(List::from(vec![int(7); 1000]));
        let mut bytes = Vec::new();
        term.encode_compressed(&mut bytes).expect("encode");
        assert_eq!(bytes[1], 80);
        // Far smaller than the 1000-element plain encoding.
        assert!(bytes.len() < 512);
        assert_eq!(decode(&bytes), term);
    }

    #[test]
    fn tiny_terms_are_not_compressed() {
        let term = int(7);
        let mut bytes = Vec::new();
        term.encode_compressed(&mut bytes).expect("encode");
        assert_eq!(bytes, encode(&term));
    }

    #[test]
    fn compressed_size_mismatch_is_rejected() {
        let term = Term::from(List::from(vec![int(7); 100]));
        let mut bytes = Vec::new();
        term.encode_compressed(&mut bytes).expect("encode");
        // Lie about the uncompressed size.
        bytes[2..6].copy_from_slice(&1u32.to_be_bytes());
        assert!(matches!(
            Term::decode(&bytes[..]),
            Err(DecodeError::CompressedSizeMismatch { expected: 1, .. })
        ));
    }

    #[test]
    fn truncated_input_fails() {
        let bytes = encode(&Term::from(Tuple::from(vec![int(1), int(2)])));
        for len in 1..bytes.len() {
            assert!(Term::decode(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn unknown_tags_fail() {
        assert!(matches!(
            Term::decode(&[131, 200][..]),
            Err(DecodeError::UnknownTag { tag: 200 })
        ));
    }

    #[test]
    fn version_tag_is_skipped_idempotently() {
        assert_eq!(decode(&[131, 97, 42]), int(42));
        assert_eq!(decode(&[97, 42]), int(42));
    }
}
