//! Bencode codec.
//!
//! Bencode is the self-describing binary format BitTorrent uses both on disk
//! (metainfo files) and on the wire (tracker responses). The decoder here is
//! iterative and byte-exact; the encoder is canonical, which matters because
//! the torrent's identity hash is computed over a re-encoding of the `info`
//! dictionary and every client must arrive at the same bytes.
use std::collections::BTreeMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_prefix};
pub use encoder::{encode, encode_to_vec};

/// A decoded bencode value.
///
/// The four variants cover the whole format:
///
/// 1. `String(Vec<u8>)` - a length-prefixed byte string (`4:spam`). Stored
///    as raw bytes; torrent files routinely carry non-UTF-8 strings such as
///    the concatenated piece hashes.
/// 2. `Integer(i64)` - `i42e`.
/// 3. `List(Vec<BencodeValue>)` - `l...e`, an ordered sequence.
/// 4. `Dict(BTreeMap<Vec<u8>, BencodeValue>)` - `d...e`, keys are byte
///    strings. A `BTreeMap` keeps keys in lexicographic byte order, so
///    re-encoding a decoded dictionary reproduces the canonical form
///    without a separate sorting pass.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Convenience view of this value as a dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Convenience view of this value as a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Custom error type for bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("String length exceeds remaining input")]
    StringOverrun,

    #[error("Unexpected end of input")]
    UnexpectedEOI,

    #[error("Dictionary keys must be strings")]
    DictKeyNotString,

    #[error("Trailing data after top-level value")]
    TrailingData,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
