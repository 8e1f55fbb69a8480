use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a single bencode value from the start of `input`.
///
/// This is the whole-buffer form: the value must account for every byte of
/// the input. Tracker bodies and metainfo files are exactly one top-level
/// value, so anything left over is an encoding error rather than data for
/// a later read.
///
/// # Arguments
/// * `input` - The complete bencoded byte sequence
///
/// # Returns
/// * `Result<BencodeValue>` - The decoded value, or an error if:
///   - The value itself is malformed
///   - Bytes remain after the top-level value (`TrailingData`)
#[instrument(skip(input), level = "debug")]
pub fn decode(input: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix(input)?;
    if consumed != input.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes a bencode value from the start of `input` and reports how many
/// bytes it occupied.
///
/// The decoder is iterative: containers under construction are kept on an
/// explicit stack rather than the call stack, so arbitrarily deep nesting
/// (`lllll...`) cannot exhaust it. Each loop turn either begins a container,
/// finishes a leaf value, or closes the innermost open container on `e`;
/// finished values are folded into their parent frame until none remain.
///
/// # Arguments
/// * `input` - A byte slice beginning with a bencoded value
///
/// # Returns
/// * `Result<(BencodeValue, usize)>` - The decoded value and the number of
///   bytes consumed, or an error if:
///   - A digit was expected and something else was found
///   - A terminating `e` is missing
///   - A string length prefix exceeds the remaining input
///   - A dictionary key is not a string
#[instrument(skip(input), level = "trace")]
pub fn decode_prefix(input: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut cursor = Cursor { input, pos: 0 };
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let completed = match cursor.peek()? {
            b'e' => {
                cursor.advance(1);
                match stack.pop() {
                    Some(Frame::List(items)) => BencodeValue::List(items),
                    Some(Frame::Dict(map, pending_key)) => {
                        if pending_key.is_some() {
                            return Err(BencodeError::InvalidFormat(
                                "Dictionary key without a value".to_string(),
                            ));
                        }
                        BencodeValue::Dict(map)
                    }
                    None => {
                        return Err(BencodeError::InvalidFormat(
                            "'e' with no open container".to_string(),
                        ));
                    }
                }
            }
            b'i' => {
                cursor.advance(1);
                BencodeValue::Integer(parse_integer(&mut cursor)?)
            }
            b'l' => {
                cursor.advance(1);
                stack.push(Frame::List(Vec::new()));
                continue;
            }
            b'd' => {
                cursor.advance(1);
                stack.push(Frame::Dict(BTreeMap::new(), None));
                continue;
            }
            b'0'..=b'9' => BencodeValue::String(parse_string(&mut cursor)?),
            other => {
                return Err(BencodeError::InvalidFormat(format!(
                    "Unexpected byte: 0x{:02x}",
                    other
                )));
            }
        };

        match stack.last_mut() {
            None => return Ok((completed, cursor.pos)),
            Some(Frame::List(items)) => items.push(completed),
            Some(Frame::Dict(map, pending_key)) => match pending_key.take() {
                Some(key) => {
                    map.insert(key, completed);
                }
                None => match completed {
                    BencodeValue::String(key) => *pending_key = Some(key),
                    _ => return Err(BencodeError::DictKeyNotString),
                },
            },
        }
    }
}

/// A container mid-construction. Dictionaries additionally hold the key
/// awaiting its value.
enum Frame {
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>, Option<Vec<u8>>),
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEOI)
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn take(&mut self, n: usize) -> BencodeResult<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(BencodeError::StringOverrun)?;
        if end > self.input.len() {
            return Err(BencodeError::StringOverrun);
        }
        let slice = &self.input[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Consumes bytes up to (but not including) `delimiter`, then consumes
    /// the delimiter itself. Missing delimiter means the input ran out.
    fn take_until(&mut self, delimiter: u8) -> BencodeResult<&[u8]> {
        let start = self.pos;
        loop {
            let byte = self.peek()?;
            self.advance(1);
            if byte == delimiter {
                return Ok(&self.input[start..self.pos - 1]);
            }
        }
    }
}

/// Parses the body of an integer; the leading `i` has been consumed.
///
/// Rejects the empty body, a bare `-`, leading zeros (except the literal
/// `0`), and negative zero.
fn parse_integer(cursor: &mut Cursor) -> BencodeResult<i64> {
    let digits = cursor.take_until(b'e')?;

    if digits.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if digits == b"-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let magnitude = if digits[0] == b'-' { &digits[1..] } else { digits };
    if magnitude.is_empty() || magnitude.iter().any(|b| !b.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }
    if magnitude.len() > 1 && magnitude[0] == b'0' {
        return Err(BencodeError::InvalidInteger);
    }

    // All-ASCII digits by construction, so from_utf8 cannot fail.
    let text = std::str::from_utf8(digits)
        .map_err(|_| BencodeError::InvalidInteger)?;
    text.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

/// Parses a `<length>:<bytes>` string at the cursor.
///
/// The length prefix is validated as pure digits before parsing, and the
/// announced length must fit inside the remaining input; a prefix that
/// promises more bytes than the stream holds is an error, not a request
/// for more data.
fn parse_string(cursor: &mut Cursor) -> BencodeResult<Vec<u8>> {
    let length_digits = cursor.take_until(b':')?;
    if length_digits.is_empty() || length_digits.iter().any(|b| !b.is_ascii_digit()) {
        return Err(BencodeError::InvalidStringLength);
    }
    let length = std::str::from_utf8(length_digits)
        .map_err(|_| BencodeError::InvalidStringLength)?
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    Ok(cursor.take(length)?.to_vec())
}
