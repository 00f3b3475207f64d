use super::{error::DecodeError, value::Value};
use std::collections::{btree_map::Entry, BTreeMap};

/// Decode exactly one value spanning the whole input.
///
/// Containers nested deeper than `max_depth` fail with [`DecodeError::RecursionDepth`]; the
/// check happens when the container is opened, so truncated input such as `lllll` is rejected
/// for its depth rather than for ending early.
pub fn decode(data: &[u8], max_depth: usize) -> Result<Value, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut decoder = Decoder {
        data,
        pos: 0,
        max_depth,
    };
    let value = decoder.value(0)?;

    if decoder.pos != data.len() {
        return Err(DecodeError::TrailingBytes(data.len() - decoder.pos));
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => {
                self.enter(depth)?;
                self.list(depth + 1)
            }
            b'd' => {
                self.enter(depth)?;
                self.dict(depth + 1)
            }
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(DecodeError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn enter(&self, depth: usize) -> Result<(), DecodeError> {
        if depth + 1 > self.max_depth {
            Err(DecodeError::RecursionDepth(self.max_depth))
        } else {
            Ok(())
        }
    }

    fn integer(&mut self) -> Result<Value, DecodeError> {
        let start = self.pos;
        // Skip the 'i'.
        self.pos += 1;

        let digits_start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.data[digits_start..self.pos];
        self.pos += 1;

        parse_integer(digits).ok_or(DecodeError::InvalidInteger(start))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.pos;

        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(DecodeError::InvalidLength(start));
            }
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        self.pos += 1;

        if digits.is_empty() || (digits.len() > 1 && digits[0] == b'0') {
            return Err(DecodeError::InvalidLength(start));
        }

        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(DecodeError::InvalidLength(start))?;

        let end = self
            .pos
            .checked_add(len)
            .ok_or(DecodeError::InvalidLength(start))?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;

        Ok(bytes.to_vec())
    }

    fn list(&mut self, depth: usize) -> Result<Value, DecodeError> {
        // Skip the 'l'.
        self.pos += 1;
        let mut list = Vec::new();

        while self.peek()? != b'e' {
            list.push(self.value(depth)?);
        }
        self.pos += 1;

        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, DecodeError> {
        // Skip the 'd'.
        self.pos += 1;
        let mut dict = BTreeMap::new();

        while self.peek()? != b'e' {
            let key_offset = self.pos;
            // Keys go through the generic path so nested garbage still hits the depth limit.
            let key = match self.value(depth)? {
                Value::Bytes(key) => key,
                _ => return Err(DecodeError::NonStringKey(key_offset)),
            };
            let value = self.value(depth)?;

            match dict.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(value);
                }
                Entry::Occupied(_) => return Err(DecodeError::DuplicateKey(key_offset)),
            }
        }
        self.pos += 1;

        Ok(Value::Dict(dict))
    }
}

/// Parse canonical decimal: optional '-', no leading zeros, no "-0".
fn parse_integer(digits: &[u8]) -> Option<Value> {
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);

    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return None;
    }

    if unsigned[0] == b'0' && (unsigned.len() > 1 || unsigned.len() != digits.len()) {
        return None;
    }

    std::str::from_utf8(digits)
        .ok()?
        .parse::<i64>()
        .ok()
        .map(Value::Integer)
}
