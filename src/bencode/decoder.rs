use std::collections::BTreeMap;

use super::BencodeValue;
use crate::error::{Error, Result};

/// Decode a complete bencoded document.
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    Decoder { data, pos: 0 }.value()
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(BencodeValue::Bytes(self.byte_string()?)),
            token => Err(self.fail(format!("invalid token '{}'", token as char))),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1; // 'i'
        let digits = self.take_until(b'e', "unterminated integer")?;
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| self.fail("malformed integer".into()))?;
        self.pos += 1; // 'e'
        Ok(BencodeValue::Integer(value))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let digits = self.take_until(b':', "unterminated string length")?;
        let length = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| self.fail("malformed string length".into()))?;
        self.pos += 1; // ':'

        if self.pos + length > self.data.len() {
            return Err(self.fail("string length exceeds input".into()));
        }
        let bytes = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<BencodeValue> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.pos += 1; // 'e'
        Ok(BencodeValue::List(items))
    }

    fn dict(&mut self) -> Result<BencodeValue> {
        self.pos += 1; // 'd'
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.peek()? {
                b'0'..=b'9' => self.byte_string()?,
                _ => return Err(self.fail("dictionary key must be a string".into())),
            };
            entries.insert(key, self.value()?);
        }
        self.pos += 1; // 'e'
        Ok(BencodeValue::Dict(entries))
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.fail("unexpected end of input".into()))
    }

    fn take_until(&mut self, delimiter: u8, context: &str) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != delimiter {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(self.fail(context.into()));
        }
        Ok(&self.data[start..self.pos])
    }

    fn fail(&self, reason: String) -> Error {
        Error::Bencode(format!("{reason} at byte {}", self.pos))
    }
}
