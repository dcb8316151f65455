use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::errors::StorageError;
use crate::core::Result;

/// Cursor over a page image, used by all key/value codecs.
pub struct ByteReader<'a> {
    cursor: std::io::Cursor<&'a [u8]>,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            cursor: std::io::Cursor::new(buf),
        }
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn remaining(&self) -> usize {
        let buf = *self.cursor.get_ref();
        buf.len().saturating_sub(self.cursor.position() as usize)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(ReadBytesExt::read_u8(&mut self.cursor)?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(ReadBytesExt::read_u32::<LittleEndian>(&mut self.cursor)?)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(ReadBytesExt::read_u64::<LittleEndian>(&mut self.cursor)?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(ReadBytesExt::read_i64::<LittleEndian>(&mut self.cursor)?)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| StorageError("invalid utf-8 in page image".into()).into())
    }
}

pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let _ = WriteBytesExt::write_u32::<LittleEndian>(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    let _ = WriteBytesExt::write_u64::<LittleEndian>(buf, v);
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    let _ = WriteBytesExt::write_u32::<LittleEndian>(buf, v);
}

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    let _ = WriteBytesExt::write_u8(buf, v);
}

pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    let _ = WriteBytesExt::write_i64::<LittleEndian>(buf, v);
}

/// Key contract of a map: a total order plus a stable byte representation.
///
/// The `Ord` bound is the injected comparator; `encode`/`decode` are the
/// injected serialiser. `from_append_index` makes a key constructible from
/// the map's append counter; only ordered numeric keys support it.
pub trait KeyType: Clone + Ord + std::fmt::Debug + Send + Sync + 'static {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(r: &mut ByteReader<'_>) -> Result<Self>;

    fn from_append_index(_index: u64) -> Option<Self> {
        None
    }

    fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Value contract of a map. Equality is the value comparator used by
/// `replace(old, new)`.
pub trait RecordType: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(r: &mut ByteReader<'_>) -> Result<Self>;

    fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

impl KeyType for i64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i64(buf, *self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_i64()
    }

    fn from_append_index(index: u64) -> Option<Self> {
        Some(index as i64)
    }
}

impl KeyType for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u64(buf, *self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_u64()
    }

    fn from_append_index(index: u64) -> Option<Self> {
        Some(index)
    }
}

impl KeyType for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_bytes(buf, self.as_bytes());
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_string()
    }
}

impl KeyType for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_bytes(buf, self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_bytes()
    }
}

impl RecordType for i64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_i64(buf, *self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_i64()
    }
}

impl RecordType for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u64(buf, *self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_u64()
    }
}

impl RecordType for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_bytes(buf, self.as_bytes());
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_string()
    }
}

impl RecordType for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_bytes(buf, self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.read_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_codecs_round_trip() {
        let mut buf = Vec::new();
        KeyType::encode(&(-42i64), &mut buf);
        KeyType::encode(&"hello".to_string(), &mut buf);
        let mut r = ByteReader::new(&buf);
        assert_eq!(<i64 as KeyType>::decode(&mut r).unwrap(), -42);
        assert_eq!(<String as KeyType>::decode(&mut r).unwrap(), "hello");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn append_index_keys() {
        assert_eq!(i64::from_append_index(7), Some(7));
        assert_eq!(String::from_append_index(7), None);
    }
}
