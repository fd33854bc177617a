//! Little-endian binary codec for metadata records
//!
//! Every top-level record is wrapped in a versioned envelope:
//! `struct_v: u8`, `compat_v: u8`, `len: u32`, then `len` payload bytes.
//! A decoder refuses envelopes whose `compat_v` is newer than it understands
//! and skips any payload bytes a newer encoder appended.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use std::io::Cursor;

use crate::error::DecodeError;

const ENVELOPE_HEADER_LEN: usize = 6;

/// Growable output buffer
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn put_u64(&mut self, value: u64) {
        let mut bytes = [0u8; 8];
        LittleEndian::write_u64(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn put_i64(&mut self, value: i64) {
        let mut bytes = [0u8; 8];
        LittleEndian::write_i64(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_time(&mut self, value: &DateTime<Utc>) {
        self.put_i64(value.timestamp());
        self.put_u32(value.timestamp_subsec_nanos());
    }

    /// Write a versioned envelope around whatever `body` encodes
    pub fn envelope<F>(&mut self, struct_v: u8, compat_v: u8, body: F)
    where
        F: FnOnce(&mut Encoder),
    {
        let start = self.buf.len();
        self.put_u8(struct_v);
        self.put_u8(compat_v);
        self.put_u32(0); // patched below
        body(self);
        let payload_len = (self.buf.len() - start - ENVELOPE_HEADER_LEN) as u32;
        LittleEndian::write_u32(&mut self.buf[start + 2..start + 6], payload_len);
    }
}

/// Bounds-checked reader over an encoded record
pub struct Decoder<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        let available = self.remaining();
        if available < needed {
            return Err(DecodeError::Truncated { needed, available });
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.cursor.read_u8()?)
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.cursor.read_u32::<LittleEndian>()?)
    }

    pub fn get_u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.cursor.read_u64::<LittleEndian>()?)
    }

    pub fn get_i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.cursor.read_i64::<LittleEndian>()?)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.need(len)?;
        let start = self.cursor.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    pub fn get_str(&mut self) -> Result<String, DecodeError> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn get_time(&mut self) -> Result<DateTime<Utc>, DecodeError> {
        let secs = self.get_i64()?;
        let nanos = self.get_u32()?;
        DateTime::from_timestamp(secs, nanos)
            .ok_or_else(|| DecodeError::Malformed(format!("timestamp out of range: {}s", secs)))
    }

    /// Read a versioned envelope and decode its payload with `body`.
    ///
    /// `body` receives the encoder's `struct_v` so it can branch on fields
    /// added in later versions.
    pub fn envelope<T, F>(&mut self, supported_v: u8, body: F) -> Result<T, DecodeError>
    where
        F: FnOnce(&mut Decoder<'a>, u8) -> Result<T, DecodeError>,
    {
        let struct_v = self.get_u8()?;
        let compat_v = self.get_u8()?;
        if compat_v > supported_v {
            return Err(DecodeError::IncompatibleVersion {
                compat: compat_v,
                supported: supported_v,
            });
        }
        let len = self.get_u32()? as usize;
        let payload = self.take(len)?;
        let mut inner = Decoder::new(payload);
        body(&mut inner, struct_v)
    }
}

/// A record that can be written with [`Encoder`]
pub trait Encode {
    fn encode(&self, enc: &mut Encoder);

    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode(&mut enc);
        enc.into_bytes()
    }
}

/// A record that can be read with [`Decoder`]
pub trait Decode: Sized {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(data);
        Self::decode(&mut dec)
    }
}
