//! Cursor types for little-endian wire formats.
//!
//! [`ByteWriter`] and [`ByteReader`] walk a byte slice front to back. Types with a wire
//! representation implement [`ToBytes`] and [`FromBytes`] on top of them.
//!
//! Everything that is parsed out of a captured PDU (advertising payloads, LL Control PDUs) and
//! everything that is handed to the host (packet records, progress reports, command responses)
//! goes through these types.
//!
//! [`ToBytes`]: trait.ToBytes.html
//! [`FromBytes`]: trait.FromBytes.html
//! [`ByteWriter`]: struct.ByteWriter.html
//! [`ByteReader`]: struct.ByteReader.html

use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use core::{cmp, mem};

/// Writes values into a borrowed byte slice, front to back.
///
/// Writes that do not fit fail with `Error::Eof`.
pub struct ByteWriter<'a>(&'a mut [u8]);

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter(buf)
    }

    /// Returns the number of bytes that still fit.
    pub fn space_left(&self) -> usize {
        self.0.len()
    }

    /// Writes all of `other`, or nothing if it does not fit.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            Err(Error::Eof)
        } else {
            self.0[..other.len()].copy_from_slice(other);
            let this = mem::replace(&mut self.0, &mut []);
            self.0 = &mut this[other.len()..];
            Ok(())
        }
    }

    /// Writes the prefix of `other` that fits and returns its length.
    pub fn write_slice_truncate(&mut self, other: &[u8]) -> usize {
        let num = cmp::min(self.space_left(), other.len());
        self.0[..num].copy_from_slice(&other[..num]);
        let this = mem::replace(&mut self.0, &mut []);
        self.0 = &mut this[num..];
        num
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.write_slice(&[byte])
    }

    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }

    /// Writes the lower 24 bits of `value` to `self`, using Little Endian byte order.
    ///
    /// This is the on-air representation of CRCs and CRC initialization values.
    pub fn write_u24_le(&mut self, value: u32) -> Result<(), Error> {
        let mut buf = [0; 3];
        LittleEndian::write_u24(&mut buf, value & 0xff_ffff);
        self.write_slice(&buf)
    }

    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }
}

/// Reads values from a borrowed byte slice, front to back.
///
/// Reads past the end fail with `Error::Eof` and leave the reader where it was.
pub struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader(bytes)
    }

    /// Returns the number of unread bytes.
    pub fn bytes_left(&self) -> usize {
        self.0.len()
    }

    /// Returns whether every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes_left() < len {
            Err(Error::Eof)
        } else {
            let slice = &self.0[..len];
            self.0 = &self.0[len..];
            Ok(slice)
        }
    }

    /// Reads a fixed-size array, such as a device address.
    pub fn read_array<S>(&mut self) -> Result<S, Error>
    where
        S: Default + AsMut<[u8]>,
    {
        let mut buf = S::default();
        let slice = buf.as_mut();
        let bytes = self.read_slice(slice.len())?;
        slice.copy_from_slice(bytes);
        Ok(buf)
    }

    /// Takes all unread bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<[u8; 1]>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(LittleEndian::read_u16(self.read_slice(2)?))
    }

    /// Reads a 24-bit CRC or CRC initialization value.
    pub fn read_u24_le(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u24(self.read_slice(3)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.read_slice(4)?))
    }
}

/// A value with a wire encoding.
pub trait ToBytes {
    /// Encodes `self` at the writer's position.
    ///
    /// On `Error::Eof` a prefix of the encoding may already have been written.
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// A value that can be decoded from the wire, possibly borrowing from the input.
pub trait FromBytes<'a>: Sized {
    /// Decodes a value at the reader's position.
    ///
    /// On error, the reader's position is unspecified.
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}
