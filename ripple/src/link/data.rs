//! Data channel PDU header.
//!
//! Only the header is decoded here. Payloads are either LL Control PDUs (see `llcp`) or L2CAP
//! fragments, which are forwarded to the host without interpretation.

use crate::{bytes::*, Error};
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

const NESN: u16 = 1 << 2;
const SN: u16 = 1 << 3;
const MD: u16 = 1 << 4;

/// The 2-octet header in front of every data channel payload.
///
/// ```notrust
/// bit  0..2   LLID
/// bit  2      NESN
/// bit  3      SN
/// bit  4      MD
/// bit  5..8   RFU
/// bit  8..16  payload length in octets
/// ```
///
/// Idle connections consist almost entirely of empty PDUs (`LLID = DataCont`, length 0). Without
/// `MD`, such a header can only take four values, which is what makes it possible to recognize
/// connections in a raw bit stream.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

impl Header {
    /// Every empty PDU header with `MD` clear, at index `SN << 1 | NESN`.
    pub const EMPTY_PDU_HEADERS: [Header; 4] = [
        Header::with_sequence(false, false),
        Header::with_sequence(false, true),
        Header::with_sequence(true, false),
        Header::with_sequence(true, true),
    ];

    /// An empty PDU header carrying the given sequence bits.
    pub const fn with_sequence(sn: bool, nesn: bool) -> Self {
        Header(Llid::DataCont as u16 | (sn as u16) << 3 | (nesn as u16) << 2)
    }

    /// A header of the given kind with zero length and all flags clear.
    pub fn new(llid: Llid) -> Self {
        Header(llid as u16)
    }

    /// Decodes the first two bytes of `raw`.
    ///
    /// Panics if `raw` is shorter than that.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(raw))
    }

    pub fn to_u16(&self) -> u16 {
        self.0
    }

    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn set_payload_length(&mut self, len: u8) {
        self.0 = u16::from(len) << 8 | self.0 & 0xff;
    }

    pub fn llid(&self) -> Llid {
        match self.0 & 0b11 {
            0b00 => Llid::Reserved,
            0b01 => Llid::DataCont,
            0b10 => Llid::DataStart,
            _ => Llid::Control,
        }
    }

    pub fn nesn(&self) -> bool {
        self.0 & NESN != 0
    }

    pub fn sn(&self) -> bool {
        self.0 & SN != 0
    }

    /// More Data: the sender has further packets queued for this connection event.
    pub fn md(&self) -> bool {
        self.0 & MD != 0
    }

    pub fn set_md(&mut self, md: bool) {
        if md {
            self.0 |= MD;
        } else {
            self.0 &= !MD;
        }
    }

    /// Whether this is one of [`EMPTY_PDU_HEADERS`](#associatedconstant.EMPTY_PDU_HEADERS).
    pub fn is_empty_pdu(&self) -> bool {
        Self::EMPTY_PDU_HEADERS.contains(self)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} sn={} nesn={} md={} len={}",
            self.llid(),
            u8::from(self.sn()),
            u8::from(self.nesn()),
            u8::from(self.md()),
            self.payload_length(),
        )
    }
}

impl<'a> FromBytes<'a> for Header {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        bytes.read_u16_le().map(Header)
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}

/// Payload kind, from the low two header bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Llid {
    Reserved = 0b00,
    /// L2CAP continuation fragment, or an empty PDU.
    DataCont = 0b01,
    /// First (or only) fragment of an L2CAP message.
    DataStart = 0b10,
    /// LL Control PDU.
    Control = 0b11,
}
