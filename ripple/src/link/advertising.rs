//! Advertising channel PDUs.
//!
//! The sniffer only ever receives on advertising channels, so everything here is about parsing.
//! What matters most is the `CONNECT_REQ` (see [`ConnectRequestData`]), which carries every
//! parameter needed to follow the connection it creates.
//!
//! Header bits, least significant first: PDU type (4), RFU (2), `TxAdd`, `RxAdd`, length (6),
//! RFU (2).
//!
//! [`ConnectRequestData`]: struct.ConnectRequestData.html

use crate::{
    bytes::*,
    link::{
        channel_map::ChannelMap,
        device_address::{AddressKind, DeviceAddress},
    },
    time::Duration,
    utils::{Hex, HexSlice},
    Error,
};
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// Payload length of a `CONNECT_REQ` PDU.
pub const CONNECT_REQ_PAYLOAD: u8 = 6 + 6 + 22;

/// The 2-octet header of an advertising channel PDU.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u16);

impl Header {
    pub fn new(ty: PduType) -> Self {
        Header(u16::from(u8::from(ty)))
    }

    /// Decodes the first two bytes of `raw`, which must exist.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(raw))
    }

    pub fn to_u16(&self) -> u16 {
        self.0
    }

    pub fn type_(&self) -> PduType {
        PduType::from((self.0 & 0b1111) as u8)
    }

    /// Kind of the first address in the payload.
    pub fn tx_add(&self) -> AddressKind {
        AddressKind::from_bit(self.0 & (1 << 6) != 0)
    }

    pub fn set_tx_add(&mut self, random: bool) {
        self.0 = (self.0 & !(1 << 6)) | (u16::from(random) << 6);
    }

    /// Kind of the second address, for PDU types that carry one.
    pub fn rx_add(&self) -> AddressKind {
        AddressKind::from_bit(self.0 & (1 << 7) != 0)
    }

    /// The whole second header byte, RFU bits included, so that a set RFU bit shows up as an
    /// oversized length.
    pub fn payload_length(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn set_payload_length(&mut self, length: u8) {
        self.0 = (self.0 & 0x00ff) | (u16::from(length) << 8);
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} tx={:?} rx={:?} len={}",
            self.type_(),
            self.tx_add(),
            self.rx_add(),
            self.payload_length(),
        )
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}

enum_with_unknown! {
    /// Low nibble of the advertising header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PduType(u8) {
        AdvInd = 0,
        AdvDirectInd = 1,
        AdvNonconnInd = 2,
        ScanReq = 3,
        ScanRsp = 4,
        /// Sent by an initiator to open a connection. Also known as `CONNECT_IND`.
        ConnectReq = 5,
        AdvScanInd = 6,
    }
}

impl PduType {
    /// Returns how many device addresses lead the payload of this PDU type.
    ///
    /// Advertisements and scan responses carry only the advertiser's address. Directed
    /// advertisements, scan requests and connection requests carry two.
    pub fn address_count(&self) -> u8 {
        match self {
            PduType::AdvInd | PduType::AdvNonconnInd | PduType::AdvScanInd | PduType::ScanRsp => 1,
            PduType::AdvDirectInd | PduType::ScanReq | PduType::ConnectReq => 2,
            PduType::Unknown(_) => 0,
        }
    }
}

/// The `LLData` carried by a `CONNECT_REQ` PDU.
#[derive(Copy, Clone, Debug)]
pub struct ConnectRequestData {
    access_address: Hex<u32>,
    crc_init: Hex<u32>,
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    chm: ChannelMap,
    hop: u8,
    sca: u8,
}

impl ConnectRequestData {
    /// Creates `LLData` from raw field values (in their on-air units).
    pub fn new(
        access_address: u32,
        crc_init: u32,
        win_size: u8,
        win_offset: u16,
        interval: u16,
        timeout: u16,
        chm: ChannelMap,
        hop: u8,
    ) -> Self {
        Self {
            access_address: Hex(access_address),
            crc_init: Hex(crc_init & 0xff_ffff),
            win_size,
            win_offset,
            interval,
            latency: 0,
            timeout,
            chm,
            hop,
            sca: 0,
        }
    }

    /// Returns the Access Address of the new connection.
    pub fn access_address(&self) -> u32 {
        self.access_address.0
    }

    /// Returns the CRC initialization value of the new connection (`CRCInit`).
    pub fn crc_init(&self) -> u32 {
        self.crc_init.0
    }

    /// Returns the size of the transmit window for the first connection event.
    pub fn win_size(&self) -> Duration {
        Duration::from_conn_units(self.win_size.into())
    }

    /// Returns the offset of the transmit window, counted from 1.25 ms after the end of the
    /// `CONNECT_REQ`.
    pub fn win_offset(&self) -> Duration {
        Duration::from_conn_units(self.win_offset)
    }

    /// Returns the connection interval.
    pub fn interval(&self) -> Duration {
        Duration::from_conn_units(self.interval)
    }

    /// Returns the connection interval in 1.25 ms units.
    pub fn interval_units(&self) -> u16 {
        self.interval
    }

    /// Returns the slave latency.
    pub fn latency(&self) -> u16 {
        self.latency
    }

    /// Returns the connection supervision timeout.
    pub fn supervision_timeout(&self) -> Duration {
        Duration::from_timeout_units(self.timeout)
    }

    /// Returns the channel map used by the connection.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.chm
    }

    /// Returns the hop increment (5..=16).
    pub fn hop(&self) -> u8 {
        self.hop
    }

    /// Returns the delay between the end of the `CONNECT_REQ` and the start of the transmit window.
    pub fn transmit_window_delay(&self) -> Duration {
        Duration::CONN_UNIT + self.win_offset()
    }

    /// Checks that the parameters describe a connection that can be followed.
    ///
    /// * Interval between 7.5 ms and 4 s (6..=3200 units).
    /// * Window offset no larger than the interval.
    /// * Window size between 1.25 ms and `min(10 ms, interval - 1.25 ms)`.
    /// * Supervision timeout between 100 ms and 32 s.
    /// * At least one data channel in use.
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval < 6 || self.interval > 3200 {
            return Err(Error::InvalidValue);
        }
        if self.win_offset > self.interval {
            return Err(Error::InvalidValue);
        }
        let max_win_size = core::cmp::min(8, self.interval - 1);
        if self.win_size < 1 || u16::from(self.win_size) > max_win_size {
            return Err(Error::InvalidValue);
        }
        if self.timeout < 10 || self.timeout > 3200 {
            return Err(Error::InvalidValue);
        }
        if !self.chm.is_usable() {
            return Err(Error::InvalidValue);
        }
        Ok(())
    }
}

impl<'a> FromBytes<'a> for ConnectRequestData {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let access_address = Hex(bytes.read_u32_le()?);
        let crc_init = Hex(bytes.read_u24_le()?);
        let win_size = bytes.read_u8()?;
        let win_offset = bytes.read_u16_le()?;
        let interval = bytes.read_u16_le()?;
        let latency = bytes.read_u16_le()?;
        let timeout = bytes.read_u16_le()?;
        let chm = ChannelMap::from_raw(bytes.read_array()?);
        let hop_sca = bytes.read_u8()?;
        Ok(Self {
            access_address,
            crc_init,
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            chm,
            hop: hop_sca & 0b11111,
            sca: hop_sca >> 5,
        })
    }
}

impl ToBytes for ConnectRequestData {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.access_address.0)?;
        writer.write_u24_le(self.crc_init.0)?;
        writer.write_u8(self.win_size)?;
        writer.write_u16_le(self.win_offset)?;
        writer.write_u16_le(self.interval)?;
        writer.write_u16_le(self.latency)?;
        writer.write_u16_le(self.timeout)?;
        writer.write_slice(&self.chm.to_raw())?;
        writer.write_u8((self.sca << 5) | (self.hop & 0b11111))
    }
}

/// A parsed advertising channel PDU.
#[derive(Debug, Copy, Clone)]
pub enum Pdu<'a> {
    /// An advertisement or scan response, carrying the advertiser's address and AD structures.
    Advertisement {
        ty: PduType,
        advertiser: DeviceAddress,
        data: HexSlice<&'a [u8]>,
    },

    /// A directed advertisement or a scan request: a sender and an intended receiver.
    Addressed {
        ty: PduType,
        sender: DeviceAddress,
        receiver: DeviceAddress,
    },

    /// Connection request (`CONNECT_REQ`).
    ConnectRequest {
        initiator: DeviceAddress,
        advertiser: DeviceAddress,
        lldata: ConnectRequestData,
    },

    /// A PDU of unknown type.
    Unknown {
        ty: PduType,
        payload: HexSlice<&'a [u8]>,
    },
}

impl<'a> Pdu<'a> {
    /// Parses a PDU from a `Header` and raw payload.
    ///
    /// `payload` must be exactly as long as the header's length field says.
    pub fn from_header_and_payload(header: Header, payload: &'a [u8]) -> Result<Self, Error> {
        if payload.len() != usize::from(header.payload_length()) {
            return Err(Error::InvalidLength);
        }

        let mut bytes = ByteReader::new(payload);
        let ty = header.type_();
        let pdu = match ty {
            PduType::ConnectReq => {
                if header.payload_length() != CONNECT_REQ_PAYLOAD {
                    return Err(Error::InvalidLength);
                }
                Pdu::ConnectRequest {
                    initiator: read_address(&mut bytes, header.tx_add())?,
                    advertiser: read_address(&mut bytes, header.rx_add())?,
                    lldata: ConnectRequestData::from_bytes(&mut bytes)?,
                }
            }
            PduType::AdvDirectInd | PduType::ScanReq => Pdu::Addressed {
                ty,
                sender: read_address(&mut bytes, header.tx_add())?,
                receiver: read_address(&mut bytes, header.rx_add())?,
            },
            PduType::AdvInd | PduType::AdvNonconnInd | PduType::AdvScanInd | PduType::ScanRsp => {
                Pdu::Advertisement {
                    ty,
                    advertiser: read_address(&mut bytes, header.tx_add())?,
                    data: HexSlice(bytes.read_rest()),
                }
            }
            PduType::Unknown(_) => Pdu::Unknown {
                ty,
                payload: HexSlice(bytes.read_rest()),
            },
        };

        if bytes.is_empty() {
            Ok(pdu)
        } else {
            Err(Error::IncompleteParse)
        }
    }

    pub fn ty(&self) -> PduType {
        match self {
            Pdu::Advertisement { ty, .. } | Pdu::Addressed { ty, .. } | Pdu::Unknown { ty, .. } => {
                *ty
            }
            Pdu::ConnectRequest { .. } => PduType::ConnectReq,
        }
    }

    /// Returns the device addresses carried by this PDU, in payload order.
    pub fn addresses(&self) -> (Option<DeviceAddress>, Option<DeviceAddress>) {
        match self {
            Pdu::Advertisement { advertiser, .. } => (Some(*advertiser), None),
            Pdu::Addressed {
                sender, receiver, ..
            } => (Some(*sender), Some(*receiver)),
            Pdu::ConnectRequest {
                initiator,
                advertiser,
                ..
            } => (Some(*initiator), Some(*advertiser)),
            Pdu::Unknown { .. } => (None, None),
        }
    }
}

fn read_address(bytes: &mut ByteReader<'_>, kind: AddressKind) -> Result<DeviceAddress, Error> {
    Ok(DeviceAddress::new(bytes.read_array()?, kind))
}
