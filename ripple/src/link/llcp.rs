//! Packet structures of the Link Layer Control Protocol that affect the hopping schedule.
//!
//! A passive observer only has to understand the control PDUs that change *when* or *where* the
//! next connection events happen, plus the one that ends the connection. All other opcodes are
//! passed through as [`ControlPdu::Unknown`].
//!
//! [`ControlPdu::Unknown`]: enum.ControlPdu.html#variant.Unknown

use crate::{
    bytes::*,
    link::channel_map::ChannelMap,
    time::Duration,
    utils::{Hex, HexSlice},
    Error,
};

/// Parameters announced by `LL_CONNECTION_UPDATE_REQ`.
///
/// Fields are kept in their on-air units. The accessors convert to [`Duration`] where that makes
/// sense.
///
/// [`Duration`]: ../../time/struct.Duration.html
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionUpdateData {
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    instant: u16,
}

impl ConnectionUpdateData {
    pub fn new(
        win_size: u8,
        win_offset: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
        instant: u16,
    ) -> Self {
        Self {
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            instant,
        }
    }

    /// Width of the window in which the first event under the new parameters starts.
    pub fn win_size(&self) -> Duration {
        Duration::from_conn_units(self.win_size.into())
    }

    /// Delay of that window, measured from the old-schedule anchor of the event at `instant`.
    pub fn win_offset(&self) -> Duration {
        Duration::from_conn_units(self.win_offset)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_conn_units(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_timeout_units(self.timeout)
    }

    /// Event counter value of the first event that uses the new parameters.
    pub fn instant(&self) -> u16 {
        self.instant
    }
}

/// A decoded LL Control PDU.
#[derive(Debug, Copy, Clone)]
pub enum ControlPdu<'a> {
    /// `LL_CONNECTION_UPDATE_REQ`
    ConnectionUpdateReq(ConnectionUpdateData),

    /// `LL_CHANNEL_MAP_REQ`
    ChannelMapReq { map: ChannelMap, instant: u16 },

    /// `LL_TERMINATE_IND`
    TerminateInd { error_code: Hex<u8> },

    /// Opaque to the sniffer.
    Unknown {
        opcode: ControlOpcode,
        ctr_data: HexSlice<&'a [u8]>,
    },
}

impl ControlPdu<'_> {
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlPdu::ConnectionUpdateReq { .. } => ControlOpcode::ConnectionUpdateReq,
            ControlPdu::ChannelMapReq { .. } => ControlOpcode::ChannelMapReq,
            ControlPdu::TerminateInd { .. } => ControlOpcode::TerminateInd,
            ControlPdu::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Length of the encoded PDU, opcode included.
    ///
    /// Received PDUs whose header length disagrees with this are ignored.
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            ControlPdu::ConnectionUpdateReq(_) => 1 + 2 + 2 + 2 + 2 + 2,
            ControlPdu::ChannelMapReq { .. } => 5 + 2,
            ControlPdu::TerminateInd { .. } => 1,
            ControlPdu::Unknown { ctr_data, .. } => ctr_data.0.len(),
        }
    }
}

impl<'a> FromBytes<'a> for ControlPdu<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let opcode = ControlOpcode::from(bytes.read_u8()?);
        Ok(match opcode {
            ControlOpcode::ConnectionUpdateReq => {
                ControlPdu::ConnectionUpdateReq(ConnectionUpdateData {
                    win_size: bytes.read_u8()?,
                    win_offset: bytes.read_u16_le()?,
                    interval: bytes.read_u16_le()?,
                    latency: bytes.read_u16_le()?,
                    timeout: bytes.read_u16_le()?,
                    instant: bytes.read_u16_le()?,
                })
            }
            ControlOpcode::ChannelMapReq => ControlPdu::ChannelMapReq {
                map: ChannelMap::from_raw(bytes.read_array()?),
                instant: bytes.read_u16_le()?,
            },
            ControlOpcode::TerminateInd => ControlPdu::TerminateInd {
                error_code: Hex(bytes.read_u8()?),
            },
            _ => ControlPdu::Unknown {
                opcode,
                ctr_data: HexSlice(bytes.read_rest()),
            },
        })
    }
}

impl<'a> ToBytes for ControlPdu<'a> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.opcode().into())?;
        match self {
            ControlPdu::ConnectionUpdateReq(data) => {
                writer.write_u8(data.win_size)?;
                writer.write_u16_le(data.win_offset)?;
                writer.write_u16_le(data.interval)?;
                writer.write_u16_le(data.latency)?;
                writer.write_u16_le(data.timeout)?;
                writer.write_u16_le(data.instant)
            }
            ControlPdu::ChannelMapReq { map, instant } => {
                writer.write_slice(&map.to_raw())?;
                writer.write_u16_le(*instant)
            }
            ControlPdu::TerminateInd { error_code } => writer.write_u8(error_code.0),
            ControlPdu::Unknown { ctr_data, .. } => writer.write_slice(ctr_data.0),
        }
    }
}

enum_with_unknown! {
    /// First payload byte of an LL Control PDU.
    ///
    /// Only the opcodes that move or end the hopping schedule are named. Everything else, from
    /// encryption setup to feature exchange, stays `Unknown`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateReq = 0x00,
        ChannelMapReq = 0x01,
        TerminateInd = 0x02,
    }
}
