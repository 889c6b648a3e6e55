//! Link Layer, seen from the outside.
//!
//! PDU formats the sniffer decodes, plus the machinery that tracks a connection it is not part
//! of: the hopping schedule and the passive link state machine.
//!
//! # On-air framing
//!
//! ```notrust
//! preamble   access address   header   payload       CRC
//! 1 octet    4 octets         2        0..=255       3 octets
//!                             |<---- CRC input ---->|
//!                             |<-------- whitened -------->|
//! ```
//!
//! Fields go out least significant bit first.
//!
//! The radio synchronizes on the Access Address, so every buffer handed to the sniffer starts with
//! the first (still whitened) byte of the PDU header. The header's length field is the only thing
//! needed to find the end of the packet, which is why it is decoded as soon as the second byte
//! arrives.
//!
//! Advertising channel PDUs always use [`ADVERTISING_ADDRESS`] and the CRC preset [`CRC_PRESET`].
//! Data channel PDUs use the Access Address and CRC initialization value chosen by the initiator in
//! its `CONNECT_REQ`.
//!
//! [`ADVERTISING_ADDRESS`]: constant.ADVERTISING_ADDRESS.html
//! [`CRC_PRESET`]: constant.CRC_PRESET.html

pub mod advertising;
pub mod channel_map;
pub mod connection;
pub mod data;
mod device_address;
pub mod filter;
pub mod hop;
pub mod llcp;

pub use self::device_address::*;

/// CRC seed of every advertising channel packet.
pub const CRC_PRESET: u32 = 0x55_5555;

/// Access Address shared by all advertising channel packets.
pub const ADVERTISING_ADDRESS: u32 = 0x8e89_bed6;

/// Maximum payload length of an advertising channel PDU.
pub const MAX_ADVERTISING_PAYLOAD: u8 = 37;

/// Maximum payload length of a data channel PDU (payload plus MIC).
pub const MAX_DATA_PAYLOAD: u8 = 251;

/// Size of the 16-bit PDU header.
pub const HEADER_SIZE: usize = 2;

/// Size of the CRC trailing every PDU.
pub const CRC_SIZE: usize = 3;

/// Maximum size of a PDU including its header, but without CRC.
pub const MAX_PDU_SIZE: usize = HEADER_SIZE + 255;

/// Time between the start of a packet and the first header bit (preamble and Access Address).
pub const PACKET_LEAD_MICROS: u32 = (1 + 4) * 8;

/// Returns the on-air duration in microseconds of a packet whose PDU and CRC span `size` bytes.
pub fn packet_duration_micros(size: usize) -> u32 {
    PACKET_LEAD_MICROS + size as u32 * 8
}

/// Returns whether `length` is an acceptable payload length on the given kind of channel.
pub fn is_valid_payload_length(advertising: bool, length: u8) -> bool {
    if advertising {
        length <= MAX_ADVERTISING_PAYLOAD
    } else {
        length <= MAX_DATA_PAYLOAD
    }
}

/// State of the passive link state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Not capturing anything.
    Inactive,

    /// Waiting for a connection to show up: parked on an advertising channel for `CONNECT_REQ`, or
    /// looking for an already running connection in promiscuous mode.
    Listening,

    /// A `CONNECT_REQ` was seen, but no packet of the new connection yet.
    ConnPending,

    /// Following an established connection.
    Connected,
}
