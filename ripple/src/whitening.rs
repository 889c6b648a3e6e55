//! Data whitening.
//!
//! Before transmission, PDU and CRC are XORed with the output of a 7-bit LFSR (`x^7 + x^4 + 1`)
//! seeded from the channel index. The LFSR has a period of 127 bits, so instead of clocking it,
//! the whole period is stored once and every channel starts reading it at its own offset.
//!
//! Whitening is its own inverse, so [`whiten`] and [`dewhiten`] do the same thing. Both work on
//! bytes in protocol order, where bit 0 of each byte is transmitted first.
//!
//! The radio delivers received bits packed the other way around (first bit received in the MSb of
//! each byte). [`dewhiten_received`] reflects every byte while removing the whitening, so its
//! output is in protocol order; [`whiten_for_air`] is its inverse.
//!
//! [`whiten`]: fn.whiten.html
//! [`dewhiten`]: fn.dewhiten.html
//! [`dewhiten_received`]: fn.dewhiten_received.html
//! [`whiten_for_air`]: fn.whiten_for_air.html

use crate::phy::Channel;

/// Length of the whitening sequence in bits.
pub const SEQUENCE_LEN: usize = 127;

/// One full period of the whitening LFSR output, one bit per entry.
const WHITENING: [u8; SEQUENCE_LEN] = [
    1, 1, 1, 1, 0, 1, 0, 1, 0, 1, 0, 0, 0, 0, 1, 0, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 1, 1, 0, 0, 1, 0,
    1, 0, 1, 1, 0, 0, 1, 1, 0, 0, 0, 0, 0, 1, 1, 0, 1, 1, 0, 1, 0, 1, 1, 1, 0, 1, 0, 0, 0, 1, 1, 0,
    0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 1, 0, 0, 1, 0, 0, 1, 1, 0, 1, 0, 0, 1, 1, 1, 1, 0, 1, 1, 1,
    0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 1, 1, 1, 0, 1, 1, 0, 0, 0, 1, 0, 1, 0, 0, 1, 0, 1,
];

/// Offset into `WHITENING` at which each channel index starts.
const WHITENING_INDEX: [u8; 40] = [
    70, 62, 120, 111, 77, 46, 15, 101, 66, 39, 31, 26, 80, 83, 125, 89, 10, 35, 8, 54, 122, 17, 33,
    0, 58, 115, 6, 94, 86, 49, 52, 20, 40, 27, 84, 90, 63, 112, 47, 102,
];

/// A running position in a channel's whitening sequence.
#[derive(Copy, Clone, Debug)]
pub struct Whitening {
    pos: usize,
}

impl Whitening {
    /// Starts `start_index` bits into `channel`'s whitening sequence.
    ///
    /// `start_index` 0 corresponds to the first bit of the PDU header.
    pub fn new(channel: Channel, start_index: usize) -> Self {
        Self {
            pos: (usize::from(WHITENING_INDEX[usize::from(channel.index())]) + start_index)
                % SEQUENCE_LEN,
        }
    }

    /// Returns the next whitening bit and advances the sequence.
    pub fn next_bit(&mut self) -> u8 {
        let bit = WHITENING[self.pos];
        self.pos = (self.pos + 1) % SEQUENCE_LEN;
        bit
    }

    /// Returns the next 8 whitening bits, first bit in the LSb.
    pub fn next_byte(&mut self) -> u8 {
        let mut byte = 0;
        for bit in 0..8 {
            byte |= self.next_bit() << bit;
        }
        byte
    }

    /// Whitens or dewhitens `bytes` in place. Bytes are in protocol order.
    pub fn apply(&mut self, bytes: &mut [u8]) {
        for byte in bytes {
            *byte ^= self.next_byte();
        }
    }

    /// Dewhitens bytes as received from the radio (first bit in the MSb) into protocol order.
    pub fn apply_received(&mut self, raw: &mut [u8]) {
        for byte in raw {
            *byte = byte.reverse_bits() ^ self.next_byte();
        }
    }

    /// Whitens protocol-order bytes into the packing the radio receives them in.
    pub fn apply_for_air(&mut self, bytes: &mut [u8]) {
        for byte in bytes {
            *byte = (*byte ^ self.next_byte()).reverse_bits();
        }
    }
}

/// Returns bit `pos` of `channel`'s whitening sequence.
pub fn whitening_bit(channel: Channel, pos: usize) -> u8 {
    Whitening::new(channel, pos).next_bit()
}

/// Whitens `bytes` (protocol order), starting `start_index` bits into the sequence.
pub fn whiten(bytes: &mut [u8], channel: Channel, start_index: usize) {
    Whitening::new(channel, start_index).apply(bytes);
}

/// Removes whitening from `bytes` (protocol order), starting `start_index` bits into the sequence.
pub fn dewhiten(bytes: &mut [u8], channel: Channel, start_index: usize) {
    Whitening::new(channel, start_index).apply(bytes);
}

/// Dewhitens a PDU as received from the radio, converting it into protocol order.
///
/// `raw` must start with the first byte of the PDU header.
pub fn dewhiten_received(raw: &mut [u8], channel: Channel) {
    Whitening::new(channel, 0).apply_received(raw);
}

/// Whitens a protocol-order PDU (header, payload and CRC) into the form the radio would deliver.
pub fn whiten_for_air(bytes: &mut [u8], channel: Channel) {
    Whitening::new(channel, 0).apply_for_air(bytes);
}

/// Decodes the length field from the second received header byte, before the rest of the packet
/// has arrived.
pub fn dewhiten_length(channel: Channel, raw: u8) -> u8 {
    let mut byte = [raw];
    Whitening::new(channel, 8).apply_received(&mut byte);
    byte[0]
}
