//! The BLE CRC-24 and its inversion.
//!
//! The CRC is computed by a 24-bit LFSR with polynomial `x^24 + x^10 + x^9 + x^6 + x^4 + x^3 + x
//! + 1`, fed with the PDU bits in transmission order. Because the register update is a bijection,
//! it can also be run backwards: given a packet and its CRC, [`reverse_crc`] recovers the initial
//! value the sender's LFSR was loaded with. This is how the CRC initialization value of an
//! already running connection is obtained from a single captured packet.
//!
//! Seeds passed to and returned from this module are in the natural order in which they appear in
//! `CONNECT_REQ` (`CRCInit`). CRC values are returned such that their little-endian bytes equal the
//! three CRC bytes following the PDU in a dewhitened, protocol-order packet buffer.
//!
//! [`reverse_crc`]: fn.reverse_crc.html

use byteorder::{ByteOrder, LittleEndian};

/// Feedback taps of the forward register, after the shift.
const FORWARD_TAPS: u32 = 0xda_6000;

/// Feedback taps of the reversed register.
const REVERSE_TAPS: u32 = 0xb4_c000;

const MASK_24: u32 = 0xff_ffff;

/// Byte-wise lookup table for [`forward_crc_lut`].
///
/// Entry `k` is the register state reached from state `k` after shifting in 8 zero bits.
static LUT: [u32; 256] = build_lut();

const fn build_lut() -> [u32; 256] {
    let mut table = [0; 256];
    let mut k = 0;
    while k < 256 {
        let mut state = k as u32;
        let mut bit = 0;
        while bit < 8 {
            let feedback = state & 1;
            state >>= 1;
            if feedback != 0 {
                state ^= FORWARD_TAPS;
            }
            bit += 1;
        }
        table[k] = state;
        k += 1;
    }
    table
}

/// Reverses the order of the lower 24 bits of `value`.
pub fn reverse_bits24(value: u32) -> u32 {
    (value & MASK_24).reverse_bits() >> 8
}

/// Computes the CRC of `data`, starting from the initialization value `seed`.
///
/// This processes one bit at a time. See [`forward_crc_lut`] for a faster version.
pub fn forward_crc(seed: u32, data: &[u8]) -> u32 {
    let mut state = reverse_bits24(seed);
    for byte in data {
        for i in 0..8 {
            let feedback = (state ^ u32::from(byte >> i)) & 1;
            state >>= 1;
            if feedback != 0 {
                state ^= FORWARD_TAPS;
            }
        }
    }
    state
}

/// Computes the CRC of `data` using a byte-wise lookup table.
///
/// Produces the same result as [`forward_crc`].
pub fn forward_crc_lut(seed: u32, data: &[u8]) -> u32 {
    let mut state = reverse_bits24(seed);
    for byte in data {
        state = (state >> 8) ^ LUT[((u32::from(*byte) ^ state) & 0xff) as usize];
    }
    state
}

/// Runs the CRC register backwards over `data`, starting from its final value `crc`.
///
/// Returns the initialization value that produces `crc` when [`forward_crc`] is run over `data`.
pub fn reverse_crc(crc: u32, data: &[u8]) -> u32 {
    let mut state = crc & MASK_24;
    for byte in data.iter().rev() {
        for j in 0..8 {
            let bit = u32::from(byte >> (7 - j)) & 1;
            let top = state >> 23;
            state = ((state << 1) & MASK_24) | (top ^ bit);
            if top != 0 {
                state ^= REVERSE_TAPS;
            }
        }
    }
    reverse_bits24(state)
}

/// Reads the CRC trailing a protocol-order PDU.
///
/// Returns `None` if `packet` is shorter than a header plus CRC.
pub fn trailing_crc(packet: &[u8]) -> Option<u32> {
    if packet.len() < 2 + 3 {
        None
    } else {
        Some(LittleEndian::read_u24(&packet[packet.len() - 3..]))
    }
}

/// Checks the CRC of a protocol-order packet (header, payload and 3 CRC bytes) against `seed`.
pub fn check(seed: u32, packet: &[u8]) -> bool {
    match trailing_crc(packet) {
        Some(crc) => forward_crc_lut(seed, &packet[..packet.len() - 3]) == crc,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(forward_crc(0x55_5555, b"123456789"), 0xc2_5a56);
        assert_eq!(forward_crc_lut(0x55_5555, b"123456789"), 0xc2_5a56);
    }

    #[test]
    fn lut_entries() {
        assert_eq!(LUT[0], 0);
        assert_eq!(LUT[1], 0x01_b4c0);
        assert_eq!(LUT[2], 0x03_6980);
        assert_eq!(LUT[3], 0x02_dd40);
        assert_eq!(LUT[255], 0x93_2c40);
    }

    #[test]
    fn empty_pdu_seed_recovery() {
        let header = [0x01, 0x00];
        let crc = forward_crc(0x12_3456, &header);
        assert_eq!(crc, 0x8a_dc48);
        assert_eq!(reverse_crc(crc, &header), 0x12_3456);
    }

    #[test]
    fn reverse_inverts_forward() {
        let mut state = 0x2545_f491u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        for len in 0..=255 {
            let seed = next() & MASK_24;
            let data: Vec<u8> = (0..len).map(|_| next() as u8).collect();
            let crc = forward_crc(seed, &data);
            assert_eq!(forward_crc_lut(seed, &data), crc);
            assert_eq!(reverse_crc(crc, &data), seed, "len {}", len);
        }
    }

    #[test]
    fn packet_check() {
        let mut packet = [0x01, 0x00, 0, 0, 0];
        let crc = forward_crc(0xab_cdef, &packet[..2]);
        LittleEndian::write_u24(&mut packet[2..], crc);
        assert!(check(0xab_cdef, &packet));
        assert!(!check(0x55_5555, &packet));
        packet[0] ^= 0x04;
        assert!(!check(0xab_cdef, &packet));
        assert!(!check(0xab_cdef, &[0x01]));
    }

    #[test]
    fn bit_reversal() {
        assert_eq!(reverse_bits24(0x00_0001), 0x80_0000);
        assert_eq!(reverse_bits24(0x12_3456), 0x6a_2c48);
        assert_eq!(reverse_bits24(reverse_bits24(0xab_cdef)), 0xab_cdef);
    }
}
