//! Device address filtering for advertising channel traffic.

use crate::link::{advertising::Pdu, DeviceAddress};
use crate::Error;

/// Number of bits in a device address.
pub const ADDRESS_BITS: u8 = 48;

pub trait AddressFilter {
    fn matches(&self, address: DeviceAddress) -> bool;

    /// Returns whether an advertising channel PDU involves a matching device.
    ///
    /// Only the addresses leading the payload are inspected: the advertiser's address for
    /// advertisements and scan responses, both addresses for directed advertisements, scan
    /// requests and connection requests. PDUs of unknown type never match.
    fn matches_pdu(&self, pdu: &Pdu<'_>) -> bool {
        match pdu.addresses() {
            (Some(first), Some(second)) => self.matches(first) || self.matches(second),
            (Some(first), None) => self.matches(first),
            _ => false,
        }
    }
}

/// Matches device addresses against a target address under a prefix mask.
///
/// The mask covers the `mask_bits` most significant bits of the address as it is usually written
/// (`aa:bb:cc:dd:ee:ff`, with `aa` most significant). A mask of 48 bits matches a single device, a
/// mask of 0 bits matches every device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TargetFilter {
    /// Target address bits under the mask, in over-the-air byte order.
    target: [u8; 6],
    /// Mask, in over-the-air byte order.
    mask: [u8; 6],
}

impl TargetFilter {
    /// Creates a filter for `address` (written order, MSB first) using the `mask_bits` leading bits.
    ///
    /// Returns `Error::InvalidValue` if `mask_bits` exceeds 48.
    pub fn new(address: [u8; 6], mask_bits: u8) -> Result<Self, Error> {
        if mask_bits > ADDRESS_BITS {
            return Err(Error::InvalidValue);
        }

        let mut mask = [0; 6];
        for bit in 0..usize::from(mask_bits) {
            // byte 0 of the written form is the last byte on air
            mask[5 - bit / 8] |= 0x80 >> (bit % 8);
        }

        let mut target = [0; 6];
        for i in 0..6 {
            target[i] = address[5 - i] & mask[i];
        }

        Ok(Self { target, mask })
    }

    /// Returns the number of address bits covered by the mask.
    pub fn mask_bits(&self) -> u8 {
        self.mask.iter().map(|b| b.count_ones() as u8).sum()
    }
}

impl AddressFilter for TargetFilter {
    fn matches(&self, address: DeviceAddress) -> bool {
        address
            .raw()
            .iter()
            .zip(self.mask.iter().zip(self.target.iter()))
            .all(|(addr, (mask, target))| addr & mask == *target)
    }
}
