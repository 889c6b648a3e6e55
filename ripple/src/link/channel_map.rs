//! Data channel maps and channel remapping.

use crate::phy::{DataChannel, NUM_DATA_CHANNELS};
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// Mask covering the 37 data channel bits.
const CHANNEL_BITS: u64 = (1 << NUM_DATA_CHANNELS) - 1;

/// The set of data channels a connection hops over.
///
/// Bit `n` stands for data channel `n`. Unused channels are replaced by used ones while
/// hopping (see [`ChannelMap::remap`]).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    bits: u64,
}

impl ChannelMap {
    /// Decodes the 5-octet `ChM` field of `CONNECT_REQ` and `LL_CHANNEL_MAP_REQ`.
    ///
    /// Bit 0 of octet 0 is channel 0. The top 3 bits of octet 4 are RFU and dropped.
    pub fn from_raw(raw: [u8; 5]) -> Self {
        let bits = u64::from(LittleEndian::read_u32(&raw[..4])) | u64::from(raw[4]) << 32;
        Self {
            bits: bits & CHANNEL_BITS,
        }
    }

    pub fn to_raw(&self) -> [u8; 5] {
        let mut raw = [0; 5];
        LittleEndian::write_u32(&mut raw[..4], self.bits as u32);
        raw[4] = (self.bits >> 32) as u8;
        raw
    }

    /// All 37 data channels.
    pub fn with_all_channels() -> Self {
        Self { bits: CHANNEL_BITS }
    }

    pub fn num_used_channels(&self) -> u8 {
        self.bits.count_ones() as u8
    }

    /// Returns whether the map marks at least one channel as used.
    ///
    /// An empty map cannot be hopped on, so connection parameters carrying one are rejected.
    pub fn is_usable(&self) -> bool {
        self.bits != 0
    }

    pub fn is_used(&self, channel: DataChannel) -> bool {
        self.bits & (1 << channel.index()) != 0
    }

    /// Used channels in ascending order.
    pub fn iter_used<'a>(&'a self) -> impl Iterator<Item = DataChannel> + 'a {
        (0..NUM_DATA_CHANNELS)
            .map(DataChannel::new)
            .filter(move |&channel| self.is_used(channel))
    }

    /// Returns the `n`th channel marked as used, or `None` if fewer channels are in use.
    pub fn by_index(&self, n: u8) -> Option<DataChannel> {
        self.iter_used().nth(n.into())
    }

    /// Maps an unmapped channel produced by the hop sequence to the channel actually used.
    ///
    /// Used channels map to themselves. An unused channel is replaced by the used channel at
    /// position `unmapped % num_used_channels` in ascending order. Returns `None` only when the
    /// map is empty.
    pub fn remap(&self, unmapped: DataChannel) -> Option<DataChannel> {
        if self.is_used(unmapped) {
            Some(unmapped)
        } else if self.is_usable() {
            self.by_index(unmapped.index() % self.num_used_channels())
        } else {
            None
        }
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for channel in (0..NUM_DATA_CHANNELS).map(DataChannel::new) {
            f.write_str(if self.is_used(channel) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} used)", self, self.num_used_channels())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_channel() {
        let map = ChannelMap::from_raw([0x01, 0, 0, 0, 0]);
        assert_eq!(map.num_used_channels(), 1);
        assert!(map.is_used(DataChannel::new(0)));
        assert!(!map.is_used(DataChannel::new(1)));
        assert!(!map.is_used(DataChannel::new(36)));
        assert_eq!(map.by_index(0), Some(DataChannel::new(0)));
        assert_eq!(map.by_index(1), None);
        assert!(map.iter_used().eq(vec![DataChannel::new(0)]));
    }

    #[test]
    fn rfu_bits_ignored() {
        let map = ChannelMap::from_raw([0xff; 5]);
        assert_eq!(map.num_used_channels(), 37);
        assert_eq!(map, ChannelMap::with_all_channels());
        assert_eq!(map.to_raw(), [0xff, 0xff, 0xff, 0xff, 0x1f]);
    }

    #[test]
    fn remapping() {
        // Channels 1, 3 and 36 in use.
        let map = ChannelMap::from_raw([0b0000_1010, 0, 0, 0, 0b1_0000]);
        assert_eq!(map.num_used_channels(), 3);
        assert_eq!(map.remap(DataChannel::new(3)), Some(DataChannel::new(3)));
        // 7 % 3 == 1 -> second used channel
        assert_eq!(map.remap(DataChannel::new(7)), Some(DataChannel::new(3)));
        // 9 % 3 == 0 -> first used channel
        assert_eq!(map.remap(DataChannel::new(9)), Some(DataChannel::new(1)));
        // 35 % 3 == 2 -> third used channel
        assert_eq!(map.remap(DataChannel::new(35)), Some(DataChannel::new(36)));
    }

    #[test]
    fn empty_map() {
        let map = ChannelMap::from_raw([0, 0, 0, 0, 0xe0]);
        assert!(!map.is_usable());
        assert_eq!(map.remap(DataChannel::new(5)), None);
    }

    #[test]
    fn display() {
        let map = ChannelMap::from_raw([0b0000_0101, 0, 0, 0, 0]);
        assert!(map.to_string().starts_with("1010000"));
        assert_eq!(map.to_string().len(), 37);
    }
}
