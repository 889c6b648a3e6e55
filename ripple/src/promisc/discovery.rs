//! Access address discovery in raw bit streams.
//!
//! An idle connection exchanges empty PDUs every connection event. On a given channel, the
//! whitened header of an empty PDU can only take four values, so it can be searched for in the
//! unsynchronized bit stream of a data channel. Whenever one is found, the 32 bits preceding it
//! are a candidate access address.
//!
//! Noise produces spurious candidates, so every candidate is counted in a bounded cache and only
//! promoted once it was seen often enough.

use crate::{
    capture::BUFFER_SIZE,
    link::data::Header,
    phy::{Channel, DataChannel},
    time::{Duration, Instant},
    whitening::{self, Whitening},
};
use byteorder::{ByteOrder, LittleEndian};
use heapless::{consts::U32, Vec};

/// Number of entries in the candidate cache.
pub const CACHE_SIZE: usize = 32;

/// Size of a candidate frame: access address, header, CRC and 2 bytes of slack.
pub const FRAME_LEN: usize = 4 + 2 + 3 + 2;

/// Bits between the start of the access address and the start of the header.
const AA_BITS: usize = 32;

#[derive(Debug, Copy, Clone)]
struct Entry {
    address: u32,
    count: u8,
    /// Insertion sequence number, to break ties between equal counts.
    order: u32,
}

/// Bounded cache counting how often each candidate access address was seen.
///
/// Holds at most one entry per address. When full, a new address replaces the entry with the
/// lowest count (the oldest one among equals).
pub struct CandidateAddressCache {
    entries: Vec<Entry, U32>,
    next_order: u32,
}

impl CandidateAddressCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_order: 0,
        }
    }

    /// Counts a sighting of `address` and returns how often it has been seen.
    pub fn observe(&mut self, address: u32) -> u8 {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.count = entry.count.saturating_add(1);
            return entry.count;
        }

        let entry = Entry {
            address,
            count: 1,
            order: self.next_order,
        };
        self.next_order = self.next_order.wrapping_add(1);

        if let Err(entry) = self.entries.push(entry) {
            if let Some(victim) = self.entries.iter_mut().min_by_key(|e| (e.count, e.order)) {
                trace!(
                    "evicting candidate {:#010x} (seen {}x)",
                    victim.address,
                    victim.count
                );
                *victim = entry;
            }
        }
        1
    }

    /// Returns how often `address` has been seen, or 0 if it is not in the cache.
    pub fn count(&self, address: u32) -> u8 {
        self.entries
            .iter()
            .find(|e| e.address == address)
            .map_or(0, |e| e.count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for CandidateAddressCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A promoted access address, along with the empty PDU that promoted it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub access_address: u32,
    /// Dewhitened header of the empty PDU.
    pub header: Header,
    /// The empty PDU's CRC, as it would trail a protocol-order buffer.
    pub crc: u32,
    /// Approximate start of the access address on air.
    pub timestamp: Instant,
}

impl Candidate {
    /// Returns the empty PDU as a protocol-order packet (header and CRC).
    pub fn packet(&self) -> [u8; 5] {
        let mut packet = [0; 5];
        LittleEndian::write_u16(&mut packet[..2], self.header.to_u16());
        LittleEndian::write_u24(&mut packet[2..], self.crc);
        packet
    }
}

/// Scans raw capture windows of one data channel for access addresses.
pub struct Discovery {
    channel: Channel,
    /// The four whitened empty PDU headers, as 16 received bits (first bit in the MSb).
    patterns: [u16; 4],
    /// Tail of the previous window, so that frames crossing window boundaries are found.
    carry: [u8; FRAME_LEN],
    carry_len: usize,
    cache: CandidateAddressCache,
    threshold: u8,
    started: Option<Instant>,
}

impl Discovery {
    /// Creates a scanner for `channel`, promoting candidates seen more than `threshold` times.
    pub fn new(channel: DataChannel, threshold: u8) -> Self {
        let channel = Channel::from(channel);
        let mut patterns = [0; 4];
        for (pattern, header) in patterns.iter_mut().zip(Header::EMPTY_PDU_HEADERS.iter()) {
            let mut raw = [0; 2];
            LittleEndian::write_u16(&mut raw, header.to_u16());
            whitening::whiten_for_air(&mut raw, channel);
            *pattern = u16::from(raw[0]) << 8 | u16::from(raw[1]);
        }

        Self {
            channel,
            patterns,
            carry: [0; FRAME_LEN],
            carry_len: 0,
            cache: CandidateAddressCache::new(),
            threshold,
            started: None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn cache(&self) -> &CandidateAddressCache {
        &self.cache
    }

    /// Forgets all candidates and restarts the discovery timeout.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.carry_len = 0;
        self.started = None;
    }

    /// Returns whether no candidate has been promoted within `timeout` of the first window.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        match self.started {
            Some(started) => now.is_after(started + timeout),
            None => false,
        }
    }

    /// Scans a raw capture window received at `timestamp`.
    ///
    /// Returns the first candidate promoted by this window.
    pub fn scan(&mut self, window: &[u8], timestamp: Instant) -> Option<Candidate> {
        self.started.get_or_insert(timestamp);

        let mut bits = [0; FRAME_LEN + BUFFER_SIZE];
        let window = &window[..window.len().min(BUFFER_SIZE)];
        let carry_len = self.carry_len;
        bits[..carry_len].copy_from_slice(&self.carry[..carry_len]);
        bits[carry_len..carry_len + window.len()].copy_from_slice(window);
        let bits = &bits[..carry_len + window.len()];

        let total_bits = bits.len() * 8;
        // frames ending in the carried bytes were already counted with the previous window
        let new_bits_from = carry_len * 8;
        let origin = timestamp - Duration::from_micros(new_bits_from as u32);

        let mut promoted = None;
        let mut shift = 0u16;
        for k in 0..total_bits {
            shift = shift << 1 | u16::from(bit(bits, k));
            if k < 15 {
                continue;
            }

            let header_start = k - 15;
            if header_start < AA_BITS || !self.patterns.contains(&shift) {
                continue;
            }

            let frame_start = header_start - AA_BITS;
            let frame_end = frame_start + FRAME_LEN * 8;
            if frame_end > total_bits || frame_end <= new_bits_from {
                continue;
            }

            let candidate = self.decode_frame(bits, frame_start, origin);
            let count = self.cache.observe(candidate.access_address);
            trace!(
                "candidate {:#010x} seen {}x on {:?}",
                candidate.access_address,
                count,
                self.channel
            );
            if count > self.threshold {
                info!(
                    "promoting access address {:#010x} after {} sightings",
                    candidate.access_address, count
                );
                promoted = Some(candidate);
                break;
            }
        }

        let keep = bits.len().min(FRAME_LEN);
        let tail = &bits[bits.len() - keep..];
        self.carry[..keep].copy_from_slice(tail);
        self.carry_len = keep;

        promoted
    }

    fn decode_frame(&self, bits: &[u8], frame_start: usize, origin: Instant) -> Candidate {
        let mut frame = [0; FRAME_LEN];
        for (i, byte) in frame.iter_mut().enumerate() {
            *byte = byte_at(bits, frame_start + i * 8);
        }

        // the access address is not whitened, only reflected
        let mut aa = [0; 4];
        for (dst, src) in aa.iter_mut().zip(&frame[..4]) {
            *dst = src.reverse_bits();
        }

        let pdu = &mut frame[4..];
        Whitening::new(self.channel, 0).apply_received(pdu);

        Candidate {
            access_address: LittleEndian::read_u32(&aa),
            header: Header::parse(&pdu[..2]),
            crc: LittleEndian::read_u24(&pdu[2..5]),
            timestamp: origin + Duration::from_micros(frame_start as u32),
        }
    }
}

/// Returns bit `index` of a raw bit stream (first bit in the MSb of each byte).
fn bit(bytes: &[u8], index: usize) -> u8 {
    (bytes[index / 8] >> (7 - index % 8)) & 1
}

/// Returns the 8 bits starting at bit `index`, packed like the raw stream.
fn byte_at(bytes: &[u8], index: usize) -> u8 {
    (0..8).fold(0, |byte, i| byte << 1 | bit(bytes, index + i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc;

    /// Builds an on-air empty PDU frame (preamble, AA, header, CRC) in raw packing.
    fn air_frame(aa: u32, header: Header, crc_init: u32, channel: Channel) -> Vec<u8, U32> {
        let mut pdu = [0; 5];
        LittleEndian::write_u16(&mut pdu[..2], header.to_u16());
        let crc = crc::forward_crc(crc_init, &pdu[..2]);
        LittleEndian::write_u24(&mut pdu[2..], crc);
        whitening::whiten_for_air(&mut pdu, channel);

        let mut frame = Vec::new();
        frame.push(0x55u8.reverse_bits()).unwrap();
        for byte in &aa.to_le_bytes() {
            frame.push(byte.reverse_bits()).unwrap();
        }
        frame.extend_from_slice(&pdu).unwrap();
        frame
    }

    /// Writes `frame` into `window` starting at bit `offset`.
    fn put_bits(window: &mut [u8], offset: usize, frame: &[u8]) {
        for i in 0..frame.len() * 8 {
            let value = bit(frame, i);
            let pos = offset + i;
            let mask = 0x80 >> (pos % 8);
            if value != 0 {
                window[pos / 8] |= mask;
            } else {
                window[pos / 8] &= !mask;
            }
        }
    }

    #[test]
    fn cache_evicts_lowest_count() {
        let mut cache = CandidateAddressCache::new();
        for address in 0..CACHE_SIZE as u32 {
            cache.observe(address);
            if address != 7 {
                cache.observe(address);
            }
        }
        assert_eq!(cache.len(), CACHE_SIZE);
        assert_eq!(cache.count(7), 1);

        assert_eq!(cache.observe(1000), 1);
        assert_eq!(cache.len(), CACHE_SIZE);
        assert_eq!(cache.count(7), 0);
        assert_eq!(cache.count(1000), 1);
        for address in (0..CACHE_SIZE as u32).filter(|a| *a != 7) {
            assert_eq!(cache.count(address), 2);
        }
    }

    #[test]
    fn cache_breaks_ties_by_age() {
        let mut cache = CandidateAddressCache::new();
        for address in 0..CACHE_SIZE as u32 + 2 {
            cache.observe(address);
        }
        assert_eq!(cache.len(), CACHE_SIZE);
        assert_eq!(cache.count(0), 0);
        // address 32 (count 1, newest) replaced address 0, then 33 replaced 1
        assert_eq!(cache.count(1), 0);
        assert_eq!(cache.count(2), 1);
        assert_eq!(cache.count(33), 1);
    }

    #[test]
    fn finds_unaligned_frames() {
        let channel = DataChannel::new(17);
        let aa = 0x5065_9a3c;
        let frame = air_frame(aa, Header::EMPTY_PDU_HEADERS[2], 0x12_3456, channel.into());

        let mut discovery = Discovery::new(channel, 3);
        let mut promoted = None;
        for (i, offset) in [3usize, 100, 517, 901, 1200].iter().enumerate() {
            let mut window = [0u8; BUFFER_SIZE];
            put_bits(&mut window, *offset, &frame);
            let found = discovery.scan(&window, Instant::from_raw_micros(i as u32 * 10_000));
            if i < 3 {
                assert_eq!(found, None);
                assert_eq!(discovery.cache().count(aa), i as u8 + 1);
            } else {
                promoted = found;
                break;
            }
        }

        let candidate = promoted.expect("promoted on the 4th sighting");
        assert_eq!(candidate.access_address, aa);
        assert_eq!(candidate.header, Header::EMPTY_PDU_HEADERS[2]);
        let seed = crc::reverse_crc(candidate.crc, &candidate.packet()[..2]);
        assert_eq!(seed, 0x12_3456);
        // preamble is one byte before the AA
        assert_eq!(candidate.timestamp, Instant::from_raw_micros(30_000 + 901 + 8));
    }

    #[test]
    fn frame_across_window_boundary_is_counted_once() {
        let channel = DataChannel::new(3);
        let aa = 0x8123_4567;
        let frame = air_frame(aa, Header::EMPTY_PDU_HEADERS[0], 0xabcdef, channel.into());
        let mut discovery = Discovery::new(channel, 3);

        // frame straddles the end of the first window
        let mut stream = [0u8; 2 * BUFFER_SIZE];
        put_bits(&mut stream, BUFFER_SIZE * 8 - 40, &frame);
        discovery.scan(&stream[..BUFFER_SIZE], Instant::from_raw_micros(0));
        assert_eq!(discovery.cache().count(aa), 0);
        discovery.scan(&stream[BUFFER_SIZE..], Instant::from_raw_micros(2_080));
        assert_eq!(discovery.cache().count(aa), 1);

        // a frame fully inside the first window is not counted again with the second
        let mut discovery = Discovery::new(channel, 3);
        let mut stream = [0u8; 2 * BUFFER_SIZE];
        put_bits(&mut stream, BUFFER_SIZE * 8 - 12 * 8, &frame);
        discovery.scan(&stream[..BUFFER_SIZE], Instant::from_raw_micros(0));
        discovery.scan(&stream[BUFFER_SIZE..], Instant::from_raw_micros(2_080));
        assert_eq!(discovery.cache().count(aa), 1);
    }

    #[test]
    fn timeout_and_reset() {
        let mut discovery = Discovery::new(DataChannel::new(17), 3);
        let timeout = Duration::from_secs(10);
        assert!(!discovery.is_timed_out(Instant::from_raw_micros(0), timeout));

        discovery.scan(&[0; 16], Instant::from_raw_micros(1_000));
        assert!(!discovery.is_timed_out(Instant::from_raw_micros(10_001_000), timeout));
        assert!(discovery.is_timed_out(Instant::from_raw_micros(10_001_001), timeout));

        discovery.reset();
        assert!(discovery.cache().is_empty());
        assert!(!discovery.is_timed_out(Instant::from_raw_micros(20_000_000), timeout));
    }
}
