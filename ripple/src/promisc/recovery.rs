//! Recovery of the secret connection parameters.
//!
//! Once an access address is known, three more values are needed to follow a connection, none of
//! which is ever sent again after the `CONNECT_REQ`:
//!
//! 1. The CRC initialization value. Running the CRC backwards over any packet yields it, and empty
//!    PDUs are the most common packets.
//! 2. The hop interval. With the radio parked on one data channel, the connection comes by once
//!    every 37 events, so the smallest gap between packets is 37 intervals.
//! 3. The hop increment. Measuring how many events it takes to get from data channel 0 to data
//!    channel 1 gives the number `n` with `n * increment = 1 (mod 37)`.

use crate::{
    crc,
    link::data::Header,
    phy::DataChannel,
    time::{Duration, Instant},
};

/// Modular inverses mod 37: `HOP_INVERSE[n] * n = 1 (mod 37)`.
const HOP_INVERSE: [u8; 37] = [
    0, 1, 19, 25, 28, 15, 31, 16, 14, 33, 26, 27, 34, 20, 8, 5, 7, 24, 35, 2, 13, 30, 32, 29, 17, 3,
    10, 11, 4, 23, 21, 6, 22, 9, 12, 18, 36,
];

/// Smallest valid hop increment.
pub const MIN_HOP_INCREMENT: u8 = 5;

/// Largest valid hop increment.
pub const MAX_HOP_INCREMENT: u8 = 16;

/// Gaps shorter than this are between packets of the same connection event.
const MIN_GAP: Duration = Duration::from_micros(2 * 1_250);

/// Smallest and largest valid connection interval, in 1.25 ms units.
const INTERVAL_RANGE: (u32, u32) = (6, 3200);

/// Returns the hop increment under which channel 1 follows channel 0 after `hops` events.
///
/// Returns `None` if that increment is not a valid one.
pub fn increment_for_hops(hops: u32) -> Option<u8> {
    let increment = HOP_INVERSE[(hops % 37) as usize];
    if (MIN_HOP_INCREMENT..=MAX_HOP_INCREMENT).contains(&increment) {
        Some(increment)
    } else {
        None
    }
}

/// The recovered CRC initialization value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CrcRecoveryState {
    pub seed: u32,
    /// `seed` with its 24 bits reversed.
    pub seed_reversed: u32,
    /// Whether another packet has confirmed the seed.
    pub verified: bool,
}

impl CrcRecoveryState {
    /// Recovers the seed from a protocol-order empty PDU (header and CRC).
    ///
    /// Returns `None` if `packet` is not an empty PDU.
    pub fn from_empty_pdu(packet: &[u8]) -> Option<Self> {
        if packet.len() != 5 || !Header::parse(packet).is_empty_pdu() {
            return None;
        }

        let seed = crc::reverse_crc(crc::trailing_crc(packet)?, &packet[..2]);
        Some(Self {
            seed,
            seed_reversed: crc::reverse_bits24(seed),
            verified: false,
        })
    }

    /// Checks `packet` (protocol order, with CRC) against the seed and marks the seed verified if
    /// it matches.
    pub fn confirm(&mut self, packet: &[u8]) -> bool {
        if crc::check(self.seed, packet) {
            self.verified = true;
        }
        self.verified
    }
}

/// Hop interval estimation from packet timestamps on a single channel.
#[derive(Debug, Clone)]
pub struct HopIntervalRecovery {
    last: Option<Instant>,
    smallest: Option<Duration>,
    estimate: u16,
    consecutive: u8,
    convergence: u8,
}

impl HopIntervalRecovery {
    /// Creates an estimator that freezes after `convergence` consecutive equal estimates.
    pub fn new(convergence: u8) -> Self {
        Self {
            last: None,
            smallest: None,
            estimate: 0,
            consecutive: 0,
            convergence,
        }
    }

    /// Returns the current estimate in 1.25 ms units (0 if none yet).
    pub fn estimate(&self) -> u16 {
        self.estimate
    }

    /// Returns the interval once it is frozen.
    pub fn interval(&self) -> Option<u16> {
        if self.consecutive >= self.convergence {
            Some(self.estimate)
        } else {
            None
        }
    }

    /// Feeds the timestamp of a packet and returns the interval once it is frozen.
    pub fn observe(&mut self, timestamp: Instant) -> Option<u16> {
        if let Some(interval) = self.interval() {
            return Some(interval);
        }

        let last = self.last.replace(timestamp);
        let gap = match last {
            Some(last) => timestamp - last,
            None => return None,
        };
        if gap < MIN_GAP {
            return None;
        }

        let per_cycle = Duration::CONN_UNIT.saturating_mul(37);
        let sample = gap.div_round(per_cycle);
        if sample < INTERVAL_RANGE.0 || sample > INTERVAL_RANGE.1 {
            trace!("ignoring gap {}", gap);
            return None;
        }

        let smallest = match self.smallest {
            Some(smallest) if smallest <= gap => smallest,
            _ => gap,
        };
        self.smallest = Some(smallest);

        let estimate = smallest.div_round(per_cycle) as u16;
        if estimate == self.estimate {
            self.consecutive += 1;
        } else {
            self.estimate = estimate;
            self.consecutive = 1;
        }
        debug!(
            "hop interval estimate {} ({}/{})",
            estimate, self.consecutive, self.convergence
        );

        self.interval()
    }
}

/// Result of feeding the hop increment probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Keep listening where we are.
    Pending,

    /// Retune to this channel and keep probing.
    Retune(DataChannel),

    /// The increment is known. `anchor` is the start of the event on `channel` whose packet
    /// completed the measurement.
    Found {
        increment: u8,
        channel: DataChannel,
        anchor: Instant,
    },

    /// All attempts failed.
    Inconclusive,
}

#[derive(Debug, Copy, Clone)]
enum Probe {
    /// Waiting for the connection on data channel 0.
    First { since: Instant },
    /// Saw it on channel 0 at `first`, waiting for it on channel 1.
    Second { first: Instant, since: Instant },
}

/// Hop increment measurement between data channels 0 and 1.
#[derive(Debug, Clone)]
pub struct HopIncrementRecovery {
    interval: Duration,
    probe: Probe,
    attempts: u8,
    max_attempts: u8,
}

impl HopIncrementRecovery {
    const FIRST: u8 = 0;
    const SECOND: u8 = 1;

    /// Starts probing at `now`. The caller must tune to the channel returned by
    /// [`first_channel`](#method.first_channel).
    pub fn new(interval: Duration, max_attempts: u8, now: Instant) -> Self {
        Self {
            interval,
            probe: Probe::First { since: now },
            attempts: 0,
            max_attempts,
        }
    }

    /// The channel to start probing on.
    pub fn first_channel() -> DataChannel {
        DataChannel::new(Self::FIRST)
    }

    /// Returns the number of failed attempts so far.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// Longest time to wait on a channel: the connection must come by twice in that time.
    fn patience(&self) -> Duration {
        self.interval.saturating_mul(2 * 37)
    }

    /// Feeds a packet of the connection captured on `channel` at `timestamp`.
    pub fn on_packet(&mut self, channel: DataChannel, timestamp: Instant) -> ProbeResult {
        match self.probe {
            Probe::First { .. } if channel.index() == Self::FIRST => {
                self.probe = Probe::Second {
                    first: timestamp,
                    since: timestamp,
                };
                ProbeResult::Retune(DataChannel::new(Self::SECOND))
            }
            Probe::Second { first, .. } if channel.index() == Self::SECOND => {
                let hops = (timestamp - first).div_round(self.interval);
                match increment_for_hops(hops) {
                    Some(increment) => {
                        info!("hop increment {} ({} events from ch0 to ch1)", increment, hops);
                        ProbeResult::Found {
                            increment,
                            channel,
                            anchor: timestamp,
                        }
                    }
                    None => {
                        debug!("no valid increment for {} hops", hops);
                        self.fail(timestamp)
                    }
                }
            }
            _ => ProbeResult::Pending,
        }
    }

    /// Checks whether the current probe has waited too long.
    pub fn check_timeout(&mut self, now: Instant) -> ProbeResult {
        let since = match self.probe {
            Probe::First { since } | Probe::Second { since, .. } => since,
        };
        if now.is_after(since + self.patience()) {
            debug!("hop increment probe timed out");
            self.fail(now)
        } else {
            ProbeResult::Pending
        }
    }

    fn fail(&mut self, now: Instant) -> ProbeResult {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            ProbeResult::Inconclusive
        } else {
            self.probe = Probe::First { since: now };
            ProbeResult::Retune(Self::first_channel())
        }
    }
}
