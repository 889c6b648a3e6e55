//! Sniffer configuration.

use crate::{
    phy::{AdvertisingChannel, DataChannel},
    time::{Duration, Timer},
};

/// Trait for Ripple platform configurations.
///
/// This trait binds the platform types the processing context runs on. Every application must
/// define a type implementing this trait and supply it to the [`Sniffer`]. The radio driver is not
/// part of it, since only the [`Capture`] context ever touches the radio.
///
/// [`Sniffer`]: ../sniffer/struct.Sniffer.html
/// [`Capture`]: ../capture/struct.Capture.html
pub trait Config {
    /// A timesource with microsecond resolution, sharing its time base with the capture engine's
    /// timestamps.
    type Timer: Timer;
}

/// When CRC verification is switched on automatically.
///
/// With verification enabled, packets failing the CRC check are dropped instead of being reported
/// as unverified.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrcVerifyPolicy {
    /// Only the operator (through `SetCrcVerify`) turns verification on.
    Manual,

    /// Verification is enabled as soon as the CRC initialization value is known.
    OnSeedRecovered,

    /// Verification is enabled when the link reaches `Connected`.
    OnConnected,
}

/// Tunable behavior of the sniffer.
#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Drop a followed connection after this long without a packet (unless its supervision
    /// timeout is shorter).
    pub inactivity_timeout: Duration,

    /// Restart access address discovery when no candidate was promoted for this long.
    pub discovery_timeout: Duration,

    /// Give up on a recovery stage (CRC, interval or increment) after this long without progress.
    pub recovery_timeout: Duration,

    /// Consider the capture pipeline stalled after this long without progress.
    pub stall_timeout: Duration,

    /// A candidate access address is promoted once it was seen more than this many times.
    pub promotion_threshold: u8,

    /// Number of consecutive matching hop interval estimates that freeze the interval.
    pub interval_convergence: u8,

    /// Number of inconclusive hop increment probes before recovery starts over.
    pub probe_attempts: u8,

    pub crc_policy: CrcVerifyPolicy,

    /// Stop after losing the followed connection instead of looking for the next one.
    pub single_target: bool,

    /// Advertising channel on which to wait for `CONNECT_REQ`s.
    pub follow_channel: AdvertisingChannel,

    /// Data channel on which promiscuous mode scans for access addresses.
    pub discovery_channel: DataChannel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(10),
            recovery_timeout: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(1),
            promotion_threshold: 3,
            interval_convergence: 5,
            probe_attempts: 3,
            crc_policy: CrcVerifyPolicy::Manual,
            single_target: false,
            follow_channel: AdvertisingChannel::first(),
            discovery_channel: DataChannel::new(17),
        }
    }
}
