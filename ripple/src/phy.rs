//! Physical channel arithmetic.
//!
//! BLE transmits on 40 RF channels, 2 MHz apart, starting at 2402 MHz. RF channels 0, 12 and 39 are
//! reserved for advertising, all others carry data. The Link-Layer does not address RF channels
//! directly but uses *channel indices*, which reorder them so that indices 0..=36 refer to data
//! channels and 37..=39 refer to the advertising channels.
//!
//! The capture engine is tuned by frequency, while everything above it (hopping, whitening,
//! reporting) works with channel indices. This module converts between the two.

use crate::Error;
use core::fmt;

/// Number of channel indices (and RF channels).
pub const NUM_CHANNELS: u8 = 40;

/// Number of data channels.
pub const NUM_DATA_CHANNELS: u8 = 37;

/// Lowest channel center frequency in MHz.
const BASE_FREQ: u16 = 2402;

/// Highest channel center frequency in MHz.
const TOP_FREQ: u16 = 2480;

fn rf_channel_freq(rf_channel: u8) -> u16 {
    BASE_FREQ + u16::from(rf_channel) * 2
}

/// Maps a channel index to its RF channel.
fn index_to_rf_channel(index: u8) -> u8 {
    match index {
        37 => 0,
        38 => 12,
        39 => 39,
        0..=10 => index + 1,
        _ => index + 2,
    }
}

/// Returns the center frequency in MHz of the channel with index `index`.
///
/// Returns `Error::OutOfRange` if `index` is not in range `0..=39`.
pub fn index_to_frequency(index: u8) -> Result<u16, Error> {
    if index < NUM_CHANNELS {
        Ok(rf_channel_freq(index_to_rf_channel(index)))
    } else {
        Err(Error::OutOfRange)
    }
}

/// Returns the channel index whose center frequency is `freq` MHz.
///
/// Returns `Error::OutOfRange` if `freq` is not the center frequency of a BLE channel.
pub fn frequency_to_index(freq: u16) -> Result<u8, Error> {
    if freq < BASE_FREQ || freq > TOP_FREQ || freq % 2 != 0 {
        return Err(Error::OutOfRange);
    }

    let rf_channel = ((freq - BASE_FREQ) / 2) as u8;
    Ok(match rf_channel {
        0 => 37,
        12 => 38,
        39 => 39,
        1..=11 => rf_channel - 1,
        _ => rf_channel - 2,
    })
}

/// Returns the three advertising channels in ascending order.
pub fn advertising_triple() -> [AdvertisingChannel; 3] {
    [
        AdvertisingChannel(37),
        AdvertisingChannel(38),
        AdvertisingChannel(39),
    ]
}

/// Whitening LFSR seed: bit 6 set, channel index in bits 0..6.
fn whitening_iv(index: u8) -> u8 {
    debug_assert!(index < NUM_CHANNELS);
    0b0100_0000 | index
}

/// Any of the 40 BLE channels, identified by its channel index.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Channel(u8);

impl Channel {
    /// The first advertising channel (index 37, 2402 MHz).
    pub const ADVERTISING_37: Self = Channel(37);

    /// Creates a `Channel` from a channel index.
    ///
    /// Returns `Error::OutOfRange` if `index` is not in range `0..=39`.
    pub fn new(index: u8) -> Result<Self, Error> {
        if index < NUM_CHANNELS {
            Ok(Channel(index))
        } else {
            Err(Error::OutOfRange)
        }
    }

    /// Creates a `Channel` from its center frequency in MHz.
    pub fn from_freq(freq: u16) -> Result<Self, Error> {
        frequency_to_index(freq).map(Channel)
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// Position in frequency order, `0..=39`.
    pub fn rf_channel(&self) -> u8 {
        index_to_rf_channel(self.0)
    }

    /// Center frequency in MHz.
    pub fn freq(&self) -> u16 {
        rf_channel_freq(self.rf_channel())
    }

    pub fn is_advertising(&self) -> bool {
        self.0 >= NUM_DATA_CHANNELS
    }

    /// Returns the data channel this refers to, or `None` for advertising channels.
    pub fn data_channel(&self) -> Option<DataChannel> {
        if self.is_advertising() {
            None
        } else {
            Some(DataChannel(self.0))
        }
    }

    pub fn whitening_iv(&self) -> u8 {
        whitening_iv(self.0)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{} ({} MHz)", self.0, self.freq())
    }
}

/// Channel index 37, 38 or 39.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdvertisingChannel(u8);

impl AdvertisingChannel {
    pub fn first() -> Self {
        AdvertisingChannel(37)
    }

    /// Creates an `AdvertisingChannel` from a channel index in range `37..=39`.
    pub fn new(index: u8) -> Result<Self, Error> {
        match index {
            37..=39 => Ok(AdvertisingChannel(index)),
            _ => Err(Error::OutOfRange),
        }
    }

    /// Returns the advertising channel centered at `freq` MHz.
    ///
    /// Fails with `Error::OutOfRange` if `freq` is not 2402, 2426 or 2480 MHz.
    pub fn from_freq(freq: u16) -> Result<Self, Error> {
        match frequency_to_index(freq)? {
            index @ 37..=39 => Ok(AdvertisingChannel(index)),
            _ => Err(Error::OutOfRange),
        }
    }

    /// Returns the channel index (`37..=39`).
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Returns the center frequency of this channel in MHz.
    pub fn freq(&self) -> u16 {
        rf_channel_freq(index_to_rf_channel(self.0))
    }
}

/// One of 37 data channels on which data channel PDUs are sent between connected devices.
///
/// (channel indices 0..=36)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataChannel(u8);

impl DataChannel {
    /// Creates a `DataChannel` from a raw index.
    ///
    /// # Panics
    ///
    /// This will panic if `index` is not a valid data channel index. Valid indices are 0..=36.
    pub fn new(index: u8) -> Self {
        assert!(index < NUM_DATA_CHANNELS);
        DataChannel(index)
    }

    /// Returns the data channel index.
    ///
    /// The returned value is always in range 0..=36.
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Returns the data channel `hops` indices after this one, wrapping around after index 36.
    pub fn advance(&self, hops: u8) -> Self {
        DataChannel(((u16::from(self.0) + u16::from(hops)) % u16::from(NUM_DATA_CHANNELS)) as u8)
    }

    /// Returns the center frequency of this channel in MHz.
    pub fn freq(&self) -> u16 {
        rf_channel_freq(index_to_rf_channel(self.0))
    }
}

impl From<DataChannel> for Channel {
    fn from(channel: DataChannel) -> Self {
        Channel(channel.0)
    }
}

impl From<AdvertisingChannel> for Channel {
    fn from(channel: AdvertisingChannel) -> Self {
        Channel(channel.0)
    }
}
