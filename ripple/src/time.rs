//! Microsecond timestamps and durations.
//!
//! Capture timestamps, connection event anchors and every timeout in the crate use these two
//! types. Both are 32-bit microsecond counters. An [`Instant`] wraps after roughly 71 minutes,
//! so comparisons between instants are only meaningful when they are close together.
//!
//! [`Instant`]: struct.Instant.html

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

const MICROS_PER_CONN_UNIT: u32 = 1_250;
const MICROS_PER_TIMEOUT_UNIT: u32 = 10_000;
const HALF_RANGE: u32 = 1 << 31;

/// A non-negative span of time in microseconds.
///
/// Overflowing addition and underflowing subtraction panic.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u32);

impl Duration {
    /// Inter frame space between a packet and its response.
    pub const T_IFS: Self = Duration(150);

    /// Unit of connection intervals and transmit windows.
    pub const CONN_UNIT: Self = Duration(MICROS_PER_CONN_UNIT);

    pub const fn from_micros(micros: u32) -> Self {
        Duration(micros)
    }

    pub fn from_millis(millis: u16) -> Self {
        Duration(u32::from(millis) * 1_000)
    }

    pub fn from_secs(secs: u16) -> Self {
        Duration(u32::from(secs) * 1_000_000)
    }

    /// `units` × 1.25 ms.
    pub fn from_conn_units(units: u16) -> Self {
        Duration(u32::from(units) * MICROS_PER_CONN_UNIT)
    }

    /// `units` × 10 ms, the unit of supervision timeouts.
    pub fn from_timeout_units(units: u16) -> Self {
        Duration(u32::from(units) * MICROS_PER_TIMEOUT_UNIT)
    }

    pub fn as_micros(&self) -> u32 {
        self.0
    }

    /// Number of `unit`s in `self`, rounded to nearest. A zero `unit` yields 0.
    pub fn div_round(&self, unit: Duration) -> u32 {
        match unit.0 {
            0 => 0,
            u => (self.0 + u / 2) / u,
        }
    }

    pub fn saturating_mul(&self, factor: u32) -> Self {
        Duration(self.0.saturating_mul(factor))
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.0
            .checked_add(rhs.0)
            .map(Duration)
            .unwrap_or_else(|| panic!("{} + {} overflows", self, rhs))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.0
            .checked_sub(rhs.0)
            .map(Duration)
            .unwrap_or_else(|| panic!("{} - {} underflows", self, rhs))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let micros = self.0;
        match (micros / 1_000_000, micros / 1_000) {
            (0, 0) => write!(f, "{}µs", micros),
            (0, ms) if micros % 1_000 == 0 => write!(f, "{}ms", ms),
            (0, ms) => write!(f, "{}.{:03}ms", ms, micros % 1_000),
            (s, _) if micros % 1_000_000 == 0 => write!(f, "{}s", s),
            (s, _) => write!(f, "{}.{:06}s", s, micros % 1_000_000),
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A timestamp on the capture clock.
///
/// The epoch is whatever the platform's counter started at. Timestamps attached to captured
/// packets and the values returned by [`Timer::now`] must come from the same counter.
///
/// [`Timer::now`]: trait.Timer.html#tymethod.now
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    pub const ZERO: Self = Instant(0);

    /// Wraps a raw counter value. Meant for [`Timer`] and capture engine implementations.
    ///
    /// [`Timer`]: trait.Timer.html
    pub fn from_raw_micros(micros: u32) -> Self {
        Instant(micros)
    }

    pub fn raw_micros(&self) -> u32 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, modulo the counter width.
    ///
    /// If `earlier` is actually later, the result is a huge duration. Debug builds assert that it
    /// is not.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        let elapsed = self.0.wrapping_sub(earlier.0);
        debug_assert!(elapsed < HALF_RANGE, "{} is before {}", self, earlier);
        Duration(elapsed)
    }

    /// Strictly later than `other`, across wraparound.
    pub fn is_after(&self, other: Instant) -> bool {
        let diff = self.0.wrapping_sub(other.0);
        diff != 0 && diff < HALF_RANGE
    }

    /// Within `epsilon` of `other` in either direction.
    pub fn is_near(&self, other: Instant, epsilon: Duration) -> bool {
        self.0.wrapping_sub(other.0).wrapping_add(epsilon.0) <= 2 * epsilon.0
    }

    pub fn min(self, other: Instant) -> Instant {
        if self.is_after(other) {
            other
        } else {
            self
        }
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, earlier: Self) -> Duration {
        self.duration_since(earlier)
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.0))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        self.0 = self.0.wrapping_add(d.0);
    }
}

impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.0))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", Duration(self.0))
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Source of the current time on the capture clock.
///
/// Implemented by the platform's free-running microsecond counter, and by a simulated clock in
/// tests.
pub trait Timer {
    /// Must be monotonic apart from counter wraparound.
    fn now(&self) -> Instant;
}
