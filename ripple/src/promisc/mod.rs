//! Promiscuous mode: joining a connection that is already running.
//!
//! Following a connection from its `CONNECT_REQ` is easy, since that packet announces every
//! parameter. A connection that was established before the sniffer started listening has to be
//! reverse engineered instead, in this order:
//!
//! 1. [`Discovery`] finds the access address in raw bits captured on one data channel.
//! 2. [`CrcRecoveryState`] recovers the CRC initialization value from an empty PDU.
//! 3. [`HopIntervalRecovery`] estimates the connection interval from packet timestamps.
//! 4. [`HopIncrementRecovery`] measures the hop increment between data channels 0 and 1.
//!
//! The pipeline is driven by the [`Sniffer`], which moves between the stages.
//!
//! [`Discovery`]: discovery/struct.Discovery.html
//! [`CrcRecoveryState`]: recovery/struct.CrcRecoveryState.html
//! [`HopIntervalRecovery`]: recovery/struct.HopIntervalRecovery.html
//! [`HopIncrementRecovery`]: recovery/struct.HopIncrementRecovery.html
//! [`Sniffer`]: ../sniffer/struct.Sniffer.html

pub mod discovery;
pub mod recovery;

pub use self::discovery::{Candidate, CandidateAddressCache, Discovery};
pub use self::recovery::{
    CrcRecoveryState, HopIncrementRecovery, HopIntervalRecovery, ProbeResult,
};
