//! A passive BLE connection sniffer.
//!
//! Ripple observes Bluetooth Low Energy connections between two other devices without ever
//! transmitting. It can either catch a connection as it is being established (by listening for the
//! `CONNECT_REQ` on an advertising channel), or join a connection that is already running by
//! recovering its parameters from the air in *promiscuous* mode.
//!
//! # Architecture
//!
//! Like most BLE stacks, Ripple is split into a timing-critical half and a relaxed half:
//!
//! * The **capture context** ([`Capture`]) runs in the radio and timer interrupt handlers. It
//!   frames bytes coming out of the radio into packets, stamps them with time and channel, and
//!   retunes the radio at connection event boundaries. It never blocks and never waits for the
//!   processing context.
//! * The **processing context** ([`Sniffer`]) runs in the idle loop. It dewhitens and checks
//!   captured packets, drives the parameter recovery pipeline and the link state machine, and
//!   reports everything to a [`Sink`].
//!
//! The two halves only communicate through a [`Handoff`]: a fixed pool of packet buffers handed
//! over via a lock-free single-producer single-consumer queue, plus a single-slot mailbox for
//! schedule changes travelling the other way. The handoff is split once, and each half owns its
//! end, so the platform never has to share the `Capture` or the `Sniffer` between contexts:
//!
//! ```ignore
//! let (capture_end, processing_end) = handoff.split();
//! let capture = Capture::new(engine, capture_end);        // moved into the interrupt handlers
//! let sniffer = Sniffer::new(timer, settings, processing_end);  // stays in the idle loop
//! ```
//!
//! Ripple is runtime and hardware-agnostic. The platform provides a microsecond [`Timer`] and a
//! [`CaptureEngine`] driving the radio.
//!
//! [`Capture`]: capture/struct.Capture.html
//! [`Handoff`]: capture/handoff/struct.Handoff.html
//! [`Sniffer`]: sniffer/struct.Sniffer.html
//! [`Sink`]: control/trait.Sink.html
//! [`Timer`]: time/trait.Timer.html
//! [`CaptureEngine`]: capture/trait.CaptureEngine.html

// We're `#[no_std]`, except when we're testing
#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]
// The claims of this lint are dubious, disable it
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
pub mod capture;
pub mod config;
pub mod control;
pub mod crc;
mod error;
pub mod link;
pub mod phy;
pub mod promisc;
pub mod sniffer;
pub mod time;
pub mod whitening;

#[cfg(test)]
mod sim;

pub use self::error::Error;
pub use self::utils::{Hex, HexSlice};
