//! The packet buffer pool shared by the capture and processing contexts.
//!
//! The pool is a small arena of fixed-size buffers. Every buffer carries an owner tag, and only the
//! owner may touch it:
//!
//! * `Free` buffers belong to the pool.
//! * The single `Capturing` buffer belongs to the capture context, which fills it byte by byte.
//! * `Queued` buffers have been handed to the processing context through the SPSC queue and stay
//!   its property until released.
//!
//! Access goes through a [`BufferId`]. An id is a move-only token: it is only created when the
//! capture context acquires a free buffer, travels through the queue, and is consumed when the
//! buffer is released. Whoever holds the id is the only one who can reach the buffer.
//!
//! [`BufferId`]: struct.BufferId.html

use crate::{
    link::{hop::EventStamp, CRC_SIZE, MAX_PDU_SIZE},
    phy::Channel,
    time::Instant,
};
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU8, Ordering},
};

/// Number of buffers in the pool.
pub const POOL_SIZE: usize = 4;

/// Capacity of a single buffer: header, maximum payload and CRC.
pub const BUFFER_SIZE: usize = MAX_PDU_SIZE + CRC_SIZE;

/// The current owner of a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Owner {
    Free,
    Capturing,
    Queued,
}

impl Owner {
    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Owner::Free,
            1 => Owner::Capturing,
            _ => Owner::Queued,
        }
    }
}

/// Exclusive access to one buffer of the pool.
///
/// Deliberately neither `Copy` nor `Clone`.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferId(u8);

impl BufferId {
    pub fn index(&self) -> usize {
        self.0.into()
    }
}

/// What a buffer holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    /// A framed packet: whitened PDU header, payload and CRC, as received after Access Address
    /// synchronization.
    Packet,

    /// A window of raw demodulated bits, MSB first, with no synchronization applied.
    Raw,
}

/// RSSI statistics over all samples taken while a buffer was being filled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RssiSummary {
    pub min: i8,
    pub max: i8,
    /// Average of all samples, rounded towards zero.
    pub avg: i8,
    pub count: u8,
}

/// A receive buffer and the metadata attached to it by the capture context.
#[derive(Copy, Clone)]
pub struct PacketBuffer {
    data: [u8; BUFFER_SIZE],
    size: u16,
    /// Bytes received so far.
    pub(crate) pos: u16,

    /// Time at which the packet started (first preamble bit), or the first byte of a raw window.
    pub timestamp: Instant,
    pub channel: Channel,
    pub access_address: u32,
    pub kind: Kind,

    /// Position in the followed connection when the packet was received.
    pub event: EventStamp,

    rssi_min: i8,
    rssi_max: i8,
    rssi_sum: i32,
    rssi_count: u8,
}

impl PacketBuffer {
    const EMPTY: Self = Self {
        data: [0; BUFFER_SIZE],
        size: 0,
        pos: 0,
        timestamp: Instant::ZERO,
        channel: Channel::ADVERTISING_37,
        access_address: 0,
        kind: Kind::Packet,
        event: EventStamp::NONE,
        rssi_min: i8::max_value(),
        rssi_max: i8::min_value(),
        rssi_sum: 0,
        rssi_count: 0,
    };

    /// Returns the number of valid bytes in the buffer.
    pub fn size(&self) -> usize {
        self.size.into()
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size as u16;
    }

    /// Returns the valid bytes in the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size()]
    }

    /// Returns the valid bytes in the buffer for in-place dewhitening.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.size();
        &mut self.data[..size]
    }

    pub(crate) fn storage(&self) -> &[u8; BUFFER_SIZE] {
        &self.data
    }

    /// Returns the whole backing storage.
    pub(crate) fn storage_mut(&mut self) -> &mut [u8; BUFFER_SIZE] {
        &mut self.data
    }

    /// Records an RSSI sample.
    pub fn push_rssi(&mut self, rssi: i8) {
        self.rssi_min = self.rssi_min.min(rssi);
        self.rssi_max = self.rssi_max.max(rssi);
        self.rssi_sum += i32::from(rssi);
        self.rssi_count = self.rssi_count.saturating_add(1);
    }

    /// Returns the RSSI statistics, or `None` if no sample was taken.
    pub fn rssi(&self) -> Option<RssiSummary> {
        if self.rssi_count == 0 {
            return None;
        }

        Some(RssiSummary {
            min: self.rssi_min,
            max: self.rssi_max,
            avg: (self.rssi_sum / i32::from(self.rssi_count)) as i8,
            count: self.rssi_count,
        })
    }

    /// Returns the buffer to its empty state.
    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }
}

struct Slot {
    owner: AtomicU8,
    buffer: UnsafeCell<PacketBuffer>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            owner: AtomicU8::new(Owner::Free as u8),
            buffer: UnsafeCell::new(PacketBuffer::EMPTY),
        }
    }
}

/// Fixed arena of `POOL_SIZE` buffers with owner tags.
///
/// The pool itself is shared by reference between both contexts. Buffer contents are only
/// reachable through a `BufferId`.
pub struct BufferPool {
    slots: [Slot; POOL_SIZE],
}

// SAFETY: a buffer's contents are only accessed through its `BufferId`, of which at most one
// exists per slot. Ids are only minted by `acquire` on a slot tagged `Free`, and only the capture
// context acquires. Tag stores publish the buffer contents to the next owner.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::new(), Slot::new(), Slot::new(), Slot::new()],
        }
    }

    /// Claims a free buffer for the capture context, or returns `None` when the pool is exhausted.
    ///
    /// Must only ever be called from one context.
    pub(crate) fn acquire(&self) -> Option<BufferId> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.owner.load(Ordering::Acquire) == Owner::Free as u8)?;
        self.slots[index]
            .owner
            .store(Owner::Capturing as u8, Ordering::Relaxed);

        let mut id = BufferId(index as u8);
        self.get_mut(&mut id).clear();
        Some(id)
    }

    /// Marks the capturing buffer `id` as handed to the processing context.
    pub(crate) fn queue(&self, id: &mut BufferId) {
        debug_assert_eq!(self.owner(id), Owner::Capturing);
        self.slots[id.index()]
            .owner
            .store(Owner::Queued as u8, Ordering::Release);
    }

    /// Returns buffer `id` to the pool.
    pub fn release(&self, id: BufferId) {
        self.slots[id.index()]
            .owner
            .store(Owner::Free as u8, Ordering::Release);
    }

    pub fn get<'b>(&'b self, id: &'b BufferId) -> &'b PacketBuffer {
        // SAFETY: the caller holds the slot's only id.
        unsafe { &*self.slots[id.index()].buffer.get() }
    }

    pub fn get_mut<'b>(&'b self, id: &'b mut BufferId) -> &'b mut PacketBuffer {
        // SAFETY: the caller holds the slot's only id, mutably borrowed for as long as the
        // returned reference lives.
        unsafe { &mut *self.slots[id.index()].buffer.get() }
    }

    pub fn owner(&self, id: &BufferId) -> Owner {
        Owner::from_tag(self.slots[id.index()].owner.load(Ordering::Acquire))
    }

    /// Returns the number of buffers currently owned by `owner`.
    pub fn count(&self, owner: Owner) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner.load(Ordering::Acquire) == owner as u8)
            .count()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
