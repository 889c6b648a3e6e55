//! Shared state between the capture and processing contexts.
//!
//! A [`Handoff`] owns everything both contexts touch: the buffer pool, the queue of completed
//! buffers, the one-slot retune mailbox and a few status words. It is split once into a
//! [`CaptureEnd`], moved into the [`Capture`], and a [`ProcessingEnd`], moved into the [`Sniffer`].
//! Each end only holds the halves of the queues it is allowed to use, so neither context ever needs
//! a reference to the other.
//!
//! ```notrust
//!             filled: BufferId ->
//! Capture  ---------------------------->  Sniffer
//!          <----------------------------
//!             mailbox: (Retune, Instant)
//! ```
//!
//! [`Handoff`]: struct.Handoff.html
//! [`CaptureEnd`]: struct.CaptureEnd.html
//! [`ProcessingEnd`]: struct.ProcessingEnd.html
//! [`Capture`]: ../struct.Capture.html
//! [`Sniffer`]: ../../sniffer/struct.Sniffer.html

use crate::{
    capture::{
        buffer::{BufferId, BufferPool, Owner},
        Retune,
    },
    phy::Channel,
    time::{Duration, Instant},
    Error,
};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use heapless::{
    consts::{U1, U4},
    spsc,
};

/// What the capture context last reported about itself.
struct Status {
    /// Whether the capture context is expected to make progress on its own.
    watched: AtomicBool,
    /// Raw instant by which it should have made progress.
    expected: AtomicU32,
    channel: AtomicU8,
}

/// Storage shared by both contexts.
///
/// Must outlive both ends, so it usually lives in a `static` or an RTIC resource.
pub struct Handoff {
    pool: BufferPool,
    filled: spsc::Queue<BufferId, U4>,
    mailbox: spsc::Queue<(Retune, Instant), U1>,
    status: Status,
    cancel: AtomicBool,
}

impl Handoff {
    pub fn new() -> Self {
        Self {
            pool: BufferPool::new(),
            filled: spsc::Queue::new(),
            mailbox: spsc::Queue::new(),
            status: Status {
                watched: AtomicBool::new(false),
                expected: AtomicU32::new(0),
                channel: AtomicU8::new(Channel::ADVERTISING_37.index()),
            },
            cancel: AtomicBool::new(false),
        }
    }

    /// Splits the shared state into the capture context's and the processing context's ends.
    pub fn split(&mut self) -> (CaptureEnd<'_>, ProcessingEnd<'_>) {
        let Handoff {
            pool,
            filled,
            mailbox,
            status,
            cancel,
        } = self;
        let (filled_tx, filled_rx) = filled.split();
        let (mailbox_tx, mailbox_rx) = mailbox.split();
        let (pool, status, cancel) = (&*pool, &*status, &*cancel);

        (
            CaptureEnd {
                pool,
                filled: filled_tx,
                mailbox: mailbox_rx,
                status,
            },
            ProcessingEnd {
                pool,
                filled: filled_rx,
                mailbox: mailbox_tx,
                status,
                cancel,
            },
        )
    }
}

impl Default for Handoff {
    fn default() -> Self {
        Self::new()
    }
}

/// The capture context's end: produces filled buffers, consumes retunes.
pub struct CaptureEnd<'a> {
    pool: &'a BufferPool,
    filled: spsc::Producer<'a, BufferId, U4>,
    mailbox: spsc::Consumer<'a, (Retune, Instant), U1>,
    status: &'a Status,
}

impl<'a> CaptureEnd<'a> {
    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    /// Claims a free buffer to capture into.
    pub fn acquire(&mut self) -> Option<BufferId> {
        self.pool.acquire()
    }

    /// Hands the capturing buffer `id` over to the processing context.
    pub fn hand_off(&mut self, mut id: BufferId) -> Result<(), BufferId> {
        self.pool.queue(&mut id);
        self.filled.enqueue(id)
    }

    /// Returns when the posted retune is due, if there is one.
    pub fn retune_due(&self) -> Option<Instant> {
        self.mailbox.peek().map(|(_, at)| *at)
    }

    /// Takes the posted retune out of the mailbox once it is due at `now`.
    pub fn take_retune(&mut self, now: Instant) -> Option<Retune> {
        match self.retune_due() {
            Some(at) if !at.is_after(now) => self.mailbox.dequeue().map(|(retune, _)| retune),
            _ => None,
        }
    }

    /// Publishes the channel and the instant by which the capture context expects to make
    /// progress (`None` if it may legitimately stay silent).
    pub fn publish(&self, channel: Channel, expected: Option<Instant>) {
        self.status.channel.store(channel.index(), Ordering::Relaxed);
        if let Some(at) = expected {
            self.status
                .expected
                .store(at.raw_micros(), Ordering::Relaxed);
        }
        self.status
            .watched
            .store(expected.is_some(), Ordering::Release);
    }
}

/// The processing context's end: consumes filled buffers, produces retunes.
pub struct ProcessingEnd<'a> {
    pool: &'a BufferPool,
    filled: spsc::Consumer<'a, BufferId, U4>,
    mailbox: spsc::Producer<'a, (Retune, Instant), U1>,
    status: &'a Status,
    cancel: &'a AtomicBool,
}

impl<'a> ProcessingEnd<'a> {
    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    /// Takes the oldest completed buffer off the queue.
    pub fn next_queued(&mut self) -> Option<BufferId> {
        self.filled.dequeue()
    }

    /// Returns a buffer obtained from `next_queued` to the pool.
    pub fn release(&mut self, id: BufferId) {
        debug_assert_eq!(self.pool.owner(&id), Owner::Queued);
        self.pool.release(id);
    }

    /// Posts a schedule change, to be applied by the capture context at `now` or later.
    ///
    /// Returns `Error::Busy` if the previous change has not been picked up yet.
    pub fn post(&mut self, retune: Retune, now: Instant) -> Result<(), Error> {
        self.mailbox.enqueue((retune, now)).map_err(|_| Error::Busy)
    }

    /// Returns whether a posted change is still waiting to be applied.
    pub fn has_pending_retune(&self) -> bool {
        !self.mailbox.ready()
    }

    /// Returns the channel the radio was last tuned to.
    pub fn channel(&self) -> Channel {
        Channel::new(self.status.channel.load(Ordering::Relaxed))
            .unwrap_or(Channel::ADVERTISING_37)
    }

    /// Returns whether the capture context has stopped making progress.
    ///
    /// A raw capture delivers windows continuously, and a followed connection has a deadline at
    /// least once per connection interval. A packet capture parked on a single channel may
    /// legitimately stay silent and is never considered stalled.
    pub fn is_stalled(&self, now: Instant, limit: Duration) -> bool {
        if !self.status.watched.load(Ordering::Acquire) {
            return false;
        }
        let expected = Instant::from_raw_micros(self.status.expected.load(Ordering::Relaxed));
        now.is_after(expected + limit)
    }

    /// Returns a handle other contexts can use to cancel following.
    pub fn cancel_handle(&self) -> CancelHandle<'a> {
        CancelHandle(self.cancel)
    }

    /// Returns and clears a pending cancellation request.
    pub fn take_cancel(&mut self) -> bool {
        let requested = self.cancel.load(Ordering::Acquire);
        if requested {
            self.cancel.store(false, Ordering::Release);
        }
        requested
    }
}

/// Requests that the followed connection is dropped.
///
/// Can be copied into any context, including interrupt handlers. The request is carried out by the
/// next call to `Sniffer::poll`.
#[derive(Copy, Clone)]
pub struct CancelHandle<'a>(&'a AtomicBool);

impl<'a> CancelHandle<'a> {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}
