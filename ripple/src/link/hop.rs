//! Connection event timing and channel selection.
//!
//! A [`HopSchedule`] predicts where (on which data channel) and when the next connection event of a
//! followed connection takes place. It is owned by the capture context, which calls
//! [`HopSchedule::open_event`] shortly before each predicted event and [`HopSchedule::close_event`]
//! once the event is over, feeding back what was actually observed.
//!
//! Channel selection follows the Link-Layer's channel selection algorithm #1: the unmapped channel
//! advances by the hop increment modulo 37 every event, and unused channels are remapped through
//! the channel map.
//!
//! A schedule built from recovered parameters does not know the connection's event counter, so it
//! cannot tell when an update's instant comes around. Channel map updates are then applied at the
//! earliest instant the master may have picked. Connection updates that move the anchor are
//! *located* instead: starting at that earliest instant, every event listens both where the old
//! parameters and where the new ones put the first packet, until a packet shows which one is in
//! effect. That also pins down the event counter.
//!
//! [`HopSchedule`]: struct.HopSchedule.html
//! [`HopSchedule::open_event`]: struct.HopSchedule.html#method.open_event
//! [`HopSchedule::close_event`]: struct.HopSchedule.html#method.close_event

use crate::{
    link::{advertising::ConnectRequestData, channel_map::ChannelMap, llcp::ConnectionUpdateData},
    phy::DataChannel,
    time::{Duration, Instant},
    utils::Hex,
};
use core::num::Wrapping;

/// How far a single observed packet may stray from the predicted anchor and still be trusted as
/// the new anchor.
pub const ANCHOR_TOLERANCE: Duration = Duration::from_micros(3);

/// Minimum number of events between an LLCP PDU and its instant.
pub const MIN_INSTANT_LEAD: u16 = 6;

/// Silent events after which locating a connection update's instant is given up.
const LOCATE_MISS_LIMIT: u8 = 4;

/// Where in a followed connection a packet was captured.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventStamp {
    /// Event counter of the capture context's schedule.
    pub counter: u16,

    /// Whether `counter` is the connection's own event counter.
    pub synced: bool,

    /// Connection updates the schedule had applied, modulo 256.
    pub connection_updates: u8,

    /// Channel map updates the schedule had applied, modulo 256.
    pub map_updates: u8,
}

impl EventStamp {
    /// Stamp of packets captured while not following a connection.
    pub const NONE: Self = Self {
        counter: 0,
        synced: false,
        connection_updates: 0,
        map_updates: 0,
    };
}

/// A parameter change that takes effect at a connection event instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LlcpUpdate {
    /// New interval, supervision timeout and transmit window (`LL_CONNECTION_UPDATE_REQ`).
    Connection(ConnectionUpdateData),

    /// New channel map (`LL_CHANNEL_MAP_REQ`).
    ChannelMap { map: ChannelMap, instant: u16 },
}

impl LlcpUpdate {
    /// Returns the connection event counter value at which the update takes effect.
    pub fn instant(&self) -> u16 {
        match self {
            LlcpUpdate::Connection(data) => data.instant(),
            LlcpUpdate::ChannelMap { instant, .. } => *instant,
        }
    }
}

/// Returns whether `counter` has reached `instant`, modulo 65536.
pub fn instant_reached(counter: u16, instant: u16) -> bool {
    counter.wrapping_sub(instant) < 0x8000
}

/// What to do when a connection event is due.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventStart {
    /// A connection update with a window offset takes effect at this event. Call `open_event`
    /// again when the transmit window is about to open at the given time.
    Defer(Instant),

    /// Listen on `channel`. The first packet of the event is expected to start at `start`, or
    /// anywhere within `window` after it.
    Open {
        channel: DataChannel,
        start: Instant,
        window: Duration,
    },
}

/// Where the first packet of an event is expected while a connection update is being located.
#[derive(Debug, Copy, Clone)]
struct Candidates {
    /// Anchor if the instant is still ahead.
    old: Instant,
    /// Transmit window if the instant is this event.
    window_start: Instant,
    window_end: Instant,
    /// Anchor if the instant was the previous event.
    late: Option<Instant>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Located {
    NotYet,
    /// The old parameters and the update put the packet at the same time.
    NotYetOrNow,
    Now,
    Previous,
}

#[derive(Debug, Copy, Clone, Default)]
struct Locating {
    open: Option<Candidates>,
    /// Anchor of the previous event, if it could not tell the instant apart from the event before.
    ambiguous_anchor: Option<Instant>,
    misses: u8,
}

impl Candidates {
    fn locate(&self, observed: Instant) -> Located {
        let in_window = distance_to_window(observed, self.window_start, self.window_end);
        let mut best = if self.window_start == self.old {
            (Located::NotYetOrNow, in_window)
        } else {
            let not_yet = distance(observed, self.old);
            if not_yet <= in_window {
                (Located::NotYet, not_yet)
            } else {
                (Located::Now, in_window)
            }
        };

        if let Some(late) = self.late {
            let previous = distance(observed, late);
            if previous < best.1 {
                best = (Located::Previous, previous);
            }
        }
        best.0
    }
}

fn distance(a: Instant, b: Instant) -> Duration {
    if a.is_after(b) {
        a - b
    } else {
        b - a
    }
}

fn distance_to_window(t: Instant, start: Instant, end: Instant) -> Duration {
    if start.is_after(t) {
        start - t
    } else if t.is_after(end) {
        t - end
    } else {
        Duration::from_micros(0)
    }
}

fn later(a: Instant, b: Instant) -> Instant {
    if a.is_after(b) {
        a
    } else {
        b
    }
}

/// The hop clock of a followed connection.
#[derive(Debug, Clone)]
pub struct HopSchedule {
    access_address: Hex<u32>,
    crc_init: Hex<u32>,
    channel_map: ChannelMap,

    /// Number of (unmapped) channels to hop between each connection event.
    hop: u8,

    /// Unmapped channel of the current event (`lastUnmappedChannel`).
    unmapped: DataChannel,

    /// Mapped channel of the current event.
    channel: DataChannel,

    interval: Duration,
    supervision_timeout: Duration,

    /// Predicted start of the next connection event (or of its transmit window).
    next_start: Instant,

    /// Width of the transmit window in which the next event's first packet may start.
    window: Duration,

    /// Counter of the next connection event to be opened.
    event_counter: Wrapping<u16>,

    /// Whether `event_counter` matches the connection's own counter.
    counter_synced: bool,

    /// Whether the pending connection update already deferred the current event to its window.
    deferred: bool,

    conn_update: Option<ConnectionUpdateData>,
    map_update: Option<(ChannelMap, u16)>,

    /// Set while the instant of `conn_update` is unknown.
    locating: Option<Locating>,

    connection_updates: Wrapping<u8>,
    map_updates: Wrapping<u8>,
}

impl HopSchedule {
    /// Creates the schedule of a connection announced by a `CONNECT_REQ`.
    ///
    /// `request_end` is the time at which the `CONNECT_REQ` packet ended.
    pub fn from_connect_request(lldata: &ConnectRequestData, request_end: Instant) -> Self {
        Self {
            access_address: Hex(lldata.access_address()),
            crc_init: Hex(lldata.crc_init()),
            channel_map: *lldata.channel_map(),
            hop: lldata.hop(),
            unmapped: DataChannel::new(0),
            channel: DataChannel::new(0),
            interval: lldata.interval(),
            supervision_timeout: lldata.supervision_timeout(),
            next_start: request_end + lldata.transmit_window_delay(),
            window: lldata.win_size(),
            event_counter: Wrapping(0),
            counter_synced: true,
            deferred: false,
            conn_update: None,
            map_update: None,
            locating: None,
            connection_updates: Wrapping(0),
            map_updates: Wrapping(0),
        }
    }

    /// Creates the schedule of a connection whose parameters were recovered from the air.
    ///
    /// `channel` is the data channel on which the event anchored at `anchor` took place. All data
    /// channels are assumed to be in use. Event counting starts at 0 with the next event, but the
    /// counter stays unsynced until a connection update pins it down.
    pub fn recovered(
        access_address: u32,
        crc_init: u32,
        hop: u8,
        interval: Duration,
        channel: DataChannel,
        anchor: Instant,
    ) -> Self {
        Self {
            access_address: Hex(access_address),
            crc_init: Hex(crc_init),
            channel_map: ChannelMap::with_all_channels(),
            hop,
            unmapped: channel,
            channel,
            interval,
            supervision_timeout: Duration::from_secs(32),
            next_start: anchor + interval,
            window: Duration::from_micros(0),
            event_counter: Wrapping(0),
            counter_synced: false,
            deferred: false,
            conn_update: None,
            map_update: None,
            locating: None,
            connection_updates: Wrapping(0),
            map_updates: Wrapping(0),
        }
    }

    pub fn access_address(&self) -> u32 {
        self.access_address.0
    }

    pub fn crc_init(&self) -> u32 {
        self.crc_init.0
    }

    pub fn hop(&self) -> u8 {
        self.hop
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn supervision_timeout(&self) -> Duration {
        self.supervision_timeout
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Returns the channel of the most recently opened event.
    pub fn channel(&self) -> DataChannel {
        self.channel
    }

    /// Returns the counter of the next event to be opened.
    ///
    /// While an event is open, this is the counter of that event.
    pub fn event_counter(&self) -> u16 {
        self.event_counter.0
    }

    /// Returns whether the event counter is known to match the connection's.
    pub fn is_counter_synced(&self) -> bool {
        self.counter_synced
    }

    /// Returns whether the instant of a connection update is currently being located.
    pub fn is_locating(&self) -> bool {
        self.locating.is_some()
    }

    /// Returns the stamp to attach to packets captured now.
    pub fn stamp(&self) -> EventStamp {
        EventStamp {
            counter: self.event_counter.0,
            synced: self.counter_synced,
            connection_updates: self.connection_updates.0,
            map_updates: self.map_updates.0,
        }
    }

    /// Returns the predicted start of the next connection event.
    pub fn next_start(&self) -> Instant {
        self.next_start
    }

    /// Returns whether a parameter update is waiting for its instant.
    pub fn has_pending_update(&self) -> bool {
        self.conn_update.is_some() || self.map_update.is_some()
    }

    /// Stores an update to be applied when the event counter reaches its instant.
    ///
    /// `event` is the counter the PDU carrying the update was stamped with. It only matters while
    /// the counter is unsynced: the update's instant is then assumed to lie `MIN_INSTANT_LEAD`
    /// events after `event`, the earliest the master may have picked. A newer update of the same
    /// kind replaces an older one.
    pub fn schedule_update(&mut self, update: LlcpUpdate, event: u16) {
        debug!(
            "update scheduled for instant {} (now at {}, seen at {}): {:?}",
            update.instant(),
            self.event_counter,
            event,
            update
        );

        let earliest = event.wrapping_add(MIN_INSTANT_LEAD);
        match update {
            LlcpUpdate::Connection(data) => {
                self.conn_update = Some(data);
                self.deferred = false;
                self.locating = None;
                if self.counter_synced {
                    return;
                }

                let shift = data.instant().wrapping_sub(earliest);
                self.event_counter += Wrapping(shift);
                if let Some((_, instant)) = &mut self.map_update {
                    *instant = instant.wrapping_add(shift);
                }

                let moves_anchor =
                    data.interval() != self.interval || data.win_offset().as_micros() != 0;
                if moves_anchor {
                    self.locating = Some(Locating::default());
                }
            }
            LlcpUpdate::ChannelMap { map, instant } => {
                let instant = if self.counter_synced {
                    instant
                } else {
                    earliest
                };
                self.map_update = Some((map, instant));
            }
        }
    }

    /// Advances to the channel of the next connection event and returns it.
    pub fn next_channel(&mut self) -> DataChannel {
        self.unmapped = self.unmapped.advance(self.hop);
        self.channel = self.channel_map.remap(self.unmapped).unwrap_or(self.unmapped);
        self.channel
    }

    /// Returns the channels of the next `count` events without advancing the schedule.
    pub fn predict_channels(&self, count: usize) -> impl Iterator<Item = DataChannel> {
        let mut schedule = self.clone();
        (0..count).map(move |_| schedule.next_channel())
    }

    /// Opens the next connection event.
    ///
    /// Pending updates whose instant is reached are applied here, before hopping, so that the
    /// event at the instant is the first one using the new parameters.
    pub fn open_event(&mut self) -> EventStart {
        let counter = self.event_counter.0;

        if let Some(update) = self.conn_update {
            if instant_reached(counter, update.instant()) {
                if self.locating.is_some() {
                    return self.open_locating_event(update);
                }

                let window_start = self.next_start + update.win_offset();
                if !self.deferred && update.win_offset().as_micros() > 0 {
                    self.deferred = true;
                    return EventStart::Defer(window_start);
                }

                self.apply_connection_update(update);
                self.next_start = window_start;
                self.window = update.win_size();
            }
        }

        self.apply_map_update(counter);
        EventStart::Open {
            channel: self.next_channel(),
            start: self.next_start,
            window: self.window,
        }
    }

    /// Opens an event that listens for both the old and the updated anchor.
    fn open_locating_event(&mut self, update: ConnectionUpdateData) -> EventStart {
        let old = self.next_start;
        let window_start = old + update.win_offset();
        let window_end = window_start + update.win_size();
        let late = self
            .locating
            .and_then(|l| l.ambiguous_anchor)
            .map(|anchor| anchor + update.interval());

        let start = late.map_or(old, |late| late.min(old));
        let end = late.map_or(window_end, |late| later(late, window_end));
        if let Some(locating) = &mut self.locating {
            locating.open = Some(Candidates {
                old,
                window_start,
                window_end,
                late,
            });
        }

        self.apply_map_update(self.event_counter.0);
        EventStart::Open {
            channel: self.next_channel(),
            start,
            window: end - start,
        }
    }

    fn apply_connection_update(&mut self, update: ConnectionUpdateData) {
        self.deferred = false;
        self.conn_update = None;
        self.locating = None;
        self.interval = update.interval();
        self.supervision_timeout = update.timeout();
        self.connection_updates += Wrapping(1);
        info!(
            "connection update at event {}: interval {}, timeout {}",
            self.event_counter, self.interval, self.supervision_timeout
        );
    }

    fn apply_map_update(&mut self, counter: u16) {
        if let Some((map, instant)) = self.map_update {
            if instant_reached(counter, instant) {
                self.map_update = None;
                self.channel_map = map;
                self.map_updates += Wrapping(1);
                info!("channel map update at event {}: {}", counter, map);
            }
        }
    }

    /// Closes the current connection event and returns the predicted start of the next one.
    ///
    /// `first_packet` is the start time of the first packet seen during the event, and `packets`
    /// the number of packets seen. Two packets (master and slave) fix the anchor. A single packet
    /// only does so if it lies within `ANCHOR_TOLERANCE` of the prediction, or if the event had a
    /// transmit window (the anchor is unknown then). Otherwise the prediction is kept.
    pub fn close_event(&mut self, first_packet: Option<Instant>, packets: u8) -> Instant {
        let open = self.locating.as_mut().and_then(|l| l.open.take());
        if let (Some(candidates), Some(update)) = (open, self.conn_update) {
            return self.close_locating_event(candidates, update, first_packet);
        }

        let predicted = self.next_start;
        let anchor = match first_packet {
            Some(observed) if packets >= 2 => observed,
            Some(observed) if self.window.as_micros() > 0 => observed,
            Some(observed) if observed.is_near(predicted, ANCHOR_TOLERANCE) => observed,
            _ => predicted,
        };

        trace!(
            "event {} on {:?}: {} packet(s), anchor {}",
            self.event_counter,
            self.channel,
            packets,
            anchor
        );

        self.window = Duration::from_micros(0);
        self.event_counter += Wrapping(1);
        self.next_start = anchor + self.interval;
        self.next_start
    }

    /// Decides from the event's first packet whether the update being located took effect.
    ///
    /// As long as it did not, the event counter stays put: the instant is still ahead, so the
    /// counter was assumed too high.
    fn close_locating_event(
        &mut self,
        candidates: Candidates,
        update: ConnectionUpdateData,
        first_packet: Option<Instant>,
    ) -> Instant {
        let observed = match first_packet {
            Some(observed) => observed,
            None => return self.locating_miss(candidates),
        };

        let located = candidates.locate(observed);
        trace!("locating instant {}: {:?} at {}", update.instant(), located, observed);
        let counter = match located {
            Located::NotYet | Located::NotYetOrNow => {
                let ambiguous = located == Located::NotYetOrNow;
                if let Some(locating) = &mut self.locating {
                    locating.misses = 0;
                    locating.ambiguous_anchor = if ambiguous { Some(observed) } else { None };
                }
                self.next_start = observed + self.interval;
                return if ambiguous {
                    self.next_start.min(observed + update.interval())
                } else {
                    self.next_start
                };
            }
            Located::Now => update.instant(),
            Located::Previous => update.instant().wrapping_add(1),
        };

        self.event_counter = Wrapping(counter);
        self.counter_synced = true;
        self.apply_connection_update(update);
        debug!("event counter synced at {}", counter);

        self.window = Duration::from_micros(0);
        self.event_counter += Wrapping(1);
        self.next_start = observed + self.interval;
        self.next_start
    }

    /// Handles a silent event while locating. After too many, the update is applied anyway and the
    /// next event listens for a whole interval to find the new anchor.
    fn locating_miss(&mut self, candidates: Candidates) -> Instant {
        let misses = match &mut self.locating {
            Some(locating) => {
                locating.misses += 1;
                locating.ambiguous_anchor = None;
                locating.misses
            }
            None => 0,
        };

        let resume = candidates.old + self.interval;
        if misses >= LOCATE_MISS_LIMIT {
            if let Some(update) = self.conn_update {
                warn!(
                    "instant {} not found after {} silent events, applying update",
                    update.instant(),
                    misses
                );
                self.apply_connection_update(update);
                self.next_start = resume;
                self.window = self.interval;
                self.event_counter += Wrapping(1);
                return self.next_start;
            }
        }

        self.next_start = resume;
        self.next_start
    }

    /// Advances past all events that would have to be opened before `now` to be caught.
    ///
    /// An event counts as missed when `lead` before its predicted start already lies in the past.
    /// Missed events hop and count like regular ones, but keep the predicted anchor. Returns the
    /// number of skipped events.
    pub fn catch_up(&mut self, now: Instant, lead: Duration) -> u16 {
        let mut skipped = 0;
        while now.is_after(self.next_start - lead) {
            if let EventStart::Defer(_) = self.open_event() {
                self.open_event();
            }
            self.close_event(None, 0);
            skipped += 1;
        }

        if skipped != 0 {
            debug!("skipped {} missed connection events", skipped);
        }
        skipped
    }
}
