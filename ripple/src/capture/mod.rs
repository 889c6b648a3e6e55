//! The capture context: framing, buffering and retuning.
//!
//! [`Capture`] runs in the platform's radio and timer interrupt handlers. It is driven by two entry
//! points:
//!
//! * [`Capture::on_capture`] whenever the [`CaptureEngine`] has received bytes.
//! * [`Capture::on_timer`] when the instant returned by [`Capture::next_deadline`] is reached.
//!
//! Both run to completion, never block and never allocate. The `Capture` talks to the processing
//! context only through its [`CaptureEnd`] of a split [`Handoff`]: completed buffers go out through
//! a lock-free SPSC queue of buffer ids, and [`Retune`] commands come in through a one-slot mailbox
//! and are applied on the next timer interrupt.
//!
//! [`Capture`]: struct.Capture.html
//! [`Capture::on_capture`]: struct.Capture.html#method.on_capture
//! [`Capture::on_timer`]: struct.Capture.html#method.on_timer
//! [`Capture::next_deadline`]: struct.Capture.html#method.next_deadline
//! [`CaptureEngine`]: trait.CaptureEngine.html
//! [`CaptureEnd`]: handoff/struct.CaptureEnd.html
//! [`Handoff`]: handoff/struct.Handoff.html
//! [`Retune`]: enum.Retune.html

pub mod buffer;
pub mod handoff;

pub use self::buffer::{
    BufferId, BufferPool, Kind, Owner, PacketBuffer, RssiSummary, BUFFER_SIZE, POOL_SIZE,
};
pub use self::handoff::{CancelHandle, CaptureEnd, Handoff, ProcessingEnd};

use crate::{
    link::{
        self,
        hop::{EventStamp, EventStart, HopSchedule, LlcpUpdate},
        HEADER_SIZE, CRC_SIZE, PACKET_LEAD_MICROS,
    },
    phy::Channel,
    time::{Duration, Instant},
    whitening,
};

/// Time the radio needs between a retune and being ready to receive.
pub const RX_WARMUP: Duration = Duration::from_micros(300);

/// How long to wait for the slave's response after the end of the master's packet.
pub const IFS_TIMEOUT: Duration = Duration::from_micros(300);

/// On-air time of the longest possible packet.
pub const MAX_PACKET_AIRTIME: Duration = Duration::from_micros(2120);

/// Upper bound on the PLL lock time after a retune.
pub const RETUNE_TIMEOUT: Duration = Duration::from_micros(200);

/// Delay before a failed retune is attempted again.
pub const RELOCK_DELAY: Duration = Duration::from_micros(250);

/// Time between the start of a packet and the reception of its first PDU byte.
const FIRST_BYTE_DELAY: Duration = Duration::from_micros(PACKET_LEAD_MICROS + 8);

/// Platform interface to the radio.
///
/// The engine delivers received bytes in chunks. In packet mode, the radio synchronizes on the
/// configured Access Address and delivers the (still whitened) bytes following it. In raw mode, it
/// delivers demodulated bits without synchronization. Bytes are delivered as the radio shifts them
/// out: first received bit in the MSb.
pub trait CaptureEngine {
    /// Starts receiving on `channel`.
    fn start_capture(&mut self, channel: Channel, mode: CaptureMode);

    /// Stops receiving.
    fn stop_capture(&mut self);

    /// Discards any bytes received but not yet read.
    fn flush(&mut self);

    /// Copies up to `buf.len()` received bytes into `buf`.
    ///
    /// Returns `None` when no bytes are available.
    fn read_buffer(&mut self, buf: &mut [u8]) -> Option<Chunk>;

    /// Tunes the synthesizer to `channel`, waiting at most `timeout` for it to lock.
    fn retune(&mut self, channel: Channel, timeout: Duration) -> Readiness;
}

/// A chunk of bytes returned by `CaptureEngine::read_buffer`.
#[derive(Debug, Copy, Clone)]
pub struct Chunk {
    /// Number of bytes written to the buffer.
    pub len: usize,

    /// Reception time of the chunk's first byte.
    pub timestamp: Instant,

    /// Signal strength measured while receiving the chunk.
    pub rssi: i8,
}

/// Result of a bounded wait.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// How the radio receives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    /// Synchronize on an Access Address and frame packets.
    Packet { access_address: u32 },

    /// Deliver unsynchronized bits in fixed-size windows.
    Raw,
}

/// A schedule change sent from the processing context to the capture context.
#[derive(Debug, Clone)]
pub enum Retune {
    /// Stop capturing.
    Stop,

    /// Park on a single channel.
    Listen { channel: Channel, mode: CaptureMode },

    /// Follow a connection's hopping schedule.
    Follow(HopSchedule),

    /// Apply an LLCP update to the followed connection at its instant.
    Update {
        update: LlcpUpdate,
        /// Event counter stamped on the packet that carried the update.
        event: u16,
    },

    /// Restart the capture after a stall.
    Relock,
}

/// Counters maintained by the capture context.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Packets and raw windows handed to the processing context.
    pub packets: u32,
    /// Packets dropped because the pool was exhausted.
    pub discarded: u32,
    /// Packets aborted because of an invalid length field.
    pub malformed: u32,
    /// Retunes that did not lock in time.
    pub retune_timeouts: u32,
}

#[derive(Debug, Clone)]
enum Tuning {
    Off,
    Fixed(CaptureMode),
    Hopping(HopSchedule),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DeadlineKind {
    OpenEvent,
    CloseEvent,
}

#[derive(Debug, Copy, Clone)]
struct Deadline {
    at: Instant,
    kind: DeadlineKind,
}

/// What happened in the currently open connection event.
#[derive(Debug, Copy, Clone, Default)]
struct EventTracker {
    packets: u8,
    first_packet: Option<Instant>,
}

/// The capture context.
pub struct Capture<'a, E: CaptureEngine> {
    engine: E,
    end: CaptureEnd<'a>,
    current: Option<BufferId>,
    tuning: Tuning,
    channel: Channel,
    event: EventTracker,
    deadline: Option<Deadline>,
    relock_at: Option<Instant>,
    last_activity: Instant,
    stats: CaptureStats,
}

impl<'a, E: CaptureEngine> Capture<'a, E> {
    /// Creates an idle capture context around `engine`, handing buffers off through `end`.
    pub fn new(engine: E, mut end: CaptureEnd<'a>) -> Self {
        let current = end.acquire();
        let capture = Self {
            engine,
            end,
            current,
            tuning: Tuning::Off,
            channel: Channel::ADVERTISING_37,
            event: EventTracker::default(),
            deadline: None,
            relock_at: None,
            last_activity: Instant::ZERO,
            stats: CaptureStats::default(),
        };
        capture.publish();
        capture
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Returns the channel the radio is tuned to.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Returns the followed connection's schedule, if a connection is being followed.
    pub fn schedule(&self) -> Option<&HopSchedule> {
        match &self.tuning {
            Tuning::Hopping(schedule) => Some(schedule),
            _ => None,
        }
    }

    /// Returns whether the radio is capturing (or scheduled to).
    pub fn is_active(&self) -> bool {
        match self.tuning {
            Tuning::Off => false,
            _ => true,
        }
    }

    /// Returns the instant at which `on_timer` must be called next.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.end.retune_due(),
            self.relock_at,
            self.deadline.map(|d| d.at),
        ]
        .iter()
        .filter_map(|at| *at)
        .fold(None, |earliest: Option<Instant>, at| {
            Some(earliest.map_or(at, |e| e.min(at)))
        })
    }

    /// Returns the number of buffers with the given owner.
    pub fn buffers_owned_by(&self, owner: Owner) -> usize {
        self.end.pool().count(owner)
    }

    /// Moves all bytes the engine has received into the capturing buffer.
    ///
    /// Must be called from the radio interrupt.
    pub fn on_capture(&mut self, now: Instant) {
        self.last_activity = now;
        self.receive(now);
        self.publish();
    }

    fn receive(&mut self, now: Instant) {
        let mode = match &self.tuning {
            Tuning::Off => {
                self.engine.flush();
                return;
            }
            Tuning::Fixed(mode) => *mode,
            Tuning::Hopping(schedule) => CaptureMode::Packet {
                access_address: schedule.access_address(),
            },
        };

        loop {
            let mut id = match self.current.take().or_else(|| self.end.acquire()) {
                Some(id) => id,
                None => {
                    self.engine.flush();
                    return;
                }
            };

            let pool = self.end.pool();
            let buffer = pool.get_mut(&mut id);
            let pos = usize::from(buffer.pos);
            let limit = match mode {
                CaptureMode::Raw => BUFFER_SIZE,
                CaptureMode::Packet { .. } if pos < HEADER_SIZE => HEADER_SIZE,
                CaptureMode::Packet { .. } => buffer.size(),
            };

            let chunk = match self.engine.read_buffer(&mut buffer.storage_mut()[pos..limit]) {
                Some(chunk) if chunk.len > 0 => chunk,
                _ => {
                    self.current = Some(id);
                    return;
                }
            };

            if pos == 0 {
                buffer.channel = self.channel;
                buffer.event = match &self.tuning {
                    Tuning::Hopping(schedule) => schedule.stamp(),
                    _ => EventStamp::NONE,
                };
                match mode {
                    CaptureMode::Packet { access_address } => {
                        buffer.kind = Kind::Packet;
                        buffer.access_address = access_address;
                        buffer.timestamp = chunk.timestamp - FIRST_BYTE_DELAY;
                    }
                    CaptureMode::Raw => {
                        buffer.kind = Kind::Raw;
                        buffer.timestamp = chunk.timestamp;
                    }
                }
            }

            buffer.push_rssi(chunk.rssi);
            let pos = pos + chunk.len.min(limit - pos);
            buffer.pos = pos as u16;

            match mode {
                CaptureMode::Raw => {
                    if pos == BUFFER_SIZE {
                        buffer.set_size(BUFFER_SIZE);
                        self.complete_window(id);
                    } else {
                        self.current = Some(id);
                    }
                }
                CaptureMode::Packet { .. } => {
                    if pos >= HEADER_SIZE && buffer.size() == 0 {
                        let length = whitening::dewhiten_length(self.channel, buffer.storage()[1]);
                        if !link::is_valid_payload_length(self.channel.is_advertising(), length) {
                            debug!("invalid length {} on {:?}, dropping", length, self.channel);
                            self.stats.malformed += 1;
                            buffer.clear();
                            self.current = Some(id);
                            self.restart(now);
                            return;
                        }
                        buffer.set_size(HEADER_SIZE + usize::from(length) + CRC_SIZE);
                    }

                    if buffer.size() != 0 && pos >= buffer.size() {
                        self.complete_packet(id);
                        return;
                    }
                    self.current = Some(id);
                }
            }
        }
    }

    /// Handles deadlines and posted schedule changes.
    ///
    /// Must be called from the timer interrupt whenever `next_deadline` is reached.
    pub fn on_timer(&mut self, now: Instant) {
        self.last_activity = now;

        if let Some(retune) = self.end.take_retune(now) {
            self.apply(retune, now);
        }

        if let Some(at) = self.relock_at {
            if !at.is_after(now) {
                self.relock_at = None;
                self.restart(now);
            }
        }

        if let Some(deadline) = self.deadline {
            if !deadline.at.is_after(now) {
                self.deadline = None;
                match deadline.kind {
                    DeadlineKind::OpenEvent => self.open_event(now),
                    DeadlineKind::CloseEvent => self.close_event(),
                }
            }
        }

        self.publish();
    }

    /// Tells the processing context where the radio is and when it should hear from us again.
    ///
    /// A raw capture delivers windows continuously, and a followed connection has a deadline at
    /// least once per connection interval. A packet capture parked on a single channel may
    /// legitimately stay silent.
    fn publish(&self) {
        let expected = match &self.tuning {
            Tuning::Off | Tuning::Fixed(CaptureMode::Packet { .. }) => None,
            Tuning::Fixed(CaptureMode::Raw) => Some(self.last_activity),
            Tuning::Hopping(_) => Some(self.deadline.map_or(self.last_activity, |d| d.at)),
        };
        self.end.publish(self.channel, expected);
    }

    fn apply(&mut self, retune: Retune, now: Instant) {
        match retune {
            Retune::Stop => {
                info!("capture stopped");
                self.engine.stop_capture();
                self.engine.flush();
                self.abort_packet();
                self.tuning = Tuning::Off;
                self.deadline = None;
                self.relock_at = None;
            }
            Retune::Listen { channel, mode } => {
                info!("listening on {:?} ({:?})", channel, mode);
                self.tuning = Tuning::Fixed(mode);
                self.deadline = None;
                self.channel = channel;
                self.restart(now);
            }
            Retune::Follow(mut schedule) => {
                info!(
                    "following AA {:#010x}, interval {}, hop {}",
                    schedule.access_address(),
                    schedule.interval(),
                    schedule.hop()
                );
                self.engine.stop_capture();
                self.engine.flush();
                self.abort_packet();
                schedule.catch_up(now, RX_WARMUP);
                self.deadline = Some(Deadline {
                    at: schedule.next_start() - RX_WARMUP,
                    kind: DeadlineKind::OpenEvent,
                });
                self.tuning = Tuning::Hopping(schedule);
            }
            Retune::Update { update, event } => match &mut self.tuning {
                Tuning::Hopping(schedule) => schedule.schedule_update(update, event),
                _ => debug!("dropping {:?}: not following a connection", update),
            },
            Retune::Relock => {
                warn!("relocking stalled capture on {:?}", self.channel);
                if let Tuning::Hopping(schedule) = &mut self.tuning {
                    schedule.catch_up(now, RX_WARMUP);
                    self.deadline = Some(Deadline {
                        at: schedule.next_start() - RX_WARMUP,
                        kind: DeadlineKind::OpenEvent,
                    });
                    self.engine.stop_capture();
                } else {
                    self.restart(now);
                }
            }
        }
    }

    fn open_event(&mut self, now: Instant) {
        let schedule = match &mut self.tuning {
            Tuning::Hopping(schedule) => schedule,
            _ => return,
        };

        match schedule.open_event() {
            EventStart::Defer(window_start) => {
                self.deadline = Some(Deadline {
                    at: window_start - RX_WARMUP,
                    kind: DeadlineKind::OpenEvent,
                });
            }
            EventStart::Open {
                channel,
                start,
                window,
            } => {
                self.event = EventTracker::default();
                self.deadline = Some(Deadline {
                    at: start + window + MAX_PACKET_AIRTIME,
                    kind: DeadlineKind::CloseEvent,
                });
                self.channel = channel.into();
                self.restart(now);
            }
        }
    }

    fn close_event(&mut self) {
        self.engine.stop_capture();
        self.engine.flush();
        self.abort_packet();

        if let Tuning::Hopping(schedule) = &mut self.tuning {
            let next = schedule.close_event(self.event.first_packet, self.event.packets);
            self.deadline = Some(Deadline {
                at: next - RX_WARMUP,
                kind: DeadlineKind::OpenEvent,
            });
        }
    }

    /// (Re)starts capturing on the current channel after a retune.
    fn restart(&mut self, now: Instant) {
        let mode = match &self.tuning {
            Tuning::Off => return,
            Tuning::Fixed(mode) => *mode,
            Tuning::Hopping(schedule) => CaptureMode::Packet {
                access_address: schedule.access_address(),
            },
        };

        self.engine.stop_capture();
        self.engine.flush();
        match self.engine.retune(self.channel, RETUNE_TIMEOUT) {
            Readiness::Ready => {
                self.relock_at = None;
                self.engine.start_capture(self.channel, mode);
            }
            Readiness::TimedOut => {
                warn!("{:?} did not lock, retrying", self.channel);
                self.stats.retune_timeouts += 1;
                self.relock_at = Some(now + RELOCK_DELAY);
            }
        }
    }

    /// Continues capturing on the current channel without retuning.
    fn resume(&mut self) {
        let mode = match &self.tuning {
            Tuning::Off => return,
            Tuning::Fixed(mode) => *mode,
            Tuning::Hopping(schedule) => CaptureMode::Packet {
                access_address: schedule.access_address(),
            },
        };
        if self.relock_at.is_none() {
            self.engine.start_capture(self.channel, mode);
        }
    }

    /// Drops whatever was received into the capturing buffer so far.
    fn abort_packet(&mut self) {
        if let Some(id) = &mut self.current {
            self.end.pool().get_mut(id).clear();
        }
    }

    fn complete_packet(&mut self, id: BufferId) {
        self.engine.stop_capture();
        self.engine.flush();

        let (start, size, channel) = {
            let buffer = self.end.pool().get(&id);
            (buffer.timestamp, buffer.size(), buffer.channel)
        };
        trace!("{} byte packet at {} on {:?}", size, start, channel);
        self.hand_off(id);

        let following = match self.tuning {
            Tuning::Hopping(_) => !channel.is_advertising(),
            _ => false,
        };
        if !following {
            self.resume();
            return;
        }

        self.event.packets += 1;
        if self.event.packets == 1 {
            // wait for the slave's response
            self.event.first_packet = Some(start);
            let end = start + Duration::from_micros(link::packet_duration_micros(size));
            self.deadline = Some(Deadline {
                at: end + IFS_TIMEOUT,
                kind: DeadlineKind::CloseEvent,
            });
            self.resume();
        } else {
            self.deadline = None;
            self.close_event();
        }
    }

    fn complete_window(&mut self, id: BufferId) {
        self.hand_off(id);
    }

    /// Queues buffer `id` and continues capturing into a fresh one.
    ///
    /// If the pool is exhausted the completed buffer is dropped and reused instead.
    fn hand_off(&mut self, mut id: BufferId) {
        match self.end.acquire() {
            Some(next) => {
                match self.end.hand_off(id) {
                    Ok(()) => self.stats.packets += 1,
                    Err(id) => {
                        // cannot happen with the queue as large as the pool
                        self.end.pool().release(id);
                        self.stats.discarded += 1;
                    }
                }
                self.current = Some(next);
            }
            None => {
                debug!("buffer pool exhausted, dropping packet");
                self.stats.discarded += 1;
                self.end.pool().get_mut(&mut id).clear();
                self.current = Some(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::{
            advertising::{Header, PduType},
            ADVERTISING_ADDRESS, CRC_PRESET,
        },
        phy::DataChannel,
        sim::{air_packet, Clock, SimEngine, Transmission},
        Error,
    };
    use std::{cell::Cell, rc::Rc};

    fn at(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    fn split(clock: &Clock) -> (Capture<'static, SimEngine>, ProcessingEnd<'static>) {
        let handoff = Box::leak(Box::new(Handoff::new()));
        let (capture_end, processing) = handoff.split();
        (
            Capture::new(SimEngine::new(clock.clone()), capture_end),
            processing,
        )
    }

    fn listening(clock: &Clock) -> (Capture<'static, SimEngine>, ProcessingEnd<'static>) {
        let (mut capture, mut processing) = split(clock);
        let listen = Retune::Listen {
            channel: Channel::ADVERTISING_37,
            mode: CaptureMode::Packet {
                access_address: ADVERTISING_ADDRESS,
            },
        };
        processing.post(listen, at(0)).unwrap();
        capture.on_timer(at(0));
        (capture, processing)
    }

    fn adv_ind(start: Instant) -> Transmission {
        let mut header = Header::new(PduType::AdvInd);
        header.set_payload_length(6);
        let mut pdu = header.to_u16().to_le_bytes().to_vec();
        pdu.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        Transmission {
            start,
            channel: Channel::ADVERTISING_37,
            access_address: ADVERTISING_ADDRESS,
            air: air_packet(Channel::ADVERTISING_37, CRC_PRESET, &pdu),
        }
    }

    /// Delivers `tx` at its end and returns whether the radio received it.
    fn deliver(capture: &mut Capture<'_, SimEngine>, clock: &Clock, tx: &Transmission) -> bool {
        clock.set(tx.end().raw_micros());
        let received = capture.engine_mut().transmit(tx);
        if received {
            capture.on_capture(tx.end());
        }
        received
    }

    #[test]
    fn frames_and_timestamps_packets() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = listening(&clock);

        let tx = adv_ind(at(1_000));
        assert!(deliver(&mut capture, &clock, &tx));

        let id = processing.next_queued().expect("packet queued");
        let buffer = processing.pool().get(&id);
        assert_eq!(buffer.timestamp, at(1_000));
        assert_eq!(buffer.size(), 2 + 6 + 3);
        assert_eq!(buffer.channel, Channel::ADVERTISING_37);
        assert_eq!(buffer.access_address, ADVERTISING_ADDRESS);
        assert_eq!(buffer.rssi().map(|r| r.count), Some(2));
        processing.release(id);

        assert_eq!(capture.buffers_owned_by(Owner::Free), POOL_SIZE - 1);
        assert_eq!(capture.buffers_owned_by(Owner::Capturing), 1);
        // the radio was restarted for the next packet
        assert!(capture.engine().is_receiving());
    }

    #[test]
    fn pool_exhaustion_drops_newest() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = listening(&clock);

        for i in 0..5 {
            assert!(deliver(&mut capture, &clock, &adv_ind(at(1_000 + i * 1_000))));
        }
        let stats = capture.stats();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.discarded, 2);
        assert_eq!(capture.buffers_owned_by(Owner::Queued), 3);

        // the first three packets survive, in order
        let mut starts = Vec::new();
        while let Some(id) = processing.next_queued() {
            starts.push(processing.pool().get(&id).timestamp);
            processing.release(id);
        }
        assert_eq!(starts, [at(1_000), at(2_000), at(3_000)]);

        assert!(deliver(&mut capture, &clock, &adv_ind(at(10_000))));
        assert_eq!(capture.stats().packets, 4);
    }

    #[test]
    fn processing_keeps_buffers_while_capture_continues() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = listening(&clock);

        assert!(deliver(&mut capture, &clock, &adv_ind(at(1_000))));
        let mut held = processing.next_queued().expect("packet queued");
        processing.pool().get_mut(&mut held).bytes_mut()[0] = 0xff;

        // the capture context fills other buffers meanwhile
        assert!(deliver(&mut capture, &clock, &adv_ind(at(2_000))));
        assert_eq!(processing.pool().get(&held).bytes()[0], 0xff);
        assert_eq!(processing.pool().get(&held).timestamp, at(1_000));

        let next = processing.next_queued().expect("second packet queued");
        assert_eq!(processing.pool().get(&next).timestamp, at(2_000));
        processing.release(held);
        processing.release(next);
        assert_eq!(capture.buffers_owned_by(Owner::Free), POOL_SIZE - 1);
    }

    #[test]
    fn invalid_length_aborts_packet() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = listening(&clock);

        let mut air = vec![0x00, 40, 0, 0, 0, 0];
        crate::whitening::whiten_for_air(&mut air, Channel::ADVERTISING_37);
        let junk = Transmission {
            start: at(1_000),
            channel: Channel::ADVERTISING_37,
            access_address: ADVERTISING_ADDRESS,
            air,
        };
        assert!(deliver(&mut capture, &clock, &junk));
        assert_eq!(capture.stats().malformed, 1);
        assert!(processing.next_queued().is_none());

        assert!(deliver(&mut capture, &clock, &adv_ind(at(2_000))));
        let id = processing.next_queued().expect("packet queued");
        assert_eq!(processing.pool().get(&id).size(), 11);
    }

    #[test]
    fn mailbox_holds_one_retune() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = split(&clock);
        processing.post(Retune::Stop, at(0)).unwrap();
        assert_eq!(processing.post(Retune::Relock, at(0)), Err(Error::Busy));
        assert!(processing.has_pending_retune());
        assert_eq!(capture.next_deadline(), Some(at(0)));

        capture.on_timer(at(5));
        assert!(!processing.has_pending_retune());
        assert!(!capture.is_active());
    }

    #[test]
    fn failed_retune_is_retried() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = split(&clock);
        capture.engine_mut().fail_retunes = 1;
        let listen = Retune::Listen {
            channel: Channel::ADVERTISING_37,
            mode: CaptureMode::Packet {
                access_address: ADVERTISING_ADDRESS,
            },
        };
        processing.post(listen, at(0)).unwrap();
        capture.on_timer(at(0));

        assert_eq!(capture.stats().retune_timeouts, 1);
        assert!(!capture.engine().is_receiving());
        assert_eq!(capture.next_deadline(), Some(at(0) + RELOCK_DELAY));

        clock.set(RELOCK_DELAY.as_micros());
        capture.on_timer(at(0) + RELOCK_DELAY);
        assert!(capture.engine().is_receiving());
        assert_eq!(capture.engine().retunes(), 2);
        assert_eq!(capture.next_deadline(), None);
    }

    #[test]
    fn raw_capture_stalls_without_data() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = split(&clock);
        let listen = Retune::Listen {
            channel: DataChannel::new(17).into(),
            mode: CaptureMode::Raw,
        };
        processing.post(listen, at(0)).unwrap();
        capture.on_timer(at(0));

        let limit = Duration::from_secs(1);
        assert!(!processing.is_stalled(at(1_000_000), limit));
        assert!(processing.is_stalled(at(1_000_001), limit));
        assert_eq!(processing.channel().index(), 17);

        let window = [0u8; BUFFER_SIZE];
        assert!(capture.engine_mut().inject_raw(&window, at(900_000)));
        capture.on_capture(at(1_000_000));
        assert!(!processing.is_stalled(at(1_500_000), limit));

        let id = processing.next_queued().expect("window queued");
        let buffer = processing.pool().get(&id);
        assert_eq!(buffer.kind, Kind::Raw);
        assert_eq!(buffer.size(), BUFFER_SIZE);
        assert_eq!(buffer.timestamp, at(900_000));
    }

    #[test]
    fn parked_packet_capture_is_never_stalled() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (_capture, processing) = listening(&clock);
        assert!(!processing.is_stalled(at(100_000_000), Duration::from_secs(1)));
    }

    #[test]
    fn follow_opens_events_on_hopped_channels() {
        let clock: Clock = Rc::new(Cell::new(0));
        let (mut capture, mut processing) = split(&clock);
        let schedule = HopSchedule::recovered(
            0x5065_9a3c,
            0x12_3456,
            7,
            Duration::from_conn_units(6),
            DataChannel::new(0),
            at(10_000),
        );
        processing.post(Retune::Follow(schedule), at(10_000)).unwrap();
        capture.on_timer(at(10_000));

        let mut channels = Vec::new();
        for _ in 0..3 {
            let deadline = capture.next_deadline().expect("event scheduled");
            clock.set(deadline.raw_micros());
            capture.on_timer(deadline);
            if capture.engine().is_receiving() {
                channels.push(capture.channel().index());
            }
            // nothing is received, so the event closes on its own
            let close = capture.next_deadline().expect("event open");
            clock.set(close.raw_micros());
            capture.on_timer(close);
        }
        assert_eq!(channels, [7, 14, 21]);
        assert_eq!(capture.schedule().map(|s| s.event_counter()), Some(3));
    }
}
