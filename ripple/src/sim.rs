//! A simulated radio and air interface for tests.
//!
//! [`SimEngine`] stands in for the platform's radio: it only receives a [`Transmission`] if it was
//! capturing on the right channel, with the right access address, since before the transmission
//! started. [`Sim`] ties a `Capture` and a `Sniffer` to a shared microsecond clock and runs both
//! contexts the way the interrupt handlers and idle loop of a real platform would.

use crate::{
    bytes::{ByteWriter, ToBytes},
    capture::{Capture, CaptureEngine, CaptureMode, Chunk, Handoff, Readiness, BUFFER_SIZE},
    config::{Config, Settings},
    control::{PacketFlags, PacketRecord, Report, Sink},
    crc,
    link::{
        advertising::{self, ConnectRequestData, PduType, CONNECT_REQ_PAYLOAD},
        channel_map::ChannelMap,
        data::{self, Llid},
        llcp::ControlPdu,
        packet_duration_micros, CRC_PRESET,
    },
    phy::{Channel, DataChannel},
    sniffer::{Poll, Sniffer, StageKind},
    time::{Duration, Instant, Timer},
    utils::HexSlice,
    whitening, Error,
};
use crate::capture::RssiSummary;
use crate::control::{Command, Response};
use std::{cell::Cell, rc::Rc};

/// Microseconds since the start of the simulation.
pub type Clock = Rc<Cell<u32>>;

const START: u32 = 10_000;

/// Time between two sniffer polls when nothing else happens.
const TICK: Duration = Duration::from_micros(1_000);

const RSSI: i8 = -62;

pub struct SimTimer(Clock);

impl Timer for SimTimer {
    fn now(&self) -> Instant {
        Instant::from_raw_micros(self.0.get())
    }
}

pub enum SimConfig {}

impl Config for SimConfig {
    type Timer = SimTimer;
}

/// A packet (or garbage) sent by some device.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub start: Instant,
    pub channel: Channel,
    pub access_address: u32,
    /// Whitened bytes following the access address, in received bit order.
    pub air: Vec<u8>,
}

impl Transmission {
    pub fn end(&self) -> Instant {
        self.start + Duration::from_micros(packet_duration_micros(self.air.len()))
    }
}

#[derive(Debug, Copy, Clone)]
struct Receiving {
    channel: Channel,
    mode: CaptureMode,
    since: Instant,
}

pub struct SimEngine {
    clock: Clock,
    receiving: Option<Receiving>,
    fifo: Vec<u8>,
    read: usize,
    base: Instant,
    retunes: u32,
    /// Number of upcoming retunes that will fail to lock.
    pub fail_retunes: u32,
}

impl SimEngine {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            receiving: None,
            fifo: Vec::new(),
            read: 0,
            base: Instant::ZERO,
            retunes: 0,
            fail_retunes: 0,
        }
    }

    fn now(&self) -> Instant {
        Instant::from_raw_micros(self.clock.get())
    }

    pub fn retunes(&self) -> u32 {
        self.retunes
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.is_some()
    }

    /// Puts `tx` into the receive FIFO if the radio could have received it.
    pub fn transmit(&mut self, tx: &Transmission) -> bool {
        let rx = match self.receiving {
            Some(rx) => rx,
            None => return false,
        };
        let synced = match rx.mode {
            CaptureMode::Packet { access_address } => access_address == tx.access_address,
            CaptureMode::Raw => false,
        };
        if !synced || rx.channel != tx.channel || rx.since.is_after(tx.start) {
            return false;
        }

        self.fifo = tx.air.clone();
        self.read = 0;
        self.base = tx.start + Duration::from_micros(packet_duration_micros(1));
        true
    }

    /// Puts unsynchronized bits into the receive FIFO if the radio is in raw mode.
    pub fn inject_raw(&mut self, bits: &[u8], timestamp: Instant) -> bool {
        match self.receiving {
            Some(Receiving {
                mode: CaptureMode::Raw,
                ..
            }) => {
                self.fifo = bits.to_vec();
                self.read = 0;
                self.base = timestamp;
                true
            }
            _ => false,
        }
    }
}

impl CaptureEngine for SimEngine {
    fn start_capture(&mut self, channel: Channel, mode: CaptureMode) {
        self.receiving = Some(Receiving {
            channel,
            mode,
            since: self.now(),
        });
    }

    fn stop_capture(&mut self) {
        self.receiving = None;
    }

    fn flush(&mut self) {
        self.fifo.clear();
        self.read = 0;
    }

    fn read_buffer(&mut self, buf: &mut [u8]) -> Option<Chunk> {
        let left = &self.fifo[self.read..];
        if left.is_empty() {
            return None;
        }

        let len = left.len().min(buf.len());
        buf[..len].copy_from_slice(&left[..len]);
        let timestamp = self.base + Duration::from_micros(self.read as u32 * 8);
        self.read += len;
        Some(Chunk {
            len,
            timestamp,
            rssi: RSSI,
        })
    }

    fn retune(&mut self, _channel: Channel, _timeout: Duration) -> Readiness {
        self.retunes += 1;
        if self.fail_retunes > 0 {
            self.fail_retunes -= 1;
            Readiness::TimedOut
        } else {
            Readiness::Ready
        }
    }
}

/// Appends the CRC to `pdu` and whitens the result for `channel`.
pub fn air_packet(channel: Channel, crc_init: u32, pdu: &[u8]) -> Vec<u8> {
    let mut air = pdu.to_vec();
    air.extend_from_slice(&crc::forward_crc(crc_init, pdu).to_le_bytes()[..3]);
    whitening::whiten_for_air(&mut air, channel);
    air
}

/// Builds the unsynchronized bits of an empty PDU: preamble, access address, header and CRC.
pub fn raw_empty_pdu(
    access_address: u32,
    crc_init: u32,
    header: data::Header,
    channel: Channel,
) -> Vec<u8> {
    let mut frame = vec![0x55u8.reverse_bits()];
    frame.extend(access_address.to_le_bytes().iter().map(|b| b.reverse_bits()));
    frame.extend(air_packet(channel, crc_init, &header.to_u16().to_le_bytes()));
    frame
}

/// Writes the bits of `frame` into `window`, starting at bit `offset`.
pub fn put_bits(window: &mut [u8], offset: usize, frame: &[u8]) {
    for i in 0..frame.len() * 8 {
        let set = frame[i / 8] & (0x80 >> (i % 8)) != 0;
        let pos = offset + i;
        let mask = 0x80 >> (pos % 8);
        if set {
            window[pos / 8] |= mask;
        } else {
            window[pos / 8] &= !mask;
        }
    }
}

/// An owned copy of a reported packet.
#[derive(Debug, Clone)]
pub struct RecordedPacket {
    pub channel: Channel,
    pub timestamp: Instant,
    pub access_address: u32,
    pub rssi: Option<RssiSummary>,
    pub flags: PacketFlags,
    pub pdu: Vec<u8>,
    pub crc_valid: bool,
}

impl RecordedPacket {
    pub fn record(&self) -> PacketRecord<'_> {
        PacketRecord {
            channel: self.channel,
            timestamp: self.timestamp,
            access_address: self.access_address,
            rssi: self.rssi,
            flags: self.flags,
            pdu: HexSlice(&self.pdu),
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub packets: Vec<RecordedPacket>,
    pub reports: Vec<(Report, Channel, Instant)>,
}

impl RecordingSink {
    /// Returns the channel indices of all data channel packets, in order.
    pub fn data_channels(&self) -> Vec<u8> {
        self.packets
            .iter()
            .filter(|p| !p.channel.is_advertising())
            .map(|p| p.channel.index())
            .collect()
    }
}

impl Sink for RecordingSink {
    fn packet(&mut self, record: &PacketRecord<'_>) {
        self.packets.push(RecordedPacket {
            channel: record.channel,
            timestamp: record.timestamp,
            access_address: record.access_address,
            rssi: record.rssi,
            flags: record.flags,
            pdu: record.pdu.0.to_vec(),
            crc_valid: record.crc_valid(),
        });
    }

    fn report(&mut self, report: Report, channel: Channel, timestamp: Instant) {
        self.reports.push((report, channel, timestamp));
    }
}

/// Raw `CONNECT_REQ` parameters, in their on-air units.
#[derive(Debug, Copy, Clone)]
pub struct ConnectRequestParams {
    pub access_address: u32,
    pub crc_init: u32,
    pub win_size: u8,
    pub win_offset: u16,
    pub interval: u16,
    pub timeout: u16,
    pub channel_map: ChannelMap,
    pub hop: u8,
}

/// A sniffer attached to a simulated radio.
pub struct Sim {
    clock: Clock,
    pub capture: Capture<'static, SimEngine>,
    pub sniffer: Sniffer<'static, SimConfig>,
    pub sink: RecordingSink,
    /// Keeps the idle loop from running, so that buffers pile up in the queue.
    paused: bool,
    pending: Vec<Transmission>,
    /// End of the last advertising channel transmission.
    air_free: Instant,
    raw_offset: usize,
}

impl Sim {
    pub fn new(settings: Settings) -> Self {
        let clock = Rc::new(Cell::new(START));
        let handoff = Box::leak(Box::new(Handoff::new()));
        let (capture_end, processing_end) = handoff.split();
        Self {
            capture: Capture::new(SimEngine::new(clock.clone()), capture_end),
            sniffer: Sniffer::new(SimTimer(clock.clone()), settings, processing_end),
            sink: RecordingSink::default(),
            paused: false,
            pending: Vec::new(),
            air_free: Instant::from_raw_micros(START),
            raw_offset: 3,
            clock,
        }
    }

    pub fn now(&self) -> Instant {
        Instant::from_raw_micros(self.clock.get())
    }

    pub fn command(&mut self, command: Command) -> Result<Response, Error> {
        self.sniffer.command(command, &mut self.sink)
    }

    pub fn poll(&mut self) -> Poll {
        self.sniffer.poll(&mut self.sink)
    }

    /// Stops (or resumes) running the processing context while time advances.
    pub fn pause_polling(&mut self, paused: bool) {
        self.paused = paused;
    }

    fn run_idle_loop(&mut self) {
        if !self.paused {
            while self.poll() == Poll::Processed {}
        }
    }

    /// Schedules a transmission. It is delivered when it ends.
    pub fn transmit(&mut self, tx: Transmission) {
        let end = tx.end();
        let pos = self
            .pending
            .iter()
            .position(|t| t.end().is_after(end))
            .unwrap_or_else(|| self.pending.len());
        self.pending.insert(pos, tx);
    }

    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now() + duration;
        self.run_until(end);
    }

    /// Advances the clock to `end`, running every timer deadline, delivery and poll on the way.
    pub fn run_until(&mut self, end: Instant) {
        loop {
            let now = self.now();
            let due = self.is_due(now);
            if !end.is_after(now) && !due {
                break;
            }

            let next = if due {
                now
            } else {
                let mut next = (now + TICK).min(end);
                if let Some(deadline) = self.capture.next_deadline() {
                    next = next.min(deadline);
                }
                if let Some(tx) = self.pending.first() {
                    next = next.min(tx.end());
                }
                next
            };

            self.clock.set(next.raw_micros());
            self.dispatch(next);
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        let timer = self
            .capture
            .next_deadline()
            .map_or(false, |at| !at.is_after(now));
        let air = self
            .pending
            .first()
            .map_or(false, |tx| !tx.end().is_after(now));
        timer || air
    }

    fn dispatch(&mut self, now: Instant) {
        if self
            .capture
            .next_deadline()
            .map_or(false, |at| !at.is_after(now))
        {
            self.capture.on_timer(now);
        }

        while self
            .pending
            .first()
            .map_or(false, |tx| !tx.end().is_after(now))
        {
            let tx = self.pending.remove(0);
            if self.capture.engine_mut().transmit(&tx) {
                self.capture.on_capture(now);
            }
        }

        self.run_idle_loop();
    }

    /// Sends an advertising channel PDU after the previous one, and returns its end.
    fn advertising_tx(&mut self, air: Vec<u8>) -> Instant {
        let now = self.now();
        let free = if self.air_free.is_after(now) {
            self.air_free
        } else {
            now
        };
        let tx = Transmission {
            start: free + Duration::from_micros(100),
            channel: self.sniffer.settings().follow_channel.into(),
            access_address: crate::link::ADVERTISING_ADDRESS,
            air,
        };
        let end = tx.end();
        self.air_free = end;
        self.transmit(tx);
        end
    }

    fn adv_ind(address: [u8; 6]) -> Vec<u8> {
        let mut header = advertising::Header::new(PduType::AdvInd);
        header.set_payload_length(6 + 3);
        let mut pdu = header.to_u16().to_le_bytes().to_vec();
        pdu.extend(address.iter().rev());
        pdu.extend_from_slice(&[0x02, 0x01, 0x06]);
        pdu
    }

    /// Sends an `ADV_IND` from `address` (written order).
    pub fn advertise(&mut self, address: [u8; 6]) {
        let channel = self.sniffer.settings().follow_channel.into();
        let air = air_packet(channel, CRC_PRESET, &Self::adv_ind(address));
        self.advertising_tx(air);
    }

    /// Sends an `ADV_IND` with a broken CRC.
    pub fn corrupted_advertisement(&mut self, address: [u8; 6]) {
        let channel = self.sniffer.settings().follow_channel.into();
        let pdu = Self::adv_ind(address);
        let mut packet = pdu.clone();
        packet.extend_from_slice(&crc::forward_crc(CRC_PRESET, &pdu).to_le_bytes()[..3]);
        let last = packet.len() - 1;
        packet[last] ^= 0x5a;
        whitening::whiten_for_air(&mut packet, channel);
        self.advertising_tx(packet);
    }

    /// Sends a header claiming `length` payload bytes, followed by a few bytes of garbage.
    pub fn malformed_advertisement(&mut self, length: u8) {
        let channel = self.sniffer.settings().follow_channel.into();
        let mut air = vec![0x00, length];
        air.extend_from_slice(&[0xa5; 10]);
        whitening::whiten_for_air(&mut air, channel);
        self.advertising_tx(air);
    }

    /// Sends a `CONNECT_REQ` and returns the connection it announces.
    pub fn connect_request(&mut self, params: &ConnectRequestParams) -> SimConnection {
        let lldata = ConnectRequestData::new(
            params.access_address,
            params.crc_init,
            params.win_size,
            params.win_offset,
            params.interval,
            params.timeout,
            params.channel_map,
            params.hop,
        );

        let mut header = advertising::Header::new(PduType::ConnectReq);
        header.set_payload_length(CONNECT_REQ_PAYLOAD);
        let mut pdu = vec![0; 2 + usize::from(CONNECT_REQ_PAYLOAD)];
        pdu[..2].copy_from_slice(&header.to_u16().to_le_bytes());
        pdu[2..8].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        pdu[8..14].copy_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        lldata
            .to_bytes(&mut ByteWriter::new(&mut pdu[14..]))
            .unwrap();

        let channel = self.sniffer.settings().follow_channel.into();
        let end = self.advertising_tx(air_packet(channel, CRC_PRESET, &pdu));

        SimConnection {
            access_address: params.access_address,
            crc_init: params.crc_init,
            hop: params.hop,
            interval: lldata.interval(),
            channel_map: params.channel_map,
            unmapped: 0,
            anchor: end + lldata.transmit_window_delay() + Duration::from_micros(500),
            counter: 0,
            control: None,
            update: None,
            history: Vec::new(),
        }
    }

    /// Puts an empty PDU into a raw window on the discovery channel and processes it.
    pub fn raw_empty_pdu(&mut self, access_address: u32, crc_init: u32, header: data::Header) {
        let channel = self.sniffer.settings().discovery_channel.into();
        let frame = raw_empty_pdu(access_address, crc_init, header, channel);
        let mut window = [0u8; BUFFER_SIZE];
        put_bits(&mut window, self.raw_offset, &frame);
        self.raw_offset = (self.raw_offset + 131) % 1_500;

        let now = self.now();
        if self.capture.engine_mut().inject_raw(&window, now) {
            self.capture.on_capture(now);
        }
        self.run_idle_loop();
    }
}

/// A connection between two simulated devices.
pub struct SimConnection {
    access_address: u32,
    crc_init: u32,
    hop: u8,
    interval: Duration,
    channel_map: ChannelMap,
    unmapped: u8,
    /// Anchor of the next event.
    anchor: Instant,
    counter: u16,
    /// PDU the master sends in the next event instead of an empty one.
    control: Option<Vec<u8>>,
    /// `(instant, interval, win_offset)` of a pending connection update.
    update: Option<(u16, u16, u16)>,
    history: Vec<u8>,
}

impl SimConnection {
    /// A connection using all data channels whose last event took place on `last` at `anchor`.
    pub fn established(
        access_address: u32,
        crc_init: u32,
        interval: u16,
        hop: u8,
        last: DataChannel,
        anchor: Instant,
    ) -> Self {
        let interval = Duration::from_conn_units(interval);
        Self {
            access_address,
            crc_init,
            hop,
            interval,
            channel_map: ChannelMap::with_all_channels(),
            unmapped: last.index(),
            anchor: anchor + interval,
            counter: 0,
            control: None,
            update: None,
            history: Vec::new(),
        }
    }

    fn hop(&mut self) -> DataChannel {
        if let Some((instant, interval, win_offset)) = self.update {
            if self.counter == instant {
                self.anchor += Duration::from_conn_units(win_offset);
                self.interval = Duration::from_conn_units(interval);
                self.update = None;
            }
        }

        self.unmapped = (self.unmapped + self.hop) % 37;
        let unmapped = DataChannel::new(self.unmapped);
        let channel = self.channel_map.remap(unmapped).unwrap_or(unmapped);
        self.history.push(channel.index());
        channel
    }

    fn empty_pdu(&self) -> Vec<u8> {
        let header = data::Header::EMPTY_PDU_HEADERS[usize::from(self.counter % 4)];
        header.to_u16().to_le_bytes().to_vec()
    }

    /// Runs one connection event: a master packet and the slave's response.
    pub fn run_event(&mut self, sim: &mut Sim) {
        let channel = Channel::from(self.hop());
        let master_pdu = self.control.take().unwrap_or_else(|| self.empty_pdu());
        let master = Transmission {
            start: self.anchor,
            channel,
            access_address: self.access_address,
            air: air_packet(channel, self.crc_init, &master_pdu),
        };
        let slave = Transmission {
            start: master.end() + Duration::T_IFS,
            channel,
            access_address: self.access_address,
            air: air_packet(channel, self.crc_init, &self.empty_pdu()),
        };
        let done = slave.end() + Duration::from_micros(500);

        sim.transmit(master);
        sim.transmit(slave);
        sim.run_until(done);

        self.anchor += self.interval;
        self.counter = self.counter.wrapping_add(1);
    }

    pub fn run_events(&mut self, sim: &mut Sim, count: usize) {
        for _ in 0..count {
            self.run_event(sim);
        }
    }

    /// Runs events until the sniffer reaches `stage`.
    pub fn run_until_stage(&mut self, sim: &mut Sim, stage: StageKind, max_events: usize) {
        for _ in 0..max_events {
            if sim.sniffer.stage() == stage {
                return;
            }
            self.run_event(sim);
        }
        panic!(
            "sniffer still in {:?} after {} events, expected {:?}",
            sim.sniffer.stage(),
            max_events,
            stage
        );
    }

    /// Lets the connection run silently until its next event is after `now`.
    pub fn skip_to(&mut self, now: Instant) {
        let lead = now + Duration::from_micros(1_000);
        while lead.is_after(self.anchor) {
            self.hop();
            self.anchor += self.interval;
            self.counter = self.counter.wrapping_add(1);
        }
    }

    /// Sends `pdu` from the master in the next event, and runs that event.
    pub fn send_control(&mut self, sim: &mut Sim, pdu: &ControlPdu<'_>) {
        let mut payload = [0; 32];
        let mut writer = ByteWriter::new(&mut payload);
        pdu.to_bytes(&mut writer).unwrap();
        let len = 32 - writer.space_left();

        let mut header = data::Header::new(Llid::Control);
        header.set_payload_length(len as u8);
        let mut bytes = header.to_u16().to_le_bytes().to_vec();
        bytes.extend_from_slice(&payload[..len]);
        self.control = Some(bytes);
        self.run_event(sim);
    }

    /// Switches to `interval` at event `instant`, after an extra `win_offset`.
    pub fn update_at(&mut self, instant: u16, interval: u16, win_offset: u16) {
        self.update = Some((instant, interval, win_offset));
    }

    /// Returns the counter of the next event.
    pub fn counter(&self) -> u16 {
        self.counter
    }

    /// Returns the channels of the last `count` events.
    pub fn recent_channels(&self, count: usize) -> Vec<u8> {
        self.history[self.history.len() - count..].to_vec()
    }
}
