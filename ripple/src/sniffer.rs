//! The processing context.
//!
//! The [`Sniffer`] consumes the buffers completed by the [`Capture`] context, one per call to
//! [`poll`]. It dewhitens and CRC-checks every packet, reports it to a [`Sink`], and feeds it to
//! whichever stage is currently active:
//!
//! * In follow mode, the link state machine waits on an advertising channel for a `CONNECT_REQ`
//!   and then tracks the connection it announces.
//! * In promiscuous mode, raw windows are scanned for access addresses, and then the connection's
//!   CRC initialization value, hop interval and hop increment are recovered one after the other
//!   before the connection is followed.
//!
//! Whenever a stage needs the radio somewhere else, a [`Retune`] is posted back to the capture
//! context. The sniffer never touches the radio itself: everything it shares with the capture
//! context goes through its [`ProcessingEnd`] of the handoff.
//!
//! [`Sniffer`]: struct.Sniffer.html
//! [`Capture`]: ../capture/struct.Capture.html
//! [`ProcessingEnd`]: ../capture/handoff/struct.ProcessingEnd.html
//! [`poll`]: struct.Sniffer.html#method.poll
//! [`Sink`]: ../control/trait.Sink.html
//! [`Retune`]: ../capture/enum.Retune.html

use crate::{
    capture::{CancelHandle, CaptureMode, Kind, PacketBuffer, ProcessingEnd, Retune},
    config::{Config, CrcVerifyPolicy, Settings},
    control::{Command, PacketFlags, PacketRecord, Report, Response, Sink},
    crc,
    link::{
        self,
        advertising::{self, Pdu},
        connection::{Action, Connection, EndReason},
        data,
        filter::{AddressFilter, TargetFilter},
        hop::HopSchedule,
        LinkState, ADVERTISING_ADDRESS, CRC_PRESET, CRC_SIZE, HEADER_SIZE,
    },
    phy::{AdvertisingChannel, Channel, DataChannel},
    promisc::{
        Candidate, CrcRecoveryState, Discovery, HopIncrementRecovery, HopIntervalRecovery,
        ProbeResult,
    },
    time::{Duration, Instant, Timer},
    utils::HexSlice,
    Error,
};
use core::mem;
use heapless::{consts::U4, spsc};

/// What the operator asked the sniffer to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    Idle,

    /// Listen on an advertising channel, following connections if `follow` is set.
    Sniff { follow: bool },

    /// Find and follow an already established connection.
    Promiscuous,
}

/// The stage the sniffer is in, without its state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StageKind {
    Idle,
    Discovery,
    CrcRecovery,
    HopIntervalRecovery,
    HopIncrementRecovery,
    ConnectionFollow,
}

/// Result of a call to `Sniffer::poll`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Poll {
    /// A buffer was processed. There might be more.
    Processed,

    /// No buffer was queued.
    Idle,
}

/// Counters maintained by the processing context.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SnifferStats {
    /// Packets that failed the CRC check.
    pub crc_failures: u32,
    /// Advertising packets rejected by the target filter.
    pub filtered: u32,
    /// Times the capture pipeline was found stalled.
    pub stalls: u32,
    /// Connections followed from a `CONNECT_REQ` or recovered parameters.
    pub connections: u32,
}

enum Stage {
    Idle,

    Discovery(Discovery),

    CrcRecovery {
        access_address: u32,
        /// Seed derived from the promoting frame, not yet confirmed.
        crc: Option<CrcRecoveryState>,
        progress: Instant,
    },

    HopIntervalRecovery {
        access_address: u32,
        crc: CrcRecoveryState,
        interval: HopIntervalRecovery,
        progress: Instant,
    },

    HopIncrementRecovery {
        access_address: u32,
        crc: CrcRecoveryState,
        interval: Duration,
        probe: HopIncrementRecovery,
    },

    /// The link state machine is in charge: listening for `CONNECT_REQ`s, or following.
    ConnectionFollow,
}

impl Stage {
    fn kind(&self) -> StageKind {
        match self {
            Stage::Idle => StageKind::Idle,
            Stage::Discovery(_) => StageKind::Discovery,
            Stage::CrcRecovery { .. } => StageKind::CrcRecovery,
            Stage::HopIntervalRecovery { .. } => StageKind::HopIntervalRecovery,
            Stage::HopIncrementRecovery { .. } => StageKind::HopIncrementRecovery,
            Stage::ConnectionFollow => StageKind::ConnectionFollow,
        }
    }
}

/// The processing half of the sniffer.
pub struct Sniffer<'a, C: Config> {
    timer: C::Timer,
    settings: Settings,
    mode: Mode,
    stage: Stage,
    link: Connection,
    crc_verify: bool,
    target: Option<TargetFilter>,
    /// Access address set by the operator.
    pinned: Option<u32>,
    end: ProcessingEnd<'a>,
    /// Schedule changes waiting for the capture context's mailbox.
    outgoing: spsc::Queue<Retune, U4>,
    stats: SnifferStats,
}

impl<'a, C: Config> Sniffer<'a, C> {
    /// Creates an idle sniffer talking to the capture context through `end`.
    pub fn new(timer: C::Timer, settings: Settings, end: ProcessingEnd<'a>) -> Self {
        Self {
            timer,
            settings,
            mode: Mode::Idle,
            stage: Stage::Idle,
            link: Connection::new(),
            crc_verify: false,
            target: None,
            pinned: None,
            end,
            outgoing: spsc::Queue::new(),
            stats: SnifferStats::default(),
        }
    }

    pub fn timer(&self) -> &C::Timer {
        &self.timer
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stage(&self) -> StageKind {
        self.stage.kind()
    }

    /// Returns the link state machine.
    pub fn connection(&self) -> &Connection {
        &self.link
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Returns whether packets failing the CRC check are dropped.
    pub fn crc_verify(&self) -> bool {
        self.crc_verify
    }

    pub fn stats(&self) -> SnifferStats {
        self.stats
    }

    /// Returns a handle through which any context can request that the followed connection is
    /// dropped.
    pub fn cancel_handle(&self) -> CancelHandle<'a> {
        self.end.cancel_handle()
    }

    /// Executes a host command.
    pub fn command<S: Sink>(
        &mut self,
        command: Command,
        sink: &mut S,
    ) -> Result<Response, Error> {
        let now = self.timer.now();
        debug!("command: {:?}", command);

        match command {
            Command::SetChannel(channel) => self.set_channel(channel, now)?,
            Command::Stop => {
                self.mode = Mode::Idle;
                self.stage = Stage::Idle;
                self.link.deactivate();
                self.post(Retune::Stop, now);
            }
            Command::Sniff { follow } => {
                self.mode = Mode::Sniff { follow };
                self.link.listen();
                self.listen_advertising(now);
                self.stage = Stage::ConnectionFollow;
            }
            Command::GetAccessAddress => {
                return self
                    .access_address()
                    .map(Response::AccessAddress)
                    .ok_or(Error::InvalidValue);
            }
            Command::SetAccessAddress(aa) => {
                self.pinned = Some(aa);
                if self.mode == Mode::Promiscuous {
                    self.link.listen();
                    self.stage = self.seed(now);
                }
            }
            Command::GetCrcVerify => return Ok(Response::CrcVerify(self.crc_verify)),
            Command::SetCrcVerify(on) => self.set_crc_verify(on),
            Command::Poll => return Ok(Response::Record(sink.poll())),
            Command::Promiscuous => {
                self.mode = Mode::Promiscuous;
                self.link.listen();
                self.stage = self.seed(now);
            }
            Command::SetTarget(filter) => {
                self.target = if filter.mask_bits() == 0 {
                    None
                } else {
                    Some(filter)
                };
            }
            Command::CancelFollow => self.cancel_follow(sink, now),
        }

        Ok(Response::Ack)
    }

    /// Processes at most one completed buffer and checks all timeouts.
    ///
    /// Must be called repeatedly from the idle loop. Every buffer taken off the queue is returned
    /// to the pool before this returns.
    pub fn poll<S: Sink>(&mut self, sink: &mut S) -> Poll {
        let now = self.timer.now();

        if self.end.take_cancel() {
            self.cancel_follow(sink, now);
        }

        self.flush_outgoing(now);

        let result = match self.end.next_queued() {
            Some(mut id) => {
                let pool = self.end.pool();
                let buffer = pool.get_mut(&mut id);

                let stage = mem::replace(&mut self.stage, Stage::Idle);
                self.stage = match buffer.kind {
                    Kind::Raw => self.on_window(stage, buffer, sink, now),
                    Kind::Packet => self.on_packet(stage, buffer, sink, now),
                };
                self.end.release(id);
                Poll::Processed
            }
            None => Poll::Idle,
        };

        self.check_timeouts(sink, now);
        result
    }

    fn on_window<S: Sink>(
        &mut self,
        stage: Stage,
        buffer: &PacketBuffer,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        match stage {
            Stage::Discovery(mut discovery) => {
                match discovery.scan(buffer.bytes(), buffer.timestamp) {
                    Some(candidate) => self.on_promoted(candidate, buffer.channel, sink, now),
                    None => Stage::Discovery(discovery),
                }
            }
            other => {
                trace!("raw window outside of discovery");
                other
            }
        }
    }

    fn on_promoted<S: Sink>(
        &mut self,
        candidate: Candidate,
        channel: Channel,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        let access_address = candidate.access_address;
        sink.report(Report::AccessAddress(access_address), channel, candidate.timestamp);

        let crc = CrcRecoveryState::from_empty_pdu(&candidate.packet());
        if let Some(crc) = &crc {
            debug!("CRCInit candidate {:#08x}", crc.seed);
        }
        self.listen_data(self.settings.discovery_channel, access_address, now);
        Stage::CrcRecovery {
            access_address,
            crc,
            progress: now,
        }
    }

    fn on_packet<S: Sink>(
        &mut self,
        stage: Stage,
        buffer: &mut PacketBuffer,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        let channel = buffer.channel;
        crate::whitening::dewhiten_received(buffer.bytes_mut(), channel);
        let buffer: &PacketBuffer = buffer;

        let pdu = buffer.bytes();
        if pdu.len() < HEADER_SIZE + CRC_SIZE {
            debug!("runt packet on {:?}: {:?}", channel, HexSlice(pdu));
            return stage;
        }

        let seed = if channel.is_advertising() {
            Some(CRC_PRESET)
        } else {
            self.data_crc_seed(&stage)
        };
        let flags = match seed {
            Some(seed) if crc::check(seed, pdu) => PacketFlags::CRC_CHECKED | PacketFlags::CRC_VALID,
            Some(_) => PacketFlags::CRC_CHECKED,
            None => PacketFlags::empty(),
        };
        let crc_failed = flags == PacketFlags::CRC_CHECKED;
        if crc_failed {
            self.stats.crc_failures += 1;
            if self.crc_verify {
                trace!("dropping packet with bad CRC on {:?}", channel);
                return stage;
            }
        }

        let (header, rest) = pdu.split_at(HEADER_SIZE);
        let payload = &rest[..rest.len() - CRC_SIZE];

        let data_channel = match channel.data_channel() {
            Some(dc) => dc,
            None => {
                return self.on_advertising(stage, header, payload, buffer, flags, sink, now)
            }
        };

        emit(sink, buffer, flags);
        if crc_failed {
            return stage;
        }

        let timestamp = buffer.timestamp;
        match stage {
            Stage::CrcRecovery {
                access_address,
                crc,
                ..
            } => self.recover_crc(access_address, crc, pdu, channel, timestamp, sink, now),
            Stage::HopIntervalRecovery {
                access_address,
                crc,
                mut interval,
                ..
            } => match interval.observe(timestamp) {
                Some(units) => {
                    info!("hop interval {} ({})", units, Duration::from_conn_units(units));
                    sink.report(Report::HopInterval(units), channel, timestamp);
                    self.start_increment_probe(access_address, crc, units, now)
                }
                None => Stage::HopIntervalRecovery {
                    access_address,
                    crc,
                    interval,
                    progress: now,
                },
            },
            Stage::HopIncrementRecovery {
                access_address,
                crc,
                interval,
                mut probe,
            } => {
                let result = probe.on_packet(data_channel, timestamp);
                self.on_probe(result, access_address, crc, interval, probe, sink, now)
            }
            Stage::ConnectionFollow => {
                let header = data::Header::parse(header);
                self.on_data(header, payload, buffer, data_channel, sink, now)
            }
            other => other,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_advertising<S: Sink>(
        &mut self,
        stage: Stage,
        header: &[u8],
        payload: &[u8],
        buffer: &PacketBuffer,
        flags: PacketFlags,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        let header = advertising::Header::parse(header);
        let pdu = Pdu::from_header_and_payload(header, payload);

        if let Some(target) = &self.target {
            let matches = match &pdu {
                Ok(pdu) => target.matches_pdu(pdu),
                Err(_) => false,
            };
            if !matches {
                self.stats.filtered += 1;
                return stage;
            }
        }

        emit(sink, buffer, flags);

        let lldata = match pdu {
            Ok(Pdu::ConnectRequest { lldata, .. }) => lldata,
            Ok(_) => return stage,
            Err(e) => {
                trace!("unparseable advertising PDU ({}): {:?}", e, header);
                return stage;
            }
        };

        let following = self.mode == Mode::Sniff { follow: true }
            && self.link.state() == LinkState::Listening;
        if !following || !flags.contains(PacketFlags::CRC_VALID) {
            return stage;
        }

        let end = buffer.timestamp + Duration::from_micros(link::packet_duration_micros(buffer.size()));
        match self.link.on_connect_request(&lldata, end) {
            Ok(schedule) => {
                self.stats.connections += 1;
                self.post(Retune::Follow(schedule), now);
            }
            Err(e) => debug!("ignoring CONNECT_REQ: {}", e),
        }
        stage
    }

    #[allow(clippy::too_many_arguments)]
    fn on_data<S: Sink>(
        &mut self,
        header: data::Header,
        payload: &[u8],
        buffer: &PacketBuffer,
        channel: DataChannel,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        let pending = self.link.state() == LinkState::ConnPending;
        match self
            .link
            .on_data(header, payload, buffer.event, channel, buffer.timestamp)
        {
            Action::None => {}
            Action::Update(update) => {
                let event = buffer.event.counter;
                self.post(Retune::Update { update, event }, now)
            }
            Action::Ended(reason) => return self.link_lost(reason, sink, now),
        }

        if pending
            && self.link.state() == LinkState::Connected
            && self.settings.crc_policy == CrcVerifyPolicy::OnConnected
        {
            self.set_crc_verify(true);
        }
        Stage::ConnectionFollow
    }

    #[allow(clippy::too_many_arguments)]
    fn recover_crc<S: Sink>(
        &mut self,
        access_address: u32,
        crc: Option<CrcRecoveryState>,
        packet: &[u8],
        channel: Channel,
        timestamp: Instant,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        let mut state = match crc {
            Some(state) => state,
            None => {
                return Stage::CrcRecovery {
                    access_address,
                    crc: CrcRecoveryState::from_empty_pdu(packet),
                    progress: now,
                };
            }
        };

        if !state.confirm(packet) {
            debug!("CRCInit {:#08x} not confirmed", state.seed);
            // the promoting frame may have been corrupted, start over from this packet
            return Stage::CrcRecovery {
                access_address,
                crc: CrcRecoveryState::from_empty_pdu(packet).or(Some(state)),
                progress: now,
            };
        }

        info!(
            "CRCInit {:#08x} confirmed for AA {:#010x}",
            state.seed, access_address
        );
        sink.report(Report::CrcInit(state.seed), channel, timestamp);
        if self.settings.crc_policy == CrcVerifyPolicy::OnSeedRecovered {
            self.set_crc_verify(true);
        }

        let mut interval = HopIntervalRecovery::new(self.settings.interval_convergence);
        interval.observe(timestamp);
        Stage::HopIntervalRecovery {
            access_address,
            crc: state,
            interval,
            progress: now,
        }
    }

    fn start_increment_probe(
        &mut self,
        access_address: u32,
        crc: CrcRecoveryState,
        units: u16,
        now: Instant,
    ) -> Stage {
        let interval = Duration::from_conn_units(units);
        let probe = HopIncrementRecovery::new(interval, self.settings.probe_attempts, now);
        self.listen_data(HopIncrementRecovery::first_channel(), access_address, now);
        Stage::HopIncrementRecovery {
            access_address,
            crc,
            interval,
            probe,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_probe<S: Sink>(
        &mut self,
        result: ProbeResult,
        access_address: u32,
        crc: CrcRecoveryState,
        interval: Duration,
        probe: HopIncrementRecovery,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        match result {
            ProbeResult::Pending => {}
            ProbeResult::Retune(channel) => self.listen_data(channel, access_address, now),
            ProbeResult::Found {
                increment,
                channel,
                anchor,
            } => {
                sink.report(Report::HopIncrement(increment), channel.into(), anchor);
                let schedule = HopSchedule::recovered(
                    access_address,
                    crc.seed,
                    increment,
                    interval,
                    channel,
                    anchor,
                );
                self.link.on_recovered(&schedule, now);
                self.stats.connections += 1;
                self.post(Retune::Follow(schedule), now);
                return Stage::ConnectionFollow;
            }
            ProbeResult::Inconclusive => {
                warn!(
                    "no hop increment after {} attempts, starting over",
                    probe.attempts()
                );
                return self.seed(now);
            }
        }

        Stage::HopIncrementRecovery {
            access_address,
            crc,
            interval,
            probe,
        }
    }

    fn check_timeouts<S: Sink>(
        &mut self,
        sink: &mut S,
        now: Instant,
    ) {
        let settings = self.settings;
        let stage = mem::replace(&mut self.stage, Stage::Idle);
        self.stage = match stage {
            Stage::Discovery(mut discovery) => {
                if discovery.is_timed_out(now, settings.discovery_timeout) {
                    info!(
                        "no access address found in {}, restarting discovery",
                        settings.discovery_timeout
                    );
                    discovery.reset();
                }
                Stage::Discovery(discovery)
            }
            Stage::CrcRecovery { progress, .. } | Stage::HopIntervalRecovery { progress, .. }
                if now.is_after(progress + settings.recovery_timeout) =>
            {
                info!("recovery made no progress, starting over");
                self.seed(now)
            }
            Stage::HopIncrementRecovery {
                access_address,
                crc,
                interval,
                mut probe,
            } => {
                let result = probe.check_timeout(now);
                self.on_probe(result, access_address, crc, interval, probe, sink, now)
            }
            Stage::ConnectionFollow if self.link.is_timed_out(now, settings.inactivity_timeout) => {
                self.link_lost(EndReason::Timeout, sink, now)
            }
            other => other,
        };

        if !self.end.has_pending_retune() && self.end.is_stalled(now, settings.stall_timeout) {
            warn!("capture stalled on {:?}, relocking", self.end.channel());
            self.stats.stalls += 1;
            self.post(Retune::Relock, now);
        }
    }

    /// Handles the end of the followed connection and decides where to go next.
    fn link_lost<S: Sink>(
        &mut self,
        reason: EndReason,
        sink: &mut S,
        now: Instant,
    ) -> Stage {
        self.set_crc_verify(false);
        sink.report(Report::ConnectionLost, self.end.channel(), now);

        let single_target = self.settings.single_target
            || (self.mode == Mode::Promiscuous && self.pinned.is_some());
        if single_target || self.mode == Mode::Idle {
            self.link.end(reason, LinkState::Inactive);
            self.mode = Mode::Idle;
            self.post(Retune::Stop, now);
            return Stage::Idle;
        }

        self.link.end(reason, LinkState::Listening);
        match self.mode {
            Mode::Promiscuous => self.seed(now),
            _ => {
                self.listen_advertising(now);
                Stage::ConnectionFollow
            }
        }
    }

    fn cancel_follow<S: Sink>(
        &mut self,
        sink: &mut S,
        now: Instant,
    ) {
        let stage = mem::replace(&mut self.stage, Stage::Idle);
        self.stage = match (self.link.state(), stage) {
            (LinkState::ConnPending, _) | (LinkState::Connected, _) => {
                self.link_lost(EndReason::Cancelled, sink, now)
            }
            (_, stage @ Stage::Idle)
            | (_, stage @ Stage::Discovery(_))
            | (_, stage @ Stage::ConnectionFollow) => stage,
            (_, _) => {
                info!("recovery cancelled");
                self.seed(now)
            }
        };
    }

    /// Starts promiscuous mode over: discovery, or CRC recovery if the access address is pinned.
    fn seed(&mut self, now: Instant) -> Stage {
        let channel = self.settings.discovery_channel;
        match self.pinned {
            Some(access_address) => {
                info!("recovering AA {:#010x} on {:?}", access_address, channel);
                self.listen_data(channel, access_address, now);
                Stage::CrcRecovery {
                    access_address,
                    crc: None,
                    progress: now,
                }
            }
            None => {
                info!("scanning {:?} for access addresses", channel);
                let retune = Retune::Listen {
                    channel: channel.into(),
                    mode: CaptureMode::Raw,
                };
                self.post(retune, now);
                Stage::Discovery(Discovery::new(
                    channel,
                    self.settings.promotion_threshold,
                ))
            }
        }
    }

    fn set_channel(
        &mut self,
        channel: Channel,
        now: Instant,
    ) -> Result<(), Error> {
        match channel.data_channel() {
            None => {
                self.settings.follow_channel = AdvertisingChannel::new(channel.index())?;
                if let Mode::Sniff { .. } = self.mode {
                    if self.link.state() == LinkState::Listening {
                        self.listen_advertising(now);
                    }
                }
            }
            Some(data_channel) => {
                self.settings.discovery_channel = data_channel;
                if self.mode == Mode::Promiscuous {
                    match self.stage.kind() {
                        StageKind::Discovery
                        | StageKind::CrcRecovery
                        | StageKind::HopIntervalRecovery => self.stage = self.seed(now),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn set_crc_verify(&mut self, on: bool) {
        if on != self.crc_verify {
            info!("CRC verification {}", if on { "enabled" } else { "disabled" });
            self.crc_verify = on;
        }
    }

    /// Returns the access address being recovered or followed.
    fn access_address(&self) -> Option<u32> {
        match &self.stage {
            Stage::CrcRecovery { access_address, .. }
            | Stage::HopIntervalRecovery { access_address, .. }
            | Stage::HopIncrementRecovery { access_address, .. } => Some(*access_address),
            _ => self
                .link
                .params()
                .map(|conn| conn.access_address())
                .or(self.pinned),
        }
    }

    /// Returns the CRC initialization value data channel packets are checked with.
    fn data_crc_seed(&self, stage: &Stage) -> Option<u32> {
        match stage {
            Stage::HopIntervalRecovery { crc, .. } | Stage::HopIncrementRecovery { crc, .. } => {
                Some(crc.seed)
            }
            Stage::ConnectionFollow => self.link.params().map(|conn| conn.crc_init()),
            _ => None,
        }
    }

    fn listen_advertising(&mut self, now: Instant) {
        let retune = Retune::Listen {
            channel: self.settings.follow_channel.into(),
            mode: CaptureMode::Packet {
                access_address: ADVERTISING_ADDRESS,
            },
        };
        self.post(retune, now);
    }

    fn listen_data(
        &mut self,
        channel: DataChannel,
        access_address: u32,
        now: Instant,
    ) {
        let retune = Retune::Listen {
            channel: channel.into(),
            mode: CaptureMode::Packet { access_address },
        };
        self.post(retune, now);
    }

    /// Sends a schedule change to the capture context.
    ///
    /// Changes that replace the whole schedule supersede everything not yet picked up.
    fn post(&mut self, retune: Retune, now: Instant) {
        if let Retune::Stop | Retune::Listen { .. } | Retune::Follow(_) = retune {
            while self.outgoing.dequeue().is_some() {}
        }

        if self.outgoing.is_empty() && !self.end.has_pending_retune() {
            // the mailbox is empty, so this cannot fail
            let _ = self.end.post(retune, now);
        } else if let Err(retune) = self.outgoing.enqueue(retune) {
            warn!("too many schedule changes, dropping {:?}", retune);
        }
    }

    fn flush_outgoing(&mut self, now: Instant) {
        while !self.end.has_pending_retune() {
            match self.outgoing.dequeue() {
                Some(retune) => {
                    let _ = self.end.post(retune, now);
                }
                None => break,
            }
        }
    }
}

fn emit<S: Sink>(sink: &mut S, buffer: &PacketBuffer, flags: PacketFlags) {
    sink.packet(&PacketRecord {
        channel: buffer.channel,
        timestamp: buffer.timestamp,
        access_address: buffer.access_address,
        rssi: buffer.rssi(),
        flags,
        pdu: HexSlice(buffer.bytes()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        control::{Request, Sink},
        link::{
            channel_map::ChannelMap,
            data::Header,
            llcp::{ConnectionUpdateData, ControlPdu},
        },
        sim::*,
        utils::Hex,
    };

    const AA: u32 = 0x50b3_9a3c;
    const CRC_INIT: u32 = 0x6b_1f2a;

    fn follow(settings: Settings) -> Sim {
        let mut sim = Sim::new(settings);
        sim.command(Command::Sniff { follow: true }).unwrap();
        sim.run_for(Duration::from_millis(1));
        sim
    }

    /// A connection with a 7.5 ms interval, hop increment 7 and all channels used.
    fn connection(timeout: u16) -> ConnectRequestParams {
        ConnectRequestParams {
            access_address: AA,
            crc_init: CRC_INIT,
            win_size: 2,
            win_offset: 1,
            interval: 6,
            timeout,
            channel_map: ChannelMap::with_all_channels(),
            hop: 7,
        }
    }

    #[test]
    fn follows_connection_from_connect_request() {
        let mut sim = follow(Settings::default());
        assert_eq!(sim.sniffer.link_state(), LinkState::Listening);
        assert_eq!(sim.capture.channel(), Channel::new(37).unwrap());

        let mut conn = sim.connect_request(&connection(100));
        sim.run_for(Duration::from_millis(1));
        assert_eq!(sim.sniffer.link_state(), LinkState::ConnPending);

        conn.run_events(&mut sim, 40);
        assert_eq!(sim.sniffer.link_state(), LinkState::Connected);

        let channels = sim.sink.data_channels();
        let expected: Vec<u8> = (1..=40u32).map(|k| ((k * 7) % 37) as u8).collect();
        // master and slave packet of each event
        let masters: Vec<u8> = channels.iter().step_by(2).copied().collect();
        assert_eq!(masters, expected);
        assert_eq!(channels.len(), 80);
        assert!(sim.sink.packets.iter().all(|p| p.crc_valid));
        assert_eq!(sim.capture.stats().discarded, 0);
    }

    #[test]
    fn connection_update_is_followed() {
        let mut sim = follow(Settings::default());
        let mut conn = sim.connect_request(&connection(100));
        conn.run_events(&mut sim, 5);

        // switch to a 10 ms interval at event 10
        let update = ControlPdu::ConnectionUpdateReq(ConnectionUpdateData::new(1, 0, 8, 0, 100, 10));
        conn.send_control(&mut sim, &update);
        conn.update_at(10, 8, 0);
        conn.run_events(&mut sim, 20);

        assert_eq!(sim.sniffer.link_state(), LinkState::Connected);
        let schedule = sim.capture.schedule().expect("following");
        assert_eq!(schedule.interval(), Duration::from_millis(10));
        // every event after the update was still caught
        assert_eq!(sim.sink.data_channels().len(), 2 * 26);
    }

    #[test]
    fn inactivity_returns_to_listening_and_clears_crc_verify() {
        let mut sim = follow(Settings::default());
        sim.command(Command::SetCrcVerify(true)).unwrap();
        let mut conn = sim.connect_request(&connection(3200));
        conn.run_events(&mut sim, 10);
        assert_eq!(sim.sniffer.link_state(), LinkState::Connected);

        // the connection goes silent
        sim.run_for(Duration::from_millis(4_900));
        assert_eq!(sim.sniffer.link_state(), LinkState::Connected);
        sim.run_for(Duration::from_millis(200));

        assert_eq!(sim.sniffer.link_state(), LinkState::Listening);
        assert!(!sim.sniffer.crc_verify());
        assert_eq!(sim.sink.reports.last().map(|r| r.0), Some(Report::ConnectionLost));
        assert!(sim.capture.schedule().is_none());
        assert_eq!(sim.capture.channel(), Channel::new(37).unwrap());
        assert_eq!(
            sim.command(Command::GetCrcVerify),
            Ok(Response::CrcVerify(false))
        );
    }

    #[test]
    fn single_target_goes_inactive() {
        let settings = Settings {
            single_target: true,
            ..Settings::default()
        };
        let mut sim = follow(settings);
        let mut conn = sim.connect_request(&connection(50));
        conn.run_events(&mut sim, 10);

        // supervision timeout of 500 ms is shorter than the inactivity timeout
        sim.run_for(Duration::from_millis(600));
        assert_eq!(sim.sniffer.link_state(), LinkState::Inactive);
        assert_eq!(sim.sniffer.mode(), Mode::Idle);
        assert!(!sim.capture.is_active());
    }

    #[test]
    fn terminate_ind_ends_connection() {
        let mut sim = follow(Settings::default());
        let mut conn = sim.connect_request(&connection(100));
        conn.run_events(&mut sim, 3);
        conn.send_control(
            &mut sim,
            &ControlPdu::TerminateInd {
                error_code: Hex(0x13),
            },
        );
        sim.run_for(Duration::from_millis(1));
        assert_eq!(sim.sniffer.link_state(), LinkState::Listening);
        assert_eq!(sim.sink.reports.last().map(|r| r.0), Some(Report::ConnectionLost));
    }

    #[test]
    fn cancel_is_observed_within_one_poll() {
        let mut sim = follow(Settings::default());
        let cancel = sim.sniffer.cancel_handle();
        let mut conn = sim.connect_request(&connection(100));
        conn.run_events(&mut sim, 3);
        assert_eq!(sim.sniffer.link_state(), LinkState::Connected);

        cancel.cancel();
        assert_eq!(sim.poll(), Poll::Idle);
        assert_eq!(sim.sniffer.link_state(), LinkState::Listening);
        assert_eq!(sim.capture.buffers_owned_by(crate::capture::Owner::Queued), 0);
    }

    #[test]
    fn cancel_while_buffers_are_queued_leaks_nothing() {
        let mut sim = follow(Settings::default());
        let mut conn = sim.connect_request(&connection(100));
        conn.run_events(&mut sim, 3);

        // fill the queue without letting the processing context run
        sim.pause_polling(true);
        conn.run_events(&mut sim, 2);
        assert!(sim.capture.buffers_owned_by(crate::capture::Owner::Queued) > 0);

        sim.sniffer.cancel_handle().cancel();
        sim.pause_polling(false);
        while sim.poll() == Poll::Processed {}
        assert_eq!(sim.sniffer.link_state(), LinkState::Listening);
        assert_eq!(sim.capture.buffers_owned_by(crate::capture::Owner::Queued), 0);
        assert_eq!(
            sim.capture.buffers_owned_by(crate::capture::Owner::Free),
            crate::capture::POOL_SIZE - 1
        );
    }

    #[test]
    fn target_filter_restricts_advertising() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Sniff { follow: false }).unwrap();
        let filter = Command::parse(
            Request::BtleSetTarget,
            0,
            &[0xc0, 0xff, 0xee, 0x00, 0x00, 0x00, 24],
        )
        .unwrap();
        sim.command(filter).unwrap();
        sim.run_for(Duration::from_millis(1));

        sim.advertise([0xc0, 0xff, 0xee, 0x12, 0x34, 0x56]);
        sim.advertise([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        sim.run_for(Duration::from_millis(5));

        assert_eq!(sim.sink.packets.len(), 1);
        assert_eq!(sim.sniffer.stats().filtered, 1);
    }

    #[test]
    fn connect_request_ignored_without_follow() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Sniff { follow: false }).unwrap();
        sim.run_for(Duration::from_millis(1));
        sim.connect_request(&connection(100));
        sim.run_for(Duration::from_millis(5));
        assert_eq!(sim.sniffer.link_state(), LinkState::Listening);
        assert_eq!(sim.sink.packets.len(), 1);
    }

    #[test]
    fn invalid_length_is_dropped_and_next_packet_framed() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Sniff { follow: false }).unwrap();
        sim.run_for(Duration::from_millis(1));

        sim.malformed_advertisement(60);
        sim.run_for(Duration::from_millis(2));
        sim.advertise([1, 2, 3, 4, 5, 6]);
        sim.run_for(Duration::from_millis(2));

        assert_eq!(sim.capture.stats().malformed, 1);
        assert_eq!(sim.sink.packets.len(), 1);
        let packet = &sim.sink.packets[0];
        assert!(packet.crc_valid);
        assert_eq!(packet.pdu.len(), 2 + 6 + 3 + 3);
    }

    #[test]
    fn crc_verify_drops_bad_packets() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Sniff { follow: false }).unwrap();
        sim.run_for(Duration::from_millis(1));

        sim.corrupted_advertisement([1, 2, 3, 4, 5, 6]);
        sim.run_for(Duration::from_millis(2));
        assert_eq!(sim.sink.packets.len(), 1);
        assert!(!sim.sink.packets[0].crc_valid);

        sim.command(Command::SetCrcVerify(true)).unwrap();
        sim.corrupted_advertisement([1, 2, 3, 4, 5, 6]);
        sim.run_for(Duration::from_millis(2));
        assert_eq!(sim.sink.packets.len(), 1);
        assert_eq!(sim.sniffer.stats().crc_failures, 2);
    }

    #[test]
    fn promiscuous_recovers_and_follows() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Promiscuous).unwrap();
        sim.run_for(Duration::from_millis(1));
        assert_eq!(sim.sniffer.stage(), StageKind::Discovery);

        let mut conn = SimConnection::established(AA, CRC_INIT, 6, 7, DataChannel::new(3), sim.now());

        // sightings of the access address on the discovery channel
        for _ in 0..4 {
            sim.raw_empty_pdu(AA, CRC_INIT, Header::EMPTY_PDU_HEADERS[1]);
            sim.run_for(Duration::from_millis(3));
        }
        assert_eq!(sim.sniffer.stage(), StageKind::CrcRecovery);
        assert_eq!(
            sim.command(Command::GetAccessAddress),
            Ok(Response::AccessAddress(AA))
        );

        conn.skip_to(sim.now());
        conn.run_until_stage(&mut sim, StageKind::ConnectionFollow, 4_000);
        conn.run_events(&mut sim, 40);

        let reports: Vec<Report> = sim.sink.reports.iter().map(|r| r.0).collect();
        assert_eq!(
            reports,
            vec![
                Report::AccessAddress(AA),
                Report::CrcInit(CRC_INIT),
                Report::HopInterval(6),
                Report::HopIncrement(7),
            ]
        );
        assert_eq!(sim.sniffer.link_state(), LinkState::Connected);

        // the last 40 events were all caught, on the connection's channels
        let channels = sim.sink.data_channels();
        let tail = &channels[channels.len() - 80..];
        let expected = conn.recent_channels(40);
        let masters: Vec<u8> = tail.iter().step_by(2).copied().collect();
        assert_eq!(masters, expected);
    }

    #[test]
    fn recovered_connection_follows_update() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Promiscuous).unwrap();
        sim.run_for(Duration::from_millis(1));

        let mut conn =
            SimConnection::established(AA, CRC_INIT, 6, 7, DataChannel::new(3), sim.now());
        for _ in 0..4 {
            sim.raw_empty_pdu(AA, CRC_INIT, Header::EMPTY_PDU_HEADERS[1]);
            sim.run_for(Duration::from_millis(3));
        }
        conn.skip_to(sim.now());
        conn.run_until_stage(&mut sim, StageKind::ConnectionFollow, 4_000);
        conn.run_events(&mut sim, 10);
        let schedule = sim.capture.schedule().expect("following");
        assert!(!schedule.is_counter_synced());

        // 10 ms interval, 2.5 ms later, 8 events after the request
        let instant = conn.counter().wrapping_add(8);
        let data = ConnectionUpdateData::new(1, 2, 8, 0, 100, instant);
        conn.send_control(&mut sim, &ControlPdu::ConnectionUpdateReq(data));
        conn.update_at(instant, 8, 2);
        conn.run_events(&mut sim, 30);

        assert_eq!(sim.sniffer.link_state(), LinkState::Connected);
        let schedule = sim.capture.schedule().expect("following");
        assert_eq!(schedule.interval(), Duration::from_millis(10));
        assert!(schedule.is_counter_synced());
        assert_eq!(schedule.event_counter(), conn.counter());

        let params = sim.sniffer.connection().params().expect("connected");
        assert_eq!(params.interval(), Duration::from_millis(10));
        assert_eq!(params.event_counter(), Some(conn.counter().wrapping_sub(1)));

        // the events after the instant were all caught, on the connection's channels
        let channels = sim.sink.data_channels();
        let tail = &channels[channels.len() - 40..];
        let masters: Vec<u8> = tail.iter().step_by(2).copied().collect();
        assert_eq!(masters, conn.recent_channels(20));
    }

    #[test]
    fn pinned_access_address_skips_discovery() {
        let mut sim = Sim::new(Settings {
            crc_policy: CrcVerifyPolicy::OnSeedRecovered,
            ..Settings::default()
        });
        sim.command(Command::SetAccessAddress(AA)).unwrap();
        sim.command(Command::Promiscuous).unwrap();
        sim.run_for(Duration::from_millis(1));
        assert_eq!(sim.sniffer.stage(), StageKind::CrcRecovery);

        let mut conn = SimConnection::established(AA, CRC_INIT, 6, 7, DataChannel::new(3), sim.now());
        conn.run_until_stage(&mut sim, StageKind::HopIntervalRecovery, 2_000);
        assert!(sim.sniffer.crc_verify());
        assert_eq!(
            sim.sink.reports.iter().map(|r| r.0).collect::<Vec<_>>(),
            vec![Report::CrcInit(CRC_INIT)]
        );
    }

    #[test]
    fn discovery_restarts_after_timeout() {
        let settings = Settings {
            discovery_timeout: Duration::from_millis(100),
            ..Settings::default()
        };
        let mut sim = Sim::new(settings);
        sim.command(Command::Promiscuous).unwrap();
        sim.run_for(Duration::from_millis(1));

        for _ in 0..3 {
            sim.raw_empty_pdu(AA, CRC_INIT, Header::EMPTY_PDU_HEADERS[0]);
            sim.run_for(Duration::from_millis(3));
        }
        sim.run_for(Duration::from_millis(150));

        // the cache was cleared, so one more sighting does not promote
        sim.raw_empty_pdu(AA, CRC_INIT, Header::EMPTY_PDU_HEADERS[0]);
        sim.run_for(Duration::from_millis(3));
        assert_eq!(sim.sniffer.stage(), StageKind::Discovery);
    }

    #[test]
    fn stalled_raw_capture_is_relocked() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Promiscuous).unwrap();
        sim.run_for(Duration::from_millis(1_500));
        assert!(sim.sniffer.stats().stalls >= 1);
        assert!(sim.capture.engine().retunes() >= 2);
    }

    #[test]
    fn poll_command_returns_queued_records() {
        let mut sim = Sim::new(Settings::default());
        sim.command(Command::Sniff { follow: false }).unwrap();
        sim.run_for(Duration::from_millis(1));
        sim.advertise([1, 2, 3, 4, 5, 6]);
        sim.run_for(Duration::from_millis(2));

        let mut outbox = crate::control::Outbox::new();
        for packet in &sim.sink.packets {
            outbox.packet(&packet.record());
        }
        let response = sim
            .sniffer
            .command(Command::Poll, &mut outbox)
            .unwrap();
        match response {
            Response::Record(Some(record)) => {
                assert_eq!(record.record_type(), crate::control::RecordType::LePacket)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            sim.sniffer.command(Command::Poll, &mut outbox),
            Ok(Response::Record(None))
        );
    }

    #[test]
    fn set_channel_moves_follow_channel() {
        let mut sim = follow(Settings::default());
        sim.command(Command::SetChannel(Channel::new(39).unwrap())).unwrap();
        sim.run_for(Duration::from_millis(1));
        assert_eq!(sim.capture.channel(), Channel::new(39).unwrap());
        assert_eq!(sim.sniffer.settings().follow_channel.index(), 39);
    }
}
