//! The passive link state machine.
//!
//! A [`Connection`] tracks the state of a connection from the point of view of an observer: it is
//! created from the `CONNECT_REQ` sent by the initiator (or from recovered parameters), sees the
//! connection's first packet, interprets the LL Control PDUs that change the hopping schedule, and
//! notices when the connection goes away.
//!
//! It runs in the processing context. The actual hop clock is the [`HopSchedule`] owned by the
//! capture context; the `Connection` only keeps a mirror of the parameters for reporting and for
//! deciding when the link is lost. The mirror does not evaluate instants itself: it commits an
//! update once the [`EventStamp`]s of captured packets show that the schedule has applied it, and
//! it only reports an event counter once the schedule's counter is synced.
//!
//! ```notrust
//! Inactive -> Listening -> ConnPending -> Connected -> (timeout, terminate, cancel)
//!                ^                                              |
//!                +----------------------------------------------+
//! ```
//!
//! [`Connection`]: struct.Connection.html
//! [`HopSchedule`]: ../hop/struct.HopSchedule.html
//! [`EventStamp`]: ../hop/struct.EventStamp.html

use crate::{
    bytes::*,
    crc,
    link::{
        advertising::ConnectRequestData,
        channel_map::ChannelMap,
        data::{Header, Llid},
        hop::{EventStamp, HopSchedule, LlcpUpdate},
        llcp::{ConnectionUpdateData, ControlPdu},
        LinkState,
    },
    phy::DataChannel,
    time::{Duration, Instant},
    utils::Hex,
    Error,
};

/// Why a followed connection ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// No packet was seen for the supervision or inactivity timeout.
    Timeout,

    /// One side sent `LL_TERMINATE_IND` with the given error code.
    Terminated(u8),

    /// The operator cancelled following.
    Cancelled,
}

/// What the caller has to do after a data channel packet was processed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    None,

    /// Forward an update to the capture context's hop schedule.
    Update(LlcpUpdate),

    /// The connection is over.
    Ended(EndReason),
}

/// Parameters of the connection being followed.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    access_address: Hex<u32>,
    crc_init: Hex<u32>,
    /// `crc_init` with its 24 bits in reverse order, as the CRC LFSR consumes it.
    crc_init_reversed: Hex<u32>,
    hop: u8,
    channel: Option<DataChannel>,
    interval: Duration,
    win_size: Duration,
    win_offset: Duration,
    supervision_timeout: Duration,
    channel_map: ChannelMap,

    /// Counter of the event the last packet was captured in, once known.
    event_counter: Option<u16>,

    /// Time of the connection's first packet.
    epoch: Option<Instant>,

    /// Time of the most recent packet (or of the `CONNECT_REQ` while pending).
    last_packet: Instant,

    /// Pending updates, with the number of updates of their kind the schedule had applied when
    /// they were seen.
    pending_connection: Option<(ConnectionUpdateData, u8)>,
    pending_map: Option<(ChannelMap, u16, u8)>,
}

impl ConnectionState {
    fn new(
        access_address: u32,
        crc_init: u32,
        hop: u8,
        interval: Duration,
        supervision_timeout: Duration,
        channel_map: ChannelMap,
        last_packet: Instant,
    ) -> Self {
        Self {
            access_address: Hex(access_address),
            crc_init: Hex(crc_init),
            crc_init_reversed: Hex(crc::reverse_bits24(crc_init)),
            hop,
            channel: None,
            interval,
            win_size: Duration::from_micros(0),
            win_offset: Duration::from_micros(0),
            supervision_timeout,
            channel_map,
            event_counter: None,
            epoch: None,
            last_packet,
            pending_connection: None,
            pending_map: None,
        }
    }

    pub fn access_address(&self) -> u32 {
        self.access_address.0
    }

    pub fn crc_init(&self) -> u32 {
        self.crc_init.0
    }

    pub fn crc_init_reversed(&self) -> u32 {
        self.crc_init_reversed.0
    }

    pub fn hop(&self) -> u8 {
        self.hop
    }

    /// Returns the data channel of the most recent packet.
    pub fn channel(&self) -> Option<DataChannel> {
        self.channel
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the transmit window size and offset of the most recent (re)connection.
    pub fn transmit_window(&self) -> (Duration, Duration) {
        (self.win_size, self.win_offset)
    }

    pub fn supervision_timeout(&self) -> Duration {
        self.supervision_timeout
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Returns the connection event counter of the most recent packet.
    ///
    /// `None` for a recovered connection until an update has synced the counter.
    pub fn event_counter(&self) -> Option<u16> {
        self.event_counter
    }

    pub fn epoch(&self) -> Option<Instant> {
        self.epoch
    }

    pub fn last_packet(&self) -> Instant {
        self.last_packet
    }

    /// Returns whether an update is waiting to be applied.
    pub fn has_pending_update(&self) -> bool {
        self.pending_connection.is_some() || self.pending_map.is_some()
    }

    fn is_pending(&self, update: &LlcpUpdate) -> bool {
        match *update {
            LlcpUpdate::Connection(data) => {
                self.pending_connection.map(|(pending, _)| pending) == Some(data)
            }
            LlcpUpdate::ChannelMap { map, instant } => self
                .pending_map
                .map_or(false, |(pending, at, _)| pending == map && at == instant),
        }
    }

    fn set_pending(&mut self, update: LlcpUpdate, stamp: EventStamp) {
        match update {
            LlcpUpdate::Connection(data) => {
                self.pending_connection = Some((data, stamp.connection_updates))
            }
            LlcpUpdate::ChannelMap { map, instant } => {
                self.pending_map = Some((map, instant, stamp.map_updates))
            }
        }
    }

    /// Applies pending updates to the mirrored parameters once `stamp` shows that the schedule has
    /// applied them.
    fn commit_pending(&mut self, stamp: EventStamp) {
        if let Some((data, seen)) = self.pending_connection {
            if stamp.connection_updates != seen {
                self.pending_connection = None;
                self.interval = data.interval();
                self.supervision_timeout = data.timeout();
                self.win_size = data.win_size();
                self.win_offset = data.win_offset();
                debug!("committed connection update at event {:?}", self.event_counter);
            }
        }

        if let Some((map, _, seen)) = self.pending_map {
            if stamp.map_updates != seen {
                self.pending_map = None;
                self.channel_map = map;
                debug!("committed channel map update at event {:?}", self.event_counter);
            }
        }
    }
}

/// Passive link state machine.
pub struct Connection {
    state: LinkState,
    conn: Option<ConnectionState>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: LinkState::Inactive,
            conn: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Returns the parameters of the connection, unless `Inactive` or `Listening`.
    pub fn params(&self) -> Option<&ConnectionState> {
        self.conn.as_ref()
    }

    /// Starts waiting for a connection.
    pub fn listen(&mut self) {
        self.conn = None;
        self.set_state(LinkState::Listening);
    }

    /// Stops tracking any connection.
    pub fn deactivate(&mut self) {
        self.conn = None;
        self.set_state(LinkState::Inactive);
    }

    /// Handles a `CONNECT_REQ` seen while listening.
    ///
    /// `request_end` is the time the `CONNECT_REQ` packet ended. Returns the hop schedule the
    /// capture context has to follow, or an error if the request is out of place or carries
    /// invalid parameters.
    pub fn on_connect_request(
        &mut self,
        lldata: &ConnectRequestData,
        request_end: Instant,
    ) -> Result<HopSchedule, Error> {
        if self.state != LinkState::Listening {
            return Err(Error::InvalidValue);
        }
        lldata.validate()?;

        let mut conn = ConnectionState::new(
            lldata.access_address(),
            lldata.crc_init(),
            lldata.hop(),
            lldata.interval(),
            lldata.supervision_timeout(),
            *lldata.channel_map(),
            request_end,
        );
        conn.win_size = lldata.win_size();
        conn.win_offset = lldata.win_offset();

        info!(
            "CONNECT_REQ: AA {:#010x}, CRCInit {:#08x}, interval {}, hop {}, map {}",
            lldata.access_address(),
            lldata.crc_init(),
            lldata.interval(),
            lldata.hop(),
            lldata.channel_map()
        );
        self.conn = Some(conn);
        self.set_state(LinkState::ConnPending);
        Ok(HopSchedule::from_connect_request(lldata, request_end))
    }

    /// Enters `ConnPending` for a connection whose parameters were recovered from the air.
    ///
    /// The connection's event counter is unknown until the schedule syncs it.
    pub fn on_recovered(&mut self, schedule: &HopSchedule, now: Instant) {
        self.conn = Some(ConnectionState::new(
            schedule.access_address(),
            schedule.crc_init(),
            schedule.hop(),
            schedule.interval(),
            schedule.supervision_timeout(),
            *schedule.channel_map(),
            now,
        ));
        self.set_state(LinkState::ConnPending);
    }

    /// Processes a data channel packet with a valid header.
    ///
    /// `stamp` is where in the connection the capture context received the packet.
    pub fn on_data(
        &mut self,
        header: Header,
        payload: &[u8],
        stamp: EventStamp,
        channel: DataChannel,
        timestamp: Instant,
    ) -> Action {
        let conn = match &mut self.conn {
            Some(conn) => conn,
            None => return Action::None,
        };

        if self.state == LinkState::ConnPending {
            conn.epoch = Some(timestamp);
            self.state = LinkState::Connected;
            info!("connection established on {:?} at {}", channel, timestamp);
        }

        conn.last_packet = timestamp;
        conn.event_counter = if stamp.synced {
            Some(stamp.counter)
        } else {
            None
        };
        conn.channel = Some(channel);
        conn.commit_pending(stamp);

        if header.llid() != Llid::Control {
            return Action::None;
        }

        let pdu = match ControlPdu::from_bytes(&mut ByteReader::new(payload)) {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!("unparseable control PDU ({}): {:?}", e, header);
                return Action::None;
            }
        };

        if usize::from(header.payload_length()) != pdu.encoded_size()
            || payload.len() != pdu.encoded_size()
        {
            debug!("ignoring control PDU with bad length: {:?}", header);
            return Action::None;
        }

        let update = match pdu {
            ControlPdu::ConnectionUpdateReq(data) => LlcpUpdate::Connection(data),
            ControlPdu::ChannelMapReq { map, instant } => LlcpUpdate::ChannelMap { map, instant },
            ControlPdu::TerminateInd { error_code } => {
                info!("LL_TERMINATE_IND, reason {:?}", error_code);
                return Action::Ended(EndReason::Terminated(error_code.0));
            }
            ControlPdu::Unknown { .. } => return Action::None,
        };

        if conn.is_pending(&update) {
            // retransmission
            return Action::None;
        }

        info!(
            "{:?} at event {:?}, instant {}",
            pdu.opcode(),
            conn.event_counter,
            update.instant()
        );
        conn.set_pending(update, stamp);
        Action::Update(update)
    }

    /// Returns whether the connection has been silent for longer than allowed.
    ///
    /// The limit is the smaller of the connection's supervision timeout and `inactivity`.
    pub fn is_timed_out(&self, now: Instant, inactivity: Duration) -> bool {
        match (&self.conn, self.state) {
            (Some(conn), LinkState::ConnPending) | (Some(conn), LinkState::Connected) => {
                let limit = conn.supervision_timeout.min(inactivity);
                now.is_after(conn.last_packet + limit)
            }
            _ => false,
        }
    }

    /// Ends the followed connection and moves to `next` (`Listening` or `Inactive`).
    pub fn end(&mut self, reason: EndReason, next: LinkState) {
        if let Some(conn) = &self.conn {
            info!(
                "connection {:#010x} ended ({:?}) after event {:?}",
                conn.access_address(),
                reason,
                conn.event_counter
            );
        }
        self.conn = None;
        self.set_state(next);
    }

    fn set_state(&mut self, state: LinkState) {
        if state != self.state {
            debug!("link: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}
