//! The host interface: commands, responses and the records handed to the host.
//!
//! The host talks to the sniffer with vendor requests, each consisting of a one-byte request code,
//! a 16-bit `value` and an optional data stage. [`Command::parse`] turns such a request into a
//! [`Command`], which the [`Sniffer`] executes, answering with a [`Response`].
//!
//! Everything the sniffer observes flows the other way, through a [`Sink`]. Packets and progress
//! reports both end up as fixed-size 64-byte [`HostRecord`]s:
//!
//! ```notrust
//! +------+--------+---------+-----------+----------+----------+----------+----------+----------+
//! | type | status | channel | clkn_high | clk100ns | rssi_max | rssi_min | rssi_avg | rssi_cnt |
//! | (1)  |  (1)   |   (1)   |    (1)    |   (4)    |   (1)    |   (1)    |   (1)    |   (1)    |
//! +------+--------+---------+-----------+----------+----------+----------+----------+----------+
//! | reserved (2) | data (50)                                                                   |
//! +--------------+-----------------------------------------------------------------------------+
//! ```
//!
//! `channel` is the frequency minus 2402 MHz, the timestamp is split into the low 32 bits of a
//! 100 ns clock (`clk100ns`) and the next 8 bits (`clkn_high`). For packets, `data` holds the
//! Access Address followed by the dewhitened PDU and CRC, truncated to fit. For progress reports,
//! `data` holds the report's state byte followed by its value.
//!
//! [`Command::parse`]: enum.Command.html#method.parse
//! [`Command`]: enum.Command.html
//! [`Sniffer`]: ../sniffer/struct.Sniffer.html
//! [`Response`]: enum.Response.html
//! [`Sink`]: trait.Sink.html
//! [`HostRecord`]: struct.HostRecord.html

use crate::{
    bytes::*,
    capture::RssiSummary,
    link::filter::TargetFilter,
    phy::Channel,
    time::Instant,
    utils::HexSlice,
    Error,
};
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;
use heapless::{consts::U8, spsc};

/// Size of every record handed to the host.
pub const RECORD_SIZE: usize = 64;

/// Offset of the data field in a record.
const DATA_OFFSET: usize = 14;

/// Number of payload bytes a record can carry.
pub const RECORD_DATA_SIZE: usize = RECORD_SIZE - DATA_OFFSET;

/// Number of times a stalled host transfer is attempted before giving up.
pub const MAX_POLL_ATTEMPTS: u8 = 3;

enum_with_unknown! {
    /// Vendor request codes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Request(u8) {
        SetChannel = 12,
        Stop = 21,
        BtleSniffing = 42,
        GetAccessAddress = 43,
        SetAccessAddress = 44,
        GetCrcVerify = 47,
        SetCrcVerify = 48,
        Poll = 49,
        BtlePromisc = 50,
        BtleSetTarget = 56,
        CancelFollow = 68,
    }
}

enum_with_unknown! {
    /// The `type` field of a host record.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RecordType(u8) {
        /// A captured packet.
        LePacket = 1,
        /// A promiscuous mode progress report.
        LePromisc = 5,
    }
}

enum_with_unknown! {
    /// Status of a completed command, as returned to the host.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ResultCode(u8) {
        Success = 0,
        InvalidRequest = 1,
        Busy = 2,
        Unsupported = 3,
        Stalled = 4,
    }
}

impl ResultCode {
    /// Returns the result code to report for the outcome of a command.
    pub fn of(result: &Result<Response, Error>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(Error::Busy) => ResultCode::Busy,
            Err(Error::Unsupported) => ResultCode::Unsupported,
            Err(Error::Stalled) => ResultCode::Stalled,
            Err(_) => ResultCode::InvalidRequest,
        }
    }
}

bitflags! {
    /// The `status` field of a packet record.
    pub struct PacketFlags: u8 {
        /// The CRC was checked against a known initialization value.
        const CRC_CHECKED = 0b01;
        /// The CRC check passed. Only meaningful with `CRC_CHECKED`.
        const CRC_VALID = 0b10;
    }
}

/// A decoded host command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    /// Selects the channel to listen on: the advertising channel for follow mode, or the data
    /// channel promiscuous mode scans.
    SetChannel(Channel),

    /// Stops all capturing.
    Stop,

    /// Listens for advertising traffic. With `follow` set, connections are followed from their
    /// `CONNECT_REQ`.
    Sniff { follow: bool },

    GetAccessAddress,

    /// Pins the access address. In promiscuous mode this skips discovery.
    SetAccessAddress(u32),

    GetCrcVerify,
    SetCrcVerify(bool),

    /// Fetches the next queued record.
    Poll,

    /// Starts promiscuous mode.
    Promiscuous,

    /// Restricts advertising traffic and followed connections to matching devices. A filter with
    /// an empty mask removes the restriction.
    SetTarget(TargetFilter),

    /// Drops the followed connection and goes back to listening.
    CancelFollow,
}

impl Command {
    /// Decodes a vendor request.
    ///
    /// Returns `Error::Unsupported` for unknown request codes, and `Error::InvalidValue` or
    /// `Error::Eof` for requests with malformed arguments.
    pub fn parse(request: Request, value: u16, data: &[u8]) -> Result<Self, Error> {
        let mut bytes = ByteReader::new(data);
        let command = match request {
            Request::SetChannel => Command::SetChannel(Channel::from_freq(value)?),
            Request::Stop => Command::Stop,
            Request::BtleSniffing => Command::Sniff { follow: value != 0 },
            Request::GetAccessAddress => Command::GetAccessAddress,
            Request::SetAccessAddress => Command::SetAccessAddress(bytes.read_u32_le()?),
            Request::GetCrcVerify => Command::GetCrcVerify,
            Request::SetCrcVerify => Command::SetCrcVerify(value != 0),
            Request::Poll => Command::Poll,
            Request::BtlePromisc => Command::Promiscuous,
            Request::BtleSetTarget => {
                let address: [u8; 6] = bytes.read_array()?;
                let mask_bits = bytes.read_u8()?;
                Command::SetTarget(TargetFilter::new(address, mask_bits)?)
            }
            Request::CancelFollow => Command::CancelFollow,
            Request::Unknown(code) => {
                debug!("unsupported request {}", code);
                return Err(Error::Unsupported);
            }
        };

        if bytes.is_empty() {
            Ok(command)
        } else {
            Err(Error::IncompleteParse)
        }
    }
}

/// Data returned to the host for a successful command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Response {
    /// The command has no data to return.
    Ack,
    AccessAddress(u32),
    CrcVerify(bool),
    /// The next queued record, or none if the queue is empty.
    Record(Option<HostRecord>),
}

impl ToBytes for Response {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self {
            Response::Ack | Response::Record(None) => Ok(()),
            Response::AccessAddress(aa) => writer.write_u32_le(*aa),
            Response::CrcVerify(on) => writer.write_u8(*on as u8),
            Response::Record(Some(record)) => writer.write_slice(record.as_bytes()),
        }
    }
}

/// Progress of promiscuous mode, and link loss.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Report {
    AccessAddress(u32),
    CrcInit(u32),
    /// Hop interval in 1.25 ms units.
    HopInterval(u16),
    HopIncrement(u8),
    /// The followed connection went away.
    ConnectionLost,
}

impl Report {
    /// Returns the state byte identifying the report.
    pub fn state(&self) -> u8 {
        match self {
            Report::AccessAddress(_) => 0,
            Report::CrcInit(_) => 1,
            Report::HopInterval(_) => 2,
            Report::HopIncrement(_) => 3,
            Report::ConnectionLost => 4,
        }
    }

    /// Encodes the report as a `LE_PROMISC` record.
    pub fn encode(&self, channel: Channel, timestamp: Instant) -> HostRecord {
        let mut record = HostRecord::new(RecordType::LePromisc, 0, channel, timestamp, None);
        // at most 5 bytes, always fits
        let _ = self.to_bytes(&mut ByteWriter::new(record.data_mut()));
        record
    }
}

impl ToBytes for Report {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.state())?;
        match *self {
            Report::AccessAddress(aa) => writer.write_u32_le(aa),
            Report::CrcInit(crc) => writer.write_u32_le(crc & 0xff_ffff),
            Report::HopInterval(units) => writer.write_u16_le(units),
            Report::HopIncrement(inc) => writer.write_u8(inc),
            Report::ConnectionLost => Ok(()),
        }
    }
}

/// A captured packet as reported to the host.
#[derive(Debug, Copy, Clone)]
pub struct PacketRecord<'a> {
    pub channel: Channel,
    /// Start of the packet on air.
    pub timestamp: Instant,
    pub access_address: u32,
    pub rssi: Option<RssiSummary>,
    pub flags: PacketFlags,
    /// Dewhitened PDU header, payload and CRC.
    pub pdu: HexSlice<&'a [u8]>,
}

impl PacketRecord<'_> {
    /// Encodes the packet as a `LE_PACKET` record.
    ///
    /// PDUs longer than the record's data field are truncated.
    pub fn encode(&self) -> HostRecord {
        let mut record = HostRecord::new(
            RecordType::LePacket,
            self.flags.bits(),
            self.channel,
            self.timestamp,
            self.rssi,
        );
        let data = record.data_mut();
        LittleEndian::write_u32(&mut data[..4], self.access_address);
        ByteWriter::new(&mut data[4..]).write_slice_truncate(self.pdu.0);
        record
    }

    /// Returns whether the CRC was checked and found valid.
    pub fn crc_valid(&self) -> bool {
        self.flags
            .contains(PacketFlags::CRC_CHECKED | PacketFlags::CRC_VALID)
    }
}

/// A 64-byte record in the host's format.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HostRecord([u8; RECORD_SIZE]);

impl HostRecord {
    fn new(
        ty: RecordType,
        status: u8,
        channel: Channel,
        timestamp: Instant,
        rssi: Option<RssiSummary>,
    ) -> Self {
        let mut raw = [0; RECORD_SIZE];
        let clk100ns = u64::from(timestamp.raw_micros()) * 10;
        raw[0] = ty.into();
        raw[1] = status;
        raw[2] = (channel.freq() - 2402) as u8;
        raw[3] = (clk100ns >> 32) as u8;
        LittleEndian::write_u32(&mut raw[4..8], clk100ns as u32);
        if let Some(rssi) = rssi {
            raw[8] = rssi.max as u8;
            raw[9] = rssi.min as u8;
            raw[10] = rssi.avg as u8;
            raw[11] = rssi.count;
        }
        HostRecord(raw)
    }

    /// Returns the encoded record.
    pub fn as_bytes(&self) -> &[u8; RECORD_SIZE] {
        &self.0
    }

    pub fn record_type(&self) -> RecordType {
        self.0[0].into()
    }

    /// Returns the record's data field.
    pub fn data(&self) -> &[u8] {
        &self.0[DATA_OFFSET..]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0[DATA_OFFSET..]
    }
}

impl fmt::Debug for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRecord")
            .field("type", &self.record_type())
            .field("status", &self.0[1])
            .field("channel", &self.0[2])
            .field("data", &HexSlice(self.data()))
            .finish()
    }
}

/// Receiver of everything the sniffer reports.
pub trait Sink {
    /// Called for every accepted packet.
    fn packet(&mut self, packet: &PacketRecord<'_>);

    /// Called when a connection parameter was recovered or the followed connection was lost.
    fn report(&mut self, report: Report, channel: Channel, timestamp: Instant);

    /// Returns the next record to answer a `Poll` command with.
    ///
    /// Sinks that deliver records by other means keep the default, which never returns anything.
    fn poll(&mut self) -> Option<HostRecord> {
        None
    }
}

/// Failure of a single host transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The endpoint was stalled. The transfer may succeed when attempted again.
    Stall,
    /// The host is gone.
    Disconnected,
}

/// The transport towards the host.
pub trait HostLink {
    fn send(&mut self, record: &HostRecord) -> Result<(), TransferError>;
}

/// Runs a host transfer, attempting it up to `MAX_POLL_ATTEMPTS` times while it stalls.
///
/// Returns `Error::Stalled` if every attempt stalled, and `Error::Eof` if the host disconnected.
pub fn retry_on_stall<T>(mut transfer: impl FnMut() -> Result<T, TransferError>) -> Result<T, Error> {
    for attempt in 1..=MAX_POLL_ATTEMPTS {
        match transfer() {
            Ok(t) => return Ok(t),
            Err(TransferError::Stall) => {
                debug!("transfer stalled ({}/{})", attempt, MAX_POLL_ATTEMPTS);
            }
            Err(TransferError::Disconnected) => return Err(Error::Eof),
        }
    }

    warn!("giving up after {} stalled transfers", MAX_POLL_ATTEMPTS);
    Err(Error::Stalled)
}

/// A `Sink` that encodes everything into host records and queues them for the host.
///
/// When the queue is full, new records are dropped.
pub struct Outbox {
    queue: spsc::Queue<HostRecord, U8>,
    /// Record taken off the queue whose transfer failed.
    unsent: Option<HostRecord>,
    dropped: u32,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            queue: spsc::Queue::new(),
            unsent: None,
            dropped: 0,
        }
    }

    /// Returns the number of records waiting for the host.
    pub fn len(&self) -> usize {
        self.queue.len() + self.unsent.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of records dropped because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    fn push(&mut self, record: HostRecord) {
        if self.queue.enqueue(record).is_err() {
            trace!("outbox full, dropping {:?}", record.record_type());
            self.dropped += 1;
        }
    }

    fn next(&mut self) -> Option<HostRecord> {
        self.unsent.take().or_else(|| self.queue.dequeue())
    }

    /// Sends all queued records over `link`.
    ///
    /// Returns the number of records sent. If a transfer fails, the record stays queued and the
    /// error is returned.
    pub fn drain<L: HostLink>(&mut self, link: &mut L) -> Result<usize, Error> {
        let mut sent = 0;
        while let Some(record) = self.next() {
            if let Err(e) = retry_on_stall(|| link.send(&record)) {
                self.unsent = Some(record);
                return Err(e);
            }
            sent += 1;
        }
        Ok(sent)
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for Outbox {
    fn packet(&mut self, packet: &PacketRecord<'_>) {
        self.push(packet.encode());
    }

    fn report(&mut self, report: Report, channel: Channel, timestamp: Instant) {
        self.push(report.encode(channel, timestamp));
    }

    fn poll(&mut self) -> Option<HostRecord> {
        self.next()
    }
}
