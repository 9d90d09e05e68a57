use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::message::{Command, Promise, Request};
use crate::common::function::FunctionCode;
use crate::common::pdu::Pdu;
use crate::decode::DecodeLevel;
use crate::error::{AduParseError, InvalidRequest, RequestError};
use crate::supervisor::RestartPolicy;
use crate::types::{AddressRange, ChannelId, Indexed, UnitId};

pub(crate) mod correlator;
pub(crate) mod message;
pub(crate) mod session;
pub(crate) mod task;

/// How the gateway reaches the device
#[derive(Clone, Debug)]
pub enum TransportConfig {
    /// Modbus TCP: MBAP framing, correlation by transaction id
    Tcp(SocketAddr),
    /// Modbus RTU over a serial port: CRC framing, FIFO correlation
    #[cfg(feature = "serial")]
    Serial {
        /// path to the serial device, e.g. `/dev/ttyUSB0`
        path: String,
        /// port settings
        settings: crate::serial::SerialSettings,
    },
}

/// A named device point within a poll range
#[derive(Clone, Debug)]
pub struct PointMapping {
    /// tag published with values read from this point
    pub tag: String,
    /// register address of the point
    pub address: u16,
}

impl PointMapping {
    /// Create a new [PointMapping] from a tag and an address
    pub fn new<T: Into<String>>(tag: T, address: u16) -> Self {
        Self {
            tag: tag.into(),
            address,
        }
    }
}

/// A periodic read of one contiguous register range, with the point mappings
/// that name the registers of interest.
///
/// Validated at construction: every point address must fall inside the range.
#[derive(Clone, Debug)]
pub struct PollConfig {
    interval: Duration,
    range: AddressRange,
    points: Vec<PointMapping>,
}

impl PollConfig {
    /// Create a validated [PollConfig]
    pub fn new(
        interval: Duration,
        range: AddressRange,
        points: Vec<PointMapping>,
    ) -> Result<Self, InvalidRequest> {
        for point in &points {
            if !range.contains(point.address) {
                return Err(InvalidRequest::AddressNotInRange(point.address, range));
            }
        }
        Ok(Self {
            interval,
            range,
            points,
        })
    }

    /// how often the range is read
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// the register range read each cycle
    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// the named points within the range
    pub fn points(&self) -> &[PointMapping] {
        &self.points
    }
}

/// Immutable configuration of one channel, validated at construction time.
pub struct ChannelConfig {
    /// name used in log output
    pub name: String,
    /// unit id of the device on this channel
    pub unit_id: UnitId,
    /// how to reach the device
    pub transport: TransportConfig,
    /// how long to wait for each response
    pub response_timeout: Duration,
    /// maximum number of requests in flight on the wire
    pub completer_limit: usize,
    /// depth of the command queue feeding the channel
    pub max_queued_requests: usize,
    /// periodic reads of the device's points
    pub polls: Vec<PollConfig>,
    /// protocol decoding verbosity
    pub decode: DecodeLevel,
    /// how the supervisor restarts the channel after failures
    pub restart: RestartPolicy,
}

impl ChannelConfig {
    /// Create a configuration with default timeouts, limits, and restart policy
    pub fn new<T: Into<String>>(name: T, unit_id: UnitId, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            unit_id,
            transport,
            response_timeout: Duration::from_secs(1),
            completer_limit: 1,
            max_queued_requests: 16,
            polls: Vec::new(),
            decode: DecodeLevel::nothing(),
            restart: RestartPolicy::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), InvalidRequest> {
        if self.completer_limit == 0 {
            return Err(InvalidRequest::ZeroInFlightLimit);
        }
        if self.max_queued_requests == 0 {
            return Err(InvalidRequest::ZeroQueueDepth);
        }
        Ok(())
    }
}

/// Clonable handle used to issue requests to a channel and to stop it.
///
/// Dropping every handle for a channel disposes it: the supervisor tears the
/// session down and the channel task ends.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    commands: mpsc::Sender<Command>,
}

impl ChannelHandle {
    pub(crate) fn new(id: ChannelId, commands: mpsc::Sender<Command>) -> Self {
        Self { id, commands }
    }

    /// The id assigned to this channel
    pub fn id(&self) -> ChannelId {
        self.id
    }

    async fn make_request(
        &self,
        pdu: Pdu,
        function: FunctionCode,
    ) -> Result<Pdu, RequestError> {
        let (promise, rx) = Promise::channel();
        self.commands
            .send(Command::Request(Request::new(pdu, function, promise)))
            .await
            .map_err(|_| RequestError::Shutdown)?;
        rx.await.map_err(|_| RequestError::Shutdown)?
    }

    /// Read a contiguous range of holding registers from the device
    pub async fn read_holding_registers(
        &self,
        range: AddressRange,
    ) -> Result<Vec<Indexed<u16>>, RequestError> {
        let response = self
            .make_request(
                Pdu::ReadHoldingRegistersRequest(range),
                FunctionCode::ReadHoldingRegisters,
            )
            .await?;

        match response {
            Pdu::ReadHoldingRegistersResponse(values) => Ok(values
                .into_iter()
                .enumerate()
                .map(|(offset, value)| Indexed::new(range.start + offset as u16, value))
                .collect()),
            other => Err(AduParseError::UnknownResponseFunction(
                other.raw_function(),
                FunctionCode::ReadHoldingRegisters.get_value(),
                FunctionCode::ReadHoldingRegisters.as_error(),
            )
            .into()),
        }
    }

    /// Write a single register and return the echoed value
    pub async fn write_single_register(
        &self,
        value: Indexed<u16>,
    ) -> Result<Indexed<u16>, RequestError> {
        let response = self
            .make_request(
                Pdu::WriteSingleRegisterRequest(value),
                FunctionCode::WriteSingleRegister,
            )
            .await?;

        match response {
            Pdu::WriteSingleRegisterResponse(echo) => Ok(echo),
            other => Err(AduParseError::UnknownResponseFunction(
                other.raw_function(),
                FunctionCode::WriteSingleRegister.get_value(),
                FunctionCode::WriteSingleRegister.as_error(),
            )
            .into()),
        }
    }

    /// Stop the channel: pending requests are cancelled, the transport is
    /// closed, and the supervisor emits a final `Stopped` event.
    pub async fn stop(&self) {
        self.commands.send(Command::Stop).await.ok();
    }
}
