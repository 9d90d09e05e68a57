use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::correlator::{CorrelationMode, Correlator, PendingRequest, Responder};
use crate::client::message::{Command, Request};
use crate::client::session::SessionSetup;
use crate::client::{PollConfig, TransportConfig};
use crate::common::cursor::ReadCursor;
use crate::common::frame::{Frame, FrameHeader, FrameWriter, FramedReader, TxId};
use crate::common::function::FunctionCode;
use crate::common::pdu::{Pdu, PduDisplay};
use crate::common::phys::PhysLayer;
use crate::error::{FrameParseError, RequestError};
use crate::events::{
    DeviceValue, FailureReason, PerformanceCount, PerformanceRange, SessionEvent,
};

/// We execute the session until one of the following occurs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionError {
    /// the transport could not be established
    ConnectFailed(std::io::ErrorKind),
    /// the stream errored
    IoError(std::io::ErrorKind),
    /// unrecoverable framing issue
    BadFrame(FrameParseError),
    /// an explicit stop command was received
    Stopped,
    /// the command channel was closed on the sender side
    Shutdown,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SessionError::ConnectFailed(err) => write!(f, "failed to connect: {err}"),
            SessionError::IoError(err) => write!(f, "I/O error: {err}"),
            SessionError::BadFrame(err) => write!(f, "parser encountered a bad frame: {err}"),
            SessionError::Stopped => write!(f, "stop was requested"),
            SessionError::Shutdown => write!(f, "shutdown was requested"),
        }
    }
}

impl SessionError {
    pub(crate) fn from_request_err(err: RequestError) -> Option<Self> {
        match err {
            RequestError::Io(x) => Some(SessionError::IoError(x)),
            RequestError::BadFrame(x) => Some(SessionError::BadFrame(x)),
            // all other errors don't kill the session
            _ => None,
        }
    }

    /// how this end shows up in events, if it is a failure at all
    pub(crate) fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            SessionError::ConnectFailed(kind) => Some(FailureReason::ConnectFailed(*kind)),
            SessionError::IoError(kind) => Some(FailureReason::Io(*kind)),
            SessionError::BadFrame(err) => Some(FailureReason::BadFrame(*err)),
            SessionError::Stopped | SessionError::Shutdown => None,
        }
    }
}

struct PollState {
    config: PollConfig,
    next_due: Instant,
}

/// The single event loop that binds one device's polling logic to a
/// transport connection and a codec.
///
/// Runs until stopped or until an unrecoverable error occurs; it never
/// restarts itself. All interaction with the rest of the process flows
/// through the command and event channels.
pub(crate) struct SessionTask {
    setup: SessionSetup,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SessionEvent>,
    correlator: Correlator,
    writer: FrameWriter,
    reader: FramedReader,
    tx_id: TxId,
    mode: CorrelationMode,
    polls: Vec<PollState>,
    /// a request pulled from the queue while the wire was at capacity
    deferred: Option<Request>,
    poll_cycles: u64,
    poll_errors: u64,
    poll_timeouts: u64,
    unmatched_responses: u64,
}

impl SessionTask {
    pub(crate) fn new(
        setup: SessionSetup,
        commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let mode = match &setup.transport {
            TransportConfig::Tcp(_) => CorrelationMode::TransactionId,
            #[cfg(feature = "serial")]
            TransportConfig::Serial { .. } => CorrelationMode::Fifo,
        };
        Self::new_with_mode(mode, setup, commands, events)
    }

    /// construct with an explicit correlation mode, independent of transport
    pub(crate) fn new_with_mode(
        mode: CorrelationMode,
        setup: SessionSetup,
        commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (writer, reader) = match mode {
            CorrelationMode::TransactionId => (FrameWriter::tcp(), FramedReader::tcp()),
            CorrelationMode::Fifo => (FrameWriter::rtu(), FramedReader::rtu_response()),
        };

        let correlator = Correlator::new(mode, setup.completer_limit);
        let polls = setup
            .polls
            .iter()
            .cloned()
            .map(|config| PollState {
                config,
                next_due: Instant::now(),
            })
            .collect();

        Self {
            setup,
            commands,
            events,
            correlator,
            writer,
            reader,
            tx_id: TxId::default(),
            mode,
            polls,
            deferred: None,
            poll_cycles: 0,
            poll_errors: 0,
            poll_timeouts: 0,
            unmatched_responses: 0,
        }
    }

    pub(crate) async fn run(self) -> SessionError {
        let io = match self.setup.connect().await {
            Ok(io) => io,
            Err(err) => {
                tracing::warn!("error connecting: {}", err);
                let error = SessionError::ConnectFailed(err.kind());
                return self.finish(error).await;
            }
        };
        self.run_with_io(io).await
    }

    /// run the session over an already-established transport
    pub(crate) async fn run_with_io(mut self, mut io: PhysLayer) -> SessionError {
        self.events.send(SessionEvent::Started).await.ok();

        let now = Instant::now();
        for poll in &mut self.polls {
            poll.next_due = now;
        }

        let error = loop {
            if let Err(err) = self.poll_once(&mut io).await {
                tracing::warn!("ending session: {}", err);
                break err;
            }
        };

        self.finish(error).await
    }

    /// resolve everything still pending and emit the terminal event
    async fn finish(mut self, error: SessionError) -> SessionError {
        match error.failure_reason() {
            None => {
                let cancelled = self.correlator.cancel_all(RequestError::Cancelled);
                if let Some(request) = self.deferred.take() {
                    request.fail(RequestError::Cancelled);
                }
                if cancelled > 0 {
                    tracing::debug!("cancelled {} pending requests", cancelled);
                }
                self.events.send(SessionEvent::Stopped).await.ok();
            }
            Some(reason) => {
                let request_error = match error {
                    SessionError::IoError(kind) | SessionError::ConnectFailed(kind) => {
                        RequestError::Io(kind)
                    }
                    SessionError::BadFrame(err) => RequestError::BadFrame(err),
                    SessionError::Stopped | SessionError::Shutdown => RequestError::Cancelled,
                };
                self.correlator.cancel_all(request_error);
                if let Some(request) = self.deferred.take() {
                    request.fail(request_error);
                }
                self.events.send(SessionEvent::Failure(reason)).await.ok();
            }
        }
        error
    }

    async fn poll_once(&mut self, io: &mut PhysLayer) -> Result<(), SessionError> {
        // a deferred request gets the first slot that frees up
        if self.correlator.has_capacity() {
            if let Some(request) = self.deferred.take() {
                self.transmit_request(io, request).await?;
            }
        }

        let far_future = Instant::now() + Duration::from_secs(3600);
        let next_poll = self.polls.iter().map(|poll| poll.next_due).min();
        let next_deadline = self.correlator.next_deadline();
        let can_transmit = self.correlator.has_capacity();

        tokio::select! {
            frame = self.reader.next_frame(io, self.setup.decode) => {
                match frame {
                    Ok(frame) => {
                        self.handle_frame(frame).await;
                        Ok(())
                    }
                    Err(err) => match SessionError::from_request_err(err) {
                        Some(err) => Err(err),
                        None => Ok(()),
                    }
                }
            }
            command = self.commands.recv(), if self.deferred.is_none() => {
                match command {
                    None => Err(SessionError::Shutdown),
                    Some(Command::Stop) => Err(SessionError::Stopped),
                    Some(Command::Request(request)) => {
                        if self.correlator.has_capacity() {
                            self.transmit_request(io, request).await
                        } else {
                            self.deferred = Some(request);
                            Ok(())
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(next_poll.unwrap_or(far_future)), if next_poll.is_some() && can_transmit => {
                self.issue_due_polls(io).await
            }
            _ = tokio::time::sleep_until(next_deadline.unwrap_or(far_future)), if next_deadline.is_some() => {
                self.expire_requests().await;
                Ok(())
            }
        }
    }

    async fn transmit_request(
        &mut self,
        io: &mut PhysLayer,
        request: Request,
    ) -> Result<(), SessionError> {
        let Request {
            pdu,
            function,
            promise,
        } = request;
        self.transmit(io, pdu, function, Responder::Promise(promise))
            .await
    }

    async fn issue_due_polls(&mut self, io: &mut PhysLayer) -> Result<(), SessionError> {
        let now = Instant::now();
        for index in 0..self.polls.len() {
            if !self.correlator.has_capacity() {
                // remaining polls stay due and fire once a slot frees
                break;
            }
            if self.polls[index].next_due > now {
                continue;
            }
            let range = self.polls[index].config.range();
            let interval = self.polls[index].config.interval();
            self.polls[index].next_due = now + interval;

            self.transmit(
                io,
                Pdu::ReadHoldingRegistersRequest(range),
                FunctionCode::ReadHoldingRegisters,
                Responder::Poll {
                    poll_index: index,
                    started: SystemTime::now(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn transmit(
        &mut self,
        io: &mut PhysLayer,
        pdu: Pdu,
        function: FunctionCode,
        responder: Responder,
    ) -> Result<(), SessionError> {
        let header = match self.mode {
            CorrelationMode::TransactionId => {
                FrameHeader::new_tcp_header(self.setup.unit_id, self.tx_id.next())
            }
            CorrelationMode::Fifo => FrameHeader::new_rtu_header(self.setup.unit_id),
        };

        if self.setup.decode.app.enabled() {
            tracing::info!("PDU TX - {}", PduDisplay::new(self.setup.decode.app, &pdu));
        }

        let bytes = match self.writer.format(header, &pdu, self.setup.decode) {
            Ok(bytes) => bytes,
            Err(err) => {
                // a request that cannot be serialized fails alone
                tracing::warn!("unable to format request: {}", err);
                self.fail_responder(responder, err).await;
                return Ok(());
            }
        };

        if let Err(err) = io.write(bytes, self.setup.decode.physical).await {
            let kind = err.kind();
            self.fail_responder(responder, RequestError::Io(kind)).await;
            return Err(SessionError::IoError(kind));
        }

        let now = Instant::now();
        self.correlator.record(PendingRequest {
            tx_id: header.tx_id,
            function,
            request: pdu,
            sent_at: now,
            deadline: now + self.setup.response_timeout,
            responder,
        });

        Ok(())
    }

    async fn fail_responder(&mut self, responder: Responder, err: RequestError) {
        match responder {
            Responder::Promise(promise) => promise.complete(Err(err)),
            Responder::Poll { .. } => {
                self.poll_errors += 1;
                tracing::warn!("poll failed: {}", err);
                self.emit_count("poll_errors", self.poll_errors).await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        if frame.header.unit_id != self.setup.unit_id {
            tracing::warn!(
                "received frame for unit {} while expecting {}, dropping",
                frame.header.unit_id,
                self.setup.unit_id
            );
            return;
        }

        let entry = match self.correlator.match_response(frame.header.tx_id) {
            Some(entry) => entry,
            None => {
                // unknown or already-resolved id: anomaly, not fatal
                self.unmatched_responses += 1;
                tracing::warn!(
                    "response matches no pending request (tx_id: {:?}), dropping",
                    frame.header.tx_id.map(|x| x.to_u16())
                );
                self.emit_count("unmatched_responses", self.unmatched_responses)
                    .await;
                return;
            }
        };

        let mut cursor = ReadCursor::new(frame.payload());
        let result = Pdu::parse_response(entry.function, &mut cursor).and_then(|response| {
            Pdu::validate_response(&entry.request, &response)?;
            Ok(response)
        });

        if let Ok(response) = &result {
            if self.setup.decode.app.enabled() {
                tracing::info!(
                    "PDU RX - {}",
                    PduDisplay::new(self.setup.decode.app, response)
                );
            }
        }

        match entry.responder {
            Responder::Promise(promise) => promise.complete(result),
            Responder::Poll {
                poll_index,
                started,
            } => self.complete_poll(poll_index, started, result).await,
        }
    }

    async fn complete_poll(
        &mut self,
        poll_index: usize,
        started: SystemTime,
        result: Result<Pdu, RequestError>,
    ) {
        let values = match result {
            Ok(Pdu::ReadHoldingRegistersResponse(values)) => values,
            Ok(_) => {
                // validate_response only lets the matching variant through
                tracing::warn!("poll completed with an unexpected response variant");
                return;
            }
            Err(err) => {
                self.poll_errors += 1;
                tracing::warn!("poll failed: {}", err);
                self.emit_count("poll_errors", self.poll_errors).await;
                return;
            }
        };

        let timestamp = SystemTime::now();
        let mut events = Vec::new();
        if let Some(poll) = self.polls.get(poll_index) {
            let range = poll.config.range();
            for point in poll.config.points() {
                let offset = (point.address - range.start) as usize;
                if let Some(value) = values.get(offset) {
                    events.push(SessionEvent::DeviceValue(DeviceValue {
                        tag: point.tag.clone(),
                        value: *value,
                        timestamp,
                    }));
                }
            }
        }

        for event in events {
            self.events.send(event).await.ok();
        }

        self.poll_cycles += 1;
        self.emit_count("poll_cycles", self.poll_cycles).await;
        self.events
            .send(SessionEvent::PerformanceRange(PerformanceRange {
                name: "poll_cycle",
                start: started,
                end: timestamp,
            }))
            .await
            .ok();
    }

    async fn expire_requests(&mut self) {
        let now = Instant::now();
        let mut timeouts = 0;
        for entry in self.correlator.take_expired(now) {
            let waited = now.duration_since(entry.sent_at);
            match entry.responder {
                Responder::Promise(promise) => {
                    tracing::warn!("request timed out after {:?}", waited);
                    promise.complete(Err(RequestError::ResponseTimeout))
                }
                Responder::Poll { .. } => {
                    tracing::warn!("poll timed out after {:?}", waited);
                    timeouts += 1;
                    self.poll_timeouts += 1;
                }
            }
        }
        if timeouts > 0 {
            self.emit_count("poll_timeouts", self.poll_timeouts).await;
        }
    }

    async fn emit_count(&mut self, name: &'static str, count: u64) {
        self.events
            .send(SessionEvent::PerformanceCount(PerformanceCount {
                name,
                count,
            }))
            .await
            .ok();
    }
}
