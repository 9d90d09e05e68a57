use crate::exception::ExceptionCode;
use crate::types::AddressRange;

/// The task processing requests has unexpectedly shut down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shutdown;

impl std::fmt::Display for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("request processing task has terminated")
    }
}

impl std::error::Error for Shutdown {}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Shutdown {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Shutdown
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Shutdown {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Shutdown
    }
}

/// Errors that can produce a failed request
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RequestError {
    /// An I/O error occurred on the underlying stream
    Io(std::io::ErrorKind),
    /// Frame could not be parsed off the stream
    BadFrame(FrameParseError),
    /// Response ADU was invalid
    BadResponse(AduParseError),
    /// The server responded with an exception code
    Exception(ExceptionCode),
    /// Request was not valid
    BadRequest(InvalidRequest),
    /// No response was received from the server within the timeout
    ResponseTimeout,
    /// No connection exists to the server
    NoConnection,
    /// The channel was stopped while the request was pending
    Cancelled,
    /// The request processing task has terminated
    Shutdown,
    /// An internal bug in the library occurred while writing to a buffer
    Internal(InternalError),
}

impl std::error::Error for RequestError {}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RequestError::Io(kind) => write!(f, "I/O error: {kind}"),
            RequestError::BadFrame(err) => write!(f, "bad frame: {err}"),
            RequestError::BadResponse(err) => write!(f, "bad response: {err}"),
            RequestError::Exception(ex) => write!(f, "Modbus exception: {ex}"),
            RequestError::BadRequest(err) => write!(f, "bad request: {err}"),
            RequestError::ResponseTimeout => {
                f.write_str("timeout occurred before receiving a response")
            }
            RequestError::NoConnection => f.write_str("no connection exists to the server"),
            RequestError::Cancelled => {
                f.write_str("channel was stopped while the request was pending")
            }
            RequestError::Shutdown => f.write_str("request processing task has terminated"),
            RequestError::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl From<FrameParseError> for RequestError {
    fn from(err: FrameParseError) -> Self {
        RequestError::BadFrame(err)
    }
}

impl From<AduParseError> for RequestError {
    fn from(err: AduParseError) -> Self {
        RequestError::BadResponse(err)
    }
}

impl From<ExceptionCode> for RequestError {
    fn from(ex: ExceptionCode) -> Self {
        RequestError::Exception(ex)
    }
}

impl From<InvalidRequest> for RequestError {
    fn from(err: InvalidRequest) -> Self {
        RequestError::BadRequest(err)
    }
}

impl From<InternalError> for RequestError {
    fn from(err: InternalError) -> Self {
        RequestError::Internal(err)
    }
}

impl From<Shutdown> for RequestError {
    fn from(_: Shutdown) -> Self {
        RequestError::Shutdown
    }
}

/// Errors that occur while parsing a frame off a stream (TCP or RTU)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameParseError {
    /// Received TCP frame with the length field set to zero
    MbapLengthZero,
    /// Received TCP frame with length that exceeds the maximum allowed (actual, max)
    MbapLengthTooBig(usize, usize),
    /// Received TCP frame with a non-Modbus protocol id
    UnknownProtocolId(u16),
    /// Received a frame with a length larger than the maximum ADU size (actual, max)
    FrameLengthTooBig(usize, usize),
    /// Received RTU frame whose CRC does not match the computed value (received, expected)
    CrcValidationFailure(u16, u16),
    /// Received a frame with an unknown function code that cannot be sized
    UnknownFunctionCode(u8),
    /// Resynchronization dropped too many bytes without finding a valid frame
    ResyncFailure(usize),
}

impl std::error::Error for FrameParseError {}

impl std::fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameParseError::MbapLengthZero => {
                f.write_str("received TCP frame with the length field set to zero")
            }
            FrameParseError::MbapLengthTooBig(size, max) => write!(
                f,
                "received TCP frame with length ({size}) that exceeds max allowed size ({max})"
            ),
            FrameParseError::UnknownProtocolId(id) => {
                write!(f, "received TCP frame with non-Modbus protocol id: {id}")
            }
            FrameParseError::FrameLengthTooBig(size, max) => write!(
                f,
                "received frame with length ({size}) that exceeds max allowed size ({max})"
            ),
            FrameParseError::CrcValidationFailure(received, expected) => write!(
                f,
                "received RTU frame with CRC {received:#06X}, expected {expected:#06X}"
            ),
            FrameParseError::UnknownFunctionCode(fc) => {
                write!(f, "cannot size frame with unknown function code: {fc:#04X}")
            }
            FrameParseError::ResyncFailure(dropped) => write!(
                f,
                "dropped {dropped} bytes while resynchronizing without finding a valid frame"
            ),
        }
    }
}

/// Errors that occur while parsing requests and responses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AduParseError {
    /// PDU is too short to be valid
    InsufficientBytes,
    /// PDU contains extra trailing bytes
    TrailingBytes(usize),
    /// Byte count doesn't match what is expected based on the request (expected, actual)
    RequestByteCountMismatch(usize, usize),
    /// Byte count doesn't match the actual number of bytes present (count, remaining)
    InsufficientBytesForByteCount(usize, usize),
    /// A parameter expected to be echoed in the reply did not match
    ReplyEchoMismatch,
    /// An unknown response function code was received (actual, expected, expected error)
    UnknownResponseFunction(u8, u8, u8),
}

impl std::error::Error for AduParseError {}

impl std::fmt::Display for AduParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AduParseError::InsufficientBytes => f.write_str("PDU is too short to be valid"),
            AduParseError::TrailingBytes(count) => {
                write!(f, "PDU contains {count} extra trailing bytes")
            }
            AduParseError::RequestByteCountMismatch(expected, actual) => write!(
                f,
                "byte count ({actual}) doesn't match what is expected based on the request ({expected})"
            ),
            AduParseError::InsufficientBytesForByteCount(count, remaining) => write!(
                f,
                "byte count ({count}) doesn't match the actual number of bytes remaining ({remaining})"
            ),
            AduParseError::ReplyEchoMismatch => {
                f.write_str("a parameter expected to be echoed in the reply did not match")
            }
            AduParseError::UnknownResponseFunction(actual, expected, error) => write!(
                f,
                "received unknown response function code: {actual:#04X}, expected {expected:#04X} or {error:#04X}"
            ),
        }
    }
}

/// Errors that result from bad request or configuration parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidRequest {
    /// Request contains a count of zero
    CountOfZero,
    /// Requested count exceeds the maximum allowed for the type (count, max)
    CountTooBigForType(u16, u16),
    /// Start and count would overflow the u16 address space (start, count)
    AddressOverflow(u16, u16),
    /// A mapped point address falls outside the poll range
    AddressNotInRange(u16, AddressRange),
    /// The in-flight request limit must be at least one
    ZeroInFlightLimit,
    /// The command queue depth must be at least one
    ZeroQueueDepth,
}

impl std::error::Error for InvalidRequest {}

impl std::fmt::Display for InvalidRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InvalidRequest::CountOfZero => f.write_str("request contains a count of zero"),
            InvalidRequest::CountTooBigForType(count, max) => write!(
                f,
                "the request count of {count} exceeds the maximum allowed count of {max} for this type"
            ),
            InvalidRequest::AddressOverflow(start, count) => write!(
                f,
                "start == {start} and count == {count} would overflow the representation of u16"
            ),
            InvalidRequest::AddressNotInRange(address, range) => {
                write!(f, "point address {address} is not contained in {range}")
            }
            InvalidRequest::ZeroInFlightLimit => {
                f.write_str("the in-flight request limit must be at least one")
            }
            InvalidRequest::ZeroQueueDepth => {
                f.write_str("the command queue depth must be at least one")
            }
        }
    }
}

/// Errors that indicate bugs in the library itself, e.g. buffer sizing mistakes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalError {
    /// Attempted to write more bytes than allowed (requested, remaining)
    InsufficientWriteSpace(usize, usize),
    /// The calculated ADU size exceeds what the protocol allows
    AduTooBig(usize),
    /// Attempted to read more bytes than present (requested, remaining)
    InsufficientBytesForRead(usize, usize),
    /// Cursor seek operation exceeded the bounds of the underlying buffer
    BadSeekOperation,
}

impl std::error::Error for InternalError {}

impl std::fmt::Display for InternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InternalError::InsufficientWriteSpace(requested, remaining) => write!(
                f,
                "attempted to write {requested} bytes with {remaining} bytes remaining"
            ),
            InternalError::AduTooBig(size) => write!(
                f,
                "ADU length of {size} exceeds the maximum allowed length"
            ),
            InternalError::InsufficientBytesForRead(requested, remaining) => write!(
                f,
                "attempted to read {requested} bytes with only {remaining} remaining"
            ),
            InternalError::BadSeekOperation => {
                f.write_str("cursor seek operation exceeded the bounds of the underlying buffer")
            }
        }
    }
}
