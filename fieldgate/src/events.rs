use std::time::SystemTime;

use crate::error::FrameParseError;
use crate::types::ChannelId;

/// Why a session or channel gave up.
///
/// Crosses the isolation boundary, so it carries plain data only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The transport could not be established
    ConnectFailed(std::io::ErrorKind),
    /// The transport dropped or errored while the session was running
    Io(std::io::ErrorKind),
    /// The stream produced a frame error the session could not recover from
    BadFrame(FrameParseError),
    /// The session task panicked; the fault was contained to this channel
    Panicked,
    /// The supervisor exhausted its restart attempts
    RestartExhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FailureReason::ConnectFailed(kind) => write!(f, "failed to connect: {kind}"),
            FailureReason::Io(kind) => write!(f, "I/O error: {kind}"),
            FailureReason::BadFrame(err) => write!(f, "unrecoverable frame error: {err}"),
            FailureReason::Panicked => f.write_str("session task panicked"),
            FailureReason::RestartExhausted => f.write_str("restart attempts exhausted"),
        }
    }
}

/// A value read from a device point
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceValue {
    /// tag of the point the value belongs to
    pub tag: String,
    /// raw register value
    pub value: u16,
    /// when the value was received
    pub timestamp: SystemTime,
}

/// A monotonically increasing per-session counter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerformanceCount {
    /// counter name
    pub name: &'static str,
    /// current value
    pub count: u64,
}

/// Wall-clock span of one unit of work, e.g. a poll cycle
#[derive(Clone, Debug, PartialEq)]
pub struct PerformanceRange {
    /// range name
    pub name: &'static str,
    /// when the work started
    pub start: SystemTime,
    /// when the work completed
    pub end: SystemTime,
}

/// Events emitted by a channel session across the isolation boundary
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The transport is established and the read pipeline is running
    Started,
    /// The session stopped cleanly
    Stopped,
    /// A device point produced a value
    DeviceValue(DeviceValue),
    /// A performance counter was updated
    PerformanceCount(PerformanceCount),
    /// A timed span of work completed
    PerformanceRange(PerformanceRange),
    /// The session terminated with an unrecoverable error.
    ///
    /// Emitted at most once, as the session's final event.
    Failure(FailureReason),
}

/// Channel lifecycle events emitted by the supervisor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A session is being created for the channel
    Starting,
    /// The channel's session is established and polling
    Running,
    /// The channel is starting again after a failure
    Restarted {
        /// how many restarts have occurred since the channel was last stable
        attempt: u32,
    },
    /// The channel exhausted its restart attempts and will not be retried
    Failed {
        /// the terminal failure
        reason: FailureReason,
    },
    /// The channel was stopped
    Stopped,
}

/// An event published to the gateway's sink, tagged with its source channel
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayEvent {
    /// the channel the event originated from
    pub channel: ChannelId,
    /// the event itself
    pub kind: EventKind,
}

/// The two sources of gateway events
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    /// lifecycle transition observed by the supervisor
    Channel(ChannelEvent),
    /// event produced by the channel's session
    Session(SessionEvent),
}
