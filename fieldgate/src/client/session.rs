use std::time::Duration;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::client::message::Command;
use crate::client::task::{SessionError, SessionTask};
use crate::client::{ChannelConfig, PollConfig, TransportConfig};
use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::events::SessionEvent;
use crate::types::UnitId;

/// The clonable subset of [ChannelConfig] a session attempt needs.
///
/// The supervisor creates one session per start attempt from the same setup.
#[derive(Clone)]
pub(crate) struct SessionSetup {
    pub(crate) name: String,
    pub(crate) unit_id: UnitId,
    pub(crate) transport: TransportConfig,
    pub(crate) response_timeout: Duration,
    pub(crate) completer_limit: usize,
    pub(crate) max_queued_requests: usize,
    pub(crate) polls: Vec<PollConfig>,
    pub(crate) decode: DecodeLevel,
}

impl SessionSetup {
    pub(crate) fn from_config(config: &ChannelConfig) -> Self {
        Self {
            name: config.name.clone(),
            unit_id: config.unit_id,
            transport: config.transport.clone(),
            response_timeout: config.response_timeout,
            completer_limit: config.completer_limit,
            max_queued_requests: config.max_queued_requests,
            polls: config.polls.clone(),
            decode: config.decode,
        }
    }

    pub(crate) async fn connect(&self) -> Result<PhysLayer, std::io::Error> {
        match &self.transport {
            TransportConfig::Tcp(addr) => {
                let socket = tokio::net::TcpStream::connect(addr).await?;
                tracing::info!("connected to: {}", addr);
                Ok(PhysLayer::new_tcp(socket))
            }
            #[cfg(feature = "serial")]
            TransportConfig::Serial { path, settings } => {
                let serial = crate::serial::open(path, *settings)
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                tracing::info!("serial port open: {}", path);
                Ok(PhysLayer::new_serial(serial))
            }
        }
    }
}

/// The channels and join handle of one spawned session attempt.
///
/// All communication with the running session flows through `commands` and
/// `events`; the session shares no state with its supervisor.
pub(crate) struct SpawnedSession {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) events: mpsc::Receiver<SessionEvent>,
    pub(crate) handle: tokio::task::JoinHandle<SessionError>,
}

/// Spawn one session attempt in its own task.
///
/// A panic inside the task is contained by the runtime and surfaces to the
/// supervisor through the join handle.
pub(crate) fn spawn_session(setup: SessionSetup) -> SpawnedSession {
    let (command_tx, command_rx) = mpsc::channel(setup.max_queued_requests);
    let (event_tx, event_rx) = mpsc::channel(16);

    let span = tracing::info_span!("Session", name = %setup.name);
    let task = SessionTask::new(setup, command_rx, event_tx);
    let handle = tokio::spawn(task.run().instrument(span));

    SpawnedSession {
        commands: command_tx,
        events: event_rx,
        handle,
    }
}
