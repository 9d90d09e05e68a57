use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::message::Command;
use crate::client::session::SpawnedSession;
use crate::client::task::SessionError;
use crate::error::RequestError;
use crate::events::{ChannelEvent, EventKind, FailureReason, GatewayEvent, SessionEvent};
use crate::supervisor::{ChannelState, RestartDecision, RestartTracker};
use crate::types::ChannelId;

/// how long a session gets to wind down after a stop before it is aborted
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Creates one session attempt per invocation.
///
/// Abstracted so the supervisor loop can be driven in tests without sockets.
pub(crate) trait SessionFactory: Send + 'static {
    fn spawn(&mut self) -> SpawnedSession;
}

impl<F> SessionFactory for F
where
    F: FnMut() -> SpawnedSession + Send + 'static,
{
    fn spawn(&mut self) -> SpawnedSession {
        (self)()
    }
}

enum SessionEnd {
    /// the channel should not run anymore; the supervisor is done
    Stopped,
    /// the session failed and the restart policy decides what happens next
    Failed(FailureReason),
}

/// Runs the channel state machine.
///
/// Owns the session for its whole life: spawns it in an isolated task,
/// observes its termination (including panics, via the join handle), applies
/// the restart policy, and reports every transition to the event sink. The
/// session communicates exclusively through message channels; a fault inside
/// it cannot corrupt or block the supervisor or sibling channels.
pub(crate) struct SupervisorTask<F: SessionFactory> {
    id: ChannelId,
    factory: F,
    tracker: RestartTracker,
    commands: mpsc::Receiver<Command>,
    sink: mpsc::Sender<GatewayEvent>,
    state: ChannelState,
}

impl<F: SessionFactory> SupervisorTask<F> {
    pub(crate) fn new(
        id: ChannelId,
        factory: F,
        tracker: RestartTracker,
        commands: mpsc::Receiver<Command>,
        sink: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            id,
            factory,
            tracker,
            commands,
            sink,
            state: ChannelState::Stopped,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut restart_attempt: Option<u32> = None;

        loop {
            self.set_state(ChannelState::Starting);
            match restart_attempt {
                None => self.emit_channel(ChannelEvent::Starting).await,
                Some(attempt) => self.emit_channel(ChannelEvent::Restarted { attempt }).await,
            }

            let session = self.factory.spawn();
            match self.run_session(session).await {
                SessionEnd::Stopped => {
                    self.set_state(ChannelState::Stopped);
                    self.emit_channel(ChannelEvent::Stopped).await;
                    return;
                }
                SessionEnd::Failed(reason) => match self.tracker.on_failure(Instant::now()) {
                    RestartDecision::Retry { attempt, delay } => {
                        self.set_state(ChannelState::Restarting);
                        tracing::warn!(
                            "session failed ({}), restarting in {:?} (attempt {})",
                            reason,
                            delay,
                            attempt
                        );
                        if !self.wait_restart(delay).await {
                            self.set_state(ChannelState::Stopped);
                            self.emit_channel(ChannelEvent::Stopped).await;
                            return;
                        }
                        restart_attempt = Some(attempt);
                    }
                    RestartDecision::GiveUp => {
                        self.set_state(ChannelState::Failed);
                        tracing::error!("restart attempts exhausted, channel failed: {}", reason);
                        self.emit_channel(ChannelEvent::Failed {
                            reason: FailureReason::RestartExhausted,
                        })
                        .await;
                        self.drain_while_failed().await;
                        return;
                    }
                },
            }
        }
    }

    async fn run_session(&mut self, mut session: SpawnedSession) -> SessionEnd {
        let mut session_ready = false;
        let mut events_closed = false;
        // a request pulled from the channel queue while the session queue was full
        let mut deferred: Option<crate::client::message::Request> = None;

        loop {
            tokio::select! {
                event = session.events.recv(), if !events_closed => {
                    match event {
                        Some(SessionEvent::Started) => {
                            session_ready = true;
                            self.set_state(ChannelState::Running);
                            self.tracker.on_running(Instant::now());
                            self.emit_session(SessionEvent::Started).await;
                            self.emit_channel(ChannelEvent::Running).await;
                        }
                        Some(event) => self.emit_session(event).await,
                        // the join handle resolves next
                        None => events_closed = true,
                    }
                }
                result = &mut session.handle => {
                    // forward any events buffered before the task ended
                    while let Ok(event) = session.events.try_recv() {
                        self.emit_session(event).await;
                    }
                    if let Some(request) = deferred.take() {
                        request.fail(RequestError::NoConnection);
                    }
                    return Self::classify(result);
                }
                permit = session.commands.clone().reserve_owned(), if deferred.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(request) = deferred.take() {
                                permit.send(Command::Request(request));
                            }
                        }
                        Err(_) => {
                            // the session is gone; the join arm resolves next
                            if let Some(request) = deferred.take() {
                                request.fail(RequestError::NoConnection);
                            }
                        }
                    }
                }
                command = self.commands.recv(), if deferred.is_none() => {
                    match command {
                        None => {
                            return self.stop_session(session, deferred).await;
                        }
                        Some(Command::Stop) => {
                            return self.stop_session(session, deferred).await;
                        }
                        Some(Command::Request(request)) => {
                            if !session_ready {
                                request.fail(RequestError::NoConnection);
                            } else {
                                match session.commands.try_send(Command::Request(request)) {
                                    Ok(()) => {}
                                    Err(mpsc::error::TrySendError::Full(command)) => {
                                        if let Command::Request(request) = command {
                                            deferred = Some(request);
                                        }
                                    }
                                    Err(mpsc::error::TrySendError::Closed(command)) => {
                                        if let Command::Request(request) = command {
                                            request.fail(RequestError::NoConnection);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Ask the session to stop and reap its task, aborting it if it does not
    /// wind down within the grace period.
    async fn stop_session(
        &mut self,
        mut session: SpawnedSession,
        deferred: Option<crate::client::message::Request>,
    ) -> SessionEnd {
        if let Some(request) = deferred {
            request.fail(RequestError::Cancelled);
        }
        if session.commands.try_send(Command::Stop).is_err() {
            tracing::debug!("command queue unavailable, closing it to stop the session");
        }
        // closing the queue also stops sessions that never saw the command
        drop(session.commands);

        let id = self.id;
        let sink = self.sink.clone();
        let wind_down = async {
            while let Some(event) = session.events.recv().await {
                sink.send(GatewayEvent {
                    channel: id,
                    kind: EventKind::Session(event),
                })
                .await
                .ok();
            }
            (&mut session.handle).await
        };

        if tokio::time::timeout(STOP_GRACE_PERIOD, wind_down).await.is_err() {
            tracing::warn!(
                "session did not stop within {:?}, aborting its task",
                STOP_GRACE_PERIOD
            );
            session.handle.abort();
        }

        SessionEnd::Stopped
    }

    fn classify(result: Result<SessionError, tokio::task::JoinError>) -> SessionEnd {
        match result {
            Ok(error) => match error.failure_reason() {
                Some(reason) => SessionEnd::Failed(reason),
                None => SessionEnd::Stopped,
            },
            Err(join_error) => {
                if join_error.is_panic() {
                    // the fault is contained to this channel
                    tracing::error!("session task panicked");
                    SessionEnd::Failed(FailureReason::Panicked)
                } else {
                    SessionEnd::Stopped
                }
            }
        }
    }

    /// Wait out the restart delay. Returns false if the channel was stopped
    /// while waiting.
    async fn wait_restart(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Stop) => return false,
                    Some(Command::Request(request)) => request.fail(RequestError::NoConnection),
                }
            }
        }
    }

    /// Terminal `Failed` state: answer commands with failures until the
    /// channel is disposed.
    async fn drain_while_failed(&mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Stop => return,
                Command::Request(request) => request.fail(RequestError::NoConnection),
            }
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            tracing::info!("channel state: {}", state);
            self.state = state;
        }
    }

    async fn emit_channel(&self, event: ChannelEvent) {
        self.sink
            .send(GatewayEvent {
                channel: self.id,
                kind: EventKind::Channel(event),
            })
            .await
            .ok();
    }

    async fn emit_session(&self, event: SessionEvent) {
        self.sink
            .send(GatewayEvent {
                channel: self.id,
                kind: EventKind::Session(event),
            })
            .await
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::message::{Promise, Request};
    use crate::common::function::FunctionCode;
    use crate::common::pdu::Pdu;
    use crate::retry::fixed_retry_strategy;
    use crate::supervisor::RestartPolicy;
    use crate::types::{AddressRange, Indexed};

    fn policy(max_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            stability_threshold: Duration::from_secs(30),
            strategy: fixed_retry_strategy(Duration::from_millis(10)),
        }
    }

    /// a session that ends immediately with the given error
    fn failing_factory(error: SessionError) -> impl FnMut() -> SpawnedSession + Send + 'static {
        move || {
            let (command_tx, _command_rx) = mpsc::channel(4);
            let (_event_tx, event_rx) = mpsc::channel(4);
            SpawnedSession {
                commands: command_tx,
                events: event_rx,
                handle: tokio::spawn(async move { error }),
            }
        }
    }

    /// a session that panics inside its own task
    fn panicking_factory() -> impl FnMut() -> SpawnedSession + Send + 'static {
        move || {
            let (command_tx, _command_rx) = mpsc::channel(4);
            let (_event_tx, event_rx) = mpsc::channel(4);
            SpawnedSession {
                commands: command_tx,
                events: event_rx,
                handle: tokio::spawn(async move { panic!("session logic fault") }),
            }
        }
    }

    /// a session that reports ready and echoes write requests until stopped
    fn healthy_factory() -> impl FnMut() -> SpawnedSession + Send + 'static {
        move || {
            let (command_tx, mut command_rx) = mpsc::channel(4);
            let (event_tx, event_rx) = mpsc::channel(4);
            let handle = tokio::spawn(async move {
                event_tx.send(SessionEvent::Started).await.ok();
                loop {
                    match command_rx.recv().await {
                        None => return SessionError::Shutdown,
                        Some(Command::Stop) => {
                            event_tx.send(SessionEvent::Stopped).await.ok();
                            return SessionError::Stopped;
                        }
                        Some(Command::Request(request)) => {
                            let echo = match &request.pdu {
                                Pdu::WriteSingleRegisterRequest(value) => {
                                    Pdu::WriteSingleRegisterResponse(*value)
                                }
                                _ => Pdu::ReadHoldingRegistersResponse(vec![0]),
                            };
                            request.promise.complete(Ok(echo));
                        }
                    }
                }
            });
            SpawnedSession {
                commands: command_tx,
                events: event_rx,
                handle,
            }
        }
    }

    fn spawn_supervisor<F: SessionFactory + Sync>(
        factory: F,
        policy: RestartPolicy,
    ) -> (
        mpsc::Sender<Command>,
        mpsc::Receiver<GatewayEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (sink_tx, sink_rx) = mpsc::channel(64);
        let task = SupervisorTask::new(
            ChannelId(0),
            factory,
            RestartTracker::new(policy),
            command_rx,
            sink_tx,
        );
        let handle = tokio::spawn(task.run());
        (command_tx, sink_rx, handle)
    }

    async fn collect_channel_events(
        sink: &mut mpsc::Receiver<GatewayEvent>,
    ) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Some(event) = sink.recv().await {
            if let EventKind::Channel(event) = event.kind {
                let last = matches!(
                    event,
                    ChannelEvent::Failed { .. } | ChannelEvent::Stopped
                );
                events.push(event);
                if last {
                    break;
                }
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn makes_exactly_max_attempts_restarts_then_fails() {
        let (_commands, mut sink, handle) = spawn_supervisor(
            failing_factory(SessionError::ConnectFailed(
                std::io::ErrorKind::ConnectionRefused,
            )),
            policy(3),
        );

        let events = collect_channel_events(&mut sink).await;
        assert_eq!(
            events,
            vec![
                ChannelEvent::Starting,
                ChannelEvent::Restarted { attempt: 1 },
                ChannelEvent::Restarted { attempt: 2 },
                ChannelEvent::Restarted { attempt: 3 },
                ChannelEvent::Failed {
                    reason: FailureReason::RestartExhausted
                },
            ]
        );

        // terminal: no further restart attempts are emitted
        assert!(sink.try_recv().is_err());
        drop(_commands);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_panicking_session_is_contained_and_retried() {
        let (_commands, mut sink, handle) = spawn_supervisor(panicking_factory(), policy(1));

        let events = collect_channel_events(&mut sink).await;
        assert_eq!(
            events,
            vec![
                ChannelEvent::Starting,
                ChannelEvent::Restarted { attempt: 1 },
                ChannelEvent::Failed {
                    reason: FailureReason::RestartExhausted
                },
            ]
        );

        // the supervisor itself survived both panics
        drop(_commands);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_restart_wait_cancels_the_restart() {
        let (commands, mut sink, handle) = spawn_supervisor(
            failing_factory(SessionError::IoError(std::io::ErrorKind::ConnectionReset)),
            RestartPolicy {
                max_attempts: 5,
                stability_threshold: Duration::from_secs(30),
                // long enough that the stop always lands mid-wait
                strategy: fixed_retry_strategy(Duration::from_secs(3600)),
            },
        );

        // wait for the first failure to put the channel into Restarting
        loop {
            if let Some(GatewayEvent {
                kind: EventKind::Channel(ChannelEvent::Starting),
                ..
            }) = sink.recv().await
            {
                break;
            }
        }

        commands.send(Command::Stop).await.unwrap();
        let events = collect_channel_events(&mut sink).await;
        assert_eq!(events, vec![ChannelEvent::Stopped]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn healthy_session_reaches_running_and_forwards_requests() {
        let (commands, mut sink, handle) = spawn_supervisor(healthy_factory(), policy(3));

        // Starting, then Running once the session reports ready
        loop {
            if let Some(GatewayEvent {
                kind: EventKind::Channel(ChannelEvent::Running),
                ..
            }) = sink.recv().await
            {
                break;
            }
        }

        let (promise, rx) = Promise::channel();
        commands
            .send(Command::Request(Request::new(
                Pdu::WriteSingleRegisterRequest(Indexed::new(1, 2)),
                FunctionCode::WriteSingleRegister,
                promise,
            )))
            .await
            .unwrap();
        assert_eq!(
            rx.await.unwrap(),
            Ok(Pdu::WriteSingleRegisterResponse(Indexed::new(1, 2)))
        );

        commands.send(Command::Stop).await.unwrap();
        let events = collect_channel_events(&mut sink).await;
        assert!(events.ends_with(&[ChannelEvent::Stopped]));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn requests_fail_fast_while_the_channel_is_not_running() {
        // a session that never reports ready
        let factory = move || {
            let (command_tx, _command_rx) = mpsc::channel::<Command>(4);
            let (_event_tx, event_rx) = mpsc::channel(4);
            SpawnedSession {
                commands: command_tx,
                events: event_rx,
                handle: tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    SessionError::Stopped
                }),
            }
        };
        let (commands, _sink, handle) = spawn_supervisor(factory, policy(3));

        let (promise, rx) = Promise::channel();
        commands
            .send(Command::Request(Request::new(
                Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(0, 1).unwrap()),
                FunctionCode::ReadHoldingRegisters,
                promise,
            )))
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Err(RequestError::NoConnection));

        commands.send(Command::Stop).await.unwrap();
        handle.await.unwrap();
    }
}
