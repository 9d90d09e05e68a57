use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use fieldgate::client::{ChannelConfig, PointMapping, PollConfig, TransportConfig};
use fieldgate::{
    AddressRange, ChannelEvent, EventKind, FailureReason, Gateway, GatewayEvent, Indexed,
    RequestError, SessionEvent, UnitId,
};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal in-process Modbus TCP server: registers hold `address + 100`,
/// writes are echoed.
async fn serve_connection(mut socket: TcpStream) {
    loop {
        let mut header = [0u8; 7];
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit_id = header[6];

        let mut pdu = vec![0u8; length - 1];
        if socket.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let response_pdu: Vec<u8> = match pdu[0] {
            0x03 => {
                let start = u16::from_be_bytes([pdu[1], pdu[2]]);
                let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                let mut body = vec![0x03, (count * 2) as u8];
                for address in start..start + count {
                    body.extend_from_slice(&(address + 100).to_be_bytes());
                }
                body
            }
            0x06 => pdu.clone(),
            other => vec![other | 0x80, 0x01],
        };

        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&header[0..4]);
        response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        response.push(unit_id);
        response.extend_from_slice(&response_pdu);

        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
}

async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    tokio::spawn(serve_connection(socket));
                }
                Err(_) => return,
            }
        }
    });
    addr
}

/// an address nothing is listening on
async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn next_event(events: &mut mpsc::Receiver<GatewayEvent>) -> GatewayEvent {
    tokio::time::timeout(RESPONSE_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event sink closed")
}

async fn wait_for<F: Fn(&GatewayEvent) -> bool>(
    events: &mut mpsc::Receiver<GatewayEvent>,
    predicate: F,
) -> GatewayEvent {
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}

fn poll_config() -> PollConfig {
    PollConfig::new(
        Duration::from_millis(50),
        AddressRange::try_from(10, 2).unwrap(),
        vec![
            PointMapping::new("pressure", 10),
            PointMapping::new("flow", 11),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn polls_device_values_and_serves_requests() {
    let addr = spawn_server().await;

    let (sink, mut events) = mpsc::channel(256);
    let mut gateway = Gateway::new(sink);

    let mut config = ChannelConfig::new("device-a", UnitId::new(1), TransportConfig::Tcp(addr));
    config.polls.push(poll_config());
    let handle = gateway.add_channel(config).unwrap();
    let id = handle.id();

    wait_for(&mut events, |event| {
        matches!(event.kind, EventKind::Channel(ChannelEvent::Running))
    })
    .await;

    // the poll cycle publishes both mapped points with the server's values
    let value = wait_for(&mut events, |event| {
        matches!(
            &event.kind,
            EventKind::Session(SessionEvent::DeviceValue(value)) if value.tag == "pressure"
        )
    })
    .await;
    if let EventKind::Session(SessionEvent::DeviceValue(value)) = value.kind {
        assert_eq!(value.value, 110);
    }

    let value = wait_for(&mut events, |event| {
        matches!(
            &event.kind,
            EventKind::Session(SessionEvent::DeviceValue(value)) if value.tag == "flow"
        )
    })
    .await;
    if let EventKind::Session(SessionEvent::DeviceValue(value)) = value.kind {
        assert_eq!(value.value, 111);
    }

    // application-level requests flow through the same channel
    let registers = handle
        .read_holding_registers(AddressRange::try_from(3, 2).unwrap())
        .await
        .unwrap();
    assert_eq!(
        registers,
        vec![Indexed::new(3, 103), Indexed::new(4, 104)]
    );

    let echo = handle
        .write_single_register(Indexed::new(7, 0x0BB8))
        .await
        .unwrap();
    assert_eq!(echo, Indexed::new(7, 0x0BB8));

    assert!(gateway.stop_channel(id).await);
    wait_for(&mut events, |event| {
        matches!(event.kind, EventKind::Channel(ChannelEvent::Stopped))
    })
    .await;
}

#[tokio::test]
async fn unreachable_device_is_retried_a_bounded_number_of_times() {
    let addr = unreachable_addr().await;

    let (sink, mut events) = mpsc::channel(256);
    let mut gateway = Gateway::new(sink);

    let mut config = ChannelConfig::new("device-b", UnitId::new(1), TransportConfig::Tcp(addr));
    config.restart = fieldgate::supervisor::RestartPolicy {
        max_attempts: 3,
        stability_threshold: Duration::from_secs(30),
        strategy: fieldgate::fixed_retry_strategy(Duration::from_millis(10)),
    };
    gateway.add_channel(config).unwrap();

    let mut restarts = Vec::new();
    loop {
        match next_event(&mut events).await.kind {
            EventKind::Channel(ChannelEvent::Restarted { attempt }) => restarts.push(attempt),
            EventKind::Channel(ChannelEvent::Failed { reason }) => {
                assert_eq!(reason, FailureReason::RestartExhausted);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(restarts, vec![1, 2, 3]);
}

#[tokio::test]
async fn a_failing_channel_does_not_affect_its_siblings() {
    let good_addr = spawn_server().await;
    let bad_addr = unreachable_addr().await;

    let (sink, mut events) = mpsc::channel(256);
    let mut gateway = Gateway::new(sink);

    let mut good = ChannelConfig::new("good", UnitId::new(1), TransportConfig::Tcp(good_addr));
    good.polls.push(poll_config());
    let good_id = gateway.add_channel(good).unwrap().id();

    let mut bad = ChannelConfig::new("bad", UnitId::new(1), TransportConfig::Tcp(bad_addr));
    bad.restart = fieldgate::supervisor::RestartPolicy {
        max_attempts: 2,
        stability_threshold: Duration::from_secs(30),
        strategy: fieldgate::fixed_retry_strategy(Duration::from_millis(10)),
    };
    let bad_id = gateway.add_channel(bad).unwrap().id();

    // the bad channel reaches its terminal state...
    wait_for(&mut events, |event| {
        event.channel == bad_id
            && matches!(event.kind, EventKind::Channel(ChannelEvent::Failed { .. }))
    })
    .await;

    // ...and the good channel keeps producing values afterwards
    wait_for(&mut events, |event| {
        event.channel == good_id
            && matches!(
                event.kind,
                EventKind::Session(SessionEvent::DeviceValue(_))
            )
    })
    .await;

    gateway.shutdown().await;
}

#[tokio::test]
async fn requests_to_a_stopped_channel_fail_with_shutdown() {
    let addr = spawn_server().await;

    let (sink, mut events) = mpsc::channel(256);
    let mut gateway = Gateway::new(sink);

    let config = ChannelConfig::new("device-c", UnitId::new(1), TransportConfig::Tcp(addr));
    let handle = gateway.add_channel(config).unwrap();

    wait_for(&mut events, |event| {
        matches!(event.kind, EventKind::Channel(ChannelEvent::Running))
    })
    .await;

    handle.stop().await;
    wait_for(&mut events, |event| {
        matches!(event.kind, EventKind::Channel(ChannelEvent::Stopped))
    })
    .await;

    let result = handle
        .read_holding_registers(AddressRange::try_from(0, 1).unwrap())
        .await;
    assert_eq!(result, Err(RequestError::Shutdown));
}
