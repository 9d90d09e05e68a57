//! Poll a Modbus TCP device and print everything the gateway publishes.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use fieldgate::client::{ChannelConfig, PointMapping, PollConfig, TransportConfig};
use fieldgate::{
    AddressRange, AppDecodeLevel, DecodeLevel, EventKind, Gateway, SessionEvent, UnitId,
};

#[derive(Parser)]
#[clap(name = "gateway", about = "Poll a Modbus TCP device and print its values")]
struct Args {
    /// socket address of the device
    #[clap(long, default_value = "127.0.0.1:502")]
    addr: SocketAddr,
    /// unit id of the device
    #[clap(long, default_value_t = 1)]
    unit: u8,
    /// poll interval in milliseconds
    #[clap(long, default_value_t = 1000)]
    interval: u64,
    /// starting register of the poll range
    #[clap(long, default_value_t = 0)]
    start: u16,
    /// number of registers to poll
    #[clap(long, default_value_t = 4)]
    count: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let range = AddressRange::try_from(args.start, args.count)?;
    let points = (range.start..range.start + range.count)
        .map(|address| PointMapping::new(format!("reg{address}"), address))
        .collect();

    let (sink, events) = tokio::sync::mpsc::channel(64);
    let mut gateway = Gateway::new(sink);

    let mut config = ChannelConfig::new(
        "example-device",
        UnitId::new(args.unit),
        TransportConfig::Tcp(args.addr),
    );
    config.decode = DecodeLevel::nothing().application(AppDecodeLevel::DataValues);
    config.polls.push(PollConfig::new(
        Duration::from_millis(args.interval),
        range,
        points,
    )?);

    gateway.add_channel(config)?;

    let mut events = ReceiverStream::new(events);
    while let Some(event) = events.next().await {
        match event.kind {
            EventKind::Session(SessionEvent::DeviceValue(value)) => {
                println!("{} = {}", value.tag, value.value);
            }
            EventKind::Session(event) => println!("session event: {event:?}"),
            EventKind::Channel(event) => println!("channel event: {event:?}"),
        }
    }

    Ok(())
}
