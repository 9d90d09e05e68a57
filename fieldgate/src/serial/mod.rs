pub(crate) mod frame;

#[cfg(feature = "serial")]
pub use tokio_serial::{DataBits, FlowControl, Parity, StopBits};

/// Serial port settings
#[cfg(feature = "serial")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate in symbols-per-second
    pub baud_rate: u32,
    /// Number of bits used to represent a character
    pub data_bits: DataBits,
    /// Flow control mode
    pub flow_control: FlowControl,
    /// Number of bits to use to signal the end of a character
    pub stop_bits: StopBits,
    /// Parity checking mode
    pub parity: Parity,
}

#[cfg(feature = "serial")]
impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

#[cfg(feature = "serial")]
pub(crate) fn open(
    path: &str,
    settings: SerialSettings,
) -> Result<tokio_serial::SerialStream, tokio_serial::Error> {
    let builder = tokio_serial::new(path, settings.baud_rate)
        .data_bits(settings.data_bits)
        .flow_control(settings.flow_control)
        .stop_bits(settings.stop_bits)
        .parity(settings.parity);
    tokio_serial::SerialStream::open(&builder)
}
