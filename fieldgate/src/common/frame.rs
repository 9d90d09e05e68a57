use crate::common::buffer::ReadBuffer;
use crate::common::phys::PhysLayer;
use crate::common::pdu::Pdu;
use crate::decode::DecodeLevel;
use crate::error::{FrameParseError, RequestError};
use crate::serial::frame::RtuParser;
use crate::tcp::frame::MbapParser;
use crate::types::UnitId;

pub(crate) mod constants {
    /// Maximum number of PDU bytes (function code included)
    pub(crate) const MAX_ADU_LENGTH: usize = 253;
}

/// Transaction id used to correlate TCP requests and responses
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub(crate) struct TxId {
    value: u16,
}

impl TxId {
    pub(crate) fn new(value: u16) -> Self {
        TxId { value }
    }

    pub(crate) fn to_u16(self) -> u16 {
        self.value
    }

    pub(crate) fn next(&mut self) -> TxId {
        let ret = self.value;
        self.value = self.value.wrapping_add(1);
        TxId::new(ret)
    }
}

impl Default for TxId {
    fn default() -> Self {
        TxId::new(0)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.value)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub(crate) unit_id: UnitId,
    /// Present for the TCP variant, absent for RTU where correlation is FIFO
    pub(crate) tx_id: Option<TxId>,
}

impl FrameHeader {
    pub(crate) fn new_tcp_header(unit_id: UnitId, tx_id: TxId) -> Self {
        FrameHeader {
            unit_id,
            tx_id: Some(tx_id),
        }
    }

    pub(crate) fn new_rtu_header(unit_id: UnitId) -> Self {
        FrameHeader {
            unit_id,
            tx_id: None,
        }
    }
}

/// A complete frame reassembled from the stream: header plus raw PDU bytes.
///
/// Created once per message and consumed exactly once by its destination.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) header: FrameHeader,
    length: usize,
    pdu: [u8; constants::MAX_ADU_LENGTH],
}

impl Frame {
    pub(crate) fn new(header: FrameHeader) -> Frame {
        Frame {
            header,
            length: 0,
            pdu: [0; constants::MAX_ADU_LENGTH],
        }
    }

    pub(crate) fn set(&mut self, src: &[u8]) -> bool {
        if src.len() > self.pdu.len() {
            return false;
        }

        self.pdu[0..src.len()].copy_from_slice(src);
        self.length = src.len();
        true
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.pdu[0..self.length]
    }
}

enum FrameParser {
    Mbap(MbapParser),
    Rtu(RtuParser),
}

/// Reads complete frames off a physical layer, reassembling from chunks of
/// arbitrary size and boundary.
///
/// A single read may complete zero, one, or many frames; a frame may span many
/// reads. No frame is surfaced until its complete span has arrived.
pub(crate) struct FramedReader {
    parser: FrameParser,
    buffer: ReadBuffer,
}

impl FramedReader {
    pub(crate) fn tcp() -> Self {
        Self {
            parser: FrameParser::Mbap(MbapParser::new()),
            buffer: ReadBuffer::new(crate::tcp::frame::constants::MAX_FRAME_LENGTH),
        }
    }

    pub(crate) fn rtu_response() -> Self {
        Self {
            parser: FrameParser::Rtu(RtuParser::new_response_parser()),
            buffer: ReadBuffer::new(crate::serial::frame::constants::MAX_FRAME_LENGTH),
        }
    }

    pub(crate) async fn next_frame(
        &mut self,
        io: &mut PhysLayer,
        decode: DecodeLevel,
    ) -> Result<Frame, RequestError> {
        loop {
            let result = match &mut self.parser {
                FrameParser::Mbap(parser) => parser.parse(&mut self.buffer, decode.frame),
                FrameParser::Rtu(parser) => parser.parse(&mut self.buffer, decode.frame),
            };

            match result? {
                Some(frame) => return Ok(frame),
                None => {
                    self.buffer.read_some(io, decode.physical).await?;
                }
            }
        }
    }
}

enum FrameWriterKind {
    Mbap,
    Rtu,
}

/// Formats a PDU into its transport-specific byte representation inside a
/// reusable buffer.
pub(crate) struct FrameWriter {
    kind: FrameWriterKind,
    buffer: [u8; crate::tcp::frame::constants::MAX_FRAME_LENGTH],
}

impl FrameWriter {
    pub(crate) fn tcp() -> Self {
        Self {
            kind: FrameWriterKind::Mbap,
            buffer: [0; crate::tcp::frame::constants::MAX_FRAME_LENGTH],
        }
    }

    pub(crate) fn rtu() -> Self {
        Self {
            kind: FrameWriterKind::Rtu,
            buffer: [0; crate::tcp::frame::constants::MAX_FRAME_LENGTH],
        }
    }

    pub(crate) fn format(
        &mut self,
        header: FrameHeader,
        pdu: &Pdu,
        decode: DecodeLevel,
    ) -> Result<&[u8], RequestError> {
        let count = match self.kind {
            FrameWriterKind::Mbap => {
                crate::tcp::frame::format_mbap(&mut self.buffer, header, pdu)?
            }
            FrameWriterKind::Rtu => crate::serial::frame::format_rtu(&mut self.buffer, header, pdu)?,
        };

        let bytes = match self.buffer.get(..count) {
            Some(x) => x,
            None => return Err(FrameParseError::FrameLengthTooBig(count, self.buffer.len()).into()),
        };

        if decode.frame.enabled() {
            if decode.frame.payload_enabled() {
                tracing::info!(
                    "FRAME TX - unit: {} tx_id: {:?} payload: {:02X?}",
                    header.unit_id,
                    header.tx_id.map(|x| x.to_u16()),
                    bytes
                );
            } else {
                tracing::info!(
                    "FRAME TX - unit: {} tx_id: {:?} ({} bytes)",
                    header.unit_id,
                    header.tx_id.map(|x| x.to_u16()),
                    bytes.len()
                );
            }
        }

        Ok(bytes)
    }
}
