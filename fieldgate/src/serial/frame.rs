use crate::common::buffer::ReadBuffer;
use crate::common::crc;
use crate::common::cursor::WriteCursor;
use crate::common::frame::{Frame, FrameHeader};
use crate::common::function::FunctionCode;
use crate::common::pdu::Pdu;
use crate::decode::FrameDecodeLevel;
use crate::error::{FrameParseError, RequestError};
use crate::types::UnitId;

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 1;
    pub(crate) const FUNCTION_CODE_LENGTH: usize = 1;
    pub(crate) const CRC_LENGTH: usize = 2;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::common::frame::constants::MAX_ADU_LENGTH + CRC_LENGTH;
    /// Consecutive bytes the parser may drop while resynchronizing before the
    /// stream is declared corrupt. One maximum frame's worth: if an entire
    /// frame-sized window contains no parseable frame, give up.
    pub(crate) const MAX_RESYNC_BYTES: usize = 256;
}

#[derive(Clone, Copy)]
enum LengthMode {
    /// The body length is always the same (without function code)
    Fixed(usize),
    /// Read X more bytes; the last one is the count of extra bytes after it
    Offset(usize),
    /// Unknown function code, can't determine the size
    Unknown,
}

/// Parses RTU response frames: `unit_id, function code, body, crc (LE)`.
///
/// RTU has no length field, so the body size is derived from the function
/// code. The parser never consumes bytes until a complete frame passes the
/// CRC check; on a mismatch (or an unsizable function code) it drops exactly
/// one leading byte and re-attempts interpretation at the next byte. If
/// `MAX_RESYNC_BYTES` consecutive bytes are dropped without completing a
/// valid frame, the stream is reported corrupt.
pub(crate) struct RtuParser {
    dropped: usize,
}

impl RtuParser {
    pub(crate) fn new_response_parser() -> Self {
        Self { dropped: 0 }
    }

    // Returns how to calculate the length of the response body
    fn length_mode(function_code: u8) -> LengthMode {
        // exception responses carry the error bit and a single exception byte
        if function_code & 0x80 != 0 {
            return LengthMode::Fixed(1);
        }

        match FunctionCode::get(function_code) {
            Some(FunctionCode::ReadHoldingRegisters) => LengthMode::Offset(1),
            Some(FunctionCode::WriteSingleRegister) => LengthMode::Fixed(4),
            None => LengthMode::Unknown,
        }
    }

    fn resync(&mut self, buffer: &mut ReadBuffer) -> Result<(), RequestError> {
        buffer.advance(1)?;
        self.dropped += 1;
        if self.dropped >= constants::MAX_RESYNC_BYTES {
            return Err(FrameParseError::ResyncFailure(self.dropped).into());
        }
        Ok(())
    }

    pub(crate) fn parse(
        &mut self,
        buffer: &mut ReadBuffer,
        decode_level: FrameDecodeLevel,
    ) -> Result<Option<Frame>, RequestError> {
        loop {
            if buffer.len() < constants::HEADER_LENGTH + constants::FUNCTION_CODE_LENGTH {
                return Ok(None);
            }

            let unit_id = UnitId::new(buffer.peek_at(0)?);
            let raw_function_code = buffer.peek_at(1)?;

            let body_length = match Self::length_mode(raw_function_code) {
                LengthMode::Fixed(length) => length,
                LengthMode::Offset(offset) => {
                    // the byte-count byte sits at the end of the offset span
                    let count_pos = constants::FUNCTION_CODE_LENGTH + offset;
                    if buffer.len() < constants::HEADER_LENGTH + count_pos {
                        return Ok(None);
                    }
                    offset + buffer.peek_at(constants::HEADER_LENGTH + count_pos - 1)? as usize
                }
                LengthMode::Unknown => {
                    tracing::warn!(
                        "unknown function code {:#04X}, resynchronizing",
                        raw_function_code
                    );
                    self.resync(buffer)?;
                    continue;
                }
            };

            // an over-long body means the stream is desynchronized, not that a
            // giant frame is in flight
            if constants::FUNCTION_CODE_LENGTH + body_length
                > crate::common::frame::constants::MAX_ADU_LENGTH
            {
                tracing::warn!(
                    "implausible body length {} for function code {:#04X}, resynchronizing",
                    body_length,
                    raw_function_code
                );
                self.resync(buffer)?;
                continue;
            }

            let frame_length = constants::HEADER_LENGTH
                + constants::FUNCTION_CODE_LENGTH
                + body_length
                + constants::CRC_LENGTH;

            if buffer.len() < frame_length {
                return Ok(None);
            }

            let crc_span = frame_length - constants::CRC_LENGTH;
            let expected_crc = crc::compute(buffer.peek(crc_span)?);
            let received_crc = {
                let low = buffer.peek_at(crc_span)? as u16;
                let high = buffer.peek_at(crc_span + 1)? as u16;
                (high << 8) | low
            };

            if received_crc != expected_crc {
                tracing::warn!(
                    "CRC mismatch (received {:#06X}, expected {:#06X}), resynchronizing",
                    received_crc,
                    expected_crc
                );
                self.resync(buffer)?;
                continue;
            }

            let mut frame = Frame::new(FrameHeader::new_rtu_header(unit_id));
            {
                let data = buffer.peek(crc_span)?;
                // drop the unit id, keep function code + body
                if !frame.set(&data[constants::HEADER_LENGTH..]) {
                    return Err(FrameParseError::FrameLengthTooBig(
                        crc_span - constants::HEADER_LENGTH,
                        crate::common::frame::constants::MAX_ADU_LENGTH,
                    )
                    .into());
                }
            }
            buffer.advance(frame_length)?;
            self.dropped = 0;

            if decode_level.enabled() {
                tracing::info!(
                    "FRAME RX - unit: {} crc: {:#06X} (payload len = {})",
                    unit_id,
                    received_crc,
                    frame.payload().len()
                );
            }

            return Ok(Some(frame));
        }
    }
}

/// Format a PDU with its RTU envelope, appending the CRC over every preceding
/// byte, low byte first
pub(crate) fn format_rtu(
    buffer: &mut [u8],
    header: FrameHeader,
    pdu: &Pdu,
) -> Result<usize, RequestError> {
    let mut cursor = WriteCursor::new(buffer);
    cursor.write_u8(header.unit_id.value())?;
    pdu.serialize(&mut cursor)?;

    let crc = crc::compute(cursor.written());
    cursor.write_u16_le(crc)?;

    Ok(cursor.position())
}
