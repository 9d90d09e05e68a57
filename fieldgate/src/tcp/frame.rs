use crate::common::buffer::ReadBuffer;
use crate::common::cursor::WriteCursor;
use crate::common::frame::{Frame, FrameHeader, TxId};
use crate::common::pdu::Pdu;
use crate::decode::FrameDecodeLevel;
use crate::error::{FrameParseError, InternalError, RequestError};
use crate::types::UnitId;

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 7;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::common::frame::constants::MAX_ADU_LENGTH;
    // includes the 1 byte unit id
    pub(crate) const MAX_LENGTH_FIELD: usize =
        crate::common::frame::constants::MAX_ADU_LENGTH + 1;
}

#[derive(Clone, Copy)]
struct MbapHeader {
    tx_id: TxId,
    adu_length: usize,
    unit_id: UnitId,
}

#[derive(Clone, Copy)]
enum ParseState {
    Begin,
    Header(MbapHeader),
}

/// Parses the MBAP envelope: `tx_id, protocol_id == 0, length, unit_id`
/// followed by `length - 1` PDU bytes.
pub(crate) struct MbapParser {
    state: ParseState,
}

impl MbapParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Begin,
        }
    }

    fn parse_header(buffer: &mut ReadBuffer) -> Result<MbapHeader, RequestError> {
        let tx_id = TxId::new(buffer.read_u16_be()?);
        let protocol_id = buffer.read_u16_be()?;
        let length = buffer.read_u16_be()? as usize;
        let unit_id = UnitId::new(buffer.read_u8()?);

        if protocol_id != 0 {
            return Err(FrameParseError::UnknownProtocolId(protocol_id).into());
        }

        if length > constants::MAX_LENGTH_FIELD {
            return Err(
                FrameParseError::MbapLengthTooBig(length, constants::MAX_LENGTH_FIELD).into(),
            );
        }

        // must be > 0 b/c the 1-byte unit identifier counts towards length
        if length == 0 {
            return Err(FrameParseError::MbapLengthZero.into());
        }

        Ok(MbapHeader {
            tx_id,
            adu_length: length - 1,
            unit_id,
        })
    }

    fn parse_body(header: &MbapHeader, buffer: &mut ReadBuffer) -> Result<Frame, RequestError> {
        let mut frame = Frame::new(FrameHeader::new_tcp_header(header.unit_id, header.tx_id));
        if !frame.set(buffer.read(header.adu_length)?) {
            return Err(FrameParseError::FrameLengthTooBig(
                header.adu_length,
                crate::common::frame::constants::MAX_ADU_LENGTH,
            )
            .into());
        }
        Ok(frame)
    }

    pub(crate) fn parse(
        &mut self,
        buffer: &mut ReadBuffer,
        decode_level: FrameDecodeLevel,
    ) -> Result<Option<Frame>, RequestError> {
        match self.state {
            ParseState::Header(header) => {
                if buffer.len() < header.adu_length {
                    return Ok(None);
                }

                let frame = Self::parse_body(&header, buffer)?;
                self.state = ParseState::Begin;

                if decode_level.enabled() {
                    tracing::info!(
                        "FRAME RX - tx_id: {} unit: {} (payload len = {})",
                        header.tx_id,
                        header.unit_id,
                        frame.payload().len()
                    );
                }

                Ok(Some(frame))
            }
            ParseState::Begin => {
                if buffer.len() < constants::HEADER_LENGTH {
                    return Ok(None);
                }

                self.state = ParseState::Header(Self::parse_header(buffer)?);
                self.parse(buffer, decode_level)
            }
        }
    }
}

/// Format a PDU with its MBAP envelope, recomputing the length field from the
/// serialized PDU body
pub(crate) fn format_mbap(
    buffer: &mut [u8],
    header: FrameHeader,
    pdu: &Pdu,
) -> Result<usize, RequestError> {
    let mut cursor = WriteCursor::new(buffer);
    cursor.write_u16_be(header.tx_id.unwrap_or_default().to_u16())?;
    cursor.write_u16_be(0)?;
    cursor.seek_from_current(2)?; // write the length later
    cursor.write_u8(header.unit_id.value())?;

    let adu_length: usize = {
        let start = cursor.position();
        pdu.serialize(&mut cursor)?;
        cursor.position() - start
    };

    {
        // write the resulting length
        let length = u16::try_from(adu_length + 1)
            .map_err(|_| InternalError::AduTooBig(adu_length))?;
        let end = cursor.position();
        cursor.seek_from_start(4)?;
        cursor.write_u16_be(length)?;
        cursor.seek_from_start(end)?;
    }

    Ok(constants::HEADER_LENGTH + adu_length)
}

#[cfg(test)]
mod tests {
    use tokio_test::block_on;
    use tokio_test::io::Builder;

    use super::*;
    use crate::common::frame::{FrameWriter, FramedReader};
    use crate::common::function::FunctionCode;
    use crate::common::phys::PhysLayer;
    use crate::decode::DecodeLevel;
    use crate::types::{AddressRange, Indexed};

    //                                  |   tx id  |  proto id |  length  | unit |      pdu      |
    const READ_REQUEST_FRAME: &[u8] = &[
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01,
    ];

    const READ_RESPONSE_FRAME: &[u8] = &[
        0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34,
    ];

    fn parse_one(io: tokio_test::io::Mock) -> Result<Frame, RequestError> {
        let mut phys = PhysLayer::new_mock(io);
        let mut reader = FramedReader::tcp();
        block_on(reader.next_frame(&mut phys, DecodeLevel::nothing()))
    }

    fn assert_equals_read_request_frame(frame: &Frame) {
        assert_eq!(frame.header.tx_id, Some(TxId::new(0x0001)));
        assert_eq!(frame.header.unit_id, UnitId::new(0x01));
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn correctly_formats_read_request_frame() {
        let mut writer = FrameWriter::tcp();
        let pdu = Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(0, 1).unwrap());
        let header = FrameHeader::new_tcp_header(UnitId::new(1), TxId::new(1));
        let bytes = writer.format(header, &pdu, DecodeLevel::nothing()).unwrap();
        assert_eq!(bytes, READ_REQUEST_FRAME);
    }

    #[test]
    fn correctly_formats_read_response_frame() {
        let mut writer = FrameWriter::tcp();
        let pdu = Pdu::ReadHoldingRegistersResponse(vec![0x1234]);
        let header = FrameHeader::new_tcp_header(UnitId::new(1), TxId::new(1));
        let bytes = writer.format(header, &pdu, DecodeLevel::nothing()).unwrap();
        assert_eq!(bytes, READ_RESPONSE_FRAME);
        assert_eq!(bytes.len(), 11);
    }

    #[test]
    fn correctly_formats_write_single_frame() {
        let mut writer = FrameWriter::tcp();
        let pdu = Pdu::WriteSingleRegisterRequest(Indexed::new(0x0010, 0x1234));
        let header = FrameHeader::new_tcp_header(UnitId::new(0x2A), TxId::new(7));
        let bytes = writer.format(header, &pdu, DecodeLevel::nothing()).unwrap();
        assert_eq!(
            bytes,
            [0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x2A, 0x06, 0x00, 0x10, 0x12, 0x34]
        );
    }

    #[test]
    fn can_parse_frame_from_stream() {
        let io = Builder::new().read(READ_REQUEST_FRAME).build();
        let frame = parse_one(io).unwrap();
        assert_equals_read_request_frame(&frame);

        // and the payload decodes to the read request PDU
        let pdu =
            Pdu::parse_request(&mut crate::common::cursor::ReadCursor::new(frame.payload()))
                .unwrap();
        assert_eq!(
            pdu,
            Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(0, 1).unwrap())
        );
    }

    #[test]
    fn can_parse_frame_split_at_every_boundary() {
        // fragmentation invariance: every 2-chunk split decodes identically
        for split_at in 1..READ_REQUEST_FRAME.len() {
            let (f1, f2) = READ_REQUEST_FRAME.split_at(split_at);
            let io = Builder::new().read(f1).read(f2).build();
            let frame = parse_one(io).unwrap();
            assert_equals_read_request_frame(&frame);
        }
    }

    #[test]
    fn can_parse_frame_byte_per_byte() {
        let mut builder = Builder::new();
        for byte in READ_REQUEST_FRAME {
            builder.read(&[*byte]);
        }
        let frame = parse_one(builder.build()).unwrap();
        assert_equals_read_request_frame(&frame);
    }

    #[test]
    fn can_parse_two_frames_from_single_chunk() {
        let chunk: Vec<u8> = READ_REQUEST_FRAME
            .iter()
            .chain(READ_RESPONSE_FRAME.iter())
            .copied()
            .collect();
        let io = Builder::new().read(&chunk).build();
        let mut phys = PhysLayer::new_mock(io);
        let mut reader = FramedReader::tcp();

        let first = block_on(reader.next_frame(&mut phys, DecodeLevel::nothing())).unwrap();
        assert_equals_read_request_frame(&first);

        let second = block_on(reader.next_frame(&mut phys, DecodeLevel::nothing())).unwrap();
        assert_eq!(second.payload(), &[0x03, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn can_parse_maximum_size_frame() {
        // maximum ADU length is 253, so max MBAP length value is 254 which is 0xFE
        let header = &[0x00, 0x07, 0x00, 0x00, 0x00, 0xFE, 0x2A];
        let payload = &[0xCC; 253];

        let io = Builder::new().read(header).read(payload).build();
        let frame = parse_one(io).unwrap();
        assert_eq!(frame.payload(), payload.as_ref());
    }

    #[test]
    fn round_trips_every_pdu_variant() {
        let pdus = [
            Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(0x10, 3).unwrap()),
            Pdu::ReadHoldingRegistersResponse(vec![0x0001, 0x0002, 0x0003]),
            Pdu::WriteSingleRegisterRequest(Indexed::new(0x0010, 0x1234)),
            Pdu::WriteSingleRegisterResponse(Indexed::new(0x0010, 0x1234)),
            Pdu::ExceptionResponse {
                function: 0x03,
                exception: crate::exception::ExceptionCode::IllegalDataAddress,
            },
        ];

        for pdu in pdus {
            let mut writer = FrameWriter::tcp();
            let header = FrameHeader::new_tcp_header(UnitId::new(0x2A), TxId::new(7));
            let bytes = writer
                .format(header, &pdu, DecodeLevel::nothing())
                .unwrap()
                .to_vec();

            let io = Builder::new().read(&bytes).build();
            let frame = parse_one(io).unwrap();
            assert_eq!(frame.header.tx_id, Some(TxId::new(7)));
            assert_eq!(frame.header.unit_id, UnitId::new(0x2A));

            let mut cursor = crate::common::cursor::ReadCursor::new(frame.payload());
            let parsed = match &pdu {
                Pdu::ReadHoldingRegistersRequest(_) | Pdu::WriteSingleRegisterRequest(_) => {
                    Pdu::parse_request(&mut cursor).unwrap()
                }
                Pdu::WriteSingleRegisterResponse(_) => {
                    Pdu::parse_response(FunctionCode::WriteSingleRegister, &mut cursor).unwrap()
                }
                _ => Pdu::parse_response(FunctionCode::ReadHoldingRegisters, &mut cursor).unwrap(),
            };
            assert_eq!(parsed, pdu);
        }
    }

    #[test]
    fn errors_on_bad_protocol_id() {
        let frame = &[0x00, 0x07, 0xCA, 0xFE, 0x00, 0x01, 0x2A];
        let err = parse_one(Builder::new().read(frame).build()).unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::UnknownProtocolId(0xCAFE))
        );
    }

    #[test]
    fn errors_on_length_of_zero() {
        let frame = &[0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x2A];
        let err = parse_one(Builder::new().read(frame).build()).unwrap_err();
        assert_eq!(err, RequestError::BadFrame(FrameParseError::MbapLengthZero));
    }

    #[test]
    fn errors_when_mbap_length_too_big() {
        let frame = &[0x00, 0x07, 0x00, 0x00, 0x00, 0xFF, 0x2A];
        let err = parse_one(Builder::new().read(frame).build()).unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::MbapLengthTooBig(
                0xFF,
                constants::MAX_LENGTH_FIELD
            ))
        );
    }
}
