use crate::common::cursor::{ReadCursor, WriteCursor};
use crate::common::function::FunctionCode;
use crate::decode::AppDecodeLevel;
use crate::error::{AduParseError, InternalError, RequestError};
use crate::exception::ExceptionCode;
use crate::types::{AddressRange, Indexed};

/// A protocol data unit: function code plus type-specific fields,
/// transport-agnostic.
///
/// This is a closed set: every request variant has exactly one matching
/// response variant, and an exception response may substitute for any
/// request's normal response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Pdu {
    /// Read a contiguous span of holding registers
    ReadHoldingRegistersRequest(AddressRange),
    /// Register values returned for a read request, in address order
    ReadHoldingRegistersResponse(Vec<u16>),
    /// Write a value to a single register
    WriteSingleRegisterRequest(Indexed<u16>),
    /// Echo of a successful single-register write
    WriteSingleRegisterResponse(Indexed<u16>),
    /// The server rejected the request
    ExceptionResponse {
        /// function code of the request that failed, without the error bit
        function: u8,
        /// exception code returned by the server
        exception: ExceptionCode,
    },
}

impl Pdu {
    /// The raw function code byte as it appears on the wire
    pub(crate) fn raw_function(&self) -> u8 {
        match self {
            Pdu::ReadHoldingRegistersRequest(_) | Pdu::ReadHoldingRegistersResponse(_) => {
                FunctionCode::ReadHoldingRegisters.get_value()
            }
            Pdu::WriteSingleRegisterRequest(_) | Pdu::WriteSingleRegisterResponse(_) => {
                FunctionCode::WriteSingleRegister.get_value()
            }
            Pdu::ExceptionResponse { function, .. } => function | 0x80,
        }
    }

    /// Serialize the function code and body
    pub(crate) fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
        cursor.write_u8(self.raw_function())?;
        match self {
            Pdu::ReadHoldingRegistersRequest(range) => {
                cursor.write_u16_be(range.start)?;
                cursor.write_u16_be(range.count)?;
            }
            Pdu::ReadHoldingRegistersResponse(values) => {
                let byte_count = values.len() * 2;
                let byte_count = u8::try_from(byte_count)
                    .map_err(|_| InternalError::AduTooBig(byte_count))?;
                cursor.write_u8(byte_count)?;
                for value in values {
                    cursor.write_u16_be(*value)?;
                }
            }
            Pdu::WriteSingleRegisterRequest(value) | Pdu::WriteSingleRegisterResponse(value) => {
                cursor.write_u16_be(value.index)?;
                cursor.write_u16_be(value.value)?;
            }
            Pdu::ExceptionResponse { exception, .. } => {
                cursor.write_u8((*exception).into())?;
            }
        }
        Ok(())
    }

    /// Parse a request PDU, validating the embedded parameters.
    ///
    /// The gateway is a client and never receives requests off the wire;
    /// this is the inverse half of the round-trip property.
    #[cfg(test)]
    pub(crate) fn parse_request(cursor: &mut ReadCursor) -> Result<Self, RequestError> {
        let raw = cursor.read_u8()?;
        let function = FunctionCode::get(raw)
            .ok_or(crate::error::FrameParseError::UnknownFunctionCode(raw))?;

        let pdu = match function {
            FunctionCode::ReadHoldingRegisters => {
                let start = cursor.read_u16_be()?;
                let count = cursor.read_u16_be()?;
                Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(start, count)?)
            }
            FunctionCode::WriteSingleRegister => {
                let index = cursor.read_u16_be()?;
                let value = cursor.read_u16_be()?;
                Pdu::WriteSingleRegisterRequest(Indexed::new(index, value))
            }
        };
        cursor.expect_empty()?;
        Ok(pdu)
    }

    /// Parse a response PDU to a request with the given function code.
    ///
    /// The function code on the wire must be either the expected code or the
    /// expected code with the error bit set; anything else is a protocol
    /// anomaly reported as `UnknownResponseFunction`.
    pub(crate) fn parse_response(
        function: FunctionCode,
        cursor: &mut ReadCursor,
    ) -> Result<Self, RequestError> {
        let raw = cursor.read_u8()?;

        if raw == function.as_error() {
            let exception = ExceptionCode::from(cursor.read_u8()?);
            cursor.expect_empty()?;
            return Ok(Pdu::ExceptionResponse {
                function: function.get_value(),
                exception,
            });
        }

        if raw != function.get_value() {
            return Err(AduParseError::UnknownResponseFunction(
                raw,
                function.get_value(),
                function.as_error(),
            )
            .into());
        }

        let pdu = match function {
            FunctionCode::ReadHoldingRegisters => {
                let byte_count = cursor.read_u8()? as usize;
                if byte_count != cursor.len() {
                    return Err(AduParseError::InsufficientBytesForByteCount(
                        byte_count,
                        cursor.len(),
                    )
                    .into());
                }
                let mut values = Vec::with_capacity(byte_count / 2);
                for _ in 0..(byte_count / 2) {
                    values.push(cursor.read_u16_be()?);
                }
                Pdu::ReadHoldingRegistersResponse(values)
            }
            FunctionCode::WriteSingleRegister => {
                let index = cursor.read_u16_be()?;
                let value = cursor.read_u16_be()?;
                Pdu::WriteSingleRegisterResponse(Indexed::new(index, value))
            }
        };
        cursor.expect_empty()?;
        Ok(pdu)
    }

    /// Validate a parsed response against the request it answers.
    ///
    /// An exception response resolves the request with the exception as the
    /// error; a mismatched normal response is a parse error.
    pub(crate) fn validate_response(request: &Pdu, response: &Pdu) -> Result<(), RequestError> {
        match (request, response) {
            (Pdu::ReadHoldingRegistersRequest(range), Pdu::ReadHoldingRegistersResponse(values)) => {
                if values.len() != range.count as usize {
                    return Err(AduParseError::RequestByteCountMismatch(
                        range.count as usize * 2,
                        values.len() * 2,
                    )
                    .into());
                }
                Ok(())
            }
            (Pdu::WriteSingleRegisterRequest(request), Pdu::WriteSingleRegisterResponse(echo)) => {
                if request != echo {
                    return Err(AduParseError::ReplyEchoMismatch.into());
                }
                Ok(())
            }
            (_, Pdu::ExceptionResponse { exception, .. }) => Err((*exception).into()),
            (request, response) => Err(AduParseError::UnknownResponseFunction(
                response.raw_function(),
                request.raw_function(),
                request.raw_function() | 0x80,
            )
            .into()),
        }
    }
}

pub(crate) struct PduDisplay<'a> {
    pdu: &'a Pdu,
    level: AppDecodeLevel,
}

impl<'a> PduDisplay<'a> {
    pub(crate) fn new(level: AppDecodeLevel, pdu: &'a Pdu) -> Self {
        Self { pdu, level }
    }
}

impl std::fmt::Display for PduDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "fc: {:#04X}", self.pdu.raw_function())?;
        if !self.level.data_values() {
            return Ok(());
        }
        match self.pdu {
            Pdu::ReadHoldingRegistersRequest(range) => write!(f, " {range}"),
            Pdu::ReadHoldingRegistersResponse(values) => {
                for value in values {
                    write!(f, " {value:#06X}")?;
                }
                Ok(())
            }
            Pdu::WriteSingleRegisterRequest(value) | Pdu::WriteSingleRegisterResponse(value) => {
                write!(f, " {value}")
            }
            Pdu::ExceptionResponse { exception, .. } => write!(f, " exception: {exception}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(pdu: &Pdu) -> Vec<u8> {
        let mut buffer = [0u8; 256];
        let mut cursor = WriteCursor::new(&mut buffer);
        pdu.serialize(&mut cursor).unwrap();
        cursor.written().to_vec()
    }

    #[test]
    fn read_request_round_trips() {
        let pdu = Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(0, 1).unwrap());
        let bytes = serialize(&pdu);
        assert_eq!(bytes, [0x03, 0x00, 0x00, 0x00, 0x01]);
        let parsed = Pdu::parse_request(&mut ReadCursor::new(&bytes)).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn read_response_round_trips() {
        let pdu = Pdu::ReadHoldingRegistersResponse(vec![0x1234, 0x5678]);
        let bytes = serialize(&pdu);
        assert_eq!(bytes, [0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
        let parsed = Pdu::parse_response(
            FunctionCode::ReadHoldingRegisters,
            &mut ReadCursor::new(&bytes),
        )
        .unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn write_request_and_echo_round_trip() {
        let request = Pdu::WriteSingleRegisterRequest(Indexed::new(0x0010, 0x1234));
        let bytes = serialize(&request);
        assert_eq!(bytes, [0x06, 0x00, 0x10, 0x12, 0x34]);
        assert_eq!(
            Pdu::parse_request(&mut ReadCursor::new(&bytes)).unwrap(),
            request
        );

        let response = Pdu::parse_response(
            FunctionCode::WriteSingleRegister,
            &mut ReadCursor::new(&bytes[..]),
        )
        .unwrap();
        assert_eq!(
            response,
            Pdu::WriteSingleRegisterResponse(Indexed::new(0x0010, 0x1234))
        );
        assert_eq!(Pdu::validate_response(&request, &response), Ok(()));
    }

    #[test]
    fn exception_response_round_trips_and_fails_the_request() {
        let pdu = Pdu::ExceptionResponse {
            function: 0x03,
            exception: ExceptionCode::IllegalDataAddress,
        };
        let bytes = serialize(&pdu);
        assert_eq!(bytes, [0x83, 0x02]);

        let parsed = Pdu::parse_response(
            FunctionCode::ReadHoldingRegisters,
            &mut ReadCursor::new(&bytes),
        )
        .unwrap();
        assert_eq!(parsed, pdu);

        let request = Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(0, 1).unwrap());
        assert_eq!(
            Pdu::validate_response(&request, &parsed),
            Err(RequestError::Exception(ExceptionCode::IllegalDataAddress))
        );
    }

    #[test]
    fn unknown_response_function_is_an_anomaly_not_a_crash() {
        let bytes = [0x04, 0x02, 0x00, 0x00];
        let err = Pdu::parse_response(
            FunctionCode::ReadHoldingRegisters,
            &mut ReadCursor::new(&bytes),
        )
        .unwrap_err();
        assert_eq!(
            err,
            RequestError::BadResponse(AduParseError::UnknownResponseFunction(0x04, 0x03, 0x83))
        );
    }

    #[test]
    fn read_response_with_wrong_byte_count_is_rejected() {
        // byte count claims 4 but only 2 bytes follow
        let bytes = [0x03, 0x04, 0x12, 0x34];
        let err = Pdu::parse_response(
            FunctionCode::ReadHoldingRegisters,
            &mut ReadCursor::new(&bytes),
        )
        .unwrap_err();
        assert_eq!(
            err,
            RequestError::BadResponse(AduParseError::InsufficientBytesForByteCount(4, 2))
        );
    }

    #[test]
    fn read_response_with_fewer_registers_than_requested_is_rejected() {
        let request = Pdu::ReadHoldingRegistersRequest(AddressRange::try_from(0, 2).unwrap());
        let response = Pdu::ReadHoldingRegistersResponse(vec![0x0001]);
        assert_eq!(
            Pdu::validate_response(&request, &response),
            Err(RequestError::BadResponse(
                AduParseError::RequestByteCountMismatch(4, 2)
            ))
        );
    }

    #[test]
    fn write_echo_mismatch_is_rejected() {
        let request = Pdu::WriteSingleRegisterRequest(Indexed::new(1, 2));
        let response = Pdu::WriteSingleRegisterResponse(Indexed::new(1, 3));
        assert_eq!(
            Pdu::validate_response(&request, &response),
            Err(RequestError::BadResponse(AduParseError::ReplyEchoMismatch))
        );
    }

    #[test]
    fn request_with_trailing_bytes_is_rejected() {
        let bytes = [0x03, 0x00, 0x00, 0x00, 0x01, 0xFF];
        let err = Pdu::parse_request(&mut ReadCursor::new(&bytes)).unwrap_err();
        assert_eq!(err, RequestError::BadResponse(AduParseError::TrailingBytes(1)));
    }
}
