/// precomputes the CRC table as a constant!
const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// Compute the CRC-16/MODBUS checksum of a byte span.
///
/// Deterministic and order-sensitive. RTU framing appends the result low byte
/// first; verification recomputes over everything except the trailing two
/// bytes and compares.
pub(crate) fn compute(bytes: &[u8]) -> u16 {
    CRC.checksum(bytes)
}
