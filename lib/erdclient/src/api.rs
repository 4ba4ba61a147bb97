//! ERD API payload layouts. Keys and data are big-endian on the wire;
//! data passes through byte-for-byte and is never interpreted here.

use byteorder::{BigEndian, ByteOrder};

pub type Erd = u16;

pub const READ_REQUEST: u8 = 0xF0;
pub const READ_RESPONSE: u8 = 0xF0;
pub const WRITE_REQUEST: u8 = 0xF1;
pub const WRITE_RESPONSE: u8 = 0xF1;

/// `command, erd_count, erd_msb, erd_lsb`
pub const READ_REQUEST_SIZE: usize = 4;
/// `command, erd_count, erd_msb, erd_lsb, data_size`
pub const READ_RESPONSE_HEADER_SIZE: usize = 5;
/// `command, erd_count, erd_msb, erd_lsb, data_size`
pub const WRITE_REQUEST_HEADER_SIZE: usize = 5;
/// `command, erd_count, erd_msb, erd_lsb`
pub const WRITE_RESPONSE_SIZE: usize = 4;

pub fn write_read_request(payload: &mut [u8], erd: Erd) {
    payload[0] = READ_REQUEST;
    payload[1] = 1;
    BigEndian::write_u16(&mut payload[2..4], erd);
}

pub fn write_write_request(payload: &mut [u8], erd: Erd, data: &[u8]) {
    payload[0] = WRITE_REQUEST;
    payload[1] = 1;
    BigEndian::write_u16(&mut payload[2..4], erd);
    payload[4] = data.len() as u8;
    payload[WRITE_REQUEST_HEADER_SIZE..WRITE_REQUEST_HEADER_SIZE + data.len()].copy_from_slice(data);
}

pub struct ReadResponse<'a> {
    pub erd: Erd,
    pub data: &'a [u8],
}

/// Parses a read response, requiring a single ERD and a data size that
/// agrees with the payload length. Malformed responses yield `None`.
pub fn parse_read_response(payload: &[u8]) -> Option<ReadResponse<'_>> {
    if payload.len() < READ_RESPONSE_HEADER_SIZE {
        return None;
    }

    let data_size = payload[4] as usize;
    if payload[1] != 1 || payload.len() != READ_RESPONSE_HEADER_SIZE + data_size {
        return None;
    }

    Some(ReadResponse {
        erd: BigEndian::read_u16(&payload[2..4]),
        data: &payload[READ_RESPONSE_HEADER_SIZE..],
    })
}

/// Parses a write response: exactly one ERD and no trailing data.
pub fn parse_write_response(payload: &[u8]) -> Option<Erd> {
    if payload.len() != WRITE_RESPONSE_SIZE || payload[1] != 1 {
        return None;
    }

    Some(BigEndian::read_u16(&payload[2..4]))
}
