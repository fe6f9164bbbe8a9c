//! Modbus-TCP frame parser and encoder.
//!
//! A frame (ADU) is a 7-byte MBAP header followed by the PDU:
//!
//! ```text
//! +----------------+-------------+--------+---------+---------------+---------+
//! | transaction id | protocol id | length | unit id | function code | payload |
//! |    2 bytes     |   2 bytes   | 2 bytes| 1 byte  |    1 byte     |  ...    |
//! +----------------+-------------+--------+---------+---------------+---------+
//! ```
//!
//! `length` counts the unit id plus the PDU. All multi-byte fields are
//! big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the MBAP header including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU allowed by the protocol (function code + data).
pub const MAX_PDU_LEN: usize = 253;

/// Bytes preceding the length-counted part of the header.
const PREFIX_LEN: usize = 6;

/// Function codes with a dedicated request variant.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Quantity limits per request, imposed by the maximum PDU size.
pub const MAX_READ_QUANTITY: u16 = 125;
pub const MAX_WRITE_QUANTITY: u16 = 123;

/// Parsed MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse and validate the header at the start of `input`.
    ///
    /// Fails with `TruncatedFrame` if fewer than 7 bytes are available.
    pub fn parse(input: &[u8]) -> Result<Self, DecodeError> {
        if input.len() < MBAP_HEADER_LEN {
            return Err(DecodeError::TruncatedFrame);
        }

        let mut buf = input;
        let header = MbapHeader {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        };

        if header.protocol_id != 0 {
            return Err(DecodeError::InvalidProtocolId(header.protocol_id));
        }

        // Unit id and function code at least, PDU at most.
        if header.length < 2 || usize::from(header.length) > MAX_PDU_LEN + 1 {
            return Err(DecodeError::MalformedLength(header.length));
        }

        Ok(header)
    }

    /// Total frame size announced by this header.
    pub fn frame_len(&self) -> usize {
        PREFIX_LEN + usize::from(self.length)
    }
}

/// Decoded request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { address: u16, quantity: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    /// Any function code this server does not implement.
    Unknown { function: u8, payload: Bytes },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            Request::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
            Request::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
            Request::Unknown { function, .. } => *function,
        }
    }
}

/// A complete decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MbapHeader,
    pub request: Request,
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

/// Response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Register values, in address order.
    ReadHoldingRegisters(Vec<u16>),
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
    Exception { function: u8, code: ExceptionCode },
}

impl Response {
    /// Function code as sent on the wire (high bit set for exceptions).
    pub fn function_code(&self) -> u8 {
        match self {
            Response::ReadHoldingRegisters(_) => READ_HOLDING_REGISTERS,
            Response::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
            Response::WriteMultipleRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
            Response::Exception { function, .. } => function | 0x80,
        }
    }

    /// PDU length: function code plus payload.
    fn pdu_len(&self) -> usize {
        1 + match self {
            Response::ReadHoldingRegisters(values) => 1 + values.len() * 2,
            Response::WriteSingleRegister { .. } | Response::WriteMultipleRegisters { .. } => 4,
            Response::Exception { .. } => 1,
        }
    }
}

/// Frame decoding errors.
///
/// Everything except `TruncatedFrame` means the stream can no longer be
/// trusted and the connection must be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed to complete the frame.
    TruncatedFrame,
    InvalidProtocolId(u16),
    MalformedLength(u16),
    MalformedPayload { function: u8, reason: &'static str },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TruncatedFrame => write!(f, "truncated frame"),
            DecodeError::InvalidProtocolId(id) => write!(f, "invalid protocol id {id}"),
            DecodeError::MalformedLength(len) => write!(f, "malformed length field {len}"),
            DecodeError::MalformedPayload { function, reason } => {
                write!(f, "malformed payload for function 0x{function:02X}: {reason}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one frame from the start of `input`.
///
/// Returns the frame and the number of bytes it occupies. Bytes after the
/// frame are left for the next call.
pub fn decode(input: &[u8]) -> Result<(Frame, usize), DecodeError> {
    let header = MbapHeader::parse(input)?;
    let frame_len = header.frame_len();
    if input.len() < frame_len {
        return Err(DecodeError::TruncatedFrame);
    }

    let function = input[MBAP_HEADER_LEN];
    let payload = &input[MBAP_HEADER_LEN + 1..frame_len];
    let request = parse_request(function, payload)?;

    Ok((Frame { header, request }, frame_len))
}

fn parse_request(function: u8, payload: &[u8]) -> Result<Request, DecodeError> {
    let malformed = |reason| DecodeError::MalformedPayload { function, reason };
    let mut buf = payload;

    match function {
        READ_HOLDING_REGISTERS | WRITE_SINGLE_REGISTER => {
            if buf.len() != 4 {
                return Err(malformed("expected 4 data bytes"));
            }
            let address = buf.get_u16();
            let word = buf.get_u16();
            Ok(if function == READ_HOLDING_REGISTERS {
                Request::ReadHoldingRegisters {
                    address,
                    quantity: word,
                }
            } else {
                Request::WriteSingleRegister {
                    address,
                    value: word,
                }
            })
        }

        WRITE_MULTIPLE_REGISTERS => {
            if buf.len() < 5 {
                return Err(malformed("missing address, quantity or byte count"));
            }
            let address = buf.get_u16();
            let quantity = buf.get_u16();
            let byte_count = usize::from(buf.get_u8());

            if byte_count != usize::from(quantity) * 2 {
                return Err(malformed("byte count does not match quantity"));
            }
            if buf.len() != byte_count {
                return Err(malformed("byte count does not match data length"));
            }

            let values = (0..quantity).map(|_| buf.get_u16()).collect();
            Ok(Request::WriteMultipleRegisters { address, values })
        }

        _ => Ok(Request::Unknown {
            function,
            payload: Bytes::copy_from_slice(payload),
        }),
    }
}

/// Encode a response frame echoing `transaction_id` and `unit_id`.
pub fn encode(transaction_id: u16, unit_id: u8, response: &Response) -> BytesMut {
    let pdu_len = response.pdu_len();
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + 1 + pdu_len);

    buf.put_u16(transaction_id);
    buf.put_u16(0);
    // Bounded by MAX_PDU_LEN for every response the handler builds.
    buf.put_u16((1 + pdu_len) as u16);
    buf.put_u8(unit_id);
    buf.put_u8(response.function_code());

    match response {
        Response::ReadHoldingRegisters(values) => {
            buf.put_u8((values.len() * 2) as u8);
            for value in values {
                buf.put_u16(*value);
            }
        }
        Response::WriteSingleRegister { address, value } => {
            buf.put_u16(*address);
            buf.put_u16(*value);
        }
        Response::WriteMultipleRegisters { address, quantity } => {
            buf.put_u16(*address);
            buf.put_u16(*quantity);
        }
        Response::Exception { code, .. } => buf.put_u8(*code as u8),
    }

    buf
}
