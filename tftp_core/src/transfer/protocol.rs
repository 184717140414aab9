//! Wire codec for the six TFTP message kinds.
//!
//! Layouts follow RFC 1350, all integers big-endian:
//!
//! | Kind             | Bytes                                        |
//! |------------------|----------------------------------------------|
//! | RRQ / WRQ / DEL  | opcode(2) · filename · 0 · mode · 0          |
//! | DATA             | opcode(2) · block(2) · payload(0..=512)      |
//! | ACK              | opcode(2) · block(2)                         |
//! | ERROR            | opcode(2) · code(2) · message · 0            |
//!
//! DEL (opcode 6) is an extension outside RFC 1350.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use super::constants::{
    HEADER_SIZE, MAX_DATA_SIZE, MAX_PACKET_SIZE, MIN_ERROR_PACKET_SIZE, OCTET_MODE,
};
use crate::error::CodecError;

/// Packet opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read request (RRQ)
    ReadRequest = 1,
    /// Write request (WRQ)
    WriteRequest = 2,
    /// Data block
    Data = 3,
    /// Acknowledgment of a data block, a write request, or a delete
    Ack = 4,
    /// Error report; terminates the transfer and is never acknowledged
    Error = 5,
    /// Delete request (DEL)
    DeleteRequest = 6,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::DeleteRequest),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this opcode opens a new transfer on the well-known port
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::ReadRequest | Self::WriteRequest | Self::DeleteRequest
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::DeleteRequest => "DEL",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error codes carried by ERROR packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    /// Defined by RFC 1350; never produced by this implementation
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTid),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTid => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    DeleteRequest { filename: String, mode: String },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    pub fn read_request(filename: impl Into<String>) -> Self {
        Self::ReadRequest {
            filename: filename.into(),
            mode: OCTET_MODE.to_string(),
        }
    }

    pub fn write_request(filename: impl Into<String>) -> Self {
        Self::WriteRequest {
            filename: filename.into(),
            mode: OCTET_MODE.to_string(),
        }
    }

    pub fn delete_request(filename: impl Into<String>) -> Self {
        Self::DeleteRequest {
            filename: filename.into(),
            mode: OCTET_MODE.to_string(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ReadRequest { .. } => Opcode::ReadRequest,
            Self::WriteRequest { .. } => Opcode::WriteRequest,
            Self::DeleteRequest { .. } => Opcode::DeleteRequest,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
        }
    }

    /// Number of bytes `encode_into` needs for this packet without truncation
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::ReadRequest { filename, mode }
            | Self::WriteRequest { filename, mode }
            | Self::DeleteRequest { filename, mode } => 2 + filename.len() + 1 + mode.len() + 1,
            Self::Data { payload, .. } => HEADER_SIZE + payload.len(),
            Self::Ack { .. } => HEADER_SIZE,
            Self::Error { message, .. } => HEADER_SIZE + message_bytes(message).len() + 1,
        }
    }

    /// Encode into `buf`, returning the number of bytes written.
    ///
    /// ERROR messages are truncated to fit; every other kind fails when the
    /// buffer is too small.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        match self {
            Self::ReadRequest { filename, mode }
            | Self::WriteRequest { filename, mode }
            | Self::DeleteRequest { filename, mode } => {
                encode_request(buf, self.opcode(), filename, mode)
            }
            Self::Data { block, payload } => encode_data(buf, *block, payload),
            Self::Ack { block } => encode_ack(buf, *block),
            Self::Error { code, message } => encode_error(buf, *code, message),
        }
    }

    /// Encode into a freshly allocated buffer.
    ///
    /// ERROR packets never exceed one datagram; longer messages are cut.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let capacity = match self {
            Self::Error { .. } => self.encoded_len().min(MAX_PACKET_SIZE),
            _ => self.encoded_len(),
        };
        let mut buf = vec![0u8; capacity];
        let len = self.encode_into(&mut buf)?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    /// Decode a datagram. Malformed input is an error, never a panic.
    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        let mut buf = datagram;
        if buf.remaining() < 2 {
            return Err(CodecError::Truncated {
                len: datagram.len(),
            });
        }
        let raw = buf.get_u16();
        let opcode = Opcode::from_u16(raw).ok_or(CodecError::UnknownOpcode(raw))?;

        match opcode {
            Opcode::ReadRequest | Opcode::WriteRequest | Opcode::DeleteRequest => {
                let filename = take_cstr(&mut buf, "filename")?;
                let mode = take_cstr(&mut buf, "mode")?;
                let filename = text(filename, "filename")?;
                let mode = text(mode, "mode")?;
                Ok(match opcode {
                    Opcode::ReadRequest => Self::ReadRequest { filename, mode },
                    Opcode::WriteRequest => Self::WriteRequest { filename, mode },
                    _ => Self::DeleteRequest { filename, mode },
                })
            }
            Opcode::Data => {
                if buf.remaining() < 2 {
                    return Err(CodecError::Truncated {
                        len: datagram.len(),
                    });
                }
                let block = buf.get_u16();
                if buf.remaining() > MAX_DATA_SIZE {
                    return Err(CodecError::PayloadTooLarge(buf.remaining()));
                }
                Ok(Self::Data {
                    block,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => {
                if buf.remaining() < 2 {
                    return Err(CodecError::Truncated {
                        len: datagram.len(),
                    });
                }
                Ok(Self::Ack {
                    block: buf.get_u16(),
                })
            }
            Opcode::Error => {
                if buf.remaining() < 2 {
                    return Err(CodecError::Truncated {
                        len: datagram.len(),
                    });
                }
                let code = ErrorCode::from_u16(buf.get_u16()).unwrap_or(ErrorCode::NotDefined);
                // Peers that forget the terminator still get their message through.
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                let message = String::from_utf8_lossy(&buf[..end]).into_owned();
                Ok(Self::Error { code, message })
            }
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest { filename, mode }
            | Self::WriteRequest { filename, mode }
            | Self::DeleteRequest { filename, mode } => {
                write!(f, "{} '{}' ({})", self.opcode(), filename, mode)
            }
            Self::Data { block, payload } => write!(f, "DATA #{} ({} bytes)", block, payload.len()),
            Self::Ack { block } => write!(f, "ACK #{}", block),
            Self::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
        }
    }
}

/// Whether `mode` names the supported octet mode (case-insensitive)
pub fn is_octet_mode(mode: &str) -> bool {
    mode.eq_ignore_ascii_case(OCTET_MODE)
}

/// Write an RRQ/WRQ/DEL packet
pub fn encode_request(
    buf: &mut [u8],
    opcode: Opcode,
    filename: &str,
    mode: &str,
) -> Result<usize, CodecError> {
    if !opcode.is_request() {
        return Err(CodecError::NotARequest(opcode));
    }
    if filename.as_bytes().contains(&0) || mode.as_bytes().contains(&0) {
        return Err(CodecError::EmbeddedNul);
    }
    let needed = 2 + filename.len() + 1 + mode.len() + 1;
    check_capacity(buf, needed)?;

    let mut dst = &mut buf[..];
    dst.put_u16(opcode.as_u16());
    dst.put_slice(filename.as_bytes());
    dst.put_u8(0);
    dst.put_slice(mode.as_bytes());
    dst.put_u8(0);
    Ok(needed)
}

/// Write a DATA packet; the payload must not exceed 512 bytes
pub fn encode_data(buf: &mut [u8], block: u16, payload: &[u8]) -> Result<usize, CodecError> {
    if payload.len() > MAX_DATA_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    let needed = HEADER_SIZE + payload.len();
    check_capacity(buf, needed)?;

    let mut dst = &mut buf[..];
    dst.put_u16(Opcode::Data.as_u16());
    dst.put_u16(block);
    dst.put_slice(payload);
    Ok(needed)
}

/// Write an ACK packet
pub fn encode_ack(buf: &mut [u8], block: u16) -> Result<usize, CodecError> {
    check_capacity(buf, HEADER_SIZE)?;

    let mut dst = &mut buf[..];
    dst.put_u16(Opcode::Ack.as_u16());
    dst.put_u16(block);
    Ok(HEADER_SIZE)
}

/// Write an ERROR packet, truncating the message to fit `buf`.
///
/// The packet is always NUL-terminated; only a buffer shorter than the
/// 5-byte minimum is rejected.
pub fn encode_error(buf: &mut [u8], code: ErrorCode, message: &str) -> Result<usize, CodecError> {
    check_capacity(buf, MIN_ERROR_PACKET_SIZE)?;
    let message = message_bytes(message);
    let copy_len = message.len().min(buf.len() - MIN_ERROR_PACKET_SIZE);

    let mut dst = &mut buf[..];
    dst.put_u16(Opcode::Error.as_u16());
    dst.put_u16(code.as_u16());
    dst.put_slice(&message[..copy_len]);
    dst.put_u8(0);
    Ok(MIN_ERROR_PACKET_SIZE + copy_len)
}

fn check_capacity(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Message bytes up to (not including) the first NUL
fn message_bytes(message: &str) -> &[u8] {
    let bytes = message.as_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Split off a NUL-terminated field, consuming the terminator
fn take_cstr<'a>(buf: &mut &'a [u8], field: &'static str) -> Result<&'a [u8], CodecError> {
    let rest: &'a [u8] = *buf;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::MissingTerminator(field))?;
    let value = &rest[..end];
    buf.advance(end + 1);
    Ok(value)
}

fn text(bytes: &[u8], field: &'static str) -> Result<String, CodecError> {
    if !bytes.is_ascii() {
        return Err(CodecError::InvalidText(field));
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidText(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_packet_scenario_bytes() {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = encode_error(&mut buf, ErrorCode::FileNotFound, "missing").unwrap();
        assert_eq!(
            &buf[..len],
            &[0, 5, 0, 1, b'm', b'i', b's', b's', b'i', b'n', b'g', 0]
        );
    }

    #[test]
    fn test_error_packet_truncates_message() {
        let mut buf = [0u8; 9];
        let len = encode_error(&mut buf, ErrorCode::AccessViolation, "file busy").unwrap();
        assert_eq!(len, 9);
        assert_eq!(&buf, &[0, 5, 0, 2, b'f', b'i', b'l', b'e', 0]);

        match Packet::decode(&buf[..len]).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, ErrorCode::AccessViolation);
                assert_eq!(message, "file");
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_error_packet_to_bytes_fits_one_datagram() {
        let message = "m".repeat(900);
        let bytes = Packet::error(ErrorCode::IllegalOperation, message).to_bytes().unwrap();
        assert_eq!(bytes.len(), MAX_PACKET_SIZE);
        assert_eq!(bytes[bytes.len() - 1], 0);

        match Packet::decode(&bytes).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, ErrorCode::IllegalOperation);
                assert_eq!(message.len(), MAX_PACKET_SIZE - MIN_ERROR_PACKET_SIZE);
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_error_packet_header_only() {
        let mut buf = [0u8; 5];
        let len = encode_error(&mut buf, ErrorCode::NotDefined, "dropped entirely").unwrap();
        assert_eq!(&buf[..len], &[0, 5, 0, 0, 0]);

        let mut tiny = [0u8; 4];
        assert!(matches!(
            encode_error(&mut tiny, ErrorCode::NotDefined, "x"),
            Err(CodecError::BufferTooSmall { needed: 5, .. })
        ));
    }

    #[test]
    fn test_ack_round_trip_every_block() {
        let mut buf = [0u8; HEADER_SIZE];
        for block in 0..=u16::MAX {
            encode_ack(&mut buf, block).unwrap();
            assert_eq!(Packet::decode(&buf).unwrap(), Packet::Ack { block });
        }
    }

    #[test]
    fn test_data_limits() {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let payload = [7u8; MAX_DATA_SIZE + 1];
        assert!(matches!(
            encode_data(&mut buf, 1, &payload),
            Err(CodecError::PayloadTooLarge(513))
        ));

        let mut small = [0u8; 10];
        assert!(matches!(
            encode_data(&mut small, 1, &[1u8; 8]),
            Err(CodecError::BufferTooSmall { needed: 12, .. })
        ));

        let len = encode_data(&mut buf, 42, &[9u8; 300]).unwrap();
        assert_eq!(len, 304);
        match Packet::decode(&buf[..len]).unwrap() {
            Packet::Data { block, payload } => {
                assert_eq!(block, 42);
                assert_eq!(payload.len(), 300);
            }
            other => panic!("Expected DATA, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_data_packet() {
        let bytes = Packet::Data {
            block: 3,
            payload: Bytes::new(),
        }
        .to_bytes()
        .unwrap();
        assert_eq!(&bytes[..], &[0, 3, 0, 3]);
    }

    #[test]
    fn test_request_layout() {
        let bytes = Packet::delete_request("a.txt").to_bytes().unwrap();
        assert_eq!(&bytes[..], b"\x00\x06a.txt\x00octet\x00");

        let decoded = Packet::decode(b"\x00\x01boot.img\x00OCTET\x00").unwrap();
        assert_eq!(
            decoded,
            Packet::ReadRequest {
                filename: "boot.img".to_string(),
                mode: "OCTET".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_requests_are_errors() {
        assert!(matches!(
            Packet::decode(b"\x00\x02name-without-end"),
            Err(CodecError::MissingTerminator("filename"))
        ));
        assert!(matches!(
            Packet::decode(b"\x00\x02name\x00octet"),
            Err(CodecError::MissingTerminator("mode"))
        ));
        assert!(matches!(
            Packet::decode(b"\x00\x01\xff\xfe\x00octet\x00"),
            Err(CodecError::InvalidText("filename"))
        ));
        assert!(matches!(
            Packet::decode(&[0]),
            Err(CodecError::Truncated { len: 1 })
        ));
        assert!(matches!(
            Packet::decode(&[0, 9, 0, 0]),
            Err(CodecError::UnknownOpcode(9))
        ));
        assert!(matches!(
            Packet::decode(&[0, 4, 1]),
            Err(CodecError::Truncated { len: 3 })
        ));
    }

    #[test]
    fn test_oversized_data_rejected_on_decode() {
        let mut datagram = vec![0, 3, 0, 1];
        datagram.extend_from_slice(&[0u8; MAX_DATA_SIZE + 1]);
        assert!(matches!(
            Packet::decode(&datagram),
            Err(CodecError::PayloadTooLarge(513))
        ));
    }

    #[test]
    fn test_request_rejects_embedded_nul() {
        let mut buf = [0u8; 64];
        assert!(matches!(
            encode_request(&mut buf, Opcode::ReadRequest, "a\0b", OCTET_MODE),
            Err(CodecError::EmbeddedNul)
        ));
        assert!(matches!(
            encode_request(&mut buf, Opcode::Data, "a", OCTET_MODE),
            Err(CodecError::NotARequest(Opcode::Data))
        ));
    }

    #[test]
    fn test_octet_mode_is_case_insensitive() {
        assert!(is_octet_mode("octet"));
        assert!(is_octet_mode("OcTeT"));
        assert!(!is_octet_mode("netascii"));
        assert!(!is_octet_mode("octets"));
    }

    #[test]
    fn test_unknown_error_code_maps_to_not_defined() {
        match Packet::decode(b"\x00\x05\x00\x63oops\x00").unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotDefined);
                assert_eq!(message, "oops");
            }
            other => panic!("Expected ERROR, got {:?}", other),
        }
    }
}
