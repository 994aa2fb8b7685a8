//! Scrutiny protocol frame types and wire constants.
//!
//! Frames are big-endian throughout:
//!
//! ```text
//! request : cmd(1) subfn(1) len(2) data(len) crc(4)
//! response: cmd|0x80(1) subfn(1) code(1) len(2) data(len) crc(4)
//! ```

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::crc::crc32_chunks;

/// High bit of the command byte, set on device-to-server frames.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Bytes a frame occupies on the wire beyond its data: request header (4)
/// plus CRC (4), response header (5) plus CRC (4).
pub const REQUEST_OVERHEAD: usize = 8;
pub const RESPONSE_OVERHEAD: usize = 9;

/// Fixed byte sequence the device expects in a Discover request. Opaque; the
/// device compares it literally.
pub const DISCOVER_MAGIC: [u8; 4] = [0x7E, 0x18, 0xFC, 0x68];

/// Fixed byte sequence the device expects in a Connect request.
pub const CONNECT_MAGIC: [u8; 4] = [0x82, 0x90, 0x22, 0x66];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandId {
    GetInfo = 1,
    CommControl = 2,
    MemoryControl = 3,
    DataLogControl = 4,
    UserCommand = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum GetInfoSubfn {
    ProtocolVersion = 1,
    SoftwareId = 2,
    SupportedFeatures = 3,
    SpecialMemoryRegionCount = 4,
    SpecialMemoryRegionLocation = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommControlSubfn {
    Discover = 1,
    Heartbeat = 2,
    GetParams = 3,
    Connect = 4,
    Disconnect = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MemoryControlSubfn {
    Read = 1,
    Write = 2,
    ReadRpv = 3,
    WriteRpv = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    InvalidRequest = 1,
    UnsupportedFeature = 2,
    Overflow = 3,
    Busy = 4,
    FailureToProceed = 5,
    Forbidden = 6,
}

/// Width of device addresses on the wire, announced during info poll. All
/// address encodings use exactly this width, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AddressSize {
    B8 = 1,
    B16 = 2,
    B32 = 4,
    B64 = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("address 0x{address:X} does not fit in {width} bytes")]
pub struct AddressOverflow {
    pub address: u64,
    pub width: u8,
}

impl AddressSize {
    pub fn nbytes(self) -> usize {
        u8::from(self) as usize
    }

    /// Largest address representable at this width.
    pub fn max_address(self) -> u64 {
        match self {
            AddressSize::B64 => u64::MAX,
            _ => (1u64 << (self.nbytes() * 8)) - 1,
        }
    }

    pub fn encode(self, address: u64, out: &mut Vec<u8>) -> Result<(), AddressOverflow> {
        if address > self.max_address() {
            return Err(AddressOverflow {
                address,
                width: self.nbytes() as u8,
            });
        }
        out.extend_from_slice(&address.to_be_bytes()[8 - self.nbytes()..]);
        Ok(())
    }

    pub fn decode(self, bytes: &[u8]) -> u64 {
        debug_assert_eq!(bytes.len(), self.nbytes());
        let mut buf = [0u8; 8];
        buf[8 - bytes.len()..].copy_from_slice(bytes);
        u64::from_be_bytes(buf)
    }
}

/// A server-to-device frame, CRC computed at serialization time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: CommandId,
    pub subfunction: u8,
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(command: CommandId, subfunction: impl Into<u8>, data: Vec<u8>) -> Self {
        Request {
            command,
            subfunction: subfunction.into(),
            data,
        }
    }

    /// Total frame size on the wire, header and CRC included.
    pub fn size_on_wire(&self) -> usize {
        REQUEST_OVERHEAD + self.data.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_on_wire());
        out.push(self.command.into());
        out.push(self.subfunction);
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        let crc = crc32_chunks(&[&out]);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }
}

/// A device-to-server frame as surfaced by the comm handler, CRC already
/// validated and the response flag stripped from the command byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: CommandId,
    pub subfunction: u8,
    pub code: ResponseCode,
    pub data: Vec<u8>,
}

impl Response {
    pub fn size_on_wire(&self) -> usize {
        RESPONSE_OVERHEAD + self.data.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_on_wire());
        out.push(u8::from(self.command) | RESPONSE_FLAG);
        out.push(self.subfunction);
        out.push(self.code.into());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        let crc = crc32_chunks(&[&out]);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }
}

/// Discover carries a 4-byte challenge; the device proves liveness by
/// replying with the bitwise NOT of each byte.
pub fn challenge_response_u8x4(challenge: [u8; 4]) -> [u8; 4] {
    [
        !challenge[0],
        !challenge[1],
        !challenge[2],
        !challenge[3],
    ]
}

/// Heartbeat carries a 16-bit challenge answered with its bitwise NOT.
pub fn challenge_response_u16(challenge: u16) -> u16 {
    !challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let mut data = DISCOVER_MAGIC.to_vec();
        data.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        let req = Request::new(CommandId::CommControl, CommControlSubfn::Discover, data);
        assert_eq!(
            req.to_bytes(),
            vec![
                0x02, 0x01, 0x00, 0x08, 0x7E, 0x18, 0xFC, 0x68, 0x11, 0x22, 0x33, 0x44, 0x9D,
                0xF7, 0xD3, 0x00,
            ]
        );
        assert_eq!(req.size_on_wire(), 16);
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response {
            command: CommandId::GetInfo,
            subfunction: GetInfoSubfn::ProtocolVersion.into(),
            code: ResponseCode::Ok,
            data: vec![0x01, 0x00],
        };
        assert_eq!(
            resp.to_bytes(),
            vec![0x81, 0x01, 0x00, 0x00, 0x02, 0x01, 0x00, 0x62, 0xCE, 0x08, 0xB2]
        );
    }

    #[test]
    fn test_address_width_roundtrip() {
        let mut out = Vec::new();
        AddressSize::B32.encode(0x1000, &mut out).unwrap();
        assert_eq!(out, vec![0x00, 0x00, 0x10, 0x00]);
        assert_eq!(AddressSize::B32.decode(&out), 0x1000);

        let mut out = Vec::new();
        AddressSize::B16.encode(0xBEEF, &mut out).unwrap();
        assert_eq!(out, vec![0xBE, 0xEF]);

        assert!(AddressSize::B16.encode(0x1_0000, &mut Vec::new()).is_err());
        assert!(
            AddressSize::B64
                .encode(u64::MAX, &mut Vec::new())
                .is_ok()
        );
    }

    #[test]
    fn test_challenge_response_law() {
        for seed in 0u32..256 {
            let challenge = (seed.wrapping_mul(2654435761)).to_be_bytes();
            let response = challenge_response_u8x4(challenge);
            for i in 0..4 {
                assert_eq!(response[i], !challenge[i]);
            }
        }
        assert_eq!(challenge_response_u16(0x1234), 0xEDCB);
    }
}
