//! Versioned encode/decode of Scrutiny command payloads.
//!
//! The codec is pure: no I/O, no state across calls. Fixed-layout payloads
//! are deku structs, big-endian on the wire. Payloads whose layout depends on
//! the device address width are decoded by hand. Streaming memory-block
//! layouts live in [`crate::blocks`].

use deku::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::protocol::{
    AddressSize, CONNECT_MAGIC, CommControlSubfn, CommandId, DISCOVER_MAGIC, GetInfoSubfn,
    Request, Response,
};

pub const SOFTWARE_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("payload of {size} bytes exceeds the device receive buffer ({max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("payload length {got} does not match expected {expected}")]
    Length { expected: usize, got: usize },
    #[error("magic prefix mismatch")]
    Magic,
    #[error("unknown command id {0:#04X}")]
    UnknownCmd(u8),
    #[error("unknown sub-function {subfn} for command {command:?}")]
    UnknownSubfn { command: CommandId, subfn: u8 },
    #[error("invalid value in field {0}")]
    BadField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("unsupported protocol version {major}.{minor}")]
pub struct UnsupportedVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RegionType {
    ReadOnly = 0,
    Forbidden = 1,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct DiscoverRequest {
    pub magic: [u8; 4],
    pub challenge: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct DiscoverResponse {
    pub magic: [u8; 4],
    pub challenge_response: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct HeartbeatRequest {
    pub session_id: u32,
    pub challenge: u16,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct HeartbeatResponse {
    pub session_id: u32,
    pub challenge_response: u16,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct GetParamsResponse {
    pub rx_buffer_size: u16,
    pub tx_buffer_size: u16,
    pub max_bitrate_bps: u32,
    pub heartbeat_timeout_us: u32,
    pub rx_timeout_us: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ConnectResponse {
    pub magic: [u8; 4],
    pub session_id: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct ProtocolVersionResponse {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct SoftwareIdResponse {
    pub software_id: [u8; SOFTWARE_ID_LEN],
}

/// Device capability announcement. The address width byte counts bytes
/// (1/2/4/8); the flag bits are MSB-first.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct SupportedFeaturesResponse {
    pub address_size_bytes: u8,
    #[deku(bits = 1)]
    pub memory_write: bool,
    #[deku(bits = 1)]
    pub datalogging: bool,
    #[deku(bits = 1, pad_bits_after = "5")]
    pub user_command: bool,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct SpecialMemoryRegionCountResponse {
    pub read_only: u8,
    pub forbidden: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialMemoryRegionLocation {
    pub region_type: RegionType,
    pub region_index: u8,
    pub start: u64,
    pub end: u64,
}

/// One codec per protocol major.minor; the server selects by the session's
/// negotiated version.
#[derive(Debug, Clone, PartialEq)]
pub struct Codec {
    major: u8,
    minor: u8,
    max_request_data: usize,
}

impl Codec {
    pub fn new(major: u8, minor: u8) -> Result<Self, UnsupportedVersion> {
        match (major, minor) {
            (1, 0) => Ok(Codec {
                major,
                minor,
                max_request_data: u16::MAX as usize,
            }),
            _ => Err(UnsupportedVersion { major, minor }),
        }
    }

    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    /// Cap request payloads to the RX buffer size the device advertised in
    /// GetParams.
    pub fn set_max_request_data(&mut self, max: usize) {
        self.max_request_data = max;
    }

    fn check_size(&self, size: usize) -> Result<(), EncodeError> {
        if size > self.max_request_data {
            return Err(EncodeError::PayloadTooLarge {
                size,
                max: self.max_request_data,
            });
        }
        Ok(())
    }

    fn request(
        &self,
        command: CommandId,
        subfn: impl Into<u8>,
        data: Vec<u8>,
    ) -> Result<Request, EncodeError> {
        self.check_size(data.len())?;
        Ok(Request::new(command, subfn, data))
    }

    pub fn discover_request(&self, challenge: [u8; 4]) -> Result<Request, EncodeError> {
        let payload = DiscoverRequest {
            magic: DISCOVER_MAGIC,
            challenge,
        };
        self.request(
            CommandId::CommControl,
            CommControlSubfn::Discover,
            payload.to_bytes().expect("failed to serialize discover payload"),
        )
    }

    pub fn connect_request(&self) -> Result<Request, EncodeError> {
        self.request(
            CommandId::CommControl,
            CommControlSubfn::Connect,
            CONNECT_MAGIC.to_vec(),
        )
    }

    pub fn disconnect_request(&self, session_id: u32) -> Result<Request, EncodeError> {
        self.request(
            CommandId::CommControl,
            CommControlSubfn::Disconnect,
            session_id.to_be_bytes().to_vec(),
        )
    }

    pub fn heartbeat_request(
        &self,
        session_id: u32,
        challenge: u16,
    ) -> Result<Request, EncodeError> {
        let payload = HeartbeatRequest {
            session_id,
            challenge,
        };
        self.request(
            CommandId::CommControl,
            CommControlSubfn::Heartbeat,
            payload.to_bytes().expect("failed to serialize heartbeat payload"),
        )
    }

    pub fn get_params_request(&self) -> Result<Request, EncodeError> {
        self.request(CommandId::CommControl, CommControlSubfn::GetParams, vec![])
    }

    pub fn protocol_version_request(&self) -> Result<Request, EncodeError> {
        self.request(CommandId::GetInfo, GetInfoSubfn::ProtocolVersion, vec![])
    }

    pub fn software_id_request(&self) -> Result<Request, EncodeError> {
        self.request(CommandId::GetInfo, GetInfoSubfn::SoftwareId, vec![])
    }

    pub fn supported_features_request(&self) -> Result<Request, EncodeError> {
        self.request(CommandId::GetInfo, GetInfoSubfn::SupportedFeatures, vec![])
    }

    pub fn special_memory_region_count_request(&self) -> Result<Request, EncodeError> {
        self.request(
            CommandId::GetInfo,
            GetInfoSubfn::SpecialMemoryRegionCount,
            vec![],
        )
    }

    pub fn special_memory_region_location_request(
        &self,
        region_type: RegionType,
        region_index: u8,
    ) -> Result<Request, EncodeError> {
        self.request(
            CommandId::GetInfo,
            GetInfoSubfn::SpecialMemoryRegionLocation,
            vec![region_type.into(), region_index],
        )
    }

    pub fn user_command_request(
        &self,
        subfunction: u8,
        data: Vec<u8>,
    ) -> Result<Request, EncodeError> {
        self.request(CommandId::UserCommand, subfunction, data)
    }

    pub fn decode_discover_response(
        &self,
        response: &Response,
    ) -> Result<DiscoverResponse, DecodeError> {
        check_pair(response, CommandId::CommControl, CommControlSubfn::Discover)?;
        let payload: DiscoverResponse = decode_fixed(&response.data)?;
        if payload.magic != DISCOVER_MAGIC {
            return Err(DecodeError::Magic);
        }
        Ok(payload)
    }

    pub fn decode_connect_response(
        &self,
        response: &Response,
    ) -> Result<ConnectResponse, DecodeError> {
        check_pair(response, CommandId::CommControl, CommControlSubfn::Connect)?;
        let payload: ConnectResponse = decode_fixed(&response.data)?;
        if payload.magic != CONNECT_MAGIC {
            return Err(DecodeError::Magic);
        }
        Ok(payload)
    }

    pub fn decode_heartbeat_response(
        &self,
        response: &Response,
    ) -> Result<HeartbeatResponse, DecodeError> {
        check_pair(response, CommandId::CommControl, CommControlSubfn::Heartbeat)?;
        decode_fixed(&response.data)
    }

    pub fn decode_get_params_response(
        &self,
        response: &Response,
    ) -> Result<GetParamsResponse, DecodeError> {
        check_pair(response, CommandId::CommControl, CommControlSubfn::GetParams)?;
        decode_fixed(&response.data)
    }

    pub fn decode_protocol_version_response(
        &self,
        response: &Response,
    ) -> Result<ProtocolVersionResponse, DecodeError> {
        check_pair(response, CommandId::GetInfo, GetInfoSubfn::ProtocolVersion)?;
        decode_fixed(&response.data)
    }

    pub fn decode_software_id_response(
        &self,
        response: &Response,
    ) -> Result<SoftwareIdResponse, DecodeError> {
        check_pair(response, CommandId::GetInfo, GetInfoSubfn::SoftwareId)?;
        decode_fixed(&response.data)
    }

    pub fn decode_supported_features_response(
        &self,
        response: &Response,
    ) -> Result<SupportedFeaturesResponse, DecodeError> {
        check_pair(response, CommandId::GetInfo, GetInfoSubfn::SupportedFeatures)?;
        decode_fixed(&response.data)
    }

    pub fn decode_special_memory_region_count_response(
        &self,
        response: &Response,
    ) -> Result<SpecialMemoryRegionCountResponse, DecodeError> {
        check_pair(
            response,
            CommandId::GetInfo,
            GetInfoSubfn::SpecialMemoryRegionCount,
        )?;
        decode_fixed(&response.data)
    }

    pub fn decode_special_memory_region_location_response(
        &self,
        response: &Response,
        address_size: AddressSize,
    ) -> Result<SpecialMemoryRegionLocation, DecodeError> {
        check_pair(
            response,
            CommandId::GetInfo,
            GetInfoSubfn::SpecialMemoryRegionLocation,
        )?;
        let expected = 2 + 2 * address_size.nbytes();
        let data = &response.data;
        if data.len() != expected {
            return Err(DecodeError::Length {
                expected,
                got: data.len(),
            });
        }
        let region_type =
            RegionType::try_from(data[0]).map_err(|_| DecodeError::BadField("region_type"))?;
        let a = address_size.nbytes();
        Ok(SpecialMemoryRegionLocation {
            region_type,
            region_index: data[1],
            start: address_size.decode(&data[2..2 + a]),
            end: address_size.decode(&data[2 + a..2 + 2 * a]),
        })
    }
}

fn check_pair(
    response: &Response,
    command: CommandId,
    subfn: impl Into<u8>,
) -> Result<(), DecodeError> {
    if response.command != command {
        return Err(DecodeError::UnknownCmd(response.command.into()));
    }
    let subfn = subfn.into();
    if response.subfunction != subfn {
        return Err(DecodeError::UnknownSubfn {
            command,
            subfn: response.subfunction,
        });
    }
    Ok(())
}

fn decode_fixed<'a, T>(data: &'a [u8]) -> Result<T, DecodeError>
where
    T: DekuContainerRead<'a>,
{
    let ((rest, _), payload) = T::from_bytes((data, 0)).map_err(|_| DecodeError::Length {
        expected: 0,
        got: data.len(),
    })?;
    if !rest.is_empty() {
        return Err(DecodeError::Length {
            expected: data.len() - rest.len(),
            got: data.len(),
        });
    }
    Ok(payload)
}
