//! One-shot scan of device capabilities after a session comes up: protocol
//! version, firmware id, feature flags and address width, then the special
//! memory region map. The resulting `DeviceInfo` is published atomically;
//! any failure regresses the phase to Connecting.

use log::warn;

use crate::codec::{Codec, RegionType};
use crate::dispatcher::RequestOutcome;
use crate::protocol::{AddressSize, Request, ResponseCode, Response};

use super::{DeviceInfo, MemoryRegion, SupportedFeatures};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ProtocolVersion,
    SoftwareId,
    Features,
    RegionCount,
    Regions,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct InfoPoller {
    enabled: bool,
    step: Step,
    pending: bool,
    protocol_version: (u8, u8),
    software_id: [u8; 16],
    address_size: AddressSize,
    features: SupportedFeatures,
    readonly_total: u8,
    forbidden_total: u8,
    readonly_regions: Vec<MemoryRegion>,
    forbidden_regions: Vec<MemoryRegion>,
}

impl InfoPoller {
    pub fn new() -> Self {
        InfoPoller {
            enabled: false,
            step: Step::ProtocolVersion,
            pending: false,
            protocol_version: (0, 0),
            software_id: [0; 16],
            address_size: AddressSize::B32,
            features: SupportedFeatures::default(),
            readonly_total: 0,
            forbidden_total: 0,
            readonly_regions: Vec::new(),
            forbidden_regions: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        *self = InfoPoller::new();
        self.enabled = true;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.pending = false;
    }

    pub fn failed(&self) -> bool {
        self.step == Step::Failed
    }

    pub fn done(&self) -> bool {
        self.step == Step::Done
    }

    pub fn poll(&mut self, codec: &Codec) -> Option<Request> {
        if !self.enabled || self.pending {
            return None;
        }
        let request = match self.step {
            Step::ProtocolVersion => codec.protocol_version_request(),
            Step::SoftwareId => codec.software_id_request(),
            Step::Features => codec.supported_features_request(),
            Step::RegionCount => codec.special_memory_region_count_request(),
            Step::Regions => {
                if self.readonly_regions.len() < self.readonly_total as usize {
                    codec.special_memory_region_location_request(
                        RegionType::ReadOnly,
                        self.readonly_regions.len() as u8,
                    )
                } else {
                    codec.special_memory_region_location_request(
                        RegionType::Forbidden,
                        self.forbidden_regions.len() as u8,
                    )
                }
            }
            Step::Done | Step::Failed => return None,
        };
        self.pending = true;
        request.ok()
    }

    pub fn handle(&mut self, outcome: &RequestOutcome, codec: &Codec) {
        if !self.pending {
            return;
        }
        self.pending = false;
        let response = match outcome {
            RequestOutcome::Response(response) if response.code == ResponseCode::Ok => response,
            RequestOutcome::Response(response) => {
                warn!("info poll refused with {:?}", response.code);
                self.step = Step::Failed;
                return;
            }
            RequestOutcome::Timeout => {
                warn!("info poll timed out");
                self.step = Step::Failed;
                return;
            }
            RequestOutcome::Cancelled(_) => return,
        };
        if let Err(step) = self.advance(response, codec) {
            warn!("info poll failed at {step}");
            self.step = Step::Failed;
        }
    }

    fn advance(&mut self, response: &Response, codec: &Codec) -> Result<(), &'static str> {
        match self.step {
            Step::ProtocolVersion => {
                let payload = codec
                    .decode_protocol_version_response(response)
                    .map_err(|_| "protocol version")?;
                if (payload.major, payload.minor) != codec.version() {
                    return Err("protocol version");
                }
                self.protocol_version = (payload.major, payload.minor);
                self.step = Step::SoftwareId;
            }
            Step::SoftwareId => {
                let payload = codec
                    .decode_software_id_response(response)
                    .map_err(|_| "software id")?;
                self.software_id = payload.software_id;
                self.step = Step::Features;
            }
            Step::Features => {
                let payload = codec
                    .decode_supported_features_response(response)
                    .map_err(|_| "supported features")?;
                self.address_size = AddressSize::try_from(payload.address_size_bytes)
                    .map_err(|_| "address size")?;
                self.features = SupportedFeatures {
                    memory_write: payload.memory_write,
                    datalogging: payload.datalogging,
                    user_command: payload.user_command,
                };
                self.step = Step::RegionCount;
            }
            Step::RegionCount => {
                let payload = codec
                    .decode_special_memory_region_count_response(response)
                    .map_err(|_| "region count")?;
                self.readonly_total = payload.read_only;
                self.forbidden_total = payload.forbidden;
                self.step = if payload.read_only == 0 && payload.forbidden == 0 {
                    Step::Done
                } else {
                    Step::Regions
                };
            }
            Step::Regions => {
                let payload = codec
                    .decode_special_memory_region_location_response(response, self.address_size)
                    .map_err(|_| "region location")?;
                let list = match payload.region_type {
                    RegionType::ReadOnly => &mut self.readonly_regions,
                    RegionType::Forbidden => &mut self.forbidden_regions,
                };
                if payload.region_index as usize != list.len() {
                    return Err("region location");
                }
                list.push(MemoryRegion {
                    start: payload.start,
                    end: payload.end,
                });
                if self.readonly_regions.len() == self.readonly_total as usize
                    && self.forbidden_regions.len() == self.forbidden_total as usize
                {
                    self.step = Step::Done;
                }
            }
            Step::Done | Step::Failed => {}
        }
        Ok(())
    }

    /// The fully-populated device description, available exactly once when
    /// the scan completes.
    pub fn take_info(&mut self) -> Option<DeviceInfo> {
        if self.step != Step::Done || !self.enabled {
            return None;
        }
        self.enabled = false;
        Some(DeviceInfo {
            protocol_version: self.protocol_version,
            software_id: self.software_id,
            address_size: self.address_size,
            supported_features: self.features,
            readonly_regions: std::mem::take(&mut self.readonly_regions),
            forbidden_regions: std::mem::take(&mut self.forbidden_regions),
        })
    }
}

impl Default for InfoPoller {
    fn default() -> Self {
        Self::new()
    }
}
