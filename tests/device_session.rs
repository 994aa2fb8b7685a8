//! End-to-end exercise of the device handler against an emulated firmware:
//! discovery, session establishment, info poll, datastore reconciliation and
//! session loss, all over literal protocol bytes.

use std::collections::HashMap;

use scrutiny::config::Config;
use scrutiny::crc::crc32;
use scrutiny::datastore::{DataType, Datastore, Endianness, EntryValue};
use scrutiny::device::{
    ApiRequestError, ConnectionPhase, DeviceEvent, DeviceHandler, PolicyError, SessionLossReason,
};
use scrutiny::protocol::{
    CONNECT_MAGIC, CommandId, DISCOVER_MAGIC, Response, ResponseCode,
};

const SESSION_ID: u32 = 0xCAFE1234;
const HEARTBEAT_TIMEOUT_US: u32 = 2_000_000;

/// A firmware-side mirror: parses request frames, answers like a device with
/// one readonly and one forbidden region and a small byte-addressable memory.
struct EmulatedDevice {
    rx: Vec<u8>,
    out: Vec<u8>,
    memory: HashMap<u64, u8>,
    responding: bool,
    write_requests: usize,
}

impl EmulatedDevice {
    fn new() -> Self {
        EmulatedDevice {
            rx: Vec::new(),
            out: Vec::new(),
            memory: HashMap::new(),
            responding: true,
            write_requests: 0,
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes);
        while self.rx.len() >= 8 {
            let len = u16::from_be_bytes([self.rx[2], self.rx[3]]) as usize;
            if self.rx.len() < 8 + len {
                break;
            }
            let frame: Vec<u8> = self.rx.drain(..8 + len).collect();
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let body = &frame[..frame.len() - 4];
        let crc_given = u32::from_be_bytes(frame[frame.len() - 4..].try_into().unwrap());
        assert_eq!(crc32(body), crc_given, "server sent a corrupt frame");
        if !self.responding {
            return;
        }
        let cmd = frame[0];
        let subfn = frame[1];
        let data = &frame[4..frame.len() - 4];
        match (cmd, subfn) {
            // CommControl.Discover
            (2, 1) => {
                assert_eq!(&data[..4], &DISCOVER_MAGIC);
                let mut payload = DISCOVER_MAGIC.to_vec();
                payload.extend(data[4..8].iter().map(|b| !b));
                self.respond(CommandId::CommControl, 1, ResponseCode::Ok, payload);
            }
            // CommControl.Heartbeat
            (2, 2) => {
                let session = u32::from_be_bytes(data[..4].try_into().unwrap());
                assert_eq!(session, SESSION_ID);
                let challenge = u16::from_be_bytes(data[4..6].try_into().unwrap());
                let mut payload = session.to_be_bytes().to_vec();
                payload.extend_from_slice(&(!challenge).to_be_bytes());
                self.respond(CommandId::CommControl, 2, ResponseCode::Ok, payload);
            }
            // CommControl.GetParams
            (2, 3) => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&256u16.to_be_bytes());
                payload.extend_from_slice(&256u16.to_be_bytes());
                payload.extend_from_slice(&0u32.to_be_bytes());
                payload.extend_from_slice(&HEARTBEAT_TIMEOUT_US.to_be_bytes());
                payload.extend_from_slice(&50_000u32.to_be_bytes());
                self.respond(CommandId::CommControl, 3, ResponseCode::Ok, payload);
            }
            // CommControl.Connect
            (2, 4) => {
                assert_eq!(data, &CONNECT_MAGIC);
                let mut payload = CONNECT_MAGIC.to_vec();
                payload.extend_from_slice(&SESSION_ID.to_be_bytes());
                self.respond(CommandId::CommControl, 4, ResponseCode::Ok, payload);
            }
            // GetInfo.ProtocolVersion
            (1, 1) => self.respond(CommandId::GetInfo, 1, ResponseCode::Ok, vec![1, 0]),
            // GetInfo.SoftwareId
            (1, 2) => self.respond(CommandId::GetInfo, 2, ResponseCode::Ok, vec![0x11; 16]),
            // GetInfo.SupportedFeatures: 4-byte addresses, memory_write
            (1, 3) => self.respond(CommandId::GetInfo, 3, ResponseCode::Ok, vec![4, 0b1000_0000]),
            // GetInfo.SpecialMemoryRegionCount
            (1, 4) => self.respond(CommandId::GetInfo, 4, ResponseCode::Ok, vec![1, 1]),
            // GetInfo.SpecialMemoryRegionLocation
            (1, 5) => {
                let (start, end): (u32, u32) = match data[0] {
                    0 => (0x8000, 0x9000),
                    _ => (0x6000, 0x7000),
                };
                let mut payload = vec![data[0], data[1]];
                payload.extend_from_slice(&start.to_be_bytes());
                payload.extend_from_slice(&end.to_be_bytes());
                self.respond(CommandId::GetInfo, 5, ResponseCode::Ok, payload);
            }
            // MemoryControl.Read
            (3, 1) => {
                let mut payload = Vec::new();
                for block in data.chunks(6) {
                    let address = u32::from_be_bytes(block[..4].try_into().unwrap()) as u64;
                    let length = u16::from_be_bytes(block[4..6].try_into().unwrap());
                    payload.extend_from_slice(&block[..6]);
                    for i in 0..length as u64 {
                        payload.push(*self.memory.get(&(address + i)).unwrap_or(&0));
                    }
                }
                self.respond(CommandId::MemoryControl, 1, ResponseCode::Ok, payload);
            }
            // MemoryControl.Write
            (3, 2) => {
                self.write_requests += 1;
                let mut payload = Vec::new();
                let mut rest = data;
                while !rest.is_empty() {
                    let address = u32::from_be_bytes(rest[..4].try_into().unwrap()) as u64;
                    let length = u16::from_be_bytes(rest[4..6].try_into().unwrap()) as usize;
                    for (i, &byte) in rest[6..6 + length].iter().enumerate() {
                        self.memory.insert(address + i as u64, byte);
                    }
                    payload.extend_from_slice(&rest[..6]);
                    rest = &rest[6 + length..];
                }
                self.respond(CommandId::MemoryControl, 2, ResponseCode::Ok, payload);
            }
            _ => self.respond(
                CommandId::try_from(cmd).unwrap(),
                subfn,
                ResponseCode::UnsupportedFeature,
                vec![],
            ),
        }
    }

    fn respond(&mut self, command: CommandId, subfunction: u8, code: ResponseCode, data: Vec<u8>) {
        let response = Response {
            command,
            subfunction,
            code,
            data,
        };
        self.out.extend_from_slice(&response.to_bytes());
    }
}

struct Harness {
    handler: DeviceHandler,
    datastore: Datastore,
    device: EmulatedDevice,
    now_us: u64,
    events: Vec<DeviceEvent>,
}

impl Harness {
    fn new() -> Self {
        let mut handler = DeviceHandler::new(&Config::default());
        let events = handler.on_link_up(0);
        Harness {
            handler,
            datastore: Datastore::new(),
            device: EmulatedDevice::new(),
            now_us: 0,
            events,
        }
    }

    /// Advance in 10 ms quanta, shuttling bytes both ways like the event
    /// loop does.
    fn run_ticks(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.now_us += 10_000;
            let inbound = std::mem::take(&mut self.device.out);
            self.handler.feed_rx(&inbound, self.now_us);
            self.events
                .extend(self.handler.tick(self.now_us, &mut self.datastore));
            let mut buf = [0u8; 512];
            loop {
                let n = self.handler.drain_tx(&mut buf);
                if n == 0 {
                    break;
                }
                self.device.feed(&buf[..n]);
            }
        }
    }

    fn connect(&mut self) {
        self.run_ticks(100);
        assert_eq!(self.handler.phase(), ConnectionPhase::Connected);
        assert!(self.handler.device_info().is_some());
    }
}

#[test]
fn test_discover_to_connected() {
    let mut harness = Harness::new();
    harness.connect();

    assert_eq!(harness.handler.session_id(), Some(SESSION_ID));
    let info = harness.handler.device_info().unwrap();
    assert_eq!(info.protocol_version, (1, 0));
    assert_eq!(info.software_id, [0x11; 16]);
    assert!(info.supported_features.memory_write);
    assert_eq!(info.readonly_regions.len(), 1);
    assert_eq!(info.forbidden_regions.len(), 1);
    assert_eq!(info.forbidden_regions[0].start, 0x6000);

    // the phase walked Discovering -> Connecting -> Connected
    let phases: Vec<ConnectionPhase> = harness
        .events
        .iter()
        .filter_map(|event| match event {
            DeviceEvent::PhaseChanged { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert!(phases.contains(&ConnectionPhase::Discovering));
    assert!(phases.contains(&ConnectionPhase::Connecting));
    assert!(phases.contains(&ConnectionPhase::Connected));
}

#[test]
fn test_watched_variable_reconciles() {
    let mut harness = Harness::new();
    for (i, byte) in [0xDD, 0xCC, 0xBB, 0xAA].into_iter().enumerate() {
        harness.device.memory.insert(0x1000 + i as u64, byte);
    }
    harness.connect();

    let var = harness
        .datastore
        .add_variable(0x1000, DataType::U32, Endianness::Little, None);
    harness.datastore.watch(var).unwrap();
    harness.run_ticks(50);

    let entry = harness.datastore.get(var).unwrap();
    assert_eq!(entry.value, Some(EntryValue::Unsigned(0xAABBCCDD)));
    assert!(entry.last_update.is_some());
    assert!(harness.events.iter().any(|event| matches!(
        event,
        DeviceEvent::ValuesUpdated(handles) if handles.contains(&var)
    )));
}

#[test]
fn test_value_write_reaches_device_memory() {
    let mut harness = Harness::new();
    harness.connect();

    let var = harness
        .datastore
        .add_variable(0x2000, DataType::U16, Endianness::Big, None);
    harness
        .datastore
        .queue_write(var, EntryValue::Unsigned(0x1234))
        .unwrap();
    harness.run_ticks(50);

    assert_eq!(harness.device.memory.get(&0x2000), Some(&0x12));
    assert_eq!(harness.device.memory.get(&0x2001), Some(&0x34));
    assert!(harness.events.iter().any(|event| matches!(
        event,
        DeviceEvent::WriteResult { handle, result: Ok(()) } if *handle == var
    )));
}

#[test]
fn test_forbidden_write_never_transmitted() {
    let mut harness = Harness::new();
    harness.connect();
    let baseline_writes = harness.device.write_requests;

    let var = harness
        .datastore
        .add_variable(0x6100, DataType::U8, Endianness::Little, None);
    harness
        .datastore
        .queue_write(var, EntryValue::Unsigned(1))
        .unwrap();
    harness.run_ticks(50);

    assert_eq!(harness.device.write_requests, baseline_writes);
    assert!(harness.events.iter().any(|event| matches!(
        event,
        DeviceEvent::WriteResult {
            handle,
            result: Err(ApiRequestError::Policy(PolicyError::Forbidden)),
        } if *handle == var
    )));
}

#[test]
fn test_readonly_write_never_transmitted() {
    let mut harness = Harness::new();
    harness.connect();

    let var = harness
        .datastore
        .add_variable(0x8800, DataType::U8, Endianness::Little, None);
    harness
        .datastore
        .queue_write(var, EntryValue::Unsigned(1))
        .unwrap();
    harness.run_ticks(50);

    assert_eq!(harness.device.write_requests, 0);
    assert!(harness.events.iter().any(|event| matches!(
        event,
        DeviceEvent::WriteResult {
            result: Err(ApiRequestError::Policy(PolicyError::Readonly)),
            ..
        }
    )));
}

#[test]
fn test_silent_device_loses_session() {
    let mut harness = Harness::new();
    harness.connect();

    harness.device.responding = false;
    // more than enough quanta for the heartbeat to give up
    harness.run_ticks(500);

    assert!(harness.events.iter().any(|event| matches!(
        event,
        DeviceEvent::SessionLost {
            reason: SessionLossReason::HeartbeatTimeout,
        }
    )));
    assert_eq!(harness.handler.phase(), ConnectionPhase::Discovering);
    assert!(harness.handler.device_info().is_none());

    // a revived device is found again
    harness.device.responding = true;
    harness.run_ticks(200);
    assert_eq!(harness.handler.phase(), ConnectionPhase::Connected);
}

#[test]
fn test_watched_values_invalidated_on_session_loss() {
    let mut harness = Harness::new();
    harness.device.memory.insert(0x1000, 42);
    harness.connect();

    let var = harness
        .datastore
        .add_variable(0x1000, DataType::U8, Endianness::Little, None);
    harness.datastore.watch(var).unwrap();
    harness.run_ticks(50);
    assert!(harness.datastore.get(var).unwrap().value.is_some());

    harness.device.responding = false;
    harness.run_ticks(500);
    let entry = harness.datastore.get(var).unwrap();
    assert!(entry.value.is_none());
    assert_eq!(entry.watchers, 1);
}
