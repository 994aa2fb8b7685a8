//! Device lifecycle orchestration. The handler owns the comm handler, the
//! dispatcher, the throttler and the four lifecycle submodules, drives
//! whichever submodule matches the current phase, and publishes device state
//! as events. It performs no I/O itself: the event loop feeds received bytes
//! in and drains transmit bytes out.

pub mod heartbeat;
pub mod info_poller;
pub mod searcher;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::blocks::{DataStreamEncoder, DataStreamParser, HeaderStreamEncoder, HeaderStreamParser};
use crate::codec::{Codec, GetParamsResponse};
use crate::comm::{CommHandler, DEFAULT_RX_TIMEOUT_US};
use crate::config::Config;
use crate::datastore::{Datastore, EntryHandle};
use crate::dispatcher::{
    CancelReason, DispatchEvent, Priority, RequestDispatcher, RequestOutcome, RequestTag,
};
use crate::memory_reader::MemoryReader;
use crate::memory_writer::{MemoryWriter, WriteFailure, WriteRejection, WriterAction};
use crate::protocol::{AddressSize, CommandId, MemoryControlSubfn, Request, ResponseCode};
use crate::throttler::Throttler;

use heartbeat::HeartbeatGenerator;
use info_poller::InfoPoller;
use searcher::Searcher;
use session::SessionInitializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    LinkDown,
    Discovering,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLossReason {
    HeartbeatTimeout,
    LinkDown,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub rx_buffer_size: u16,
    pub tx_buffer_size: u16,
    pub max_bitrate_bps: u32,
    pub heartbeat_timeout_us: u32,
    pub rx_timeout_us: u32,
}

impl From<GetParamsResponse> for SessionParams {
    fn from(params: GetParamsResponse) -> Self {
        SessionParams {
            rx_buffer_size: params.rx_buffer_size,
            tx_buffer_size: params.tx_buffer_size,
            max_bitrate_bps: params.max_bitrate_bps,
            heartbeat_timeout_us: params.heartbeat_timeout_us,
            rx_timeout_us: params.rx_timeout_us,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub params: SessionParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportedFeatures {
    pub memory_write: bool,
    pub datalogging: bool,
    pub user_command: bool,
}

/// Half-open protected address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
}

impl MemoryRegion {
    /// Range test against a touched block, inclusive on both block
    /// endpoints: `[address, address+length]` vs `[start, end)`.
    pub fn touches(&self, address: u64, length: u16) -> bool {
        if self.end <= self.start {
            return false;
        }
        let block_end = address.saturating_add(length as u64);
        block_end >= self.start && address < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("address range crosses a forbidden region")]
    Forbidden,
    #[error("address range crosses a readonly region")]
    Readonly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub protocol_version: (u8, u8),
    pub software_id: [u8; 16],
    pub address_size: AddressSize,
    pub supported_features: SupportedFeatures,
    pub readonly_regions: Vec<MemoryRegion>,
    pub forbidden_regions: Vec<MemoryRegion>,
}

/// Final outcome of one API-originated operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiRequestError {
    #[error("no active device session")]
    NoSession,
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("request queue is full")]
    QueueFull,
    #[error("request does not fit the device buffers")]
    TooLarge,
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("device refused with {0:?}")]
    Device(ResponseCode),
    #[error("malformed device response")]
    Malformed,
    #[error("not supported by this device")]
    Unsupported,
    #[error("value cannot be written to this entry")]
    InvalidValue,
}

impl From<WriteRejection> for ApiRequestError {
    fn from(rejection: WriteRejection) -> Self {
        match rejection {
            WriteRejection::Policy(e) => ApiRequestError::Policy(e),
            WriteRejection::Unsupported => ApiRequestError::Unsupported,
            WriteRejection::Value(_) => ApiRequestError::InvalidValue,
        }
    }
}

impl From<WriteFailure> for ApiRequestError {
    fn from(failure: WriteFailure) -> Self {
        match failure {
            WriteFailure::Device(code) => ApiRequestError::Device(code),
            WriteFailure::Timeout => ApiRequestError::Timeout,
            WriteFailure::Cancelled => ApiRequestError::Cancelled,
            WriteFailure::Malformed => ApiRequestError::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    PhaseChanged {
        phase: ConnectionPhase,
        info: Option<Arc<DeviceInfo>>,
    },
    SessionLost {
        reason: SessionLossReason,
    },
    ValuesUpdated(Vec<EntryHandle>),
    WriteResult {
        handle: EntryHandle,
        result: Result<(), ApiRequestError>,
    },
    ApiRequestDone {
        id: u32,
        result: Result<Vec<u8>, ApiRequestError>,
    },
}

pub struct DeviceHandler {
    phase: ConnectionPhase,
    codec: Codec,
    comm: CommHandler,
    dispatcher: RequestDispatcher,
    throttler: Throttler,
    searcher: Searcher,
    session_initializer: SessionInitializer,
    heartbeat: HeartbeatGenerator,
    info_poller: InfoPoller,
    memory_reader: MemoryReader,
    memory_writer: MemoryWriter,
    session: Option<Session>,
    device_info: Option<Arc<DeviceInfo>>,
    api_reads: HashMap<u32, (u64, u16)>,
    api_writes: HashMap<u32, (u64, u16)>,
}

impl DeviceHandler {
    pub fn new(config: &Config) -> Self {
        let mut dispatcher = RequestDispatcher::new(
            config.max_pending_requests,
            crate::dispatcher::DEFAULT_MAX_PENDING_BYTES,
        );
        dispatcher.set_default_timeout(config.request_timeout_ms * 1000);
        DeviceHandler {
            phase: ConnectionPhase::LinkDown,
            codec: Codec::new(1, 0).expect("protocol v1.0 codec"),
            comm: CommHandler::new(config.rx_buffer_size),
            dispatcher,
            throttler: Throttler::new(),
            searcher: Searcher::new(),
            session_initializer: SessionInitializer::new(),
            heartbeat: HeartbeatGenerator::new(),
            info_poller: InfoPoller::new(),
            memory_reader: MemoryReader::new(),
            memory_writer: MemoryWriter::new(),
            session: None,
            device_info: None,
            api_reads: HashMap::new(),
            api_writes: HashMap::new(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn device_info(&self) -> Option<Arc<DeviceInfo>> {
        self.device_info.clone()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn feed_rx(&mut self, bytes: &[u8], now_us: u64) {
        self.comm.process_data(bytes, now_us);
    }

    pub fn drain_tx(&mut self, buf: &mut [u8]) -> usize {
        self.comm.pop_data(buf)
    }

    pub fn on_link_up(&mut self, _now_us: u64) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        if self.phase == ConnectionPhase::LinkDown {
            self.comm.enable();
            self.searcher.enable();
            self.set_phase(ConnectionPhase::Discovering, &mut events);
        }
        events
    }

    pub fn on_link_down(&mut self, datastore: &mut Datastore, now_us: u64) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        if self.phase == ConnectionPhase::LinkDown {
            return events;
        }
        let had_session = self.session.is_some();
        for event in self.dispatcher.cancel_all(CancelReason::LinkDown) {
            self.route(event, datastore, now_us, &mut events);
        }
        self.clear_session(datastore, now_us);
        self.searcher.disable();
        self.comm.disable();
        if had_session {
            events.push(DeviceEvent::SessionLost {
                reason: SessionLossReason::LinkDown,
            });
        }
        self.set_phase(ConnectionPhase::LinkDown, &mut events);
        events
    }

    /// One scheduling quantum: harvest completions, run the phase machine,
    /// transmit.
    pub fn tick(&mut self, now_us: u64, datastore: &mut Datastore) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        self.comm.check_rx_timeout(now_us);
        for event in self.dispatcher.collect(now_us, &mut self.comm) {
            self.route(event, datastore, now_us, &mut events);
        }

        match self.phase {
            ConnectionPhase::LinkDown => {}
            ConnectionPhase::Discovering => {
                if self.searcher.device_found() {
                    self.searcher.disable();
                    self.session_initializer.reset();
                    self.set_phase(ConnectionPhase::Connecting, &mut events);
                } else if let Some(request) = self.searcher.poll(now_us, &self.codec) {
                    self.enqueue_internal(
                        Priority::Low,
                        request,
                        RequestTag::Discover,
                        datastore,
                        now_us,
                        &mut events,
                    );
                }
            }
            ConnectionPhase::Connecting => {
                if self.session_initializer.failed() {
                    self.restart_discovery(datastore, now_us, None, &mut events);
                } else if let Some((session_id, params)) = self.session_initializer.take_result() {
                    self.install_session(session_id, params.into(), now_us);
                    self.info_poller.start();
                    self.set_phase(ConnectionPhase::Connected, &mut events);
                } else if let Some((request, tag)) =
                    self.session_initializer.poll(now_us, &self.codec)
                {
                    self.enqueue_internal(
                        Priority::High,
                        request,
                        tag,
                        datastore,
                        now_us,
                        &mut events,
                    );
                }
            }
            ConnectionPhase::Connected => {
                if self.heartbeat.session_lost(now_us) {
                    warn!("session lost, returning to discovery");
                    self.restart_discovery(
                        datastore,
                        now_us,
                        Some(SessionLossReason::HeartbeatTimeout),
                        &mut events,
                    );
                } else if self.info_poller.failed() {
                    warn!("device information scan failed, reconnecting");
                    self.regress_to_connecting(datastore, now_us, &mut events);
                } else {
                    if let Some(request) = self.heartbeat.poll(now_us, &self.codec) {
                        self.enqueue_internal(
                            Priority::High,
                            request,
                            RequestTag::Heartbeat,
                            datastore,
                            now_us,
                            &mut events,
                        );
                    }
                    if let Some(request) = self.info_poller.poll(&self.codec) {
                        self.enqueue_internal(
                            Priority::High,
                            request,
                            RequestTag::InfoPoll,
                            datastore,
                            now_us,
                            &mut events,
                        );
                    }
                    self.poll_memory(datastore, now_us, &mut events);
                }
            }
        }

        for event in self.dispatcher.pump(now_us, &mut self.comm, &mut self.throttler) {
            self.route(event, datastore, now_us, &mut events);
        }
        events
    }

    fn poll_memory(&mut self, datastore: &mut Datastore, now_us: u64, events: &mut Vec<DeviceEvent>) {
        let (Some(session), Some(info)) = (self.session, self.device_info.clone()) else {
            return;
        };
        match self.memory_writer.poll(datastore, &session, &info) {
            WriterAction::Send(request) => {
                self.enqueue_internal(
                    Priority::Normal,
                    request,
                    RequestTag::MemoryWrite,
                    datastore,
                    now_us,
                    events,
                );
            }
            WriterAction::Rejected { handle, error } => {
                events.push(DeviceEvent::WriteResult {
                    handle,
                    result: Err(error.into()),
                });
            }
            WriterAction::Idle => {}
        }
        if let Some(request) = self.memory_reader.poll(datastore, &session, &info) {
            self.enqueue_internal(
                Priority::Normal,
                request,
                RequestTag::MemoryRead,
                datastore,
                now_us,
                events,
            );
        }
    }

    fn route(
        &mut self,
        event: DispatchEvent,
        datastore: &mut Datastore,
        now_us: u64,
        events: &mut Vec<DeviceEvent>,
    ) {
        match event.tag {
            RequestTag::Discover => self.searcher.handle(&event.outcome, &self.codec),
            RequestTag::Connect => {
                self.session_initializer
                    .handle_connect(&event.outcome, &self.codec, now_us)
            }
            RequestTag::GetParams => {
                self.session_initializer.handle_params(&event.outcome, &self.codec)
            }
            RequestTag::Disconnect => {}
            RequestTag::Heartbeat => self.heartbeat.handle(&event.outcome, &self.codec, now_us),
            RequestTag::InfoPoll => {
                self.info_poller.handle(&event.outcome, &self.codec);
                if let Some(device_info) = self.info_poller.take_info() {
                    info!(
                        "device ready: protocol {}.{}, {} readonly / {} forbidden regions",
                        device_info.protocol_version.0,
                        device_info.protocol_version.1,
                        device_info.readonly_regions.len(),
                        device_info.forbidden_regions.len(),
                    );
                    let device_info = Arc::new(device_info);
                    self.device_info = Some(device_info.clone());
                    events.push(DeviceEvent::PhaseChanged {
                        phase: self.phase,
                        info: Some(device_info),
                    });
                }
            }
            RequestTag::MemoryRead => {
                if let Some(info) = self.device_info.clone() {
                    let updated = self.memory_reader.handle(&event.outcome, datastore, &info);
                    if !updated.is_empty() {
                        events.push(DeviceEvent::ValuesUpdated(updated));
                    }
                }
            }
            RequestTag::MemoryWrite => {
                if let Some(info) = self.device_info.clone()
                    && let Some((handle, result)) =
                        self.memory_writer.handle(&event.outcome, datastore, &info)
                {
                    events.push(DeviceEvent::WriteResult {
                        handle,
                        result: result.map_err(Into::into),
                    });
                }
            }
            RequestTag::UserCommand(id) => {
                let result = match event.outcome {
                    RequestOutcome::Response(response) if response.code == ResponseCode::Ok => {
                        Ok(response.data)
                    }
                    RequestOutcome::Response(response) => {
                        Err(ApiRequestError::Device(response.code))
                    }
                    RequestOutcome::Timeout => Err(ApiRequestError::Timeout),
                    RequestOutcome::Cancelled(_) => Err(ApiRequestError::Cancelled),
                };
                events.push(DeviceEvent::ApiRequestDone { id, result });
            }
            RequestTag::ApiMemoryRead(id) => {
                let meta = self.api_reads.remove(&id);
                let result = match (&event.outcome, meta, self.device_info.clone()) {
                    (RequestOutcome::Response(response), Some((address, length)), Some(info))
                        if response.code == ResponseCode::Ok =>
                    {
                        let mut parser = DataStreamParser::new(&response.data, info.address_size);
                        match parser.next() {
                            Some(block)
                                if block.address == address
                                    && block.data.len() == length as usize
                                    && parser.finished() =>
                            {
                                Ok(block.data)
                            }
                            _ => Err(ApiRequestError::Malformed),
                        }
                    }
                    (RequestOutcome::Response(response), _, _)
                        if response.code != ResponseCode::Ok =>
                    {
                        Err(ApiRequestError::Device(response.code))
                    }
                    (RequestOutcome::Timeout, _, _) => Err(ApiRequestError::Timeout),
                    (RequestOutcome::Cancelled(_), _, _) => Err(ApiRequestError::Cancelled),
                    _ => Err(ApiRequestError::Malformed),
                };
                events.push(DeviceEvent::ApiRequestDone { id, result });
            }
            RequestTag::ApiMemoryWrite(id) => {
                let meta = self.api_writes.remove(&id);
                let result = match (&event.outcome, meta, self.device_info.clone()) {
                    (RequestOutcome::Response(response), Some((address, length)), Some(info))
                        if response.code == ResponseCode::Ok =>
                    {
                        let mut parser = HeaderStreamParser::new(&response.data, info.address_size);
                        match parser.next() {
                            Some(block)
                                if block.address == address
                                    && block.length == length
                                    && parser.finished() =>
                            {
                                Ok(Vec::new())
                            }
                            _ => Err(ApiRequestError::Malformed),
                        }
                    }
                    (RequestOutcome::Response(response), _, _)
                        if response.code != ResponseCode::Ok =>
                    {
                        Err(ApiRequestError::Device(response.code))
                    }
                    (RequestOutcome::Timeout, _, _) => Err(ApiRequestError::Timeout),
                    (RequestOutcome::Cancelled(_), _, _) => Err(ApiRequestError::Cancelled),
                    _ => Err(ApiRequestError::Malformed),
                };
                events.push(DeviceEvent::ApiRequestDone { id, result });
            }
        }
    }

    fn enqueue_internal(
        &mut self,
        priority: Priority,
        request: Request,
        tag: RequestTag,
        datastore: &mut Datastore,
        now_us: u64,
        events: &mut Vec<DeviceEvent>,
    ) {
        if self.dispatcher.enqueue(priority, request, tag, None).is_err() {
            warn!("request queue full, cancelling {tag:?}");
            self.route(
                DispatchEvent {
                    tag,
                    outcome: RequestOutcome::Cancelled(CancelReason::Rejected),
                },
                datastore,
                now_us,
                events,
            );
        }
    }

    fn install_session(&mut self, session_id: u32, params: SessionParams, now_us: u64) {
        self.comm.set_session_params(
            params.rx_timeout_us as u64,
            params.rx_buffer_size as usize,
        );
        self.codec.set_max_request_data(params.rx_buffer_size as usize);
        self.throttler.set_bitrate(params.max_bitrate_bps as u64, now_us);
        self.heartbeat
            .start(session_id, params.heartbeat_timeout_us as u64, now_us);
        self.session = Some(Session {
            id: session_id,
            params,
        });
    }

    /// Tear down session state shared by every loss path.
    fn clear_session(&mut self, datastore: &mut Datastore, now_us: u64) {
        self.comm.reset();
        self.comm
            .set_session_params(DEFAULT_RX_TIMEOUT_US, u16::MAX as usize);
        self.codec.set_max_request_data(u16::MAX as usize);
        self.throttler.set_bitrate(0, now_us);
        self.heartbeat.stop();
        self.info_poller.stop();
        self.session_initializer.reset();
        self.memory_reader.reset();
        self.memory_writer.reset();
        self.session = None;
        self.device_info = None;
        datastore.invalidate_values();
    }

    fn restart_discovery(
        &mut self,
        datastore: &mut Datastore,
        now_us: u64,
        loss: Option<SessionLossReason>,
        events: &mut Vec<DeviceEvent>,
    ) {
        for event in self.dispatcher.cancel_all(CancelReason::SessionLost) {
            self.route(event, datastore, now_us, events);
        }
        self.clear_session(datastore, now_us);
        if let Some(reason) = loss {
            events.push(DeviceEvent::SessionLost { reason });
        }
        self.searcher.enable();
        self.set_phase(ConnectionPhase::Discovering, events);
    }

    fn regress_to_connecting(
        &mut self,
        datastore: &mut Datastore,
        now_us: u64,
        events: &mut Vec<DeviceEvent>,
    ) {
        for event in self.dispatcher.cancel_all(CancelReason::SessionLost) {
            self.route(event, datastore, now_us, events);
        }
        self.clear_session(datastore, now_us);
        self.set_phase(ConnectionPhase::Connecting, events);
    }

    fn set_phase(&mut self, phase: ConnectionPhase, events: &mut Vec<DeviceEvent>) {
        if self.phase != phase {
            info!("device phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
            events.push(DeviceEvent::PhaseChanged {
                phase,
                info: self.device_info.clone(),
            });
        }
    }

    pub fn request_disconnect(&mut self) {
        if let Some(session) = &self.session
            && let Ok(request) = self.codec.disconnect_request(session.id)
            && self
                .dispatcher
                .enqueue(Priority::High, request, RequestTag::Disconnect, None)
                .is_err()
        {
            warn!("request queue full, disconnect not sent");
        }
    }

    pub fn submit_user_command(
        &mut self,
        id: u32,
        subfunction: u8,
        data: Vec<u8>,
    ) -> Result<(), ApiRequestError> {
        if self.session.is_none() {
            return Err(ApiRequestError::NoSession);
        }
        let request = self
            .codec
            .user_command_request(subfunction, data)
            .map_err(|_| ApiRequestError::TooLarge)?;
        self.dispatcher
            .enqueue(Priority::Normal, request, RequestTag::UserCommand(id), None)
            .map_err(|_| ApiRequestError::QueueFull)
    }

    pub fn submit_memory_read(
        &mut self,
        id: u32,
        address: u64,
        length: u16,
    ) -> Result<(), ApiRequestError> {
        let (Some(session), Some(info)) = (self.session, self.device_info.clone()) else {
            return Err(ApiRequestError::NoSession);
        };
        if info
            .forbidden_regions
            .iter()
            .any(|region| region.touches(address, length))
        {
            return Err(PolicyError::Forbidden.into());
        }
        let mut encoder = HeaderStreamEncoder::new(
            info.address_size,
            session.params.rx_buffer_size as usize,
            session.params.tx_buffer_size as usize,
        );
        encoder
            .write(address, length)
            .map_err(|_| ApiRequestError::TooLarge)?;
        let request = Request::new(
            CommandId::MemoryControl,
            MemoryControlSubfn::Read,
            encoder.into_data(),
        );
        self.dispatcher
            .enqueue(Priority::Normal, request, RequestTag::ApiMemoryRead(id), None)
            .map_err(|_| ApiRequestError::QueueFull)?;
        self.api_reads.insert(id, (address, length));
        Ok(())
    }

    pub fn submit_memory_write(
        &mut self,
        id: u32,
        address: u64,
        data: Vec<u8>,
    ) -> Result<(), ApiRequestError> {
        let (Some(session), Some(info)) = (self.session, self.device_info.clone()) else {
            return Err(ApiRequestError::NoSession);
        };
        let length = data.len() as u16;
        if info
            .forbidden_regions
            .iter()
            .any(|region| region.touches(address, length))
        {
            return Err(PolicyError::Forbidden.into());
        }
        if info
            .readonly_regions
            .iter()
            .any(|region| region.touches(address, length))
        {
            return Err(PolicyError::Readonly.into());
        }
        if !info.supported_features.memory_write {
            return Err(ApiRequestError::Unsupported);
        }
        let mut encoder = DataStreamEncoder::new(
            info.address_size,
            session.params.rx_buffer_size as usize,
            session.params.tx_buffer_size as usize,
        );
        encoder
            .write(address, &data)
            .map_err(|_| ApiRequestError::TooLarge)?;
        let request = Request::new(
            CommandId::MemoryControl,
            MemoryControlSubfn::Write,
            encoder.into_data(),
        );
        self.dispatcher
            .enqueue(Priority::Normal, request, RequestTag::ApiMemoryWrite(id), None)
            .map_err(|_| ApiRequestError::QueueFull)?;
        self.api_writes.insert(id, (address, length));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> DeviceHandler {
        DeviceHandler::new(&Config::default())
    }

    #[test]
    fn test_starts_link_down() {
        let mut handler = handler();
        let mut datastore = Datastore::new();
        assert_eq!(handler.phase(), ConnectionPhase::LinkDown);
        // nothing is transmitted without a link
        assert!(handler.tick(0, &mut datastore).is_empty());
        let mut buf = [0u8; 64];
        assert_eq!(handler.drain_tx(&mut buf), 0);
    }

    #[test]
    fn test_link_up_starts_discovery() {
        let mut handler = handler();
        let mut datastore = Datastore::new();
        let events = handler.on_link_up(0);
        assert!(matches!(
            events[0],
            DeviceEvent::PhaseChanged {
                phase: ConnectionPhase::Discovering,
                ..
            }
        ));

        handler.tick(0, &mut datastore);
        let mut buf = [0u8; 64];
        let n = handler.drain_tx(&mut buf);
        // a discover request went out: CommControl.Discover with magic
        assert!(n > 0);
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1], 0x01);
        assert_eq!(&buf[4..8], &crate::protocol::DISCOVER_MAGIC);
    }

    #[test]
    fn test_api_calls_require_session() {
        let mut handler = handler();
        assert_eq!(
            handler.submit_user_command(1, 1, vec![]),
            Err(ApiRequestError::NoSession)
        );
        assert_eq!(
            handler.submit_memory_read(1, 0x1000, 4),
            Err(ApiRequestError::NoSession)
        );
        assert_eq!(
            handler.submit_memory_write(1, 0x1000, vec![0]),
            Err(ApiRequestError::NoSession)
        );
    }

    #[test]
    fn test_link_down_regresses_phase() {
        let mut handler = handler();
        let mut datastore = Datastore::new();
        handler.on_link_up(0);
        let events = handler.on_link_down(&mut datastore, 0);
        assert!(matches!(
            events.last(),
            Some(DeviceEvent::PhaseChanged {
                phase: ConnectionPhase::LinkDown,
                ..
            })
        ));
        assert_eq!(handler.phase(), ConnectionPhase::LinkDown);
    }

    #[test]
    fn test_region_touch_policy() {
        let region = MemoryRegion {
            start: 0x1000,
            end: 0x2000,
        };
        // block end is inclusive: [0x0FFC, 0x1000] touches
        assert!(region.touches(0x0FFC, 4));
        assert!(!region.touches(0x0FFB, 4));
        // range end is exclusive, but the block reaching it still touches
        // because the block start 0x1FFF lies inside
        assert!(region.touches(0x1FFF, 1));
        assert!(!region.touches(0x2000, 4));
        assert!(region.touches(0x0800, 0x2000));
    }
}
