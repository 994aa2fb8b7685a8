//! The core event loop. One periodic tick drains API commands, manages the
//! link lifecycle, moves bytes between the link and the device handler, and
//! translates device events into API events and reply resolutions. The
//! protocol machinery itself is synchronous; only the tick pacing and the
//! channels are async.

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::api::{self, ApiCommand, ApiError, ApiEvent, ApiHandle, EntrySpec};
use crate::config::Config;
use crate::datastore::{Datastore, EntryHandle};
use crate::device::{ApiRequestError, ConnectionPhase, DeviceEvent, DeviceHandler};
use crate::link::{Link, LinkError, create_link};
use crate::timebase::Timebase;

const LINK_BACKOFF_MS: [u64; 4] = [50, 200, 1000, 5000];
const API_CHANNEL_CAPACITY: usize = 64;
const IO_CHUNK: usize = 4096;
const SHUTDOWN_DRAIN_TICKS: usize = 5;

enum PendingReply {
    Bytes(oneshot::Sender<Result<Vec<u8>, ApiError>>),
    Unit(oneshot::Sender<Result<(), ApiError>>),
}

pub struct ScrutinyServer {
    config: Config,
    datastore: Datastore,
    handler: DeviceHandler,
    link: Option<Box<dyn Link>>,
    link_retry_at_us: u64,
    link_backoff_index: usize,
    timebase: Timebase,
    commands: mpsc::Receiver<ApiCommand>,
    events: mpsc::UnboundedSender<ApiEvent>,
    next_api_id: u32,
    pending_api: HashMap<u32, PendingReply>,
    pending_writes: HashMap<EntryHandle, Vec<oneshot::Sender<Result<(), ApiError>>>>,
    tx_spill: Vec<u8>,
    shutdown: bool,
}

impl ScrutinyServer {
    pub fn new(config: Config) -> (Self, ApiHandle, mpsc::UnboundedReceiver<ApiEvent>) {
        let (api_handle, commands) = api::channel(API_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handler = DeviceHandler::new(&config);
        let link = create_link(&config.link);
        let server = ScrutinyServer {
            config,
            datastore: Datastore::new(),
            handler,
            link,
            link_retry_at_us: 0,
            link_backoff_index: 0,
            timebase: Timebase::new(),
            commands,
            events: events_tx,
            next_api_id: 0,
            pending_api: HashMap::new(),
            pending_writes: HashMap::new(),
            tx_spill: Vec::new(),
            shutdown: false,
        };
        (server, api_handle, events_rx)
    }

    pub async fn run(mut self) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("server loop started");
        while !self.shutdown {
            interval.tick().await;
            self.tick_once();
        }
        // best-effort clean disconnect before the loop winds down
        self.handler.request_disconnect();
        for _ in 0..SHUTDOWN_DRAIN_TICKS {
            interval.tick().await;
            self.tick_once();
        }
        info!("server loop stopped");
    }

    fn tick_once(&mut self) {
        let now_us = self.timebase.now_us();
        self.drain_commands();
        self.manage_link(now_us);
        self.pump_rx(now_us);
        let events = self.handler.tick(now_us, &mut self.datastore);
        for event in events {
            self.dispatch_device_event(event);
        }
        self.pump_tx(now_us);
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: ApiCommand) {
        match command {
            ApiCommand::Register { spec, reply } => {
                let result = match spec {
                    EntrySpec::Variable {
                        address,
                        data_type,
                        endianness,
                        bitfield,
                    } => Ok(self
                        .datastore
                        .add_variable(address, data_type, endianness, bitfield)),
                    EntrySpec::Alias {
                        target,
                        gain,
                        offset,
                    } => self
                        .datastore
                        .add_alias(target, gain, offset)
                        .map_err(ApiError::from),
                    EntrySpec::Rpv { id, data_type } => Ok(self.datastore.add_rpv(id, data_type)),
                };
                let _ = reply.send(result);
            }
            ApiCommand::Watch { handle, reply } => {
                let _ = reply.send(self.datastore.watch(handle).map_err(ApiError::from));
            }
            ApiCommand::Unwatch { handle, reply } => {
                let _ = reply.send(self.datastore.unwatch(handle).map_err(ApiError::from));
            }
            ApiCommand::WriteValue {
                handle,
                value,
                reply,
            } => {
                if self.handler.phase() != ConnectionPhase::Connected {
                    let _ = reply.send(Err(ApiRequestError::NoSession.into()));
                    return;
                }
                match self
                    .datastore
                    .queue_write(handle, value)
                    .and_then(|()| self.datastore.resolve(handle))
                {
                    Ok(terminal) => self.pending_writes.entry(terminal).or_default().push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            ApiCommand::ReadMemory {
                address,
                length,
                reply,
            } => {
                let id = self.next_api_id();
                match self.handler.submit_memory_read(id, address, length) {
                    Ok(()) => {
                        self.pending_api.insert(id, PendingReply::Bytes(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            ApiCommand::WriteMemory {
                address,
                data,
                reply,
            } => {
                let id = self.next_api_id();
                match self.handler.submit_memory_write(id, address, data) {
                    Ok(()) => {
                        self.pending_api.insert(id, PendingReply::Unit(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            ApiCommand::UserCommand {
                subfunction,
                data,
                reply,
            } => {
                let id = self.next_api_id();
                match self.handler.submit_user_command(id, subfunction, data) {
                    Ok(()) => {
                        self.pending_api.insert(id, PendingReply::Bytes(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            ApiCommand::GetDeviceInfo { reply } => {
                let _ = reply.send(self.handler.device_info());
            }
            ApiCommand::ConfigureLink { link, reply } => {
                let now_us = self.timebase.now_us();
                if let Some(old) = &mut self.link {
                    old.close();
                }
                for event in self.handler.on_link_down(&mut self.datastore, now_us) {
                    self.dispatch_device_event(event);
                }
                self.link = create_link(&link);
                self.link_retry_at_us = now_us;
                self.link_backoff_index = 0;
                self.config.link = link;
                let _ = reply.send(Ok(()));
            }
            ApiCommand::Shutdown => {
                self.shutdown = true;
            }
        }
    }

    fn manage_link(&mut self, now_us: u64) {
        let Some(link) = &mut self.link else {
            return;
        };
        if link.operational() || now_us < self.link_retry_at_us {
            return;
        }
        match link.open() {
            Ok(()) => {
                self.link_backoff_index = 0;
                for event in self.handler.on_link_up(now_us) {
                    self.dispatch_device_event(event);
                }
            }
            Err(e) => self.handle_link_error(e, now_us),
        }
    }

    fn handle_link_error(&mut self, error: LinkError, now_us: u64) {
        let fatal = error.is_fatal();
        warn!("{error}");
        let _ = self.events.send(ApiEvent::LinkError { fatal });
        if let Some(link) = &mut self.link {
            link.close();
        }
        if fatal {
            self.link = None;
            let events = self.handler.on_link_down(&mut self.datastore, now_us);
            for event in events {
                self.dispatch_device_event(event);
            }
        } else {
            let backoff_ms = LINK_BACKOFF_MS[self.link_backoff_index];
            self.link_backoff_index = (self.link_backoff_index + 1).min(LINK_BACKOFF_MS.len() - 1);
            self.link_retry_at_us = now_us + backoff_ms * 1000;
        }
    }

    fn pump_rx(&mut self, now_us: u64) {
        let mut buf = [0u8; IO_CHUNK];
        loop {
            let Some(link) = &mut self.link else {
                return;
            };
            if !link.operational() {
                return;
            }
            match link.read_nonblocking(&mut buf) {
                Ok(0) => return,
                Ok(n) => self.handler.feed_rx(&buf[..n], now_us),
                Err(e) => {
                    self.handle_link_error(e, now_us);
                    return;
                }
            }
        }
    }

    fn pump_tx(&mut self, now_us: u64) {
        let mut buf = [0u8; IO_CHUNK];
        loop {
            if self.tx_spill.is_empty() {
                let n = self.handler.drain_tx(&mut buf);
                if n == 0 {
                    return;
                }
                self.tx_spill.extend_from_slice(&buf[..n]);
            }
            let Some(link) = &mut self.link else {
                self.tx_spill.clear();
                return;
            };
            if !link.operational() {
                return;
            }
            match link.write(&self.tx_spill) {
                Ok(0) => return,
                Ok(n) => {
                    self.tx_spill.drain(..n);
                }
                Err(e) => {
                    self.handle_link_error(e, now_us);
                    return;
                }
            }
        }
    }

    fn dispatch_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::PhaseChanged { phase, info } => {
                let _ = self.events.send(ApiEvent::DeviceStateChanged { phase, info });
            }
            DeviceEvent::SessionLost { reason } => {
                // queued writes can no longer complete in this session
                for (_, replies) in self.pending_writes.drain() {
                    for reply in replies {
                        let _ = reply.send(Err(ApiRequestError::Cancelled.into()));
                    }
                }
                let _ = self.events.send(ApiEvent::SessionLost { reason });
            }
            DeviceEvent::ValuesUpdated(handles) => {
                for handle in handles {
                    self.publish_value(handle);
                    for (alias, _, _) in self.datastore.watched_aliases_of(handle) {
                        self.publish_alias_value(alias, handle);
                    }
                }
            }
            DeviceEvent::WriteResult { handle, result } => {
                if let Some(replies) = self.pending_writes.remove(&handle) {
                    for reply in replies {
                        let _ = reply.send(result.clone().map_err(ApiError::from));
                    }
                }
                if result.is_ok() {
                    self.publish_value(handle);
                }
            }
            DeviceEvent::ApiRequestDone { id, result } => match self.pending_api.remove(&id) {
                Some(PendingReply::Bytes(reply)) => {
                    let _ = reply.send(result.map_err(ApiError::from));
                }
                Some(PendingReply::Unit(reply)) => {
                    let _ = reply.send(result.map(|_| ()).map_err(ApiError::from));
                }
                None => warn!("no caller waiting for api request {id}"),
            },
        }
    }

    fn publish_value(&mut self, handle: EntryHandle) {
        if let Some(entry) = self.datastore.get(handle)
            && let (Some(value), Some(timestamp)) = (entry.value, entry.last_update)
        {
            let _ = self.events.send(ApiEvent::ValueUpdate {
                handle,
                value,
                timestamp,
            });
        }
    }

    fn publish_alias_value(&mut self, alias: EntryHandle, target: EntryHandle) {
        let Some(target_entry) = self.datastore.get(target) else {
            return;
        };
        let (Some(value), Some(timestamp)) = (target_entry.value, target_entry.last_update) else {
            return;
        };
        let Ok((gain, offset)) = self.datastore.scaling_of(alias) else {
            return;
        };
        let _ = self.events.send(ApiEvent::ValueUpdate {
            handle: alias,
            value: crate::datastore::EntryValue::Float(value.as_f64() * gain + offset),
            timestamp,
        });
    }

    fn next_api_id(&mut self) -> u32 {
        let id = self.next_api_id;
        self.next_api_id = self.next_api_id.wrapping_add(1);
        id
    }
}
