//! Channel surface between API consumers and the core event loop.
//!
//! The core owns the datastore and the link exclusively; API threads talk to
//! it through commands carrying a oneshot reply sender, and observe it
//! through a broadcast-style event stream. Nothing here blocks the core: the
//! loop drains commands at the top of each tick and answers when the final
//! outcome is known.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::LinkConfig;
use crate::datastore::{Bitfield, DataType, DatastoreError, Endianness, EntryHandle, EntryValue};
use crate::device::{ApiRequestError, ConnectionPhase, DeviceInfo, SessionLossReason};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error(transparent)]
    Request(#[from] ApiRequestError),
    #[error("server is shutting down")]
    Shutdown,
}

/// Definition of a watchable entry, normally produced by the firmware
/// description loader.
#[derive(Debug, Clone)]
pub enum EntrySpec {
    Variable {
        address: u64,
        data_type: DataType,
        endianness: Endianness,
        bitfield: Option<Bitfield>,
    },
    Alias {
        target: EntryHandle,
        gain: f64,
        offset: f64,
    },
    Rpv {
        id: u16,
        data_type: DataType,
    },
}

#[derive(Debug)]
pub enum ApiCommand {
    Register {
        spec: EntrySpec,
        reply: oneshot::Sender<Result<EntryHandle, ApiError>>,
    },
    Watch {
        handle: EntryHandle,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Unwatch {
        handle: EntryHandle,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    WriteValue {
        handle: EntryHandle,
        value: EntryValue,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    ReadMemory {
        address: u64,
        length: u16,
        reply: oneshot::Sender<Result<Vec<u8>, ApiError>>,
    },
    WriteMemory {
        address: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    UserCommand {
        subfunction: u8,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, ApiError>>,
    },
    GetDeviceInfo {
        reply: oneshot::Sender<Option<Arc<DeviceInfo>>>,
    },
    ConfigureLink {
        link: LinkConfig,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum ApiEvent {
    DeviceStateChanged {
        phase: ConnectionPhase,
        info: Option<Arc<DeviceInfo>>,
    },
    ValueUpdate {
        handle: EntryHandle,
        value: EntryValue,
        timestamp: DateTime<Utc>,
    },
    SessionLost {
        reason: SessionLossReason,
    },
    LinkError {
        fatal: bool,
    },
}

pub fn channel(capacity: usize) -> (ApiHandle, mpsc::Receiver<ApiCommand>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ApiHandle { commands: tx }, rx)
}

/// Cloneable client handle; every method resolves with the operation's final
/// outcome.
#[derive(Debug, Clone)]
pub struct ApiHandle {
    commands: mpsc::Sender<ApiCommand>,
}

impl ApiHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, ApiError>>) -> ApiCommand,
    ) -> Result<T, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ApiError::Shutdown)?;
        rx.await.map_err(|_| ApiError::Shutdown)?
    }

    pub async fn register(&self, spec: EntrySpec) -> Result<EntryHandle, ApiError> {
        self.call(|reply| ApiCommand::Register { spec, reply }).await
    }

    pub async fn watch(&self, handle: EntryHandle) -> Result<(), ApiError> {
        self.call(|reply| ApiCommand::Watch { handle, reply }).await
    }

    pub async fn unwatch(&self, handle: EntryHandle) -> Result<(), ApiError> {
        self.call(|reply| ApiCommand::Unwatch { handle, reply }).await
    }

    pub async fn write(&self, handle: EntryHandle, value: EntryValue) -> Result<(), ApiError> {
        self.call(|reply| ApiCommand::WriteValue {
            handle,
            value,
            reply,
        })
        .await
    }

    pub async fn read_memory(&self, address: u64, length: u16) -> Result<Vec<u8>, ApiError> {
        self.call(|reply| ApiCommand::ReadMemory {
            address,
            length,
            reply,
        })
        .await
    }

    pub async fn write_memory(&self, address: u64, data: Vec<u8>) -> Result<(), ApiError> {
        self.call(|reply| ApiCommand::WriteMemory {
            address,
            data,
            reply,
        })
        .await
    }

    pub async fn user_command(&self, subfunction: u8, data: Vec<u8>) -> Result<Vec<u8>, ApiError> {
        self.call(|reply| ApiCommand::UserCommand {
            subfunction,
            data,
            reply,
        })
        .await
    }

    pub async fn get_device_info(&self) -> Result<Option<Arc<DeviceInfo>>, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ApiCommand::GetDeviceInfo { reply: tx })
            .await
            .map_err(|_| ApiError::Shutdown)?;
        rx.await.map_err(|_| ApiError::Shutdown)
    }

    pub async fn configure_link(&self, link: LinkConfig) -> Result<(), ApiError> {
        self.call(|reply| ApiCommand::ConfigureLink { link, reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(ApiCommand::Shutdown).await;
    }
}
