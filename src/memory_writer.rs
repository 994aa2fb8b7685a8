//! Write-side reconciliation: drains the datastore's pending-write FIFO one
//! request at a time. Writes touching forbidden or readonly regions fail
//! locally and never reach the device.

use log::warn;
use thiserror::Error;

use crate::blocks::{DataStreamEncoder, HeaderStreamParser, RpvDataStreamEncoder, RpvIdStreamParser};
use crate::datastore::{Datastore, DatastoreError, Endianness, EntryHandle, EntryKind, encode_value};
use crate::device::{DeviceInfo, PolicyError, Session};
use crate::dispatcher::RequestOutcome;
use crate::protocol::{CommandId, MemoryControlSubfn, Request, ResponseCode};

/// A write refused before transmission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteRejection {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("device does not support memory writes")]
    Unsupported,
    #[error(transparent)]
    Value(#[from] DatastoreError),
}

/// A transmitted write that did not land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteFailure {
    #[error("device refused the write with {0:?}")]
    Device(ResponseCode),
    #[error("write timed out")]
    Timeout,
    #[error("write cancelled")]
    Cancelled,
    #[error("write response does not echo the request")]
    Malformed,
}

#[derive(Debug)]
pub enum WriterAction {
    Idle,
    Send(Request),
    Rejected {
        handle: EntryHandle,
        error: WriteRejection,
    },
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Variable {
        handle: EntryHandle,
        address: u64,
        size: u16,
    },
    Rpv {
        handle: EntryHandle,
        id: u16,
    },
}

impl Job {
    fn handle(&self) -> EntryHandle {
        match *self {
            Job::Variable { handle, .. } | Job::Rpv { handle, .. } => handle,
        }
    }
}

#[derive(Debug)]
pub struct MemoryWriter {
    in_flight: Option<Job>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        MemoryWriter { in_flight: None }
    }

    pub fn reset(&mut self) {
        self.in_flight = None;
    }

    pub fn idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn poll(
        &mut self,
        datastore: &mut Datastore,
        session: &Session,
        info: &DeviceInfo,
    ) -> WriterAction {
        if self.in_flight.is_some() {
            return WriterAction::Idle;
        }
        let Some((handle, value)) = datastore.pop_pending_write() else {
            return WriterAction::Idle;
        };
        let Some(entry) = datastore.get(handle) else {
            return WriterAction::Idle;
        };
        match entry.kind.clone() {
            EntryKind::Variable {
                address,
                data_type,
                endianness,
                ..
            } => {
                if !info.supported_features.memory_write {
                    datastore.abort_write(handle);
                    return WriterAction::Rejected {
                        handle,
                        error: WriteRejection::Unsupported,
                    };
                }
                let size = data_type.size_bytes() as u16;
                if let Err(error) = check_write_policy(info, address, size) {
                    warn!("write to {address:#X} rejected: {error}");
                    datastore.abort_write(handle);
                    return WriterAction::Rejected {
                        handle,
                        error: error.into(),
                    };
                }
                let raw = match encode_value(value, data_type, endianness) {
                    Ok(raw) => raw,
                    Err(e) => {
                        datastore.abort_write(handle);
                        return WriterAction::Rejected {
                            handle,
                            error: e.into(),
                        };
                    }
                };
                let mut encoder = DataStreamEncoder::new(
                    info.address_size,
                    session.params.rx_buffer_size as usize,
                    session.params.tx_buffer_size as usize,
                );
                if let Err(e) = encoder.write(address, &raw) {
                    warn!("write to {address:#X} does not fit the device buffers: {e}");
                    datastore.abort_write(handle);
                    return WriterAction::Rejected {
                        handle,
                        error: WriteRejection::Value(DatastoreError::InvalidValue(data_type)),
                    };
                }
                self.in_flight = Some(Job::Variable {
                    handle,
                    address,
                    size,
                });
                WriterAction::Send(Request::new(
                    CommandId::MemoryControl,
                    MemoryControlSubfn::Write,
                    encoder.into_data(),
                ))
            }
            EntryKind::Rpv { id, data_type } => {
                let raw = match encode_value(value, data_type, Endianness::Big) {
                    Ok(raw) => raw,
                    Err(e) => {
                        datastore.abort_write(handle);
                        return WriterAction::Rejected {
                            handle,
                            error: e.into(),
                        };
                    }
                };
                let mut encoder = RpvDataStreamEncoder::new(
                    session.params.rx_buffer_size as usize,
                    session.params.tx_buffer_size as usize,
                );
                if encoder.write(id, &raw).is_err() {
                    datastore.abort_write(handle);
                    return WriterAction::Rejected {
                        handle,
                        error: WriteRejection::Value(DatastoreError::InvalidValue(data_type)),
                    };
                }
                self.in_flight = Some(Job::Rpv { handle, id });
                WriterAction::Send(Request::new(
                    CommandId::MemoryControl,
                    MemoryControlSubfn::WriteRpv,
                    encoder.into_data(),
                ))
            }
            EntryKind::Alias { .. } => {
                // queue_write stores pending values on terminal entries only
                datastore.abort_write(handle);
                WriterAction::Idle
            }
        }
    }

    pub fn handle(
        &mut self,
        outcome: &RequestOutcome,
        datastore: &mut Datastore,
        info: &DeviceInfo,
    ) -> Option<(EntryHandle, Result<(), WriteFailure>)> {
        let job = self.in_flight.take()?;
        let handle = job.handle();
        let result = match outcome {
            RequestOutcome::Response(response) if response.code == ResponseCode::Ok => {
                let echoed = match job {
                    Job::Variable { address, size, .. } => {
                        let mut parser = HeaderStreamParser::new(&response.data, info.address_size);
                        matches!(
                            parser.next(),
                            Some(block) if block.address == address && block.length == size
                        ) && parser.finished()
                    }
                    Job::Rpv { id, .. } => {
                        let mut parser = RpvIdStreamParser::new(&response.data);
                        parser.next() == Some(id) && parser.finished()
                    }
                };
                if echoed {
                    Ok(())
                } else {
                    Err(WriteFailure::Malformed)
                }
            }
            RequestOutcome::Response(response) => Err(WriteFailure::Device(response.code)),
            RequestOutcome::Timeout => Err(WriteFailure::Timeout),
            RequestOutcome::Cancelled(_) => Err(WriteFailure::Cancelled),
        };
        match result {
            Ok(()) => datastore.complete_write(handle),
            Err(ref failure) => {
                warn!("write to entry {handle} failed: {failure}");
                datastore.abort_write(handle);
            }
        }
        Some((handle, result))
    }
}

fn check_write_policy(info: &DeviceInfo, address: u64, size: u16) -> Result<(), PolicyError> {
    if info
        .forbidden_regions
        .iter()
        .any(|region| region.touches(address, size))
    {
        return Err(PolicyError::Forbidden);
    }
    if info
        .readonly_regions
        .iter()
        .any(|region| region.touches(address, size))
    {
        return Err(PolicyError::Readonly);
    }
    Ok(())
}

impl Default for MemoryWriter {
    fn default() -> Self {
        Self::new()
    }
}
