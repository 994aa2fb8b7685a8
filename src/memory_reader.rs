//! Read-side reconciliation: periodically batches watched entries into
//! read-memory (and read-RPV) requests and folds the responses back into the
//! datastore.
//!
//! Batches are built round-robin from a moving cursor so every watched entry
//! makes progress regardless of how many fit a single request. Blocks
//! touching a forbidden region are filtered out before submission.

use log::{debug, warn};

use crate::blocks::{
    DataStreamParser, HeaderStreamEncoder, RpvDataStreamParser, RpvIdStreamEncoder,
    WriteBlockError,
};
use crate::datastore::{Datastore, Endianness, EntryHandle, RpvTarget, VariableTarget, decode_value};
use crate::device::{DeviceInfo, Session};
use crate::dispatcher::RequestOutcome;
use crate::protocol::{CommandId, MemoryControlSubfn, Request, ResponseCode};

#[derive(Debug)]
enum Batch {
    Variables(Vec<VariableTarget>),
    Rpvs(Vec<RpvTarget>),
}

#[derive(Debug)]
pub struct MemoryReader {
    var_cursor: usize,
    rpv_cursor: usize,
    prefer_rpv: bool,
    batch: Option<Batch>,
}

impl MemoryReader {
    pub fn new() -> Self {
        MemoryReader {
            var_cursor: 0,
            rpv_cursor: 0,
            prefer_rpv: false,
            batch: None,
        }
    }

    pub fn reset(&mut self) {
        self.batch = None;
    }

    pub fn idle(&self) -> bool {
        self.batch.is_none()
    }

    pub fn poll(
        &mut self,
        datastore: &Datastore,
        session: &Session,
        info: &DeviceInfo,
    ) -> Option<Request> {
        if self.batch.is_some() {
            return None;
        }
        // alternate between variable and RPV laps so neither kind starves
        for attempt in 0..2 {
            let use_rpv = self.prefer_rpv ^ (attempt == 1);
            let request = if use_rpv {
                self.build_rpv_batch(datastore, session)
            } else {
                self.build_variable_batch(datastore, session, info)
            };
            if request.is_some() {
                self.prefer_rpv = !use_rpv;
                return request;
            }
        }
        None
    }

    fn build_variable_batch(
        &mut self,
        datastore: &Datastore,
        session: &Session,
        info: &DeviceInfo,
    ) -> Option<Request> {
        let targets = datastore.watched_variables();
        if targets.is_empty() {
            return None;
        }
        let mut encoder = HeaderStreamEncoder::new(
            info.address_size,
            session.params.rx_buffer_size as usize,
            session.params.tx_buffer_size as usize,
        );
        let mut batch = Vec::new();
        let len = targets.len();
        let mut considered = 0;
        for i in 0..len {
            let target = targets[(self.var_cursor + i) % len];
            let size = target.data_type.size_bytes() as u16;
            if info
                .forbidden_regions
                .iter()
                .any(|region| region.touches(target.address, size))
            {
                debug!(
                    "entry {} at {:#X} overlaps a forbidden region, not polled",
                    target.handle, target.address
                );
                considered += 1;
                continue;
            }
            match encoder.write(target.address, size) {
                Ok(()) => {
                    batch.push(target);
                    considered += 1;
                }
                Err(WriteBlockError::Overflow) => break,
                Err(WriteBlockError::Address(e)) => {
                    warn!("entry {} not readable: {e}", target.handle);
                    considered += 1;
                }
            }
        }
        self.var_cursor = (self.var_cursor + considered) % len;
        if batch.is_empty() {
            return None;
        }
        let data = encoder.into_data();
        self.batch = Some(Batch::Variables(batch));
        Some(Request::new(
            CommandId::MemoryControl,
            MemoryControlSubfn::Read,
            data,
        ))
    }

    fn build_rpv_batch(&mut self, datastore: &Datastore, session: &Session) -> Option<Request> {
        let targets = datastore.watched_rpvs();
        if targets.is_empty() {
            return None;
        }
        let mut encoder = RpvIdStreamEncoder::new(
            session.params.rx_buffer_size as usize,
            session.params.tx_buffer_size as usize,
        );
        let mut batch = Vec::new();
        let len = targets.len();
        for i in 0..len {
            let target = targets[(self.rpv_cursor + i) % len];
            if encoder
                .write(target.id, target.data_type.size_bytes())
                .is_err()
            {
                break;
            }
            batch.push(target);
        }
        self.rpv_cursor = (self.rpv_cursor + batch.len()) % len;
        if batch.is_empty() {
            return None;
        }
        let data = encoder.into_data();
        self.batch = Some(Batch::Rpvs(batch));
        Some(Request::new(
            CommandId::MemoryControl,
            MemoryControlSubfn::ReadRpv,
            data,
        ))
    }

    /// Fold a completed read back into the datastore. Returns the entries
    /// whose value changed.
    pub fn handle(
        &mut self,
        outcome: &RequestOutcome,
        datastore: &mut Datastore,
        info: &DeviceInfo,
    ) -> Vec<EntryHandle> {
        let Some(batch) = self.batch.take() else {
            return Vec::new();
        };
        let response = match outcome {
            RequestOutcome::Response(response) if response.code == ResponseCode::Ok => response,
            RequestOutcome::Response(response) => {
                warn!("memory read refused with {:?}", response.code);
                return Vec::new();
            }
            RequestOutcome::Timeout => {
                debug!("memory read timed out");
                return Vec::new();
            }
            RequestOutcome::Cancelled(_) => return Vec::new(),
        };
        match batch {
            Batch::Variables(targets) => {
                let mut parser = DataStreamParser::new(&response.data, info.address_size);
                let mut updated = Vec::new();
                for target in &targets {
                    let Some(block) = parser.next() else {
                        break;
                    };
                    if block.address != target.address
                        || block.data.len() != target.data_type.size_bytes()
                    {
                        warn!(
                            "read response block {:#X} does not match the requested {:#X}",
                            block.address, target.address
                        );
                        break;
                    }
                    match decode_value(
                        &block.data,
                        target.data_type,
                        target.endianness,
                        target.bitfield,
                    ) {
                        Some(value) => {
                            datastore.set_value(target.handle, value);
                            updated.push(target.handle);
                        }
                        None => warn!("entry {} received an undecodable value", target.handle),
                    }
                }
                if parser.invalid() {
                    warn!("malformed memory read response");
                }
                updated
            }
            Batch::Rpvs(targets) => {
                let mut blocks = Vec::new();
                {
                    let size_of =
                        |id: u16| datastore.rpv_type_by_id(id).map(|t| t.size_bytes());
                    let mut parser = RpvDataStreamParser::new(&response.data);
                    while let Some(block) = parser.next(size_of) {
                        blocks.push(block);
                    }
                    if parser.invalid() {
                        warn!("malformed RPV read response");
                    }
                }
                let mut updated = Vec::new();
                for (target, block) in targets.iter().zip(blocks) {
                    if block.id != target.id {
                        warn!(
                            "RPV response id {:#06X} does not match the requested {:#06X}",
                            block.id, target.id
                        );
                        break;
                    }
                    match decode_value(&block.data, target.data_type, Endianness::Big, None) {
                        Some(value) => {
                            datastore.set_value(target.handle, value);
                            updated.push(target.handle);
                        }
                        None => warn!("RPV {:#06X} received an undecodable value", target.id),
                    }
                }
                updated
            }
        }
    }
}

impl Default for MemoryReader {
    fn default() -> Self {
        Self::new()
    }
}
