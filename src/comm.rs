//! Half-duplex framing layer between the link and the dispatcher.
//!
//! Reception runs a byte-at-a-time state machine over the response frame
//! layout (`cmd|0x80, subfn, code, len, data, crc`) with an inter-byte
//! timeout; transmission serializes one request at a time and hands bytes
//! out through [`CommHandler::pop_data`]. At most one direction is active at
//! any instant: bytes arriving mid-transmission are dropped.

use log::{debug, warn};
use thiserror::Error;

use crate::crc::crc32_chunks;
use crate::protocol::{CommandId, RESPONSE_FLAG, Request, Response, ResponseCode};

pub const MIN_RX_BUFFER_SIZE: usize = 32;
pub const MAX_RX_BUFFER_SIZE: usize = 65535;
pub const DEFAULT_RX_TIMEOUT_US: u64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommError {
    #[error("a transmission is already in progress")]
    Busy,
    #[error("payload of {size} bytes exceeds the device receive buffer ({max} bytes)")]
    Overflow { size: usize, max: usize },
}

/// Frame-level receive faults. Local by contract: the frame is dropped, the
/// state machine recovers, nothing is surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds the receive buffer ({max} bytes)")]
    Overflow { len: usize, max: usize },
    #[error("CRC mismatch (expected {expected:#010X}, got {got:#010X})")]
    BadCrc { expected: u32, got: u32 },
    #[error("inter-byte timeout")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitCmd,
    WaitSubfn,
    WaitCode,
    WaitLen,
    WaitData,
    WaitCrc,
    WaitProcess,
    Error,
}

#[derive(Debug)]
pub struct CommHandler {
    enabled: bool,
    rx_state: RxState,
    rx_timeout_us: u64,
    rx_buffer_size: usize,
    last_rx_us: u64,
    cmd: u8,
    subfn: u8,
    code: u8,
    len: u16,
    len_bytes: u8,
    data: Vec<u8>,
    crc: u32,
    crc_bytes: u8,
    pending: Option<Response>,
    tx: Vec<u8>,
    tx_pos: usize,
    tx_payload_max: usize,
}

impl CommHandler {
    pub fn new(rx_buffer_size: usize) -> Self {
        CommHandler {
            enabled: false,
            rx_state: RxState::WaitCmd,
            rx_timeout_us: DEFAULT_RX_TIMEOUT_US,
            rx_buffer_size: rx_buffer_size.clamp(MIN_RX_BUFFER_SIZE, MAX_RX_BUFFER_SIZE),
            last_rx_us: 0,
            cmd: 0,
            subfn: 0,
            code: 0,
            len: 0,
            len_bytes: 0,
            data: Vec::new(),
            crc: 0,
            crc_bytes: 0,
            pending: None,
            tx: Vec::new(),
            tx_pos: 0,
            tx_payload_max: u16::MAX as usize,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.reset();
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Apply the timings and buffer sizes negotiated through GetParams.
    pub fn set_session_params(&mut self, rx_timeout_us: u64, device_rx_buffer_size: usize) {
        self.rx_timeout_us = rx_timeout_us.max(1);
        self.tx_payload_max = device_rx_buffer_size;
    }

    pub fn reset(&mut self) {
        self.reset_rx();
        self.pending = None;
        self.tx.clear();
        self.tx_pos = 0;
    }

    fn reset_rx(&mut self) {
        self.rx_state = RxState::WaitCmd;
        self.len = 0;
        self.len_bytes = 0;
        self.data.clear();
        self.crc = 0;
        self.crc_bytes = 0;
    }

    /// Reset a reception that went quiet for longer than the inter-byte
    /// timeout. Called once per tick so a dead partial frame cannot hold the
    /// channel; the same check runs lazily before each received byte.
    pub fn check_rx_timeout(&mut self, now_us: u64) {
        if self.rx_stale(now_us) {
            debug!("{}", FrameError::Timeout);
            self.reset_rx();
        }
    }

    fn rx_stale(&self, now_us: u64) -> bool {
        let mid_frame = !matches!(self.rx_state, RxState::WaitCmd | RxState::WaitProcess);
        mid_frame && now_us.saturating_sub(self.last_rx_us) >= self.rx_timeout_us
    }

    pub fn process_data(&mut self, bytes: &[u8], now_us: u64) {
        if !self.enabled {
            return;
        }
        if self.is_transmitting() {
            debug!("dropped {} bytes received while transmitting", bytes.len());
            return;
        }
        for &byte in bytes {
            self.process_byte(byte, now_us);
        }
    }

    fn process_byte(&mut self, byte: u8, now_us: u64) {
        if self.rx_stale(now_us) {
            if self.rx_state == RxState::Error {
                debug!("receive error cleared after quiet period");
            } else {
                debug!("{}", FrameError::Timeout);
            }
            self.reset_rx();
        }
        self.last_rx_us = now_us;

        match self.rx_state {
            RxState::WaitCmd => {
                self.cmd = byte;
                self.rx_state = RxState::WaitSubfn;
            }
            RxState::WaitSubfn => {
                self.subfn = byte;
                self.rx_state = RxState::WaitCode;
            }
            RxState::WaitCode => {
                self.code = byte;
                self.len = 0;
                self.len_bytes = 0;
                self.rx_state = RxState::WaitLen;
            }
            RxState::WaitLen => {
                self.len = (self.len << 8) | byte as u16;
                self.len_bytes += 1;
                if self.len_bytes == 2 {
                    if self.len as usize > self.rx_buffer_size {
                        warn!(
                            "{}",
                            FrameError::Overflow {
                                len: self.len as usize,
                                max: self.rx_buffer_size,
                            }
                        );
                        self.rx_state = RxState::Error;
                    } else if self.len == 0 {
                        self.crc = 0;
                        self.crc_bytes = 0;
                        self.rx_state = RxState::WaitCrc;
                    } else {
                        self.rx_state = RxState::WaitData;
                    }
                }
            }
            RxState::WaitData => {
                self.data.push(byte);
                if self.data.len() == self.len as usize {
                    self.crc = 0;
                    self.crc_bytes = 0;
                    self.rx_state = RxState::WaitCrc;
                }
            }
            RxState::WaitCrc => {
                self.crc = (self.crc << 8) | byte as u32;
                self.crc_bytes += 1;
                if self.crc_bytes == 4 {
                    self.finish_frame();
                }
            }
            // a decoded response is waiting to be collected
            RxState::WaitProcess => {}
            // drained until a quiet period restores the state machine
            RxState::Error => {}
        }
    }

    fn finish_frame(&mut self) {
        let expected = crc32_chunks(&[
            &[self.cmd, self.subfn, self.code],
            &self.len.to_be_bytes(),
            &self.data,
        ]);
        if expected != self.crc {
            debug!(
                "{}",
                FrameError::BadCrc {
                    expected,
                    got: self.crc,
                }
            );
            self.reset_rx();
            return;
        }
        if self.cmd & RESPONSE_FLAG == 0 {
            warn!("dropped frame without response flag (cmd {:#04X})", self.cmd);
            self.reset_rx();
            return;
        }
        let Ok(command) = CommandId::try_from(self.cmd & !RESPONSE_FLAG) else {
            warn!("dropped frame with unknown command id {:#04X}", self.cmd);
            self.reset_rx();
            return;
        };
        let Ok(code) = ResponseCode::try_from(self.code) else {
            warn!("dropped frame with unknown response code {:#04X}", self.code);
            self.reset_rx();
            return;
        };
        self.pending = Some(Response {
            command,
            subfunction: self.subfn,
            code,
            data: std::mem::take(&mut self.data),
        });
        self.rx_state = RxState::WaitProcess;
    }

    pub fn response_available(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pop_response(&mut self) -> Option<Response> {
        let response = self.pending.take();
        if response.is_some() {
            self.reset_rx();
        }
        response
    }

    /// Serialize a request for transmission. Only legal while the channel is
    /// idle in both directions.
    pub fn send_request(&mut self, request: &Request) -> Result<usize, CommError> {
        if !self.idle() {
            return Err(CommError::Busy);
        }
        if request.data.len() > self.tx_payload_max {
            return Err(CommError::Overflow {
                size: request.data.len(),
                max: self.tx_payload_max,
            });
        }
        self.tx = request.to_bytes();
        self.tx_pos = 0;
        Ok(self.tx.len())
    }

    /// Copy up to `buf.len()` queued transmit bytes in wire order. Returns to
    /// idle once the last byte has been popped.
    pub fn pop_data(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.tx.len() - self.tx_pos);
        buf[..n].copy_from_slice(&self.tx[self.tx_pos..self.tx_pos + n]);
        self.tx_pos += n;
        if self.tx_pos == self.tx.len() {
            self.tx.clear();
            self.tx_pos = 0;
        }
        n
    }

    pub fn is_transmitting(&self) -> bool {
        self.tx_pos < self.tx.len()
    }

    pub fn idle(&self) -> bool {
        self.enabled
            && !self.is_transmitting()
            && self.rx_state == RxState::WaitCmd
            && self.pending.is_none()
    }
}
