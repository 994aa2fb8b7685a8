//! Streaming codecs for MemoryControl payloads.
//!
//! Read/write requests and responses carry concatenated blocks rather than a
//! fixed layout, so they are encoded and parsed through cursors instead of
//! one-shot structs. Two stream shapes cover all four directions:
//!
//! ```text
//! header stream: (address, length_u16)*        read request, write response
//! data stream  : (address, length_u16, bytes)* read response, write request
//! ```
//!
//! plus the RPV equivalents keyed by 16-bit id. Encoders enforce both the
//! request-side budget (device RX buffer) and the projected response budget
//! (device TX buffer); overflow is recoverable, the stream is simply
//! truncated to the last whole block.

use bytes::Buf;
use thiserror::Error;

use crate::protocol::{AddressOverflow, AddressSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub address: u64,
    pub length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteBlockError {
    #[error("block does not fit within the negotiated buffer sizes")]
    Overflow,
    #[error(transparent)]
    Address(#[from] AddressOverflow),
}

/// Encodes a read-memory request: `(address, length)` per block. Tracks the
/// size of the response the device will have to produce so batches respect
/// whichever of the two buffer bounds is tighter.
#[derive(Debug)]
pub struct HeaderStreamEncoder {
    address_size: AddressSize,
    max_request: usize,
    max_response: usize,
    data: Vec<u8>,
    projected_response: usize,
    overflow: bool,
    count: usize,
}

impl HeaderStreamEncoder {
    pub fn new(address_size: AddressSize, max_request: usize, max_response: usize) -> Self {
        HeaderStreamEncoder {
            address_size,
            max_request,
            max_response,
            data: Vec::new(),
            projected_response: 0,
            overflow: false,
            count: 0,
        }
    }

    pub fn write(&mut self, address: u64, length: u16) -> Result<(), WriteBlockError> {
        let a = self.address_size.nbytes();
        let request_cost = a + 2;
        let response_cost = a + 2 + length as usize;
        if self.data.len() + request_cost > self.max_request
            || self.projected_response + response_cost > self.max_response
        {
            self.overflow = true;
            return Err(WriteBlockError::Overflow);
        }
        self.address_size.encode(address, &mut self.data)?;
        self.data.extend_from_slice(&length.to_be_bytes());
        self.projected_response += response_cost;
        self.count += 1;
        Ok(())
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn block_count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Encodes a write-memory request: `(address, length, bytes)` per block. The
/// projected response is the per-block `(address, length)` echo.
#[derive(Debug)]
pub struct DataStreamEncoder {
    address_size: AddressSize,
    max_request: usize,
    max_response: usize,
    data: Vec<u8>,
    projected_response: usize,
    overflow: bool,
    count: usize,
}

impl DataStreamEncoder {
    pub fn new(address_size: AddressSize, max_request: usize, max_response: usize) -> Self {
        DataStreamEncoder {
            address_size,
            max_request,
            max_response,
            data: Vec::new(),
            projected_response: 0,
            overflow: false,
            count: 0,
        }
    }

    pub fn write(&mut self, address: u64, block: &[u8]) -> Result<(), WriteBlockError> {
        let a = self.address_size.nbytes();
        let request_cost = a + 2 + block.len();
        let response_cost = a + 2;
        if self.data.len() + request_cost > self.max_request
            || self.projected_response + response_cost > self.max_response
        {
            self.overflow = true;
            return Err(WriteBlockError::Overflow);
        }
        self.address_size.encode(address, &mut self.data)?;
        self.data
            .extend_from_slice(&(block.len() as u16).to_be_bytes());
        self.data.extend_from_slice(block);
        self.projected_response += response_cost;
        self.count += 1;
        Ok(())
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn block_count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Parses a header stream. Also computes the response size the blocks ask
/// for, which the device-side mirror checks against its TX buffer.
#[derive(Debug)]
pub struct HeaderStreamParser<'a> {
    rest: &'a [u8],
    address_size: AddressSize,
    invalid: bool,
    required_response: usize,
}

impl<'a> HeaderStreamParser<'a> {
    pub fn new(data: &'a [u8], address_size: AddressSize) -> Self {
        HeaderStreamParser {
            rest: data,
            address_size,
            invalid: false,
            required_response: 0,
        }
    }

    pub fn next(&mut self) -> Option<BlockHeader> {
        if self.invalid || !self.rest.has_remaining() {
            return None;
        }
        let a = self.address_size.nbytes();
        if self.rest.remaining() < a + 2 {
            self.invalid = true;
            return None;
        }
        let address = self.address_size.decode(&self.rest[..a]);
        self.rest.advance(a);
        let length = self.rest.get_u16();
        self.required_response += a + 2 + length as usize;
        Some(BlockHeader { address, length })
    }

    pub fn finished(&self) -> bool {
        !self.invalid && !self.rest.has_remaining()
    }

    pub fn invalid(&self) -> bool {
        self.invalid
    }

    /// Response data size the parsed blocks require, valid once finished.
    pub fn required_response_size(&self) -> usize {
        self.required_response
    }
}

#[derive(Debug)]
pub struct DataStreamParser<'a> {
    rest: &'a [u8],
    address_size: AddressSize,
    invalid: bool,
}

impl<'a> DataStreamParser<'a> {
    pub fn new(data: &'a [u8], address_size: AddressSize) -> Self {
        DataStreamParser {
            rest: data,
            address_size,
            invalid: false,
        }
    }

    pub fn next(&mut self) -> Option<DataBlock> {
        if self.invalid || !self.rest.has_remaining() {
            return None;
        }
        let a = self.address_size.nbytes();
        if self.rest.remaining() < a + 2 {
            self.invalid = true;
            return None;
        }
        let address = self.address_size.decode(&self.rest[..a]);
        self.rest.advance(a);
        let length = self.rest.get_u16() as usize;
        if self.rest.remaining() < length {
            self.invalid = true;
            return None;
        }
        let data = self.rest[..length].to_vec();
        self.rest.advance(length);
        Some(DataBlock { address, data })
    }

    pub fn finished(&self) -> bool {
        !self.invalid && !self.rest.has_remaining()
    }

    pub fn invalid(&self) -> bool {
        self.invalid
    }
}

/// Encodes an RPV read request: one 16-bit id per block. The projected
/// response carries each id followed by its typed value.
#[derive(Debug)]
pub struct RpvIdStreamEncoder {
    max_request: usize,
    max_response: usize,
    data: Vec<u8>,
    projected_response: usize,
    overflow: bool,
    count: usize,
}

impl RpvIdStreamEncoder {
    pub fn new(max_request: usize, max_response: usize) -> Self {
        RpvIdStreamEncoder {
            max_request,
            max_response,
            data: Vec::new(),
            projected_response: 0,
            overflow: false,
            count: 0,
        }
    }

    pub fn write(&mut self, id: u16, value_size: usize) -> Result<(), WriteBlockError> {
        if self.data.len() + 2 > self.max_request
            || self.projected_response + 2 + value_size > self.max_response
        {
            self.overflow = true;
            return Err(WriteBlockError::Overflow);
        }
        self.data.extend_from_slice(&id.to_be_bytes());
        self.projected_response += 2 + value_size;
        self.count += 1;
        Ok(())
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn block_count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Encodes an RPV write request: `(id, bytes)` per block, the value width
/// fixed by the RPV's declared type. The response echoes one id per block.
#[derive(Debug)]
pub struct RpvDataStreamEncoder {
    max_request: usize,
    max_response: usize,
    data: Vec<u8>,
    projected_response: usize,
    overflow: bool,
    count: usize,
}

impl RpvDataStreamEncoder {
    pub fn new(max_request: usize, max_response: usize) -> Self {
        RpvDataStreamEncoder {
            max_request,
            max_response,
            data: Vec::new(),
            projected_response: 0,
            overflow: false,
            count: 0,
        }
    }

    pub fn write(&mut self, id: u16, value: &[u8]) -> Result<(), WriteBlockError> {
        if self.data.len() + 2 + value.len() > self.max_request
            || self.projected_response + 2 > self.max_response
        {
            self.overflow = true;
            return Err(WriteBlockError::Overflow);
        }
        self.data.extend_from_slice(&id.to_be_bytes());
        self.data.extend_from_slice(value);
        self.projected_response += 2;
        self.count += 1;
        Ok(())
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpvValueBlock {
    pub id: u16,
    pub data: Vec<u8>,
}

/// Parses an RPV read response. Value widths are not self-describing, so the
/// caller resolves each id to its declared size; an unknown id invalidates
/// the stream.
#[derive(Debug)]
pub struct RpvDataStreamParser<'a> {
    rest: &'a [u8],
    invalid: bool,
}

impl<'a> RpvDataStreamParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        RpvDataStreamParser {
            rest: data,
            invalid: false,
        }
    }

    pub fn next<F>(&mut self, size_of: F) -> Option<RpvValueBlock>
    where
        F: Fn(u16) -> Option<usize>,
    {
        if self.invalid || !self.rest.has_remaining() {
            return None;
        }
        if self.rest.remaining() < 2 {
            self.invalid = true;
            return None;
        }
        let id = self.rest.get_u16();
        let Some(size) = size_of(id) else {
            self.invalid = true;
            return None;
        };
        if self.rest.remaining() < size {
            self.invalid = true;
            return None;
        }
        let data = self.rest[..size].to_vec();
        self.rest.advance(size);
        Some(RpvValueBlock { id, data })
    }

    pub fn finished(&self) -> bool {
        !self.invalid && !self.rest.has_remaining()
    }

    pub fn invalid(&self) -> bool {
        self.invalid
    }
}

/// Parses an RPV write response: one echoed id per written value.
#[derive(Debug)]
pub struct RpvIdStreamParser<'a> {
    rest: &'a [u8],
    invalid: bool,
}

impl<'a> RpvIdStreamParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        RpvIdStreamParser {
            rest: data,
            invalid: false,
        }
    }

    pub fn next(&mut self) -> Option<u16> {
        if self.invalid || !self.rest.has_remaining() {
            return None;
        }
        if self.rest.remaining() < 2 {
            self.invalid = true;
            return None;
        }
        Some(self.rest.get_u16())
    }

    pub fn finished(&self) -> bool {
        !self.invalid && !self.rest.has_remaining()
    }

    pub fn invalid(&self) -> bool {
        self.invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_two_blocks() {
        let mut enc = HeaderStreamEncoder::new(AddressSize::B32, 256, 256);
        enc.write(0x1000, 3).unwrap();
        enc.write(0x2000, 2).unwrap();
        assert_eq!(enc.block_count(), 2);
        assert_eq!(
            enc.into_data(),
            vec![0x00, 0x00, 0x10, 0x00, 0x00, 0x03, 0x00, 0x00, 0x20, 0x00, 0x00, 0x02]
        );
    }

    #[test]
    fn test_read_response_two_blocks() {
        let data = vec![
            0x00, 0x00, 0x10, 0x00, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x20, 0x00, 0x00,
            0x02, 0xDD, 0xEE,
        ];
        let mut parser = DataStreamParser::new(&data, AddressSize::B32);
        let first = parser.next().unwrap();
        assert_eq!(first.address, 0x1000);
        assert_eq!(first.data, vec![0xAA, 0xBB, 0xCC]);
        let second = parser.next().unwrap();
        assert_eq!(second.address, 0x2000);
        assert_eq!(second.data, vec![0xDD, 0xEE]);
        assert!(parser.next().is_none());
        assert!(parser.finished());
        assert!(!parser.invalid());
    }

    #[test]
    fn test_truncated_response_is_invalid_not_finished() {
        let data = vec![0x00, 0x00, 0x10, 0x00, 0x00, 0x03, 0xAA];
        let mut parser = DataStreamParser::new(&data, AddressSize::B32);
        assert!(parser.next().is_none());
        assert!(parser.invalid());
        assert!(!parser.finished());
    }

    #[test]
    fn test_encoder_truncates_on_overflow() {
        // request budget fits exactly two 4-byte-address headers
        let mut enc = HeaderStreamEncoder::new(AddressSize::B32, 12, 1024);
        enc.write(0x1000, 1).unwrap();
        enc.write(0x2000, 1).unwrap();
        assert_eq!(enc.write(0x3000, 1), Err(WriteBlockError::Overflow));
        assert!(enc.overflow());
        assert_eq!(enc.block_count(), 2);
    }

    #[test]
    fn test_encoder_respects_response_budget() {
        // device TX buffer of 64 bytes cannot carry a 1000-byte block
        let mut enc = HeaderStreamEncoder::new(AddressSize::B32, 1024, 64);
        assert_eq!(enc.write(0x1000, 1000), Err(WriteBlockError::Overflow));
        assert!(enc.overflow());
        assert!(enc.is_empty());
        // but a small block still fits
        let mut enc = HeaderStreamEncoder::new(AddressSize::B32, 1024, 64);
        enc.write(0x1000, 32).unwrap();
        assert_eq!(enc.block_count(), 1);
    }

    #[test]
    fn test_write_request_roundtrip() {
        let mut enc = DataStreamEncoder::new(AddressSize::B16, 256, 256);
        enc.write(0xBEEF, &[0x01, 0x02]).unwrap();
        let data = enc.into_data();
        assert_eq!(data, vec![0xBE, 0xEF, 0x00, 0x02, 0x01, 0x02]);

        let mut parser = DataStreamParser::new(&data, AddressSize::B16);
        let block = parser.next().unwrap();
        assert_eq!(block.address, 0xBEEF);
        assert_eq!(block.data, vec![0x01, 0x02]);
        assert!(parser.finished());
    }

    #[test]
    fn test_header_parser_required_response_size() {
        let data = vec![0x00, 0x00, 0x10, 0x00, 0x00, 0x03, 0x00, 0x00, 0x20, 0x00, 0x00, 0x02];
        let mut parser = HeaderStreamParser::new(&data, AddressSize::B32);
        while parser.next().is_some() {}
        assert!(parser.finished());
        // (4 + 2 + 3) + (4 + 2 + 2)
        assert_eq!(parser.required_response_size(), 17);
    }

    #[test]
    fn test_rpv_streams() {
        let mut enc = RpvIdStreamEncoder::new(64, 64);
        enc.write(0x1234, 4).unwrap();
        enc.write(0x0001, 2).unwrap();
        assert_eq!(enc.into_data(), vec![0x12, 0x34, 0x00, 0x01]);

        let data = vec![0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x00, 0x05];
        let size_of = |id: u16| match id {
            0x1234 => Some(4),
            0x0001 => Some(2),
            _ => None,
        };
        let mut parser = RpvDataStreamParser::new(&data);
        assert_eq!(
            parser.next(size_of).unwrap(),
            RpvValueBlock {
                id: 0x1234,
                data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            }
        );
        assert_eq!(
            parser.next(size_of).unwrap(),
            RpvValueBlock {
                id: 0x0001,
                data: vec![0x00, 0x05],
            }
        );
        assert!(parser.finished());
    }

    #[test]
    fn test_rpv_unknown_id_invalidates() {
        let data = vec![0xFF, 0xFF, 0x00];
        let mut parser = RpvDataStreamParser::new(&data);
        assert!(parser.next(|_| None).is_none());
        assert!(parser.invalid());
    }
}
