//! Frame checksum. Every Scrutiny frame ends with a 4-byte CRC covering all
//! preceding bytes of the frame, big-endian on the wire.

use crc::{CRC_32_ISO_HDLC, Crc};

pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC_32.checksum(data)
}

/// CRC over several non-contiguous slices, equivalent to checksumming their
/// concatenation. Frames are checksummed as header-then-data without copying.
pub fn crc32_chunks(chunks: &[&[u8]]) -> u32 {
    let mut digest = CRC_32.digest();
    for chunk in chunks {
        digest.update(chunk);
    }
    digest.finalize()
}
