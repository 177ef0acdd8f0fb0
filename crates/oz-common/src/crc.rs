// crc.rs: Asset checksums (CRC-16/CCITT-FALSE).
//
// Loaded BSP models and terrains carry the checksum of their raw bytes so a
// save file can tell whether it was written against the same assets.

use crc::{Crc, CRC_16_IBM_3740};

static CRC_CALC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum of a complete asset image.
pub fn asset_checksum(data: &[u8]) -> u16 {
    CRC_CALC.checksum(data)
}
