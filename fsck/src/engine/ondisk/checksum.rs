/*
 * Created on Sat Mar 02 2024
 *
 * This file is a part of Ubifsck
 * Ubifsck is a free and open-source offline checker and repair tool for
 * UBIFS volumes written by Sayan Nandan ("the Author") with the vision
 * to provide a dependable way to bring a damaged flash filesystem back
 * to a consistent, mountable state without compromising on the
 * integrity of surviving data.
 *
 * Copyright (c) 2024, Sayan Nandan <nandansayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Checksum utils
//!
//! Two checksums appear on flash: every node carries a CRC-32 over its
//! bytes past the CRC field (polynomial 0xEDB88320 reflected, init and
//! final xor 0xFFFFFFFF), and bit-packed LPT nodes open with a CRC-16
//! (polynomial 0xA001 reflected, init 0xFFFF, no final xor).

use {
    crc::{Crc, Digest, CRC_16_MODBUS, CRC_32_ISO_HDLC},
    std::fmt,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// One-shot node CRC-32
pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// One-shot LPT CRC-16
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

#[derive(Clone)]
/// Streaming CRC-32 for multi-slice node assembly
pub struct NodeCrc32 {
    digest: Digest<'static, u32>,
}

impl Default for NodeCrc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeCrc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCrc32")
            .field("digest", &self.digest.clone().finalize())
            .finish()
    }
}

impl NodeCrc32 {
    pub const fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }
    pub fn update(&mut self, b: &[u8]) {
        self.digest.update(b)
    }
    pub fn finish(self) -> u32 {
        self.digest.finalize()
    }
}
