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

//! # Index keys
//!
//! The simple key format packs two little-endian 32-bit words: the inode
//! number, then a 3-bit key type over a 29-bit argument (zero, an R5 name
//! hash, or a data block number). Keys order lexicographically over
//! (inum, type, argument); equal dentry keys are disambiguated by the
//! full name, which the key alone cannot carry.

use {crate::util::compiler::TaggedEnum, core::fmt};

/// Bits available to the key argument
pub const KEY_ARG_BITS: u32 = 29;
/// Mask for the 29-bit hash/block argument
pub const KEY_ARG_MASK: u32 = (1 << KEY_ARG_BITS) - 1;
/// Bytes of a simple-format key on the wire
pub const SIMPLE_KEY_LEN: usize = 8;
/// Bytes reserved for a key inside node layouts
pub const MAX_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyType {
    Ino = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
}

tagged_enum_u8! { KeyType => Xent: 4 }

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// An index key. Field order carries the comparison order.
pub struct Key {
    inum: u32,
    knd: KeyType,
    arg: u32,
}

impl Key {
    pub const fn min() -> Self {
        Self {
            inum: 0,
            knd: KeyType::Ino,
            arg: 0,
        }
    }
    pub const fn max() -> Self {
        Self {
            inum: u32::MAX,
            knd: KeyType::Xent,
            arg: KEY_ARG_MASK,
        }
    }
    pub const fn ino(inum: u32) -> Self {
        Self {
            inum,
            knd: KeyType::Ino,
            arg: 0,
        }
    }
    pub const fn data(inum: u32, block: u32) -> Self {
        Self {
            inum,
            knd: KeyType::Data,
            arg: block & KEY_ARG_MASK,
        }
    }
    pub fn dent(inum: u32, name: &[u8]) -> Self {
        Self {
            inum,
            knd: KeyType::Dent,
            arg: r5_hash(name),
        }
    }
    pub fn xent(inum: u32, name: &[u8]) -> Self {
        Self {
            inum,
            knd: KeyType::Xent,
            arg: r5_hash(name),
        }
    }
    pub const fn dent_hash(inum: u32, hash: u32) -> Self {
        Self {
            inum,
            knd: KeyType::Dent,
            arg: hash & KEY_ARG_MASK,
        }
    }
    /// The largest key of the given inode and key type
    pub const fn last_of(inum: u32, knd: KeyType) -> Self {
        Self {
            inum,
            knd,
            arg: KEY_ARG_MASK,
        }
    }
    /// Smallest and largest possible key of the given inode, for range
    /// removal of everything the inode owns
    pub const fn ino_range(inum: u32) -> (Self, Self) {
        (
            Self::ino(inum),
            Self {
                inum,
                knd: KeyType::Xent,
                arg: KEY_ARG_MASK,
            },
        )
    }
    pub const fn inum(&self) -> u32 {
        self.inum
    }
    pub const fn knd(&self) -> KeyType {
        self.knd
    }
    /// The 29-bit argument: zero, a name hash, or a data block number
    pub const fn arg(&self) -> u32 {
        self.arg
    }
    pub fn from_wire(raw: [u8; SIMPLE_KEY_LEN]) -> Option<Self> {
        let inum = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let word = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let knd = KeyType::try_from_raw((word >> KEY_ARG_BITS) as u8)?;
        Some(Self {
            inum,
            knd,
            arg: word & KEY_ARG_MASK,
        })
    }
    pub fn to_wire(&self) -> [u8; SIMPLE_KEY_LEN] {
        let mut raw = [0u8; SIMPLE_KEY_LEN];
        raw[0..4].copy_from_slice(&self.inum.to_le_bytes());
        let word = ((self.knd as u32) << KEY_ARG_BITS) | self.arg;
        raw[4..8].copy_from_slice(&word.to_le_bytes());
        raw
    }
    /// Write the key into a zero-padded 16-byte node field
    pub fn write_padded(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= MAX_KEY_LEN);
        out[..MAX_KEY_LEN].fill(0);
        out[..SIMPLE_KEY_LEN].copy_from_slice(&self.to_wire());
    }
    /// Read a key out of a 16-byte node field (trailing bytes ignored)
    pub fn from_padded(raw: &[u8]) -> Option<Self> {
        let mut k = [0u8; SIMPLE_KEY_LEN];
        k.copy_from_slice(&raw[..SIMPLE_KEY_LEN]);
        Self::from_wire(k)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?}, {})", self.inum, self.knd, self.arg)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The R5 name hash, masked to the key argument width. The byte values
/// are treated as signed, as the on-flash format demands.
pub fn r5_hash(name: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for &b in name {
        let c = b as i8 as i32;
        a = a.wrapping_add((c << 4) as u32);
        a = a.wrapping_add((c >> 4) as u32);
        a = a.wrapping_mul(11);
    }
    mask_hash(a)
}

/// Argument values 0..=2 are reserved (0 marks "no argument"), so masked
/// hashes landing there are bumped past the reserved range
const fn mask_hash(hash: u32) -> u32 {
    let hash = hash & KEY_ARG_MASK;
    if hash <= 2 {
        hash + 3
    } else {
        hash
    }
}
