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

//! # The on-flash node codec
//!
//! Everything on a UBIFS volume is a node: an 8-byte-aligned record
//! opening with a 24-byte common header (magic, CRC-32 over bytes
//! 8..len, 64-bit sequence number, length, node type, group type).
//! This module owns the byte-exact layouts: the constants, the common
//! header, the key format ([`key`]), the typed node decode/encode and
//! the per-type validators ([`node`]).

pub mod checksum;
pub mod key;
pub mod node;
#[cfg(test)]
mod tests;

pub use {
    key::{Key, KeyType, MAX_KEY_LEN, SIMPLE_KEY_LEN},
    node::Node,
};

use {
    crate::{
        engine::error::{ParseError, RuntimeResult},
        util::compiler::TaggedEnum,
    },
    core::fmt,
};

/*
    constants: identification
*/

consts! {
    /// Magic of every node, in host order (little-endian on the wire)
    pub NODE_MAGIC: u32 = 0x06101831;
    /// Byte filling flash that was erased and never written
    pub ERASED_BYTE: u8 = 0xFF;
    /// Byte used for write-unit padding gaps too small for a padding node
    pub PADDING_BYTE: u8 = 0xCE;
    /// Format version this code writes
    pub FMT_VERSION: u32 = 5;
    /// Oldest write-compatible format version
    pub RO_COMPAT_VERSION: u32 = 0;
}

/*
    constants: fixed volume layout
*/

consts! {
    /// First superblock LEB
    pub SB_LNUM: u32 = 0;
    /// LEBs reserved for the superblock
    pub SB_LEBS: u32 = 2;
    /// First master LEB
    pub MST_LNUM: u32 = 2;
    /// LEBs reserved for the master node
    pub MST_LEBS: u32 = 2;
    /// First log LEB; the log region follows the master region
    pub LOG_LNUM: u32 = 4;
    /// Smallest volume this format supports
    pub MIN_LEB_CNT: u32 = 17;
    /// Smallest LEB this format supports
    pub MIN_LEB_SZ: u32 = 15 * 1024;
    /// Smallest min-I/O unit worth supporting
    pub MIN_IO_SZ: u32 = 8;
    /// Minimal number of log LEBs
    pub MIN_LOG_LEBS: u32 = 2;
    /// Minimal number of LPT LEBs (node LEB plus ltab LEB)
    pub MIN_LPT_LEBS: u32 = 2;
    /// Minimal number of orphan LEBs
    pub MIN_ORPH_LEBS: u32 = 1;
    /// The root directory inode
    pub ROOT_INO: u32 = 1;
    /// First inode number available to user files
    pub FIRST_INO: u32 = 64;
}

/*
    constants: node sizes and limits
*/

consts! {
    /// Size of the common node header
    pub COMMON_HDR_SZ: usize = 24;
    pub PAD_NODE_SZ: usize = 28;
    pub SB_NODE_SZ: usize = 4096;
    pub MST_NODE_SZ: usize = 512;
    pub REF_NODE_SZ: usize = 64;
    pub INO_NODE_SZ: usize = 160;
    pub DENT_NODE_SZ: usize = 56;
    pub DATA_NODE_SZ: usize = 48;
    pub TRUN_NODE_SZ: usize = 56;
    pub IDX_NODE_SZ: usize = 28;
    pub CS_NODE_SZ: usize = 32;
    pub ORPH_NODE_SZ: usize = 32;
    pub AUTH_NODE_SZ: usize = 24;
    pub SIG_NODE_SZ: usize = 32;
    /// A data block; data nodes never carry more than this, uncompressed
    pub BLOCK_SIZE: u32 = 4096;
    pub BLOCK_SHIFT: u32 = 12;
    /// Longest name of a directory entry or extended attribute
    pub MAX_NLEN: usize = 255;
    /// Largest inline payload of an inode (symlink target, device spec)
    pub MAX_INO_DATA: usize = 4096;
    pub MAX_INO_NODE_SZ: usize = INO_NODE_SZ + MAX_INO_DATA;
    pub MAX_DENT_NODE_SZ: usize = DENT_NODE_SZ + MAX_NLEN + 1;
    pub MAX_DATA_NODE_SZ: usize = DATA_NODE_SZ + BLOCK_SIZE as usize;
    /// No node is ever larger than a max-size inode node
    pub MAX_NODE_SZ: usize = MAX_INO_NODE_SZ;
    /// Bytes of one index branch in the simple key format
    pub BRANCH_SZ: usize = 12 + SIMPLE_KEY_LEN;
    pub MAX_HMAC_LEN: usize = 64;
    pub MAX_HASH_LEN: usize = 64;
    /// Default index fanout written by the formatter
    pub DEFAULT_FANOUT: u32 = 8;
    /// Journal head count: garbage collection, base and data heads
    pub JHEAD_CNT: u32 = 3;
    pub GC_HEAD: u32 = 0;
    pub BASE_HEAD: u32 = 1;
    pub DATA_HEAD: u32 = 2;
}

/// Unaligned size of an index node holding `child_cnt` branches
pub const fn idx_node_sz(child_cnt: usize) -> usize {
    IDX_NODE_SZ + child_cnt * BRANCH_SZ
}

/*
    constants: inode modes and flags
*/

consts! {
    pub S_IFMT: u32 = 0o170000;
    pub S_IFSOCK: u32 = 0o140000;
    pub S_IFLNK: u32 = 0o120000;
    pub S_IFREG: u32 = 0o100000;
    pub S_IFBLK: u32 = 0o060000;
    pub S_IFDIR: u32 = 0o040000;
    pub S_IFCHR: u32 = 0o020000;
    pub S_IFIFO: u32 = 0o010000;
    // inode flags
    pub INO_FL_COMPR: u32 = 0x01;
    pub INO_FL_SYNC: u32 = 0x02;
    pub INO_FL_IMMUTABLE: u32 = 0x04;
    pub INO_FL_APPEND: u32 = 0x08;
    pub INO_FL_DIRSYNC: u32 = 0x10;
    pub INO_FL_XATTR: u32 = 0x20;
    pub INO_FL_CRYPT: u32 = 0x40;
    // superblock flags
    pub SB_FL_BIGLPT: u32 = 0x02;
    pub SB_FL_SPACE_FIXUP: u32 = 0x04;
    pub SB_FL_DOUBLE_HASH: u32 = 0x08;
    pub SB_FL_ENCRYPTION: u32 = 0x10;
    pub SB_FL_AUTHENTICATION: u32 = 0x20;
    // master flags
    pub MST_FL_DIRTY: u32 = 0x01;
    pub MST_FL_NO_ORPHS: u32 = 0x02;
    pub MST_FL_RCVRY: u32 = 0x04;
}

/*
    node and group types
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Ino = 0,
    Data = 1,
    Dent = 2,
    Xent = 3,
    Trun = 4,
    Pad = 5,
    Sb = 6,
    Mst = 7,
    Ref = 8,
    Idx = 9,
    Cs = 10,
    Orph = 11,
    Auth = 12,
    Sig = 13,
}

tagged_enum_u8! { NodeType => Sig: 14 }

impl NodeType {
    /// True for the node types the index references as leaves
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Ino | Self::Data | Self::Dent | Self::Xent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupType {
    None = 0,
    InGroup = 1,
    LastOfGroup = 2,
}

tagged_enum_u8! { GroupType => LastOfGroup: 3 }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The decoded common header of a node
pub struct CommonHdr {
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: NodeType,
    pub group_type: GroupType,
}

/*
    common header codec
    ---
    +-----------+------------+------------+---------+---------+---------+--------+
    | 4B: magic | 4B: crc32  |  8B: sqnum | 4B: len | 1B: typ | 1B: grp | 2B: 0  |
    +-----------+------------+------------+---------+---------+---------+--------+
*/

use std::ops::Range;

impl CommonHdr {
    pub const OFFSET_0_MAGIC: Range<usize> = 0..sizeof!(u32);
    pub const OFFSET_1_CRC: Range<usize> = 4..4 + sizeof!(u32);
    pub const OFFSET_2_SQNUM: Range<usize> = 8..8 + sizeof!(u64);
    pub const OFFSET_3_LEN: Range<usize> = 16..16 + sizeof!(u32);
    pub const OFFSET_4_TYPE: usize = 20;
    pub const OFFSET_5_GROUP: usize = 21;
    /// Decode and fully verify a common header against the containing
    /// buffer: magic, length bounds, CRC over bytes 8..len
    pub fn decode_and_verify(buf: &[u8]) -> Result<Self, ParseError> {
        let hdr = Self::decode_quiet(buf)?;
        let crc = checksum::crc32(&buf[Self::OFFSET_2_SQNUM.start..hdr.len as usize]);
        if crc != hdr.crc {
            return Err(ParseError::BadCrc);
        }
        Ok(hdr)
    }
    /// Decode with structural checks only; the CRC field is read but not
    /// verified. Used when probing for a node at all.
    pub fn decode_quiet(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < COMMON_HDR_SZ {
            return Err(ParseError::ShortRead);
        }
        let word = |r: Range<usize>| u32::from_le_bytes(buf[r].try_into().unwrap());
        if word(Self::OFFSET_0_MAGIC) != NODE_MAGIC {
            return Err(ParseError::BadMagic);
        }
        let len = word(Self::OFFSET_3_LEN);
        if (len as usize) < COMMON_HDR_SZ || len as usize > MAX_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        if len as usize > buf.len() {
            return Err(ParseError::ShortRead);
        }
        let node_type =
            NodeType::try_from_raw(buf[Self::OFFSET_4_TYPE]).ok_or(ParseError::BadNodeType)?;
        let group_type =
            GroupType::try_from_raw(buf[Self::OFFSET_5_GROUP]).ok_or(ParseError::BadGroupType)?;
        Ok(Self {
            crc: word(Self::OFFSET_1_CRC),
            sqnum: u64::from_le_bytes(buf[Self::OFFSET_2_SQNUM].try_into().unwrap()),
            len,
            node_type,
            group_type,
        })
    }
}

/// Stamp the common header onto an assembled node buffer and seal it:
/// `buf` must hold the complete node, the length field becomes
/// `buf.len()` and the CRC is computed over bytes 8..len
pub fn seal_node(buf: &mut [u8], node_type: NodeType, group_type: GroupType, sqnum: u64) {
    debug_assert!(buf.len() >= COMMON_HDR_SZ);
    buf[CommonHdr::OFFSET_0_MAGIC].copy_from_slice(&NODE_MAGIC.to_le_bytes());
    buf[CommonHdr::OFFSET_2_SQNUM].copy_from_slice(&sqnum.to_le_bytes());
    let buf_len = buf.len() as u32;
    buf[CommonHdr::OFFSET_3_LEN].copy_from_slice(&buf_len.to_le_bytes());
    buf[CommonHdr::OFFSET_4_TYPE] = node_type.dscr();
    buf[CommonHdr::OFFSET_5_GROUP] = group_type.dscr();
    buf[22] = 0;
    buf[23] = 0;
    let crc = checksum::crc32(&buf[CommonHdr::OFFSET_2_SQNUM.start..]);
    buf[CommonHdr::OFFSET_1_CRC].copy_from_slice(&crc.to_le_bytes());
}

/// Parse the node at the start of `buf` into its typed representation.
/// `lnum`/`offs` only season the error context.
pub fn parse_node(buf: &[u8], lnum: u32, offs: u32) -> RuntimeResult<Node> {
    node::parse(buf, lnum, offs)
}

/*
    write-unit padding
*/

/// Fill `buf` the way a journal head pads towards a min-I/O boundary:
/// a padding node when the gap fits one, raw padding bytes otherwise
pub fn pad_buf(buf: &mut [u8], sqnum: u64) {
    if buf.len() >= PAD_NODE_SZ {
        let pad_len = (buf.len() - PAD_NODE_SZ) as u32;
        buf.fill(0);
        buf[COMMON_HDR_SZ..PAD_NODE_SZ].copy_from_slice(&pad_len.to_le_bytes());
        let (node, tail) = buf.split_at_mut(PAD_NODE_SZ);
        seal_node(node, NodeType::Pad, GroupType::None, sqnum);
        tail.fill(PADDING_BYTE);
    } else {
        buf.fill(PADDING_BYTE);
    }
}

/*
    field cursors
    ---
    Tiny byte cursors for the node bodies; fixed-offset Range constants
    are used for the small headers, these for the longer layouts.
*/

pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    pub fn skip(&mut self, n: usize) -> &mut Self {
        self.pos += n;
        self
    }
    pub fn pos(&self) -> usize {
        self.pos
    }
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
    pub fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }
    pub fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }
    pub fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }
    pub fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        v
    }
    pub fn bytes(&mut self, n: usize) -> &'a [u8] {
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        v
    }
    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N));
        out
    }
}

pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    /// Start a node body writer with the common header zeroed out; the
    /// header is stamped by [`seal_node`] once the body is complete
    pub fn for_node() -> Self {
        Self {
            buf: vec![0u8; COMMON_HDR_SZ],
        }
    }
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }
    pub fn zeroes(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }
    pub fn key(&mut self, k: &Key) -> &mut Self {
        let mut padded = [0u8; MAX_KEY_LEN];
        k.write_padded(&mut padded);
        self.bytes(&padded)
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    /// Seal with the common header and hand out the finished node bytes
    pub fn seal(mut self, node_type: NodeType, group_type: GroupType, sqnum: u64) -> Vec<u8> {
        seal_node(&mut self.buf, node_type, group_type, sqnum);
        self.buf
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ino => "inode node",
            Self::Data => "data node",
            Self::Dent => "directory entry node",
            Self::Xent => "extended attribute entry node",
            Self::Trun => "truncation node",
            Self::Pad => "padding node",
            Self::Sb => "superblock node",
            Self::Mst => "master node",
            Self::Ref => "reference node",
            Self::Idx => "index node",
            Self::Cs => "commit start node",
            Self::Orph => "orphan node",
            Self::Auth => "authentication node",
            Self::Sig => "signature node",
        })
    }
}

assertions! {
    COMMON_HDR_SZ == 24,
    BRANCH_SZ == 20,
    IDX_NODE_SZ + DEFAULT_FANOUT as usize * BRANCH_SZ == 188,
}
