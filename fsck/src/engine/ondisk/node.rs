/*
 * Created on Sun Mar 03 2024
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

//! Typed nodes: per-type layouts, decode, validation and the encode
//! paths the repairer and the tests need. Decoding is strict: a node
//! that decodes also validates, anything else comes back as a
//! [`ParseError`] seasoned with its location.

use {
    super::{
        key::{r5_hash, Key, KeyType},
        CommonHdr, FieldReader, FieldWriter, GroupType, NodeType, AUTH_NODE_SZ, BLOCK_SIZE,
        COMMON_HDR_SZ, CS_NODE_SZ, DATA_NODE_SZ, DENT_NODE_SZ, IDX_NODE_SZ, INO_NODE_SZ,
        MAX_HASH_LEN, MAX_HMAC_LEN, MAX_INO_DATA, MAX_KEY_LEN, MAX_NLEN, MIN_IO_SZ, MIN_LEB_CNT,
        MIN_LEB_SZ, MIN_LOG_LEBS, MIN_LPT_LEBS, MIN_ORPH_LEBS, MST_NODE_SZ, ORPH_NODE_SZ,
        PAD_NODE_SZ, REF_NODE_SZ, SB_NODE_SZ, SIG_NODE_SZ, TRUN_NODE_SZ,
    },
    crate::{
        engine::error::{Error, ParseError, RuntimeResult},
        util::compiler::TaggedEnum,
    },
    core::fmt,
};

/*
    compression types
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ComprType {
    None = 0,
    Lzo = 1,
    Zlib = 2,
    Zstd = 3,
}

impl ComprType {
    fn try_from_raw(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Lzo,
            2 => Self::Zlib,
            3 => Self::Zstd,
            _ => return None,
        })
    }
}

/*
    directory entry types
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DentType {
    Reg = 0,
    Dir = 1,
    Lnk = 2,
    Blk = 3,
    Chr = 4,
    Fifo = 5,
    Sock = 6,
}

tagged_enum_u8! { DentType => Sock: 7 }

impl DentType {
    /// The entry type an inode of the given mode must be referenced by
    pub const fn from_mode(mode: u32) -> Option<Self> {
        Some(match mode & super::S_IFMT {
            super::S_IFREG => Self::Reg,
            super::S_IFDIR => Self::Dir,
            super::S_IFLNK => Self::Lnk,
            super::S_IFBLK => Self::Blk,
            super::S_IFCHR => Self::Chr,
            super::S_IFIFO => Self::Fifo,
            super::S_IFSOCK => Self::Sock,
            _ => return None,
        })
    }
}

impl CommonHdr {
    /// A header for a node this tool is about to write; length and CRC
    /// are filled in at seal time
    pub const fn synth(node_type: NodeType, sqnum: u64) -> Self {
        Self {
            crc: 0,
            sqnum,
            len: 0,
            node_type,
            group_type: GroupType::None,
        }
    }
    pub const fn with_group(mut self, group_type: GroupType) -> Self {
        self.group_type = group_type;
        self
    }
}

/*
    the node sum type
*/

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Pad(PadNode),
    Sb(SbNode),
    Mst(MstNode),
    Ref(RefNode),
    Ino(InoNode),
    Dent(DentNode),
    Data(DataNode),
    Trun(TrunNode),
    Idx(IdxNode),
    Cs(CsNode),
    Orph(OrphNode),
    Auth(AuthNode),
    Sig(SigNode),
}

impl Node {
    pub fn ch(&self) -> &CommonHdr {
        match self {
            Self::Pad(n) => &n.ch,
            Self::Sb(n) => &n.ch,
            Self::Mst(n) => &n.ch,
            Self::Ref(n) => &n.ch,
            Self::Ino(n) => &n.ch,
            Self::Dent(n) => &n.ch,
            Self::Data(n) => &n.ch,
            Self::Trun(n) => &n.ch,
            Self::Idx(n) => &n.ch,
            Self::Cs(n) => &n.ch,
            Self::Orph(n) => &n.ch,
            Self::Auth(n) => &n.ch,
            Self::Sig(n) => &n.ch,
        }
    }
    pub fn node_type(&self) -> NodeType {
        self.ch().node_type
    }
    pub fn sqnum(&self) -> u64 {
        self.ch().sqnum
    }
    /// The index key of a leaf node; `None` for the non-leaf types
    pub fn key(&self) -> Option<Key> {
        match self {
            Self::Ino(n) => Some(n.key),
            Self::Dent(n) => Some(n.key),
            Self::Data(n) => Some(n.key),
            _ => None,
        }
    }
}

pub(super) fn parse(buf: &[u8], lnum: u32, offs: u32) -> RuntimeResult<Node> {
    let seasoned = |e: ParseError| Error::from(e).at(lnum, offs);
    let ch = CommonHdr::decode_and_verify(buf).map_err(seasoned)?;
    let body = &buf[..ch.len as usize];
    match ch.node_type {
        NodeType::Pad => PadNode::decode(ch, body).map(Node::Pad),
        NodeType::Sb => SbNode::decode(ch, body).map(Node::Sb),
        NodeType::Mst => MstNode::decode(ch, body).map(Node::Mst),
        NodeType::Ref => RefNode::decode(ch, body).map(Node::Ref),
        NodeType::Ino => InoNode::decode(ch, body).map(Node::Ino),
        NodeType::Dent | NodeType::Xent => DentNode::decode(ch, body).map(Node::Dent),
        NodeType::Data => DataNode::decode(ch, body).map(Node::Data),
        NodeType::Trun => TrunNode::decode(ch, body).map(Node::Trun),
        NodeType::Idx => IdxNode::decode(ch, body).map(Node::Idx),
        NodeType::Cs => CsNode::decode(ch, body).map(Node::Cs),
        NodeType::Orph => OrphNode::decode(ch, body).map(Node::Orph),
        NodeType::Auth => AuthNode::decode(ch, body).map(Node::Auth),
        NodeType::Sig => SigNode::decode(ch, body).map(Node::Sig),
    }
    .map_err(seasoned)
}

/// The node dump: the common header first, then every type's own
/// fields, the way the debug scans print them
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ch = self.ch();
        write!(f, "{} len {} sqnum {}", ch.node_type, ch.len, ch.sqnum)?;
        match self {
            Self::Pad(n) => write!(f, ", pad_len {}", n.pad_len),
            Self::Sb(n) => write!(
                f,
                ", fmt {} (r/o compat {}), {} LEBs of {} (max {}), min I/O {}, \
                 log {} lpt {} orph {}, fanout {}, flags {:#x}",
                n.fmt_version,
                n.ro_compat_version,
                n.leb_cnt,
                n.leb_size,
                n.max_leb_cnt,
                n.min_io_size,
                n.log_lebs,
                n.lpt_lebs,
                n.orph_lebs,
                n.fanout,
                n.flags
            ),
            Self::Mst(n) => write!(
                f,
                ", commit {}, highest inode {}, root {}:{}+{}, log LEB {}, \
                 index size {}, free/dirty/used {}/{}/{}, flags {:#x}",
                n.cmt_no,
                n.highest_inum,
                n.root_lnum,
                n.root_offs,
                n.root_len,
                n.log_lnum,
                n.index_size,
                n.total_free,
                n.total_dirty,
                n.total_used,
                n.flags
            ),
            Self::Ref(n) => write!(f, ", bud {}:{}, head {}", n.lnum, n.offs, n.jhead),
            Self::Ino(n) => write!(
                f,
                ", key {}, size {}, nlink {}, mode {:o}, uid/gid {}/{}, mtime {}, \
                 flags {:#x}, inline data {}, xattrs {} cnt {} bytes {} names",
                n.key,
                n.size,
                n.nlink,
                n.mode,
                n.uid,
                n.gid,
                n.mtime_sec,
                n.flags,
                n.data.len(),
                n.xattr_cnt,
                n.xattr_size,
                n.xattr_names
            ),
            Self::Dent(n) => write!(
                f,
                ", key {}, name \"{}\", inum {}, type {}",
                n.key,
                String::from_utf8_lossy(&n.name),
                n.inum,
                n.dtype
            ),
            Self::Data(n) => write!(
                f,
                ", key {}, size {}, compr {}, {} bytes on flash",
                n.key,
                n.size,
                n.compr_type,
                n.data.len()
            ),
            Self::Trun(n) => write!(
                f,
                ", inum {}, old size {}, new size {}",
                n.inum, n.old_size, n.new_size
            ),
            Self::Idx(n) => {
                write!(f, ", level {}, {} branches", n.level, n.branches.len())?;
                match (n.branches.first(), n.branches.last()) {
                    (Some(first), Some(last)) => {
                        write!(f, ", keys {}..{}", first.key, last.key)
                    }
                    _ => Ok(()),
                }
            }
            Self::Cs(n) => write!(f, ", commit {}", n.cmt_no),
            Self::Orph(n) => write!(
                f,
                ", commit {}{}, {} inodes",
                n.commit_no(),
                if n.is_last() { " (last)" } else { "" },
                n.inos.len()
            ),
            Self::Auth(n) => write!(f, ", hmac {} bytes", n.hmac.len()),
            Self::Sig(n) => write!(f, ", type {}, {} bytes", n.sig_type, n.sig.len()),
        }
    }
}

/*
    padding node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct PadNode {
    pub ch: CommonHdr,
    pub pad_len: u32,
}

impl PadNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if ch.len as usize != PAD_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        Ok(Self {
            ch,
            pad_len: r.u32(),
        })
    }
    /// Bytes the padding covers on flash, node included
    pub fn covered(&self) -> u32 {
        PAD_NODE_SZ as u32 + self.pad_len
    }
}

/*
    superblock node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct SbNode {
    pub ch: CommonHdr,
    pub key_hash: u8,
    pub key_fmt: u8,
    pub flags: u32,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub max_bud_bytes: u64,
    pub log_lebs: u32,
    pub lpt_lebs: u32,
    pub orph_lebs: u32,
    pub jhead_cnt: u32,
    pub fanout: u32,
    pub lsave_cnt: u32,
    pub fmt_version: u32,
    pub default_compr: u16,
    pub rp_uid: u32,
    pub rp_gid: u32,
    pub rp_size: u64,
    pub time_gran: u32,
    pub uuid: [u8; 16],
    pub ro_compat_version: u32,
    pub hmac: [u8; MAX_HMAC_LEN],
    pub hmac_wkm: [u8; MAX_HMAC_LEN],
    pub hash_algo: u16,
    pub hash_mst: [u8; MAX_HASH_LEN],
}

impl SbNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if ch.len as usize != SB_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        r.skip(2);
        let sb = Self {
            ch,
            key_hash: r.u8(),
            key_fmt: r.u8(),
            flags: r.u32(),
            min_io_size: r.u32(),
            leb_size: r.u32(),
            leb_cnt: r.u32(),
            max_leb_cnt: r.u32(),
            max_bud_bytes: r.u64(),
            log_lebs: r.u32(),
            lpt_lebs: r.u32(),
            orph_lebs: r.u32(),
            jhead_cnt: r.u32(),
            fanout: r.u32(),
            lsave_cnt: r.u32(),
            fmt_version: r.u32(),
            default_compr: r.u16(),
            rp_uid: {
                r.skip(2);
                r.u32()
            },
            rp_gid: r.u32(),
            rp_size: r.u64(),
            time_gran: r.u32(),
            uuid: r.array(),
            ro_compat_version: r.u32(),
            hmac: r.array(),
            hmac_wkm: r.array(),
            hash_algo: r.u16(),
            hash_mst: r.array(),
        };
        sb.validate()?;
        Ok(sb)
    }
    fn validate(&self) -> Result<(), ParseError> {
        let geometry_ok = okay! {
            self.min_io_size >= MIN_IO_SZ,
            self.min_io_size.is_power_of_two(),
            self.leb_size >= MIN_LEB_SZ,
            self.leb_size % self.min_io_size == 0,
            self.leb_cnt >= MIN_LEB_CNT,
            self.leb_cnt <= self.max_leb_cnt,
            self.log_lebs >= MIN_LOG_LEBS,
            self.lpt_lebs >= MIN_LPT_LEBS,
            self.orph_lebs >= MIN_ORPH_LEBS,
        };
        // the reserved regions must leave a usable main area behind
        let reserved = super::SB_LEBS + super::MST_LEBS + self.log_lebs + self.lpt_lebs
            + self.orph_lebs;
        let format_ok = okay! {
            self.key_hash == 0, // R5
            self.key_fmt == 0,  // simple
            self.fanout >= 2,
            self.fanout <= 128,
            self.jhead_cnt >= 1,
            self.jhead_cnt <= 63,
            ComprType::try_from_raw(self.default_compr).is_some(),
            reserved + 2 <= self.leb_cnt,
        };
        if geometry_ok && format_ok {
            Ok(())
        } else {
            Err(ParseError::InvalidNode)
        }
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.zeroes(2)
            .u8(self.key_hash)
            .u8(self.key_fmt)
            .u32(self.flags)
            .u32(self.min_io_size)
            .u32(self.leb_size)
            .u32(self.leb_cnt)
            .u32(self.max_leb_cnt)
            .u64(self.max_bud_bytes)
            .u32(self.log_lebs)
            .u32(self.lpt_lebs)
            .u32(self.orph_lebs)
            .u32(self.jhead_cnt)
            .u32(self.fanout)
            .u32(self.lsave_cnt)
            .u32(self.fmt_version)
            .u16(self.default_compr)
            .zeroes(2)
            .u32(self.rp_uid)
            .u32(self.rp_gid)
            .u64(self.rp_size)
            .u32(self.time_gran)
            .bytes(&self.uuid)
            .u32(self.ro_compat_version)
            .bytes(&self.hmac)
            .bytes(&self.hmac_wkm)
            .u16(self.hash_algo)
            .bytes(&self.hash_mst);
        let pad = SB_NODE_SZ - w.len();
        w.zeroes(pad);
        w.seal(NodeType::Sb, self.ch.group_type, self.ch.sqnum)
    }
    pub fn big_lpt(&self) -> bool {
        self.flags & super::SB_FL_BIGLPT != 0
    }
    pub fn space_fixup(&self) -> bool {
        self.flags & super::SB_FL_SPACE_FIXUP != 0
    }
    pub fn authenticated(&self) -> bool {
        self.flags & super::SB_FL_AUTHENTICATION != 0
    }
}

/*
    master node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct MstNode {
    pub ch: CommonHdr,
    pub highest_inum: u64,
    pub cmt_no: u64,
    pub flags: u32,
    pub log_lnum: u32,
    pub root_lnum: u32,
    pub root_offs: u32,
    pub root_len: u32,
    pub gc_lnum: u32,
    pub ihead_lnum: u32,
    pub ihead_offs: u32,
    pub index_size: u64,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub total_dead: u64,
    pub total_dark: u64,
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
    pub lscan_lnum: u32,
    pub empty_lebs: u32,
    pub idx_lebs: u32,
    pub leb_cnt: u32,
    pub hash_root_idx: [u8; MAX_HASH_LEN],
    pub hash_lpt: [u8; MAX_HASH_LEN],
    pub hmac: [u8; MAX_HMAC_LEN],
}

impl MstNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if ch.len as usize != MST_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        Ok(Self {
            ch,
            highest_inum: r.u64(),
            cmt_no: r.u64(),
            flags: r.u32(),
            log_lnum: r.u32(),
            root_lnum: r.u32(),
            root_offs: r.u32(),
            root_len: r.u32(),
            gc_lnum: r.u32(),
            ihead_lnum: r.u32(),
            ihead_offs: r.u32(),
            index_size: r.u64(),
            total_free: r.u64(),
            total_dirty: r.u64(),
            total_used: r.u64(),
            total_dead: r.u64(),
            total_dark: r.u64(),
            lpt_lnum: r.u32(),
            lpt_offs: r.u32(),
            nhead_lnum: r.u32(),
            nhead_offs: r.u32(),
            ltab_lnum: r.u32(),
            ltab_offs: r.u32(),
            lsave_lnum: r.u32(),
            lsave_offs: r.u32(),
            lscan_lnum: r.u32(),
            empty_lebs: r.u32(),
            idx_lebs: r.u32(),
            leb_cnt: r.u32(),
            hash_root_idx: r.array(),
            hash_lpt: r.array(),
            hmac: r.array(),
        })
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.u64(self.highest_inum)
            .u64(self.cmt_no)
            .u32(self.flags)
            .u32(self.log_lnum)
            .u32(self.root_lnum)
            .u32(self.root_offs)
            .u32(self.root_len)
            .u32(self.gc_lnum)
            .u32(self.ihead_lnum)
            .u32(self.ihead_offs)
            .u64(self.index_size)
            .u64(self.total_free)
            .u64(self.total_dirty)
            .u64(self.total_used)
            .u64(self.total_dead)
            .u64(self.total_dark)
            .u32(self.lpt_lnum)
            .u32(self.lpt_offs)
            .u32(self.nhead_lnum)
            .u32(self.nhead_offs)
            .u32(self.ltab_lnum)
            .u32(self.ltab_offs)
            .u32(self.lsave_lnum)
            .u32(self.lsave_offs)
            .u32(self.lscan_lnum)
            .u32(self.empty_lebs)
            .u32(self.idx_lebs)
            .u32(self.leb_cnt)
            .bytes(&self.hash_root_idx)
            .bytes(&self.hash_lpt)
            .bytes(&self.hmac);
        let pad = MST_NODE_SZ - w.len();
        w.zeroes(pad);
        w.seal(NodeType::Mst, self.ch.group_type, self.ch.sqnum)
    }
}

/*
    reference node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct RefNode {
    pub ch: CommonHdr,
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
}

impl RefNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if ch.len as usize != REF_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        Ok(Self {
            ch,
            lnum: r.u32(),
            offs: r.u32(),
            jhead: r.u32(),
        })
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.u32(self.lnum).u32(self.offs).u32(self.jhead).zeroes(28);
        w.seal(NodeType::Ref, self.ch.group_type, self.ch.sqnum)
    }
}

/*
    inode node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct InoNode {
    pub ch: CommonHdr,
    pub key: Key,
    pub creat_sqnum: u64,
    pub size: u64,
    pub atime_sec: u64,
    pub ctime_sec: u64,
    pub mtime_sec: u64,
    pub atime_nsec: u32,
    pub ctime_nsec: u32,
    pub mtime_nsec: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub data_len: u32,
    pub xattr_cnt: u32,
    pub xattr_size: u32,
    pub xattr_names: u32,
    pub compr_type: u16,
    pub data: Vec<u8>,
}

impl InoNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if (ch.len as usize) < INO_NODE_SZ || ch.len as usize > INO_NODE_SZ + MAX_INO_DATA {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        let key = Key::from_padded(r.bytes(MAX_KEY_LEN)).ok_or(ParseError::BadKey)?;
        let ino = Self {
            ch,
            key,
            creat_sqnum: r.u64(),
            size: r.u64(),
            atime_sec: r.u64(),
            ctime_sec: r.u64(),
            mtime_sec: r.u64(),
            atime_nsec: r.u32(),
            ctime_nsec: r.u32(),
            mtime_nsec: r.u32(),
            nlink: r.u32(),
            uid: r.u32(),
            gid: r.u32(),
            mode: r.u32(),
            flags: r.u32(),
            data_len: r.u32(),
            xattr_cnt: r.u32(),
            xattr_size: r.u32(),
            xattr_names: {
                r.skip(4);
                r.u32()
            },
            compr_type: r.u16(),
            data: {
                r.skip(26);
                buf[INO_NODE_SZ..].to_vec()
            },
        };
        ino.validate()?;
        Ok(ino)
    }
    fn validate(&self) -> Result<(), ParseError> {
        if self.key.knd() != KeyType::Ino {
            return Err(ParseError::BadKey);
        }
        let ok = okay! {
            self.data_len as usize == self.data.len(),
            ComprType::try_from_raw(self.compr_type).is_some(),
            self.mode_rules_hold(),
        };
        if ok {
            Ok(())
        } else {
            Err(ParseError::InvalidNode)
        }
    }
    /// Per-mode payload rules: symlinks carry their target inline,
    /// device specials carry a 4 or 8 byte device descriptor, xattr
    /// "files" carry the attribute value, everything else is empty
    fn mode_rules_hold(&self) -> bool {
        match self.mode & super::S_IFMT {
            super::S_IFREG if self.is_xattr() => self.size == self.data.len() as u64,
            super::S_IFREG | super::S_IFDIR | super::S_IFIFO | super::S_IFSOCK => {
                self.data.is_empty()
            }
            super::S_IFLNK => {
                !self.data.is_empty() && self.size == self.data.len() as u64
            }
            super::S_IFBLK | super::S_IFCHR => {
                self.data.len() == 4 || self.data.len() == 8
            }
            _ => false,
        }
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.key(&self.key)
            .u64(self.creat_sqnum)
            .u64(self.size)
            .u64(self.atime_sec)
            .u64(self.ctime_sec)
            .u64(self.mtime_sec)
            .u32(self.atime_nsec)
            .u32(self.ctime_nsec)
            .u32(self.mtime_nsec)
            .u32(self.nlink)
            .u32(self.uid)
            .u32(self.gid)
            .u32(self.mode)
            .u32(self.flags)
            .u32(self.data.len() as u32)
            .u32(self.xattr_cnt)
            .u32(self.xattr_size)
            .zeroes(4)
            .u32(self.xattr_names)
            .u16(self.compr_type)
            .zeroes(26)
            .bytes(&self.data);
        w.seal(NodeType::Ino, self.ch.group_type, self.ch.sqnum)
    }
    pub fn inum(&self) -> u32 {
        self.key.inum()
    }
    pub fn is_xattr(&self) -> bool {
        self.flags & super::INO_FL_XATTR != 0
    }
    pub fn is_encrypted(&self) -> bool {
        self.flags & super::INO_FL_CRYPT != 0
    }
    pub fn is_dir(&self) -> bool {
        self.mode & super::S_IFMT == super::S_IFDIR
    }
    pub fn is_reg(&self) -> bool {
        self.mode & super::S_IFMT == super::S_IFREG
    }
    /// A zero link count marks a deletion
    pub fn is_deletion(&self) -> bool {
        self.nlink == 0
    }
}

/*
    directory / extended attribute entry node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct DentNode {
    pub ch: CommonHdr,
    pub key: Key,
    pub inum: u64,
    pub dtype: u8,
    pub cookie: u32,
    pub name: Vec<u8>,
}

impl DentNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if (ch.len as usize) < DENT_NODE_SZ + 2 {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        let key = Key::from_padded(r.bytes(MAX_KEY_LEN)).ok_or(ParseError::BadKey)?;
        let inum = r.u64();
        r.skip(1);
        let dtype = r.u8();
        let nlen = r.u16();
        let cookie = r.u32();
        if ch.len as usize != DENT_NODE_SZ + nlen as usize + 1 {
            return Err(ParseError::BadNodeLength);
        }
        let name = r.bytes(nlen as usize).to_vec();
        let nul = r.u8();
        let dent = Self {
            ch,
            key,
            inum,
            dtype,
            cookie,
            name,
        };
        dent.validate(nul)?;
        Ok(dent)
    }
    fn validate(&self, nul: u8) -> Result<(), ParseError> {
        let want_key = match self.ch.node_type {
            NodeType::Dent => KeyType::Dent,
            NodeType::Xent => KeyType::Xent,
            _ => return Err(ParseError::InvalidNode),
        };
        if self.key.knd() != want_key {
            return Err(ParseError::BadKey);
        }
        let ok = okay! {
            nul == 0,
            !self.name.is_empty(),
            self.name.len() <= MAX_NLEN,
            !self.name.contains(&0),
            self.inum <= u32::MAX as u64,
            DentType::try_from_raw(self.dtype).is_some(),
            self.key.arg() == r5_hash(&self.name),
        };
        if ok {
            Ok(())
        } else {
            Err(ParseError::InvalidNode)
        }
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.key(&self.key)
            .u64(self.inum)
            .u8(0)
            .u8(self.dtype)
            .u16(self.name.len() as u16)
            .u32(self.cookie)
            .bytes(&self.name)
            .u8(0);
        w.seal(self.ch.node_type, self.ch.group_type, self.ch.sqnum)
    }
    pub fn is_xent(&self) -> bool {
        self.ch.node_type == NodeType::Xent
    }
    /// An entry pointing at inode zero marks a deletion
    pub fn is_deletion(&self) -> bool {
        self.inum == 0
    }
    /// The directory (or host file) this entry lives in
    pub fn host_inum(&self) -> u32 {
        self.key.inum()
    }
}

/*
    data node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct DataNode {
    pub ch: CommonHdr,
    pub key: Key,
    pub size: u32,
    pub compr_type: u16,
    pub compr_size: u16,
    pub data: Vec<u8>,
}

impl DataNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if (ch.len as usize) <= DATA_NODE_SZ
            || ch.len as usize > DATA_NODE_SZ + BLOCK_SIZE as usize
        {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        let key = Key::from_padded(r.bytes(MAX_KEY_LEN)).ok_or(ParseError::BadKey)?;
        let node = Self {
            ch,
            key,
            size: r.u32(),
            compr_type: r.u16(),
            compr_size: r.u16(),
            data: buf[DATA_NODE_SZ..].to_vec(),
        };
        node.validate()?;
        Ok(node)
    }
    fn validate(&self) -> Result<(), ParseError> {
        if self.key.knd() != KeyType::Data {
            return Err(ParseError::BadKey);
        }
        let ok = okay! {
            self.size > 0,
            self.size <= BLOCK_SIZE,
            ComprType::try_from_raw(self.compr_type).is_some(),
            self.compr_type != ComprType::None as u16
                || self.data.len() as u32 == self.size,
        };
        if ok {
            Ok(())
        } else {
            Err(ParseError::InvalidNode)
        }
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.key(&self.key)
            .u32(self.size)
            .u16(self.compr_type)
            .u16(self.compr_size)
            .bytes(&self.data);
        w.seal(NodeType::Data, self.ch.group_type, self.ch.sqnum)
    }
    pub fn inum(&self) -> u32 {
        self.key.inum()
    }
    pub fn block(&self) -> u32 {
        self.key.arg()
    }
}

/*
    truncation node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct TrunNode {
    pub ch: CommonHdr,
    pub inum: u32,
    pub old_size: u64,
    pub new_size: u64,
}

impl TrunNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if ch.len as usize != TRUN_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        let node = Self {
            ch,
            inum: r.u32(),
            old_size: {
                r.skip(12);
                r.u64()
            },
            new_size: r.u64(),
        };
        if node.inum == 0 || node.old_size <= node.new_size {
            return Err(ParseError::InvalidNode);
        }
        Ok(node)
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.u32(self.inum)
            .zeroes(12)
            .u64(self.old_size)
            .u64(self.new_size);
        w.seal(NodeType::Trun, self.ch.group_type, self.ch.sqnum)
    }
}

/*
    index node
*/

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Branch {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub key: Key,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdxNode {
    pub ch: CommonHdr,
    pub level: u16,
    pub branches: Vec<Branch>,
}

impl IdxNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if (ch.len as usize) < IDX_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        let child_cnt = r.u16();
        let level = r.u16();
        if child_cnt == 0 || ch.len as usize != super::idx_node_sz(child_cnt as usize) {
            return Err(ParseError::BadNodeLength);
        }
        let mut branches = Vec::with_capacity(child_cnt as usize);
        for _ in 0..child_cnt {
            let (lnum, offs, len) = (r.u32(), r.u32(), r.u32());
            let key = Key::from_wire(r.array()).ok_or(ParseError::BadKey)?;
            branches.push(Branch {
                lnum,
                offs,
                len,
                key,
            });
        }
        // branch keys must never descend; equal neighbours are possible
        // through name hash collisions
        if branches.windows(2).any(|w| w[1].key < w[0].key) {
            return Err(ParseError::InvalidNode);
        }
        Ok(Self {
            ch,
            level,
            branches,
        })
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.u16(self.branches.len() as u16).u16(self.level);
        for br in &self.branches {
            w.u32(br.lnum)
                .u32(br.offs)
                .u32(br.len)
                .bytes(&br.key.to_wire());
        }
        w.seal(NodeType::Idx, self.ch.group_type, self.ch.sqnum)
    }
}

/*
    commit start node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct CsNode {
    pub ch: CommonHdr,
    pub cmt_no: u64,
}

impl CsNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if ch.len as usize != CS_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        Ok(Self {
            ch,
            cmt_no: r.u64(),
        })
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.u64(self.cmt_no);
        w.seal(NodeType::Cs, self.ch.group_type, self.ch.sqnum)
    }
}

/*
    orphan node
*/

#[derive(Debug, Clone, PartialEq)]
pub struct OrphNode {
    pub ch: CommonHdr,
    pub cmt_no: u64,
    pub inos: Vec<u64>,
}

impl OrphNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        let len = ch.len as usize;
        if len < ORPH_NODE_SZ || (len - ORPH_NODE_SZ) % sizeof!(u64) != 0 {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        let cmt_no = r.u64();
        let inos = (0..(len - ORPH_NODE_SZ) / sizeof!(u64))
            .map(|_| r.u64())
            .collect();
        Ok(Self { ch, cmt_no, inos })
    }
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::for_node();
        w.u64(self.cmt_no);
        for ino in &self.inos {
            w.u64(*ino);
        }
        w.seal(NodeType::Orph, self.ch.group_type, self.ch.sqnum)
    }
    /// The top bit of `cmt_no` marks the last orphan node of a commit
    pub fn is_last(&self) -> bool {
        self.cmt_no & (1 << 63) != 0
    }
    pub fn commit_no(&self) -> u64 {
        self.cmt_no & !(1 << 63)
    }
}

/*
    authentication and signature nodes
*/

#[derive(Debug, Clone, PartialEq)]
pub struct AuthNode {
    pub ch: CommonHdr,
    pub hmac: Vec<u8>,
}

impl AuthNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if (ch.len as usize) < AUTH_NODE_SZ
            || ch.len as usize > AUTH_NODE_SZ + MAX_HMAC_LEN
        {
            return Err(ParseError::BadNodeLength);
        }
        Ok(Self {
            ch,
            hmac: buf[AUTH_NODE_SZ..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SigNode {
    pub ch: CommonHdr,
    pub sig_type: u32,
    pub sig: Vec<u8>,
}

impl SigNode {
    fn decode(ch: CommonHdr, buf: &[u8]) -> Result<Self, ParseError> {
        if (ch.len as usize) < SIG_NODE_SZ {
            return Err(ParseError::BadNodeLength);
        }
        let mut r = FieldReader::new(&buf[COMMON_HDR_SZ..]);
        let sig_type = r.u32();
        let sig_len = r.u32();
        if SIG_NODE_SZ + sig_len as usize != ch.len as usize {
            return Err(ParseError::BadNodeLength);
        }
        Ok(Self {
            ch,
            sig_type,
            sig: r.bytes(sig_len as usize).to_vec(),
        })
    }
}
