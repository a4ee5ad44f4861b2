/*
 * Created on Mon Jun 10 2024
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

//! Test plumbing shared across the engine: a volume builder that lays
//! raw nodes into the main area and lets the rebuilder forge them into
//! a consistent filesystem, plus session and inspection helpers.


use {
    super::{
        dev::{SharedVolume, Volume},
        load::{self, LoadedFs},
        lpt::{calc_lpt_geom, LptGeom},
        ondisk::{
            node::{DataNode, DentNode, DentType, InoNode, SbNode},
            CommonHdr, Key, Node, NodeType, BLOCK_SIZE, INO_NODE_SZ, ROOT_INO, SB_LNUM,
            S_IFDIR, S_IFREG,
        },
        problem::Mode,
        session::Session,
        tnc::{read_node, Loc},
    },
    crate::util::align8,
    std::{cell::RefCell, rc::Rc},
};

pub const LEB_SZ: u32 = 131072;
pub const LEB_CNT: u32 = 64;
pub const MIN_IO: u32 = 8;

pub fn test_sb(leb_size: u32, leb_cnt: u32) -> SbNode {
    SbNode {
        ch: CommonHdr::synth(NodeType::Sb, 1),
        key_hash: 0,
        key_fmt: 0,
        flags: 0,
        min_io_size: MIN_IO,
        leb_size,
        leb_cnt,
        max_leb_cnt: leb_cnt,
        max_bud_bytes: 8 * leb_size as u64,
        log_lebs: 4,
        lpt_lebs: 2,
        orph_lebs: 1,
        jhead_cnt: 3,
        fanout: 8,
        lsave_cnt: 0,
        fmt_version: super::ondisk::FMT_VERSION,
        default_compr: 0,
        rp_uid: 0,
        rp_gid: 0,
        rp_size: 0,
        time_gran: 1_000_000_000,
        uuid: *b"ubifsck-test-vol",
        ro_compat_version: 0,
        hmac: [0; 64],
        hmac_wkm: [0; 64],
        hash_algo: 0,
        hash_mst: [0; 64],
    }
}

pub fn ino_node(inum: u32, mode: u32, nlink: u32, size: u64, sqnum: u64) -> InoNode {
    InoNode {
        ch: CommonHdr::synth(NodeType::Ino, sqnum),
        key: Key::ino(inum),
        creat_sqnum: sqnum,
        size,
        atime_sec: 1_700_000_000,
        ctime_sec: 1_700_000_000,
        mtime_sec: 1_700_000_000,
        atime_nsec: 0,
        ctime_nsec: 0,
        mtime_nsec: 0,
        nlink,
        uid: 0,
        gid: 0,
        mode,
        flags: 0,
        data_len: 0,
        xattr_cnt: 0,
        xattr_size: 0,
        xattr_names: 0,
        compr_type: 0,
        data: vec![],
    }
}

/// Lays raw leaf nodes into the main area; `finish` lets the rebuilder
/// turn the soup into a consistent volume with index, LPT, log and
/// master
pub struct VolumeBuilder {
    pub vol: SharedVolume,
    pub geom: LptGeom,
    cur: u32,
    buf: Vec<u8>,
    sqnum: u64,
}

impl VolumeBuilder {
    pub fn new() -> Self {
        Self::with_geometry(LEB_SZ, LEB_CNT)
    }
    pub fn with_geometry(leb_size: u32, leb_cnt: u32) -> Self {
        let mut vol = SharedVolume::new(leb_size, leb_cnt, MIN_IO);
        let sb = test_sb(leb_size, leb_cnt);
        vol.leb_change(SB_LNUM, &sb.encode()).unwrap();
        let geom = calc_lpt_geom(
            leb_size,
            leb_cnt,
            leb_cnt,
            MIN_IO,
            sb.log_lebs,
            sb.lpt_lebs,
            sb.orph_lebs,
            false,
            0,
        );
        Self {
            vol,
            geom,
            cur: geom.main_first,
            buf: Vec::new(),
            sqnum: 1,
        }
    }
    pub fn next_sqnum(&mut self) -> u64 {
        self.sqnum += 1;
        self.sqnum
    }
    pub fn put(&mut self, bytes: &[u8]) -> Loc {
        let aligned = align8(bytes.len() as u32) as usize;
        if self.buf.len() + aligned > self.geom.leb_size as usize {
            self.vol.leb_change(self.cur, &self.buf).unwrap();
            self.cur += 1;
            self.buf.clear();
        }
        let offs = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        self.buf.resize(offs as usize + aligned, 0xFF);
        Loc::new(self.cur, offs, bytes.len() as u32)
    }
    pub fn ino(&mut self, inum: u32, mode: u32, nlink: u32, size: u64) -> Loc {
        let sqnum = self.next_sqnum();
        let bytes = ino_node(inum, mode, nlink, size, sqnum).encode();
        self.put(&bytes)
    }
    pub fn dent(&mut self, parent: u32, name: &str, target: u32, dtype: DentType) -> Loc {
        let sqnum = self.next_sqnum();
        let bytes = DentNode {
            ch: CommonHdr::synth(NodeType::Dent, sqnum),
            key: Key::dent(parent, name.as_bytes()),
            inum: target as u64,
            dtype: dtype as u8,
            cookie: 0,
            name: name.as_bytes().to_vec(),
        }
        .encode();
        self.put(&bytes)
    }
    pub fn data(&mut self, inum: u32, block: u32, payload: &[u8]) -> Loc {
        let sqnum = self.next_sqnum();
        let bytes = DataNode {
            ch: CommonHdr::synth(NodeType::Data, sqnum),
            key: Key::data(inum, block),
            size: payload.len() as u32,
            compr_type: 0,
            compr_size: 0,
            data: payload.to_vec(),
        }
        .encode();
        self.put(&bytes)
    }
    pub fn trun(&mut self, inum: u32, old_size: u64, new_size: u64) -> Loc {
        let sqnum = self.next_sqnum();
        let bytes = super::ondisk::node::TrunNode {
            ch: CommonHdr::synth(NodeType::Trun, sqnum),
            inum,
            old_size,
            new_size,
        }
        .encode();
        self.put(&bytes)
    }
    /// A directory under `parent`
    pub fn dir(&mut self, parent: u32, name: &str, inum: u32) {
        self.ino(inum, S_IFDIR | 0o755, 2, INO_NODE_SZ as u64);
        self.dent(parent, name, inum, DentType::Dir);
    }
    /// A regular file under `parent` with the given contents
    pub fn reg(&mut self, parent: u32, name: &str, inum: u32, content: &[u8]) {
        self.ino(inum, S_IFREG | 0o644, 1, content.len() as u64);
        self.dent(parent, name, inum, DentType::Reg);
        for (block, chunk) in content.chunks(BLOCK_SIZE as usize).enumerate() {
            self.data(inum, block as u32, chunk);
        }
    }
    /// The root directory inode; call first
    pub fn root(&mut self) {
        self.ino(ROOT_INO, S_IFDIR | 0o755, 2, INO_NODE_SZ as u64);
    }
    /// Flush pending nodes and let the rebuilder produce a consistent
    /// volume out of them
    pub fn finish(mut self) -> SharedVolume {
        if !self.buf.is_empty() {
            self.vol.leb_change(self.cur, &self.buf).unwrap();
        }
        let vol = self.vol.clone();
        let code = run_mode(&vol, Mode::Rebuild);
        assert_eq!(code & libfsck::EXIT_ERROR, 0, "rebuild failed: {}", code);
        vol.0.reset_stats();
        vol
    }
}

/*
    session helpers
*/

pub fn session(vol: &SharedVolume, mode: Mode) -> Session {
    Session::new(Box::new(vol.clone()), mode, Box::new(|_, default| default))
}

/// Run the tool in the given mode against a shared volume
pub fn run_mode(vol: &SharedVolume, mode: Mode) -> i32 {
    let mut sess = session(vol, mode);
    super::run_with_session(&mut sess)
}

/// Run in normal mode with a scripted prompt; returns the exit code and
/// the questions that were asked
pub fn run_prompted(vol: &SharedVolume, answer: bool) -> (i32, Vec<String>) {
    let questions = Rc::new(RefCell::new(Vec::new()));
    let log = questions.clone();
    let mut sess = Session::new(
        Box::new(vol.clone()),
        Mode::Normal,
        Box::new(move |q, _| {
            log.borrow_mut().push(q.to_owned());
            answer
        }),
    );
    let code = super::run_with_session(&mut sess);
    drop(sess);
    (code, Rc::try_unwrap(questions).unwrap().into_inner())
}

/// Mount read-only for inspection
pub fn mount_ro(vol: &SharedVolume) -> (Session, LoadedFs) {
    let mut sess = session(vol, Mode::Check);
    let fs = load::mount(&mut sess).expect("volume does not mount");
    (sess, fs)
}

/// The inode node of a file, through the index
pub fn find_ino(sess: &mut Session, fs: &mut LoadedFs, inum: u32) -> Option<(Loc, InoNode)> {
    let loc = fs.tnc.lookup(&mut *sess.vol, Key::ino(inum)).unwrap()?;
    match read_node(&mut *sess.vol, loc).unwrap() {
        Node::Ino(ino) => Some((loc, ino)),
        other => panic!("expected an inode node, got {}", other.node_type()),
    }
}

/// A directory entry, through the index, by parent and name
pub fn find_dent(
    sess: &mut Session,
    fs: &mut LoadedFs,
    parent: u32,
    name: &str,
) -> Option<DentNode> {
    let key = Key::dent(parent, name.as_bytes());
    let loc = fs
        .tnc
        .lookup_nm(&mut *sess.vol, key, name.as_bytes())
        .unwrap()?;
    match read_node(&mut *sess.vol, loc).unwrap() {
        Node::Dent(dent) => Some(dent),
        other => panic!("expected a dentry node, got {}", other.node_type()),
    }
}

/// Splice a re-encoded inode node over its on-flash image, bypassing
/// the write path; the corruption primitive for attribute tests
pub fn patch_ino(vol: &SharedVolume, loc: Loc, ino: &InoNode) {
    let bytes = ino.encode();
    assert_eq!(bytes.len(), loc.len as usize);
    vol.0.patch(loc.lnum, loc.offs, &bytes);
}
