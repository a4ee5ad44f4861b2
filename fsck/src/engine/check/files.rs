/*
 * Created on Sat May 25 2024
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

//! Scanned files: the in-memory reconstruction of every file the index
//! (or, for the rebuilder, the raw scan) knows about, the validation
//! rules over them, the reachability walk and the attribute recompute.
//!
//! A dentry is filed under the file it points AT; its key still names
//! the directory holding it, so parent relationships stay reachable in
//! both directions without pointer cycles (the map is the arena, inode
//! numbers are the back-pointers).

use {
    crate::{
        engine::{
            error::RuntimeResult,
            ondisk::{
                node::{DentNode, DentType, InoNode},
                Key, DENT_NODE_SZ, INO_NODE_SZ, ROOT_INO, S_IFMT, S_IFREG,
            },
            problem::Problem,
            session::Session,
            tnc::{Loc, Tnc},
        },
        util::align8,
    },
    log::{debug, trace},
    std::collections::{BTreeMap, BTreeSet},
};

/// Name of the xattr that carries a file's encryption context
pub const ENCRYPTION_XATTR: &[u8] = b"c";

/// Size a directory entry accounts towards its directory
pub fn dent_size(name_len: usize) -> u64 {
    align8((DENT_NODE_SZ + name_len + 1) as u32) as u64
}

/// Bytes one extended attribute accounts towards its host
pub fn xattr_size(value_len: u32) -> u32 {
    align8(INO_NODE_SZ as u32 + value_len + 1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedDent {
    pub key: Key,
    pub loc: Option<Loc>,
    pub sqnum: u64,
    pub inum: u32,
    pub dtype: u8,
    pub name: Vec<u8>,
    pub is_xent: bool,
}

impl ScannedDent {
    pub fn from_node(dent: &DentNode, loc: Option<Loc>) -> Self {
        Self {
            key: dent.key,
            loc,
            sqnum: dent.ch.sqnum,
            inum: dent.inum as u32,
            dtype: dent.dtype,
            name: dent.name.clone(),
            is_xent: dent.is_xent(),
        }
    }
    /// The directory (or host file) holding this entry
    pub fn parent(&self) -> u32 {
        self.key.inum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScannedData {
    pub loc: Option<Loc>,
    pub sqnum: u64,
    pub size: u32,
    pub block: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScannedTrun {
    pub sqnum: u64,
    pub old_size: u64,
    pub new_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScannedFile {
    pub inum: u32,
    /// The chosen inode node; the highest sequence number wins
    pub ino: Option<(Option<Loc>, InoNode)>,
    /// Entries pointing at this file, by key and name
    pub dents: BTreeMap<(Key, Vec<u8>), ScannedDent>,
    /// Data blocks of this file
    pub data: BTreeMap<u32, ScannedData>,
    /// Youngest truncation seen in a raw scan (never present when the
    /// files came through the index: truncations only live in journals)
    pub trun: Option<ScannedTrun>,
    pub calc_nlink: u32,
    pub calc_size: u64,
    pub calc_xcnt: u32,
    pub calc_xsz: u32,
    pub calc_xnms: u32,
}

pub type FileMap = BTreeMap<u32, ScannedFile>;

impl ScannedFile {
    pub fn new(inum: u32) -> Self {
        Self {
            inum,
            ..Default::default()
        }
    }
    pub fn ino_node(&self) -> Option<&InoNode> {
        self.ino.as_ref().map(|(_, n)| n)
    }
    pub fn is_xattr(&self) -> bool {
        self.ino_node().map_or(false, |n| n.is_xattr())
    }
    pub fn is_dir(&self) -> bool {
        self.ino_node().map_or(false, |n| n.is_dir())
    }
    /// Keep the younger of the stored and the offered inode node
    pub fn offer_ino(&mut self, loc: Option<Loc>, ino: InoNode) {
        let stale = self
            .ino
            .as_ref()
            .map_or(false, |(_, cur)| cur.ch.sqnum >= ino.ch.sqnum);
        if !stale {
            self.ino = Some((loc, ino));
        }
    }
    /// File a dentry; among same-named entries the younger wins
    pub fn offer_dent(&mut self, dent: ScannedDent) {
        let slot = (dent.key, dent.name.clone());
        match self.dents.get(&slot) {
            Some(cur) if cur.sqnum >= dent.sqnum => {}
            _ => {
                self.dents.insert(slot, dent);
            }
        }
    }
    /// File a data block; the younger version wins
    pub fn offer_data(&mut self, data: ScannedData) {
        match self.data.get(&data.block) {
            Some(cur) if cur.sqnum >= data.sqnum => {}
            _ => {
                self.data.insert(data.block, data);
            }
        }
    }
    pub fn offer_trun(&mut self, trun: ScannedTrun) {
        if self.trun.map_or(true, |cur| cur.sqnum < trun.sqnum) {
            self.trun = Some(trun);
        }
    }
}

/*
    fix application
    ---
    In the check path every drop goes through the TNC so the index is
    what changes; in the rebuild path there is no index yet and the map
    itself is the only truth.
*/

fn drop_dent(
    sess: &mut Session,
    tnc: Option<&mut Tnc>,
    dent: &ScannedDent,
) -> RuntimeResult<()> {
    if let (Some(tnc), Some(loc)) = (tnc, dent.loc) {
        tnc.remove_node(&mut *sess.vol, dent.key, loc)?;
    }
    Ok(())
}

fn drop_file(
    sess: &mut Session,
    tnc: Option<&mut Tnc>,
    file: &ScannedFile,
) -> RuntimeResult<()> {
    if let Some(tnc) = tnc {
        for dent in file.dents.values() {
            if let Some(loc) = dent.loc {
                tnc.remove_node(&mut *sess.vol, dent.key, loc)?;
            }
        }
        let (from, to) = Key::ino_range(file.inum);
        tnc.remove_range(&mut *sess.vol, from, to)?;
    }
    Ok(())
}

/*
    validation (two rounds: xattr files first, because regular files
    ask about their xattr children)
*/

pub fn validate_files(
    sess: &mut Session,
    mut tnc: Option<&mut Tnc>,
    files: &mut FileMap,
) -> RuntimeResult<()> {
    let all: Vec<u32> = files.keys().copied().collect();
    for round in 0..2 {
        for &inum in &all {
            let Some(file) = files.get(&inum) else { continue };
            let xattr_round = round == 0;
            if file.is_xattr() != xattr_round && file.ino.is_some() {
                continue;
            }
            validate_one(sess, tnc.as_deref_mut(), files, inum)?;
        }
    }
    Ok(())
}

fn validate_one(
    sess: &mut Session,
    mut tnc: Option<&mut Tnc>,
    files: &mut FileMap,
    inum: u32,
) -> RuntimeResult<()> {
    // file with no inode at all
    let Some(ino) = files[&inum].ino_node().cloned() else {
        if sess.handle_problem(&Problem::FileHasNoInode { inum })? {
            let file = files.remove(&inum).unwrap();
            drop_file(sess, tnc, &file)?;
        }
        return Ok(());
    };
    // tombstone that was never garbage collected
    if ino.nlink == 0 {
        if sess.handle_problem(&Problem::FileHasZeroNlinkInode { inum })? {
            let file = files.remove(&inum).unwrap();
            drop_file(sess, tnc, &file)?;
        }
        return Ok(());
    }
    // entries disagreeing with the inode they point at
    let bad_dents: Vec<(Key, Vec<u8>)> = files[&inum]
        .dents
        .values()
        .filter(|d| {
            let want = DentType::from_mode(ino.mode).map(|t| t as u8);
            d.is_xent != ino.is_xattr() || want != Some(d.dtype)
        })
        .map(|d| (d.key, d.name.clone()))
        .collect();
    for slot in bad_dents {
        let problem = Problem::FileHasInconsistType {
            inum,
            name: slot.1.clone(),
        };
        if sess.handle_problem(&problem)? {
            let dent = files.get_mut(&inum).unwrap().dents.remove(&slot).unwrap();
            drop_dent(sess, tnc.as_deref_mut(), &dent)?;
        }
    }
    // directories and xattrs are single-linked; the youngest entry wins
    if files[&inum].is_dir() || files[&inum].is_xattr() {
        while files[&inum].dents.len() > 1 {
            let (slot, _) = files[&inum]
                .dents
                .iter()
                .min_by_key(|(_, d)| d.sqnum)
                .map(|(slot, d)| (slot.clone(), d.sqnum))
                .unwrap();
            let problem = Problem::FileHasTooManyDent {
                inum,
                name: slot.1.clone(),
            };
            if !sess.handle_problem(&problem)? {
                break;
            }
            let dent = files.get_mut(&inum).unwrap().dents.remove(&slot).unwrap();
            drop_dent(sess, tnc.as_deref_mut(), &dent)?;
        }
    }
    // only regular files own data blocks
    if ino.mode & S_IFMT != S_IFREG && !files[&inum].data.is_empty() {
        if sess.handle_problem(&Problem::FileShouldntHaveData { inum })? {
            let file = files.get_mut(&inum).unwrap();
            file.data.clear();
            file.trun = None;
            if let Some(tnc) = tnc.as_deref_mut() {
                tnc.remove_range(
                    &mut *sess.vol,
                    Key::data(inum, 0),
                    Key::last_of(inum, crate::engine::ondisk::KeyType::Data),
                )?;
            }
        }
    }
    // xattr files need a host that is not itself an xattr
    if files[&inum].is_xattr() {
        let host = files[&inum].dents.values().next().map(|d| d.parent());
        let verdict = match host {
            None => Some(Problem::XattrHasNoHost { inum }),
            Some(h) => match files.get(&h).and_then(|f| f.ino_node()) {
                None => Some(Problem::XattrHasNoHost { inum }),
                Some(host_ino) if host_ino.is_xattr() => {
                    Some(Problem::XattrHasWrongHost { inum, host: h })
                }
                Some(_) => None,
            },
        };
        if let Some(problem) = verdict {
            if sess.handle_problem(&problem)? {
                let file = files.remove(&inum).unwrap();
                drop_file(sess, tnc, &file)?;
            }
            return Ok(());
        }
        return Ok(());
    }
    // link-less files: the root is allowed, regular files are parked as
    // disconnected, everything else goes
    if files[&inum].dents.is_empty() && inum != ROOT_INO {
        if ino.mode & S_IFMT == S_IFREG {
            handle_disconnected(sess, tnc, files, inum)?;
        } else if sess.handle_problem(&Problem::FileHasNoDent { inum })? {
            let file = files.remove(&inum).unwrap();
            drop_file(sess, tnc, &file)?;
        }
        return Ok(());
    }
    // nothing may point at the root
    if inum == ROOT_INO && !files[&inum].dents.is_empty() {
        let slots: Vec<(Key, Vec<u8>)> = files[&inum].dents.keys().cloned().collect();
        for slot in slots {
            let problem = Problem::FileRootHasDent {
                name: slot.1.clone(),
            };
            if sess.handle_problem(&problem)? {
                let dent = files.get_mut(&inum).unwrap().dents.remove(&slot).unwrap();
                drop_dent(sess, tnc.as_deref_mut(), &dent)?;
            }
        }
    }
    // encrypted files must keep their encryption context xattr
    if ino.is_encrypted() && !ino.is_xattr() {
        let has_ctx = files.values().any(|f| {
            f.is_xattr()
                && f.dents
                    .values()
                    .any(|d| d.parent() == inum && d.name == ENCRYPTION_XATTR)
        });
        if !has_ctx && sess.handle_problem(&Problem::FileHasNoEncrypt { inum })? {
            let file = files.remove(&inum).unwrap();
            drop_file(sess, tnc, &file)?;
        }
    }
    Ok(())
}

/// A disconnected regular file: there is no lost+found recovery in this
/// tool, so an approved fix deletes the file
fn handle_disconnected(
    sess: &mut Session,
    tnc: Option<&mut Tnc>,
    files: &mut FileMap,
    inum: u32,
) -> RuntimeResult<()> {
    if !sess.handle_problem(&Problem::FileIsDisconnected { inum })? {
        return Ok(());
    }
    if sess.handle_problem(&Problem::DisconnectedFileCannotBeRecovered { inum })? {
        let file = files.remove(&inum).unwrap();
        drop_file(sess, tnc, &file)?;
    }
    Ok(())
}

/*
    reachability
*/

/// Walk parent links from the root; entries whose parent chain does not
/// end at the root are unreachable and dropped, and files losing their
/// last entry re-enter the link-less classification
pub fn check_reachability(
    sess: &mut Session,
    mut tnc: Option<&mut Tnc>,
    files: &mut FileMap,
) -> RuntimeResult<()> {
    // directories reachable from the root, by fixpoint
    let mut reachable: BTreeSet<u32> = BTreeSet::new();
    reachable.insert(ROOT_INO);
    loop {
        let mut grew = false;
        for file in files.values() {
            if !file.is_dir() || reachable.contains(&file.inum) {
                continue;
            }
            if file
                .dents
                .values()
                .any(|d| !d.is_xent && reachable.contains(&d.parent()))
            {
                reachable.insert(file.inum);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    // non-xattr entries hosted outside the reachable set are dangling
    let mut orphaned: Vec<u32> = Vec::new();
    let all: Vec<u32> = files.keys().copied().collect();
    for inum in all {
        let bad: Vec<(Key, Vec<u8>)> = files[&inum]
            .dents
            .values()
            .filter(|d| !d.is_xent && !reachable.contains(&d.parent()))
            .map(|d| (d.key, d.name.clone()))
            .collect();
        for slot in bad {
            let problem = Problem::DentryIsUnreachable {
                inum: slot.0.inum(),
                name: slot.1.clone(),
            };
            if sess.handle_problem(&problem)? {
                let dent = files.get_mut(&inum).unwrap().dents.remove(&slot).unwrap();
                drop_dent(sess, tnc.as_deref_mut(), &dent)?;
                if files[&inum].dents.is_empty() {
                    orphaned.push(inum);
                }
            }
        }
    }
    // files that just lost their last link
    for inum in orphaned {
        if !files.contains_key(&inum) || inum == ROOT_INO {
            continue;
        }
        let is_reg = files[&inum]
            .ino_node()
            .map_or(false, |n| n.mode & S_IFMT == S_IFREG && !n.is_xattr());
        if is_reg {
            handle_disconnected(sess, tnc.as_deref_mut(), files, inum)?;
        } else if sess.handle_problem(&Problem::FileHasNoDent { inum })? {
            let file = files.remove(&inum).unwrap();
            drop_file(sess, tnc.as_deref_mut(), &file)?;
        }
    }
    Ok(())
}

/*
    attribute recompute
*/

/// Fill the `calc_*` fields of every file from structure alone
pub fn calc_attributes(files: &mut FileMap) {
    for file in files.values_mut() {
        file.calc_nlink = 0;
        file.calc_size = 0;
        file.calc_xcnt = 0;
        file.calc_xsz = 0;
        file.calc_xnms = 0;
    }
    let all: Vec<u32> = files.keys().copied().collect();
    // base values per file kind
    for &inum in &all {
        let file = files.get_mut(&inum).unwrap();
        let Some(ino) = file.ino_node().cloned() else { continue };
        if ino.is_xattr() {
            file.calc_nlink = 1;
            file.calc_size = ino.data.len() as u64;
        } else if ino.is_dir() {
            file.calc_nlink = 2;
            file.calc_size = INO_NODE_SZ as u64;
        } else {
            file.calc_nlink = file.dents.values().filter(|d| !d.is_xent).count() as u32;
            file.calc_size = calc_reg_size(file, &ino);
        }
    }
    // contributions of each file's entries to its parents and hosts
    for &inum in &all {
        let Some(ino) = files[&inum].ino_node().cloned() else { continue };
        let dents: Vec<ScannedDent> = files[&inum].dents.values().cloned().collect();
        for dent in dents {
            let parent = dent.parent();
            if dent.is_xent {
                // xattr entry: count towards the host
                let value_len = ino.data.len() as u32;
                if let Some(host) = files.get_mut(&parent) {
                    host.calc_xcnt += 1;
                    host.calc_xsz += xattr_size(value_len);
                    host.calc_xnms += dent.name.len() as u32;
                }
                continue;
            }
            let child_is_dir = ino.is_dir();
            if let Some(parent_file) = files.get_mut(&parent) {
                parent_file.calc_size += dent_size(dent.name.len());
                if child_is_dir {
                    parent_file.calc_nlink += 1;
                }
            }
        }
    }
}

/// The data-derived size of a regular file, reconciling overwrites,
/// truncation and size extension: the youngest truncation obsoletes the
/// older data nodes above its cut, the surviving maximum wins, and a
/// larger stored size is preserved unless a younger truncation lowered
/// it
fn calc_reg_size(file: &mut ScannedFile, ino: &InoNode) -> u64 {
    use crate::engine::ondisk::BLOCK_SIZE;
    if let Some(trun) = file.trun {
        let first_dead = trun.new_size.div_ceil(BLOCK_SIZE as u64) as u32;
        file.data
            .retain(|&block, d| d.sqnum > trun.sqnum || block < first_dead);
    }
    let derived = file
        .data
        .values()
        .map(|d| d.block as u64 * BLOCK_SIZE as u64 + d.size as u64)
        .max()
        .unwrap_or(0);
    let stored = ino.size;
    let stored_trusted = match file.trun {
        Some(trun) => trun.sqnum <= ino.ch.sqnum || trun.new_size >= stored,
        None => true,
    };
    if stored > derived && stored_trusted {
        stored
    } else if !stored_trusted {
        derived.max(file.trun.map(|t| t.new_size).unwrap_or(0))
    } else {
        derived
    }
}

/// Compare stored and recomputed attributes; an approved fix rewrites
/// the inode node at its existing location with the corrected fields
pub fn check_attributes(
    sess: &mut Session,
    files: &mut FileMap,
) -> RuntimeResult<Vec<(Loc, InoNode)>> {
    calc_attributes(files);
    let mut rewrites = Vec::new();
    let all: Vec<u32> = files.keys().copied().collect();
    for inum in all {
        let file = files.get_mut(&inum).unwrap();
        let Some((loc, ino)) = &file.ino else { continue };
        let consistent = okay! {
            ino.nlink == file.calc_nlink,
            ino.size == file.calc_size,
            ino.xattr_cnt == file.calc_xcnt,
            ino.xattr_size == file.calc_xsz,
            ino.xattr_names == file.calc_xnms,
        };
        if consistent {
            continue;
        }
        trace!(
            "file {}: stored (nlink {}, size {}, x {}/{}/{}) calc (nlink {}, size {}, x {}/{}/{})",
            inum,
            ino.nlink,
            ino.size,
            ino.xattr_cnt,
            ino.xattr_size,
            ino.xattr_names,
            file.calc_nlink,
            file.calc_size,
            file.calc_xcnt,
            file.calc_xsz,
            file.calc_xnms
        );
        if !sess.handle_problem(&Problem::FileIsInconsistent { inum })? {
            continue;
        }
        let mut fixed = ino.clone();
        fixed.nlink = file.calc_nlink;
        fixed.size = file.calc_size;
        fixed.xattr_cnt = file.calc_xcnt;
        fixed.xattr_size = file.calc_xsz;
        fixed.xattr_names = file.calc_xnms;
        let loc = *loc;
        file.ino = Some((loc, fixed.clone()));
        if let Some(loc) = loc {
            rewrites.push((loc, fixed));
        }
    }
    debug!("{} inode nodes need rewriting", rewrites.len());
    Ok(rewrites)
}

/// Rewrite an inode node in place: read the hosting LEB, splice the
/// corrected node over the old image, change the LEB atomically
pub fn rewrite_inode(sess: &mut Session, loc: Loc, ino: &InoNode) -> RuntimeResult<()> {
    let leb_size = sess.vol.info().leb_size as usize;
    let mut buf = vec![0u8; leb_size];
    sess.vol.leb_read(loc.lnum, 0, &mut buf)?;
    let bytes = ino.encode();
    debug_assert_eq!(bytes.len(), loc.len as usize);
    buf[loc.offs as usize..loc.offs as usize + bytes.len()].copy_from_slice(&bytes);
    // preserve the used part of the LEB only; the tail stays erased
    let used = crate::engine::scan::scan_leb(loc.lnum, &buf).endpt as usize;
    sess.vol.leb_change(loc.lnum, &buf[..used.max(loc.offs as usize + bytes.len())])?;
    Ok(())
}
