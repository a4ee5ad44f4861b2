/*
 * Created on Sun Jun 02 2024
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

//! # The scavenging rebuilder
//!
//! The last resort: scan every main LEB, keep whatever still parses,
//! reconcile versions by sequence number and deletion tombstones, then
//! write a brand new index, LPT, log and master over the survivors.
//! Deleted-but-uncollected data is dropped, not resurrected.

#[cfg(test)]
mod tests;

use {
    crate::{
        engine::{
            check::{
                files::{self, FileMap, ScannedData, ScannedDent, ScannedFile, ScannedTrun},
                true_lprops,
            },
            dev::read_leb,
            error::{Error, RuntimeResult},
            lpt::{create_lpt, calc_lpt_geom, Lprops},
            ondisk::{
                self,
                node::{CsNode, InoNode, MstNode, SbNode},
                CommonHdr, Key, Node, NodeType, GroupType, INO_NODE_SZ, LOG_LNUM, MST_LEBS,
                MST_LNUM, ROOT_INO, S_IFDIR,
            },
            problem::Mode,
            scan::{scan_leb, SlebEnd},
            session::Session,
            tnc::{commit::build_index, Loc, Tnc},
        },
        util::align_up,
    },
    chrono::Utc,
    libfsck::EXIT_NONDESTRUCT,
    log::{debug, info, warn},
    std::collections::{BTreeSet, HashMap},
};

/// Rebuild the filesystem from whatever survives in the main area.
/// Only the superblock is trusted; everything else is rewritten.
pub fn rebuild_fs(sess: &mut Session) -> RuntimeResult<()> {
    warn!("rebuilding the filesystem; deleted data that was not collected is dropped");
    // stage 1: minimal context
    let sb = super::load::read_superblock(sess)?;
    let geom = calc_lpt_geom(
        sb.leb_size,
        sb.leb_cnt,
        sb.max_leb_cnt,
        sb.min_io_size,
        sb.log_lebs,
        sb.lpt_lebs,
        sb.orph_lebs,
        sb.big_lpt(),
        sb.lsave_cnt,
    );
    // during the rebuild every repair decision is implicitly approved
    let saved_mode = sess.mode;
    sess.mode = Mode::Rebuild;
    let result = do_rebuild(sess, &sb, geom);
    sess.mode = saved_mode;
    result?;
    sess.exit_code |= EXIT_NONDESTRUCT;
    info!("rebuild complete");
    Ok(())
}

fn do_rebuild(
    sess: &mut Session,
    sb: &SbNode,
    geom: crate::engine::lpt::LptGeom,
) -> RuntimeResult<()> {
    let main = geom.main_first..geom.main_first + geom.main_lebs;
    // stages 2 and 3: scan everything, tracking deletions separately
    let mut files = FileMap::new();
    let mut deleted_inos: HashMap<u32, u64> = HashMap::new();
    let mut deleted_dents: HashMap<(Key, Vec<u8>), u64> = HashMap::new();
    let mut torn: BTreeSet<u32> = BTreeSet::new();
    let mut max_sqnum: u64 = 0;
    for lnum in main.clone() {
        let buf = read_leb(&mut *sess.vol, lnum)?;
        let sleb = scan_leb(lnum, &buf);
        if sleb.end != SlebEnd::EmptySpace {
            torn.insert(lnum);
        }
        max_sqnum = max_sqnum.max(sleb.highest_sqnum());
        for sn in &sleb.nodes {
            let loc = Loc::new(lnum, sn.offs, sn.len);
            match &sn.node {
                Node::Ino(ino) => {
                    if ino.is_deletion() {
                        let slot = deleted_inos.entry(ino.inum()).or_default();
                        *slot = (*slot).max(ino.ch.sqnum);
                    } else {
                        files
                            .entry(ino.inum())
                            .or_insert_with(|| ScannedFile::new(ino.inum()))
                            .offer_ino(Some(loc), ino.clone());
                    }
                }
                Node::Dent(dent) => {
                    if dent.is_deletion() {
                        let slot = deleted_dents
                            .entry((dent.key, dent.name.clone()))
                            .or_default();
                        *slot = (*slot).max(dent.ch.sqnum);
                    } else {
                        let target = dent.inum as u32;
                        files
                            .entry(target)
                            .or_insert_with(|| ScannedFile::new(target))
                            .offer_dent(ScannedDent::from_node(dent, Some(loc)));
                    }
                }
                Node::Data(data) => {
                    files
                        .entry(data.inum())
                        .or_insert_with(|| ScannedFile::new(data.inum()))
                        .offer_data(ScannedData {
                            loc: Some(loc),
                            sqnum: data.ch.sqnum,
                            size: data.size,
                            block: data.block(),
                        });
                }
                Node::Trun(trun) => {
                    files
                        .entry(trun.inum)
                        .or_insert_with(|| ScannedFile::new(trun.inum))
                        .offer_trun(ScannedTrun {
                            sqnum: trun.ch.sqnum,
                            old_size: trun.old_size,
                            new_size: trun.new_size,
                        });
                }
                // the old index and any stray region nodes are dead weight
                _ => {}
            }
        }
    }
    debug!(
        "scavenged {} files, {} deleted inodes, {} deleted entries",
        files.len(),
        deleted_inos.len(),
        deleted_dents.len()
    );
    // a deletion beats every older record of the same thing
    for (inum, del_sqnum) in deleted_inos {
        if let Some(file) = files.get_mut(&inum) {
            if file
                .ino_node()
                .map_or(true, |ino| ino.ch.sqnum < del_sqnum)
            {
                file.ino = None;
            }
        }
    }
    for ((key, name), del_sqnum) in deleted_dents {
        for file in files.values_mut() {
            if let Some(dent) = file.dents.get(&(key, name.clone())) {
                if dent.sqnum < del_sqnum {
                    file.dents.remove(&(key, name.clone()));
                }
            }
        }
    }
    // a volume scavenged down to nothing still gets a root directory
    let next_sqnum = max_sqnum + 1;
    if files.get(&ROOT_INO).and_then(|f| f.ino_node()).is_none() {
        warn!("no root directory survived; creating a fresh one");
        files
            .entry(ROOT_INO)
            .or_insert_with(|| ScannedFile::new(ROOT_INO))
            .offer_ino(None, default_root_ino(next_sqnum));
    }
    // stages 5 and 6: the same validation and reachability rules the
    // checker uses, with every fix auto-approved
    files::validate_files(sess, None, &mut files)?;
    files::check_reachability(sess, None, &mut files)?;
    if files.get(&ROOT_INO).and_then(|f| f.ino_node()).is_none() {
        files
            .entry(ROOT_INO)
            .or_insert_with(|| ScannedFile::new(ROOT_INO))
            .offer_ino(None, default_root_ino(next_sqnum));
    }
    // stage 7: recompute attributes; rewrites happen against flash for
    // survivors and in memory for the synthetic root
    let rewrites = files::check_attributes(sess, &mut files)?;
    // stage 8: every LEB a surviving node lives in stays; the rest of
    // the main area becomes available again
    let mut used: BTreeSet<u32> = BTreeSet::new();
    for file in files.values() {
        if let Some((Some(loc), _)) = &file.ino {
            used.insert(loc.lnum);
        }
        for dent in file.dents.values() {
            if let Some(loc) = dent.loc {
                used.insert(loc.lnum);
            }
        }
        for data in file.data.values() {
            if let Some(loc) = data.loc {
                used.insert(loc.lnum);
            }
        }
    }
    for (loc, ino) in &rewrites {
        files::rewrite_inode(sess, *loc, ino)?;
        used.insert(loc.lnum);
    }
    // stage 9: rewrite torn LEBs that stay, so a future scan can never
    // mistake a half-written unit for garbage; free the rest
    let mut free: Vec<u32> = Vec::new();
    for lnum in main.clone() {
        if used.contains(&lnum) {
            if torn.contains(&lnum) {
                let buf = read_leb(&mut *sess.vol, lnum)?;
                let endpt = scan_leb(lnum, &buf).endpt;
                let keep = align_up(endpt, geom.min_io_size).min(geom.leb_size) as usize;
                // the partial write unit is scrubbed, not preserved
                let mut img = buf[..keep].to_vec();
                img[endpt as usize..].fill(ondisk::ERASED_BYTE);
                sess.vol.leb_change(lnum, &img)?;
            }
        } else {
            sess.vol.leb_unmap(lnum)?;
            free.push(lnum);
        }
    }
    if free.len() < 3 {
        ::log::error!("not enough free space to rebuild the index");
        sess.exit_code |= libfsck::EXIT_ERROR;
        return Err(Error::abort());
    }
    // one empty LEB is reserved for garbage collection forever
    let gc_lnum = free.pop().unwrap();
    // the synthetic root (if any) needs a home before the index is built
    let mut sqnum = next_sqnum;
    if let Some(file) = files.get_mut(&ROOT_INO) {
        if matches!(file.ino, Some((None, _))) {
            let (_, ino) = file.ino.take().unwrap();
            let lnum = free.remove(0);
            let bytes = ino.encode();
            sess.vol.leb_change(lnum, &bytes)?;
            file.ino = Some((Some(Loc::new(lnum, 0, bytes.len() as u32)), ino));
            used.insert(lnum);
        }
    }
    // stage 10: fold the surviving leaves into a fresh index, sorted by
    // key and, among colliding keys, by name
    let mut leaves: Vec<(Key, Vec<u8>, Loc)> = Vec::new();
    for file in files.values() {
        if let Some((Some(loc), _)) = &file.ino {
            leaves.push((Key::ino(file.inum), Vec::new(), *loc));
        }
        for ((key, name), dent) in &file.dents {
            if let Some(loc) = dent.loc {
                leaves.push((*key, name.clone(), loc));
            }
        }
        for data in file.data.values() {
            if let Some(loc) = data.loc {
                leaves.push((Key::data(file.inum, data.block), Vec::new(), loc));
            }
        }
    }
    leaves.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    let flat: Vec<(Key, Loc)> = leaves.iter().map(|(k, _, l)| (*k, *l)).collect();
    let built = build_index(
        &mut *sess.vol,
        sb.fanout as usize,
        &flat,
        free.clone(),
        &mut sqnum,
    )?;
    let mut tnc = Tnc::from_root(sb.fanout as usize, built.root);
    // stage 11: a fresh LPT from the per-LEB truth
    let mut lprops: Vec<Lprops> = Vec::with_capacity(geom.main_lebs as usize);
    for lnum in main.clone() {
        lprops.push(true_lprops(sess, &mut tnc, geom.leb_size, lnum)?);
    }
    let roots = create_lpt(&mut *sess.vol, &geom, &lprops)?;
    // stage 12: a clean log: one commit start, nothing else
    for lnum in LOG_LNUM..LOG_LNUM + sb.log_lebs {
        sess.vol.leb_unmap(lnum)?;
    }
    sqnum += 1;
    let cs = CsNode {
        ch: CommonHdr::synth(NodeType::Cs, sqnum),
        cmt_no: 0,
    };
    sess.vol.leb_change(LOG_LNUM, &cs.encode())?;
    // stage 13: no orphans survive a rebuild
    for lnum in geom.orph_first..geom.orph_first + geom.orph_lebs {
        sess.vol.leb_unmap(lnum)?;
    }
    // stage 14: the master node, written twice, commits everything
    let highest_inum = files.keys().max().copied().unwrap_or(ROOT_INO);
    let total_free: u64 = lprops.iter().map(|lp| lp.free as u64).sum();
    let total_dirty: u64 = lprops.iter().map(|lp| lp.dirty as u64).sum();
    let total_used: u64 = lprops
        .iter()
        .map(|lp| (geom.leb_size - lp.free - lp.dirty) as u64)
        .sum();
    sqnum += 1;
    let mst = MstNode {
        ch: CommonHdr::synth(NodeType::Mst, sqnum).with_group(GroupType::None),
        highest_inum: highest_inum as u64,
        cmt_no: 0,
        flags: ondisk::MST_FL_NO_ORPHS,
        log_lnum: LOG_LNUM,
        root_lnum: built.root.lnum,
        root_offs: built.root.offs,
        root_len: built.root.len,
        gc_lnum,
        ihead_lnum: built.ihead.0,
        ihead_offs: built.ihead.1,
        index_size: built.index_size,
        total_free,
        total_dirty,
        total_used,
        total_dead: 0,
        total_dark: 0,
        lpt_lnum: roots.lpt_lnum,
        lpt_offs: roots.lpt_offs,
        nhead_lnum: roots.nhead_lnum,
        nhead_offs: roots.nhead_offs,
        ltab_lnum: roots.ltab_lnum,
        ltab_offs: roots.ltab_offs,
        lsave_lnum: roots.lsave_lnum,
        lsave_offs: roots.lsave_offs,
        lscan_lnum: geom.main_first,
        empty_lebs: lprops.iter().filter(|lp| lp.free == geom.leb_size).count() as u32,
        idx_lebs: lprops.iter().filter(|lp| lp.is_index()).count() as u32,
        leb_cnt: geom.leb_cnt,
        hash_root_idx: [0; ondisk::MAX_HASH_LEN],
        hash_lpt: [0; ondisk::MAX_HASH_LEN],
        hmac: [0; ondisk::MAX_HMAC_LEN],
    };
    let image = mst.encode();
    for lnum in MST_LNUM..MST_LNUM + MST_LEBS {
        sess.vol.leb_change(lnum, &image)?;
    }
    info!(
        "rebuilt: {} files, {} index LEBs, highest inode {}",
        files.len(),
        built.lebs_used.len(),
        highest_inum
    );
    Ok(())
}

/// The root directory an empty volume starts over with
fn default_root_ino(sqnum: u64) -> InoNode {
    let now = Utc::now();
    InoNode {
        ch: CommonHdr::synth(NodeType::Ino, sqnum),
        key: Key::ino(ROOT_INO),
        creat_sqnum: sqnum,
        size: INO_NODE_SZ as u64,
        atime_sec: now.timestamp() as u64,
        ctime_sec: now.timestamp() as u64,
        mtime_sec: now.timestamp() as u64,
        atime_nsec: now.timestamp_subsec_nanos(),
        ctime_nsec: now.timestamp_subsec_nanos(),
        mtime_nsec: now.timestamp_subsec_nanos(),
        nlink: 2,
        uid: 0,
        gid: 0,
        mode: S_IFDIR | 0o755,
        flags: 0,
        data_len: 0,
        xattr_cnt: 0,
        xattr_size: 0,
        xattr_names: 0,
        compr_type: 0,
        data: vec![],
    }
}
