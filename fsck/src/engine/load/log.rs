/*
 * Created on Fri May 17 2024
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

//! Journal replay. The log region names the buds of the youngest
//! commit: a commit-start node followed by reference nodes. Every bud's
//! live content is parsed and applied to the in-memory TNC in global
//! sequence-number order. Node groups spanning LEBs commit atomically;
//! a group whose closing node never made it to flash is discarded
//! whole.

use {
    super::LoadedFs,
    crate::engine::{
        dev::read_leb,
        error::{Reason, RuntimeResult},
        ondisk::{GroupType, Key, Node, BLOCK_SIZE, LOG_LNUM},
        problem::Problem,
        scan::{scan_leb, SlebEnd},
        session::Session,
        tnc::Loc,
    },
    log::{debug, trace, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A main-area LEB that was receiving journal writes
pub struct Bud {
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
}

enum ReplayOp {
    /// Establish or refresh a leaf
    Add { key: Key, loc: Loc, name: Option<Vec<u8>> },
    /// Inode deletion: everything of the inode goes
    DeleteIno { inum: u32 },
    /// Entry deletion by key and name
    DeleteEnt { key: Key, name: Vec<u8> },
    /// Truncation: data blocks past the new size go
    Truncate { inum: u32, new_size: u64, old_size: u64 },
}

struct ReplayEntry {
    sqnum: u64,
    op: ReplayOp,
}

pub fn replay(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    let buds = collect_buds(sess, fs)?;
    let mut entries = Vec::new();
    for bud in &buds {
        collect_bud_entries(sess, bud, &mut entries)?;
    }
    // cross-bud ordering is by sequence number alone
    entries.sort_by_key(|e| e.sqnum);
    let replayed = entries.len();
    for entry in entries {
        fs.max_sqnum = fs.max_sqnum.max(entry.sqnum);
        match entry.op {
            ReplayOp::Add { key, loc, name } => {
                fs.highest_inum = fs.highest_inum.max(key.inum());
                match name {
                    Some(name) => {
                        // a rewritten entry supersedes its indexed version
                        if let Some(old) = fs.tnc.lookup_nm(&mut *sess.vol, key, &name)? {
                            fs.tnc.remove_node(&mut *sess.vol, key, old)?;
                        }
                        fs.tnc.add_nm(&mut *sess.vol, key, &name, loc)?;
                    }
                    None => {
                        // refreshing an existing key replaces the leaf
                        if let Some(old) = fs.tnc.lookup(&mut *sess.vol, key)? {
                            fs.tnc.replace(&mut *sess.vol, key, old, loc)?;
                        } else {
                            fs.tnc.add(&mut *sess.vol, key, loc)?;
                        }
                    }
                }
            }
            ReplayOp::DeleteIno { inum } => {
                let (from, to) = Key::ino_range(inum);
                fs.tnc.remove_range(&mut *sess.vol, from, to)?;
            }
            ReplayOp::DeleteEnt { key, name } => {
                fs.tnc.remove_nm(&mut *sess.vol, key, &name)?;
            }
            ReplayOp::Truncate {
                inum,
                new_size,
                old_size,
            } => {
                let first_gone = new_size.div_ceil(BLOCK_SIZE as u64) as u32;
                let last = (old_size / BLOCK_SIZE as u64) as u32;
                fs.tnc.remove_range(
                    &mut *sess.vol,
                    Key::data(inum, first_gone),
                    Key::data(inum, last.max(first_gone)),
                )?;
            }
        }
    }
    debug!("replayed {} journal entries from {} buds", replayed, buds.len());
    fs.buds = buds;
    Ok(())
}

/// Walk the log region from the last commit start and collect the buds
/// of the youngest commit
fn collect_buds(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<Vec<Bud>> {
    let mut buds = Vec::new();
    let log_lebs = fs.sb.log_lebs;
    let mut lnum = fs.mst.log_lnum;
    let mut seen_cs = false;
    for _ in 0..log_lebs {
        let buf = read_leb(&mut *sess.vol, lnum)?;
        let sleb = scan_leb(lnum, &buf);
        if sleb.end != SlebEnd::EmptySpace {
            sess.reasons.set(Reason::DataCorrupted);
            sess.handle_problem(&Problem::LogCorrupted { lnum })?;
            unreachable!("log corruption always escalates");
        }
        if sleb.is_empty() {
            break;
        }
        for sn in &sleb.nodes {
            match &sn.node {
                Node::Cs(cs) => {
                    if cs.cmt_no == fs.mst.cmt_no {
                        seen_cs = true;
                        buds.clear();
                    } else {
                        trace!(
                            "log LEB {}: stale commit {} (current {})",
                            lnum,
                            cs.cmt_no,
                            fs.mst.cmt_no
                        );
                    }
                }
                Node::Ref(rn) => {
                    if !seen_cs {
                        continue;
                    }
                    let in_main = rn.lnum >= fs.geom.main_first
                        && rn.lnum < fs.geom.main_first + fs.geom.main_lebs
                        && rn.offs < fs.geom.leb_size
                        && rn.offs % 8 == 0;
                    if !in_main {
                        sess.reasons.set(Reason::DataCorrupted);
                        sess.handle_problem(&Problem::LogCorrupted { lnum })?;
                        unreachable!("log corruption always escalates");
                    }
                    buds.push(Bud {
                        lnum: rn.lnum,
                        offs: rn.offs,
                        jhead: rn.jhead,
                    });
                }
                other => {
                    warn!("log LEB {} holds a stray {}", lnum, other.node_type());
                    sess.reasons.set(Reason::DataCorrupted);
                    sess.handle_problem(&Problem::LogCorrupted { lnum })?;
                    unreachable!("log corruption always escalates");
                }
            }
        }
        // the log continues on the next region LEB, wrapping around
        lnum += 1;
        if lnum == LOG_LNUM + log_lebs {
            lnum = LOG_LNUM;
        }
        if lnum == fs.mst.log_lnum {
            break;
        }
    }
    Ok(buds)
}

/// Parse one bud and turn its live nodes into replay entries. Nodes
/// grouped across a LEB boundary only count once their closing group
/// member is present.
fn collect_bud_entries(
    sess: &mut Session,
    bud: &Bud,
    entries: &mut Vec<ReplayEntry>,
) -> RuntimeResult<()> {
    let buf = read_leb(&mut *sess.vol, bud.lnum)?;
    let sleb = scan_leb(bud.lnum, &buf);
    if sleb.end == SlebEnd::BadNode(crate::engine::error::ParseError::BadCrc) {
        // a torn tail after a power cut is normal; everything before it
        // was already accepted
        warn!(
            "bud LEB {}: dropping torn write at offset {}",
            bud.lnum, sleb.endpt
        );
    } else if sleb.end != SlebEnd::EmptySpace {
        sess.reasons.set(Reason::DataCorrupted);
        sess.handle_problem(&Problem::BudCorrupted { lnum: bud.lnum })?;
        unreachable!("bud corruption always escalates");
    }
    let mut group: Vec<ReplayEntry> = Vec::new();
    let mut in_group = false;
    for sn in sleb.nodes.iter().filter(|sn| sn.offs >= bud.offs) {
        let loc = Loc::new(bud.lnum, sn.offs, sn.len);
        let entry = match &sn.node {
            Node::Ino(ino) => ReplayEntry {
                sqnum: ino.ch.sqnum,
                op: if ino.is_deletion() {
                    ReplayOp::DeleteIno { inum: ino.inum() }
                } else {
                    ReplayOp::Add {
                        key: ino.key,
                        loc,
                        name: None,
                    }
                },
            },
            Node::Dent(dent) => ReplayEntry {
                sqnum: dent.ch.sqnum,
                op: if dent.is_deletion() {
                    ReplayOp::DeleteEnt {
                        key: dent.key,
                        name: dent.name.clone(),
                    }
                } else {
                    ReplayOp::Add {
                        key: dent.key,
                        loc,
                        name: Some(dent.name.clone()),
                    }
                },
            },
            Node::Data(data) => ReplayEntry {
                sqnum: data.ch.sqnum,
                op: ReplayOp::Add {
                    key: data.key,
                    loc,
                    name: None,
                },
            },
            Node::Trun(trun) => ReplayEntry {
                sqnum: trun.ch.sqnum,
                op: ReplayOp::Truncate {
                    inum: trun.inum,
                    new_size: trun.new_size,
                    old_size: trun.old_size,
                },
            },
            Node::Pad(_) => continue,
            other => {
                warn!(
                    "bud LEB {}:{} holds a stray {}",
                    bud.lnum,
                    sn.offs,
                    other.node_type()
                );
                sess.reasons.set(Reason::DataCorrupted);
                sess.handle_problem(&Problem::BudCorrupted { lnum: bud.lnum })?;
                unreachable!("bud corruption always escalates");
            }
        };
        match sn.node.ch().group_type {
            GroupType::None => {
                if in_group {
                    // a group ended without its closing member
                    group.clear();
                    in_group = false;
                }
                entries.push(entry);
            }
            GroupType::InGroup => {
                in_group = true;
                group.push(entry);
            }
            GroupType::LastOfGroup => {
                group.push(entry);
                entries.append(&mut group);
                in_group = false;
            }
        }
    }
    if in_group && !group.is_empty() {
        warn!(
            "bud LEB {}: discarding {} nodes of an unclosed group",
            bud.lnum,
            group.len()
        );
    }
    Ok(())
}
