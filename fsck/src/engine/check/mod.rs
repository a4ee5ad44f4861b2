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

//! # The consistency engine
//!
//! A fixed sequence of cross-checks over the mounted state: sweep the
//! index into scanned files, validate the files, walk reachability,
//! recompute attributes, check every LEB's space accounting against the
//! LPT, and measure the index against the stored index size. Each check
//! emits problems; approved fixes mutate the in-memory TNC, LPT and
//! master, which the commit then makes durable.

pub mod files;

use {
    self::files::{FileMap, ScannedDent, ScannedData, ScannedFile},
    super::load::{orphan, LoadedFs},
    crate::{
        engine::{
            error::{Reason, RuntimeResult},
            lpt::{Lpt, Lprops, LPROPS_INDEX},
            ondisk::{Node, NodeType, COMMON_HDR_SZ, ROOT_INO},
            problem::Problem,
            scan::{scan_leb, SlebEnd},
            session::Session,
            tnc::{LeafAction, Loc},
        },
        util::align8,
    },
    log::{debug, info},
    std::{cell::RefCell, collections::HashMap},
};

/// Run every check, in order
pub fn check_volume(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    orphan::apply_orphans(sess, fs)?;
    let mut files = extract_files(sess, fs)?;
    files::validate_files(sess, Some(&mut fs.tnc), &mut files)?;
    files::check_reachability(sess, Some(&mut fs.tnc), &mut files)?;
    let rewrites = files::check_attributes(sess, &mut files)?;
    if !sess.read_only() {
        for (loc, ino) in &rewrites {
            files::rewrite_inode(sess, *loc, ino)?;
        }
    }
    check_space(sess, fs)?;
    check_index_size(sess, fs)?;
    info!(
        "checked {} files ({} journal buds replayed)",
        files.len(),
        fs.buds.len()
    );
    Ok(())
}

/*
    the TNC sweep
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LebClass {
    NonIdx,
    Idx,
    Mixed,
    Unscannable,
}

/// Sweep every TNC leaf into the scanned-file map. Leaves that cannot
/// be honored are dropped (with approval); index damage escalates.
pub fn extract_files(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<FileMap> {
    enum Verdict {
        Keep(Box<Node>),
        Drop(Problem),
    }
    let mut leaves: Vec<(crate::engine::ondisk::Key, Loc, Verdict)> = Vec::new();
    let mut idx_problem: Option<Problem> = None;
    let classes: RefCell<HashMap<u32, LebClass>> = RefCell::new(HashMap::new());
    let leb_size = fs.geom.leb_size;
    fs.tnc.walk_index(
        &mut *sess.vol,
        &mut |vol, key, loc| {
            let verdict = (|| -> RuntimeResult<Verdict> {
                if loc.len < COMMON_HDR_SZ as u32
                    || loc.offs as u64 + loc.len as u64 > leb_size as u64
                {
                    return Ok(Verdict::Drop(Problem::TncDataCorrupted {
                        lnum: loc.lnum,
                        offs: loc.offs,
                    }));
                }
                match class_of(vol, &classes, loc.lnum, leb_size)? {
                    LebClass::Unscannable => {
                        return Ok(Verdict::Drop(Problem::ScanCorrupted { lnum: loc.lnum }))
                    }
                    LebClass::Idx | LebClass::Mixed => {
                        return Ok(Verdict::Drop(Problem::TncDataCorrupted {
                            lnum: loc.lnum,
                            offs: loc.offs,
                        }))
                    }
                    LebClass::NonIdx => {}
                }
                let mut buf = vec![0u8; loc.len as usize];
                vol.leb_read(loc.lnum, loc.offs, &mut buf)?;
                let node = match crate::engine::ondisk::parse_node(&buf, loc.lnum, loc.offs) {
                    Ok(node) => node,
                    Err(_) => {
                        return Ok(Verdict::Drop(Problem::TncDataCorrupted {
                            lnum: loc.lnum,
                            offs: loc.offs,
                        }))
                    }
                };
                // the key in the index and the key in the node must agree
                if node.key() != Some(key) {
                    return Ok(Verdict::Drop(Problem::TncDataCorrupted {
                        lnum: loc.lnum,
                        offs: loc.offs,
                    }));
                }
                Ok(Verdict::Keep(Box::new(node)))
            })()?;
            leaves.push((key, loc, verdict));
            Ok(LeafAction::Keep)
        },
        &mut |vol, loc, _level| {
            if idx_problem.is_none() && class_of(vol, &classes, loc.lnum, leb_size)? != LebClass::Idx
            {
                idx_problem = Some(Problem::TncCorrupted);
            }
            Ok(())
        },
    )?;
    if let Some(problem) = idx_problem {
        sess.reasons.set(Reason::TncCorrupted);
        sess.handle_problem(&problem)?;
        unreachable!("index corruption always escalates");
    }
    if leaves.is_empty() {
        sess.handle_problem(&Problem::EmptyTnc)?;
        unreachable!("an empty index always escalates");
    }
    let mut map = FileMap::new();
    for (key, loc, verdict) in leaves {
        let problem = match verdict {
            Verdict::Keep(node) => match insert_leaf(&mut map, key, loc, *node) {
                None => continue,
                Some(problem) => problem,
            },
            Verdict::Drop(problem) => problem,
        };
        sess.reasons.set(Reason::TncDataCorrupted);
        let fix = sess.handle_problem(&problem)?;
        sess.reasons.clear(Reason::TncDataCorrupted);
        if fix {
            fs.tnc.remove_node(&mut *sess.vol, key, loc)?;
        }
    }
    if map.get(&ROOT_INO).and_then(|f| f.ino_node()).is_none() {
        sess.handle_problem(&Problem::RootDirNotFound)?;
        unreachable!("a missing root always escalates");
    }
    debug!("extracted {} files from the index", map.len());
    Ok(map)
}

fn class_of(
    vol: &mut dyn crate::engine::dev::Volume,
    cache: &RefCell<HashMap<u32, LebClass>>,
    lnum: u32,
    leb_size: u32,
) -> RuntimeResult<LebClass> {
    if let Some(class) = cache.borrow().get(&lnum) {
        return Ok(*class);
    }
    let mut buf = vec![0u8; leb_size as usize];
    vol.leb_read(lnum, 0, &mut buf)?;
    let sleb = scan_leb(lnum, &buf);
    let class = if sleb.end != SlebEnd::EmptySpace {
        LebClass::Unscannable
    } else {
        let idx = sleb
            .nodes
            .iter()
            .filter(|sn| sn.node.node_type() == NodeType::Idx)
            .count();
        if idx == 0 {
            LebClass::NonIdx
        } else if idx == sleb.nodes.len() {
            LebClass::Idx
        } else {
            LebClass::Mixed
        }
    };
    cache.borrow_mut().insert(lnum, class);
    Ok(class)
}

/// File a parsed leaf under its owning inode; a `Some` return is the
/// problem that disqualifies the leaf
fn insert_leaf(
    map: &mut FileMap,
    key: crate::engine::ondisk::Key,
    loc: Loc,
    node: Node,
) -> Option<Problem> {
    match node {
        Node::Ino(ino) => {
            map.entry(key.inum())
                .or_insert_with(|| ScannedFile::new(key.inum()))
                .offer_ino(Some(loc), ino);
        }
        Node::Dent(dent) => {
            if dent.is_deletion() {
                // tombstones never belong in the index
                return Some(Problem::InvalidDentNode {
                    lnum: loc.lnum,
                    offs: loc.offs,
                });
            }
            let target = dent.inum as u32;
            map.entry(target)
                .or_insert_with(|| ScannedFile::new(target))
                .offer_dent(ScannedDent::from_node(&dent, Some(loc)));
        }
        Node::Data(data) => {
            map.entry(data.inum())
                .or_insert_with(|| ScannedFile::new(data.inum()))
                .offer_data(ScannedData {
                    loc: Some(loc),
                    sqnum: data.ch.sqnum,
                    size: data.size,
                    block: data.block(),
                });
        }
        _ => {
            return Some(Problem::TncDataCorrupted {
                lnum: loc.lnum,
                offs: loc.offs,
            })
        }
    }
    None
}

/*
    space accounting
*/

/// Per-LEB truth derived from a fresh scan plus index liveness; a node
/// is live iff the index still references exactly this instance
pub fn true_lprops(
    sess: &mut Session,
    tnc: &mut crate::engine::tnc::Tnc,
    leb_size: u32,
    lnum: u32,
) -> RuntimeResult<Lprops> {
    // the scratch buffer is reused across the whole sweep
    let mut buf = std::mem::take(&mut sess.scratch);
    buf.resize(leb_size as usize, 0);
    sess.vol.leb_read(lnum, 0, &mut buf)?;
    let sleb = scan_leb(lnum, &buf);
    sess.scratch = buf;
    if sleb.is_empty() {
        return Ok(Lprops::new(leb_size, 0, 0));
    }
    let mut live = 0u32;
    let mut is_idx = false;
    for sn in &sleb.nodes {
        let alive = match &sn.node {
            Node::Idx(idx) => {
                is_idx = true;
                let first_key = idx.branches[0].key;
                tnc.has_idx_node(&mut *sess.vol, first_key, idx.level, lnum, sn.offs)?
            }
            node => match node.key() {
                Some(key) => {
                    tnc.has_node(&mut *sess.vol, key, Loc::new(lnum, sn.offs, sn.len))?
                }
                None => false,
            },
        };
        if alive {
            live += align8(sn.len);
        }
    }
    let (free, dirty) = if sleb.end == SlebEnd::EmptySpace {
        (leb_size - sleb.endpt, sleb.endpt - live)
    } else {
        // torn or garbage tail: nothing of it is writable
        (0, leb_size - live)
    };
    let flags = if is_idx { LPROPS_INDEX } else { 0 };
    Ok(Lprops::new(free, dirty, flags))
}

/// Compare the LPT against the scanned truth, fix the entries that are
/// off, then compare and fix the global space statistics
pub fn check_space(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    let main = fs.geom.main_first..fs.geom.main_first + fs.geom.main_lebs;
    let mut calc = Vec::with_capacity(fs.geom.main_lebs as usize);
    let leb_size = fs.geom.leb_size;
    for lnum in main.clone() {
        let want = true_lprops(sess, &mut fs.tnc, leb_size, lnum)?;
        debug_assert!(want.is_sane(leb_size), "LEB {}: {:?}", lnum, want);
        calc.push(want);
    }
    // what the LPT said before any correction, for the global check
    let mut stored_free: u64 = 0;
    let mut stored_dirty: u64 = 0;
    if fs.lpt_broken {
        // the LPT never parsed: regenerate it wholesale from the scan
        info!("rebuilding the LEB property tree from scratch");
        fs.lpt = Lpt::from_lprops(fs.geom, &calc);
        fs.lpt.recategorize(&mut *sess.vol)?;
        fs.lpt_broken = false;
        fs.mst_dirty = true;
        stored_free = calc.iter().map(|lp| lp.free as u64).sum();
        stored_dirty = calc.iter().map(|lp| lp.dirty as u64).sum();
    } else {
        for (i, want) in calc.iter().enumerate() {
            let lnum = main.start + i as u32;
            let have = fs.lpt.lookup(&mut *sess.vol, lnum)?;
            stored_free += have.free as u64;
            stored_dirty += have.dirty as u64;
            let agrees = okay! {
                have.free == want.free,
                have.dirty == want.dirty,
                have.is_index() == want.is_index(),
            };
            if agrees {
                continue;
            }
            debug!(
                "LEB {}: LPT says free {} dirty {} flags {:#x}, scan says free {} dirty {} flags {:#x}",
                lnum, have.free, have.dirty, have.flags, want.free, want.dirty, want.flags
            );
            sess.reasons.set(Reason::LptIncorrect);
            let fix = sess.handle_problem(&Problem::LpIncorrect { lnum })?;
            sess.reasons.clear(Reason::LptIncorrect);
            if fix {
                fs.lpt
                    .change_one(&mut *sess.vol, lnum, want.free, want.dirty, want.flags)?;
            }
        }
    }
    // the statistics must be the sums of the per-LEB properties; both a
    // lying master and a lying LPT show up here
    let total_free: u64 = calc.iter().map(|lp| lp.free as u64).sum();
    let total_dirty: u64 = calc.iter().map(|lp| lp.dirty as u64).sum();
    let total_used: u64 = calc
        .iter()
        .map(|lp| (fs.geom.leb_size - lp.free - lp.dirty) as u64)
        .sum();
    let agrees = okay! {
        fs.mst.total_free == total_free,
        fs.mst.total_dirty == total_dirty,
        fs.mst.total_used == total_used,
        stored_free == total_free,
        stored_dirty == total_dirty,
    };
    if !agrees {
        debug!(
            "space stats: master says {}/{}/{}, scan says {}/{}/{}",
            fs.mst.total_free,
            fs.mst.total_dirty,
            fs.mst.total_used,
            total_free,
            total_dirty,
            total_used
        );
        if sess.handle_problem(&Problem::SpaceStatIncorrect)? {
            fs.mst.total_free = total_free;
            fs.mst.total_dirty = total_dirty;
            fs.mst.total_used = total_used;
            fs.mst.empty_lebs = calc
                .iter()
                .filter(|lp| lp.free == fs.geom.leb_size)
                .count() as u32;
            fs.mst.idx_lebs = calc.iter().filter(|lp| lp.is_index()).count() as u32;
            fs.mst_dirty = true;
        }
    }
    Ok(())
}

/*
    index size
*/

/// Accumulate the 8-byte-aligned size of every index node and compare
/// with what the master stored
pub fn check_index_size(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    let mut calc: u64 = 0;
    fs.tnc.walk_index(
        &mut *sess.vol,
        &mut |_, _, _| Ok(LeafAction::Keep),
        &mut |_, loc, _| {
            calc += align8(loc.len) as u64;
            Ok(())
        },
    )?;
    if calc == fs.mst.index_size {
        return Ok(());
    }
    let problem = Problem::IncorrectIdxSz {
        stored: fs.mst.index_size,
        calc,
    };
    if sess.handle_problem(&problem)? {
        fs.mst.index_size = calc;
        fs.mst_dirty = true;
    }
    Ok(())
}
