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

//! # The engine
//!
//! Everything below the command line lives here: the on-flash codec,
//! the device layer, the scanner, the in-memory index and LEB property
//! trees, the loader, the consistency engine, the scavenging rebuilder
//! and the problem policy gluing them together. The [`run`] driver owns
//! the control flow: mount, check, commit, and the escalation loop into
//! the rebuilder.

pub mod auth;
pub mod check;
pub mod dev;
pub mod error;
pub mod load;
pub mod lpt;
pub mod ondisk;
pub mod problem;
pub mod rebuild;
pub mod scan;
pub mod session;
pub mod tnc;
#[cfg(test)]
pub mod tests;

use {
    crate::engine::{
        dev::Volume,
        error::{ErrorKind, Reason, RuntimeResult},
        load::LoadedFs,
        lpt::LPROPS_INDEX,
        ondisk::{node::CsNode, CommonHdr, NodeType, LOG_LNUM, MST_LEBS, MST_LNUM},
        problem::{Mode, Problem},
        session::Session,
        tnc::commit::build_index,
    },
    libfsck::{EXIT_ERROR, EXIT_UNCORRECTED},
    log::{debug, error, info},
};

/// Run the whole tool against an opened volume and yield the exit code
pub fn run(vol: Box<dyn Volume>, mode: Mode) -> i32 {
    let prompt = Box::new(|question: &str, default: bool| {
        libfsck::util::terminal::prompt_yes_no(question, default)
    });
    let mut sess = Session::new(vol, mode, prompt);
    run_with_session(&mut sess)
}

/// Like [`run`], with the caller supplying the session (tests install
/// their own prompt and volume here)
pub fn run_with_session(sess: &mut Session) -> i32 {
    match run_inner(sess) {
        Ok(()) => {}
        Err(e) if *e.kind() == ErrorKind::Abort => {
            // the exit bits were already recorded where the problem was
            if sess.exit_code == 0 {
                sess.exit_code |= EXIT_UNCORRECTED;
            }
        }
        Err(e) => {
            error!("fatal: {}", e);
            sess.exit_code |= EXIT_ERROR;
        }
    }
    sess.exit_code
}

fn run_inner(sess: &mut Session) -> RuntimeResult<()> {
    if sess.mode == Mode::Rebuild {
        return rebuild::rebuild_fs(sess);
    }
    match mount_check_commit(sess) {
        Ok(()) => Ok(()),
        Err(e) if *e.kind() == ErrorKind::NeedRebuild && sess.try_rebuild => {
            // tear down everything the failed pass built up and start
            // over with a clean session state
            sess.try_rebuild = false;
            sess.reasons = Default::default();
            rebuild::rebuild_fs(sess)
        }
        Err(e) => Err(e),
    }
}

fn mount_check_commit(sess: &mut Session) -> RuntimeResult<()> {
    // corruption reasons that unwind this far were not handled in place:
    // route them through the policy so they escalate instead of failing
    // the run as an operational error
    let mut fs = match load::mount(sess) {
        Ok(fs) => fs,
        Err(e) if matches!(e.kind(), ErrorKind::Corrupt(_)) => {
            sess.handle_problem(&Problem::TncCorrupted)?;
            unreachable!("index corruption always escalates");
        }
        Err(e) => return Err(e),
    };
    loop {
        match check::check_volume(sess, &mut fs) {
            Ok(()) => break,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Corrupt(Reason::LptCorrupted | Reason::LptIncorrect)
                ) =>
            {
                // a deeper LPT node turned out bad only once the space
                // sweep faulted it in
                if sess.handle_problem(&Problem::LptCorrupted)? {
                    fs.lpt_broken = true;
                    continue;
                }
                return Err(e);
            }
            Err(e) if matches!(e.kind(), ErrorKind::Corrupt(_)) => {
                sess.handle_problem(&Problem::TncCorrupted)?;
                unreachable!("index corruption always escalates");
            }
            Err(e) => return Err(e),
        }
    }
    commit(sess, &mut fs)
}

/*
    commit
    ---
    Mutation order is fixed: leaf drops and inode rewrites already
    happened during the checks; now the index is written out-of-place,
    then the LPT, then the log is consolidated, and the master node
    goes last as the durable commit point.
*/

fn commit(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    let index_dirty = fs.tnc.is_dirty();
    let lpt_dirty = fs.lpt.is_dirty() || index_dirty;
    if !index_dirty && !lpt_dirty && !fs.mst_dirty {
        debug!("nothing to commit");
        return Ok(());
    }
    if sess.read_only() {
        return Ok(());
    }
    let mut sqnum = fs.max_sqnum + 1;
    if index_dirty {
        commit_index(sess, fs, &mut sqnum)?;
    }
    if lpt_dirty {
        let all = fs.lpt.all(&mut *sess.vol)?;
        let roots = lpt::create_lpt(&mut *sess.vol, &fs.geom, &all)?;
        fs.mst.lpt_lnum = roots.lpt_lnum;
        fs.mst.lpt_offs = roots.lpt_offs;
        fs.mst.nhead_lnum = roots.nhead_lnum;
        fs.mst.nhead_offs = roots.nhead_offs;
        fs.mst.ltab_lnum = roots.ltab_lnum;
        fs.mst.ltab_offs = roots.ltab_offs;
        fs.mst.lsave_lnum = roots.lsave_lnum;
        fs.mst.lsave_offs = roots.lsave_offs;
        // refresh the totals from the final properties
        fs.mst.total_free = all.iter().map(|lp| lp.free as u64).sum();
        fs.mst.total_dirty = all.iter().map(|lp| lp.dirty as u64).sum();
        fs.mst.total_used = all
            .iter()
            .map(|lp| (fs.geom.leb_size - lp.free - lp.dirty) as u64)
            .sum();
        fs.mst.empty_lebs = all
            .iter()
            .filter(|lp| lp.free == fs.geom.leb_size)
            .count() as u32;
        fs.mst.idx_lebs = all.iter().filter(|lp| lp.is_index()).count() as u32;
    }
    // the old journal no longer matches the rewritten index: start a
    // fresh commit in the log
    fs.mst.cmt_no += 1;
    for lnum in LOG_LNUM..LOG_LNUM + fs.sb.log_lebs {
        sess.vol.leb_unmap(lnum)?;
    }
    sqnum += 1;
    let cs = CsNode {
        ch: CommonHdr::synth(NodeType::Cs, sqnum),
        cmt_no: fs.mst.cmt_no,
    };
    sess.vol.leb_change(LOG_LNUM, &cs.encode())?;
    fs.mst.log_lnum = LOG_LNUM;
    // last write wins it all: the master node, both copies
    sqnum += 1;
    fs.mst.ch = CommonHdr::synth(NodeType::Mst, sqnum);
    let image = fs.mst.encode();
    for lnum in MST_LNUM..MST_LNUM + MST_LEBS {
        sess.vol.leb_change(lnum, &image)?;
    }
    info!("committed repairs (commit {})", fs.mst.cmt_no);
    Ok(())
}

/// Write the surviving leaves into a fresh index in empty LEBs; the old
/// index LEBs become reclaimable afterwards
fn commit_index(sess: &mut Session, fs: &mut LoadedFs, sqnum: &mut u64) -> RuntimeResult<()> {
    let leaves = fs.tnc.collect_leaves(&mut *sess.vol)?;
    if leaves.is_empty() {
        sess.handle_problem(&Problem::EmptyTnc)?;
        unreachable!("an empty index always escalates");
    }
    let all = fs.lpt.all(&mut *sess.vol)?;
    let main_first = fs.geom.main_first;
    let old_idx: Vec<(u32, u32)> = all
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_index())
        .map(|(i, lp)| (main_first + i as u32, lp.free))
        .collect();
    let free: Vec<u32> = all
        .iter()
        .enumerate()
        .filter(|&(i, lp)| {
            let lnum = main_first + i as u32;
            lp.free == fs.geom.leb_size && !lp.is_index() && lnum != fs.mst.gc_lnum
        })
        .map(|(i, _)| main_first + i as u32)
        .collect();
    let built = build_index(
        &mut *sess.vol,
        fs.sb.fanout as usize,
        &leaves,
        free,
        sqnum,
    )?;
    // new index LEBs fill up, old ones turn into pure dirt
    for &(lnum, used) in &built.lebs_used {
        fs.lpt.change_one(
            &mut *sess.vol,
            lnum,
            fs.geom.leb_size - used,
            0,
            LPROPS_INDEX,
        )?;
    }
    for (lnum, old_free) in old_idx {
        fs.lpt.change_one(
            &mut *sess.vol,
            lnum,
            old_free,
            fs.geom.leb_size - old_free,
            LPROPS_INDEX,
        )?;
    }
    fs.mst.root_lnum = built.root.lnum;
    fs.mst.root_offs = built.root.offs;
    fs.mst.root_len = built.root.len;
    fs.mst.index_size = built.index_size;
    fs.mst.ihead_lnum = built.ihead.0;
    fs.mst.ihead_offs = built.ihead.1;
    fs.tnc.set_committed(built.root);
    fs.mst_dirty = true;
    debug!(
        "index committed: root {}:{}, {} bytes",
        built.root.lnum, built.root.offs, built.index_size
    );
    Ok(())
}
