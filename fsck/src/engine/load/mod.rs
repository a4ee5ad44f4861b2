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

//! # The loader
//!
//! Brings a volume up to a mountable in-memory state in fixed stages:
//! device constants, superblock, master node, LPT root, the space
//! fix-up pass, journal replay, orphans. Every stage that trips over
//! corruption routes its finding through the problem policy; approved
//! escalations unwind into the scavenging rebuilder.

pub mod log;
pub mod orphan;
#[cfg(test)]
mod tests;

use {
    crate::{
        engine::{
            dev::read_leb,
            error::{Error, Reason, RuntimeResult},
            lpt::{calc_lpt_geom, Lpt, LptGeom},
            ondisk::{
                self,
                node::{MstNode, SbNode},
                Node, FMT_VERSION, MIN_IO_SZ, MIN_LEB_CNT, MIN_LEB_SZ, MST_LEBS, MST_LNUM,
                ROOT_INO, SB_LNUM, SB_NODE_SZ,
            },
            problem::{Mode, Problem},
            scan::{scan_leb, SlebEnd},
            session::Session,
            tnc::{Loc, Tnc},
        },
        util::align_up,
    },
    ::log::{debug, info, warn},
    libfsck::EXIT_ERROR,
};

/// The filesystem after a successful mount: everything the consistency
/// engine works against
#[derive(Debug)]
pub struct LoadedFs {
    pub sb: SbNode,
    pub mst: MstNode,
    pub geom: LptGeom,
    pub tnc: Tnc,
    pub lpt: Lpt,
    /// The LPT failed to parse; the space check must regenerate it
    pub lpt_broken: bool,
    /// Highest sequence number seen anywhere; new writes continue above
    pub max_sqnum: u64,
    pub highest_inum: u32,
    /// Files whose last link vanished without inode deletion; deleted
    /// after mount
    pub orphans: Vec<u32>,
    /// Journal buds that were replayed, youngest commit only
    pub buds: Vec<log::Bud>,
    /// The master node must be rewritten at commit
    pub mst_dirty: bool,
}

/// Stage 1 to 8 bring-up
pub fn mount(sess: &mut Session) -> RuntimeResult<LoadedFs> {
    // stage 1: early constants
    let info = sess.vol.info();
    if info.min_io_size < MIN_IO_SZ
        || !info.min_io_size.is_power_of_two()
        || info.leb_size < MIN_LEB_SZ
        || info.leb_cnt < MIN_LEB_CNT
    {
        ::log::error!(
            "device geometry unusable: {} LEBs of {} bytes, min I/O {}",
            info.leb_cnt,
            info.leb_size,
            info.min_io_size
        );
        sess.exit_code |= EXIT_ERROR;
        return Err(Error::abort());
    }
    // stage 2: superblock
    let sb = read_superblock(sess)?;
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
    // stage 3: master node
    let (mst, mst_dirty) = read_master(sess, &geom)?;
    // stage 4: LPT root
    let mut lpt = Lpt::from_master(geom, mst.lpt_lnum, mst.lpt_offs);
    let lpt_broken = match probe_lpt(sess, &mut lpt, &mst, &geom) {
        Ok(()) => false,
        Err(e) if matches!(e.kind(), crate::engine::error::ErrorKind::Corrupt(_)) => {
            sess.reasons.set(Reason::LptCorrupted);
            sess.handle_problem(&Problem::LptCorrupted)?;
            sess.reasons.clear(Reason::LptCorrupted);
            true
        }
        Err(e) => return Err(e),
    };
    let mut fs = LoadedFs {
        tnc: Tnc::from_root(
            sb.fanout as usize,
            Loc::new(mst.root_lnum, mst.root_offs, mst.root_len),
        ),
        max_sqnum: mst.ch.sqnum,
        highest_inum: mst.highest_inum.min(u32::MAX as u64) as u32,
        orphans: Vec::new(),
        buds: Vec::new(),
        lpt,
        lpt_broken,
        mst_dirty,
        sb,
        mst,
        geom,
    };
    // stage 5: space fix-up
    if fs.sb.space_fixup() {
        fixup_space(sess, &mut fs)?;
    }
    // stage 6: journal replay
    log::replay(sess, &mut fs)?;
    // stage 7: orphans
    orphan::read_orphans(sess, &mut fs)?;
    // stage 8: log consolidation happens at commit time, when the
    // journal state actually changes
    info!(
        "mounted: {} main LEBs, highest inode {}, commit {}",
        fs.geom.main_lebs, fs.highest_inum, fs.mst.cmt_no
    );
    Ok(fs)
}

/*
    stage 2: superblock
*/

pub(in crate::engine) fn read_superblock(sess: &mut Session) -> RuntimeResult<SbNode> {
    let mut buf = vec![0u8; SB_NODE_SZ];
    sess.vol.leb_read(SB_LNUM, 0, &mut buf)?;
    let sb = match ondisk::parse_node(&buf, SB_LNUM, 0) {
        Ok(Node::Sb(sb)) => sb,
        Ok(other) => {
            warn!("superblock LEB holds a {}", other.node_type());
            sess.handle_problem(&Problem::SbCorrupted)?;
            unreachable!("superblock corruption is not fixable")
        }
        Err(e) => {
            warn!("superblock does not parse: {}", e);
            sess.handle_problem(&Problem::SbCorrupted)?;
            unreachable!("superblock corruption is not fixable")
        }
    };
    let info = sess.vol.info();
    if sb.leb_size != info.leb_size || sb.leb_cnt > info.leb_cnt {
        warn!(
            "superblock geometry ({} x {}) disagrees with the device ({} x {})",
            sb.leb_cnt, sb.leb_size, info.leb_cnt, info.leb_size
        );
        sess.handle_problem(&Problem::SbCorrupted)?;
    }
    if !sess.auth.verify_superblock(&sb)? {
        ::log::error!("volume requires authentication");
        sess.exit_code |= EXIT_ERROR;
        return Err(Error::abort());
    }
    if sb.fmt_version > FMT_VERSION {
        if sb.ro_compat_version > FMT_VERSION {
            ::log::error!(
                "on-flash format {} (r/o compatible {}) is not supported",
                sb.fmt_version,
                sb.ro_compat_version
            );
            sess.exit_code |= EXIT_ERROR;
            return Err(Error::abort());
        }
        if sess.mode != Mode::Check {
            warn!(
                "format {} is only read-compatible; forcing check mode",
                sb.fmt_version
            );
            sess.mode = Mode::Check;
        }
    }
    debug!(
        "superblock: fmt {}, uuid {}, {} LEBs, log {}, lpt {}, orph {}, fanout {}",
        sb.fmt_version,
        uuid::Uuid::from_bytes(sb.uuid),
        sb.leb_cnt,
        sb.log_lebs,
        sb.lpt_lebs,
        sb.orph_lebs,
        sb.fanout
    );
    Ok(sb)
}

/*
    stage 3: master node
*/

/// Both master LEBs hold a run of appended master nodes; the youngest
/// intact node wins and the other copy is checked against it
fn read_master(sess: &mut Session, geom: &LptGeom) -> RuntimeResult<(MstNode, bool)> {
    let mut best: Option<MstNode> = None;
    let mut copies_disagree = false;
    for lnum in MST_LNUM..MST_LNUM + MST_LEBS {
        let buf = read_leb(&mut *sess.vol, lnum)?;
        let sleb = scan_leb(lnum, &buf);
        if sleb.end != SlebEnd::EmptySpace {
            warn!("master LEB {} is damaged past offset {}", lnum, sleb.endpt);
        }
        let last = sleb.nodes.iter().rev().find_map(|sn| match &sn.node {
            Node::Mst(m) => Some(m.clone()),
            _ => None,
        });
        match (&mut best, last) {
            (None, Some(m)) => best = Some(m),
            (Some(b), Some(m)) => {
                if m.ch.sqnum > b.ch.sqnum {
                    copies_disagree = true;
                    *b = m;
                } else if m.cmt_no != b.cmt_no || m.root_lnum != b.root_lnum {
                    copies_disagree = true;
                }
            }
            (_, None) => copies_disagree = true,
        }
    }
    let mst = match best {
        Some(m) if master_is_plausible(&m, geom) => m,
        _ => {
            sess.reasons.set(Reason::DataCorrupted);
            sess.handle_problem(&Problem::MstCorrupted)?;
            // not fixable in place: only the rebuild path continues
            return Err(Error::need_rebuild());
        }
    };
    if copies_disagree {
        warn!("master copies disagree; the newer one wins and will be rewritten");
    }
    Ok((mst, copies_disagree))
}

fn master_is_plausible(mst: &MstNode, geom: &LptGeom) -> bool {
    let main_end = geom.main_first + geom.main_lebs;
    okay! {
        mst.leb_cnt == geom.leb_cnt,
        mst.log_lnum >= ondisk::LOG_LNUM,
        mst.log_lnum < geom.lpt_first,
        mst.root_lnum >= geom.main_first,
        mst.root_lnum < main_end,
        mst.root_len as usize >= ondisk::IDX_NODE_SZ,
        mst.lpt_lnum >= geom.lpt_first,
        mst.lpt_lnum < geom.orph_first,
        mst.highest_inum >= ROOT_INO as u64,
    }
}

/// Fault the LPT root path and pull in the region accounting tables;
/// any parse failure here condemns the whole LPT
fn probe_lpt(
    sess: &mut Session,
    lpt: &mut Lpt,
    mst: &MstNode,
    geom: &LptGeom,
) -> RuntimeResult<()> {
    lpt.lookup(&mut *sess.vol, geom.main_first)?;
    lpt.ltab = crate::engine::lpt::pack::read_ltab(
        &mut *sess.vol,
        geom,
        mst.ltab_lnum,
        mst.ltab_offs,
    )?;
    if geom.big_lpt {
        lpt.lsave = crate::engine::lpt::pack::read_lsave(
            &mut *sess.vol,
            geom,
            mst.lsave_lnum,
            mst.lsave_offs,
        )?;
    }
    Ok(())
}

/*
    stage 5: space fix-up
*/

/// Rewrite every non-empty LEB whole — master, log, LPT, orphan and
/// main areas alike — so that half-programmed min-I/O units can never
/// read back as garbage, then drop the flag from the superblock
fn fixup_space(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    if sess.read_only() {
        warn!("volume wants the space fix-up but this is a read-only run");
        return Ok(());
    }
    info!("running the space fix-up");
    let min_io = fs.geom.min_io_size;
    for lnum in MST_LNUM..fs.geom.main_first + fs.geom.main_lebs {
        let buf = read_leb(&mut *sess.vol, lnum)?;
        // content ends at the last programmed byte; the LPT region is
        // bit-packed, so byte inspection is the only safe measure here
        let end = match buf.iter().rposition(|&b| b != ondisk::ERASED_BYTE) {
            Some(pos) => pos as u32 + 1,
            None => continue,
        };
        let used = align_up(end, min_io).min(fs.geom.leb_size) as usize;
        sess.vol.leb_change(lnum, &buf[..used])?;
    }
    fs.sb.flags &= !ondisk::SB_FL_SPACE_FIXUP;
    let image = fs.sb.encode();
    sess.vol.leb_change(SB_LNUM, &image)?;
    Ok(())
}
