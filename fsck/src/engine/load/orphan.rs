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

//! The orphan area names inodes whose last link went away without the
//! inode being deleted (an unlink of an open file, interrupted). They
//! are scheduled for deletion once the mount is complete.

use {
    super::LoadedFs,
    crate::engine::{
        dev::read_leb,
        error::{Reason, RuntimeResult},
        ondisk::{Key, Node, ROOT_INO},
        problem::Problem,
        scan::{scan_leb, SlebEnd},
        session::Session,
    },
    log::{debug, warn},
};

pub fn read_orphans(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    let mut orphans = Vec::new();
    for lnum in fs.geom.orph_first..fs.geom.orph_first + fs.geom.orph_lebs {
        let buf = read_leb(&mut *sess.vol, lnum)?;
        let sleb = scan_leb(lnum, &buf);
        let mut bad = sleb.end != SlebEnd::EmptySpace;
        for sn in &sleb.nodes {
            match &sn.node {
                Node::Orph(orph) => {
                    debug!(
                        "orphan node at {}:{}: commit {}, last {}",
                        lnum,
                        sn.offs,
                        orph.commit_no(),
                        orph.is_last()
                    );
                    for &ino in &orph.inos {
                        if ino < ROOT_INO as u64 || ino > u32::MAX as u64 {
                            bad = true;
                            continue;
                        }
                        orphans.push(ino as u32);
                    }
                }
                other => {
                    warn!("orphan LEB {} holds a stray {}", lnum, other.node_type());
                    bad = true;
                }
            }
        }
        if bad {
            sess.reasons.set(Reason::DataCorrupted);
            let fix = sess.handle_problem(&Problem::OrphanCorrupted { lnum })?;
            sess.reasons.clear(Reason::DataCorrupted);
            if fix {
                // the orphan area is advisory: dropping it only delays
                // space reclamation of half-deleted files
                sess.vol.leb_unmap(lnum)?;
                continue;
            }
        }
    }
    orphans.sort_unstable();
    orphans.dedup();
    debug!("{} orphan inodes scheduled for deletion", orphans.len());
    fs.orphans = orphans;
    Ok(())
}

/// Post-mount: delete every orphan from the index; their space turns
/// dirty and the space check accounts it
pub fn apply_orphans(sess: &mut Session, fs: &mut LoadedFs) -> RuntimeResult<()> {
    for inum in std::mem::take(&mut fs.orphans) {
        debug!("deleting orphan inode {}", inum);
        let (from, to) = Key::ino_range(inum);
        fs.tnc.remove_range(&mut *sess.vol, from, to)?;
    }
    Ok(())
}
