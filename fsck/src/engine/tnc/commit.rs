/*
 * Created on Mon Apr 15 2024
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

//! Bottom-up index writer. The leaves stay where they are on flash; only
//! the index nodes are produced, `fanout` branches at a time, level by
//! level until a single root remains. Both the checker's commit and the
//! scavenging rebuilder funnel through this.

use {
    super::Loc,
    crate::{
        engine::{
            dev::Volume,
            error::{DeviceError, RuntimeResult},
            ondisk::{
                node::{Branch, IdxNode},
                CommonHdr, Key, NodeType, ERASED_BYTE,
            },
        },
        util::align8,
    },
    log::debug,
};

#[derive(Debug, Clone, PartialEq)]
/// What came out of an index build
pub struct BuiltIndex {
    pub root: Loc,
    /// Sum of the 8-byte-aligned sizes of every index node written
    pub index_size: u64,
    /// `(lnum, bytes used)` for every LEB that now holds index nodes
    pub lebs_used: Vec<(u32, u32)>,
    /// Where index writes would continue (the index head)
    pub ihead: (u32, u32),
}

/// Packs index nodes into whole-LEB images and flushes each with an
/// atomic LEB change
struct IdxOut<'a> {
    vol: &'a mut dyn Volume,
    free_lebs: std::vec::IntoIter<u32>,
    cur: Option<(u32, Vec<u8>)>,
    leb_size: usize,
    lebs_used: Vec<(u32, u32)>,
    index_size: u64,
}

impl<'a> IdxOut<'a> {
    fn put(&mut self, bytes: &[u8]) -> RuntimeResult<Loc> {
        let aligned = align8(bytes.len() as u32) as usize;
        if self
            .cur
            .as_ref()
            .map_or(true, |(_, buf)| buf.len() + aligned > self.leb_size)
        {
            self.flush()?;
            let lnum = self.free_lebs.next().ok_or(DeviceError::OutOfBounds)?;
            self.cur = Some((lnum, Vec::with_capacity(self.leb_size)));
        }
        let (lnum, buf) = self.cur.as_mut().unwrap();
        let offs = buf.len() as u32;
        buf.extend_from_slice(bytes);
        buf.resize(offs as usize + aligned, ERASED_BYTE);
        self.index_size += aligned as u64;
        Ok(Loc::new(*lnum, offs, bytes.len() as u32))
    }
    fn flush(&mut self) -> RuntimeResult<()> {
        if let Some((lnum, buf)) = self.cur.take() {
            debug!("index LEB {}: {} bytes", lnum, buf.len());
            self.vol.leb_change(lnum, &buf)?;
            self.lebs_used.push((lnum, buf.len() as u32));
        }
        Ok(())
    }
}

/// Build and write a fresh index over the given leaves (already in key
/// order; equal keys in name order). `free_lebs` must be erased or
/// expendable main LEBs.
pub fn build_index(
    vol: &mut dyn Volume,
    fanout: usize,
    leaves: &[(Key, Loc)],
    free_lebs: Vec<u32>,
    sqnum: &mut u64,
) -> RuntimeResult<BuiltIndex> {
    debug_assert!(!leaves.is_empty());
    debug_assert!(leaves.windows(2).all(|w| w[0].0 <= w[1].0));
    let leb_size = vol.info().leb_size as usize;
    let min_io = vol.info().min_io_size;
    let mut out = IdxOut {
        vol,
        free_lebs: free_lebs.into_iter(),
        cur: None,
        leb_size,
        lebs_used: Vec::new(),
        index_size: 0,
    };
    // level 0 references the leaves themselves
    let mut level: u16 = 0;
    let mut this_level: Vec<(Key, Loc)> = Vec::with_capacity(leaves.len().div_ceil(fanout));
    for chunk in leaves.chunks(fanout) {
        let loc = write_idx(&mut out, level, chunk, sqnum)?;
        this_level.push((chunk[0].0, loc));
    }
    // fold upwards until one node remains
    while this_level.len() > 1 {
        level += 1;
        let mut next_level = Vec::with_capacity(this_level.len().div_ceil(fanout));
        for chunk in this_level.chunks(fanout) {
            let loc = write_idx(&mut out, level, chunk, sqnum)?;
            next_level.push((chunk[0].0, loc));
        }
        this_level = next_level;
    }
    out.flush()?;
    let root = this_level[0].1;
    let (ihead_lnum, ihead_end) = *out.lebs_used.last().unwrap();
    Ok(BuiltIndex {
        root,
        index_size: out.index_size,
        lebs_used: out.lebs_used.clone(),
        ihead: (ihead_lnum, crate::util::align_up(ihead_end, min_io)),
    })
}

fn write_idx(
    out: &mut IdxOut<'_>,
    level: u16,
    children: &[(Key, Loc)],
    sqnum: &mut u64,
) -> RuntimeResult<Loc> {
    *sqnum += 1;
    let idx = IdxNode {
        ch: CommonHdr::synth(NodeType::Idx, *sqnum),
        level,
        branches: children
            .iter()
            .map(|&(key, loc)| Branch {
                lnum: loc.lnum,
                offs: loc.offs,
                len: loc.len,
                key,
            })
            .collect(),
    };
    out.put(&idx.encode())
}

/// How many LEBs an index over `leaf_cnt` leaves can need, worst case;
/// used to reserve space before building
pub fn worst_case_idx_lebs(leaf_cnt: usize, fanout: usize, leb_size: u32) -> usize {
    let mut nodes = 0usize;
    let mut width = leaf_cnt.max(1);
    loop {
        width = width.div_ceil(fanout);
        nodes += width;
        if width == 1 {
            break;
        }
    }
    let per_leb = (leb_size as usize) / align8(crate::engine::ondisk::idx_node_sz(fanout) as u32) as usize;
    nodes.div_ceil(per_leb.max(1)) + 1
}
