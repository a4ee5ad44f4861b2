/*
 * Created on Tue Apr 23 2024
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

//! # LPT — the LEB properties tree
//!
//! A wide tree over the main area: internal nnodes fan out four ways,
//! leaf pnodes hold the `{free, dirty, flags}` triple of four
//! consecutive main LEBs. On flash the nodes are bit-packed ([`pack`])
//! with a CRC-16 up front. In memory the tree faults in lazily and
//! carries dirt upward the same way the TNC does.
//!
//! Categorized LEBs are kept in bounded per-category heaps (dirty,
//! dirty-index, free) and plain lists (empty, freeable, frdi, uncat) so
//! allocation and garbage collection can pick victims quickly.

pub mod pack;
#[cfg(test)]
mod tests;

pub use pack::{calc_lpt_geom, create_lpt, LptGeom, LptRoots};

use crate::engine::{
    dev::Volume,
    error::{Error, Reason, RuntimeResult},
};

/*
    properties
*/

consts! {
    pub LPROPS_UNCAT: u32 = 0;
    pub LPROPS_DIRTY: u32 = 1;
    pub LPROPS_DIRTY_IDX: u32 = 2;
    pub LPROPS_FREE: u32 = 3;
    pub LPROPS_EMPTY: u32 = 4;
    pub LPROPS_FREEABLE: u32 = 5;
    pub LPROPS_FRDI_IDX: u32 = 6;
    pub LPROPS_CAT_MASK: u32 = 15;
    /// The LEB is reserved by some ongoing operation
    pub LPROPS_TAKEN: u32 = 16;
    /// The LEB holds index nodes
    pub LPROPS_INDEX: u32 = 32;
    /// Bound on every category heap
    pub LPT_HEAP_SZ: usize = 256;
    /// LPT fanout: pnodes hold this many LEBs, nnodes this many children
    pub FANOUT: usize = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lprops {
    pub free: u32,
    pub dirty: u32,
    pub flags: u32,
}

impl Lprops {
    pub const fn new(free: u32, dirty: u32, flags: u32) -> Self {
        Self { free, dirty, flags }
    }
    pub fn cat(&self) -> u32 {
        self.flags & LPROPS_CAT_MASK
    }
    pub fn is_index(&self) -> bool {
        self.flags & LPROPS_INDEX != 0
    }
    pub fn is_taken(&self) -> bool {
        self.flags & LPROPS_TAKEN != 0
    }
    pub fn used(&self, leb_size: u32) -> Option<u32> {
        (self.free + self.dirty <= leb_size).then(|| leb_size - self.free - self.dirty)
    }
    /// The arithmetic invariant every entry must satisfy
    pub fn is_sane(&self, leb_size: u32) -> bool {
        okay! {
            self.free <= leb_size,
            self.dirty <= leb_size,
            self.free + self.dirty <= leb_size,
            self.free % 8 == 0,
            self.dirty % 8 == 0 || self.free + self.dirty == leb_size,
        }
    }
}

/// Dead watermark: dirt below this is unreclaimable by garbage
/// collection, so such LEBs do not categorize as dirty
pub fn dead_watermark(min_io_size: u32) -> u32 {
    crate::util::align_up(crate::engine::ondisk::DATA_NODE_SZ as u32 + 8, min_io_size)
}

/// Compute the category a set of properties falls into
pub fn categorize(lp: &Lprops, leb_size: u32, dead_wm: u32) -> u32 {
    if lp.is_index() {
        if lp.free + lp.dirty == leb_size {
            LPROPS_FRDI_IDX
        } else if lp.dirty >= dead_wm {
            LPROPS_DIRTY_IDX
        } else {
            LPROPS_UNCAT
        }
    } else if lp.free == leb_size {
        LPROPS_EMPTY
    } else if lp.free + lp.dirty == leb_size {
        LPROPS_FREEABLE
    } else if lp.dirty >= dead_wm {
        LPROPS_DIRTY
    } else if lp.free > 0 {
        LPROPS_FREE
    } else {
        LPROPS_UNCAT
    }
}

/*
    category heaps
*/

#[derive(Debug, Default)]
/// A bounded max-heap of `(value, lnum)`; evicted LEBs fall back to the
/// uncategorized list
pub struct LpHeap {
    arr: Vec<(u32, u32)>,
}

impl LpHeap {
    pub fn len(&self) -> usize {
        self.arr.len()
    }
    pub fn is_empty(&self) -> bool {
        self.arr.is_empty()
    }
    pub fn peek(&self) -> Option<(u32, u32)> {
        self.arr.first().copied()
    }
    /// Push; on overflow the smallest element is evicted and returned
    pub fn push(&mut self, value: u32, lnum: u32) -> Option<u32> {
        let mut evicted = None;
        if self.arr.len() == LPT_HEAP_SZ {
            let (weak_i, _) = self
                .arr
                .iter()
                .enumerate()
                .min_by_key(|(_, &(v, _))| v)
                .unwrap();
            if self.arr[weak_i].0 >= value {
                return Some(lnum);
            }
            evicted = Some(self.arr.swap_remove(weak_i).1);
            self.rebuild();
        }
        self.arr.push((value, lnum));
        self.sift_up(self.arr.len() - 1);
        evicted
    }
    pub fn pop(&mut self) -> Option<(u32, u32)> {
        if self.arr.is_empty() {
            return None;
        }
        let top = self.arr.swap_remove(0);
        self.sift_down(0);
        Some(top)
    }
    pub fn remove(&mut self, lnum: u32) -> bool {
        match self.arr.iter().position(|&(_, l)| l == lnum) {
            Some(i) => {
                self.arr.swap_remove(i);
                self.rebuild();
                true
            }
            None => false,
        }
    }
    pub fn contains(&self, lnum: u32) -> bool {
        self.arr.iter().any(|&(_, l)| l == lnum)
    }
    fn rebuild(&mut self) {
        for i in (0..self.arr.len() / 2).rev() {
            self.sift_down(i);
        }
    }
    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.arr[parent].0 >= self.arr[i].0 {
                break;
            }
            self.arr.swap(parent, i);
            i = parent;
        }
    }
    fn sift_down(&mut self, mut i: usize) {
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut biggest = i;
            if l < self.arr.len() && self.arr[l].0 > self.arr[biggest].0 {
                biggest = l;
            }
            if r < self.arr.len() && self.arr[r].0 > self.arr[biggest].0 {
                biggest = r;
            }
            if biggest == i {
                return;
            }
            self.arr.swap(i, biggest);
            i = biggest;
        }
    }
}

#[derive(Debug, Default)]
/// The category bookkeeping over all main LEBs
pub struct LpCats {
    pub free: LpHeap,
    pub dirty: LpHeap,
    pub dirty_idx: LpHeap,
    pub empty: Vec<u32>,
    pub freeable: Vec<u32>,
    pub frdi_idx: Vec<u32>,
    pub uncat: Vec<u32>,
}

impl LpCats {
    pub fn add(&mut self, lnum: u32, lp: &Lprops, leb_size: u32, dead_wm: u32) {
        let spilled = match categorize(lp, leb_size, dead_wm) {
            LPROPS_EMPTY => {
                self.empty.push(lnum);
                None
            }
            LPROPS_FREEABLE => {
                self.freeable.push(lnum);
                None
            }
            LPROPS_FRDI_IDX => {
                self.frdi_idx.push(lnum);
                None
            }
            LPROPS_FREE => self.free.push(lp.free, lnum),
            LPROPS_DIRTY => self.dirty.push(lp.dirty, lnum),
            LPROPS_DIRTY_IDX => self.dirty_idx.push(lp.dirty, lnum),
            _ => Some(lnum),
        };
        if let Some(lnum) = spilled {
            self.uncat.push(lnum);
        }
    }
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/*
    the tree
*/

#[derive(Debug, Clone)]
pub(super) struct Pnode {
    pub lprops: [Lprops; FANOUT],
    pub dirty: bool,
}

#[derive(Debug)]
pub(super) struct Nnode {
    pub nbranch: [NBranch; FANOUT],
    pub dirty: bool,
}

#[derive(Debug, Default)]
pub(super) struct NBranch {
    pub lnum: u32,
    pub offs: u32,
    pub child: Option<Box<LptChild>>,
}

#[derive(Debug)]
pub(super) enum LptChild {
    Nnode(Nnode),
    Pnode(Pnode),
}

#[derive(Debug)]
pub struct Lpt {
    pub geom: LptGeom,
    root_lnum: u32,
    root_offs: u32,
    root: Option<Nnode>,
    dirty: bool,
    /// Per-LPT-LEB accounting, parallel to the lpt region
    pub ltab: Vec<Lprops>,
    pub lsave: Vec<u32>,
    pub cats: LpCats,
}

impl Lpt {
    /// An LPT rooted where the master says; nothing is read yet
    pub fn from_master(geom: LptGeom, root_lnum: u32, root_offs: u32) -> Self {
        Self {
            geom,
            root_lnum,
            root_offs,
            root: None,
            dirty: false,
            ltab: Vec::new(),
            lsave: Vec::new(),
            cats: LpCats::default(),
        }
    }
    /// A fully in-memory LPT over the given properties; used by the
    /// rebuilder before anything is written
    pub fn from_lprops(geom: LptGeom, all: &[Lprops]) -> Self {
        debug_assert_eq!(all.len(), geom.main_lebs as usize);
        let mut lpt = Self::from_master(geom, 0, 0);
        lpt.dirty = true;
        lpt.root = Some(lpt.build_mem_tree(all));
        lpt
    }
    fn build_mem_tree(&self, all: &[Lprops]) -> Nnode {
        // pnode leaves first, then fold one nnode level per unit of
        // geometry height; the geometry guarantees a single root remains
        let mut children: Vec<LptChild> = all
            .chunks(FANOUT)
            .map(|chunk| {
                let mut lprops = [Lprops::default(); FANOUT];
                lprops[..chunk.len()].copy_from_slice(chunk);
                LptChild::Pnode(Pnode {
                    lprops,
                    dirty: true,
                })
            })
            .collect();
        for _ in 0..self.geom.lpt_hght {
            children = children
                .chunks_mut(FANOUT)
                .map(|chunk| {
                    let mut nnode = Nnode {
                        nbranch: Default::default(),
                        dirty: true,
                    };
                    for (i, child) in chunk.iter_mut().enumerate() {
                        let taken = std::mem::replace(
                            child,
                            LptChild::Pnode(Pnode {
                                lprops: [Lprops::default(); FANOUT],
                                dirty: false,
                            }),
                        );
                        nnode.nbranch[i].child = Some(Box::new(taken));
                    }
                    LptChild::Nnode(nnode)
                })
                .collect();
        }
        debug_assert_eq!(children.len(), 1);
        match children.pop().unwrap() {
            LptChild::Nnode(n) => n,
            LptChild::Pnode(_) => unreachable!(),
        }
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /*
        lookup and change
    */

    /// Properties of one main-area LEB
    pub fn lookup(&mut self, vol: &mut dyn Volume, lnum: u32) -> RuntimeResult<Lprops> {
        let (pnode, slot) = self.pnode_for(vol, lnum, false)?;
        Ok(pnode.lprops[slot])
    }
    /// Like [`Lpt::lookup`] but dirties the whole path so a commit will
    /// rewrite it
    pub fn lookup_dirty(
        &mut self,
        vol: &mut dyn Volume,
        lnum: u32,
    ) -> RuntimeResult<&mut Lprops> {
        self.dirty = true;
        let (pnode, slot) = self.pnode_for(vol, lnum, true)?;
        pnode.dirty = true;
        Ok(&mut pnode.lprops[slot])
    }
    /// Replace the properties of one LEB
    pub fn change_one(
        &mut self,
        vol: &mut dyn Volume,
        lnum: u32,
        free: u32,
        dirty: u32,
        flags: u32,
    ) -> RuntimeResult<()> {
        let lp = self.lookup_dirty(vol, lnum)?;
        *lp = Lprops::new(free, dirty, flags);
        Ok(())
    }
    /// Adjust the properties of one LEB by deltas
    pub fn update_one(
        &mut self,
        vol: &mut dyn Volume,
        lnum: u32,
        dfree: i64,
        ddirty: i64,
        set_flags: u32,
        clear_flags: u32,
    ) -> RuntimeResult<()> {
        let lp = self.lookup_dirty(vol, lnum)?;
        lp.free = (lp.free as i64 + dfree).max(0) as u32;
        lp.dirty = (lp.dirty as i64 + ddirty).max(0) as u32;
        lp.flags = (lp.flags | set_flags) & !clear_flags;
        Ok(())
    }
    /// Read every main LEB's properties in order
    pub fn all(&mut self, vol: &mut dyn Volume) -> RuntimeResult<Vec<Lprops>> {
        (self.geom.main_first..self.geom.main_first + self.geom.main_lebs)
            .map(|lnum| self.lookup(vol, lnum))
            .collect()
    }
    /// Drop and regenerate the category heaps and lists
    pub fn recategorize(&mut self, vol: &mut dyn Volume) -> RuntimeResult<()> {
        let leb_size = self.geom.leb_size;
        let dead_wm = dead_watermark(self.geom.min_io_size);
        let main_first = self.geom.main_first;
        let all = self.all(vol)?;
        self.cats.clear();
        for (i, lp) in all.iter().enumerate() {
            self.cats.add(main_first + i as u32, lp, leb_size, dead_wm);
        }
        Ok(())
    }

    fn pnode_for(
        &mut self,
        vol: &mut dyn Volume,
        lnum: u32,
        dirtying: bool,
    ) -> RuntimeResult<(&mut Pnode, usize)> {
        let geom = self.geom;
        if lnum < geom.main_first || lnum >= geom.main_first + geom.main_lebs {
            return Err(Error::from(Reason::LptIncorrect).at(lnum, 0));
        }
        let i = lnum - geom.main_first;
        if self.root.is_none() {
            self.root = Some(pack::read_nnode(vol, &geom, self.root_lnum, self.root_offs)?);
        }
        let root = self.root.as_mut().unwrap();
        let mut node: &mut Nnode = root;
        let mut height = geom.lpt_hght;
        loop {
            if dirtying {
                node.dirty = true;
            }
            let slot = ((i >> (height * 2)) & 3) as usize;
            let br = &mut node.nbranch[slot];
            if br.child.is_none() {
                let child = if height > 1 {
                    LptChild::Nnode(pack::read_nnode(vol, &geom, br.lnum, br.offs)?)
                } else {
                    LptChild::Pnode(pack::read_pnode(vol, &geom, br.lnum, br.offs)?)
                };
                br.child = Some(Box::new(child));
            }
            match br.child.as_mut().unwrap().as_mut() {
                LptChild::Nnode(n) => {
                    node = n;
                    height -= 1;
                }
                LptChild::Pnode(p) => {
                    if dirtying {
                        p.dirty = true;
                    }
                    return Ok((p, (i & 3) as usize));
                }
            }
        }
    }
}
