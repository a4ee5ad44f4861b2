/*
 * Created on Sun Apr 07 2024
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

//! # TNC — the tree of node caches
//!
//! The on-flash index is a wide B+-tree of index nodes. In memory it is
//! overlaid by znodes which fault in lazily from their flash branches
//! and carry a dirty flag once modified. Leaf branches keep pointing at
//! the on-flash leaf nodes; only index nodes relocate when the index is
//! committed ([`commit`]).
//!
//! Equal keys are legal (name hash collisions), so every operation that
//! cares about identity beyond the key resolves it either by the entry
//! name (`*_nm`) or by the exact flash location ([`Tnc::remove_node`]).

pub mod commit;
#[cfg(test)]
mod tests;

use {
    crate::engine::{
        dev::Volume,
        error::{Error, Reason, RuntimeResult},
        ondisk::{self, node::DentNode, Key, Node},
    },
    core::fmt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Location of a node on flash
pub struct Loc {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
}

impl Loc {
    pub const fn new(lnum: u32, offs: u32, len: u32) -> Self {
        Self { lnum, offs, len }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.lnum, self.offs, self.len)
    }
}

#[derive(Debug)]
struct Zbranch {
    key: Key,
    /// Flash location of the target: the leaf node (level 0) or the
    /// child index node. Kept even when the znode is dirty, since it
    /// still names the committed version.
    loc: Loc,
    child: Option<Box<Znode>>,
}

impl Zbranch {
    fn leaf(key: Key, loc: Loc) -> Self {
        Self {
            key,
            loc,
            child: None,
        }
    }
}

#[derive(Debug)]
struct Znode {
    level: u16,
    dirty: bool,
    branches: Vec<Zbranch>,
}

impl Znode {
    fn new(level: u16) -> Self {
        Self {
            level,
            dirty: true,
            branches: Vec::new(),
        }
    }
    fn min_key(&self) -> Key {
        self.branches.first().map(|b| b.key).unwrap_or(Key::min())
    }
}

/// What the leaf callback of [`Tnc::walk_index`] decides about a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafAction {
    Keep,
    Drop,
}

#[derive(Debug)]
pub struct Tnc {
    fanout: usize,
    root: Option<Box<Znode>>,
    root_loc: Loc,
    dirty: bool,
}

impl Tnc {
    /// An empty index with nothing on flash behind it
    pub fn empty(fanout: usize) -> Self {
        Self {
            fanout,
            root: None,
            root_loc: Loc::new(0, 0, 0),
            dirty: true,
        }
    }
    /// An index rooted at the location the master node names. Nothing is
    /// read yet; znodes fault in on first use.
    pub fn from_root(fanout: usize, root: Loc) -> Self {
        Self {
            fanout,
            root: None,
            root_loc: root,
            dirty: false,
        }
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
    pub fn root_loc(&self) -> Loc {
        self.root_loc
    }
    pub(in crate::engine) fn set_committed(&mut self, root: Loc) {
        self.root_loc = root;
        self.dirty = false;
    }

    /*
        faulting
    */

    fn load_znode(vol: &mut dyn Volume, loc: Loc, want_level: Option<u16>) -> RuntimeResult<Box<Znode>> {
        let node = read_node(vol, loc)?;
        let idx = match node {
            Node::Idx(idx) => idx,
            other => {
                log::error!(
                    "index branch {} points at a {}",
                    loc,
                    other.node_type()
                );
                return Err(Error::from(Reason::TncCorrupted).at(loc.lnum, loc.offs));
            }
        };
        if let Some(want) = want_level {
            if idx.level != want {
                log::error!(
                    "index node {} has level {}, expected {}",
                    loc,
                    idx.level,
                    want
                );
                return Err(Error::from(Reason::TncCorrupted).at(loc.lnum, loc.offs));
            }
        }
        Ok(Box::new(Znode {
            level: idx.level,
            dirty: false,
            branches: idx
                .branches
                .iter()
                .map(|br| Zbranch {
                    key: br.key,
                    loc: Loc::new(br.lnum, br.offs, br.len),
                    child: None,
                })
                .collect(),
        }))
    }
    /// Fault in the root if the index exists on flash but was not
    /// touched yet
    fn root_mut(&mut self, vol: &mut dyn Volume) -> RuntimeResult<Option<&mut Znode>> {
        if self.root.is_none() && self.root_loc.len != 0 {
            self.root = Some(Self::load_znode(vol, self.root_loc, None)?);
        }
        Ok(self.root.as_deref_mut())
    }
    fn child_mut<'a>(
        vol: &mut dyn Volume,
        znode: &'a mut Znode,
        idx: usize,
    ) -> RuntimeResult<&'a mut Znode> {
        let level = znode.level;
        let br = &mut znode.branches[idx];
        if br.child.is_none() {
            br.child = Some(Self::load_znode(vol, br.loc, Some(level - 1))?);
        }
        Ok(br.child.as_deref_mut().unwrap())
    }

    /*
        lookup
    */

    /// Exact-key lookup. With colliding dentry keys this returns one of
    /// the matches; name-aware callers use [`Tnc::lookup_nm`].
    pub fn lookup(&mut self, vol: &mut dyn Volume, key: Key) -> RuntimeResult<Option<Loc>> {
        let mut found = None;
        self.for_each_in_range(vol, key, key, &mut |_, _, loc| {
            found = Some(loc);
            Ok(RangeWalk::Stop)
        })?;
        Ok(found)
    }
    /// Lookup of a dentry or xattr entry by key and full name
    pub fn lookup_nm(
        &mut self,
        vol: &mut dyn Volume,
        key: Key,
        name: &[u8],
    ) -> RuntimeResult<Option<Loc>> {
        let mut found = None;
        self.for_each_in_range(vol, key, key, &mut |vol, _, loc| {
            let dent = read_dent(vol, loc)?;
            if dent.name == name {
                found = Some(loc);
                return Ok(RangeWalk::Stop);
            }
            Ok(RangeWalk::Continue)
        })?;
        Ok(found)
    }
    /// Directory iteration: the entry following `(key, name)` within the
    /// same key type and host inode, in (hash, name) order
    pub fn next_ent(
        &mut self,
        vol: &mut dyn Volume,
        key: Key,
        name: &[u8],
    ) -> RuntimeResult<Option<(Key, Loc, DentNode)>> {
        let to = Key::last_of(key.inum(), key.knd());
        let mut best: Option<(Key, Loc, DentNode)> = None;
        self.for_each_in_range(vol, key, to, &mut |vol, k, loc| {
            let dent = read_dent(vol, loc)?;
            let after_pivot = k > key || (k == key && dent.name.as_slice() > name);
            if after_pivot {
                let better = match &best {
                    None => true,
                    Some((bk, _, bd)) => (k, dent.name.as_slice()) < (*bk, bd.name.as_slice()),
                };
                if better {
                    best = Some((k, loc, dent));
                }
            }
            Ok(RangeWalk::Continue)
        })?;
        Ok(best)
    }
    /// Liveness probe for a leaf node: is this exact instance what the
    /// index references for its key?
    pub fn has_node(&mut self, vol: &mut dyn Volume, key: Key, loc: Loc) -> RuntimeResult<bool> {
        let mut live = false;
        self.for_each_in_range(vol, key, key, &mut |_, _, cand| {
            if cand == loc {
                live = true;
                return Ok(RangeWalk::Stop);
            }
            Ok(RangeWalk::Continue)
        })?;
        Ok(live)
    }
    /// Liveness probe for an index node: does a znode with this first
    /// key live at exactly this location and level?
    pub fn has_idx_node(
        &mut self,
        vol: &mut dyn Volume,
        first_key: Key,
        level: u16,
        lnum: u32,
        offs: u32,
    ) -> RuntimeResult<bool> {
        if self.root_loc.lnum == lnum && self.root_loc.offs == offs {
            return Ok(self.root_loc.len != 0);
        }
        let Some(root) = self.root_mut(vol)? else {
            return Ok(false);
        };
        if root.level == 0 || level >= root.level {
            return Ok(false);
        }
        Self::find_idx_rec(vol, root, first_key, level, lnum, offs)
    }
    /// Descend by key towards the requested level, probing every branch
    /// that could hold it (duplicates can straddle subtrees)
    fn find_idx_rec(
        vol: &mut dyn Volume,
        znode: &mut Znode,
        key: Key,
        level: u16,
        lnum: u32,
        offs: u32,
    ) -> RuntimeResult<bool> {
        for i in candidate_children(znode, key, key) {
            if znode.level == level + 1 {
                let br = &znode.branches[i];
                if br.loc.lnum == lnum && br.loc.offs == offs {
                    return Ok(true);
                }
            } else {
                let child = Self::child_mut(vol, znode, i)?;
                if Self::find_idx_rec(vol, child, key, level, lnum, offs)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Kept outside the impl so the borrow of a single znode is obvious:
/// indices of children whose key range may intersect `[from, to]`
fn candidate_children(znode: &Znode, from: Key, to: Key) -> Vec<usize> {
    let n = znode.branches.len();
    (0..n)
        .filter(|&i| {
            let lo = znode.branches[i].key;
            let hi_excl = znode.branches.get(i + 1).map(|b| b.key);
            lo <= to && hi_excl.map_or(true, |hi| hi >= from)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeWalk {
    Continue,
    Stop,
}

impl Tnc {
    /// In-order walk over all leaf branches with `from <= key <= to`.
    /// The callback may stop the walk early.
    fn for_each_in_range(
        &mut self,
        vol: &mut dyn Volume,
        from: Key,
        to: Key,
        cb: &mut dyn FnMut(&mut dyn Volume, Key, Loc) -> RuntimeResult<RangeWalk>,
    ) -> RuntimeResult<()> {
        if self.root_mut(vol)?.is_none() {
            return Ok(());
        }
        let root = self.root.as_deref_mut().unwrap();
        Self::range_rec(vol, root, from, to, cb)?;
        Ok(())
    }
    fn range_rec(
        vol: &mut dyn Volume,
        znode: &mut Znode,
        from: Key,
        to: Key,
        cb: &mut dyn FnMut(&mut dyn Volume, Key, Loc) -> RuntimeResult<RangeWalk>,
    ) -> RuntimeResult<RangeWalk> {
        if znode.level == 0 {
            for br in &znode.branches {
                if br.key >= from && br.key <= to {
                    if cb(vol, br.key, br.loc)? == RangeWalk::Stop {
                        return Ok(RangeWalk::Stop);
                    }
                }
            }
            return Ok(RangeWalk::Continue);
        }
        for i in candidate_children(znode, from, to) {
            let child = Self::child_mut(vol, znode, i)?;
            if Self::range_rec(vol, child, from, to, cb)? == RangeWalk::Stop {
                return Ok(RangeWalk::Stop);
            }
        }
        Ok(RangeWalk::Continue)
    }
}

/*
    mutation
*/

impl Tnc {
    /// Insert a leaf reference. Among equal keys the new branch lands
    /// after the existing ones.
    pub fn add(&mut self, vol: &mut dyn Volume, key: Key, loc: Loc) -> RuntimeResult<()> {
        self.dirty = true;
        if self.root_mut(vol)?.is_none() {
            let mut root = Znode::new(0);
            root.branches.push(Zbranch::leaf(key, loc));
            self.root = Some(Box::new(root));
            return Ok(());
        }
        let fanout = self.fanout;
        let root = self.root.as_deref_mut().unwrap();
        if let Some((split_key, right)) = Self::insert_rec(vol, root, fanout, key, loc)? {
            // grow a new root
            let old_root = self.root.take().unwrap();
            let mut new_root = Znode::new(old_root.level + 1);
            new_root.branches.push(Zbranch {
                key: old_root.min_key(),
                loc: Loc::new(0, 0, 0),
                child: Some(old_root),
            });
            new_root.branches.push(Zbranch {
                key: split_key,
                loc: Loc::new(0, 0, 0),
                child: Some(right),
            });
            self.root = Some(Box::new(new_root));
        }
        Ok(())
    }
    /// Insert a dentry leaf; the name only matters on hash collisions,
    /// where the new entry is placed after its equal-keyed peers
    pub fn add_nm(
        &mut self,
        vol: &mut dyn Volume,
        key: Key,
        _name: &[u8],
        loc: Loc,
    ) -> RuntimeResult<()> {
        self.add(vol, key, loc)
    }
    fn insert_rec(
        vol: &mut dyn Volume,
        znode: &mut Znode,
        fanout: usize,
        key: Key,
        loc: Loc,
    ) -> RuntimeResult<Option<(Key, Box<Znode>)>> {
        znode.dirty = true;
        if znode.level == 0 {
            let pos = znode.branches.partition_point(|b| b.key <= key);
            znode.branches.insert(pos, Zbranch::leaf(key, loc));
        } else {
            let i = match znode.branches.iter().rposition(|b| b.key <= key) {
                Some(i) => i,
                None => {
                    // smaller than everything here: descend leftmost and
                    // pull the separator key down
                    znode.branches[0].key = key;
                    0
                }
            };
            let child = Self::child_mut(vol, znode, i)?;
            if let Some((split_key, right)) = Self::insert_rec(vol, child, fanout, key, loc)? {
                znode.branches.insert(
                    i + 1,
                    Zbranch {
                        key: split_key,
                        loc: Loc::new(0, 0, 0),
                        child: Some(right),
                    },
                );
            }
        }
        if znode.branches.len() <= fanout {
            return Ok(None);
        }
        // split in the middle; both halves stay dirty
        let mid = znode.branches.len() / 2;
        let right_branches = znode.branches.split_off(mid);
        let right = Box::new(Znode {
            level: znode.level,
            dirty: true,
            branches: right_branches,
        });
        Ok(Some((right.min_key(), right)))
    }
    /// Swap the location a leaf branch points at; used when a leaf node
    /// was rewritten in place or moved
    pub fn replace(
        &mut self,
        vol: &mut dyn Volume,
        key: Key,
        old: Loc,
        new: Loc,
    ) -> RuntimeResult<bool> {
        let done = self.remove_matching(vol, key, key, &mut |_, l| l == old, Some(1))?;
        if done == 0 {
            return Ok(false);
        }
        self.add(vol, key, new)?;
        Ok(true)
    }
    /// Remove one leaf with exactly this key
    pub fn remove(&mut self, vol: &mut dyn Volume, key: Key) -> RuntimeResult<bool> {
        Ok(self.remove_matching(vol, key, key, &mut |_, _| true, Some(1))? == 1)
    }
    /// Remove the entry with this key and name
    pub fn remove_nm(
        &mut self,
        vol: &mut dyn Volume,
        key: Key,
        name: &[u8],
    ) -> RuntimeResult<bool> {
        let loc = match self.lookup_nm(vol, key, name)? {
            Some(loc) => loc,
            None => return Ok(false),
        };
        self.remove_node(vol, key, loc)
    }
    /// Surgically remove the exact instance at `loc`; the consistency
    /// engine uses this to drop a single bad leaf
    pub fn remove_node(&mut self, vol: &mut dyn Volume, key: Key, loc: Loc) -> RuntimeResult<bool> {
        Ok(self.remove_matching(vol, key, key, &mut |_, l| l == loc, Some(1))? == 1)
    }
    /// Remove every leaf with `from <= key <= to`; returns how many went
    pub fn remove_range(
        &mut self,
        vol: &mut dyn Volume,
        from: Key,
        to: Key,
    ) -> RuntimeResult<usize> {
        self.remove_matching(vol, from, to, &mut |_, _| true, None)
    }
    fn remove_matching(
        &mut self,
        vol: &mut dyn Volume,
        from: Key,
        to: Key,
        pred: &mut dyn FnMut(Key, Loc) -> bool,
        limit: Option<usize>,
    ) -> RuntimeResult<usize> {
        if self.root_mut(vol)?.is_none() {
            return Ok(0);
        }
        let root = self.root.as_deref_mut().unwrap();
        let mut removed = 0;
        Self::remove_rec(vol, root, from, to, pred, limit, &mut removed)?;
        if removed > 0 {
            self.dirty = true;
            if self.root.as_ref().unwrap().branches.is_empty() {
                self.root = None;
            }
        }
        Ok(removed)
    }
    fn remove_rec(
        vol: &mut dyn Volume,
        znode: &mut Znode,
        from: Key,
        to: Key,
        pred: &mut dyn FnMut(Key, Loc) -> bool,
        limit: Option<usize>,
        removed: &mut usize,
    ) -> RuntimeResult<()> {
        let done = |removed: &usize| limit.map_or(false, |l| *removed >= l);
        if znode.level == 0 {
            let mut i = 0;
            while i < znode.branches.len() {
                let br = &znode.branches[i];
                if br.key >= from && br.key <= to && !done(removed) && pred(br.key, br.loc) {
                    znode.branches.remove(i);
                    znode.dirty = true;
                    *removed += 1;
                } else {
                    i += 1;
                }
            }
            return Ok(());
        }
        let mut i = 0;
        while i < znode.branches.len() {
            if done(removed) {
                break;
            }
            let lo = znode.branches[i].key;
            let hi = znode.branches.get(i + 1).map(|b| b.key);
            let overlaps = lo <= to && hi.map_or(true, |h| h >= from);
            if overlaps {
                let before = *removed;
                let child = Self::child_mut(vol, znode, i)?;
                Self::remove_rec(vol, child, from, to, pred, limit, removed)?;
                let child_empty = child.branches.is_empty();
                let child_min = child.min_key();
                if *removed != before {
                    znode.dirty = true;
                    if child_empty {
                        znode.branches.remove(i);
                        continue;
                    }
                    znode.branches[i].key = child_min;
                }
            }
            i += 1;
        }
        Ok(())
    }
}

/*
    traversal
*/

impl Tnc {
    /// Post-order-ish traversal: every internal znode is reported
    /// through `znode_cb` when it is entered, every leaf branch through
    /// `leaf_cb` in exact key order. The leaf callback decides per
    /// branch whether it stays; dropped branches dirty the index.
    pub fn walk_index(
        &mut self,
        vol: &mut dyn Volume,
        leaf_cb: &mut dyn FnMut(&mut dyn Volume, Key, Loc) -> RuntimeResult<LeafAction>,
        znode_cb: &mut dyn FnMut(&mut dyn Volume, Loc, u16) -> RuntimeResult<()>,
    ) -> RuntimeResult<()> {
        let root_loc = self.root_loc;
        let Some(root) = self.root_mut(vol)? else {
            return Ok(());
        };
        if root_loc.len != 0 {
            znode_cb(vol, root_loc, root.level)?;
        }
        let mut dropped = false;
        Self::walk_rec(vol, root, leaf_cb, znode_cb, &mut dropped)?;
        if dropped {
            self.dirty = true;
            if self.root.as_ref().unwrap().branches.is_empty() {
                self.root = None;
            }
        }
        Ok(())
    }
    fn walk_rec(
        vol: &mut dyn Volume,
        znode: &mut Znode,
        leaf_cb: &mut dyn FnMut(&mut dyn Volume, Key, Loc) -> RuntimeResult<LeafAction>,
        znode_cb: &mut dyn FnMut(&mut dyn Volume, Loc, u16) -> RuntimeResult<()>,
        dropped: &mut bool,
    ) -> RuntimeResult<()> {
        if znode.level == 0 {
            let mut i = 0;
            while i < znode.branches.len() {
                let br = &znode.branches[i];
                match leaf_cb(vol, br.key, br.loc)? {
                    LeafAction::Keep => i += 1,
                    LeafAction::Drop => {
                        znode.branches.remove(i);
                        znode.dirty = true;
                        *dropped = true;
                    }
                }
            }
            return Ok(());
        }
        let mut i = 0;
        while i < znode.branches.len() {
            let child_loc = znode.branches[i].loc;
            let child = Self::child_mut(vol, znode, i)?;
            if child_loc.len != 0 {
                znode_cb(vol, child_loc, child.level)?;
            }
            Self::walk_rec(vol, child, leaf_cb, znode_cb, dropped)?;
            let child_empty = child.branches.is_empty();
            if child_empty {
                znode.branches.remove(i);
                znode.dirty = true;
            } else {
                i += 1;
            }
        }
        Ok(())
    }
    /// Collect every leaf branch in key order; the raw material for an
    /// index commit and for the rebuild equality checks
    pub fn collect_leaves(&mut self, vol: &mut dyn Volume) -> RuntimeResult<Vec<(Key, Loc)>> {
        let mut out = Vec::new();
        self.for_each_in_range(vol, Key::min(), Key::max(), &mut |_, key, loc| {
            out.push((key, loc));
            Ok(RangeWalk::Continue)
        })?;
        Ok(out)
    }
}

/*
    node reads behind the index
*/

/// Read and parse the node a branch points at
pub fn read_node(vol: &mut dyn Volume, loc: Loc) -> RuntimeResult<Node> {
    let mut buf = vec![0u8; loc.len as usize];
    vol.leb_read(loc.lnum, loc.offs, &mut buf)?;
    ondisk::parse_node(&buf, loc.lnum, loc.offs)
}

/// Read a node that must be a (x)dentry; anything else means the data
/// behind the index went bad
fn read_dent(vol: &mut dyn Volume, loc: Loc) -> RuntimeResult<DentNode> {
    match read_node(vol, loc) {
        Ok(Node::Dent(dent)) => Ok(dent),
        Ok(_) => Err(Error::from(Reason::TncDataCorrupted).at(loc.lnum, loc.offs)),
        Err(e) => Err(e),
    }
}
