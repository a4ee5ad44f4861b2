/*
 * Created on Wed May 01 2024
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

//! On-flash LPT packing. Every LPT node opens with 16 CRC bits and 4
//! type bits, then bit-granular fields: free and dirty amounts divided
//! by 8 in `space_bits`-wide fields, LEB numbers relative to the start
//! of the LPT region, and (in the big variant) node numbers that make
//! out-of-place updates checkable. Bits fill bytes LSB first.

use {
    super::{LptChild, Lprops, NBranch, Nnode, Pnode, FANOUT, LPROPS_INDEX},
    crate::{
        engine::{
            dev::Volume,
            error::{Error, Reason, RuntimeResult},
            ondisk::{checksum::crc16, ERASED_BYTE, LOG_LNUM},
        },
        util::{align_up, div_round_up, fls},
    },
    log::debug,
};

consts! {
    pub LPT_CRC_BITS: u32 = 16;
    pub LPT_CRC_BYTES: usize = 2;
    pub LPT_TYPE_BITS: u32 = 4;
    pub LPT_PNODE: u32 = 0;
    pub LPT_NNODE: u32 = 1;
    pub LPT_LTAB: u32 = 2;
    pub LPT_LSAVE: u32 = 3;
}

/*
    geometry
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LptGeom {
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub min_io_size: u32,
    pub lpt_first: u32,
    pub lpt_lebs: u32,
    pub orph_first: u32,
    pub orph_lebs: u32,
    pub main_first: u32,
    pub main_lebs: u32,
    pub big_lpt: bool,
    pub lsave_cnt: u32,
    pub lpt_hght: u32,
    pub pnode_cnt: u32,
    pub nnode_cnt: u32,
    pub space_bits: u32,
    pub lpt_lnum_bits: u32,
    pub lpt_offs_bits: u32,
    pub lpt_spc_bits: u32,
    pub pcnt_bits: u32,
    pub lnum_bits: u32,
    pub pnode_sz: u32,
    pub nnode_sz: u32,
    pub ltab_sz: u32,
    pub lsave_sz: u32,
}

/// Derive the complete LPT geometry from the superblock-level layout
pub fn calc_lpt_geom(
    leb_size: u32,
    leb_cnt: u32,
    max_leb_cnt: u32,
    min_io_size: u32,
    log_lebs: u32,
    lpt_lebs: u32,
    orph_lebs: u32,
    big_lpt: bool,
    lsave_cnt: u32,
) -> LptGeom {
    let lpt_first = LOG_LNUM + log_lebs;
    let orph_first = lpt_first + lpt_lebs;
    let main_first = orph_first + orph_lebs;
    let main_lebs = leb_cnt - main_first;
    // size the tree for the largest main area this volume may grow to
    let max_main_lebs = main_lebs + max_leb_cnt - leb_cnt;
    let max_pnode_cnt = div_round_up(max_main_lebs, FANOUT as u32);
    let mut lpt_hght = 1;
    let mut n = FANOUT as u32;
    while n < max_pnode_cnt {
        lpt_hght += 1;
        n <<= 2;
    }
    let pnode_cnt = div_round_up(main_lebs, FANOUT as u32);
    let mut nnode_cnt = 0;
    let mut w = pnode_cnt;
    loop {
        w = div_round_up(w, FANOUT as u32);
        nnode_cnt += w;
        if w == 1 {
            break;
        }
    }
    let space_bits = fls(leb_size) - 3;
    let lpt_lnum_bits = fls(lpt_lebs);
    let lpt_offs_bits = fls(leb_size - 1);
    let lpt_spc_bits = fls(leb_size);
    let pcnt_bits = fls(div_round_up(max_leb_cnt, FANOUT as u32) - 1);
    let lnum_bits = fls(max_leb_cnt - 1);
    let num_bits = if big_lpt { pcnt_bits } else { 0 };
    let pnode_bits =
        LPT_CRC_BITS + LPT_TYPE_BITS + num_bits + (2 * space_bits + 1) * FANOUT as u32;
    let nnode_bits =
        LPT_CRC_BITS + LPT_TYPE_BITS + num_bits + (lpt_lnum_bits + lpt_offs_bits) * FANOUT as u32;
    let ltab_bits = LPT_CRC_BITS + LPT_TYPE_BITS + 2 * lpt_spc_bits * lpt_lebs;
    let lsave_bits = LPT_CRC_BITS + LPT_TYPE_BITS + lnum_bits * lsave_cnt;
    LptGeom {
        leb_size,
        leb_cnt,
        max_leb_cnt,
        min_io_size,
        lpt_first,
        lpt_lebs,
        orph_first,
        orph_lebs,
        main_first,
        main_lebs,
        big_lpt,
        lsave_cnt: if big_lpt { lsave_cnt } else { 0 },
        lpt_hght,
        pnode_cnt,
        nnode_cnt,
        space_bits,
        lpt_lnum_bits,
        lpt_offs_bits,
        lpt_spc_bits,
        pcnt_bits,
        lnum_bits,
        pnode_sz: div_round_up(pnode_bits, 8),
        nnode_sz: div_round_up(nnode_bits, 8),
        ltab_sz: div_round_up(ltab_bits, 8),
        lsave_sz: if big_lpt { div_round_up(lsave_bits, 8) } else { 0 },
    }
}

/*
    bit cursors
*/

pub struct BitWriter {
    buf: Vec<u8>,
    bitpos: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            bitpos: 0,
        }
    }
    pub fn put(&mut self, mut val: u32, mut bits: u32) {
        debug_assert!(bits == 32 || u64::from(val) < (1u64 << bits));
        while bits > 0 {
            let byte = self.bitpos / 8;
            let bit = self.bitpos % 8;
            if byte == self.buf.len() {
                self.buf.push(0);
            }
            let take = (8 - bit).min(bits as usize) as u32;
            let mask = ((1u64 << take) - 1) as u32;
            self.buf[byte] |= ((val & mask) as u8) << bit;
            val = (u64::from(val) >> take) as u32;
            bits -= take;
            self.bitpos += take as usize;
        }
    }
    /// Seal into exactly `sz` bytes: pad, checksum bytes 2.., stamp the
    /// CRC into the leading 16 bits
    pub fn seal(mut self, sz: usize) -> Vec<u8> {
        debug_assert!(self.buf.len() <= sz);
        self.buf.resize(sz, 0);
        let crc = crc16(&self.buf[LPT_CRC_BYTES..]);
        self.buf[0] = crc as u8;
        self.buf[1] = (crc >> 8) as u8;
        self.buf
    }
}

pub struct BitReader<'a> {
    buf: &'a [u8],
    bitpos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, bitpos: 0 }
    }
    pub fn get(&mut self, mut bits: u32) -> u32 {
        let mut out: u32 = 0;
        let mut shift = 0;
        while bits > 0 {
            let byte = self.bitpos / 8;
            let bit = self.bitpos % 8;
            let take = (8 - bit).min(bits as usize) as u32;
            let mask = ((1u64 << take) - 1) as u32;
            let part = (u32::from(self.buf[byte]) >> bit) & mask;
            out |= part << shift;
            shift += take;
            bits -= take;
            self.bitpos += take as usize;
        }
        out
    }
}

/// Read `sz` bytes at the given position and verify the leading CRC-16
/// and the type nibble; hand back a reader positioned after both
fn checked_read<'a>(
    buf: &'a [u8],
    geom_lnum: u32,
    offs: u32,
    want_type: u32,
) -> RuntimeResult<BitReader<'a>> {
    let calc = crc16(&buf[LPT_CRC_BYTES..]);
    let mut r = BitReader::new(buf);
    let stored = r.get(LPT_CRC_BITS) as u16;
    let typ = r.get(LPT_TYPE_BITS);
    if stored != calc || typ != want_type {
        debug!(
            "LPT node at {}:{}: type {} crc {:#06x}/{:#06x}",
            geom_lnum, offs, typ, stored, calc
        );
        return Err(Error::from(Reason::LptCorrupted).at(geom_lnum, offs));
    }
    Ok(r)
}

fn read_bytes(
    vol: &mut dyn Volume,
    lnum: u32,
    offs: u32,
    sz: u32,
) -> RuntimeResult<Vec<u8>> {
    let mut buf = vec![0u8; sz as usize];
    vol.leb_read(lnum, offs, &mut buf)?;
    Ok(buf)
}

/*
    unpack
*/

pub(super) fn read_pnode(
    vol: &mut dyn Volume,
    geom: &LptGeom,
    lnum: u32,
    offs: u32,
) -> RuntimeResult<Pnode> {
    if lnum == 0 {
        return Err(Error::from(Reason::LptCorrupted));
    }
    let buf = read_bytes(vol, lnum, offs, geom.pnode_sz)?;
    let mut r = checked_read(&buf, lnum, offs, LPT_PNODE)?;
    if geom.big_lpt {
        let _num = r.get(geom.pcnt_bits);
    }
    let mut lprops = [Lprops::default(); FANOUT];
    for lp in lprops.iter_mut() {
        lp.free = r.get(geom.space_bits) << 3;
        lp.dirty = r.get(geom.space_bits) << 3;
        lp.flags = if r.get(1) != 0 { LPROPS_INDEX } else { 0 };
    }
    Ok(Pnode {
        lprops,
        dirty: false,
    })
}

pub(super) fn read_nnode(
    vol: &mut dyn Volume,
    geom: &LptGeom,
    lnum: u32,
    offs: u32,
) -> RuntimeResult<Nnode> {
    if lnum == 0 {
        return Err(Error::from(Reason::LptCorrupted));
    }
    let buf = read_bytes(vol, lnum, offs, geom.nnode_sz)?;
    let mut r = checked_read(&buf, lnum, offs, LPT_NNODE)?;
    if geom.big_lpt {
        let _num = r.get(geom.pcnt_bits);
    }
    let mut nbranch: [NBranch; FANOUT] = Default::default();
    for br in nbranch.iter_mut() {
        let rel = r.get(geom.lpt_lnum_bits);
        br.offs = r.get(geom.lpt_offs_bits);
        br.lnum = if rel == 0 {
            0
        } else {
            rel + geom.lpt_first - 1
        };
    }
    Ok(Nnode {
        nbranch,
        dirty: false,
    })
}

/// The per-LPT-LEB accounting table
pub fn read_ltab(
    vol: &mut dyn Volume,
    geom: &LptGeom,
    lnum: u32,
    offs: u32,
) -> RuntimeResult<Vec<Lprops>> {
    let buf = read_bytes(vol, lnum, offs, geom.ltab_sz)?;
    let mut r = checked_read(&buf, lnum, offs, LPT_LTAB)?;
    Ok((0..geom.lpt_lebs)
        .map(|_| {
            let free = r.get(geom.lpt_spc_bits);
            let dirty = r.get(geom.lpt_spc_bits);
            Lprops::new(free, dirty, 0)
        })
        .collect())
}

/// The list of LEBs saved for fast lprops scans (big LPT only)
pub fn read_lsave(
    vol: &mut dyn Volume,
    geom: &LptGeom,
    lnum: u32,
    offs: u32,
) -> RuntimeResult<Vec<u32>> {
    let buf = read_bytes(vol, lnum, offs, geom.lsave_sz)?;
    let mut r = checked_read(&buf, lnum, offs, LPT_LSAVE)?;
    Ok((0..geom.lsave_cnt).map(|_| r.get(geom.lnum_bits)).collect())
}

/*
    pack
*/

pub fn pack_pnode(geom: &LptGeom, num: u32, lprops: &[Lprops]) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put(0, LPT_CRC_BITS);
    w.put(LPT_PNODE, LPT_TYPE_BITS);
    if geom.big_lpt {
        w.put(num, geom.pcnt_bits);
    }
    for i in 0..FANOUT {
        let lp = lprops.get(i).copied().unwrap_or_default();
        w.put(lp.free >> 3, geom.space_bits);
        w.put(lp.dirty >> 3, geom.space_bits);
        w.put(u32::from(lp.flags & LPROPS_INDEX != 0), 1);
    }
    w.seal(geom.pnode_sz as usize)
}

pub fn pack_nnode(geom: &LptGeom, num: u32, branches: &[(u32, u32)]) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put(0, LPT_CRC_BITS);
    w.put(LPT_NNODE, LPT_TYPE_BITS);
    if geom.big_lpt {
        w.put(num, geom.pcnt_bits);
    }
    for i in 0..FANOUT {
        let (lnum, offs) = branches.get(i).copied().unwrap_or((0, 0));
        let rel = if lnum == 0 {
            0
        } else {
            lnum - geom.lpt_first + 1
        };
        w.put(rel, geom.lpt_lnum_bits);
        w.put(offs, geom.lpt_offs_bits);
    }
    w.seal(geom.nnode_sz as usize)
}

pub fn pack_ltab(geom: &LptGeom, ltab: &[Lprops]) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put(0, LPT_CRC_BITS);
    w.put(LPT_LTAB, LPT_TYPE_BITS);
    for lp in ltab {
        w.put(lp.free, geom.lpt_spc_bits);
        w.put(lp.dirty, geom.lpt_spc_bits);
    }
    w.seal(geom.ltab_sz as usize)
}

pub fn pack_lsave(geom: &LptGeom, lsave: &[u32]) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put(0, LPT_CRC_BITS);
    w.put(LPT_LSAVE, LPT_TYPE_BITS);
    for lnum in lsave {
        w.put(*lnum, geom.lnum_bits);
    }
    w.seal(geom.lsave_sz as usize)
}

/*
    whole-region creation
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Everything the master node must learn after an LPT write
pub struct LptRoots {
    pub lpt_lnum: u32,
    pub lpt_offs: u32,
    pub nhead_lnum: u32,
    pub nhead_offs: u32,
    pub ltab_lnum: u32,
    pub ltab_offs: u32,
    pub lsave_lnum: u32,
    pub lsave_offs: u32,
}

/// A bump allocator over the LPT region that never splits a node across
/// a LEB boundary
struct LptOut {
    bufs: Vec<Vec<u8>>,
    leb_size: usize,
    cur: usize,
}

impl LptOut {
    fn place(&mut self, bytes: Vec<u8>) -> RuntimeResult<(u32, u32)> {
        if self.bufs[self.cur].len() + bytes.len() > self.leb_size {
            self.cur += 1;
            if self.cur == self.bufs.len() {
                return Err(Error::from(Reason::LptIncorrect));
            }
        }
        let offs = self.bufs[self.cur].len() as u32;
        self.bufs[self.cur].extend_from_slice(&bytes);
        Ok((self.cur as u32, offs))
    }
    fn reserve(&mut self, len: usize) -> (u32, u32) {
        if self.bufs[self.cur].len() + len > self.leb_size {
            self.cur += 1;
        }
        (self.cur as u32, self.bufs[self.cur].len() as u32)
    }
}

/// Write a complete, fresh LPT for the given main-area properties and
/// hand back the locations the master node needs
pub fn create_lpt(
    vol: &mut dyn Volume,
    geom: &LptGeom,
    lprops: &[Lprops],
) -> RuntimeResult<LptRoots> {
    debug_assert_eq!(lprops.len(), geom.main_lebs as usize);
    let mut out = LptOut {
        bufs: vec![Vec::new(); geom.lpt_lebs as usize],
        leb_size: geom.leb_size as usize,
        cur: 0,
    };
    let mut num = 0u32;
    // pnodes, in main-area order
    let mut level: Vec<(u32, u32)> = Vec::with_capacity(geom.pnode_cnt as usize);
    for chunk in lprops.chunks(FANOUT) {
        let bytes = pack_pnode(geom, num, chunk);
        num += 1;
        level.push(out.place(bytes)?);
    }
    // nnode levels, bottom-up; the root comes out of the last fold
    for _ in 0..geom.lpt_hght {
        let mut parents = Vec::with_capacity(level.len().div_ceil(FANOUT));
        for chunk in level.chunks(FANOUT) {
            let branches: Vec<(u32, u32)> = chunk
                .iter()
                .map(|&(rel, offs)| (geom.lpt_first + rel, offs))
                .collect();
            let bytes = pack_nnode(geom, num, &branches);
            num += 1;
            parents.push(out.place(bytes)?);
        }
        level = parents;
    }
    debug_assert_eq!(level.len(), 1);
    let (root_rel, root_offs) = level[0];
    // lsave (big variant only), then the ltab over the region itself;
    // the ltab space is reserved before its contents are computed
    let (lsave_rel, lsave_offs) = if geom.big_lpt {
        let lsave: Vec<u32> = (geom.main_first..)
            .take(geom.lsave_cnt as usize)
            .collect();
        out.place(pack_lsave(geom, &lsave))?
    } else {
        (0, 0)
    };
    let (ltab_rel, ltab_offs) = out.reserve(geom.ltab_sz as usize);
    let ltab: Vec<Lprops> = out
        .bufs
        .iter()
        .enumerate()
        .map(|(i, buf)| {
            let mut used = buf.len() as u32;
            if i as u32 == ltab_rel {
                used += geom.ltab_sz;
            }
            Lprops::new(geom.leb_size - used, 0, 0)
        })
        .collect();
    let placed = out.place(pack_ltab(geom, &ltab))?;
    debug_assert_eq!(placed, (ltab_rel, ltab_offs));
    // flush: rewrite every LPT LEB, erase the unused ones
    for (i, buf) in out.bufs.iter().enumerate() {
        let lnum = geom.lpt_first + i as u32;
        if buf.is_empty() {
            vol.leb_unmap(lnum)?;
        } else {
            let mut leb = buf.clone();
            leb.resize(leb.len().next_multiple_of(8), ERASED_BYTE);
            vol.leb_change(lnum, &leb)?;
        }
    }
    let nhead_lnum = geom.lpt_first + ltab_rel;
    let nhead_offs = align_up(ltab_offs + geom.ltab_sz, geom.min_io_size);
    Ok(LptRoots {
        lpt_lnum: geom.lpt_first + root_rel,
        lpt_offs: root_offs,
        nhead_lnum,
        nhead_offs,
        ltab_lnum: geom.lpt_first + ltab_rel,
        ltab_offs,
        lsave_lnum: if geom.big_lpt {
            geom.lpt_first + lsave_rel
        } else {
            0
        },
        lsave_offs,
    })
}
