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

use {
    super::{
        categorize, create_lpt, dead_watermark,
        pack::{calc_lpt_geom, BitReader, BitWriter},
        LpHeap, Lprops, Lpt, LPROPS_DIRTY, LPROPS_EMPTY, LPROPS_FREE, LPROPS_FREEABLE,
        LPROPS_INDEX, LPROPS_UNCAT, LPT_HEAP_SZ,
    },
    crate::engine::{dev::MemVolume, error::ErrorKind, error::Reason},
};

const LEB_SZ: u32 = 131072;
const LEB_CNT: u32 = 64;

fn geom() -> super::LptGeom {
    // 64 LEBs of 128 KiB: 2 sb, 2 mst, 4 log, 2 lpt, 1 orph, 53 main
    calc_lpt_geom(LEB_SZ, LEB_CNT, LEB_CNT, 8, 4, 2, 1, false, 0)
}

fn vol() -> MemVolume {
    MemVolume::new(LEB_SZ, LEB_CNT, 8)
}

#[test]
fn geometry_formulas() {
    let g = geom();
    assert_eq!(g.lpt_first, 8);
    assert_eq!(g.orph_first, 10);
    assert_eq!(g.main_first, 11);
    assert_eq!(g.main_lebs, 53);
    assert_eq!(g.pnode_cnt, 14);
    // 14 pnodes fold as 14 -> 4 -> 1
    assert_eq!(g.nnode_cnt, 5);
    assert_eq!(g.lpt_hght, 2);
    // fls(131072) = 18
    assert_eq!(g.space_bits, 15);
    assert_eq!(g.lpt_spc_bits, 18);
    assert_eq!(g.lpt_offs_bits, 17);
    assert_eq!(g.lpt_lnum_bits, 2);
    // crc16 + type4 + 4 * (15 + 15 + 1) = 144 bits = 18 bytes
    assert_eq!(g.pnode_sz, 18);
    // crc16 + type4 + 4 * (2 + 17) = 96 bits = 12 bytes
    assert_eq!(g.nnode_sz, 12);
}

#[test]
fn bit_cursor_round_trip() {
    let mut w = BitWriter::new();
    let fields: [(u32, u32); 6] = [
        (0x5A, 8),
        (1, 1),
        (0, 1),
        (0x3FFF, 15),
        (12345, 17),
        (3, 2),
    ];
    for (val, bits) in fields {
        w.put(val, bits);
    }
    let sealed = w.seal(16);
    assert_eq!(sealed.len(), 16);
    let mut r = BitReader::new(&sealed);
    for (val, bits) in fields {
        assert_eq!(r.get(bits), val, "{} bits", bits);
    }
}

#[test]
fn created_lpt_reads_back() {
    let g = geom();
    let mut vol = vol();
    let mut all = vec![Lprops::new(LEB_SZ, 0, 0); g.main_lebs as usize];
    all[0] = Lprops::new(0, 1024, 0);
    all[1] = Lprops::new(2048, 512, LPROPS_INDEX);
    all[52] = Lprops::new(LEB_SZ - 4096, 4096, 0);
    let roots = create_lpt(&mut vol, &g, &all).unwrap();
    let mut lpt = Lpt::from_master(g, roots.lpt_lnum, roots.lpt_offs);
    for (i, want) in all.iter().enumerate() {
        let got = lpt.lookup(&mut vol, g.main_first + i as u32).unwrap();
        assert_eq!(&got, want, "main LEB {}", i);
    }
    // the ltab accounts the region including itself
    let ltab = super::pack::read_ltab(&mut vol, &g, roots.ltab_lnum, roots.ltab_offs).unwrap();
    assert_eq!(ltab.len(), g.lpt_lebs as usize);
    let used: u32 = ltab.iter().map(|lp| LEB_SZ - lp.free).sum();
    let node_bytes = g.pnode_cnt * g.pnode_sz + g.nnode_cnt * g.nnode_sz + g.ltab_sz;
    assert_eq!(used, node_bytes);
}

#[test]
fn corrupt_lpt_node_is_detected() {
    let g = geom();
    let mut vol = vol();
    let all = vec![Lprops::new(LEB_SZ, 0, 0); g.main_lebs as usize];
    let roots = create_lpt(&mut vol, &g, &all).unwrap();
    vol.corrupt_byte(roots.lpt_lnum, roots.lpt_offs + 4);
    let mut lpt = Lpt::from_master(g, roots.lpt_lnum, roots.lpt_offs);
    let err = lpt.lookup(&mut vol, g.main_first).unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Corrupt(Reason::LptCorrupted));
}

#[test]
fn change_marks_dirty_and_sticks() {
    let g = geom();
    let mut vol = vol();
    let all = vec![Lprops::new(LEB_SZ, 0, 0); g.main_lebs as usize];
    let roots = create_lpt(&mut vol, &g, &all).unwrap();
    let mut lpt = Lpt::from_master(g, roots.lpt_lnum, roots.lpt_offs);
    assert!(!lpt.is_dirty());
    lpt.change_one(&mut vol, g.main_first + 7, 1024, 2048, 0).unwrap();
    assert!(lpt.is_dirty());
    assert_eq!(
        lpt.lookup(&mut vol, g.main_first + 7).unwrap(),
        Lprops::new(1024, 2048, 0)
    );
    lpt.update_one(&mut vol, g.main_first + 7, -1024, 1024, LPROPS_INDEX, 0)
        .unwrap();
    let lp = lpt.lookup(&mut vol, g.main_first + 7).unwrap();
    assert_eq!((lp.free, lp.dirty), (0, 3072));
    assert!(lp.is_index());
}

#[test]
fn categories_follow_the_watermarks() {
    let dead = dead_watermark(8);
    let cat = |lp: &Lprops| categorize(lp, LEB_SZ, dead);
    assert_eq!(cat(&Lprops::new(LEB_SZ, 0, 0)), LPROPS_EMPTY);
    assert_eq!(cat(&Lprops::new(1024, LEB_SZ - 1024, 0)), LPROPS_FREEABLE);
    assert_eq!(cat(&Lprops::new(1024, 0, 0)), LPROPS_FREE);
    assert_eq!(cat(&Lprops::new(0, dead, 0)), LPROPS_DIRTY);
    assert_eq!(cat(&Lprops::new(0, dead - 8, 0)), LPROPS_UNCAT);
    assert_eq!(
        cat(&Lprops::new(0, dead, LPROPS_INDEX)),
        super::LPROPS_DIRTY_IDX
    );
    assert_eq!(
        cat(&Lprops::new(1024, LEB_SZ - 1024, LPROPS_INDEX)),
        super::LPROPS_FRDI_IDX
    );
}

#[test]
fn heap_is_bounded_and_ordered() {
    let mut heap = LpHeap::default();
    for i in 0..LPT_HEAP_SZ as u32 + 40 {
        heap.push(i, 1000 + i);
    }
    assert_eq!(heap.len(), LPT_HEAP_SZ);
    // the weakest entries were evicted, the strongest is on top
    let (top_val, top_lnum) = heap.peek().unwrap();
    assert_eq!(top_val, LPT_HEAP_SZ as u32 + 39);
    assert_eq!(top_lnum, 1000 + LPT_HEAP_SZ as u32 + 39);
    let mut last = u32::MAX;
    while let Some((v, _)) = heap.pop() {
        assert!(v <= last);
        last = v;
    }
}

#[test]
fn arithmetic_invariant() {
    let lp = Lprops::new(1024, 2048, 0);
    assert!(lp.is_sane(LEB_SZ));
    assert_eq!(lp.used(LEB_SZ), Some(LEB_SZ - 3072));
    assert!(!Lprops::new(LEB_SZ, 8, 0).is_sane(LEB_SZ));
    assert!(!Lprops::new(3, 0, 0).is_sane(LEB_SZ));
}
