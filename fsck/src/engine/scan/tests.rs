/*
 * Created on Sat Mar 30 2024
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
    super::{scan_leb, scan_leb_strict, SlebEnd},
    crate::{
        engine::ondisk::{
            node::{CsNode, InoNode},
            pad_buf, CommonHdr, Key, NodeType, ERASED_BYTE, PAD_NODE_SZ, S_IFREG,
        },
        util::align8,
    },
};

const LEB_SZ: usize = 8192;

fn erased_leb() -> Vec<u8> {
    vec![ERASED_BYTE; LEB_SZ]
}

fn small_ino(inum: u32, sqnum: u64) -> Vec<u8> {
    InoNode {
        ch: CommonHdr::synth(NodeType::Ino, sqnum),
        key: Key::ino(inum),
        creat_sqnum: sqnum,
        size: 0,
        atime_sec: 0,
        ctime_sec: 0,
        mtime_sec: 0,
        atime_nsec: 0,
        ctime_nsec: 0,
        mtime_nsec: 0,
        nlink: 1,
        uid: 0,
        gid: 0,
        mode: S_IFREG | 0o644,
        flags: 0,
        data_len: 0,
        xattr_cnt: 0,
        xattr_size: 0,
        xattr_names: 0,
        compr_type: 0,
        data: vec![],
    }
    .encode()
}

fn put(leb: &mut [u8], offs: usize, bytes: &[u8]) -> usize {
    leb[offs..offs + bytes.len()].copy_from_slice(bytes);
    align8(offs as u32 + bytes.len() as u32) as usize
}

#[test]
fn erased_leb_scans_empty() {
    let sleb = scan_leb(5, &erased_leb());
    assert!(sleb.is_empty());
    assert_eq!(sleb.endpt, 0);
    assert_eq!(sleb.end, SlebEnd::EmptySpace);
}

#[test]
fn two_nodes_then_empty_space() {
    let mut leb = erased_leb();
    let next = put(&mut leb, 0, &small_ino(64, 1));
    let end = put(&mut leb, next, &small_ino(65, 2));
    let sleb = scan_leb(7, &leb);
    assert!(sleb.is_sound());
    assert_eq!(sleb.nodes.len(), 2);
    assert_eq!(sleb.nodes[0].offs, 0);
    assert_eq!(sleb.nodes[1].offs, next as u32);
    assert_eq!(sleb.endpt, end as u32);
    assert_eq!(sleb.highest_sqnum(), 2);
}

#[test]
fn padding_node_is_skipped() {
    let mut leb = erased_leb();
    let node = small_ino(64, 1);
    let next = put(&mut leb, 0, &node);
    // a 256 byte padding run, then another node
    pad_buf(&mut leb[next..next + 256], 2);
    let end = put(&mut leb, next + 256, &small_ino(65, 3));
    let sleb = scan_leb(7, &leb);
    assert!(sleb.is_sound());
    assert_eq!(sleb.nodes.len(), 2);
    assert_eq!(sleb.nodes[1].offs, (next + 256) as u32);
    assert_eq!(sleb.endpt, end as u32);
}

#[test]
fn corrupt_node_is_recoverable() {
    let mut leb = erased_leb();
    let next = put(&mut leb, 0, &small_ino(64, 1));
    let end = put(&mut leb, next, &small_ino(65, 2));
    let _ = end;
    // flip a payload byte of the second node
    leb[next + 100] ^= 0x40;
    let sleb = scan_leb(7, &leb);
    assert_eq!(sleb.nodes.len(), 1);
    assert_eq!(sleb.endpt, next as u32);
    assert!(matches!(sleb.end, SlebEnd::BadNode(_)));
    assert!(scan_leb_strict(7, &leb).is_err());
}

#[test]
fn garbage_stops_the_scan() {
    let mut leb = erased_leb();
    let next = put(&mut leb, 0, &small_ino(64, 1));
    leb[next..next + 64].fill(0x55);
    let sleb = scan_leb(7, &leb);
    assert_eq!(sleb.nodes.len(), 1);
    assert_eq!(sleb.end, SlebEnd::Garbage);
    assert_eq!(sleb.endpt, next as u32);
}

#[test]
fn erased_byte_followed_by_junk_is_garbage() {
    let mut leb = erased_leb();
    leb[4096] = 0x13;
    let sleb = scan_leb(7, &leb);
    assert_eq!(sleb.end, SlebEnd::Garbage);
    assert_eq!(sleb.endpt, 0);
}

#[test]
fn small_pad_gap_uses_raw_padding_bytes() {
    let mut gap = [0u8; PAD_NODE_SZ - 8];
    pad_buf(&mut gap, 1);
    assert!(gap.iter().all(|&b| b == super::super::ondisk::PADDING_BYTE));
}

#[test]
fn scan_agrees_with_codec_lengths() {
    // scan soundness: every offset the scanner reports parses again and
    // the declared length matches
    let mut leb = erased_leb();
    let mut offs = 0;
    offs = put(&mut leb, offs, &small_ino(64, 1));
    offs = put(
        &mut leb,
        offs,
        &CsNode {
            ch: CommonHdr::synth(NodeType::Cs, 2),
            cmt_no: 0,
        }
        .encode(),
    );
    let _ = offs;
    let sleb = scan_leb(3, &leb);
    for sn in &sleb.nodes {
        let reparsed =
            crate::engine::ondisk::parse_node(&leb[sn.offs as usize..], 3, sn.offs).unwrap();
        assert_eq!(reparsed.ch().len, sn.len);
        assert_eq!(&reparsed, &sn.node);
    }
}
