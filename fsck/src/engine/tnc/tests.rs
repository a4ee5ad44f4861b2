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

use {
    super::{commit::build_index, LeafAction, Loc, Tnc},
    crate::engine::{
        dev::{MemVolume, Volume},
        ondisk::{
            node::{DentNode, InoNode},
            CommonHdr, Key, NodeType, S_IFREG,
        },
    },
};

const LEB_SZ: u32 = 8192;
const FANOUT: usize = 4;

fn vol() -> MemVolume {
    MemVolume::new(LEB_SZ, 64, 8)
}

fn ino_bytes(inum: u32, sqnum: u64) -> Vec<u8> {
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

fn dent_bytes(host: u32, name: &str, target: u32, sqnum: u64) -> Vec<u8> {
    DentNode {
        ch: CommonHdr::synth(NodeType::Dent, sqnum),
        key: Key::dent(host, name.as_bytes()),
        inum: target as u64,
        dtype: 0,
        cookie: 0,
        name: name.as_bytes().to_vec(),
    }
    .encode()
}

/// Pack the given nodes into one LEB and return their locations
fn write_leaves(vol: &mut MemVolume, lnum: u32, nodes: &[Vec<u8>]) -> Vec<Loc> {
    let mut buf = Vec::new();
    let mut locs = Vec::new();
    for bytes in nodes {
        let offs = buf.len() as u32;
        buf.extend_from_slice(bytes);
        let aligned = crate::util::align8(buf.len() as u32) as usize;
        buf.resize(aligned, 0xFF);
        locs.push(Loc::new(lnum, offs, bytes.len() as u32));
    }
    vol.leb_change(lnum, &buf).unwrap();
    locs
}

#[test]
fn add_lookup_many() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    let mut locs = Vec::new();
    // enough keys to force splits over two levels
    for inum in 64..64 + 40 {
        let loc = Loc::new(10, (inum - 64) * 256, 160);
        tnc.add(&mut vol, Key::ino(inum), loc).unwrap();
        locs.push((Key::ino(inum), loc));
    }
    for (key, loc) in &locs {
        assert_eq!(tnc.lookup(&mut vol, *key).unwrap(), Some(*loc));
    }
    assert_eq!(tnc.lookup(&mut vol, Key::ino(7)).unwrap(), None);
    // leaves come back in key order
    assert_eq!(tnc.collect_leaves(&mut vol).unwrap(), locs);
}

#[test]
fn out_of_order_insertion_stays_sorted() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    let inums = [90u32, 64, 77, 99, 65, 80, 70, 95, 66, 71];
    for (i, &inum) in inums.iter().enumerate() {
        tnc.add(&mut vol, Key::ino(inum), Loc::new(10, i as u32 * 256, 160))
            .unwrap();
    }
    let keys: Vec<Key> = tnc
        .collect_leaves(&mut vol)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    let mut want: Vec<Key> = inums.iter().map(|&i| Key::ino(i)).collect();
    want.sort();
    assert_eq!(keys, want);
}

#[test]
fn remove_and_remove_range() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    for inum in 64..96 {
        tnc.add(&mut vol, Key::ino(inum), Loc::new(10, inum * 8, 160))
            .unwrap();
        tnc.add(&mut vol, Key::data(inum, 0), Loc::new(11, inum * 8, 100))
            .unwrap();
    }
    assert!(tnc.remove(&mut vol, Key::ino(70)).unwrap());
    assert!(!tnc.remove(&mut vol, Key::ino(70)).unwrap());
    assert_eq!(tnc.lookup(&mut vol, Key::ino(70)).unwrap(), None);
    // wipe everything inode 80 owns
    let (from, to) = Key::ino_range(80);
    assert_eq!(tnc.remove_range(&mut vol, from, to).unwrap(), 2);
    assert_eq!(tnc.lookup(&mut vol, Key::ino(80)).unwrap(), None);
    assert_eq!(tnc.lookup(&mut vol, Key::data(80, 0)).unwrap(), None);
    // neighbours untouched
    assert!(tnc.lookup(&mut vol, Key::ino(81)).unwrap().is_some());
    assert!(tnc.lookup(&mut vol, Key::data(79, 0)).unwrap().is_some());
}

#[test]
fn remove_node_picks_the_exact_instance() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    // two versions of the same dentry key at different locations
    let nodes = vec![dent_bytes(1, "name", 64, 1), dent_bytes(1, "name", 64, 2)];
    let locs = write_leaves(&mut vol, 10, &nodes);
    let key = Key::dent(1, b"name");
    tnc.add(&mut vol, key, locs[0]).unwrap();
    tnc.add(&mut vol, key, locs[1]).unwrap();
    assert!(tnc.remove_node(&mut vol, key, locs[0]).unwrap());
    assert_eq!(tnc.lookup(&mut vol, key).unwrap(), Some(locs[1]));
    assert!(!tnc.remove_node(&mut vol, key, locs[0]).unwrap());
}

#[test]
fn lookup_nm_reads_names() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    let nodes = vec![
        dent_bytes(1, "alpha", 64, 1),
        dent_bytes(1, "beta", 65, 2),
        dent_bytes(1, "gamma", 66, 3),
    ];
    let locs = write_leaves(&mut vol, 10, &nodes);
    for (name, loc) in [("alpha", locs[0]), ("beta", locs[1]), ("gamma", locs[2])] {
        tnc.add_nm(&mut vol, Key::dent(1, name.as_bytes()), name.as_bytes(), loc)
            .unwrap();
    }
    assert_eq!(
        tnc.lookup_nm(&mut vol, Key::dent(1, b"beta"), b"beta").unwrap(),
        Some(locs[1])
    );
    assert_eq!(
        tnc.lookup_nm(&mut vol, Key::dent(1, b"beta"), b"betb").unwrap(),
        None
    );
    assert!(tnc.remove_nm(&mut vol, Key::dent(1, b"alpha"), b"alpha").unwrap());
    assert_eq!(
        tnc.lookup_nm(&mut vol, Key::dent(1, b"alpha"), b"alpha").unwrap(),
        None
    );
}

#[test]
fn next_ent_iterates_in_hash_name_order() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    let names = ["a", "bb", "ccc", "dddd"];
    let nodes: Vec<Vec<u8>> = names
        .iter()
        .enumerate()
        .map(|(i, n)| dent_bytes(1, n, 64 + i as u32, i as u64 + 1))
        .collect();
    let locs = write_leaves(&mut vol, 10, &nodes);
    for (i, name) in names.iter().enumerate() {
        tnc.add_nm(&mut vol, Key::dent(1, name.as_bytes()), name.as_bytes(), locs[i])
            .unwrap();
    }
    // iterate from the start and collect every entry exactly once
    let mut seen = Vec::new();
    let mut cursor: (Key, Vec<u8>) = (Key::dent_hash(1, 3), Vec::new());
    while let Some((key, _loc, dent)) = tnc
        .next_ent(&mut vol, cursor.0, &cursor.1)
        .unwrap()
    {
        seen.push(String::from_utf8(dent.name.clone()).unwrap());
        cursor = (key, dent.name);
    }
    let mut want: Vec<(u32, String)> = names
        .iter()
        .map(|n| (Key::dent(1, n.as_bytes()).arg(), n.to_string()))
        .collect();
    want.sort();
    assert_eq!(seen, want.into_iter().map(|(_, n)| n).collect::<Vec<_>>());
}

#[test]
fn walk_visits_leaves_in_order_and_drops() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    for inum in 64..84 {
        tnc.add(&mut vol, Key::ino(inum), Loc::new(10, inum * 8, 160))
            .unwrap();
    }
    let mut visited = Vec::new();
    tnc.walk_index(
        &mut vol,
        &mut |_, key, _| {
            visited.push(key);
            Ok(if key == Key::ino(70) {
                LeafAction::Drop
            } else {
                LeafAction::Keep
            })
        },
        &mut |_, _, _| Ok(()),
    )
    .unwrap();
    let want: Vec<Key> = (64..84).map(Key::ino).collect();
    assert_eq!(visited, want);
    assert!(tnc.is_dirty());
    assert_eq!(tnc.lookup(&mut vol, Key::ino(70)).unwrap(), None);
    assert_eq!(tnc.collect_leaves(&mut vol).unwrap().len(), 19);
}

#[test]
fn committed_index_loads_back() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    // put real inode nodes on flash so the committed tree points at
    // something that parses
    let nodes: Vec<Vec<u8>> = (64u32..64 + 30).map(|i| ino_bytes(i, i as u64)).collect();
    let locs = write_leaves(&mut vol, 10, &nodes);
    for (i, loc) in locs.iter().enumerate() {
        tnc.add(&mut vol, Key::ino(64 + i as u32), *loc).unwrap();
    }
    let leaves = tnc.collect_leaves(&mut vol).unwrap();
    let mut sqnum = 100;
    let built = build_index(&mut vol, FANOUT, &leaves, vec![20, 21, 22], &mut sqnum).unwrap();
    assert!(built.index_size > 0);
    // a brand new TNC rooted at the committed location sees every leaf
    let mut fresh = Tnc::from_root(FANOUT, built.root);
    assert!(!fresh.is_dirty());
    for (key, loc) in &leaves {
        assert_eq!(fresh.lookup(&mut vol, *key).unwrap(), Some(*loc));
    }
    // and the index nodes it wrote are the live ones
    let first_key = leaves[0].0;
    assert!(fresh
        .has_idx_node(&mut vol, first_key, 2, built.root.lnum, built.root.offs)
        .unwrap());
}

#[test]
fn has_node_distinguishes_instances() {
    let mut vol = vol();
    let mut tnc = Tnc::empty(FANOUT);
    let key = Key::ino(64);
    let live = Loc::new(10, 0, 160);
    let dead = Loc::new(10, 320, 160);
    tnc.add(&mut vol, key, live).unwrap();
    assert!(tnc.has_node(&mut vol, key, live).unwrap());
    assert!(!tnc.has_node(&mut vol, key, dead).unwrap());
}
