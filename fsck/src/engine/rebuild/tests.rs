/*
 * Created on Sun Jun 02 2024
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
    crate::engine::{
        dev::Volume,
        ondisk::{node::DentType, Key, Node, ROOT_INO, SB_LNUM, S_IFDIR, S_IFREG},
        problem::Mode,
        tests::{find_dent, find_ino, mount_ro, run_mode, test_sb, VolumeBuilder},
        tnc::read_node,
    },
    libfsck::EXIT_OK,
};

#[test]
fn rebuild_round_trip_preserves_the_hierarchy() {
    let mut b = VolumeBuilder::new();
    b.root();
    b.reg(ROOT_INO, "a", 64, &vec![0x11u8; 128 * 1024]);
    b.dir(ROOT_INO, "b", 65);
    b.reg(65, "c", 66, &[0x22u8; 50]);
    let vol = b.finish();
    // rebuild the (already consistent) volume once more
    assert_eq!(run_mode(&vol, Mode::Rebuild) & libfsck::EXIT_ERROR, 0);
    let (mut sess, mut fs) = mount_ro(&vol);
    let (_, root) = find_ino(&mut sess, &mut fs, ROOT_INO).unwrap();
    assert_eq!(root.mode & crate::engine::ondisk::S_IFMT, S_IFDIR);
    // nlink of the root: 2 + one subdirectory
    assert_eq!(root.nlink, 3);
    let (_, a) = find_ino(&mut sess, &mut fs, 64).unwrap();
    assert_eq!((a.size, a.nlink), (128 * 1024, 1));
    let dent_a = find_dent(&mut sess, &mut fs, ROOT_INO, "a").unwrap();
    assert_eq!((dent_a.inum, dent_a.dtype), (64, DentType::Reg as u8));
    let (_, c) = find_ino(&mut sess, &mut fs, 66).unwrap();
    assert_eq!(c.size, 50);
    // all 32 data blocks of /a survived
    for block in 0..32 {
        assert!(
            fs.tnc
                .lookup(&mut *sess.vol, Key::data(64, block))
                .unwrap()
                .is_some(),
            "block {}",
            block
        );
    }
    drop((sess, fs));
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
}

#[test]
fn deletion_tombstones_win_by_sequence_number() {
    let mut b = VolumeBuilder::new();
    b.root();
    b.reg(ROOT_INO, "keep", 64, b"kept");
    b.reg(ROOT_INO, "gone", 65, b"doomed");
    // a younger deletion inode for 65
    let sqnum = b.next_sqnum();
    let del = super::super::tests::ino_node(65, S_IFREG | 0o644, 0, 0, sqnum);
    let bytes = del.encode();
    b.put(&bytes);
    let vol = b.finish();
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 64).is_some());
    assert!(find_ino(&mut sess, &mut fs, 65).is_none());
    assert!(find_dent(&mut sess, &mut fs, ROOT_INO, "gone").is_none());
    drop((sess, fs));
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
}

#[test]
fn older_deletion_loses_to_a_younger_inode() {
    let mut b = VolumeBuilder::new();
    b.root();
    // deletion first, recreation afterwards
    let sqnum = b.next_sqnum();
    b.put(&super::super::tests::ino_node(64, S_IFREG | 0o644, 0, 0, sqnum).encode());
    b.reg(ROOT_INO, "phoenix", 64, b"alive");
    let vol = b.finish();
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 64).is_some());
    drop((sess, fs));
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
}

#[test]
fn unreachable_subtree_is_dropped() {
    let mut b = VolumeBuilder::new();
    b.root();
    b.reg(ROOT_INO, "kept", 64, b"data");
    // a directory with a child, but no entry anywhere points at the dir
    b.ino(80, S_IFDIR | 0o755, 2, 160);
    b.reg(80, "stranded", 81, b"lost");
    let vol = b.finish();
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 64).is_some());
    assert!(find_ino(&mut sess, &mut fs, 80).is_none());
    assert!(find_ino(&mut sess, &mut fs, 81).is_none());
    drop((sess, fs));
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
}

#[test]
fn newest_data_version_wins() {
    let mut b = VolumeBuilder::new();
    b.root();
    b.ino(64, S_IFREG | 0o644, 1, 4096);
    b.dent(ROOT_INO, "f", 64, DentType::Reg);
    b.data(64, 0, &[0xAAu8; 4096]);
    b.data(64, 0, &[0xBBu8; 4096]);
    let vol = b.finish();
    let (mut sess, mut fs) = mount_ro(&vol);
    let loc = fs
        .tnc
        .lookup(&mut *sess.vol, Key::data(64, 0))
        .unwrap()
        .unwrap();
    match read_node(&mut *sess.vol, loc).unwrap() {
        Node::Data(data) => assert_eq!(data.data, vec![0xBBu8; 4096]),
        other => panic!("{}", other.node_type()),
    }
}

#[test]
fn truncation_drops_stale_tail_blocks() {
    let mut b = VolumeBuilder::new();
    b.root();
    b.ino(64, S_IFREG | 0o644, 1, 8192);
    b.dent(ROOT_INO, "t", 64, DentType::Reg);
    b.data(64, 0, &[1u8; 4096]);
    b.data(64, 1, &[2u8; 4096]);
    b.trun(64, 8192, 4096);
    let vol = b.finish();
    let (mut sess, mut fs) = mount_ro(&vol);
    let (_, ino) = find_ino(&mut sess, &mut fs, 64).unwrap();
    assert_eq!(ino.size, 4096);
    assert!(fs
        .tnc
        .lookup(&mut *sess.vol, Key::data(64, 0))
        .unwrap()
        .is_some());
    assert!(fs
        .tnc
        .lookup(&mut *sess.vol, Key::data(64, 1))
        .unwrap()
        .is_none());
    drop((sess, fs));
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
}

#[test]
fn an_empty_volume_gets_a_fresh_root() {
    let mut vol = crate::engine::dev::SharedVolume::new(
        super::super::tests::LEB_SZ,
        super::super::tests::LEB_CNT,
        super::super::tests::MIN_IO,
    );
    vol.leb_change(
        SB_LNUM,
        &test_sb(super::super::tests::LEB_SZ, super::super::tests::LEB_CNT).encode(),
    )
    .unwrap();
    assert_eq!(run_mode(&vol, Mode::Rebuild) & libfsck::EXIT_ERROR, 0);
    let (mut sess, mut fs) = mount_ro(&vol);
    let (_, root) = find_ino(&mut sess, &mut fs, ROOT_INO).unwrap();
    assert_eq!(root.nlink, 2);
    assert_eq!(root.mode & crate::engine::ondisk::S_IFMT, S_IFDIR);
    drop((sess, fs));
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
}

#[test]
fn torn_main_leb_escalates_and_is_rewritten() {
    let mut b = VolumeBuilder::new();
    b.root();
    b.reg(ROOT_INO, "a", 64, &vec![9u8; 4096]);
    let vol = b.finish();
    // plant garbage into the free tail of the LEB holding the survivors
    let (mut sess, mut fs) = mount_ro(&vol);
    let (loc, _) = find_ino(&mut sess, &mut fs, 64).unwrap();
    drop((sess, fs));
    let tail = super::super::tests::LEB_SZ - 64;
    vol.0.patch(loc.lnum, tail, &[0x13u8; 32]);
    // check mode trips over the garbage and gives up
    assert_ne!(run_mode(&vol, Mode::Check) & libfsck::EXIT_UNCORRECTED, 0);
    // danger level 1 escalates into a rebuild that scrubs the LEB
    let code = run_mode(&vol, Mode::Danger1);
    assert_ne!(code & libfsck::EXIT_NONDESTRUCT, 0, "code {}", code);
    let (mut sess2, mut fs2) = mount_ro(&vol);
    assert!(find_ino(&mut sess2, &mut fs2, 64).is_some());
    drop((sess2, fs2));
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
}
