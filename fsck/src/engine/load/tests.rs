/*
 * Created on Tue Jun 18 2024
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
        dev::{SharedVolume, Volume},
        ondisk::{
            node::{DataNode, DentNode, DentType, OrphNode, RefNode},
            CommonHdr, GroupType, Key, NodeType, BASE_HEAD, LOG_LNUM, ROOT_INO, S_IFREG,
        },
        problem::Mode,
        tests::{find_dent, find_ino, ino_node, mount_ro, run_mode, VolumeBuilder},
        tnc::Loc,
    },
    libfsck::EXIT_OK,
};

/// Append a journal to a consistent volume: reference nodes into the
/// log, bud content into an empty main LEB
struct JournalWriter {
    vol: SharedVolume,
    bud_lnum: u32,
    bud: Vec<u8>,
    log_offs: u32,
    sqnum: u64,
}

impl JournalWriter {
    fn new(vol: &SharedVolume) -> Self {
        let (mut sess, fs) = mount_ro(vol);
        // any unmapped main LEB makes a bud
        let mut bud_lnum = None;
        for lnum in fs.geom.main_first..fs.geom.main_first + fs.geom.main_lebs {
            if !sess.vol.is_mapped(lnum).unwrap() {
                bud_lnum = Some(lnum);
                break;
            }
        }
        // the log currently holds one commit start node
        let log_offs = 32;
        let sqnum = fs.max_sqnum + 100;
        drop(fs);
        Self {
            vol: vol.clone(),
            bud_lnum: bud_lnum.expect("no empty main LEB for a bud"),
            bud: Vec::new(),
            log_offs,
            sqnum,
        }
    }
    fn next_sqnum(&mut self) -> u64 {
        self.sqnum += 1;
        self.sqnum
    }
    fn push(&mut self, mut bytes: Vec<u8>) {
        let aligned = crate::util::align8(bytes.len() as u32) as usize;
        bytes.resize(aligned, 0xFF);
        self.bud.extend_from_slice(&bytes);
    }
    fn ino(&mut self, inum: u32, nlink: u32, size: u64, group: GroupType) {
        let sqnum = self.next_sqnum();
        let mut node = ino_node(inum, S_IFREG | 0o644, nlink, size, sqnum);
        node.ch = node.ch.with_group(group);
        self.push(node.encode());
    }
    fn dent(&mut self, parent: u32, name: &str, target: u32, group: GroupType) {
        let sqnum = self.next_sqnum();
        self.push(
            DentNode {
                ch: CommonHdr::synth(NodeType::Dent, sqnum).with_group(group),
                key: Key::dent(parent, name.as_bytes()),
                inum: target as u64,
                dtype: DentType::Reg as u8,
                cookie: 0,
                name: name.as_bytes().to_vec(),
            }
            .encode(),
        );
    }
    fn data(&mut self, inum: u32, block: u32, payload: &[u8]) {
        let sqnum = self.next_sqnum();
        self.push(
            DataNode {
                ch: CommonHdr::synth(NodeType::Data, sqnum),
                key: Key::data(inum, block),
                size: payload.len() as u32,
                compr_type: 0,
                compr_size: 0,
                data: payload.to_vec(),
            }
            .encode(),
        );
    }
    /// Write the bud and the reference node pointing at it
    fn commit(mut self) -> SharedVolume {
        let sqnum = self.next_sqnum();
        self.vol.leb_change(self.bud_lnum, &self.bud).unwrap();
        let rn = RefNode {
            ch: CommonHdr::synth(NodeType::Ref, sqnum),
            lnum: self.bud_lnum,
            offs: 0,
            jhead: BASE_HEAD,
        }
        .encode();
        self.vol.leb_write(LOG_LNUM, self.log_offs, &rn).unwrap();
        self.vol.clone()
    }
}

fn healthy() -> SharedVolume {
    let mut b = VolumeBuilder::new();
    b.root();
    b.reg(ROOT_INO, "base", 64, b"base file");
    b.finish()
}

#[test]
fn journal_replay_applies_new_files() {
    let vol = healthy();
    let mut j = JournalWriter::new(&vol);
    j.ino(70, 1, 9, GroupType::None);
    j.dent(ROOT_INO, "from-log", 70, GroupType::None);
    j.data(70, 0, b"journaled");
    let vol = j.commit();
    let (mut sess, mut fs) = mount_ro(&vol);
    assert_eq!(fs.buds.len(), 1);
    assert!(find_ino(&mut sess, &mut fs, 70).is_some());
    assert!(find_dent(&mut sess, &mut fs, ROOT_INO, "from-log").is_some());
    drop((sess, fs));
    // a writing run folds the journal into the index and settles space
    let code = run_mode(&vol, Mode::Safe);
    assert_eq!(code & libfsck::EXIT_ERROR, 0, "code {}", code);
    assert_eq!(run_mode(&vol, Mode::Check), EXIT_OK);
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 70).is_some());
}

#[test]
fn unclosed_group_is_discarded_whole() {
    let vol = healthy();
    let mut j = JournalWriter::new(&vol);
    j.ino(71, 1, 0, GroupType::InGroup);
    j.dent(ROOT_INO, "half", 71, GroupType::InGroup);
    // no LastOfGroup member: the whole group must vanish
    let vol = j.commit();
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 71).is_none());
    assert!(find_dent(&mut sess, &mut fs, ROOT_INO, "half").is_none());
}

#[test]
fn closed_group_applies_atomically() {
    let vol = healthy();
    let mut j = JournalWriter::new(&vol);
    j.ino(72, 1, 0, GroupType::InGroup);
    j.dent(ROOT_INO, "whole", 72, GroupType::LastOfGroup);
    let vol = j.commit();
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 72).is_some());
    assert!(find_dent(&mut sess, &mut fs, ROOT_INO, "whole").is_some());
}

#[test]
fn journal_deletion_entries_replay() {
    let vol = healthy();
    let mut j = JournalWriter::new(&vol);
    // delete /base: a zero-nlink inode plus a tombstone entry
    let sqnum = j.next_sqnum();
    let mut del = ino_node(64, S_IFREG | 0o644, 0, 0, sqnum);
    del.ch = del.ch.with_group(GroupType::None);
    j.push(del.encode());
    let sqnum = j.next_sqnum();
    j.push(
        DentNode {
            ch: CommonHdr::synth(NodeType::Dent, sqnum),
            key: Key::dent(ROOT_INO, b"base"),
            inum: 0,
            dtype: DentType::Reg as u8,
            cookie: 0,
            name: b"base".to_vec(),
        }
        .encode(),
    );
    let vol = j.commit();
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 64).is_none());
    assert!(find_dent(&mut sess, &mut fs, ROOT_INO, "base").is_none());
}

#[test]
fn orphans_are_deleted_after_mount() {
    let vol = healthy();
    // plant a surviving inode with no entry, then orphan it
    let (mut sess, fs) = mount_ro(&vol);
    let orph_lnum = fs.geom.orph_first;
    drop(fs);
    let orph = OrphNode {
        ch: CommonHdr::synth(NodeType::Orph, 10_000),
        cmt_no: 1 | (1 << 63),
        inos: vec![64],
    }
    .encode();
    sess.vol.leb_change(orph_lnum, &orph).unwrap();
    drop(sess);
    let (mut sess, mut fs) = mount_ro(&vol);
    assert_eq!(fs.orphans, vec![64]);
    // the checker applies the scheduled deletion before anything else
    crate::engine::load::orphan::apply_orphans(&mut sess, &mut fs).unwrap();
    assert!(fs
        .tnc
        .lookup(&mut *sess.vol, Key::ino(64))
        .unwrap()
        .is_none());
}

#[test]
fn master_copies_must_be_scannable() {
    let vol = healthy();
    // truncating the master LEBs to garbage kills the mount
    vol.0.patch(crate::engine::ondisk::MST_LNUM, 0, &[0u8; 512]);
    vol.0.patch(crate::engine::ondisk::MST_LNUM + 1, 0, &[0u8; 512]);
    let mut sess = crate::engine::tests::session(&vol, Mode::Check);
    let err = crate::engine::load::mount(&mut sess).unwrap_err();
    assert!(
        matches!(
            err.kind(),
            crate::engine::error::ErrorKind::Abort | crate::engine::error::ErrorKind::NeedRebuild
        ),
        "{:?}",
        err
    );
    assert_ne!(sess.exit_code & libfsck::EXIT_UNCORRECTED, 0);
}

#[test]
fn replayed_leaves_point_into_the_bud() {
    let vol = healthy();
    let mut j = JournalWriter::new(&vol);
    j.ino(75, 1, 0, GroupType::None);
    j.dent(ROOT_INO, "new", 75, GroupType::LastOfGroup);
    let vol = j.commit();
    // sanity: replay worked at all
    let (mut sess, mut fs) = mount_ro(&vol);
    assert!(find_ino(&mut sess, &mut fs, 75).is_some());
    // bud location is recorded
    assert_eq!(fs.buds[0].offs, 0);
    let loc: Loc = fs
        .tnc
        .lookup(&mut *sess.vol, Key::ino(75))
        .unwrap()
        .unwrap();
    assert_eq!(loc.lnum, fs.buds[0].lnum);
}
