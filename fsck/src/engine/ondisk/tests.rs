/*
 * Created on Wed Mar 13 2024
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
        key::{r5_hash, Key, KeyType, KEY_ARG_MASK},
        node::{Branch, CsNode, DataNode, DentNode, IdxNode, InoNode, Node, TrunNode},
        parse_node, seal_node, CommonHdr, GroupType, NodeType, COMMON_HDR_SZ, DATA_NODE_SZ,
        S_IFDIR, S_IFREG,
    },
    crate::engine::error::{ErrorKind, ParseError},
};

fn ino(inum: u32, mode: u32, nlink: u32, size: u64, sqnum: u64) -> InoNode {
    InoNode {
        ch: CommonHdr::synth(NodeType::Ino, sqnum),
        key: Key::ino(inum),
        creat_sqnum: sqnum,
        size,
        atime_sec: 7,
        ctime_sec: 7,
        mtime_sec: 7,
        atime_nsec: 0,
        ctime_nsec: 0,
        mtime_nsec: 0,
        nlink,
        uid: 0,
        gid: 0,
        mode,
        flags: 0,
        data_len: 0,
        xattr_cnt: 0,
        xattr_size: 0,
        xattr_names: 0,
        compr_type: 0,
        data: vec![],
    }
}

fn dent(host: u32, name: &str, target: u64, dtype: u8, sqnum: u64) -> DentNode {
    DentNode {
        ch: CommonHdr::synth(NodeType::Dent, sqnum),
        key: Key::dent(host, name.as_bytes()),
        inum: target,
        dtype,
        cookie: 0,
        name: name.as_bytes().to_vec(),
    }
}

fn data(inum: u32, block: u32, payload: &[u8], sqnum: u64) -> DataNode {
    DataNode {
        ch: CommonHdr::synth(NodeType::Data, sqnum),
        key: Key::data(inum, block),
        size: payload.len() as u32,
        compr_type: 0,
        compr_size: 0,
        data: payload.to_vec(),
    }
}

fn expect_parse_err(buf: &[u8], want: ParseError) {
    match parse_node(buf, 0, 0) {
        Err(e) => assert_eq!(e.kind(), &ErrorKind::Parse(want)),
        Ok(n) => panic!("parsed {:?}, wanted {:?}", n.node_type(), want),
    }
}

/*
    common header
*/

#[test]
fn header_round_trip() {
    let mut buf = vec![0u8; 64];
    seal_node(&mut buf, NodeType::Ref, GroupType::None, 77);
    let ch = CommonHdr::decode_and_verify(&buf).unwrap();
    assert_eq!(ch.sqnum, 77);
    assert_eq!(ch.len, 64);
    assert_eq!(ch.node_type, NodeType::Ref);
    assert_eq!(ch.group_type, GroupType::None);
}

#[test]
fn header_rejects_bad_magic() {
    let mut buf = vec![0u8; 64];
    seal_node(&mut buf, NodeType::Ref, GroupType::None, 1);
    buf[0] ^= 0x01;
    assert_eq!(
        CommonHdr::decode_and_verify(&buf).unwrap_err(),
        ParseError::BadMagic
    );
}

#[test]
fn any_single_byte_flip_is_detected() {
    let node = ino(64, S_IFREG | 0o644, 1, 0, 9).encode();
    for pos in 0..node.len() {
        let mut bad = node.clone();
        bad[pos] ^= 0x80;
        assert!(
            parse_node(&bad, 3, 160).is_err(),
            "flip at byte {} escaped detection",
            pos
        );
    }
}

#[test]
fn crc_high_bit_flip_never_escapes() {
    let node = ino(64, S_IFREG | 0o644, 1, 0, 9).encode();
    let mut bad = node.clone();
    // highest bit of the stored CRC32
    bad[7] ^= 0x80;
    expect_parse_err(&bad, ParseError::BadCrc);
}

#[test]
fn payload_flip_reports_bad_crc() {
    let node = ino(64, S_IFREG | 0o644, 1, 0, 9).encode();
    let mut bad = node.clone();
    bad[COMMON_HDR_SZ + 40] ^= 0x01;
    expect_parse_err(&bad, ParseError::BadCrc);
}

/*
    keys
*/

#[test]
fn key_ordering_is_inum_type_arg() {
    let mut keys = vec![
        Key::data(2, 9),
        Key::ino(2),
        Key::data(2, 1),
        Key::ino(1),
        Key::dent_hash(1, 500),
        Key::data(3, 0),
    ];
    keys.sort();
    assert_eq!(
        keys,
        intovec![
            Key::ino(1),
            Key::dent_hash(1, 500),
            Key::ino(2),
            Key::data(2, 1),
            Key::data(2, 9),
            Key::data(3, 0),
        ]
    );
}

#[test]
fn key_wire_round_trip() {
    for key in [
        Key::ino(1),
        Key::data(91, 0x1FFF_FFFF),
        Key::dent(4, b"hello"),
        Key::xent(4, b"user.attr"),
    ] {
        assert_eq!(Key::from_wire(key.to_wire()), Some(key));
    }
}

#[test]
fn key_wire_rejects_junk_type() {
    let mut raw = Key::ino(5).to_wire();
    // plant type 7 in the top three bits of the second word
    raw[7] |= 0xE0;
    assert_eq!(Key::from_wire(raw), None);
}

#[test]
fn r5_hash_stays_in_range() {
    for name in [
        &b"a"[..],
        b"..",
        b"lost+found",
        b"a-very-long-name-that-keeps-going-and-going",
        b"\xFF\xFE\x80 high bytes are signed",
    ] {
        let h = r5_hash(name);
        assert!(h >= 3);
        assert!(h <= KEY_ARG_MASK);
        assert_eq!(h, r5_hash(name));
    }
}

/*
    typed nodes
*/

#[test]
fn ino_round_trip() {
    let node = ino(128, S_IFDIR | 0o755, 2, 160, 41);
    let bytes = node.encode();
    match parse_node(&bytes, 0, 0).unwrap() {
        Node::Ino(out) => {
            assert_eq!(out.key, Key::ino(128));
            assert_eq!(out.nlink, 2);
            assert_eq!(out.size, 160);
            assert_eq!(out.mode, S_IFDIR | 0o755);
            assert_eq!(out.ch.sqnum, 41);
        }
        other => panic!("{:?}", other),
    }
}

#[test]
fn dent_round_trip_and_hash_agreement() {
    let node = dent(1, "passwd", 65, 0, 10);
    let bytes = node.encode();
    match parse_node(&bytes, 0, 0).unwrap() {
        Node::Dent(out) => {
            assert_eq!(out.name, b"passwd");
            assert_eq!(out.inum, 65);
            assert_eq!(out.key.knd(), KeyType::Dent);
            assert_eq!(out.key.arg(), r5_hash(b"passwd"));
        }
        other => panic!("{:?}", other),
    }
}

#[test]
fn dent_name_hash_mismatch_is_invalid() {
    let mut node = dent(1, "passwd", 65, 0, 10);
    node.key = Key::dent(1, b"shadow");
    expect_parse_err(&node.encode(), ParseError::InvalidNode);
}

#[test]
fn data_round_trip() {
    let node = data(70, 3, &[0xAB; 512], 12);
    let bytes = node.encode();
    match parse_node(&bytes, 0, 0).unwrap() {
        Node::Data(out) => {
            assert_eq!(out.block(), 3);
            assert_eq!(out.inum(), 70);
            assert_eq!(out.size, 512);
            assert_eq!(out.data, vec![0xAB; 512]);
        }
        other => panic!("{:?}", other),
    }
}

#[test]
fn data_size_zero_is_rejected() {
    let mut node = data(70, 3, &[0xAB; 16], 12);
    node.size = 0;
    expect_parse_err(&node.encode(), ParseError::InvalidNode);
}

#[test]
fn data_node_cannot_exceed_a_block() {
    let node = data(70, 3, &vec![1u8; 4097], 12);
    let bytes = node.encode();
    assert_eq!(bytes.len(), DATA_NODE_SZ + 4097);
    expect_parse_err(&bytes, ParseError::BadNodeLength);
}

#[test]
fn truncation_must_shrink() {
    let good = TrunNode {
        ch: CommonHdr::synth(NodeType::Trun, 5),
        inum: 70,
        old_size: 8192,
        new_size: 4096,
    };
    assert!(parse_node(&good.encode(), 0, 0).is_ok());
    let bad = TrunNode {
        old_size: 4096,
        new_size: 4096,
        ..good
    };
    expect_parse_err(&bad.encode(), ParseError::InvalidNode);
}

#[test]
fn idx_round_trip_and_ordering() {
    let mk = |keys: &[Key]| IdxNode {
        ch: CommonHdr::synth(NodeType::Idx, 90),
        level: 0,
        branches: keys
            .iter()
            .map(|&key| Branch {
                lnum: 21,
                offs: 0,
                len: 160,
                key,
            })
            .collect(),
    };
    let good = mk(&[Key::ino(1), Key::ino(2), Key::data(2, 0)]);
    match parse_node(&good.encode(), 0, 0).unwrap() {
        Node::Idx(out) => {
            assert_eq!(out.level, 0);
            assert_eq!(out.branches.len(), 3);
            assert_eq!(out.branches[2].key, Key::data(2, 0));
        }
        other => panic!("{:?}", other),
    }
    let bad = mk(&[Key::ino(2), Key::ino(1)]);
    expect_parse_err(&bad.encode(), ParseError::InvalidNode);
}

#[test]
fn node_dump_shows_per_type_fields() {
    let ino_dump = parse_node(&ino(128, S_IFDIR | 0o755, 2, 160, 41).encode(), 0, 0)
        .unwrap()
        .to_string();
    assert!(ino_dump.contains("nlink 2"), "{}", ino_dump);
    assert!(ino_dump.contains("mode 40755"), "{}", ino_dump);
    assert!(ino_dump.contains("size 160"), "{}", ino_dump);
    let dent_dump = parse_node(&dent(1, "passwd", 65, 0, 10).encode(), 0, 0)
        .unwrap()
        .to_string();
    assert!(dent_dump.contains("name \"passwd\""), "{}", dent_dump);
    assert!(dent_dump.contains("inum 65"), "{}", dent_dump);
    let trun_dump = parse_node(
        &TrunNode {
            ch: CommonHdr::synth(NodeType::Trun, 5),
            inum: 70,
            old_size: 8192,
            new_size: 4096,
        }
        .encode(),
        0,
        0,
    )
    .unwrap()
    .to_string();
    assert!(trun_dump.contains("old size 8192"), "{}", trun_dump);
    assert!(trun_dump.contains("new size 4096"), "{}", trun_dump);
}

#[test]
fn cs_round_trip() {
    let node = CsNode {
        ch: CommonHdr::synth(NodeType::Cs, 1),
        cmt_no: 17,
    };
    match parse_node(&node.encode(), 0, 0).unwrap() {
        Node::Cs(out) => assert_eq!(out.cmt_no, 17),
        other => panic!("{:?}", other),
    }
}
