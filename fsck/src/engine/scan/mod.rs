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

//! # The LEB scanner
//!
//! Walks one LEB from offset zero, consuming 8-byte-aligned nodes and
//! padding until it reaches empty space (the first erased byte at an
//! aligned position followed only by erased bytes), garbage, or a node
//! that no longer checks out. The walk itself never fails: the caller
//! inspects how the scan ended and decides whether that is fatal for
//! the region the LEB belongs to.

#[cfg(test)]
mod tests;

use {
    crate::{
        engine::{
            error::{Error, ParseError, Reason, RuntimeResult},
            ondisk::{self, CommonHdr, Node, COMMON_HDR_SZ, ERASED_BYTE},
        },
        util::align8,
    },
    log::{debug, trace},
};

#[derive(Debug, Clone, PartialEq)]
/// One node the scanner accepted
pub struct ScannedNode {
    pub offs: u32,
    pub len: u32,
    pub node: Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a LEB scan ended
pub enum SlebEnd {
    /// Erased space (or the exact LEB end) was reached; the LEB is sound
    EmptySpace,
    /// Bytes that are neither a node, padding nor erased space
    Garbage,
    /// A node started here but failed its checks; recoverable in the
    /// sense that everything before it stays valid
    BadNode(ParseError),
}

#[derive(Debug, Clone, PartialEq)]
/// A scanned LEB
pub struct Sleb {
    pub lnum: u32,
    pub nodes: Vec<ScannedNode>,
    /// First byte past the last accepted node or padding run
    pub endpt: u32,
    pub end: SlebEnd,
}

impl Sleb {
    pub fn is_sound(&self) -> bool {
        self.end == SlebEnd::EmptySpace
    }
    /// True if the LEB holds nothing at all
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.endpt == 0 && self.is_sound()
    }
    pub fn highest_sqnum(&self) -> u64 {
        self.nodes.iter().map(|n| n.node.sqnum()).max().unwrap_or(0)
    }
}

/// Scan the given LEB image. `buf` must be the whole LEB.
pub fn scan_leb(lnum: u32, buf: &[u8]) -> Sleb {
    let mut nodes = Vec::new();
    let mut offs = 0usize;
    let end = loop {
        if offs + COMMON_HDR_SZ > buf.len() {
            break tail_state(&buf[offs..]);
        }
        if buf[offs] == ERASED_BYTE {
            break tail_state(&buf[offs..]);
        }
        match CommonHdr::decode_quiet(&buf[offs..]) {
            Err(ParseError::BadMagic) => {
                debug!("LEB {}:{}: garbage instead of a node", lnum, offs);
                break SlebEnd::Garbage;
            }
            Err(e) => {
                debug!("LEB {}:{}: corrupt node header ({})", lnum, offs, e);
                break SlebEnd::BadNode(e);
            }
            Ok(hdr) => match ondisk::parse_node(&buf[offs..], lnum, offs as u32) {
                Err(e) => {
                    let kind = match e.kind() {
                        crate::engine::error::ErrorKind::Parse(p) => *p,
                        _ => ParseError::InvalidNode,
                    };
                    debug!("LEB {}:{}: corrupt {} ({})", lnum, offs, hdr.node_type, kind);
                    break SlebEnd::BadNode(kind);
                }
                Ok(Node::Pad(pad)) => {
                    let covered = align8(pad.covered()) as usize;
                    if covered < ondisk::PAD_NODE_SZ || offs + covered > buf.len() {
                        debug!("LEB {}:{}: padding overruns the LEB", lnum, offs);
                        break SlebEnd::BadNode(ParseError::InvalidNode);
                    }
                    trace!("LEB {}:{}: padding covering {} bytes", lnum, offs, covered);
                    offs += covered;
                }
                Ok(node) => {
                    debug!("LEB {}:{}: {}", lnum, offs, node);
                    nodes.push(ScannedNode {
                        offs: offs as u32,
                        len: hdr.len,
                        node,
                    });
                    offs += align8(hdr.len) as usize;
                }
            },
        }
    };
    Sleb {
        lnum,
        nodes,
        endpt: offs as u32,
        end,
    }
}

/// Classify the bytes from the stop position to the LEB end: all erased
/// means clean empty space, anything else is garbage
fn tail_state(tail: &[u8]) -> SlebEnd {
    if tail.iter().all(|&b| b == ERASED_BYTE) {
        SlebEnd::EmptySpace
    } else {
        SlebEnd::Garbage
    }
}

/// Scan and insist the LEB is fully sound; used for the regions where a
/// damaged LEB condemns the whole region
pub fn scan_leb_strict(lnum: u32, buf: &[u8]) -> RuntimeResult<Sleb> {
    let sleb = scan_leb(lnum, buf);
    match sleb.end {
        SlebEnd::EmptySpace => Ok(sleb),
        SlebEnd::Garbage => Err(Error::from(Reason::DataCorrupted).at(lnum, sleb.endpt)),
        SlebEnd::BadNode(e) => Err(Error::from(e).at(lnum, sleb.endpt)),
    }
}
