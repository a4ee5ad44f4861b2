/*
 * Created on Sat Mar 02 2024
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

use core::fmt;

pub type RuntimeResult<T> = Result<T, Error>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Codec level errors. These carry no location on their own; the location
/// is attached by [`Error::at`] where it is known.
pub enum ParseError {
    /// The node magic did not match
    BadMagic,
    /// The stored CRC32 does not cover the node contents
    BadCrc,
    /// The length field is outside the allowed range for the node type
    BadNodeLength,
    /// The node type byte names no known node
    BadNodeType,
    /// The group type byte names no known group state
    BadGroupType,
    /// Structurally sound node whose per-type fields fail validation
    InvalidNode,
    /// The buffer ended before the declared node length
    ShortRead,
    /// The key does not agree with the node that carries it
    BadKey,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Volume device errors
pub enum DeviceError {
    /// Read or write outside the LEB count or past a LEB end
    OutOfBounds,
    /// Offset or length not aligned to the minimal I/O unit
    BadAlignment,
    /// A write did not complete
    WriteFailed,
    /// Read from an unmapped LEB where mapped content was required
    Unmapped,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Consistency failure reasons. Low level code records one of these on the
/// session (see [`ReasonSet`]); higher level code inspects, clears and
/// decides.
pub enum Reason {
    /// Master, log, orphan area or a bud failed to parse
    DataCorrupted,
    /// The on-flash index is damaged beyond the single leaf in question
    TncCorrupted,
    /// A leaf referenced by the index no longer parses
    TncDataCorrupted,
    /// The LEB properties tree is damaged
    LptCorrupted,
    /// The LEB properties tree disagrees with the scanned volume
    LptIncorrect,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// The session-held bitset of [`Reason`]s
pub struct ReasonSet(u8);

impl ReasonSet {
    pub fn set(&mut self, r: Reason) {
        self.0 |= 1 << r as u8;
    }
    pub fn test(&self, r: Reason) -> bool {
        self.0 & (1 << r as u8) != 0
    }
    pub fn clear(&mut self, r: Reason) {
        self.0 &= !(1 << r as u8);
    }
    pub fn any(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    /// OS level I/O failure
    Io(std::io::Error),
    /// Codec failure
    Parse(ParseError),
    /// Device failure
    Device(DeviceError),
    /// A consistency reason that was escalated into the error channel
    Corrupt(Reason),
    /// Control flow: unwind to the top level and run the scavenging
    /// rebuilder against the volume
    NeedRebuild,
    /// Control flow: an unfixable or refused must-fix problem; the exit
    /// bits were already recorded on the session
    Abort,
}

enum_impls! {
    ErrorKind => {
        std::io::Error as Io,
        ParseError as Parse,
        DeviceError as Device,
        Reason as Corrupt,
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Parse(a), Self::Parse(b)) => a == b,
            (Self::Device(a), Self::Device(b)) => a == b,
            (Self::Corrupt(a), Self::Corrupt(b)) => a == b,
            (Self::NeedRebuild, Self::NeedRebuild) => true,
            (Self::Abort, Self::Abort) => true,
            _ => false,
        }
    }
}

#[derive(Debug, PartialEq)]
/// The error type used throughout the engine: a kind plus the on-flash
/// location it was raised for, when one is known
pub struct Error {
    kind: ErrorKind,
    lnum: Option<u32>,
    offs: Option<u32>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
    /// Attach a LEB location to the error
    pub fn at(mut self, lnum: u32, offs: u32) -> Self {
        self.lnum = Some(lnum);
        self.offs = Some(offs);
        self
    }
    pub fn lnum(&self) -> Option<u32> {
        self.lnum
    }
    /// True for the control-flow kinds that must unwind untouched
    pub fn is_control(&self) -> bool {
        matches!(self.kind, ErrorKind::NeedRebuild | ErrorKind::Abort)
    }
    pub fn need_rebuild() -> Self {
        ErrorKind::NeedRebuild.into()
    }
    pub fn abort() -> Self {
        ErrorKind::Abort.into()
    }
}

impl<E: Into<ErrorKind>> From<E> for Error {
    fn from(e: E) -> Self {
        Self {
            kind: e.into(),
            lnum: None,
            offs: None,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BadMagic => "bad node magic",
            Self::BadCrc => "bad node CRC",
            Self::BadNodeLength => "bad node length",
            Self::BadNodeType => "unknown node type",
            Self::BadGroupType => "unknown group type",
            Self::InvalidNode => "invalid node contents",
            Self::ShortRead => "node truncated",
            Self::BadKey => "key disagrees with node",
        })
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfBounds => "access outside the volume",
            Self::BadAlignment => "access not aligned to the min I/O unit",
            Self::WriteFailed => "write failed",
            Self::Unmapped => "LEB is not mapped",
        })
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DataCorrupted => "corrupted data",
            Self::TncCorrupted => "corrupted index",
            Self::TncDataCorrupted => "corrupted node behind the index",
            Self::LptCorrupted => "corrupted LEB properties tree",
            Self::LptIncorrect => "incorrect LEB properties",
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(lnum), Some(offs)) = (self.lnum, self.offs) {
            write!(f, "LEB {}:{}: ", lnum, offs)?;
        }
        match &self.kind {
            ErrorKind::Io(e) => write!(f, "I/O error: {}", e),
            ErrorKind::Parse(e) => write!(f, "{}", e),
            ErrorKind::Device(e) => write!(f, "{}", e),
            ErrorKind::Corrupt(r) => write!(f, "{}", r),
            ErrorKind::NeedRebuild => f.write_str("filesystem needs rebuilding"),
            ErrorKind::Abort => f.write_str("uncorrectable error"),
        }
    }
}

impl std::error::Error for Error {}
