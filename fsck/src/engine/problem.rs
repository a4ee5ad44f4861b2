/*
 * Created on Thu May 09 2024
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

//! # The problem taxonomy and decision policy
//!
//! Every inconsistency the engine can find is one of the kinds below.
//! A static table assigns each kind its flags; the operating mode turns
//! flags into a default answer; the default and (in normal mode) the
//! operator's answer turn into fix, skip, or abort.

use core::fmt;

/*
    problem flags
*/

consts! {
    /// There is a fix procedure at all; without it the run aborts
    pub PROBLEM_FIXABLE: u8 = 1 << 0;
    /// Refusing the fix means the filesystem stays broken: abort
    pub PROBLEM_MUST_FIX: u8 = 1 << 1;
    /// The fix throws user data away; disallowed in safe mode
    pub PROBLEM_DROP_DATA: u8 = 1 << 2;
    /// The fix is a full scavenging rebuild
    pub PROBLEM_NEED_REBUILD: u8 = 1 << 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The operating mode, from the command line
pub enum Mode {
    /// Read-only: report, fix nothing
    Check,
    /// Ask the operator about every problem
    Normal,
    /// Fix automatically unless data would be dropped
    Safe,
    /// Fix automatically, dropping data if needed; refuse to rebuild
    Danger0,
    /// Like danger level 0, but rebuild when required
    Danger1,
    /// Skip checking, rebuild unconditionally
    Rebuild,
}

impl Mode {
    pub fn read_only(&self) -> bool {
        matches!(self, Self::Check)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A detected inconsistency with the payload the prompt and logs need
pub enum Problem {
    SbCorrupted,
    MstCorrupted,
    LogCorrupted { lnum: u32 },
    BudCorrupted { lnum: u32 },
    OrphanCorrupted { lnum: u32 },
    InvalidInoNode { lnum: u32, offs: u32 },
    InvalidDentNode { lnum: u32, offs: u32 },
    InvalidDataNode { lnum: u32, offs: u32 },
    ScanCorrupted { lnum: u32 },
    FileHasNoInode { inum: u32 },
    FileHasZeroNlinkInode { inum: u32 },
    FileHasInconsistType { inum: u32, name: Vec<u8> },
    FileHasTooManyDent { inum: u32, name: Vec<u8> },
    FileShouldntHaveData { inum: u32 },
    FileHasNoDent { inum: u32 },
    FileRootHasDent { name: Vec<u8> },
    FileIsDisconnected { inum: u32 },
    FileHasNoEncrypt { inum: u32 },
    XattrHasNoHost { inum: u32 },
    XattrHasWrongHost { inum: u32, host: u32 },
    DentryIsUnreachable { inum: u32, name: Vec<u8> },
    FileIsInconsistent { inum: u32 },
    TncDataCorrupted { lnum: u32, offs: u32 },
    TncCorrupted,
    EmptyTnc,
    LptCorrupted,
    LpIncorrect { lnum: u32 },
    SpaceStatIncorrect,
    IncorrectIdxSz { stored: u64, calc: u64 },
    RootDirNotFound,
    DisconnectedFileCannotBeRecovered { inum: u32 },
}

impl Problem {
    /// The static policy table
    pub fn flags(&self) -> u8 {
        use Problem::*;
        const FIX: u8 = PROBLEM_FIXABLE;
        const MUST: u8 = PROBLEM_MUST_FIX;
        const DROP: u8 = PROBLEM_DROP_DATA;
        const REBUILD: u8 = PROBLEM_NEED_REBUILD;
        match self {
            SbCorrupted => 0,
            MstCorrupted => FIX | MUST | DROP | REBUILD,
            LogCorrupted { .. } => FIX | MUST | DROP | REBUILD,
            BudCorrupted { .. } => FIX | MUST | DROP | REBUILD,
            OrphanCorrupted { .. } => FIX | MUST | DROP,
            InvalidInoNode { .. } => FIX | MUST | DROP,
            InvalidDentNode { .. } => FIX | MUST | DROP,
            InvalidDataNode { .. } => FIX | MUST | DROP,
            ScanCorrupted { .. } => FIX | MUST | DROP | REBUILD,
            FileHasNoInode { .. } => FIX | MUST | DROP,
            FileHasZeroNlinkInode { .. } => FIX | MUST | DROP,
            FileHasInconsistType { .. } => FIX | MUST | DROP,
            FileHasTooManyDent { .. } => FIX | MUST | DROP,
            FileShouldntHaveData { .. } => FIX | MUST | DROP,
            FileHasNoDent { .. } => FIX | MUST | DROP,
            FileRootHasDent { .. } => FIX | MUST | DROP,
            FileIsDisconnected { .. } => FIX | DROP,
            FileHasNoEncrypt { .. } => FIX | MUST | DROP,
            XattrHasNoHost { .. } => FIX | MUST | DROP,
            XattrHasWrongHost { .. } => FIX | MUST | DROP,
            DentryIsUnreachable { .. } => FIX | MUST | DROP,
            FileIsInconsistent { .. } => FIX | MUST,
            TncDataCorrupted { .. } => FIX | MUST | DROP,
            TncCorrupted => FIX | MUST | DROP | REBUILD,
            EmptyTnc => FIX | MUST | DROP | REBUILD,
            LptCorrupted => FIX | MUST,
            LpIncorrect { .. } => FIX | MUST,
            SpaceStatIncorrect => FIX | MUST,
            IncorrectIdxSz { .. } => FIX | MUST,
            RootDirNotFound => FIX | MUST | DROP | REBUILD,
            DisconnectedFileCannotBeRecovered { .. } => FIX | DROP,
        }
    }
    pub fn fixable(&self) -> bool {
        self.flags() & PROBLEM_FIXABLE != 0
    }
    pub fn must_fix(&self) -> bool {
        self.flags() & PROBLEM_MUST_FIX != 0
    }
    pub fn drops_data(&self) -> bool {
        self.flags() & PROBLEM_DROP_DATA != 0
    }
    pub fn needs_rebuild(&self) -> bool {
        self.flags() & PROBLEM_NEED_REBUILD != 0
    }
    /// The default answer for this problem under the given mode; the
    /// final decision is `default && operator_answer`
    pub fn default_yes(&self, mode: Mode) -> bool {
        match mode {
            Mode::Check => false,
            Mode::Safe => !self.drops_data() && !self.needs_rebuild(),
            Mode::Danger0 => !self.needs_rebuild(),
            Mode::Normal | Mode::Danger1 | Mode::Rebuild => true,
        }
    }
    /// What the fix will do, phrased for the prompt
    fn fix_hint(&self) -> &'static str {
        if self.needs_rebuild() {
            "rebuild the filesystem"
        } else if self.drops_data() {
            "drop the damaged data"
        } else {
            "correct it in place"
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Problem::*;
        let pretty = |n: &[u8]| String::from_utf8_lossy(n).into_owned();
        match self {
            SbCorrupted => write!(f, "corrupted superblock"),
            MstCorrupted => write!(f, "corrupted master node (both copies)"),
            LogCorrupted { lnum } => write!(f, "corrupted log LEB {}", lnum),
            BudCorrupted { lnum } => write!(f, "corrupted journal bud LEB {}", lnum),
            OrphanCorrupted { lnum } => write!(f, "corrupted orphan LEB {}", lnum),
            InvalidInoNode { lnum, offs } => {
                write!(f, "invalid inode node at {}:{}", lnum, offs)
            }
            InvalidDentNode { lnum, offs } => {
                write!(f, "invalid dentry node at {}:{}", lnum, offs)
            }
            InvalidDataNode { lnum, offs } => {
                write!(f, "invalid data node at {}:{}", lnum, offs)
            }
            ScanCorrupted { lnum } => {
                write!(f, "corrupted data found through the index in LEB {}", lnum)
            }
            FileHasNoInode { inum } => write!(f, "file {} has no inode", inum),
            FileHasZeroNlinkInode { inum } => {
                write!(f, "file {} has an inode with zero link count", inum)
            }
            FileHasInconsistType { inum, name } => write!(
                f,
                "file {} entry \"{}\" disagrees with the inode type",
                inum,
                pretty(name)
            ),
            FileHasTooManyDent { inum, name } => write!(
                f,
                "file {} has extra entry \"{}\"",
                inum,
                pretty(name)
            ),
            FileShouldntHaveData { inum } => {
                write!(f, "non-regular file {} owns data blocks", inum)
            }
            FileHasNoDent { inum } => write!(f, "file {} has no directory entry", inum),
            FileRootHasDent { name } => write!(
                f,
                "the root directory is target of entry \"{}\"",
                pretty(name)
            ),
            FileIsDisconnected { inum } => {
                write!(f, "regular file {} is disconnected from the tree", inum)
            }
            FileHasNoEncrypt { inum } => write!(
                f,
                "encrypted file {} lost its encryption context",
                inum
            ),
            XattrHasNoHost { inum } => {
                write!(f, "extended attribute file {} has no host", inum)
            }
            XattrHasWrongHost { inum, host } => write!(
                f,
                "extended attribute file {} is hosted by non-file {}",
                inum, host
            ),
            DentryIsUnreachable { inum, name } => write!(
                f,
                "entry \"{}\" of directory {} is unreachable from the root",
                pretty(name),
                inum
            ),
            FileIsInconsistent { inum } => write!(
                f,
                "stored attributes of file {} disagree with its contents",
                inum
            ),
            TncDataCorrupted { lnum, offs } => {
                write!(f, "node behind the index at {}:{} is corrupted", lnum, offs)
            }
            TncCorrupted => write!(f, "the on-flash index is corrupted"),
            EmptyTnc => write!(f, "the index is empty"),
            LptCorrupted => write!(f, "the LEB property tree is corrupted"),
            LpIncorrect { lnum } => {
                write!(f, "LEB {} properties disagree with its contents", lnum)
            }
            SpaceStatIncorrect => write!(f, "the global space statistics are wrong"),
            IncorrectIdxSz { stored, calc } => write!(
                f,
                "stored index size {} but the index measures {}",
                stored, calc
            ),
            RootDirNotFound => write!(f, "the root directory cannot be found"),
            DisconnectedFileCannotBeRecovered { inum } => {
                write!(f, "disconnected file {} cannot be recovered", inum)
            }
        }
    }
}

impl Problem {
    /// The question put to the operator in normal mode
    pub fn question(&self) -> String {
        format!("{}; {}?", self, self.fix_hint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn policy_defaults_per_mode() {
        let mst = Problem::MstCorrupted;
        assert!(!mst.default_yes(Mode::Check));
        assert!(!mst.default_yes(Mode::Safe));
        assert!(!mst.default_yes(Mode::Danger0));
        assert!(mst.default_yes(Mode::Danger1));
        let drop = Problem::FileHasZeroNlinkInode { inum: 42 };
        assert!(!drop.default_yes(Mode::Check));
        assert!(!drop.default_yes(Mode::Safe));
        assert!(drop.default_yes(Mode::Danger0));
        let clean = Problem::FileIsInconsistent { inum: 42 };
        assert!(clean.default_yes(Mode::Safe));
        assert!(!clean.default_yes(Mode::Check));
    }
    #[test]
    fn superblock_is_not_fixable() {
        assert!(!Problem::SbCorrupted.fixable());
        assert!(Problem::MstCorrupted.fixable());
    }
    #[test]
    fn rebuild_kinds_are_flagged() {
        for p in [
            Problem::MstCorrupted,
            Problem::LogCorrupted { lnum: 4 },
            Problem::BudCorrupted { lnum: 30 },
            Problem::TncCorrupted,
            Problem::RootDirNotFound,
        ] {
            assert!(p.needs_rebuild(), "{:?}", p);
            assert!(p.must_fix(), "{:?}", p);
        }
    }
}
