/*
 * Created on Mon Jan 01 2024
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

//! The shared library for Ubifsck
//!
//! This contains the constants and helpers that are shared by the `fsck`
//! binary and any companion tooling: the version string, the exit status
//! bits and the terminal utilities.

pub mod util;

/// The version of this build
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// The project URL
pub const URL: &str = "https://github.com/ubifsck/ubifsck";

/*
    exit status bits
    ---
    The process exit code is a bitmask assembled from the constants below,
    following the conventions of the fsck(8) family of tools. `EXIT_OK` is
    the absence of every other bit.
*/

/// No errors were found, nothing was changed
pub const EXIT_OK: i32 = 0x00;
/// Errors were found and corrected without dropping user data
pub const EXIT_NONDESTRUCT: i32 = 0x01;
/// The system should be rebooted before the volume is used again
pub const EXIT_REBOOT: i32 = 0x02;
/// Errors were found but left uncorrected
pub const EXIT_UNCORRECTED: i32 = 0x04;
/// An operational error (I/O failure, out of memory) stopped the run
pub const EXIT_ERROR: i32 = 0x08;
/// The command line could not be understood
pub const EXIT_USAGE: i32 = 0x10;
/// The run was cancelled by a termination signal
pub const EXIT_CANCELED: i32 = 0x20;
/// A shared library error occurred
pub const EXIT_LIBRARY: i32 = 0x80;

/// Render the exit bitmask as a short human readable summary
pub fn describe_exit_code(code: i32) -> String {
    if code == EXIT_OK {
        return "no errors".to_owned();
    }
    let mut parts = Vec::new();
    if code & EXIT_NONDESTRUCT != 0 {
        parts.push("errors corrected");
    }
    if code & EXIT_REBOOT != 0 {
        parts.push("reboot recommended");
    }
    if code & EXIT_UNCORRECTED != 0 {
        parts.push("errors left uncorrected");
    }
    if code & EXIT_ERROR != 0 {
        parts.push("operational error");
    }
    if code & EXIT_USAGE != 0 {
        parts.push("usage error");
    }
    if code & EXIT_CANCELED != 0 {
        parts.push("cancelled by signal");
    }
    if code & EXIT_LIBRARY != 0 {
        parts.push("library error");
    }
    parts.join(", ")
}
