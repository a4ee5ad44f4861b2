/*
 * Created on Tue Feb 06 2024
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

#![allow(dead_code)]

#[macro_use]
pub mod macros;
pub mod compiler;
pub mod os;

/// Align `v` up to the next multiple of 8 (the on-flash node alignment)
pub const fn align8(v: u32) -> u32 {
    (v + 7) & !7
}

/// Align `v` up to the next multiple of `to` (`to` need not be a power of two)
pub const fn align_up(v: u32, to: u32) -> u32 {
    match v % to {
        0 => v,
        rem => v + (to - rem),
    }
}

/// "Find last set": one-based position of the highest set bit, 0 for 0
pub const fn fls(v: u32) -> u32 {
    32 - v.leading_zeros()
}

/// Ceiling division
pub const fn div_round_up(n: u32, d: u32) -> u32 {
    (n + d - 1) / d
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn alignment() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
        assert_eq!(align_up(100, 64), 128);
        assert_eq!(align_up(128, 64), 128);
    }
    #[test]
    fn find_last_set() {
        assert_eq!(fls(0), 0);
        assert_eq!(fls(1), 1);
        assert_eq!(fls(0x20000), 18);
        assert_eq!(fls(131072), 18);
        assert_eq!(fls(u32::MAX), 32);
    }
}
