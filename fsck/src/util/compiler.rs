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

//! Pure enumerations: the bridge between raw on-flash discriminant
//! bytes and the typed enums the rest of the code works with

pub trait TaggedEnum: Sized {
    type Dscr: PartialOrd;
    const MAX_DSCR: Self::Dscr;
    const VARIANT_COUNT: usize;
    fn dscr(&self) -> Self::Dscr;
    /// # Safety
    /// The caller must guarantee that `d` is a valid discriminant
    unsafe fn from_raw(d: Self::Dscr) -> Self;
    fn try_from_raw(d: Self::Dscr) -> Option<Self> {
        if d > Self::MAX_DSCR {
            None
        } else {
            Some(unsafe {
                // UNSAFE(@ohsayan): just verified the dscr
                <Self as TaggedEnum>::from_raw(d)
            })
        }
    }
}
