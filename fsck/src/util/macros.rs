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

macro_rules! sizeof {
    ($ty:ty) => {
        ::core::mem::size_of::<$ty>()
    };
    ($ty:ty, $by:literal) => {
        ::core::mem::size_of::<$ty>() * $by
    };
}

macro_rules! consts {
    ($($(#[$attr:meta])* $ident:ident : $ty:ty = $expr:expr;)*) => {
        $(
            $(#[$attr])*
            const $ident: $ty = $expr;
        )*
    };
    ($($(#[$attr:meta])* $vis:vis $ident:ident : $ty:ty = $expr:expr;)*) => {
        $(
            $(#[$attr])*
            $vis const $ident: $ty = $expr;
        )*
    };
}

macro_rules! enum_impls {
    ($for:ty => {$($other:ty as $me:ident),*$(,)?}) => {
        $(impl ::core::convert::From<$other> for $for {fn from(v: $other) -> Self {Self::$me(v.into())}})*
    };
}

macro_rules! assertions {
    ($($assert:expr),*$(,)?) => {$(const _:()=::core::assert!($assert);)*}
}

/// All of the given expressions must hold
macro_rules! okay {
    ($($expr:expr),+ $(,)?) => {
        $($expr)&&+
    };
}

/// Implement [`crate::util::compiler::TaggedEnum`] for a fieldless
/// `#[repr(u8)]` enum whose discriminants are contiguous from zero
macro_rules! tagged_enum_u8 {
    ($($ty:ty => $max:ident : $count:literal),* $(,)?) => {
        $(impl crate::util::compiler::TaggedEnum for $ty {
            type Dscr = u8;
            const MAX_DSCR: u8 = <$ty>::$max as u8;
            const VARIANT_COUNT: usize = $count;
            fn dscr(&self) -> u8 { *self as u8 }
            unsafe fn from_raw(d: u8) -> Self { ::core::mem::transmute(d) }
        })*
    };
}

#[cfg(test)]
macro_rules! intovec {
    ($($expr:expr),* $(,)?) => {
        vec![$(::core::convert::From::from($expr),)*]
    };
}

#[cfg(test)]
macro_rules! multi_assert_eq {
    ($($lhs:expr),* => $rhs:expr) => {
        $(assert_eq!($lhs, $rhs);)*
    };
}
