/*
 * Created on Fri Mar 22 2024
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
    super::{read_leb, MemVolume, Volume},
    crate::engine::{
        error::{DeviceError, ErrorKind},
        ondisk::ERASED_BYTE,
    },
};

fn vol() -> MemVolume {
    MemVolume::new(4096, 8, 64)
}

#[test]
fn unmapped_reads_erased() {
    let mut v = vol();
    assert!(!v.is_mapped(3).unwrap());
    let buf = read_leb(&mut v, 3).unwrap();
    assert!(buf.iter().all(|&b| b == ERASED_BYTE));
}

#[test]
fn write_and_read_back() {
    let mut v = vol();
    v.leb_write(2, 64, &[7u8; 128]).unwrap();
    assert!(v.is_mapped(2).unwrap());
    let mut buf = [0u8; 128];
    v.leb_read(2, 64, &mut buf).unwrap();
    assert_eq!(buf, [7u8; 128]);
    // before the write offset the LEB reads erased
    let mut head = [0u8; 64];
    v.leb_read(2, 0, &mut head).unwrap();
    assert!(head.iter().all(|&b| b == ERASED_BYTE));
}

#[test]
fn flash_rejects_overwrite_without_erase() {
    let mut v = vol();
    v.leb_write(2, 0, &[1u8; 64]).unwrap();
    let err = v.leb_write(2, 0, &[2u8; 64]).unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Device(DeviceError::WriteFailed));
    // a change erases implicitly
    v.leb_change(2, &[3u8; 32]).unwrap();
    let mut buf = [0u8; 32];
    v.leb_read(2, 0, &mut buf).unwrap();
    assert_eq!(buf, [3u8; 32]);
}

#[test]
fn alignment_and_bounds_are_enforced() {
    let mut v = vol();
    assert_eq!(
        v.leb_write(0, 3, &[0u8; 64]).unwrap_err().kind(),
        &ErrorKind::Device(DeviceError::BadAlignment)
    );
    assert_eq!(
        v.leb_write(0, 0, &[0u8; 63]).unwrap_err().kind(),
        &ErrorKind::Device(DeviceError::BadAlignment)
    );
    assert_eq!(
        v.leb_read(9, 0, &mut [0u8; 8]).unwrap_err().kind(),
        &ErrorKind::Device(DeviceError::OutOfBounds)
    );
    assert_eq!(
        v.leb_read(0, 4090, &mut [0u8; 8]).unwrap_err().kind(),
        &ErrorKind::Device(DeviceError::OutOfBounds)
    );
}

#[test]
fn unmap_resets_and_counts() {
    let mut v = vol();
    v.leb_write(1, 0, &[9u8; 64]).unwrap();
    v.leb_unmap(1).unwrap();
    assert!(!v.is_mapped(1).unwrap());
    let stats = v.stats();
    multi_assert_eq!(stats.writes, stats.unmaps => 1);
}
