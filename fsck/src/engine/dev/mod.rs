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

//! # The volume device layer
//!
//! The engine talks to flash through five primitives over logical
//! eraseblocks. Two backends exist: [`FileVolume`] maps a plain image
//! file (LEB `l` lives at byte `l * leb_size`) and [`MemVolume`] keeps
//! the volume in memory for the test suite. The UBI character device
//! backend belongs to the platform layer, not to this crate.

mod file;
mod mem;
#[cfg(test)]
mod tests;

pub use {
    file::FileVolume,
    mem::{MemVolume, SharedVolume, WriteStats},
};

use crate::engine::error::{DeviceError, RuntimeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Geometry the flash layer reports before the superblock is even read
pub struct DeviceInfo {
    pub min_io_size: u32,
    pub max_write_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
}

/// The five flash primitives plus geometry. Write lengths and offsets
/// must be multiples of the minimal I/O unit; reads may be arbitrary.
pub trait Volume {
    fn info(&self) -> DeviceInfo;
    fn leb_read(&mut self, lnum: u32, offs: u32, buf: &mut [u8]) -> RuntimeResult<()>;
    fn leb_write(&mut self, lnum: u32, offs: u32, buf: &[u8]) -> RuntimeResult<()>;
    /// Atomically replace the whole LEB with `buf` (the tail is erased)
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> RuntimeResult<()>;
    fn leb_unmap(&mut self, lnum: u32) -> RuntimeResult<()>;
    fn is_mapped(&mut self, lnum: u32) -> RuntimeResult<bool>;
}

/// Bounds check shared by the backends
fn check_bounds(info: &DeviceInfo, lnum: u32, offs: u32, len: usize) -> RuntimeResult<()> {
    if lnum >= info.leb_cnt || offs as usize + len > info.leb_size as usize {
        return Err(DeviceError::OutOfBounds.into());
    }
    Ok(())
}

/// Write alignment check shared by the backends
fn check_alignment(info: &DeviceInfo, offs: u32, len: usize) -> RuntimeResult<()> {
    if offs % info.min_io_size != 0 || len % info.min_io_size as usize != 0 {
        return Err(DeviceError::BadAlignment.into());
    }
    Ok(())
}

/// Read one whole LEB into a fresh buffer
pub fn read_leb(vol: &mut dyn Volume, lnum: u32) -> RuntimeResult<Vec<u8>> {
    let mut buf = vec![0u8; vol.info().leb_size as usize];
    vol.leb_read(lnum, 0, &mut buf)?;
    Ok(buf)
}
