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
    super::{check_alignment, check_bounds, DeviceInfo, Volume},
    crate::engine::{
        error::{DeviceError, RuntimeResult},
        ondisk::ERASED_BYTE,
    },
    parking_lot::RwLock,
    std::sync::Arc,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Mutation counters, used by the idempotence tests: a second repair run
/// over a healthy volume must leave every counter untouched
pub struct WriteStats {
    pub writes: u64,
    pub changes: u64,
    pub unmaps: u64,
}

impl WriteStats {
    pub fn total(&self) -> u64 {
        self.writes + self.changes + self.unmaps
    }
}

/// An in-memory volume. `None` is an unmapped LEB; reads of unmapped
/// LEBs yield the erased pattern like the flash layer would.
pub struct MemVolume {
    info: DeviceInfo,
    lebs: RwLock<Vec<Option<Vec<u8>>>>,
    stats: RwLock<WriteStats>,
}

impl MemVolume {
    pub fn new(leb_size: u32, leb_cnt: u32, min_io_size: u32) -> Self {
        Self {
            info: DeviceInfo {
                min_io_size,
                max_write_size: min_io_size,
                leb_size,
                leb_cnt,
            },
            lebs: RwLock::new(vec![None; leb_cnt as usize]),
            stats: RwLock::new(WriteStats::default()),
        }
    }
    pub fn stats(&self) -> WriteStats {
        *self.stats.read()
    }
    pub fn reset_stats(&self) {
        *self.stats.write() = WriteStats::default();
    }
    /// Flip one byte in place, bypassing the write path; the corruption
    /// primitive of the test suite
    pub fn corrupt_byte(&self, lnum: u32, offs: u32) {
        let mut lebs = self.lebs.write();
        let leb = lebs[lnum as usize].get_or_insert_with(|| self.erased());
        leb[offs as usize] ^= 0x80;
    }
    /// Overwrite a byte range in place, bypassing the write path
    pub fn patch(&self, lnum: u32, offs: u32, bytes: &[u8]) {
        let mut lebs = self.lebs.write();
        let leb = lebs[lnum as usize].get_or_insert_with(|| self.erased());
        leb[offs as usize..offs as usize + bytes.len()].copy_from_slice(bytes);
    }
    /// A full snapshot of the volume contents, for equality asserts
    pub fn snapshot(&self) -> Vec<Option<Vec<u8>>> {
        self.lebs.read().clone()
    }
    fn erased(&self) -> Vec<u8> {
        vec![ERASED_BYTE; self.info.leb_size as usize]
    }
}

impl MemVolume {
    fn do_read(&self, lnum: u32, offs: u32, buf: &mut [u8]) -> RuntimeResult<()> {
        check_bounds(&self.info, lnum, offs, buf.len())?;
        match &self.lebs.read()[lnum as usize] {
            Some(leb) => buf.copy_from_slice(&leb[offs as usize..offs as usize + buf.len()]),
            None => buf.fill(ERASED_BYTE),
        }
        Ok(())
    }
    fn do_write(&self, lnum: u32, offs: u32, buf: &[u8]) -> RuntimeResult<()> {
        check_bounds(&self.info, lnum, offs, buf.len())?;
        check_alignment(&self.info, offs, buf.len())?;
        let mut lebs = self.lebs.write();
        let leb = lebs[lnum as usize].get_or_insert_with(|| self.erased());
        // flash can only clear bits; a write over already-written space
        // is a programming error in the caller
        if leb[offs as usize..offs as usize + buf.len()]
            .iter()
            .any(|&b| b != ERASED_BYTE)
        {
            return Err(DeviceError::WriteFailed.into());
        }
        leb[offs as usize..offs as usize + buf.len()].copy_from_slice(buf);
        self.stats.write().writes += 1;
        Ok(())
    }
    fn do_change(&self, lnum: u32, buf: &[u8]) -> RuntimeResult<()> {
        check_bounds(&self.info, lnum, 0, buf.len())?;
        let mut leb = self.erased();
        leb[..buf.len()].copy_from_slice(buf);
        self.lebs.write()[lnum as usize] = Some(leb);
        self.stats.write().changes += 1;
        Ok(())
    }
    fn do_unmap(&self, lnum: u32) -> RuntimeResult<()> {
        check_bounds(&self.info, lnum, 0, 0)?;
        self.lebs.write()[lnum as usize] = None;
        self.stats.write().unmaps += 1;
        Ok(())
    }
    fn do_mapped(&self, lnum: u32) -> RuntimeResult<bool> {
        check_bounds(&self.info, lnum, 0, 0)?;
        Ok(self.lebs.read()[lnum as usize].is_some())
    }
}

impl Volume for MemVolume {
    fn info(&self) -> DeviceInfo {
        self.info
    }
    fn leb_read(&mut self, lnum: u32, offs: u32, buf: &mut [u8]) -> RuntimeResult<()> {
        self.do_read(lnum, offs, buf)
    }
    fn leb_write(&mut self, lnum: u32, offs: u32, buf: &[u8]) -> RuntimeResult<()> {
        self.do_write(lnum, offs, buf)
    }
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> RuntimeResult<()> {
        self.do_change(lnum, buf)
    }
    fn leb_unmap(&mut self, lnum: u32) -> RuntimeResult<()> {
        self.do_unmap(lnum)
    }
    fn is_mapped(&mut self, lnum: u32) -> RuntimeResult<bool> {
        self.do_mapped(lnum)
    }
}

/// A cloneable handle over an [`MemVolume`], so a test can hand one
/// clone to the session and keep another for corruption and asserts
#[derive(Clone)]
pub struct SharedVolume(pub Arc<MemVolume>);

impl SharedVolume {
    pub fn new(leb_size: u32, leb_cnt: u32, min_io_size: u32) -> Self {
        Self(Arc::new(MemVolume::new(leb_size, leb_cnt, min_io_size)))
    }
}

impl Volume for SharedVolume {
    fn info(&self) -> DeviceInfo {
        self.0.info
    }
    fn leb_read(&mut self, lnum: u32, offs: u32, buf: &mut [u8]) -> RuntimeResult<()> {
        self.0.do_read(lnum, offs, buf)
    }
    fn leb_write(&mut self, lnum: u32, offs: u32, buf: &[u8]) -> RuntimeResult<()> {
        self.0.do_write(lnum, offs, buf)
    }
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> RuntimeResult<()> {
        self.0.do_change(lnum, buf)
    }
    fn leb_unmap(&mut self, lnum: u32) -> RuntimeResult<()> {
        self.0.do_unmap(lnum)
    }
    fn is_mapped(&mut self, lnum: u32) -> RuntimeResult<bool> {
        self.0.do_mapped(lnum)
    }
}
