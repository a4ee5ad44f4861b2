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
        error::{ParseError, RuntimeResult},
        ondisk::{self, node::SbNode, Node, ERASED_BYTE, SB_NODE_SZ},
    },
    std::{
        fs,
        io::{Read, Seek, SeekFrom, Write},
    },
};

/// A volume backed by a plain image file. LEB `l` occupies bytes
/// `l * leb_size ..`; bytes past the end of the file read as erased.
/// An image cannot distinguish an unmapped LEB from a mapped LEB that
/// was erased and never written, so `is_mapped` reports whether any
/// byte differs from the erased pattern.
pub struct FileVolume {
    file: fs::File,
    info: DeviceInfo,
}

impl FileVolume {
    /// Open an image. The geometry is taken from the superblock node at
    /// the start of the image; the minimal I/O unit of an image file is
    /// the node alignment.
    pub fn open(path: &str) -> RuntimeResult<Self> {
        let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mut probe = vec![0u8; SB_NODE_SZ];
        file.read_exact(&mut probe)?;
        let sb = match ondisk::parse_node(&probe, ondisk::SB_LNUM, 0)? {
            Node::Sb(sb) => sb,
            _ => return Err(ParseError::BadNodeType.into()),
        };
        Ok(Self::with_geometry(file, &sb))
    }
    fn with_geometry(file: fs::File, sb: &SbNode) -> Self {
        Self {
            file,
            info: DeviceInfo {
                min_io_size: sb.min_io_size,
                max_write_size: sb.min_io_size,
                leb_size: sb.leb_size,
                leb_cnt: sb.leb_cnt,
            },
        }
    }
    fn seek_to(&mut self, lnum: u32, offs: u32) -> RuntimeResult<u64> {
        let pos = lnum as u64 * self.info.leb_size as u64 + offs as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(pos)
    }
}

impl Volume for FileVolume {
    fn info(&self) -> DeviceInfo {
        self.info
    }
    fn leb_read(&mut self, lnum: u32, offs: u32, buf: &mut [u8]) -> RuntimeResult<()> {
        check_bounds(&self.info, lnum, offs, buf.len())?;
        let pos = self.seek_to(lnum, offs)?;
        let file_len = self.file.metadata()?.len();
        let available = file_len.saturating_sub(pos).min(buf.len() as u64) as usize;
        self.file.read_exact(&mut buf[..available])?;
        buf[available..].fill(ERASED_BYTE);
        Ok(())
    }
    fn leb_write(&mut self, lnum: u32, offs: u32, buf: &[u8]) -> RuntimeResult<()> {
        check_bounds(&self.info, lnum, offs, buf.len())?;
        check_alignment(&self.info, offs, buf.len())?;
        self.seek_to(lnum, offs)?;
        self.file.write_all(buf)?;
        Ok(())
    }
    fn leb_change(&mut self, lnum: u32, buf: &[u8]) -> RuntimeResult<()> {
        check_bounds(&self.info, lnum, 0, buf.len())?;
        self.seek_to(lnum, 0)?;
        self.file.write_all(buf)?;
        let tail = self.info.leb_size as usize - buf.len();
        if tail > 0 {
            self.file.write_all(&vec![ERASED_BYTE; tail])?;
        }
        self.file.sync_data()?;
        Ok(())
    }
    fn leb_unmap(&mut self, lnum: u32) -> RuntimeResult<()> {
        self.leb_change(lnum, &[])
    }
    fn is_mapped(&mut self, lnum: u32) -> RuntimeResult<bool> {
        let buf = super::read_leb(self, lnum)?;
        Ok(buf.iter().any(|&b| b != ERASED_BYTE))
    }
}
