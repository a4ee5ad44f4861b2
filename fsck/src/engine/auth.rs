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

//! The authentication collaborator. Signed volumes carry HMACs over the
//! superblock and master node and hashes over the index; the heavy
//! lifting lives outside this crate behind the narrow trait below. The
//! built-in implementation only recognizes whether a volume demands
//! authentication and refuses to write to one.

use crate::engine::{error::RuntimeResult, ondisk::node::SbNode};

/// Environment variable an external authenticator reads its PIN from
pub const AUTH_PIN_ENV: &str = "UBIFSCK_AUTH_PIN";

pub trait Authenticator {
    fn enabled(&self) -> bool;
    /// Bytes of one node hash; zero when authentication is off
    fn hash_len(&self) -> usize;
    /// Hash a node image into `out` (which is `hash_len` bytes)
    fn hash_node(&mut self, node: &[u8], out: &mut [u8]) -> RuntimeResult<()>;
    /// Verify the superblock signature chain
    fn verify_superblock(&mut self, sb: &SbNode) -> RuntimeResult<bool>;
}

/// The no-authentication collaborator: accepts unsigned volumes and
/// rejects signed ones
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn enabled(&self) -> bool {
        false
    }
    fn hash_len(&self) -> usize {
        0
    }
    fn hash_node(&mut self, _node: &[u8], _out: &mut [u8]) -> RuntimeResult<()> {
        Ok(())
    }
    fn verify_superblock(&mut self, sb: &SbNode) -> RuntimeResult<bool> {
        Ok(!sb.authenticated())
    }
}

/// Pick the authenticator for this run. Authentication support is a
/// plug-in concern; when a PIN is present in the environment but no
/// external authenticator was linked in, say so instead of silently
/// checking nothing.
pub fn from_env() -> Box<dyn Authenticator> {
    if std::env::var_os(AUTH_PIN_ENV).is_some() {
        log::warn!(
            "{} is set but this build carries no authenticator; \
             authenticated volumes will be refused",
            AUTH_PIN_ENV
        );
    }
    Box::new(NoAuth)
}
