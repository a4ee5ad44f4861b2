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

//! The session: the explicit context every stage of a run shares.
//! Instead of process-wide globals there is one of these, owning the
//! device handle, the mode, the exit-code accumulator, the consistency
//! reasons low-level code records, and the collaborator hooks.

use {
    crate::engine::{
        auth::Authenticator,
        dev::Volume,
        error::{Error, ReasonSet, RuntimeResult},
        problem::{Mode, Problem},
    },
    libfsck::{EXIT_NONDESTRUCT, EXIT_UNCORRECTED},
    log::{error, warn},
};

/// Answers a y/n question; installed by `main` (terminal) or by tests
pub type PromptFn = Box<dyn FnMut(&str, bool) -> bool>;

pub struct Session {
    pub vol: Box<dyn Volume>,
    pub mode: Mode,
    /// The exit bitmask accumulated over the whole run
    pub exit_code: i32,
    /// Consistency failure reasons recorded by low level code
    pub reasons: ReasonSet,
    /// Set when a problem decision escalated to a full rebuild
    pub try_rebuild: bool,
    pub prompt: PromptFn,
    pub auth: Box<dyn Authenticator>,
    /// Reused across LEB-sized reads and index assembly
    pub scratch: Vec<u8>,
}

impl Session {
    pub fn new(vol: Box<dyn Volume>, mode: Mode, prompt: PromptFn) -> Self {
        let leb_size = vol.info().leb_size as usize;
        let max_idx = crate::util::align8(
            crate::engine::ondisk::idx_node_sz(crate::engine::ondisk::DEFAULT_FANOUT as usize)
                as u32,
        ) as usize;
        Self {
            vol,
            mode,
            exit_code: 0,
            reasons: ReasonSet::default(),
            try_rebuild: false,
            prompt,
            auth: crate::engine::auth::from_env(),
            scratch: vec![0u8; leb_size.max(max_idx * 2)],
        }
    }
    /// Run one problem through the decision policy.
    ///
    /// `Ok(true)` means the fix is approved; `Ok(false)` means skip and
    /// carry the uncorrected bit. Unfixable problems and refused
    /// must-fix problems abort; an approved rebuild unwinds through
    /// [`crate::engine::error::ErrorKind::NeedRebuild`].
    pub fn handle_problem(&mut self, problem: &Problem) -> RuntimeResult<bool> {
        warn!("problem: {}", problem);
        if !problem.fixable() {
            error!("no way to fix: {}", problem);
            self.exit_code |= EXIT_UNCORRECTED;
            return Err(Error::abort());
        }
        let default = problem.default_yes(self.mode);
        let answer = if self.mode == Mode::Normal {
            (self.prompt)(&problem.question(), default)
        } else {
            default
        };
        let fix = default && answer;
        if !fix {
            self.exit_code |= EXIT_UNCORRECTED;
            if problem.must_fix() {
                error!("refused to fix: {}", problem);
                return Err(Error::abort());
            }
            return Ok(false);
        }
        self.exit_code |= EXIT_NONDESTRUCT;
        if problem.needs_rebuild() {
            warn!("full rebuild required; deleted files may reappear");
            self.try_rebuild = true;
            return Err(Error::need_rebuild());
        }
        Ok(true)
    }
    pub fn read_only(&self) -> bool {
        self.mode.read_only()
    }
}
