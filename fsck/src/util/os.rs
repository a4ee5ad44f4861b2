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

//! OS level plumbing: termination signals.
//!
//! A repair that is already approved must run to completion, so the handler
//! does not try to interrupt in-flight work; it converts the signal into a
//! clean process exit carrying the cancelled bit. The copy-on-write commit
//! discipline guarantees the on-flash state stays at its pre-repair version
//! unless the master node was already written.

#[cfg(unix)]
mod unix {
    extern "C" fn on_termination(_sig: libc::c_int) {
        // async-signal-safe: only _exit is called here
        unsafe {
            libc::_exit(libfsck::EXIT_CANCELED);
        }
    }
    pub fn install() {
        let handler = on_termination as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        }
    }
}

pub fn install_termination_handler() {
    #[cfg(unix)]
    unix::install();
}
