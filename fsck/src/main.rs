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

//! # Ubifsck
//!
//! The `ubifsck` crate (or the `fsck` folder) is the filesystem checker
//! binary. The interesting parts live in the [`engine`] module; see the
//! modules for their respective documentation.

#[macro_use]
mod util;
mod args;
mod engine;

use {
    libfsck::{util::terminal, EXIT_ERROR, EXIT_UNCORRECTED, EXIT_USAGE, VERSION},
    std::{env, process},
};

/// A generic I/O result
pub type IoResult<T> = std::io::Result<T>;

fn main() {
    let cfg = match args::parse(env::args().skip(1)) {
        Ok(args::Parsed::Run(cfg)) => cfg,
        Ok(args::Parsed::Version) => {
            println!("ubifsck v{} | {}", VERSION, libfsck::URL);
            return;
        }
        Err(e) => {
            let _ = terminal::write_error(format!("usage error: {}\n", e));
            eprint!("{}", args::USAGE);
            process::exit(EXIT_USAGE);
        }
    };
    env_logger::Builder::new()
        .parse_filters(
            &env::var("UBIFSCK_LOG").unwrap_or_else(|_| args::log_filter(cfg.debug).to_owned()),
        )
        .init();
    util::os::install_termination_handler();
    let volume = match engine::dev::FileVolume::open(&cfg.volume) {
        Ok(v) => v,
        Err(e) => {
            log::error!("cannot open volume {}: {}", cfg.volume, e);
            process::exit(EXIT_ERROR);
        }
    };
    let code = engine::run(Box::new(volume), cfg.mode);
    // one summary line, always
    if code & (EXIT_ERROR | EXIT_UNCORRECTED) == 0 {
        log::info!(
            "FSCK success: {}",
            libfsck::describe_exit_code(code)
        );
    } else {
        log::error!("FSCK failed: {}", libfsck::describe_exit_code(code));
    }
    process::exit(code);
}
