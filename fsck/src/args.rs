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

use {crate::engine::problem::Mode, core::fmt};

pub const USAGE: &str = "\
usage: ubifsck [-Vnarby] [-g LEVEL] <volume>

  <volume>   path to the UBIFS volume image
  -V         print version and exit
  -g LEVEL   debug level (0..4, default 1)
  -n         check mode: read-only, answer no to everything
  -a         safe mode: fix automatically unless data would be dropped
  -y         danger mode: fix automatically, even dropping data
  -b         with -y: rebuild the filesystem when required;
             alone: force a full rebuild
  -r         accepted and ignored (compatibility)
";

#[derive(Debug, PartialEq)]
pub struct Config {
    pub volume: String,
    pub mode: Mode,
    pub debug: u8,
}

#[derive(Debug, PartialEq)]
pub enum Parsed {
    Run(Config),
    Version,
}

#[derive(Debug, PartialEq)]
pub struct ArgsError(String);

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn err<T>(msg: impl Into<String>) -> Result<T, ArgsError> {
    Err(ArgsError(msg.into()))
}

/// Parse the command line. The mode flags combine as: none = normal,
/// `-n` = check, `-a` = safe, `-y` = danger level 0, `-y -b` = danger
/// level 1 and a bare `-b` forces a rebuild.
pub fn parse(args: impl Iterator<Item = String>) -> Result<Parsed, ArgsError> {
    let mut volume: Option<String> = None;
    let mut debug: u8 = 1;
    let (mut f_check, mut f_safe, mut f_yes, mut f_rebuild) = (false, false, false, false);
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" | "--version" => return Ok(Parsed::Version),
            "-n" => f_check = true,
            "-a" => f_safe = true,
            "-y" => f_yes = true,
            "-b" => f_rebuild = true,
            "-r" => {
                // compatibility with the generic fsck driver; swallow an
                // optional numeric argument
                if let Some(next) = args.peek() {
                    if next.parse::<u32>().is_ok() {
                        args.next();
                    }
                }
            }
            "-g" => match args.next() {
                Some(lvl) => debug = parse_debug_level(&lvl)?,
                None => return err("-g requires a level (0..4)"),
            },
            lvl if lvl.starts_with("-g") => debug = parse_debug_level(&lvl[2..])?,
            flag if flag.starts_with('-') => {
                return err(format!("unknown flag `{}`", flag));
            }
            _ => {
                if volume.replace(arg).is_some() {
                    return err("more than one volume given");
                }
            }
        }
    }
    let mode = match (f_check, f_safe, f_yes, f_rebuild) {
        (false, false, false, false) => Mode::Normal,
        (true, false, false, false) => Mode::Check,
        (false, true, false, false) => Mode::Safe,
        (false, false, true, false) => Mode::Danger0,
        (false, false, true, true) => Mode::Danger1,
        (false, false, false, true) => Mode::Rebuild,
        _ => return err("the flags -n, -a and -y/-b are mutually exclusive"),
    };
    match volume {
        Some(volume) => Ok(Parsed::Run(Config {
            volume,
            mode,
            debug,
        })),
        None => err("no volume given"),
    }
}

fn parse_debug_level(s: &str) -> Result<u8, ArgsError> {
    match s.parse::<u8>() {
        Ok(lvl) if lvl <= 4 => Ok(lvl),
        _ => err(format!("bad debug level `{}` (want 0..4)", s)),
    }
}

/// Map the `-g` level onto a log filter the way the logger understands it
pub fn log_filter(debug: u8) -> &'static str {
    match debug {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn run(args: &[&str]) -> Result<Parsed, ArgsError> {
        parse(args.iter().map(|s| s.to_string()))
    }
    #[test]
    fn mode_selection() {
        let modes: [(&[&str], Mode); 6] = [
            (&["vol"], Mode::Normal),
            (&["-n", "vol"], Mode::Check),
            (&["-a", "vol"], Mode::Safe),
            (&["-y", "vol"], Mode::Danger0),
            (&["-y", "-b", "vol"], Mode::Danger1),
            (&["-b", "vol"], Mode::Rebuild),
        ];
        for (args, mode) in modes {
            match run(args) {
                Ok(Parsed::Run(cfg)) => assert_eq!(cfg.mode, mode, "args {:?}", args),
                other => panic!("args {:?} gave {:?}", args, other),
            }
        }
    }
    #[test]
    fn conflicting_modes() {
        assert!(run(&["-n", "-a", "vol"]).is_err());
        assert!(run(&["-n", "-y", "vol"]).is_err());
        assert!(run(&["-a", "-b", "vol"]).is_err());
    }
    #[test]
    fn debug_levels() {
        match run(&["-g", "3", "vol"]) {
            Ok(Parsed::Run(cfg)) => assert_eq!(cfg.debug, 3),
            other => panic!("{:?}", other),
        }
        match run(&["-g2", "vol"]) {
            Ok(Parsed::Run(cfg)) => assert_eq!(cfg.debug, 2),
            other => panic!("{:?}", other),
        }
        assert!(run(&["-g", "7", "vol"]).is_err());
        assert!(run(&["-g", "vol"]).is_err());
    }
    #[test]
    fn compat_and_version() {
        assert_eq!(run(&["-V"]), Ok(Parsed::Version));
        match run(&["-r", "0", "vol"]) {
            Ok(Parsed::Run(cfg)) => assert_eq!(cfg.volume, "vol"),
            other => panic!("{:?}", other),
        }
        assert!(run(&[]).is_err());
        assert!(run(&["a", "b"]).is_err());
    }
}
