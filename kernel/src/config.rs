//! Boot-time VM configuration.
//!
//! Options come from the kernel command line as `vm.<key>=<value>` words.
//! The command line is shared with other subsystems, so words without the
//! `vm.` prefix are skipped.

use alloc::string::{String, ToString};
use core::str::FromStr;
use kidneyos_shared::{
    mem::{VirtAddr, OFFSET},
    sizes::MB,
};
use log::LevelFilter;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map_res, rest};
use nom::sequence::{preceded, separated_pair};
use nom::IResult;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed vm option `{0}`")]
    Malformed(String),
    #[error("unknown vm option `{0}`")]
    UnknownKey(String),
    #[error("bad value for vm option `{0}`")]
    BadValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames in the user pool.
    pub user_frames: usize,
    /// Kernel alias of the first user pool frame.
    pub user_pool_base: usize,
    /// Full clock revolutions to try before reporting the pool exhausted.
    pub evict_passes: usize,
    pub log_level: LevelFilter,
}

/// Upper bound on `vm.evict_passes`.
pub const MAX_EVICT_PASSES: usize = 64;

impl VmConfig {
    pub const DEFAULT: Self = Self {
        user_frames: 256,
        // User pool starts 64MB into the kernel's physical alias window.
        user_pool_base: OFFSET + 64 * MB,
        evict_passes: 2,
        log_level: LevelFilter::Info,
    };

    /// Builds a configuration from a kernel command line, starting from
    /// [`VmConfig::DEFAULT`].
    pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::DEFAULT;
        for word in cmdline.split_whitespace() {
            if !word.starts_with("vm.") {
                continue;
            }
            let (_, (key, value)) =
                all_consuming(option)(word).map_err(|_| ConfigError::Malformed(word.to_string()))?;
            config.apply(key, value)?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let bad_value = || ConfigError::BadValue(key.to_string());
        match key {
            "frames" => {
                self.user_frames = number(value).ok_or_else(bad_value)?;
                if self.user_frames == 0 {
                    return Err(bad_value());
                }
            }
            "pool_base" => {
                let base = number(value).ok_or_else(bad_value)?;
                // Frames are reached through the kernel's alias window.
                if base < OFFSET || !VirtAddr::new(base).is_page_aligned() {
                    return Err(bad_value());
                }
                self.user_pool_base = base;
            }
            "evict_passes" => {
                self.evict_passes = number(value).ok_or_else(bad_value)?;
                if !(1..=MAX_EVICT_PASSES).contains(&self.evict_passes) {
                    return Err(bad_value());
                }
            }
            "log" => self.log_level = LevelFilter::from_str(value).map_err(|_| bad_value())?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn option(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        preceded(
            tag("vm."),
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        ),
        char('='),
        take_while1(|c: char| !c.is_ascii_whitespace()),
    )(input)
}

fn number(value: &str) -> Option<usize> {
    let decimal: IResult<&str, usize> = all_consuming(map_res(digit1, usize::from_str))(value);
    if let Ok((_, n)) = decimal {
        return Some(n);
    }
    // Allow hex for addresses.
    let hex: IResult<&str, usize> = all_consuming(preceded(
        tag("0x"),
        map_res(rest, |digits: &str| usize::from_str_radix(digits, 16)),
    ))(value);
    hex.ok().map(|(_, n)| n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cmdline_gives_defaults() {
        assert_eq!(VmConfig::from_cmdline("").unwrap(), VmConfig::DEFAULT);
    }

    #[test]
    fn parses_vm_options_and_skips_others() {
        let config = VmConfig::from_cmdline(
            "root=/dev/hda1 vm.frames=16 quiet vm.evict_passes=3 vm.log=debug vm.pool_base=0xc0400000",
        )
        .unwrap();
        assert_eq!(config.user_frames, 16);
        assert_eq!(config.evict_passes, 3);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.user_pool_base, 0xc040_0000);
    }

    #[test]
    fn rejects_bad_options() {
        assert_eq!(
            VmConfig::from_cmdline("vm.frames"),
            Err(ConfigError::Malformed("vm.frames".into()))
        );
        assert_eq!(
            VmConfig::from_cmdline("vm.frames=lots"),
            Err(ConfigError::BadValue("frames".into()))
        );
        assert_eq!(
            VmConfig::from_cmdline("vm.frames=0"),
            Err(ConfigError::BadValue("frames".into()))
        );
        assert_eq!(
            VmConfig::from_cmdline("vm.evict_passes=18446744073709551615"),
            Err(ConfigError::BadValue("evict_passes".into()))
        );
        assert_eq!(
            VmConfig::from_cmdline("vm.evict_passes=65"),
            Err(ConfigError::BadValue("evict_passes".into()))
        );
        // Unaligned, and below the kernel alias window.
        assert_eq!(
            VmConfig::from_cmdline("vm.pool_base=0xc0000001"),
            Err(ConfigError::BadValue("pool_base".into()))
        );
        assert_eq!(
            VmConfig::from_cmdline("vm.pool_base=0x10000000"),
            Err(ConfigError::BadValue("pool_base".into()))
        );
        assert_eq!(
            VmConfig::from_cmdline("vm.colour=blue"),
            Err(ConfigError::UnknownKey("colour".into()))
        );
    }
}
