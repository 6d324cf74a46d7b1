//! Simulator configuration file.
//!
//! Line-oriented `key value` pairs; `#` starts a comment. Recognized keys:
//!
//! ```text
//! mcu atmega328p          # device model
//! mcu_freq 16000000       # clock, Hz
//! mcu_lfuse 0xFF          # fuse bytes
//! mcu_hfuse 0xD9
//! mcu_efuse 0xFF
//! lockbits 0x3F
//! firmware_file blink.hex
//! reset_flash yes         # erase flash to 0xFF before loading
//! firmware_test no        # run to completion, exit code reflects result
//! trap_at_isr no          # stop the core on ISR entry
//! vcd_file trace.vcd
//! dump_regs PORTB,TCNT1,PORTD4
//! rsp_port 12750
//! lua_model models/uart.lua
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Debug, Default)]
pub struct Config {
    pub mcu: String,
    pub mcu_freq: Option<u64>,
    pub lfuse: Option<u8>,
    pub hfuse: Option<u8>,
    pub efuse: Option<u8>,
    pub lockbits: Option<u8>,
    pub firmware_file: Option<PathBuf>,
    pub reset_flash: bool,
    pub firmware_test: bool,
    pub trap_at_isr: bool,
    pub vcd_file: Option<PathBuf>,
    pub dump_regs: Vec<String>,
    pub rsp_port: Option<u16>,
    pub lua_models: Vec<PathBuf>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Config> {
        let mut cfg = Config::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.split_once('#') {
                Some((before, _)) => before.trim(),
                None => raw.trim(),
            };
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .with_context(|| format!("line {}: expected 'key value'", lineno + 1))?;
            let value = value.trim();

            match key {
                "mcu" => cfg.mcu = value.to_string(),
                "mcu_freq" => cfg.mcu_freq = Some(parse_u64(value, lineno)?),
                "mcu_lfuse" => cfg.lfuse = Some(parse_byte(value, lineno)?),
                "mcu_hfuse" => cfg.hfuse = Some(parse_byte(value, lineno)?),
                "mcu_efuse" => cfg.efuse = Some(parse_byte(value, lineno)?),
                "lockbits" => cfg.lockbits = Some(parse_byte(value, lineno)?),
                "firmware_file" => cfg.firmware_file = Some(PathBuf::from(value)),
                "reset_flash" => cfg.reset_flash = parse_bool(value, lineno)?,
                "firmware_test" => cfg.firmware_test = parse_bool(value, lineno)?,
                "trap_at_isr" => cfg.trap_at_isr = parse_bool(value, lineno)?,
                "vcd_file" => cfg.vcd_file = Some(PathBuf::from(value)),
                "dump_regs" => {
                    cfg.dump_regs
                        .extend(value.split(',').map(|s| s.trim().to_string()));
                }
                "rsp_port" => {
                    cfg.rsp_port = Some(
                        value
                            .parse()
                            .with_context(|| format!("line {}: bad port", lineno + 1))?,
                    )
                }
                "lua_model" => cfg.lua_models.push(PathBuf::from(value)),
                other => bail!("line {}: unknown option '{}'", lineno + 1, other),
            }
        }

        if cfg.mcu.is_empty() {
            bail!("configuration must name a device with 'mcu'");
        }
        Ok(cfg)
    }
}

fn parse_u64(s: &str, lineno: usize) -> Result<u64> {
    parse_prefixed(s).with_context(|| format!("line {}: bad number '{}'", lineno + 1, s))
}

fn parse_byte(s: &str, lineno: usize) -> Result<u8> {
    let v = parse_prefixed(s).with_context(|| format!("line {}: bad byte '{}'", lineno + 1, s))?;
    if v > 0xFF {
        bail!("line {}: value '{}' does not fit a byte", lineno + 1, s);
    }
    Ok(v as u8)
}

fn parse_prefixed(s: &str) -> Result<u64> {
    let v = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hexpart) => u64::from_str_radix(hexpart, 16)?,
        None => s.parse()?,
    };
    Ok(v)
}

fn parse_bool(s: &str, lineno: usize) -> Result<bool> {
    match s {
        "yes" | "1" | "true" => Ok(true),
        "no" | "0" | "false" => Ok(false),
        other => bail!("line {}: expected yes/no, got '{}'", lineno + 1, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let cfg = Config::parse(
            "# simulator setup\n\
             mcu atmega328p\n\
             mcu_freq 16000000\n\
             mcu_lfuse 0xFF\n\
             mcu_hfuse 0xD9\n\
             firmware_file blink.hex   # the image\n\
             reset_flash yes\n\
             firmware_test yes\n\
             trap_at_isr no\n\
             vcd_file out.vcd\n\
             dump_regs PORTB, TCNT1,PORTD4\n\
             rsp_port 12750\n\
             lua_model a.lua\n\
             lua_model b.lua\n",
        )
        .unwrap();
        assert_eq!(cfg.mcu, "atmega328p");
        assert_eq!(cfg.mcu_freq, Some(16_000_000));
        assert_eq!(cfg.lfuse, Some(0xFF));
        assert_eq!(cfg.hfuse, Some(0xD9));
        assert!(cfg.reset_flash);
        assert!(cfg.firmware_test);
        assert!(!cfg.trap_at_isr);
        assert_eq!(cfg.dump_regs, vec!["PORTB", "TCNT1", "PORTD4"]);
        assert_eq!(cfg.rsp_port, Some(12750));
        assert_eq!(cfg.lua_models.len(), 2);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::parse("mcu m328p\nbogus 1\n").is_err());
    }

    #[test]
    fn test_missing_mcu_rejected() {
        assert!(Config::parse("mcu_freq 1000000\n").is_err());
    }

    #[test]
    fn test_bad_fuse_rejected() {
        assert!(Config::parse("mcu m328p\nmcu_lfuse 0x123\n").is_err());
        assert!(Config::parse("mcu m328p\nmcu_lfuse zz\n").is_err());
    }

    #[test]
    fn test_comment_and_blank_lines() {
        let cfg = Config::parse("\n# nothing\nmcu m2560\n\n").unwrap();
        assert_eq!(cfg.mcu, "m2560");
    }
}
