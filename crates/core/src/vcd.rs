//! VCD waveform trace writer.
//!
//! Emits a change-only value dump of selected I/O registers, one sample
//! opportunity per simulated tick. The timescale is one CPU clock period
//! expressed in picoseconds, so viewers show real time for the configured
//! frequency. Variables are 8-bit registers, 16-bit register pairs, or
//! single register bits, matching the `dump_regs` selection syntax.

use std::io::{self, Write};

use crate::device::DumpReg;
use crate::Mcu;

const TERA: f64 = 1e12;

struct VcdVar {
    sel: DumpReg,
    ident: String,
    old: u16,
}

/// Streaming VCD writer over any byte sink.
pub struct VcdDump<W: Write> {
    out: W,
    vars: Vec<VcdVar>,
}

impl<W: Write> VcdDump<W> {
    /// Write the VCD header, variable declarations and the initial
    /// `$dumpvars` block for the selected registers.
    pub fn create(mut out: W, mcu: &Mcu, selection: &[DumpReg]) -> io::Result<VcdDump<W>> {
        writeln!(out, "$version\n\tavrsim {}\n$end", env!("CARGO_PKG_VERSION"))?;
        writeln!(out, "$comment\n\tDump of a simulated {}\n$end", mcu.device.name)?;
        let period_ps = (1.0 / mcu.freq as f64) * TERA;
        writeln!(out, "$timescale\n\t{} ps\n$end", period_ps as u64)?;
        writeln!(out, "$scope\n\tmodule {}\n$end", mcu.device.name)?;

        let mut vars = Vec::with_capacity(selection.len());
        for &sel in selection {
            let (width, ident) = match sel {
                DumpReg::Byte { name, .. } => (8, name.to_string()),
                DumpReg::Pair { name, .. } => (16, name.to_string()),
                DumpReg::Bit { name, bit, .. } => (1, format!("{}{}", name, bit)),
            };
            writeln!(out, "$var reg {} {} {} $end", width, ident, ident)?;
            vars.push(VcdVar { sel, ident, old: 0 });
        }
        writeln!(out, "$upscope $end")?;
        writeln!(out, "$enddefinitions $end")?;

        writeln!(out, "$dumpvars")?;
        for var in &mut vars {
            let v = read_var(mcu, var.sel);
            writeln!(out, "b{} {}", format_bits(v, width_of(var.sel)), var.ident)?;
            var.old = v;
        }
        writeln!(out, "$end")?;

        Ok(VcdDump { out, vars })
    }

    /// Emit a `#tick` frame if at least one selected register changed
    /// since the previous frame.
    pub fn dump_frame(&mut self, mcu: &Mcu, tick: u64) -> io::Result<()> {
        let changed = self
            .vars
            .iter()
            .any(|var| read_var(mcu, var.sel) != var.old);
        if !changed {
            return Ok(());
        }

        writeln!(self.out, "#{}", tick)?;
        for var in &mut self.vars {
            let v = read_var(mcu, var.sel);
            if v == var.old {
                continue;
            }
            writeln!(self.out, "b{} {}", format_bits(v, width_of(var.sel)), var.ident)?;
            var.old = v;
        }
        Ok(())
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

fn width_of(sel: DumpReg) -> u8 {
    match sel {
        DumpReg::Byte { .. } => 8,
        DumpReg::Pair { .. } => 16,
        DumpReg::Bit { .. } => 1,
    }
}

fn read_var(mcu: &Mcu, sel: DumpReg) -> u16 {
    match sel {
        DumpReg::Byte { off, .. } => mcu.mem.read_dm(off) as u16,
        DumpReg::Pair { hi, lo, .. } => {
            ((mcu.mem.read_dm(hi) as u16) << 8) | mcu.mem.read_dm(lo) as u16
        }
        DumpReg::Bit { off, bit, .. } => ((mcu.mem.read_dm(off) >> bit) & 1) as u16,
    }
}

/// Binary digits, MSB first, full declared width.
fn format_bits(v: u16, width: u8) -> String {
    (0..width)
        .rev()
        .map(|i| if (v >> i) & 1 != 0 { '1' } else { '0' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;

    fn mcu() -> Mcu {
        Mcu::new(DeviceProfile::atmega328p()).unwrap()
    }

    /// Minimal reader for the subset this writer produces: returns the
    /// value series per identifier as (tick, value) pairs, with the
    /// initial `$dumpvars` values at tick 0.
    fn parse_dump(text: &str) -> Vec<(u64, String, u16)> {
        let mut series = Vec::new();
        let mut tick = 0u64;
        let mut in_defs = true;
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with("$enddefinitions") {
                in_defs = false;
                continue;
            }
            if in_defs {
                continue;
            }
            if let Some(t) = line.strip_prefix('#') {
                tick = t.parse().unwrap();
            } else if let Some(rest) = line.strip_prefix('b') {
                let (bits, name) = rest.split_once(' ').unwrap();
                let v = u16::from_str_radix(bits, 2).unwrap();
                series.push((tick, name.to_string(), v));
            }
        }
        series
    }

    #[test]
    fn test_header_declares_selected_vars() {
        let m = mcu();
        let sel = [
            m.device.resolve_dump_reg("PORTB").unwrap(),
            m.device.resolve_dump_reg("TCNT1").unwrap(),
            m.device.resolve_dump_reg("PORTD4").unwrap(),
        ];
        let dump = VcdDump::create(Vec::new(), &m, &sel).unwrap();
        let text = String::from_utf8(dump.finish().unwrap()).unwrap();
        assert!(text.contains("$var reg 8 PORTB PORTB $end"));
        assert!(text.contains("$var reg 16 TCNT1 TCNT1 $end"));
        assert!(text.contains("$var reg 1 PORTD4 PORTD4 $end"));
        assert!(text.contains("$dumpvars"));
    }

    #[test]
    fn test_timescale_follows_frequency() {
        let mut m = mcu();
        m.freq = 16_000_000;
        let dump = VcdDump::create(Vec::new(), &m, &[]).unwrap();
        let text = String::from_utf8(dump.finish().unwrap()).unwrap();
        // 1/16MHz = 62500 ps
        assert!(text.contains("62500 ps"));
    }

    #[test]
    fn test_frames_only_on_change() {
        let mut m = mcu();
        let sel = [m.device.resolve_dump_reg("PORTB").unwrap()];
        let mut dump = VcdDump::create(Vec::new(), &m, &sel).unwrap();

        dump.dump_frame(&m, 1).unwrap(); // no change
        m.mem.write_dm(0x25, 0x55);
        dump.dump_frame(&m, 2).unwrap();
        dump.dump_frame(&m, 3).unwrap(); // no change again
        let text = String::from_utf8(dump.finish().unwrap()).unwrap();
        assert!(!text.contains("#1\n"));
        assert!(text.contains("#2"));
        assert!(!text.contains("#3"));
    }

    #[test]
    fn test_value_series_round_trip() {
        let mut m = mcu();
        let sel = [
            m.device.resolve_dump_reg("PORTB").unwrap(),
            m.device.resolve_dump_reg("TCNT1").unwrap(),
        ];
        let mut dump = VcdDump::create(Vec::new(), &m, &sel).unwrap();

        let script: [(u64, u16, u16); 3] = [(5, 0x01, 0x0100), (9, 0x03, 0x0100), (21, 0x03, 0x1234)];
        for &(tick, portb, tcnt1) in &script {
            m.mem.write_dm(0x25, portb as u8);
            m.mem.write_dm(0x84, tcnt1 as u8);
            m.mem.write_dm(0x85, (tcnt1 >> 8) as u8);
            dump.dump_frame(&m, tick).unwrap();
        }
        let text = String::from_utf8(dump.finish().unwrap()).unwrap();
        let series = parse_dump(&text);

        // Initial values at tick 0.
        assert!(series.contains(&(0, "PORTB".into(), 0)));
        assert!(series.contains(&(0, "TCNT1".into(), 0)));
        // Every scripted change is present at its tick...
        assert!(series.contains(&(5, "PORTB".into(), 0x01)));
        assert!(series.contains(&(5, "TCNT1".into(), 0x0100)));
        assert!(series.contains(&(9, "PORTB".into(), 0x03)));
        assert!(series.contains(&(21, "TCNT1".into(), 0x1234)));
        // ...and unchanged values are not re-emitted.
        assert!(!series.contains(&(9, "TCNT1".into(), 0x0100)));
        assert!(!series.contains(&(21, "PORTB".into(), 0x03)));
    }

    #[test]
    fn test_bit_variable() {
        let mut m = mcu();
        let sel = [m.device.resolve_dump_reg("PORTB4").unwrap()];
        let mut dump = VcdDump::create(Vec::new(), &m, &sel).unwrap();
        m.mem.write_dm(0x25, 1 << 4);
        dump.dump_frame(&m, 7).unwrap();
        // Other bits of the register do not produce frames.
        m.mem.write_dm(0x25, (1 << 4) | 0x03);
        dump.dump_frame(&m, 8).unwrap();
        let text = String::from_utf8(dump.finish().unwrap()).unwrap();
        assert!(text.contains("#7\nb1 PORTB4"));
        assert!(!text.contains("#8"));
    }
}
