//! Static device profiles.
//!
//! A [`DeviceProfile`] is the read-only description of one MCU model:
//! memory bounds, signature, PC width, the data-space offsets of the
//! distinguished registers, the interrupt vector table layout, and the
//! timer configuration blocks. Profiles are consumed by the simulator and
//! never mutated while it runs.
//!
//! Register-bit locations are expressed as [`IoBit`] pairs of
//! `(data-space offset, bit index)` so peripheral code never aliases the
//! data memory with raw pointers.

use crate::interrupt::VectorSpec;
use crate::timer::{ClockSel, CompSpec, TimerSpec};
use crate::Error;

/// A single bit in the data space: byte offset plus bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBit {
    pub reg: u16,
    pub bit: u8,
}

impl IoBit {
    pub const fn new(reg: u16, bit: u8) -> Self {
        IoBit { reg, bit }
    }
}

/// Clock source selected by the CKSEL fuse bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClkSource {
    External,
    InternalRc,
    Internal128k,
    LowFreqCrystal,
    FullSwingCrystal,
    LowPowerCrystal,
}

/// Boot loader section bounds derived from the BOOTSZ fuse bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootSection {
    /// First byte of the boot section in flash
    pub start: u32,
    /// Last byte of the boot section in flash
    pub end: u32,
    /// Section size in bytes
    pub size: u32,
}

/// Named I/O location for trace selection (`dump_regs`).
#[derive(Debug, Clone, Copy)]
pub enum IoName {
    /// 8-bit register
    Byte(&'static str, u16),
    /// 16-bit pair, high then low offset (e.g. TCNT1 = TCNT1H:TCNT1L)
    Pair(&'static str, u16, u16),
}

impl IoName {
    pub fn name(&self) -> &'static str {
        match self {
            IoName::Byte(n, _) | IoName::Pair(n, _, _) => n,
        }
    }
}

/// Static description of one MCU model.
pub struct DeviceProfile {
    pub name: &'static str,
    pub signature: [u8; 3],
    pub xmega: bool,
    pub reduced_core: bool,

    pub flash_start: u32,
    pub flash_end: u32,
    pub ram_start: u16,
    pub ram_end: u16,
    /// Program counter width: 16 or 22 bits
    pub pc_bits: u8,
    pub spm_page_size: usize,

    /// Offset added to I/O-space addresses from IN/OUT/SBI/CBI operands
    pub sfr_off: u16,
    pub sreg: u16,
    pub sph: u16,
    pub spl: u16,
    pub spmcsr: Option<u16>,
    pub rampz: Option<u16>,
    pub eind: Option<u16>,

    /// Interrupt vector table base, in flash bytes
    pub ivt: u32,
    /// Bytes per vector table entry
    pub vector_size: u32,
    pub fuse_defaults: [u8; 3],
    /// Boot section sizes in bytes indexed by BOOTSZ[1:0]
    pub bootsz_bytes: [u32; 4],

    /// All interrupt sources the arbiter scans, in vector order
    pub vectors: Vec<VectorSpec>,
    pub timers: Vec<TimerSpec>,
    pub io_names: Vec<IoName>,
}

impl DeviceProfile {
    /// Look up a profile by the device name used in configuration files.
    pub fn by_name(name: &str) -> Result<DeviceProfile, Error> {
        match name.to_ascii_lowercase().as_str() {
            "atmega328p" | "m328p" => Ok(Self::atmega328p()),
            "atmega2560" | "m2560" => Ok(Self::atmega2560()),
            other => Err(Error::UnknownDevice(other.to_string())),
        }
    }

    /// Total data-space size: registers + I/O + SRAM.
    pub fn dm_size(&self) -> usize {
        self.ram_end as usize + 1
    }

    /// Flash size in bytes.
    pub fn pm_size(&self) -> usize {
        (self.flash_end - self.flash_start) as usize + 1
    }

    /// Resolve a `dump_regs` entry. An exact register name wins; otherwise
    /// a trailing decimal digit selects a single bit of the named register.
    pub fn resolve_dump_reg(&self, entry: &str) -> Option<DumpReg> {
        let entry = entry.trim();
        for io in &self.io_names {
            if io.name().eq_ignore_ascii_case(entry) {
                return Some(match *io {
                    IoName::Byte(name, off) => DumpReg::Byte { name, off },
                    IoName::Pair(name, hi, lo) => DumpReg::Pair { name, hi, lo },
                });
            }
        }
        // "PORTB4" selects bit 4 of PORTB
        let (base, bit) = entry.split_at(entry.len().checked_sub(1)?);
        let bit: u8 = bit.parse().ok()?;
        if bit > 7 {
            return None;
        }
        for io in &self.io_names {
            if let IoName::Byte(name, off) = *io {
                if name.eq_ignore_ascii_case(base) {
                    return Some(DumpReg::Bit { name, off, bit });
                }
            }
        }
        None
    }

    /// ATmega328P: 32 KB flash, 2 KB SRAM, 16-bit PC, Timer0/1/2.
    pub fn atmega328p() -> DeviceProfile {
        // Vector numbers from the ATmega328P vector table (reset = 0).
        const T2_COMPA: u8 = 7;
        const T2_COMPB: u8 = 8;
        const T2_OVF: u8 = 9;
        const T1_CAPT: u8 = 10;
        const T1_COMPA: u8 = 11;
        const T1_COMPB: u8 = 12;
        const T1_OVF: u8 = 13;
        const T0_COMPA: u8 = 14;
        const T0_COMPB: u8 = 15;
        const T0_OVF: u8 = 16;

        const TIFR0: u16 = 0x35;
        const TIFR1: u16 = 0x36;
        const TIFR2: u16 = 0x37;
        const TIMSK0: u16 = 0x6E;
        const TIMSK1: u16 = 0x6F;
        const TIMSK2: u16 = 0x70;

        let timer0 = TimerSpec {
            name: "timer0",
            size: 8,
            tcnt_lo: 0x46,
            tcnt_hi: None,
            cs_reg: 0x45, // TCCR0B
            wgm_bits: vec![
                IoBit::new(0x44, 0), // WGM00
                IoBit::new(0x44, 1), // WGM01
                IoBit::new(0x45, 3), // WGM02
            ],
            clock_table: [
                ClockSel::Stopped,
                ClockSel::Div(1),
                ClockSel::Div(8),
                ClockSel::Div(64),
                ClockSel::Div(256),
                ClockSel::Div(1024),
                ClockSel::ExtFall,
                ClockSel::ExtRise,
            ],
            ec_pin: Some(IoBit::new(0x29, 4)), // T0 = PD4
            icr: None,
            icp: None,
            ices: None,
            ovf: VectorSpec {
                enable: IoBit::new(TIMSK0, 0),
                raised: IoBit::new(TIFR0, 0),
                vector: T0_OVF,
            },
            capt: None,
            comps: vec![
                CompSpec {
                    ocr_lo: 0x47,
                    ocr_hi: None,
                    pin: IoBit::new(0x2B, 6), // OC0A = PD6
                    ddr: IoBit::new(0x2A, 6),
                    com_reg: 0x44,
                    com_lowbit: 6,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK0, 1),
                        raised: IoBit::new(TIFR0, 1),
                        vector: T0_COMPA,
                    },
                },
                CompSpec {
                    ocr_lo: 0x48,
                    ocr_hi: None,
                    pin: IoBit::new(0x2B, 5), // OC0B = PD5
                    ddr: IoBit::new(0x2A, 5),
                    com_reg: 0x44,
                    com_lowbit: 4,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK0, 2),
                        raised: IoBit::new(TIFR0, 2),
                        vector: T0_COMPB,
                    },
                },
            ],
        };

        let timer1 = TimerSpec {
            name: "timer1",
            size: 16,
            tcnt_lo: 0x84,
            tcnt_hi: Some(0x85),
            cs_reg: 0x81, // TCCR1B
            wgm_bits: vec![
                IoBit::new(0x80, 0), // WGM10
                IoBit::new(0x80, 1), // WGM11
                IoBit::new(0x81, 3), // WGM12
                IoBit::new(0x81, 4), // WGM13
            ],
            clock_table: [
                ClockSel::Stopped,
                ClockSel::Div(1),
                ClockSel::Div(8),
                ClockSel::Div(64),
                ClockSel::Div(256),
                ClockSel::Div(1024),
                ClockSel::ExtFall,
                ClockSel::ExtRise,
            ],
            ec_pin: Some(IoBit::new(0x29, 5)), // T1 = PD5
            icr: Some((0x86, 0x87)),
            icp: Some(IoBit::new(0x23, 0)),  // ICP1 = PB0
            ices: Some(IoBit::new(0x81, 6)), // ICES1
            ovf: VectorSpec {
                enable: IoBit::new(TIMSK1, 0),
                raised: IoBit::new(TIFR1, 0),
                vector: T1_OVF,
            },
            capt: Some(VectorSpec {
                enable: IoBit::new(TIMSK1, 5),
                raised: IoBit::new(TIFR1, 5),
                vector: T1_CAPT,
            }),
            comps: vec![
                CompSpec {
                    ocr_lo: 0x88,
                    ocr_hi: Some(0x89),
                    pin: IoBit::new(0x25, 1), // OC1A = PB1
                    ddr: IoBit::new(0x24, 1),
                    com_reg: 0x80,
                    com_lowbit: 6,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK1, 1),
                        raised: IoBit::new(TIFR1, 1),
                        vector: T1_COMPA,
                    },
                },
                CompSpec {
                    ocr_lo: 0x8A,
                    ocr_hi: Some(0x8B),
                    pin: IoBit::new(0x25, 2), // OC1B = PB2
                    ddr: IoBit::new(0x24, 2),
                    com_reg: 0x80,
                    com_lowbit: 4,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK1, 2),
                        raised: IoBit::new(TIFR1, 2),
                        vector: T1_COMPB,
                    },
                },
            ],
        };

        // Timer2 is the async timer: wider prescaler ladder, no T pin.
        let timer2 = TimerSpec {
            name: "timer2",
            size: 8,
            tcnt_lo: 0xB2,
            tcnt_hi: None,
            cs_reg: 0xB1, // TCCR2B
            wgm_bits: vec![
                IoBit::new(0xB0, 0),
                IoBit::new(0xB0, 1),
                IoBit::new(0xB1, 3),
            ],
            clock_table: [
                ClockSel::Stopped,
                ClockSel::Div(1),
                ClockSel::Div(8),
                ClockSel::Div(32),
                ClockSel::Div(64),
                ClockSel::Div(128),
                ClockSel::Div(256),
                ClockSel::Div(1024),
            ],
            ec_pin: None,
            icr: None,
            icp: None,
            ices: None,
            ovf: VectorSpec {
                enable: IoBit::new(TIMSK2, 0),
                raised: IoBit::new(TIFR2, 0),
                vector: T2_OVF,
            },
            capt: None,
            comps: vec![
                CompSpec {
                    ocr_lo: 0xB3,
                    ocr_hi: None,
                    pin: IoBit::new(0x25, 3), // OC2A = PB3
                    ddr: IoBit::new(0x24, 3),
                    com_reg: 0xB0,
                    com_lowbit: 6,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK2, 1),
                        raised: IoBit::new(TIFR2, 1),
                        vector: T2_COMPA,
                    },
                },
                CompSpec {
                    ocr_lo: 0xB4,
                    ocr_hi: None,
                    pin: IoBit::new(0x2B, 3), // OC2B = PD3
                    ddr: IoBit::new(0x2A, 3),
                    com_reg: 0xB0,
                    com_lowbit: 4,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK2, 2),
                        raised: IoBit::new(TIFR2, 2),
                        vector: T2_COMPB,
                    },
                },
            ],
        };

        let timers = vec![timer0, timer1, timer2];
        let vectors = collect_vectors(&timers);

        DeviceProfile {
            name: "ATmega328P",
            signature: [0x1E, 0x95, 0x0F],
            xmega: false,
            reduced_core: false,
            flash_start: 0x0000,
            flash_end: 0x7FFF,
            ram_start: 0x0100,
            ram_end: 0x08FF,
            pc_bits: 16,
            spm_page_size: 128,
            sfr_off: 0x20,
            sreg: 0x5F,
            sph: 0x5E,
            spl: 0x5D,
            spmcsr: Some(0x57),
            rampz: None,
            eind: None,
            ivt: 0x0000,
            vector_size: 4,
            fuse_defaults: [0x62, 0xD9, 0xFF],
            bootsz_bytes: [4096, 2048, 1024, 512],
            vectors,
            timers,
            io_names: vec![
                IoName::Byte("PINB", 0x23),
                IoName::Byte("DDRB", 0x24),
                IoName::Byte("PORTB", 0x25),
                IoName::Byte("PINC", 0x26),
                IoName::Byte("DDRC", 0x27),
                IoName::Byte("PORTC", 0x28),
                IoName::Byte("PIND", 0x29),
                IoName::Byte("DDRD", 0x2A),
                IoName::Byte("PORTD", 0x2B),
                IoName::Byte("TIFR0", 0x35),
                IoName::Byte("TIFR1", 0x36),
                IoName::Byte("TIFR2", 0x37),
                IoName::Byte("TCCR0A", 0x44),
                IoName::Byte("TCCR0B", 0x45),
                IoName::Byte("TCNT0", 0x46),
                IoName::Byte("OCR0A", 0x47),
                IoName::Byte("OCR0B", 0x48),
                IoName::Byte("SPMCSR", 0x57),
                IoName::Byte("SPL", 0x5D),
                IoName::Byte("SPH", 0x5E),
                IoName::Byte("SREG", 0x5F),
                IoName::Byte("TIMSK0", 0x6E),
                IoName::Byte("TIMSK1", 0x6F),
                IoName::Byte("TIMSK2", 0x70),
                IoName::Byte("TCCR1A", 0x80),
                IoName::Byte("TCCR1B", 0x81),
                IoName::Pair("TCNT1", 0x85, 0x84),
                IoName::Pair("ICR1", 0x87, 0x86),
                IoName::Pair("OCR1A", 0x89, 0x88),
                IoName::Pair("OCR1B", 0x8B, 0x8A),
                IoName::Byte("TCCR2A", 0xB0),
                IoName::Byte("TCCR2B", 0xB1),
                IoName::Byte("TCNT2", 0xB2),
                IoName::Byte("OCR2A", 0xB3),
                IoName::Byte("OCR2B", 0xB4),
            ],
        }
    }

    /// ATmega2560: 256 KB flash, 22-bit PC, RAMPZ and EIND present.
    ///
    /// Only Timer0 is configured; this profile exists to exercise the
    /// 3-byte return-address and extended-register paths.
    pub fn atmega2560() -> DeviceProfile {
        const T0_COMPA: u8 = 21;
        const T0_COMPB: u8 = 22;
        const T0_OVF: u8 = 23;

        const TIFR0: u16 = 0x35;
        const TIMSK0: u16 = 0x6E;

        let timer0 = TimerSpec {
            name: "timer0",
            size: 8,
            tcnt_lo: 0x46,
            tcnt_hi: None,
            cs_reg: 0x45,
            wgm_bits: vec![
                IoBit::new(0x44, 0),
                IoBit::new(0x44, 1),
                IoBit::new(0x45, 3),
            ],
            clock_table: [
                ClockSel::Stopped,
                ClockSel::Div(1),
                ClockSel::Div(8),
                ClockSel::Div(64),
                ClockSel::Div(256),
                ClockSel::Div(1024),
                ClockSel::ExtFall,
                ClockSel::ExtRise,
            ],
            ec_pin: Some(IoBit::new(0x29, 7)), // T0 = PD7
            icr: None,
            icp: None,
            ices: None,
            ovf: VectorSpec {
                enable: IoBit::new(TIMSK0, 0),
                raised: IoBit::new(TIFR0, 0),
                vector: T0_OVF,
            },
            capt: None,
            comps: vec![
                CompSpec {
                    ocr_lo: 0x47,
                    ocr_hi: None,
                    pin: IoBit::new(0x25, 7), // OC0A = PB7
                    ddr: IoBit::new(0x24, 7),
                    com_reg: 0x44,
                    com_lowbit: 6,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK0, 1),
                        raised: IoBit::new(TIFR0, 1),
                        vector: T0_COMPA,
                    },
                },
                CompSpec {
                    ocr_lo: 0x48,
                    ocr_hi: None,
                    pin: IoBit::new(0x34, 5), // OC0B = PG5
                    ddr: IoBit::new(0x33, 5),
                    com_reg: 0x44,
                    com_lowbit: 4,
                    vec: VectorSpec {
                        enable: IoBit::new(TIMSK0, 2),
                        raised: IoBit::new(TIFR0, 2),
                        vector: T0_COMPB,
                    },
                },
            ],
        };

        let timers = vec![timer0];
        let vectors = collect_vectors(&timers);

        DeviceProfile {
            name: "ATmega2560",
            signature: [0x1E, 0x98, 0x01],
            xmega: false,
            reduced_core: false,
            flash_start: 0x00000,
            flash_end: 0x3FFFF,
            ram_start: 0x0200,
            ram_end: 0x21FF,
            pc_bits: 22,
            spm_page_size: 256,
            sfr_off: 0x20,
            sreg: 0x5F,
            sph: 0x5E,
            spl: 0x5D,
            spmcsr: Some(0x57),
            rampz: Some(0x5B),
            eind: Some(0x5C),
            ivt: 0x00000,
            vector_size: 4,
            fuse_defaults: [0x62, 0xD9, 0xFF],
            bootsz_bytes: [8192, 4096, 2048, 1024],
            vectors,
            timers,
            io_names: vec![
                IoName::Byte("PINB", 0x23),
                IoName::Byte("DDRB", 0x24),
                IoName::Byte("PORTB", 0x25),
                IoName::Byte("PIND", 0x29),
                IoName::Byte("DDRD", 0x2A),
                IoName::Byte("PORTD", 0x2B),
                IoName::Byte("PING", 0x32),
                IoName::Byte("DDRG", 0x33),
                IoName::Byte("PORTG", 0x34),
                IoName::Byte("TIFR0", 0x35),
                IoName::Byte("TCCR0A", 0x44),
                IoName::Byte("TCCR0B", 0x45),
                IoName::Byte("TCNT0", 0x46),
                IoName::Byte("OCR0A", 0x47),
                IoName::Byte("OCR0B", 0x48),
                IoName::Byte("RAMPZ", 0x5B),
                IoName::Byte("EIND", 0x5C),
                IoName::Byte("SPL", 0x5D),
                IoName::Byte("SPH", 0x5E),
                IoName::Byte("SREG", 0x5F),
                IoName::Byte("TIMSK0", 0x6E),
            ],
        }
    }
}

/// Flatten every interrupt source of the timer blocks into the arbiter's
/// scan table, ordered by vector number.
fn collect_vectors(timers: &[TimerSpec]) -> Vec<VectorSpec> {
    let mut v = Vec::new();
    for t in timers {
        v.push(t.ovf.clone());
        if let Some(capt) = &t.capt {
            v.push(capt.clone());
        }
        for c in &t.comps {
            v.push(c.vec.clone());
        }
    }
    v.sort_by_key(|s| s.vector);
    v
}

/// Resolved `dump_regs` selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpReg {
    Byte { name: &'static str, off: u16 },
    Pair { name: &'static str, hi: u16, lo: u16 },
    Bit { name: &'static str, off: u16, bit: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        assert!(DeviceProfile::by_name("atmega328p").is_ok());
        assert!(DeviceProfile::by_name("m328p").is_ok());
        assert!(DeviceProfile::by_name("at90s2313").is_err());
    }

    #[test]
    fn test_m328p_bounds() {
        let d = DeviceProfile::atmega328p();
        assert_eq!(d.dm_size(), 0x900);
        assert_eq!(d.pm_size(), 32 * 1024);
        assert_eq!(d.pc_bits, 16);
        assert!(d.rampz.is_none());
    }

    #[test]
    fn test_m2560_extended_registers() {
        let d = DeviceProfile::atmega2560();
        assert_eq!(d.pc_bits, 22);
        assert_eq!(d.rampz, Some(0x5B));
        assert_eq!(d.eind, Some(0x5C));
        assert_eq!(d.pm_size(), 256 * 1024);
    }

    #[test]
    fn test_vector_table_sorted() {
        let d = DeviceProfile::atmega328p();
        let nums: Vec<u8> = d.vectors.iter().map(|v| v.vector).collect();
        let mut sorted = nums.clone();
        sorted.sort_unstable();
        assert_eq!(nums, sorted);
        // timer0/2: ovf + 2 compare; timer1 adds input capture
        assert_eq!(d.vectors.len(), 10);
    }

    #[test]
    fn test_resolve_dump_reg() {
        let d = DeviceProfile::atmega328p();
        assert_eq!(
            d.resolve_dump_reg("PORTB"),
            Some(DumpReg::Byte { name: "PORTB", off: 0x25 })
        );
        assert_eq!(
            d.resolve_dump_reg("PORTB4"),
            Some(DumpReg::Bit { name: "PORTB", off: 0x25, bit: 4 })
        );
        // Exact names win over the trailing-digit rule.
        assert_eq!(
            d.resolve_dump_reg("TCNT1"),
            Some(DumpReg::Pair { name: "TCNT1", hi: 0x85, lo: 0x84 })
        );
        assert_eq!(d.resolve_dump_reg("NOSUCH"), None);
    }
}
