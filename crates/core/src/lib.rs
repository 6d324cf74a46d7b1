//! # avrsim-core
//!
//! Cycle-accurate functional simulation core for 8-bit AVR microcontrollers.
//!
//! Given a firmware image in flash and a static [`DeviceProfile`]
//! (memory bounds, register layout, vector table, timer configuration),
//! the core advances a virtual CPU one clock cycle per [`Mcu::run_cycle`]
//! call, reproducing the architectural effect of every instruction on the
//! register file, the status register, data memory, program memory, the
//! stack and the interrupt subsystem.
//!
//! ## Architecture
//!
//! - [`Mcu`] — one simulated microcontroller instance: profile + memories +
//!   cycle bookkeeping + interrupt state + timers
//! - [`device`] — static per-MCU profiles (ATmega328P, ATmega2560)
//! - [`opcodes`] — instruction decoder
//! - [`exec`] — instruction executor with per-cycle multi-cycle accounting
//! - [`timer`] — timer/counter subsystem (prescalers, waveform modes,
//!   output compare, input capture, external clocking)
//! - [`interrupt`] — interrupt arbiter and vector dispatch
//! - [`hex`] — Intel-HEX firmware loader
//! - [`vcd`] — VCD waveform trace writer
//! - [`rsp`] — GDB remote serial protocol endpoint
//! - [`model`] — hook trait for external peripheral models
//!
//! ## Cycle ordering
//!
//! One driver iteration is: instruction effect, cycle-counter advance,
//! timer tick, then — only at an instruction boundary — interrupt
//! acceptance. External hooks (trace writer, peripheral models, debugger)
//! observe the machine between iterations.

pub mod device;
pub mod exec;
pub mod hex;
pub mod interrupt;
pub mod memory;
pub mod model;
pub mod opcodes;
pub mod rsp;
pub mod timer;
pub mod vcd;

use device::{ClkSource, DeviceProfile};
use interrupt::IntState;
use memory::Memory;
use timer::Timer;

use log::error;
use thiserror::Error;

// SREG bit positions
pub const SREG_C: u8 = 0;
pub const SREG_Z: u8 = 1;
pub const SREG_N: u8 = 2;
pub const SREG_V: u8 = 3;
pub const SREG_S: u8 = 4;
pub const SREG_H: u8 = 5;
pub const SREG_T: u8 = 6;
pub const SREG_I: u8 = 7;

/// Simulation failures. The core never panics on a simulation path; every
/// failure is a value on a return path.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown device model: {0}")]
    UnknownDevice(String),
    #[error("unknown instruction 0x{word:04X} at pc=0x{pc:06X}")]
    UnknownInstruction { word: u16, pc: u32 },
    #[error("firmware image: {0}")]
    Firmware(String),
    #[error("fuse byte #{0} is not supported on this device")]
    UnsupportedFuse(u32),
    #[error("reserved CKSEL encoding {0:#03x}")]
    ReservedClockSelect(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// State of a simulated MCU. Some states are AVR-native, the rest are
/// simulator controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Halted, waiting to be resumed (breakpoint, debugger)
    Stopped,
    /// SLEEP executed; woken by an interrupt
    Sleeping,
    /// Execute exactly one instruction, then stop
    Step,
    /// Terminate simulation and exit
    Stop,
    /// Terminate simulation because of test failure
    TestFail,
}

impl RunState {
    /// True for the states that end the simulation.
    pub fn is_exit(self) -> bool {
        matches!(self, RunState::Stop | RunState::TestFail)
    }
}

/// One simulated AVR microcontroller.
pub struct Mcu {
    pub device: DeviceProfile,
    pub mem: Memory,
    /// Program counter, byte address, always even
    pub pc: u32,
    /// Monotonic cycle counter
    pub cycles: u64,
    /// True while inside a multi-cycle instruction
    pub in_multi: bool,
    /// Cycles left to finish the current instruction
    pub ic_left: u8,
    pub run_state: RunState,
    /// Clock frequency, Hz
    pub freq: u64,
    pub clk_source: ClkSource,
    pub fuse: [u8; 3],
    pub lockbits: u8,
    /// Boot section bounds, refined by the high fuse
    pub bls: device::BootSection,
    pub intr: IntState,
    pub timers: Vec<Timer>,
}

impl Mcu {
    /// Create an MCU in power-on state: PC at the reset vector, SP at the
    /// top of SRAM, default fuses applied.
    pub fn new(device: DeviceProfile) -> Result<Mcu, Error> {
        let mem = Memory::new(device.dm_size(), device.pm_size(), device.spm_page_size);
        let timers = device.timers.iter().map(Timer::new).collect();
        let intr = IntState::new(device.ivt);
        let fuse_defaults = device.fuse_defaults;
        let mut mcu = Mcu {
            device,
            mem,
            pc: 0,
            cycles: 0,
            in_multi: false,
            ic_left: 0,
            run_state: RunState::Running,
            freq: 1_000_000,
            clk_source: ClkSource::InternalRc,
            fuse: fuse_defaults,
            lockbits: 0xFF,
            bls: device::BootSection::default(),
            intr,
            timers,
        };
        mcu.set_sp(mcu.device.ram_end);
        for n in 0..3 {
            mcu.set_fuse(n, fuse_defaults[n as usize])?;
        }
        Ok(mcu)
    }

    // --- SREG flag engine ---

    #[inline(always)]
    pub fn sreg(&self) -> u8 {
        self.mem.dm[self.device.sreg as usize]
    }

    #[inline(always)]
    pub fn set_sreg(&mut self, v: u8) {
        self.mem.dm[self.device.sreg as usize] = v;
    }

    #[inline(always)]
    pub fn flag(&self, bit: u8) -> bool {
        self.sreg() & (1 << bit) != 0
    }

    #[inline(always)]
    pub fn set_flag(&mut self, bit: u8, v: bool) {
        let s = self.sreg();
        self.set_sreg(if v { s | (1 << bit) } else { s & !(1 << bit) });
    }

    // --- Stack ---

    #[inline(always)]
    pub fn sp(&self) -> u16 {
        self.mem.dm[self.device.spl as usize] as u16
            | ((self.mem.dm[self.device.sph as usize] as u16) << 8)
    }

    #[inline(always)]
    pub fn set_sp(&mut self, v: u16) {
        self.mem.dm[self.device.spl as usize] = v as u8;
        self.mem.dm[self.device.sph as usize] = (v >> 8) as u8;
    }

    /// Push one byte: write to `dm[SP]`, then decrement SP.
    pub fn stack_push(&mut self, b: u8) {
        let sp = self.sp();
        self.mem.write_dm(sp, b);
        self.set_sp(sp.wrapping_sub(1));
    }

    /// Pop one byte: increment SP, then read `dm[SP]`.
    pub fn stack_pop(&mut self) -> u8 {
        let sp = self.sp().wrapping_add(1);
        self.set_sp(sp);
        self.mem.read_dm(sp)
    }

    /// Push a return address; width follows the device PC width.
    pub fn push_pc(&mut self, pc: u32) {
        self.stack_push(pc as u8);
        self.stack_push((pc >> 8) as u8);
        if self.device.pc_bits > 16 {
            self.stack_push((pc >> 16) as u8);
        }
    }

    /// Pop a return address pushed by [`push_pc`](Self::push_pc).
    pub fn pop_pc(&mut self) -> u32 {
        let e = if self.device.pc_bits > 16 {
            self.stack_pop() as u32
        } else {
            0
        };
        let h = self.stack_pop() as u32;
        let l = self.stack_pop() as u32;
        (e << 16) | (h << 8) | l
    }

    // --- Extended registers ---

    pub fn rampz(&self) -> u8 {
        self.device
            .rampz
            .map(|off| self.mem.dm[off as usize])
            .unwrap_or(0)
    }

    pub fn set_rampz(&mut self, v: u8) {
        if let Some(off) = self.device.rampz {
            self.mem.dm[off as usize] = v;
        }
    }

    // --- Configuration ---

    /// Apply a fuse byte. The low fuse selects the clock source (and caps
    /// the frequency), the high fuse sets the boot section and reset vector.
    pub fn set_fuse(&mut self, fuse_n: u32, value: u8) -> Result<(), Error> {
        if fuse_n > 2 {
            return Err(Error::UnsupportedFuse(fuse_n));
        }
        self.fuse[fuse_n as usize] = value;

        match fuse_n {
            0 => {
                let cksel = value & 0x0F;
                match cksel {
                    0 => self.clk_source = ClkSource::External,
                    1 => return Err(Error::ReservedClockSelect(cksel)),
                    2 => {
                        self.clk_source = ClkSource::InternalRc;
                        self.freq = 8_000_000;
                    }
                    3 => {
                        self.clk_source = ClkSource::Internal128k;
                        self.freq = 128_000;
                    }
                    4 | 5 => {
                        self.clk_source = ClkSource::LowFreqCrystal;
                        self.freq = if cksel == 4 { 1_000_000 } else { 32_768 };
                    }
                    6 | 7 => {
                        self.clk_source = ClkSource::FullSwingCrystal;
                        self.freq = 20_000_000;
                    }
                    _ => {
                        self.clk_source = ClkSource::LowPowerCrystal;
                        // CKSEL3:1 selects the frequency range ceiling.
                        self.freq = match cksel & 0xE {
                            8 => 900_000,
                            10 => 3_000_000,
                            12 => 8_000_000,
                            _ => 16_000_000,
                        };
                    }
                }
            }
            1 => {
                let bootsz = (value >> 1) & 0x3;
                let size = self.device.bootsz_bytes[bootsz as usize];
                self.bls = device::BootSection {
                    start: self.device.flash_end + 1 - size,
                    end: self.device.flash_end,
                    size,
                };
                // BOOTRST (bit 0) clear moves reset into the boot section.
                self.intr.reset_pc = if value & 1 == 1 { 0 } else { self.bls.start };
                self.pc = self.intr.reset_pc;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_lockbits(&mut self, value: u8) {
        self.lockbits = value;
    }

    /// Load an Intel-HEX firmware image into flash and reset the PC.
    /// When `reset_flash` is set, program memory is erased to 0xFF first.
    pub fn load_firmware(&mut self, image: &str, reset_flash: bool) -> Result<usize, Error> {
        if reset_flash {
            self.mem.pm.fill(0xFF);
        }
        let n = hex::load(image, &mut self.mem.pm, self.device.flash_start)?;
        self.pc = self.intr.reset_pc;
        Ok(n)
    }

    // --- Simulation ---

    /// Decode and execute one clock cycle's worth of the instruction at PC.
    ///
    /// On a cycle that completes an instruction, PC, SREG, memory and stack
    /// are updated; on an intermediate cycle of a multi-cycle instruction
    /// only the remaining-cycle count changes.
    pub fn step(&mut self) -> Result<(), Error> {
        let from_mpm = self.mem.read_from_mpm;
        let word = if from_mpm {
            self.mem.read_mpm_word(self.pc)
        } else {
            self.mem.read_flash_word(self.pc)
        };
        let next_word = self.mem.read_flash_word(self.pc + 2);
        let (inst, _) = opcodes::decode(word, next_word, self.device.reduced_core);
        if let opcodes::Instruction::Unknown(w) = inst {
            return Err(Error::UnknownInstruction { word: w, pc: self.pc });
        }
        self.execute(inst);
        // The match-point redirection is consumed once the displaced
        // instruction has fully executed.
        if from_mpm && !self.in_multi {
            self.mem.read_from_mpm = false;
        }
        Ok(())
    }

    /// One driver-loop iteration: instruction cycle, cycle counter, timer
    /// tick, and (at an instruction boundary) interrupt acceptance.
    pub fn run_cycle(&mut self) -> Result<(), Error> {
        match self.run_state {
            RunState::Sleeping => {
                // The core idles; timers keep counting and an accepted
                // interrupt wakes it.
            }
            _ => self.step()?,
        }
        self.cycles += 1;
        self.tick_timers();
        if !self.in_multi {
            self.service_interrupts();
        }
        Ok(())
    }

    /// Advance every configured timer by one CPU cycle.
    pub fn tick_timers(&mut self) {
        let Mcu { timers, mem, .. } = self;
        for t in timers.iter_mut() {
            t.tick(mem);
        }
    }

    /// Run until the MCU reaches an exit or halt state, or the cycle budget
    /// is exhausted. Returns the final run state.
    ///
    /// An unknown opcode is reported and turns into
    /// [`RunState::TestFail`], matching the controlled-exit error policy.
    pub fn run_to_completion(&mut self, max_cycles: u64) -> RunState {
        let deadline = self.cycles + max_cycles;
        while self.cycles < deadline {
            match self.run_state {
                RunState::Stop | RunState::TestFail | RunState::Stopped => break,
                RunState::Step => {
                    if let Err(e) = self.finish_instruction() {
                        error!("{}", e);
                        self.run_state = RunState::TestFail;
                        break;
                    }
                    if self.run_state == RunState::Step {
                        self.run_state = RunState::Stopped;
                    }
                    break;
                }
                RunState::Running | RunState::Sleeping => {
                    if let Err(e) = self.run_cycle() {
                        error!("{}", e);
                        self.run_state = RunState::TestFail;
                        break;
                    }
                }
            }
        }
        self.run_state
    }

    /// Run cycles until the current instruction completes (single step).
    pub fn finish_instruction(&mut self) -> Result<(), Error> {
        loop {
            self.run_cycle()?;
            if !self.in_multi {
                return Ok(());
            }
        }
    }

    // --- Access surface for external models and the debug endpoint ---

    pub fn read_reg(&self, addr: u16) -> u8 {
        self.mem.read_dm(addr)
    }

    pub fn write_reg(&mut self, addr: u16, v: u8) {
        self.mem.write_dm(addr, v);
    }

    pub fn read_io_bit(&self, addr: u16, bit: u8) -> bool {
        self.mem.dm_bit(addr, bit)
    }

    pub fn write_io_bit(&mut self, addr: u16, bit: u8, v: bool) {
        self.mem.set_dm_bit(addr, bit, v);
    }

    pub fn freq(&self) -> u64 {
        self.freq
    }

    pub fn set_run_state(&mut self, s: RunState) {
        self.run_state = s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_state() {
        let mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        assert_eq!(mcu.pc, 0);
        assert_eq!(mcu.sp(), 0x08FF);
        assert_eq!(mcu.run_state, RunState::Running);
        assert!(!mcu.in_multi);
        assert_eq!(mcu.ic_left, 0);
    }

    #[test]
    fn test_stack_round_trip() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        let sp0 = mcu.sp();
        mcu.stack_push(0xAB);
        assert_eq!(mcu.sp(), sp0 - 1);
        assert_eq!(mcu.stack_pop(), 0xAB);
        assert_eq!(mcu.sp(), sp0);
    }

    #[test]
    fn test_pc_push_width() {
        let mut m328 = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        let sp0 = m328.sp();
        m328.push_pc(0x1234);
        assert_eq!(m328.sp(), sp0 - 2);
        assert_eq!(m328.pop_pc(), 0x1234);

        let mut m2560 = Mcu::new(DeviceProfile::atmega2560()).unwrap();
        let sp0 = m2560.sp();
        m2560.push_pc(0x2_1234);
        assert_eq!(m2560.sp(), sp0 - 3);
        assert_eq!(m2560.pop_pc(), 0x2_1234);
    }

    #[test]
    fn test_fuse_clock_select() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        mcu.set_fuse(0, 0x62).unwrap();
        assert_eq!(mcu.clk_source, ClkSource::InternalRc);
        assert_eq!(mcu.freq, 8_000_000);
        mcu.set_fuse(0, 0xFF).unwrap();
        assert_eq!(mcu.clk_source, ClkSource::LowPowerCrystal);
        assert_eq!(mcu.freq, 16_000_000);
        assert!(matches!(
            mcu.set_fuse(0, 0x01),
            Err(Error::ReservedClockSelect(1))
        ));
        assert!(matches!(mcu.set_fuse(3, 0), Err(Error::UnsupportedFuse(3))));
    }

    #[test]
    fn test_fuse_boot_reset() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        // BOOTSZ=00 (4096 bytes), BOOTRST programmed (0)
        mcu.set_fuse(1, 0xD8).unwrap();
        assert_eq!(mcu.bls.size, 4096);
        assert_eq!(mcu.intr.reset_pc, 0x7000);
        assert_eq!(mcu.pc, 0x7000);
        // BOOTRST unprogrammed: reset back at 0
        mcu.set_fuse(1, 0xD9).unwrap();
        assert_eq!(mcu.intr.reset_pc, 0);
    }

    #[test]
    fn test_sreg_lives_in_data_memory() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        mcu.set_flag(SREG_Z, true);
        assert_eq!(mcu.mem.dm[0x5F], 1 << SREG_Z);
        mcu.mem.dm[0x5F] = 0x80;
        assert!(mcu.flag(SREG_I));
        assert!(!mcu.flag(SREG_Z));
    }

    #[test]
    fn test_unknown_opcode_fails_the_run() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        mcu.mem.pm[0] = 0x08; // 0xFF08 decodes to nothing
        mcu.mem.pm[1] = 0xFF;
        let state = mcu.run_to_completion(10);
        assert_eq!(state, RunState::TestFail);
    }

    // --- End-to-end scenarios ---

    /// Write little-endian instruction words into flash at address 0.
    fn load_words(mcu: &mut Mcu, words: &[u16]) {
        for (i, w) in words.iter().enumerate() {
            mcu.mem.pm[i * 2] = *w as u8;
            mcu.mem.pm[i * 2 + 1] = (*w >> 8) as u8;
        }
    }

    #[test]
    fn test_scenario_add_program() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        load_words(
            &mut mcu,
            &[
                0xE005, // LDI R16, 0x05
                0xE013, // LDI R17, 0x03
                0x0F01, // ADD R16, R17
                0x9598, // BREAK
            ],
        );
        let state = mcu.run_to_completion(100);
        assert_eq!(state, RunState::Stopped);
        assert_eq!(mcu.mem.reg(16), 0x08);
        // C=0 Z=0 N=0 V=0 S=0 H=0
        assert_eq!(mcu.sreg() & 0b0011_1111, 0);
    }

    #[test]
    fn test_scenario_inc_rollover_brne_not_taken() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        load_words(
            &mut mcu,
            &[
                0xEF0F, // LDI R16, 0xFF (SER)
                0x9503, // INC R16
                0xF7F1, // BRNE .-4
                0x9598, // BREAK
            ],
        );
        let state = mcu.run_to_completion(100);
        assert_eq!(state, RunState::Stopped);
        assert_eq!(mcu.mem.reg(16), 0x00);
        assert!(mcu.flag(SREG_Z));
        assert_eq!(mcu.pc, 6); // halted at BREAK
    }

    #[test]
    fn test_scenario_timer0_overflow_raises_tov() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        load_words(&mut mcu, &[0xCFFF]); // RJMP .-2 (spin)
        mcu.mem.write_dm(0x45, 0b011); // TCCR0B: clk/64, Normal mode
        mcu.run_to_completion(64 * 256);
        assert_eq!(mcu.mem.read_dm(0x46), 0); // TCNT0 wrapped once
        assert_eq!(mcu.mem.read_dm(0x35) & 1, 1); // TOV0 in TIFR0
    }

    #[test]
    fn test_scenario_timer0_overflow_interrupt_dispatch() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        load_words(
            &mut mcu,
            &[
                0x9478, // SEI
                0xE001, // LDI R16, 0x01
                0x9300, 0x006E, // STS TIMSK0, R16 (TOIE0)
                0xE011, // LDI R17, 0x01
                0x9310, 0x0045, // STS TCCR0B, R17 (clk/1)
                0xCFFF, // RJMP .-2
            ],
        );
        // TIMER0_OVF vector lands at ivt + 16 * 4 = 0x40; trap it there.
        let vector_pc = mcu.device.ivt + 16 * mcu.device.vector_size;
        mcu.mem.pm[vector_pc as usize] = 0x98;
        mcu.mem.pm[vector_pc as usize + 1] = 0x95;
        let sp0 = mcu.sp();

        let state = mcu.run_to_completion(10_000);
        assert_eq!(state, RunState::Stopped);
        assert_eq!(mcu.pc, vector_pc);
        // ISR entry cleared I and pushed the 2-byte return address.
        assert!(!mcu.flag(SREG_I));
        assert_eq!(mcu.sp(), sp0 - 2);
        let ret = mcu.pop_pc();
        assert!(ret >= 0x0E && ret <= 0x10, "return pc = {:#x}", ret);
    }

    #[test]
    fn test_scenario_reti_executes_one_main_instruction() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        // Main: SEI; enable TOIE0; clk/1; spin. ISR: RETI.
        load_words(
            &mut mcu,
            &[
                0x9478, // SEI
                0xE001, // LDI R16, 0x01
                0x9300, 0x006E, // STS TIMSK0, R16
                0x9300, 0x0045, // STS TCCR0B, R16
                0xCFFF, // RJMP .-2
            ],
        );
        let vector_pc = (mcu.device.ivt + 16 * mcu.device.vector_size) as usize;
        mcu.mem.pm[vector_pc] = 0x18; // RETI
        mcu.mem.pm[vector_pc + 1] = 0x95;

        let sp0 = mcu.sp();
        mcu.run_to_completion(2_000);
        assert_eq!(mcu.run_state, RunState::Running);
        // Drain a possibly in-flight ISR, then the stack is balanced and
        // RETI has re-enabled interrupts.
        for _ in 0..300 {
            if mcu.sp() == sp0 && !mcu.in_multi {
                break;
            }
            mcu.run_cycle().unwrap();
        }
        assert_eq!(mcu.sp(), sp0);
        assert!(mcu.flag(SREG_I));
    }
}
