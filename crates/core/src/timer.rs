//! Timer/counter subsystem.
//!
//! Each [`Timer`] is driven once per CPU cycle. A tick advances the
//! prescaler accumulator, updates the counter according to the selected
//! waveform-generation mode, applies the compare-output action to the OC
//! pin on a match (gated by the pin's DDR bit), refreshes the
//! double-buffered OCR values at the mode's update point, and raises the
//! overflow/compare/capture flags at their I/O locations. The interrupt
//! arbiter picks those flags up at the next instruction boundary.
//!
//! All mutable timer state (prescaler accumulator, count direction,
//! buffered OCR values, last pin samples, the missed-compare latch) lives
//! in the per-timer record; two simulator instances never interfere.

use crate::device::IoBit;
use crate::interrupt::VectorSpec;
use crate::memory::Memory;

use log::warn;

/// Clock routing for one CSn[2:0] encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSel {
    /// 000: no clock, timer idle
    Stopped,
    /// Internal clock through a prescaler divisor
    Div(u32),
    /// External T-pin, falling edge
    ExtFall,
    /// External T-pin, rising edge
    ExtRise,
}

/// Result of one timer tick. Internal to the core; never surfaces at the
/// process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTick {
    Ok,
    Stopped,
    ExtRise,
    ExtFall,
}

/// Count direction for the phase-correct modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountDir {
    Up,
    Down,
}

/// Waveform-generation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WgmKind {
    Normal,
    Ctc,
    FastPwm,
    PhasePwm,
    PhaseFreqPwm,
    Reserved,
}

/// Where the counting TOP comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopSource {
    Fixed(u16),
    Ocra,
    Icr,
}

/// When the buffered OCR values are refreshed from their registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrUpdate {
    Immediate,
    Top,
    Bottom,
}

/// Compare-output pin action, resolved from (WGM, COM).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComAction {
    Disconnected,
    Toggle,
    Clear,
    Set,
    /// Fast PWM: clear on match, set at BOTTOM
    ClearOnMatchSetAtBottom,
    /// Fast PWM: set on match, clear at BOTTOM
    SetOnMatchClearAtBottom,
    /// Phase-correct: clear on up-match, set on down-match
    ClearUpSetDown,
    /// Phase-correct: set on up-match, clear on down-match
    SetUpClearDown,
}

/// One waveform-mode descriptor: family, TOP source, OCR update point and
/// the COM-bit action map. Built once per timer at construction.
#[derive(Debug, Clone, Copy)]
pub struct WgmMode {
    pub kind: WgmKind,
    pub top: TopSource,
    pub upd_ocr: OcrUpdate,
    pub com_map: [ComAction; 4],
}

const COM_NON_PWM: [ComAction; 4] = [
    ComAction::Disconnected,
    ComAction::Toggle,
    ComAction::Clear,
    ComAction::Set,
];
const COM_FAST_PWM: [ComAction; 4] = [
    ComAction::Disconnected,
    ComAction::Toggle,
    ComAction::ClearOnMatchSetAtBottom,
    ComAction::SetOnMatchClearAtBottom,
];
const COM_PHASE_PWM: [ComAction; 4] = [
    ComAction::Disconnected,
    ComAction::Toggle,
    ComAction::ClearUpSetDown,
    ComAction::SetUpClearDown,
];

const RESERVED: WgmMode = WgmMode {
    kind: WgmKind::Reserved,
    top: TopSource::Fixed(0),
    upd_ocr: OcrUpdate::Immediate,
    com_map: COM_NON_PWM,
};

const fn wgm(kind: WgmKind, top: TopSource, upd_ocr: OcrUpdate, com_map: [ComAction; 4]) -> WgmMode {
    WgmMode { kind, top, upd_ocr, com_map }
}

/// WGM table of the 8-bit timers (WGM02:00).
fn wgm_table_8bit() -> Vec<WgmMode> {
    use OcrUpdate::*;
    use TopSource::*;
    use WgmKind::*;
    vec![
        wgm(Normal, Fixed(0xFF), Immediate, COM_NON_PWM),
        wgm(PhasePwm, Fixed(0xFF), Top, COM_PHASE_PWM),
        wgm(Ctc, Ocra, Immediate, COM_NON_PWM),
        wgm(FastPwm, Fixed(0xFF), Bottom, COM_FAST_PWM),
        RESERVED,
        wgm(PhasePwm, Ocra, Top, COM_PHASE_PWM),
        RESERVED,
        wgm(FastPwm, Ocra, Bottom, COM_FAST_PWM),
    ]
}

/// WGM table of the 16-bit timers (WGM13:10).
fn wgm_table_16bit() -> Vec<WgmMode> {
    use OcrUpdate::*;
    use TopSource::*;
    use WgmKind::*;
    vec![
        wgm(Normal, Fixed(0xFFFF), Immediate, COM_NON_PWM),
        wgm(PhasePwm, Fixed(0x00FF), Top, COM_PHASE_PWM),
        wgm(PhasePwm, Fixed(0x01FF), Top, COM_PHASE_PWM),
        wgm(PhasePwm, Fixed(0x03FF), Top, COM_PHASE_PWM),
        wgm(Ctc, Ocra, Immediate, COM_NON_PWM),
        wgm(FastPwm, Fixed(0x00FF), Bottom, COM_FAST_PWM),
        wgm(FastPwm, Fixed(0x01FF), Bottom, COM_FAST_PWM),
        wgm(FastPwm, Fixed(0x03FF), Bottom, COM_FAST_PWM),
        wgm(PhaseFreqPwm, Icr, Bottom, COM_PHASE_PWM),
        wgm(PhaseFreqPwm, Ocra, Bottom, COM_PHASE_PWM),
        wgm(PhasePwm, Icr, Top, COM_PHASE_PWM),
        wgm(PhasePwm, Ocra, Top, COM_PHASE_PWM),
        wgm(Ctc, Icr, Immediate, COM_NON_PWM),
        RESERVED,
        wgm(FastPwm, Icr, Bottom, COM_FAST_PWM),
        wgm(FastPwm, Ocra, Bottom, COM_FAST_PWM),
    ]
}

/// Static register layout of one timer instance (part of the device
/// profile).
#[derive(Debug, Clone)]
pub struct TimerSpec {
    pub name: &'static str,
    /// Counter resolution in bits: 8 or 16
    pub size: u8,
    pub tcnt_lo: u16,
    pub tcnt_hi: Option<u16>,
    /// Register holding CSn[2:0] in its low three bits
    pub cs_reg: u16,
    /// WGM bit locations, LSB first
    pub wgm_bits: Vec<IoBit>,
    pub clock_table: [ClockSel; 8],
    /// External clock pin (T), absent on async timers
    pub ec_pin: Option<IoBit>,
    /// Input capture register (lo, hi)
    pub icr: Option<(u16, u16)>,
    /// Input capture pin
    pub icp: Option<IoBit>,
    /// Input capture edge select bit (set = rising)
    pub ices: Option<IoBit>,
    pub ovf: VectorSpec,
    pub capt: Option<VectorSpec>,
    pub comps: Vec<CompSpec>,
}

/// One output-compare channel of a timer.
#[derive(Debug, Clone)]
pub struct CompSpec {
    pub ocr_lo: u16,
    pub ocr_hi: Option<u16>,
    /// Waveform output pin (PORT bit)
    pub pin: IoBit,
    /// Data direction bit gating the pin
    pub ddr: IoBit,
    /// Register holding the COM bits for this channel
    pub com_reg: u16,
    /// Bit position of COMnx0
    pub com_lowbit: u8,
    pub vec: VectorSpec,
}

/// Runtime state of one timer/counter.
pub struct Timer {
    spec: TimerSpec,
    wgm_table: Vec<WgmMode>,
    /// Prescaler accumulator (system-clock ticks since last count)
    scnt: u32,
    /// Last observed clock-select value
    cs_old: Option<u8>,
    dir: CountDir,
    /// Active (buffered) OCR value per channel
    ocr_buf: Vec<u16>,
    /// Last sampled external-clock pin level
    ec_vold: bool,
    /// Last sampled input-capture pin level
    icp_old: bool,
    /// Compare match missed because of a prescaler change
    missed_cm: bool,
    wgm_warned: bool,
}

impl Timer {
    pub fn new(spec: &TimerSpec) -> Timer {
        let wgm_table = if spec.size == 16 {
            wgm_table_16bit()
        } else {
            wgm_table_8bit()
        };
        Timer {
            wgm_table,
            scnt: 0,
            cs_old: None,
            dir: CountDir::Up,
            ocr_buf: vec![0; spec.comps.len()],
            ec_vold: false,
            icp_old: false,
            missed_cm: false,
            wgm_warned: false,
            spec: spec.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    fn max(&self) -> u16 {
        if self.spec.size == 16 {
            0xFFFF
        } else {
            0x00FF
        }
    }

    fn read_tcnt(&self, mem: &Memory) -> u16 {
        let lo = mem.read_dm(self.spec.tcnt_lo) as u16;
        match self.spec.tcnt_hi {
            Some(hi) => lo | ((mem.read_dm(hi) as u16) << 8),
            None => lo,
        }
    }

    fn write_tcnt(&self, mem: &mut Memory, v: u16) {
        mem.write_dm(self.spec.tcnt_lo, v as u8);
        if let Some(hi) = self.spec.tcnt_hi {
            mem.write_dm(hi, (v >> 8) as u8);
        }
    }

    fn read_ocr(&self, mem: &Memory, ch: usize) -> u16 {
        let c = &self.spec.comps[ch];
        let lo = mem.read_dm(c.ocr_lo) as u16;
        match c.ocr_hi {
            Some(hi) => lo | ((mem.read_dm(hi) as u16) << 8),
            None => lo,
        }
    }

    fn read_icr(&self, mem: &Memory) -> u16 {
        match self.spec.icr {
            Some((lo, hi)) => mem.read_dm(lo) as u16 | ((mem.read_dm(hi) as u16) << 8),
            None => 0,
        }
    }

    fn wgm_index(&self, mem: &Memory) -> usize {
        let mut idx = 0usize;
        for (i, bit) in self.spec.wgm_bits.iter().enumerate() {
            if mem.dm_bit(bit.reg, bit.bit) {
                idx |= 1 << i;
            }
        }
        idx
    }

    /// Refresh the buffered OCR values from their registers.
    fn update_ocr_buffers(&mut self, mem: &Memory) {
        for ch in 0..self.ocr_buf.len() {
            self.ocr_buf[ch] = self.read_ocr(mem, ch);
        }
    }

    fn top(&self, mem: &Memory, mode: &WgmMode) -> u16 {
        match mode.top {
            TopSource::Fixed(v) => v,
            TopSource::Ocra => self.ocr_buf[0],
            TopSource::Icr => self.read_icr(mem),
        }
    }

    /// Raise an interrupt flag at its I/O location.
    fn raise(&self, mem: &mut Memory, vec: &VectorSpec) {
        mem.set_dm_bit(vec.raised.reg, vec.raised.bit, true);
    }

    /// Drive a compare-output pin, honoring the DDR gate.
    fn drive_pin(&self, mem: &mut Memory, ch: usize, level: Option<bool>) {
        let c = &self.spec.comps[ch];
        if !mem.dm_bit(c.ddr.reg, c.ddr.bit) {
            return;
        }
        match level {
            Some(v) => mem.set_dm_bit(c.pin.reg, c.pin.bit, v),
            None => {
                let cur = mem.dm_bit(c.pin.reg, c.pin.bit);
                mem.set_dm_bit(c.pin.reg, c.pin.bit, !cur);
            }
        }
    }

    fn com_action(&self, mem: &Memory, mode: &WgmMode, ch: usize) -> ComAction {
        let c = &self.spec.comps[ch];
        let com = (mem.read_dm(c.com_reg) >> c.com_lowbit) & 3;
        mode.com_map[com as usize]
    }

    /// Compare match on channel `ch`: raise the flag and act on the pin.
    fn fire_compare(&self, mem: &mut Memory, mode: &WgmMode, ch: usize) {
        self.raise(mem, &self.spec.comps[ch].vec);
        match self.com_action(mem, mode, ch) {
            ComAction::Disconnected => {}
            ComAction::Toggle => self.drive_pin(mem, ch, None),
            ComAction::Clear | ComAction::ClearOnMatchSetAtBottom => {
                self.drive_pin(mem, ch, Some(false))
            }
            ComAction::Set | ComAction::SetOnMatchClearAtBottom => {
                self.drive_pin(mem, ch, Some(true))
            }
            ComAction::ClearUpSetDown => {
                let v = self.dir == CountDir::Down;
                self.drive_pin(mem, ch, Some(v));
            }
            ComAction::SetUpClearDown => {
                let v = self.dir == CountDir::Up;
                self.drive_pin(mem, ch, Some(v));
            }
        }
    }

    /// BOTTOM event of the fast-PWM dual actions.
    fn fire_bottom_actions(&self, mem: &mut Memory, mode: &WgmMode) {
        for ch in 0..self.spec.comps.len() {
            match self.com_action(mem, mode, ch) {
                ComAction::ClearOnMatchSetAtBottom => self.drive_pin(mem, ch, Some(true)),
                ComAction::SetOnMatchClearAtBottom => self.drive_pin(mem, ch, Some(false)),
                _ => {}
            }
        }
    }

    fn compare_check(&self, mem: &mut Memory, mode: &WgmMode, tcnt: u16) {
        for ch in 0..self.spec.comps.len() {
            if tcnt == self.ocr_buf[ch] {
                self.fire_compare(mem, mode, ch);
            }
        }
    }

    /// Sample the input-capture pin; on the selected edge, copy TCNT into
    /// ICR and raise the capture flag.
    fn input_capture(&mut self, mem: &mut Memory) {
        let (Some(icp), Some(ices), Some((icr_lo, icr_hi)), Some(capt)) = (
            self.spec.icp,
            self.spec.ices,
            self.spec.icr,
            self.spec.capt.clone(),
        ) else {
            return;
        };
        let pin = mem.dm_bit(icp.reg, icp.bit);
        let rising = mem.dm_bit(ices.reg, ices.bit);
        let edge = if rising {
            !self.icp_old && pin
        } else {
            self.icp_old && !pin
        };
        self.icp_old = pin;
        if edge {
            let tcnt = self.read_tcnt(mem);
            mem.write_dm(icr_lo, tcnt as u8);
            mem.write_dm(icr_hi, (tcnt >> 8) as u8);
            self.raise(mem, &capt);
        }
    }

    /// Advance this timer by one CPU cycle.
    pub fn tick(&mut self, mem: &mut Memory) -> TimerTick {
        self.input_capture(mem);

        // Clock-select change resets the prescaler accumulator; a counter
        // already past OCRnA latches a missed compare, serviced on the
        // next tick.
        let cs = mem.read_dm(self.spec.cs_reg) & 0x7;
        if self.cs_old != Some(cs) {
            if self.cs_old.is_some() {
                self.scnt = 0;
                if !self.spec.comps.is_empty() && self.read_tcnt(mem) > self.read_ocr(mem, 0) {
                    self.missed_cm = true;
                }
            }
            self.cs_old = Some(cs);
        }

        let mut ret = TimerTick::Ok;
        let counted = match self.spec.clock_table[cs as usize] {
            ClockSel::Stopped => return TimerTick::Stopped,
            ClockSel::Div(d) => {
                self.scnt += 1;
                if self.scnt < d {
                    false
                } else {
                    self.scnt = 0;
                    true
                }
            }
            ClockSel::ExtRise => {
                ret = TimerTick::ExtRise;
                match self.spec.ec_pin {
                    Some(pin) => {
                        let v = mem.dm_bit(pin.reg, pin.bit);
                        let edge = !self.ec_vold && v;
                        self.ec_vold = v;
                        edge
                    }
                    None => false,
                }
            }
            ClockSel::ExtFall => {
                ret = TimerTick::ExtFall;
                match self.spec.ec_pin {
                    Some(pin) => {
                        let v = mem.dm_bit(pin.reg, pin.bit);
                        let edge = self.ec_vold && !v;
                        self.ec_vold = v;
                        edge
                    }
                    None => false,
                }
            }
        };

        let mode = self.wgm_table[self.wgm_index(mem)];
        if mode.kind == WgmKind::Reserved {
            if !self.wgm_warned {
                warn!(
                    "{}: unsupported WGM encoding {}, timer idle",
                    self.spec.name,
                    self.wgm_index(mem)
                );
                self.wgm_warned = true;
            }
            return TimerTick::Stopped;
        }

        if mode.upd_ocr == OcrUpdate::Immediate {
            self.update_ocr_buffers(mem);
        }

        if self.missed_cm && !self.spec.comps.is_empty() {
            self.missed_cm = false;
            self.fire_compare(mem, &mode, 0);
        }

        if !counted {
            return ret;
        }

        let max = self.max();
        let top = self.top(mem, &mode).min(max);
        let mut tcnt = self.read_tcnt(mem);

        match mode.kind {
            WgmKind::Normal => {
                if tcnt >= max {
                    tcnt = 0;
                    self.raise(mem, &self.spec.ovf);
                } else {
                    tcnt += 1;
                }
                self.compare_check(mem, &mode, tcnt);
            }
            WgmKind::Ctc => {
                if top == 0 {
                    self.write_tcnt(mem, 0);
                    return ret;
                }
                if tcnt >= top {
                    tcnt = 0;
                    // TOV still fires at MAX: the clear point can coincide
                    // with the counter's full range (OCRnA/ICRn at max).
                    if top >= max {
                        self.raise(mem, &self.spec.ovf);
                    }
                } else {
                    tcnt += 1;
                }
                self.compare_check(mem, &mode, tcnt);
            }
            WgmKind::FastPwm => {
                if top == 0 {
                    self.write_tcnt(mem, 0);
                    return ret;
                }
                if tcnt >= top {
                    // TOP -> BOTTOM: overflow, buffered OCR update, and the
                    // dual pin actions at BOTTOM.
                    tcnt = 0;
                    self.raise(mem, &self.spec.ovf);
                    self.update_ocr_buffers(mem);
                    self.fire_bottom_actions(mem, &mode);
                } else {
                    tcnt += 1;
                }
                self.compare_check(mem, &mode, tcnt);
            }
            WgmKind::PhasePwm | WgmKind::PhaseFreqPwm => {
                if top == 0 {
                    self.write_tcnt(mem, 0);
                    return ret;
                }
                match self.dir {
                    CountDir::Up => {
                        tcnt += 1;
                        if tcnt >= top {
                            tcnt = top;
                            self.dir = CountDir::Down;
                            if mode.upd_ocr == OcrUpdate::Top {
                                self.update_ocr_buffers(mem);
                            }
                        }
                    }
                    CountDir::Down => {
                        tcnt = tcnt.saturating_sub(1);
                        if tcnt == 0 {
                            self.dir = CountDir::Up;
                            self.raise(mem, &self.spec.ovf);
                            if mode.upd_ocr == OcrUpdate::Bottom {
                                self.update_ocr_buffers(mem);
                            }
                        }
                    }
                }
                self.compare_check(mem, &mode, tcnt);
            }
            WgmKind::Reserved => unreachable!(),
        }

        self.write_tcnt(mem, tcnt);
        ret
    }
}
