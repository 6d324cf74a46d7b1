//! Interrupt subsystem: pending-vector state and the acceptance arbiter.
//!
//! Peripherals raise their interrupt flags as plain bits in the I/O space
//! (TIFR and friends). Between instructions — never inside a multi-cycle
//! one — the arbiter samples the global-interrupt bit, scans every vector
//! whose enable and raised bits are both set into an internal pending
//! latch, and dispatches the lowest-numbered pending vector: clear the
//! raised bit, clear I, push the return PC, jump into the vector table.

use crate::device::IoBit;
use crate::{Mcu, RunState, SREG_I};

use log::debug;

/// Maximum number of interrupt vectors per device.
pub const IRQ_NUM: usize = 64;

/// One interrupt source: where its enable and raised bits live in the I/O
/// space, and which vector slot it dispatches through.
#[derive(Debug, Clone)]
pub struct VectorSpec {
    pub enable: IoBit,
    pub raised: IoBit,
    pub vector: u8,
}

/// Mutable interrupt state of one MCU instance.
pub struct IntState {
    /// Reset address, in flash bytes
    pub reset_pc: u32,
    /// Vector table base, in flash bytes
    pub ivt: u32,
    /// Internal pending latch per vector slot
    pub irq: [bool; IRQ_NUM],
    /// One main-program instruction runs before the next vector is taken
    /// (set by RETI)
    pub exec_main: bool,
    /// Entering any ISR transitions the run state to Stopped
    pub trap_at_isr: bool,
}

impl IntState {
    pub fn new(ivt: u32) -> Self {
        IntState {
            reset_pc: 0,
            ivt,
            irq: [false; IRQ_NUM],
            exec_main: false,
            trap_at_isr: false,
        }
    }
}

impl Mcu {
    /// Latch pending interrupts: every vector whose enable and raised I/O
    /// bits are both set marks its internal pending flag.
    pub fn provide_irqs(&mut self) {
        let Mcu {
            device, mem, intr, ..
        } = self;
        for v in &device.vectors {
            if mem.dm_bit(v.enable.reg, v.enable.bit) && mem.dm_bit(v.raised.reg, v.raised.bit) {
                intr.irq[v.vector as usize] = true;
            }
        }
    }

    /// Arbiter entry point, called at instruction boundaries.
    ///
    /// Honors the global-interrupt bit and the one-shot `exec_main`
    /// inhibitor, then dispatches the lowest pending vector if any.
    pub fn service_interrupts(&mut self) {
        if !self.flag(SREG_I) {
            return;
        }
        if self.intr.exec_main {
            // Exactly one main-program instruction after RETI.
            self.intr.exec_main = false;
            return;
        }
        self.provide_irqs();

        let Some(vector) = self.intr.irq.iter().position(|&p| p) else {
            return;
        };
        self.intr.irq[vector] = false;

        // Clear the raised bit at its I/O location.
        if let Some(spec) = self
            .device
            .vectors
            .iter()
            .find(|v| v.vector as usize == vector)
        {
            let raised = spec.raised;
            self.mem.set_dm_bit(raised.reg, raised.bit, false);
        }

        // ISR entry: interrupts disabled, return address pushed, vectored
        // jump. An accepted interrupt also wakes a sleeping core.
        self.set_flag(SREG_I, false);
        let pc = self.pc;
        self.push_pc(pc);
        self.pc = self.intr.ivt + vector as u32 * self.device.vector_size;
        debug!(
            "irq: vector {} dispatched, pc=0x{:06X} sp=0x{:04X}",
            vector,
            self.pc,
            self.sp()
        );
        if self.run_state == RunState::Sleeping {
            self.run_state = RunState::Running;
        }
        if self.intr.trap_at_isr {
            self.run_state = RunState::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;

    fn mcu() -> Mcu {
        Mcu::new(DeviceProfile::atmega328p()).unwrap()
    }

    /// Timer0 overflow source on the m328p profile.
    fn tov0(m: &Mcu) -> VectorSpec {
        m.device.timers[0].ovf.clone()
    }

    #[test]
    fn test_masked_when_i_clear() {
        let mut m = mcu();
        let v = tov0(&m);
        m.mem.set_dm_bit(v.enable.reg, v.enable.bit, true);
        m.mem.set_dm_bit(v.raised.reg, v.raised.bit, true);
        m.pc = 0x30;
        m.service_interrupts();
        assert_eq!(m.pc, 0x30);
    }

    #[test]
    fn test_dispatch_pushes_and_jumps() {
        let mut m = mcu();
        let v = tov0(&m);
        m.set_flag(SREG_I, true);
        m.mem.set_dm_bit(v.enable.reg, v.enable.bit, true);
        m.mem.set_dm_bit(v.raised.reg, v.raised.bit, true);
        m.pc = 0x0136;
        let sp0 = m.sp();

        m.service_interrupts();

        let expected = m.device.ivt + v.vector as u32 * m.device.vector_size;
        assert_eq!(m.pc, expected);
        assert_eq!(m.sp(), sp0 - 2);
        assert!(!m.flag(SREG_I));
        // Raised flag cleared at its I/O location.
        assert!(!m.mem.dm_bit(v.raised.reg, v.raised.bit));
        // Return address on the stack.
        assert_eq!(m.pop_pc(), 0x0136);
    }

    #[test]
    fn test_lowest_vector_wins() {
        let mut m = mcu();
        m.set_flag(SREG_I, true);
        // Raise timer0 overflow (vector 16) and timer1 overflow (vector 13).
        let t0 = m.device.timers[0].ovf.clone();
        let t1 = m.device.timers[1].ovf.clone();
        for v in [&t0, &t1] {
            m.mem.set_dm_bit(v.enable.reg, v.enable.bit, true);
            m.mem.set_dm_bit(v.raised.reg, v.raised.bit, true);
        }
        m.service_interrupts();
        assert_eq!(m.pc, m.device.ivt + t1.vector as u32 * m.device.vector_size);
        // The loser stays latched for the next boundary.
        assert!(m.intr.irq[t0.vector as usize]);
    }

    #[test]
    fn test_exec_main_skips_exactly_one_scan() {
        let mut m = mcu();
        let v = tov0(&m);
        m.set_flag(SREG_I, true);
        m.mem.set_dm_bit(v.enable.reg, v.enable.bit, true);
        m.mem.set_dm_bit(v.raised.reg, v.raised.bit, true);
        m.intr.exec_main = true;
        m.pc = 0x10;

        m.service_interrupts();
        assert_eq!(m.pc, 0x10); // inhibited once
        assert!(!m.intr.exec_main);

        m.service_interrupts();
        assert_ne!(m.pc, 0x10); // taken now
    }

    #[test]
    fn test_trap_at_isr_stops() {
        let mut m = mcu();
        let v = tov0(&m);
        m.set_flag(SREG_I, true);
        m.intr.trap_at_isr = true;
        m.mem.set_dm_bit(v.enable.reg, v.enable.bit, true);
        m.mem.set_dm_bit(v.raised.reg, v.raised.bit, true);
        m.service_interrupts();
        assert_eq!(m.run_state, RunState::Stopped);
    }

    #[test]
    fn test_interrupt_wakes_sleeping_core() {
        let mut m = mcu();
        let v = tov0(&m);
        m.run_state = RunState::Sleeping;
        m.set_flag(SREG_I, true);
        m.mem.set_dm_bit(v.enable.reg, v.enable.bit, true);
        m.mem.set_dm_bit(v.raised.reg, v.raised.bit, true);
        m.service_interrupts();
        assert_eq!(m.run_state, RunState::Running);
    }
}
