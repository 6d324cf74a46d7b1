//! Instruction executor.
//!
//! One [`Mcu::execute`] call corresponds to one clock cycle. Multi-cycle
//! instructions latch a remaining-cycle count on their first cycle and
//! return without side effects until it drains; the architectural effect
//! (PC, SREG, memory, stack) lands atomically on the final cycle. The
//! driver re-decodes the same word on every intermediate cycle, which is
//! safe because PC does not move until the effect applies.
//!
//! Flag computation follows the AVR datasheet formulas, including the
//! carry-chain behavior of SBC/SBCI/CPC where Z is only ever cleared so
//! multi-byte comparisons work.
//!
//! Cycle counts vary by device class (`xmega`, `reduced_core`) and, on the
//! extended cores, by whether a load hits on-chip SRAM.

use crate::opcodes::{self, Instruction};
use crate::{Mcu, RunState};
use crate::{SREG_C, SREG_I, SREG_N, SREG_T, SREG_V, SREG_Z};

use log::error;

impl Mcu {
    /// Multi-cycle bookkeeping. Returns `true` while the current cycle is
    /// consumed by the instruction's latency; the caller must return
    /// without applying any effect. `cycles` is the instruction's cycle
    /// count minus one.
    #[inline]
    fn skip_cycles(&mut self, cond: bool, cycles: u8) -> bool {
        if !self.in_multi && cond {
            // First cycle of a multi-cycle instruction
            self.in_multi = true;
            self.ic_left = cycles;
            return true;
        }
        if self.in_multi && self.ic_left > 0 {
            self.ic_left -= 1;
            if self.ic_left > 0 {
                return true;
            }
        }
        self.in_multi = false;
        false
    }

    #[inline(always)]
    fn in_sram(&self, addr: u16) -> bool {
        addr >= self.device.ram_start && addr <= self.device.ram_end
    }

    /// Execute one clock cycle of `inst`.
    pub fn execute(&mut self, inst: Instruction) {
        match inst {
            Instruction::Nop => self.pc += 2,

            // -- Arithmetic --
            Instruction::Add { d, r } => {
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                let res = rd.wrapping_add(rr);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_add(self, rd, rr, res);
            }
            Instruction::Adc { d, r } => {
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                let c = self.flag(SREG_C) as u8;
                let res = rd.wrapping_add(rr).wrapping_add(c);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_add(self, rd, rr, res);
            }
            Instruction::Sub { d, r } => {
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                let res = rd.wrapping_sub(rr);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_sub(self, rd, rr, res, true);
            }
            Instruction::Subi { d, k } => {
                let rd = self.mem.reg(d);
                let res = rd.wrapping_sub(k);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_sub(self, rd, k, res, true);
            }
            Instruction::Sbc { d, r } => {
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                let c = self.flag(SREG_C) as u8;
                // The flag formulas use the original Rr; the result already
                // incorporates the carry.
                let res = rd.wrapping_sub(rr).wrapping_sub(c);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_sub(self, rd, rr, res, false);
            }
            Instruction::Sbci { d, k } => {
                let rd = self.mem.reg(d);
                let c = self.flag(SREG_C) as u8;
                let res = rd.wrapping_sub(k).wrapping_sub(c);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_sub(self, rd, k, res, false);
            }
            Instruction::And { d, r } => {
                let res = self.mem.reg(d) & self.mem.reg(r);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_logic(self, res);
            }
            Instruction::Andi { d, k } => {
                let res = self.mem.reg(d) & k;
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_logic(self, res);
            }
            Instruction::Or { d, r } => {
                let res = self.mem.reg(d) | self.mem.reg(r);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_logic(self, res);
            }
            Instruction::Ori { d, k } => {
                let res = self.mem.reg(d) | k;
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_logic(self, res);
            }
            Instruction::Eor { d, r } => {
                let res = self.mem.reg(d) ^ self.mem.reg(r);
                self.mem.set_reg(d, res);
                self.pc += 2;
                flags_logic(self, res);
            }
            Instruction::Com { d } => {
                let res = !self.mem.reg(d);
                self.mem.set_reg(d, res);
                self.pc += 2;
                self.set_flag(SREG_C, true);
                self.set_flag(SREG_V, false);
                flags_zns(self, res);
            }
            Instruction::Neg { d } => {
                let rd = self.mem.reg(d);
                let res = 0u8.wrapping_sub(rd);
                self.mem.set_reg(d, res);
                self.pc += 2;
                self.set_flag(SREG_C, res != 0);
                self.set_flag(SREG_V, res == 0x80);
                self.set_flag(crate::SREG_H, ((res >> 3) | (rd >> 3)) & 1 != 0);
                flags_zns(self, res);
            }
            Instruction::Inc { d } => {
                let rd = self.mem.reg(d);
                let res = rd.wrapping_add(1);
                self.mem.set_reg(d, res);
                self.pc += 2;
                self.set_flag(SREG_V, rd == 0x7F);
                flags_zns(self, res);
            }
            Instruction::Dec { d } => {
                let rd = self.mem.reg(d);
                let res = rd.wrapping_sub(1);
                self.mem.set_reg(d, res);
                self.pc += 2;
                self.set_flag(SREG_V, rd == 0x80);
                flags_zns(self, res);
            }
            Instruction::Ser { d } => {
                self.mem.set_reg(d, 0xFF);
                self.pc += 2;
            }

            // -- Multiply (2 cycles each) --
            Instruction::Mul { d, r } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let res = (self.mem.reg(d) as u16) * (self.mem.reg(r) as u16);
                self.mul_result(res);
            }
            Instruction::Muls { d, r } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let res = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i8 as i16)) as u16;
                self.mul_result(res);
            }
            Instruction::Mulsu { d, r } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let res = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i16)) as u16;
                self.mul_result(res);
            }
            Instruction::Fmul { d, r } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let prod = (self.mem.reg(d) as u16) * (self.mem.reg(r) as u16);
                self.fmul_result(prod);
            }
            Instruction::Fmuls { d, r } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let prod = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i8 as i16)) as u16;
                self.fmul_result(prod);
            }
            Instruction::Fmulsu { d, r } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let prod = ((self.mem.reg(d) as i8 as i16) * (self.mem.reg(r) as i16)) as u16;
                self.fmul_result(prod);
            }

            // -- 16-bit immediate arithmetic --
            Instruction::Adiw { d, k } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let rd = self.mem.reg_pair(d);
                let res = rd.wrapping_add(k as u16);
                self.mem.set_reg_pair(d, res);
                self.pc += 2;
                let rd15 = (rd >> 15) & 1 != 0;
                let r15 = (res >> 15) & 1 != 0;
                self.set_flag(SREG_C, !r15 && rd15);
                self.set_flag(SREG_V, r15 && !rd15);
                self.set_flag(SREG_N, r15);
                self.set_flag(SREG_Z, res == 0);
                self.update_sign();
            }
            Instruction::Sbiw { d, k } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let rd = self.mem.reg_pair(d);
                let res = rd.wrapping_sub(k as u16);
                self.mem.set_reg_pair(d, res);
                self.pc += 2;
                let rd15 = (rd >> 15) & 1 != 0;
                let r15 = (res >> 15) & 1 != 0;
                self.set_flag(SREG_C, r15 && !rd15);
                self.set_flag(SREG_V, rd15 && !r15);
                self.set_flag(SREG_N, r15);
                self.set_flag(SREG_Z, res == 0);
                self.update_sign();
            }

            // -- Compare --
            Instruction::Cp { d, r } => {
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                self.pc += 2;
                flags_sub(self, rd, rr, rd.wrapping_sub(rr), true);
            }
            Instruction::Cpc { d, r } => {
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                let c = self.flag(SREG_C) as u8;
                let res = rd.wrapping_sub(rr).wrapping_sub(c);
                self.pc += 2;
                flags_sub(self, rd, rr, res, false);
            }
            Instruction::Cpi { d, k } => {
                let rd = self.mem.reg(d);
                self.pc += 2;
                flags_sub(self, rd, k, rd.wrapping_sub(k), true);
            }

            // -- Data transfer --
            Instruction::Mov { d, r } => {
                let v = self.mem.reg(r);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }
            Instruction::Movw { d, r } => {
                let v = self.mem.reg_pair(r);
                self.mem.set_reg_pair(d, v);
                self.pc += 2;
            }
            Instruction::Ldi { d, k } => {
                self.mem.set_reg(d, k);
                self.pc += 2;
            }
            Instruction::Lds { d, k } => {
                let cost = if !self.device.xmega {
                    1
                } else if self.in_sram(k) {
                    2
                } else {
                    1
                };
                if self.skip_cycles(true, cost) {
                    return;
                }
                let v = self.mem.read_dm(k);
                self.mem.set_reg(d, v);
                self.pc += 4;
            }
            Instruction::Sts { k, r } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let v = self.mem.reg(r);
                self.mem.write_dm(k, v);
                self.pc += 4;
            }
            Instruction::Lds16 { d, k } => {
                let v = self.mem.read_dm(k);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }
            Instruction::Sts16 { k, r } => {
                let v = self.mem.reg(r);
                self.mem.write_dm(k, v);
                self.pc += 2;
            }

            Instruction::LdX { d } => self.exec_ld(26, 0, d),
            Instruction::LdXInc { d } => self.exec_ld(26, 1, d),
            Instruction::LdXDec { d } => self.exec_ld(26, 2, d),
            Instruction::LdY { d } => self.exec_ld(28, 0, d),
            Instruction::LdYInc { d } => self.exec_ld(28, 1, d),
            Instruction::LdYDec { d } => self.exec_ld(28, 2, d),
            Instruction::LdZ { d } => self.exec_ld(30, 0, d),
            Instruction::LdZInc { d } => self.exec_ld(30, 1, d),
            Instruction::LdZDec { d } => self.exec_ld(30, 2, d),
            Instruction::LdYQ { d, q } => self.exec_ld_disp(28, q, d),
            Instruction::LdZQ { d, q } => self.exec_ld_disp(30, q, d),

            Instruction::StX { r } => self.exec_st(26, 0, r),
            Instruction::StXInc { r } => self.exec_st(26, 1, r),
            Instruction::StXDec { r } => self.exec_st(26, 2, r),
            Instruction::StY { r } => self.exec_st(28, 0, r),
            Instruction::StYInc { r } => self.exec_st(28, 1, r),
            Instruction::StYDec { r } => self.exec_st(28, 2, r),
            Instruction::StZ { r } => self.exec_st(30, 0, r),
            Instruction::StZInc { r } => self.exec_st(30, 1, r),
            Instruction::StZDec { r } => self.exec_st(30, 2, r),
            Instruction::StYQ { r, q } => self.exec_st_disp(28, q, r),
            Instruction::StZQ { r, q } => self.exec_st_disp(30, q, r),

            Instruction::Xch { d } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let z = self.mem.z();
                let v = self.mem.read_dm(z);
                let rd = self.mem.reg(d);
                self.mem.write_dm(z, rd);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }
            Instruction::Las { d } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let z = self.mem.z();
                let v = self.mem.read_dm(z);
                let rd = self.mem.reg(d);
                self.mem.write_dm(z, v | rd);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }
            Instruction::Lac { d } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let z = self.mem.z();
                let v = self.mem.read_dm(z);
                let rd = self.mem.reg(d);
                self.mem.write_dm(z, v & !rd);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }
            Instruction::Lat { d } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let z = self.mem.z();
                let v = self.mem.read_dm(z);
                let rd = self.mem.reg(d);
                self.mem.write_dm(z, v ^ rd);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }

            // -- Stack --
            Instruction::Push { r } => {
                if !self.device.xmega && self.skip_cycles(true, 1) {
                    return;
                }
                let v = self.mem.reg(r);
                self.stack_push(v);
                self.pc += 2;
            }
            Instruction::Pop { d } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let v = self.stack_pop();
                self.mem.set_reg(d, v);
                self.pc += 2;
            }

            // -- Shift / bit --
            Instruction::Lsr { d } => {
                let rd = self.mem.reg(d);
                let res = rd >> 1;
                self.mem.set_reg(d, res);
                self.pc += 2;
                self.set_flag(SREG_C, rd & 1 != 0);
                self.set_flag(SREG_N, false);
                self.set_flag(SREG_V, rd & 1 != 0); // N ^ C with N = 0
                self.set_flag(SREG_Z, res == 0);
                self.update_sign();
            }
            Instruction::Asr { d } => {
                let rd = self.mem.reg(d);
                let res = ((rd as i8) >> 1) as u8;
                self.mem.set_reg(d, res);
                self.pc += 2;
                let c = rd & 1 != 0;
                let n = res & 0x80 != 0;
                self.set_flag(SREG_C, c);
                self.set_flag(SREG_N, n);
                self.set_flag(SREG_V, n ^ c);
                self.set_flag(SREG_Z, res == 0);
                self.update_sign();
            }
            Instruction::Ror { d } => {
                let rd = self.mem.reg(d);
                let res = (rd >> 1) | ((self.flag(SREG_C) as u8) << 7);
                self.mem.set_reg(d, res);
                self.pc += 2;
                let c = rd & 1 != 0;
                let n = res & 0x80 != 0;
                self.set_flag(SREG_C, c);
                self.set_flag(SREG_N, n);
                self.set_flag(SREG_V, n ^ c);
                self.set_flag(SREG_Z, res == 0);
                self.update_sign();
            }
            Instruction::Swap { d } => {
                let rd = self.mem.reg(d);
                self.mem.set_reg(d, (rd >> 4) | (rd << 4));
                self.pc += 2;
            }
            Instruction::Bst { d, b } => {
                let v = self.mem.reg(d) & (1 << b) != 0;
                self.set_flag(SREG_T, v);
                self.pc += 2;
            }
            Instruction::Bld { d, b } => {
                let t = self.flag(SREG_T);
                let mut rd = self.mem.reg(d);
                if t {
                    rd |= 1 << b;
                } else {
                    rd &= !(1 << b);
                }
                self.mem.set_reg(d, rd);
                self.pc += 2;
            }
            Instruction::Sbi { a, b } => {
                if !self.device.reduced_core && !self.device.xmega && self.skip_cycles(true, 1) {
                    return;
                }
                let addr = a as u16 + self.device.sfr_off;
                self.mem.set_dm_bit(addr, b, true);
                self.pc += 2;
            }
            Instruction::Cbi { a, b } => {
                if !self.device.reduced_core && !self.device.xmega && self.skip_cycles(true, 1) {
                    return;
                }
                let addr = a as u16 + self.device.sfr_off;
                self.mem.set_dm_bit(addr, b, false);
                self.pc += 2;
            }

            // -- Control transfer --
            Instruction::Rjmp { k } => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                self.pc = rel_target(self.pc, k as i32);
            }
            Instruction::Rcall { k } => {
                let cost = if self.device.reduced_core {
                    3
                } else if self.device.xmega {
                    if self.device.pc_bits > 16 {
                        2
                    } else {
                        1
                    }
                } else if self.device.pc_bits > 16 {
                    3
                } else {
                    2
                };
                if self.skip_cycles(true, cost) {
                    return;
                }
                let ret = self.pc + 2;
                self.push_pc(ret);
                self.pc = rel_target(self.pc, k as i32);
            }
            Instruction::Ret => {
                let cost = if self.device.pc_bits > 16 { 4 } else { 3 };
                if self.skip_cycles(true, cost) {
                    return;
                }
                self.pc = self.pop_pc();
            }
            Instruction::Reti => {
                let cost = if self.device.pc_bits > 16 { 4 } else { 3 };
                if self.skip_cycles(true, cost) {
                    return;
                }
                self.pc = self.pop_pc();
                if !self.device.xmega {
                    self.set_flag(SREG_I, true);
                }
                // One more main-program instruction runs before the next
                // vector is taken.
                self.intr.exec_main = true;
            }
            Instruction::Jmp { k } => {
                if self.skip_cycles(true, 2) {
                    return;
                }
                self.pc = k << 1;
            }
            Instruction::Call { k } => {
                let cost = if self.device.xmega {
                    if self.device.pc_bits > 16 {
                        3
                    } else {
                        2
                    }
                } else if self.device.pc_bits > 16 {
                    4
                } else {
                    3
                };
                if self.skip_cycles(true, cost) {
                    return;
                }
                let ret = self.pc + 4;
                self.push_pc(ret);
                self.pc = k << 1;
            }
            Instruction::Ijmp => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                self.pc = (self.mem.z() as u32) << 1;
            }
            Instruction::Icall => {
                let cost = if self.device.xmega {
                    if self.device.pc_bits > 16 {
                        2
                    } else {
                        1
                    }
                } else if self.device.pc_bits > 16 {
                    3
                } else {
                    2
                };
                if self.skip_cycles(true, cost) {
                    return;
                }
                let ret = self.pc + 2;
                self.push_pc(ret);
                self.pc = (self.mem.z() as u32) << 1;
            }
            Instruction::Eijmp => {
                let Some(eind_off) = self.device.eind else {
                    error!("EIJMP is not available on devices without EIND");
                    self.run_state = RunState::TestFail;
                    return;
                };
                if self.skip_cycles(true, 1) {
                    return;
                }
                let eind = self.mem.dm[eind_off as usize] as u32;
                self.pc = ((eind << 16) | self.mem.z() as u32) << 1;
            }
            Instruction::Eicall => {
                let Some(eind_off) = self.device.eind.filter(|_| self.device.pc_bits >= 22)
                else {
                    error!("EICALL needs the EIND register and a 22-bit PC");
                    self.run_state = RunState::TestFail;
                    return;
                };
                if self.skip_cycles(true, if self.device.xmega { 2 } else { 3 }) {
                    return;
                }
                let ret = self.pc + 2;
                self.push_pc(ret);
                let eind = self.mem.dm[eind_off as usize] as u32;
                self.pc = ((eind << 16) | self.mem.z() as u32) << 1;
            }
            Instruction::Cpse { d, r } => {
                let eq = self.mem.reg(d) == self.mem.reg(r);
                self.exec_skip(eq);
            }
            Instruction::Sbrc { r, b } => {
                let clr = self.mem.reg(r) & (1 << b) == 0;
                self.exec_skip(clr);
            }
            Instruction::Sbrs { r, b } => {
                let set = self.mem.reg(r) & (1 << b) != 0;
                self.exec_skip(set);
            }
            Instruction::Sbic { a, b } => {
                let addr = a as u16 + self.device.sfr_off;
                let clr = !self.mem.dm_bit(addr, b);
                self.exec_io_skip(clr);
            }
            Instruction::Sbis { a, b } => {
                let addr = a as u16 + self.device.sfr_off;
                let set = self.mem.dm_bit(addr, b);
                self.exec_io_skip(set);
            }
            Instruction::Brbs { s, k } => {
                let cond = self.flag(s);
                if self.skip_cycles(cond, 1) {
                    return;
                }
                if cond {
                    self.pc = rel_target(self.pc, k as i32);
                } else {
                    self.pc += 2;
                }
            }
            Instruction::Brbc { s, k } => {
                let cond = !self.flag(s);
                if self.skip_cycles(cond, 1) {
                    return;
                }
                if cond {
                    self.pc = rel_target(self.pc, k as i32);
                } else {
                    self.pc += 2;
                }
            }

            // -- I/O --
            Instruction::In { d, a } => {
                let v = self.mem.read_dm(a as u16 + self.device.sfr_off);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }
            Instruction::Out { a, r } => {
                let v = self.mem.reg(r);
                self.mem.write_dm(a as u16 + self.device.sfr_off, v);
                self.pc += 2;
            }

            // -- Program memory --
            Instruction::Lpm0 => {
                if self.skip_cycles(true, 2) {
                    return;
                }
                let v = self.mem.read_flash_byte(self.mem.z() as u32);
                self.mem.set_reg(0, v);
                self.pc += 2;
            }
            Instruction::LpmD { d } => {
                if self.skip_cycles(true, 2) {
                    return;
                }
                let v = self.mem.read_flash_byte(self.mem.z() as u32);
                self.mem.set_reg(d, v);
                self.pc += 2;
            }
            Instruction::LpmDInc { d } => {
                if self.skip_cycles(true, 2) {
                    return;
                }
                let z = self.mem.z();
                let v = self.mem.read_flash_byte(z as u32);
                self.mem.set_reg(d, v);
                self.mem.set_z(z.wrapping_add(1));
                self.pc += 2;
            }
            Instruction::Elpm0 => self.exec_elpm(None, false),
            Instruction::ElpmD { d } => self.exec_elpm(Some(d), false),
            Instruction::ElpmDInc { d } => self.exec_elpm(Some(d), true),
            Instruction::Spm => self.exec_spm(false),
            Instruction::SpmZInc => self.exec_spm(true),

            // -- Status register --
            Instruction::Bset { s } => {
                self.set_flag(s, true);
                self.pc += 2;
            }
            Instruction::Bclr { s } => {
                self.set_flag(s, false);
                self.pc += 2;
            }

            // -- MCU control --
            Instruction::Break => {
                // The core enters stopped mode; the displaced word in the
                // match-point memory runs when execution resumes.
                self.run_state = RunState::Stopped;
                self.mem.read_from_mpm = true;
            }
            Instruction::Sleep => {
                self.run_state = RunState::Sleeping;
                self.pc += 2;
            }
            Instruction::Wdr => self.pc += 2,

            Instruction::Unknown(w) => {
                error!("unknown instruction 0x{:04X} at pc=0x{:06X}", w, self.pc);
                self.run_state = RunState::TestFail;
            }
        }
    }

    // -- Shared operand paths --

    /// LD through an index pair (mode 0: plain, 1: post-increment,
    /// 2: pre-decrement).
    fn exec_ld(&mut self, lo: u8, mode: u8, d: u8) {
        let addr = self.mem.reg_pair(lo);
        match mode {
            0 => {
                if self.device.xmega
                    && self.in_sram(addr)
                    && self.skip_cycles(true, 1)
                {
                    return;
                }
                let v = self.mem.read_dm(addr);
                self.mem.set_reg(d, v);
            }
            1 => {
                let skip = !self.device.xmega || self.in_sram(addr);
                if skip && self.skip_cycles(true, 1) {
                    return;
                }
                let v = self.mem.read_dm(addr);
                self.mem.set_reg(d, v);
                self.mem.set_reg_pair(lo, addr.wrapping_add(1));
            }
            _ => {
                let skip = !self.device.xmega || self.in_sram(addr);
                if skip && self.skip_cycles(true, 2) {
                    return;
                }
                let addr = addr.wrapping_sub(1);
                self.mem.set_reg_pair(lo, addr);
                let v = self.mem.read_dm(addr);
                self.mem.set_reg(d, v);
            }
        }
        self.pc += 2;
    }

    /// LDD through Y or Z with displacement.
    fn exec_ld_disp(&mut self, lo: u8, q: u8, d: u8) {
        let addr = self.mem.reg_pair(lo);
        let cost = if !self.device.xmega {
            1
        } else if self.in_sram(addr) {
            2
        } else {
            1
        };
        if self.skip_cycles(true, cost) {
            return;
        }
        let v = self.mem.read_dm(addr.wrapping_add(q as u16));
        self.mem.set_reg(d, v);
        self.pc += 2;
    }

    /// ST through an index pair.
    fn exec_st(&mut self, lo: u8, mode: u8, r: u8) {
        let addr = self.mem.reg_pair(lo);
        match mode {
            0 => {
                if !self.device.xmega
                    && !self.device.reduced_core
                    && self.skip_cycles(true, 1)
                {
                    return;
                }
                let v = self.mem.reg(r);
                self.mem.write_dm(addr, v);
            }
            1 => {
                if !self.device.xmega
                    && !self.device.reduced_core
                    && self.skip_cycles(true, 1)
                {
                    return;
                }
                let v = self.mem.reg(r);
                self.mem.write_dm(addr, v);
                self.mem.set_reg_pair(lo, addr.wrapping_add(1));
            }
            _ => {
                if self.skip_cycles(true, 1) {
                    return;
                }
                let addr = addr.wrapping_sub(1);
                self.mem.set_reg_pair(lo, addr);
                let v = self.mem.reg(r);
                self.mem.write_dm(addr, v);
            }
        }
        self.pc += 2;
    }

    /// STD through Y or Z with displacement.
    fn exec_st_disp(&mut self, lo: u8, q: u8, r: u8) {
        if self.skip_cycles(true, 1) {
            return;
        }
        let addr = self.mem.reg_pair(lo).wrapping_add(q as u16);
        let v = self.mem.reg(r);
        self.mem.write_dm(addr, v);
        self.pc += 2;
    }

    /// Register-skip body shared by CPSE/SBRC/SBRS: a taken skip jumps
    /// over the next instruction, which may itself be 32-bit.
    fn exec_skip(&mut self, cond: bool) {
        let next = self.mem.read_flash_word(self.pc + 2);
        let is32 = opcodes::is_32bit(next);
        if self.skip_cycles(cond, if is32 { 2 } else { 1 }) {
            return;
        }
        if cond {
            self.pc += if is32 { 6 } else { 4 };
        } else {
            self.pc += 2;
        }
    }

    /// I/O-skip body shared by SBIC/SBIS (different cycle table on xmega).
    fn exec_io_skip(&mut self, cond: bool) {
        let next = self.mem.read_flash_word(self.pc + 2);
        let is32 = opcodes::is_32bit(next);
        if cond {
            let cost = if self.device.xmega {
                if is32 {
                    3
                } else {
                    2
                }
            } else if is32 {
                2
            } else {
                1
            };
            if self.skip_cycles(true, cost) {
                return;
            }
            self.pc += if is32 { 6 } else { 4 };
        } else {
            if self.device.xmega && self.skip_cycles(true, 1) {
                return;
            }
            self.pc += 2;
        }
    }

    /// ELPM in its R0/Rd/Rd-postincrement forms. Requires RAMPZ.
    fn exec_elpm(&mut self, d: Option<u8>, post_inc: bool) {
        if self.device.rampz.is_none() {
            error!("ELPM is not available on devices without RAMPZ");
            self.run_state = RunState::TestFail;
            return;
        }
        if self.skip_cycles(true, 2) {
            return;
        }
        let z = ((self.rampz() as u32) << 16) | self.mem.z() as u32;
        let v = self.mem.read_flash_byte(z);
        self.mem.set_reg(d.unwrap_or(0), v);
        if post_inc {
            let z = z.wrapping_add(1);
            self.set_rampz((z >> 16) as u8);
            self.mem.set_z(z as u16);
        }
        self.pc += 2;
    }

    /// SPM state machine, keyed on the low three SPMCSR bits.
    fn exec_spm(&mut self, post_inc: bool) {
        let spmcsr = match self.device.spmcsr {
            Some(off) => self.mem.dm[off as usize],
            None => {
                error!("SPMCSR register is not available on this device");
                self.run_state = RunState::TestFail;
                return;
            }
        };
        let page = self.device.spm_page_size;
        let z = ((self.rampz() as u32) << 16) | self.mem.z() as u32;

        match spmcsr & 0x7 {
            0x1 => {
                // Fill one page-buffer word from R1:R0 at the Z offset.
                let off = (z as usize) & (page - 1) & !1;
                self.mem.pmp[off] = self.mem.dm[0];
                self.mem.pmp[off + 1] = self.mem.dm[1];
            }
            0x3 => {
                // Erase the page containing Z.
                let base = (z as usize & !(page - 1)).min(self.mem.pm.len());
                let end = (base + page).min(self.mem.pm.len());
                self.mem.pm[base..end].fill(0xFF);
            }
            0x5 => {
                // Copy the page buffer into the page containing Z.
                let base = (z as usize & !(page - 1)).min(self.mem.pm.len());
                let end = (base + page).min(self.mem.pm.len());
                self.mem.pm[base..end].copy_from_slice(&self.mem.pmp[..end - base]);
            }
            _ => {}
        }
        self.pc += 2;

        if post_inc {
            let z = z.wrapping_add(2);
            self.set_rampz((z >> 16) as u8);
            self.mem.set_z(z as u16);
        }
    }

    /// R1:R0 and C/Z for the MUL family.
    fn mul_result(&mut self, res: u16) {
        self.mem.set_reg(0, res as u8);
        self.mem.set_reg(1, (res >> 8) as u8);
        self.pc += 2;
        self.set_flag(SREG_C, res & 0x8000 != 0);
        self.set_flag(SREG_Z, res == 0);
    }

    /// R1:R0 and C/Z for the FMUL family: the product is shifted left one
    /// bit; C is bit 15 of the unshifted product.
    fn fmul_result(&mut self, prod: u16) {
        let res = prod << 1;
        self.mem.set_reg(0, res as u8);
        self.mem.set_reg(1, (res >> 8) as u8);
        self.pc += 2;
        self.set_flag(SREG_C, prod & 0x8000 != 0);
        self.set_flag(SREG_Z, res == 0);
    }

    #[inline]
    fn update_sign(&mut self) {
        let s = self.flag(SREG_N) ^ self.flag(SREG_V);
        self.set_flag(crate::SREG_S, s);
    }
}

/// Branch/relative-jump target: offset is in words, PC in bytes.
#[inline(always)]
fn rel_target(pc: u32, k: i32) -> u32 {
    (pc as i64 + ((k as i64) + 1) * 2) as u32
}

/// Z/N/S from a result byte (V must be set beforehand).
fn flags_zns(mcu: &mut Mcu, r: u8) {
    mcu.set_flag(SREG_Z, r == 0);
    mcu.set_flag(SREG_N, r & 0x80 != 0);
    let s = mcu.flag(SREG_N) ^ mcu.flag(SREG_V);
    mcu.set_flag(crate::SREG_S, s);
}

/// SREG update for the ADD family (Rd + Rr [+ C] = R).
fn flags_add(mcu: &mut Mcu, rd: u8, rr: u8, r: u8) {
    let carry = (rd & rr) | (rr & !r) | (!r & rd);
    mcu.set_flag(SREG_C, carry & 0x80 != 0);
    mcu.set_flag(crate::SREG_H, carry & 0x08 != 0);
    mcu.set_flag(SREG_V, ((rd & rr & !r) | (!rd & !rr & r)) & 0x80 != 0);
    flags_zns(mcu, r);
}

/// SREG update for the SUB family (Rd - Rr [- C] = R).
///
/// With `set_z` false (SBC/SBCI/CPC) the Z flag is only ever cleared so a
/// chain of multi-byte compares keeps a zero result sticky.
fn flags_sub(mcu: &mut Mcu, rd: u8, rr: u8, r: u8, set_z: bool) {
    let borrow = (!rd & rr) | (rr & r) | (r & !rd);
    mcu.set_flag(SREG_C, borrow & 0x80 != 0);
    mcu.set_flag(crate::SREG_H, borrow & 0x08 != 0);
    mcu.set_flag(SREG_V, ((rd & !rr & !r) | (!rd & rr & r)) & 0x80 != 0);
    mcu.set_flag(SREG_N, r & 0x80 != 0);
    if set_z {
        mcu.set_flag(SREG_Z, r == 0);
    } else if r != 0 {
        mcu.set_flag(SREG_Z, false);
    }
    let s = mcu.flag(SREG_N) ^ mcu.flag(SREG_V);
    mcu.set_flag(crate::SREG_S, s);
}

/// SREG update for AND/OR/EOR: V cleared, S = N.
fn flags_logic(mcu: &mut Mcu, r: u8) {
    mcu.set_flag(SREG_V, false);
    flags_zns(mcu, r);
}
