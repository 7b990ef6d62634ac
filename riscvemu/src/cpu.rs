//! CPU state: the register file, program counter, CSR file, and the two
//! control flags ([`Cpu::halted`] and [`Cpu::wfi`]) the step loop and
//! interpreter consult every cycle.

use crate::csr::CsrFile;
use crate::memory::INITIAL_STACK_POINTER;
use crate::registers::{name_to_index, Registers};

/// `sp` (x2) per the ABI register-name table in [`crate::registers`].
const SP: u8 = 2;

#[derive(Debug, Clone)]
pub struct Cpu {
    pub registers: Registers,
    pub pc: u32,
    pub csr: CsrFile,
    pub halted: bool,
    pub wfi: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        let mut registers = Registers::new();
        registers
            .write(SP, INITIAL_STACK_POINTER)
            .expect("sp is a valid register index");
        Self {
            registers,
            pc: 0,
            csr: CsrFile::default(),
            halted: false,
            wfi: false,
        }
    }

    /// Zero the register file (`sp` returns to its initial value), clear
    /// CSRs, clear the control flags and set `pc` to 0.
    pub fn reset(&mut self) {
        self.registers.reset();
        self.registers
            .write(SP, INITIAL_STACK_POINTER)
            .expect("sp is a valid register index");
        self.csr.reset();
        self.pc = 0;
        self.halted = false;
        self.wfi = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cpu_has_the_documented_initial_stack_pointer() {
        let cpu = Cpu::new();
        assert_eq!(
            cpu.registers.read(name_to_index("sp").unwrap()).unwrap(),
            INITIAL_STACK_POINTER
        );
    }

    #[test]
    fn reset_restores_sp_and_clears_flags() {
        let mut cpu = Cpu::new();
        cpu.registers.write(5, 99).unwrap();
        cpu.halted = true;
        cpu.wfi = true;
        cpu.pc = 0x1000;
        cpu.reset();
        assert_eq!(cpu.pc, 0);
        assert!(!cpu.halted);
        assert!(!cpu.wfi);
        assert_eq!(
            cpu.registers.read(name_to_index("sp").unwrap()).unwrap(),
            INITIAL_STACK_POINTER
        );
        assert_eq!(cpu.registers.read(5).unwrap(), 0);
    }
}
