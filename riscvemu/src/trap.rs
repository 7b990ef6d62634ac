//! Interrupt aggregation and the trap-entry half of the trap pipeline.
//! Timer advance lives on the devices themselves ([`crate::devices`]);
//! `MRET` lives in [`crate::interp`] alongside the rest of instruction
//! dispatch. This module is just the part in between: given the live
//! `mip`, decide whether to take a trap and, if so, do the CSR and PC
//! bookkeeping.

use crate::cpu::Cpu;
use crate::csr::{MCAUSE_CYCLE_TIMER, MCAUSE_RTC_TIMER, MIE_CYCLE_TIMER_BIT};

/// Number of consecutive idle (no-fetch, trap-never-taken) `WFI` ticks
/// tolerated before `Vm::step` reports a deadlock. Chosen to be far
/// beyond any real program's legitimate wait, while still bounding a
/// batch run that would otherwise spin forever.
pub const WFI_DEADLOCK_BUDGET: u32 = 1_000_000;

/// Sample `mip & mie` against the global enable and, if an interrupt is
/// both pending and enabled, take the trap: save `pc` to `mepc`, set
/// `mcause`, clear `mstatus.MIE`, clear `wfi`, and jump to `mtvec`.
/// Returns whether a trap was taken.
pub fn sample_and_enter(cpu: &mut Cpu, mip: u32) -> bool {
    let pending_and_enabled = mip & cpu.csr.mie();
    if pending_and_enabled == 0 || !cpu.csr.mie_enabled() {
        return false;
    }
    // Priority: cycle timer (bit 7) before real-time timer (bit 11), the
    // lower bit number wins.
    let cause = if pending_and_enabled & (1 << MIE_CYCLE_TIMER_BIT) != 0 {
        MCAUSE_CYCLE_TIMER
    } else {
        MCAUSE_RTC_TIMER
    };
    cpu.csr.set_mepc(cpu.pc);
    cpu.csr.set_mcause(cause);
    cpu.csr.set_mie_enabled(false);
    cpu.wfi = false;
    cpu.pc = cpu.csr.mtvec();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::{MIE, MIE_RTC_TIMER_BIT, MSTATUS, MSTATUS_MIE_BIT, MTVEC};

    fn cpu_with_traps_enabled() -> Cpu {
        let mut cpu = Cpu::new();
        cpu.csr.write(MSTATUS, 1 << MSTATUS_MIE_BIT).unwrap();
        cpu.csr
            .write(MIE, (1 << MIE_CYCLE_TIMER_BIT) | (1 << MIE_RTC_TIMER_BIT))
            .unwrap();
        cpu.csr.write(MTVEC, 0x200).unwrap();
        cpu
    }

    #[test]
    fn no_trap_when_nothing_pending() {
        let mut cpu = cpu_with_traps_enabled();
        assert!(!sample_and_enter(&mut cpu, 0));
    }

    #[test]
    fn no_trap_when_globally_disabled() {
        let mut cpu = Cpu::new();
        cpu.csr.write(MIE, 1 << MIE_CYCLE_TIMER_BIT).unwrap();
        assert!(!sample_and_enter(&mut cpu, 1 << MIE_CYCLE_TIMER_BIT));
    }

    #[test]
    fn cycle_timer_trap_saves_pc_and_jumps_to_mtvec() {
        let mut cpu = cpu_with_traps_enabled();
        cpu.pc = 0x40;
        cpu.wfi = true;
        assert!(sample_and_enter(&mut cpu, 1 << MIE_CYCLE_TIMER_BIT));
        assert_eq!(cpu.csr.mepc(), 0x40);
        assert_eq!(cpu.csr.mcause(), MCAUSE_CYCLE_TIMER);
        assert_eq!(cpu.pc, 0x200);
        assert!(!cpu.csr.mie_enabled());
        assert!(!cpu.wfi);
    }

    #[test]
    fn cycle_timer_has_priority_over_rtc_timer() {
        let mut cpu = cpu_with_traps_enabled();
        let both = (1 << MIE_CYCLE_TIMER_BIT) | (1 << MIE_RTC_TIMER_BIT);
        assert!(sample_and_enter(&mut cpu, both));
        assert_eq!(cpu.csr.mcause(), MCAUSE_CYCLE_TIMER);
    }
}
