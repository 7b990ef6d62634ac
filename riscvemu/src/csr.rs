//! Control and status registers.
//!
//! Only the six CSRs this machine implements are given real storage:
//! `mstatus`, `mie`, `mtvec`, `mepc`, `mcause`, `mip`. As a dense struct with
//! named fields rather than a general `HashMap<u16, u32>`, the invariant
//! "after trap entry, MIE is 0" is checkable by reading a single field
//! instead of threading a CSR address through a lookup.
//!
//! `mip` is never stored: it is derived fresh from the two timers'
//! pending bits on every read, rather than kept as an independent source
//! of truth that could drift out of sync with the devices.

pub const MSTATUS: u16 = 0x300;
pub const MIE: u16 = 0x304;
pub const MTVEC: u16 = 0x305;
pub const MEPC: u16 = 0x341;
pub const MCAUSE: u16 = 0x342;
pub const MIP: u16 = 0x344;

/// Bit position of the global machine-interrupt enable in `mstatus`.
pub const MSTATUS_MIE_BIT: u32 = 3;
/// Bit position of the cycle-timer interrupt enable in `mie`/`mip`.
pub const MIE_CYCLE_TIMER_BIT: u32 = 7;
/// Bit position of the real-time-timer interrupt enable in `mie`/`mip`.
pub const MIE_RTC_TIMER_BIT: u32 = 11;

/// `mcause` value for a cycle-timer interrupt (high bit marks an interrupt).
pub const MCAUSE_CYCLE_TIMER: u32 = 0x8000_0007;
/// `mcause` value for a real-time-timer interrupt.
pub const MCAUSE_RTC_TIMER: u32 = 0x8000_000b;

/// Resolve an assembler-facing CSR mnemonic (`"mstatus"`, `"mie"`, ...) to
/// its address, case-insensitively. Returns `None` for anything else,
/// letting the caller fall back to parsing a raw numeric address.
pub fn name_to_addr(name: &str) -> Option<u16> {
    Some(match name.to_ascii_lowercase().as_str() {
        "mstatus" => MSTATUS,
        "mie" => MIE,
        "mtvec" => MTVEC,
        "mepc" => MEPC,
        "mcause" => MCAUSE,
        "mip" => MIP,
        _ => return None,
    })
}

/// Policy for writes to CSR addresses this VM does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnimplementedCsrPolicy {
    /// Silently accept the write and discard the value (default).
    #[default]
    SilentAccept,
    /// Report an error instead.
    Reject,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("write to unimplemented CSR 0x{0:03x} was rejected")]
pub struct UnimplementedCsrWrite(pub u16);

/// The six machine-mode CSRs this VM implements, plus the policy for any
/// other CSR address.
#[derive(Debug, Default, Clone)]
pub struct CsrFile {
    mstatus: u32,
    mie: u32,
    mtvec: u32,
    mepc: u32,
    mcause: u32,
    unimplemented_policy: UnimplementedCsrPolicy,
}

impl CsrFile {
    pub fn new(unimplemented_policy: UnimplementedCsrPolicy) -> Self {
        Self {
            unimplemented_policy,
            ..Self::default()
        }
    }

    pub fn mstatus(&self) -> u32 {
        self.mstatus
    }

    pub fn mie(&self) -> u32 {
        self.mie
    }

    pub fn mtvec(&self) -> u32 {
        self.mtvec
    }

    pub fn mepc(&self) -> u32 {
        self.mepc
    }

    pub fn set_mepc(&mut self, pc: u32) {
        self.mepc = pc;
    }

    pub fn mcause(&self) -> u32 {
        self.mcause
    }

    pub fn set_mcause(&mut self, cause: u32) {
        self.mcause = cause;
    }

    pub fn mie_enabled(&self) -> bool {
        self.mstatus & (1 << MSTATUS_MIE_BIT) != 0
    }

    pub fn set_mie_enabled(&mut self, enabled: bool) {
        if enabled {
            self.mstatus |= 1 << MSTATUS_MIE_BIT;
        } else {
            self.mstatus &= !(1 << MSTATUS_MIE_BIT);
        }
    }

    pub fn cycle_timer_interrupt_enabled(&self) -> bool {
        self.mie & (1 << MIE_CYCLE_TIMER_BIT) != 0
    }

    pub fn rtc_timer_interrupt_enabled(&self) -> bool {
        self.mie & (1 << MIE_RTC_TIMER_BIT) != 0
    }

    /// Read a CSR by address, given the live `mip` bits composed by the
    /// caller (the two timers' pending flags). Unimplemented addresses
    /// read as zero.
    pub fn read(&self, addr: u16, mip: u32) -> u32 {
        match addr {
            MSTATUS => self.mstatus,
            MIE => self.mie,
            MTVEC => self.mtvec,
            MEPC => self.mepc,
            MCAUSE => self.mcause,
            MIP => mip,
            _ => 0,
        }
    }

    /// Write a CSR by address. Returns an error only under the `Reject`
    /// policy for an unimplemented address.
    pub fn write(&mut self, addr: u16, value: u32) -> Result<(), UnimplementedCsrWrite> {
        match addr {
            MSTATUS => self.mstatus = value,
            MIE => self.mie = value,
            MTVEC => self.mtvec = value,
            MEPC => self.mepc = value,
            MCAUSE => self.mcause = value,
            MIP => {} // mip is derived; writes to it have no effect
            _ => {
                if self.unimplemented_policy == UnimplementedCsrPolicy::Reject {
                    return Err(UnimplementedCsrWrite(addr));
                }
                log::warn!("discarding write to unimplemented CSR 0x{addr:03x}");
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        *self = Self {
            unimplemented_policy: self.unimplemented_policy,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mstatus_mie_round_trips() {
        let mut csr = CsrFile::default();
        assert!(!csr.mie_enabled());
        csr.set_mie_enabled(true);
        assert!(csr.mie_enabled());
        csr.set_mie_enabled(false);
        assert!(!csr.mie_enabled());
    }

    #[test]
    fn unimplemented_csr_reads_zero() {
        let csr = CsrFile::default();
        assert_eq!(csr.read(0x7c0, 0), 0);
    }

    #[test]
    fn unimplemented_csr_write_silently_accepted_by_default() {
        let mut csr = CsrFile::default();
        assert!(csr.write(0x7c0, 42).is_ok());
    }

    #[test]
    fn unimplemented_csr_write_rejected_under_strict_policy() {
        let mut csr = CsrFile::new(UnimplementedCsrPolicy::Reject);
        assert!(csr.write(0x7c0, 42).is_err());
    }

    #[test]
    fn name_to_addr_is_case_insensitive_and_rejects_unknown_names() {
        assert_eq!(name_to_addr("MSTATUS"), Some(MSTATUS));
        assert_eq!(name_to_addr("mtvec"), Some(MTVEC));
        assert_eq!(name_to_addr("mscratch"), None);
    }

    #[test]
    fn mip_is_not_independently_writable() {
        let mut csr = CsrFile::default();
        csr.write(MIP, 0xffff_ffff).unwrap();
        assert_eq!(csr.read(MIP, 0), 0);
        assert_eq!(csr.read(MIP, 1 << MIE_CYCLE_TIMER_BIT), 1 << MIE_CYCLE_TIMER_BIT);
    }
}
