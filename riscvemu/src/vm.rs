//! Ties the CPU, memory, devices and pacing clock together into the
//! deterministic step loop: advance timers, sample interrupts, either take
//! a trap or fetch-dispatch-advance, once per [`Vm::step`] call.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::assembler::AssembledProgram;
use crate::cpu::Cpu;
use crate::error::VmError;
use crate::instr::Instr;
use crate::interp;
use crate::memory::{Memory, MemoryError, DATA_START, TEXT_END, TEXT_START};
use crate::pacing::Pacing;
use crate::trap::{self, WFI_DEADLOCK_BUDGET};

/// Number of 4-byte instruction slots the TEXT region can hold.
const PROGRAM_SLOTS: usize = ((TEXT_END - TEXT_START) / 4) as usize;

pub struct Vm {
    pub cpu: Cpu,
    pub memory: Memory,
    pacing: Pacing,
    program: Vec<Option<Instr>>,
    idle_wfi_ticks: u32,
    symbols: BTreeMap<String, u32>,
}

impl Vm {
    pub fn new(text_is_read_only: bool) -> Self {
        Self {
            cpu: Cpu::new(),
            memory: Memory::new(text_is_read_only),
            pacing: Pacing::disabled(),
            program: vec![None; PROGRAM_SLOTS],
            idle_wfi_ticks: 0,
            symbols: BTreeMap::new(),
        }
    }

    pub fn with_pacing(text_is_read_only: bool, target_hz: Option<u32>) -> Self {
        Self {
            pacing: Pacing::new(target_hz),
            ..Self::new(text_is_read_only)
        }
    }

    /// Load an assembled program: the decoded instruction stream (placed
    /// at successive TEXT slots starting at `origin`) and the initial
    /// `.data` image (placed at the start of DATA).
    pub fn load_program(&mut self, text: &[Instr], data: &[u8]) -> Result<(), MemoryError> {
        for (slot, instr) in text.iter().enumerate() {
            *self
                .program
                .get_mut(slot)
                .ok_or(MemoryError::OutOfBounds {
                    addr: TEXT_START + (slot as u32) * 4,
                    width: 4,
                })? = Some(*instr);
        }
        self.memory.load_bytes(DATA_START, data)?;
        Ok(())
    }

    /// Load the output of [`crate::assembler::assemble`] directly, keeping
    /// its symbol table around for [`Vm::symbol_for_pc`].
    pub fn load_assembled(&mut self, program: &AssembledProgram) -> Result<(), MemoryError> {
        self.load_program(&program.text, &program.data)?;
        self.symbols = program.symbols.clone();
        Ok(())
    }

    /// The nearest label at or before `pc`, if the loaded program carried a
    /// symbol table and one exists. Used by the exception reporter to
    /// annotate a faulting PC with a name instead of a bare address.
    pub fn symbol_for_pc(&self, pc: u32) -> Option<(&str, u32)> {
        self.symbols
            .iter()
            .filter(|(_, &addr)| addr <= pc)
            .max_by_key(|(_, &addr)| addr)
            .map(|(name, &addr)| (name.as_str(), addr))
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
        self.memory.reset();
        self.idle_wfi_ticks = 0;
    }

    fn fetch(&self, pc: u32) -> Result<Instr, VmError> {
        if pc % 4 != 0 {
            return Err(MemoryError::Misaligned { addr: pc, width: 4 }.into());
        }
        if !(TEXT_START..TEXT_END).contains(&pc) {
            return Err(MemoryError::OutOfBounds { addr: pc, width: 4 }.into());
        }
        let slot = ((pc - TEXT_START) / 4) as usize;
        self.program
            .get(slot)
            .and_then(|entry| *entry)
            .ok_or(VmError::UnknownInstruction { pc })
    }

    /// Advance the machine by exactly one step. `now` is the wall-clock
    /// reading the real-time timer samples against; callers drive the
    /// clock so tests can supply a synthetic one.
    pub fn step(&mut self, now: Instant) -> Result<(), VmError> {
        if self.cpu.halted {
            return Ok(());
        }

        self.memory.devices.cycle_timer.tick();
        self.memory.devices.rt_timer.sample(now);
        let mip = self.memory.devices.mip();

        let trapped = trap::sample_and_enter(&mut self.cpu, mip);
        if trapped {
            self.idle_wfi_ticks = 0;
            self.pacing.throttle();
            return Ok(());
        }

        if self.cpu.wfi {
            self.idle_wfi_ticks += 1;
            if !self.cpu.csr.mie_enabled() && self.idle_wfi_ticks > WFI_DEADLOCK_BUDGET {
                return Err(VmError::Deadlock {
                    pc: self.cpu.pc,
                    ticks: self.idle_wfi_ticks,
                });
            }
            self.pacing.throttle();
            return Ok(());
        }
        self.idle_wfi_ticks = 0;

        let instr = self.fetch(self.cpu.pc)?;
        interp::execute(&instr, &mut self.cpu, &mut self.memory, mip)?;
        self.pacing.throttle();
        Ok(())
    }

    /// Run until halted, an error is raised, or `budget` steps have run
    /// (whichever comes first). Returns the number of steps executed.
    pub fn run(&mut self, budget: Option<u64>) -> Result<u64, VmError> {
        let mut executed = 0u64;
        while !self.cpu.halted {
            if let Some(budget) = budget {
                if executed >= budget {
                    break;
                }
            }
            self.step(Instant::now())?;
            executed += 1;
        }
        Ok(executed)
    }

    pub fn instruction_at(&self, pc: u32) -> Option<Instr> {
        if pc % 4 != 0 || !(TEXT_START..TEXT_END).contains(&pc) {
            return None;
        }
        self.program[((pc - TEXT_START) / 4) as usize]
    }
}
