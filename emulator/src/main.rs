//! CLI front-end for the `riscvemu` virtual machine: assembles a source
//! file, then either runs it to completion, walks it one instruction at a
//! time at an interactive prompt, or drives a live terminal view of the
//! 80x25 display and register/CSR panes.
//!
//! This binary is an external collaborator of the core crate: it never
//! reaches into `Vm`'s internals beyond the public `step`/`run` surface,
//! `Memory`'s device handles, and the assembler's error type.

use std::fs;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use clap_num::maybe_hex;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use ratatui::widgets::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use riscvemu::assembler;
use riscvemu::devices::display;
use riscvemu::error::VmError;
use riscvemu::registers::index_to_name;
use riscvemu::report::ExceptionReport;
use riscvemu::vm::Vm;

/// Assemble and run programs written in this machine's assembly dialect
/// against a 32-bit RV32I+M virtual machine with two memory-mapped timers
/// and an 80x25 text display.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to an assembly source file
    input: String,

    /// Enable debug-level logging
    #[arg(short, long)]
    debug: bool,

    /// Single-step through the program at an interactive prompt instead of
    /// running it to completion
    #[arg(short, long)]
    step: bool,

    /// Write-protect the TEXT region, so a stray store into it raises a
    /// protection error instead of silently corrupting code
    #[arg(short = 'p', long)]
    protect_text: bool,

    /// Maximum number of instructions to execute before giving up (0x
    /// prefix accepted)
    #[arg(short, long, value_parser = maybe_hex::<u64>)]
    budget: Option<u64>,

    /// Suppress the live terminal display; run headless and print a
    /// one-line summary (or an exception report) at exit
    #[arg(long)]
    no_display: bool,

    /// Target clock frequency in instructions per second (0x prefix
    /// accepted). Omit to disable pacing and run as fast as possible
    #[arg(long, value_parser = maybe_hex::<u32>)]
    hz: Option<u32>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let source = match fs::read_to_string(&args.input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: could not read {}: {err}", args.input);
            return ExitCode::FAILURE;
        }
    };

    let program = match assembler::assemble(&source) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("assembly error: {err}");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "assembled {} instruction(s), {} byte(s) of initial data",
        program.text.len(),
        program.data.len()
    );

    let mut vm = Vm::with_pacing(args.protect_text, if args.step { None } else { args.hz });
    if let Err(err) = vm.load_assembled(&program) {
        eprintln!("error: program does not fit in memory: {err}");
        return ExitCode::FAILURE;
    }

    let outcome = if args.step {
        run_step_prompt(&mut vm, args.budget)
    } else if args.no_display {
        run_headless(&mut vm, args.budget)
    } else {
        run_live(&mut vm, args.budget)
    };

    match outcome {
        Ok(()) => {
            log::info!("halted at pc=0x{:08x}", vm.cpu.pc);
            ExitCode::SUCCESS
        }
        Err(err) => {
            let symbol = vm.symbol_for_pc(vm.cpu.pc);
            let report = ExceptionReport::capture_with_symbol(&vm.cpu, err, symbol);
            log::error!("{report}");
            eprintln!("{report}");
            ExitCode::FAILURE
        }
    }
}

/// Run to completion (or budget exhaustion) with no interactive prompt or
/// live rendering; for scripted use and tests of whole programs.
fn run_headless(vm: &mut Vm, budget: Option<u64>) -> Result<(), VmError> {
    let executed = vm.run(budget)?;
    if !vm.cpu.halted {
        log::warn!("instruction budget ({executed}) exhausted before halt");
    }
    Ok(())
}

/// An interactive step-mode prompt: Enter (or `s`) steps once, `r` runs to
/// completion, `q` quits early. Prints the next instruction and the
/// registers it is about to touch after every step.
fn run_step_prompt(vm: &mut Vm, budget: Option<u64>) -> Result<(), VmError> {
    let mut rl = DefaultEditor::new().expect("line editor should initialize");
    let mut executed = 0u64;
    println!("step-mode: enter/s=step, r=run to completion, q=quit");

    loop {
        if vm.cpu.halted {
            println!("halted.");
            return Ok(());
        }
        if let Some(budget) = budget {
            if executed >= budget {
                println!("instruction budget ({budget}) exhausted.");
                return Ok(());
            }
        }

        if let Some(instr) = vm.instruction_at(vm.cpu.pc) {
            let label = vm.symbol_for_pc(vm.cpu.pc).map(|(name, _)| name.to_string());
            match label {
                Some(name) => println!("0x{:08x} <{name}>: {instr}", vm.cpu.pc),
                None => println!("0x{:08x}: {instr}", vm.cpu.pc),
            }
        }

        let line = match rl.readline("(step) ") {
            Ok(line) => line,
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => return Ok(()),
            Err(err) => {
                eprintln!("input error: {err}");
                return Ok(());
            }
        };
        match line.trim() {
            "q" | "quit" => return Ok(()),
            "r" | "run" => {
                let remaining = budget.map(|b| b.saturating_sub(executed));
                vm.run(remaining)?;
                return Ok(());
            }
            _ => {
                vm.step(Instant::now())?;
                executed += 1;
                print_registers(vm);
            }
        }
    }
}

fn print_registers(vm: &Vm) {
    for row in 0..8 {
        let mut line = String::new();
        for col in 0..4 {
            let index = (row + col * 8) as u8;
            line.push_str(&format!(
                "{:>4}=0x{:08x}  ",
                index_to_name(index),
                vm.cpu.registers.read(index).unwrap()
            ));
        }
        println!("{line}");
    }
}

/// Run with a live `ratatui` view of the 80x25 display buffer alongside a
/// register/CSR pane, paced by `Vm`'s own pacing clock. Quits early on `q`.
fn run_live(vm: &mut Vm, budget: Option<u64>) -> Result<(), VmError> {
    enable_raw_mode().expect("terminal should support raw mode");
    std::io::stdout()
        .execute(EnterAlternateScreen)
        .expect("terminal should support the alternate screen");
    let mut terminal =
        Terminal::new(CrosstermBackend::new(std::io::stdout())).expect("terminal backend should initialize");

    let mut executed = 0u64;
    let mut result: Result<(), VmError> = Ok(());
    loop {
        if vm.cpu.halted {
            break;
        }
        if let Some(budget) = budget {
            if executed >= budget {
                break;
            }
        }
        if matches!(poll_quit(), Ok(true)) {
            break;
        }

        if let Err(err) = vm.step(Instant::now()) {
            result = Err(err);
            break;
        }
        executed += 1;

        terminal
            .draw(|frame| draw(frame, vm))
            .expect("frame should render");
    }

    disable_raw_mode().expect("raw mode should disable cleanly");
    std::io::stdout()
        .execute(LeaveAlternateScreen)
        .expect("alternate screen should leave cleanly");
    result
}

fn poll_quit() -> std::io::Result<bool> {
    if event::poll(std::time::Duration::from_millis(0))? {
        if let Event::Key(key) = event::read()? {
            return Ok(key.kind == KeyEventKind::Press && key.code == KeyCode::Char('q'));
        }
    }
    Ok(false)
}

fn draw(frame: &mut Frame, vm: &Vm) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(82), Constraint::Min(30)])
        .split(frame.size());

    frame.render_widget(display_widget(vm), columns[0]);
    frame.render_widget(status_widget(vm), columns[1]);
}

fn display_widget(vm: &Vm) -> Paragraph<'static> {
    let cells = vm.memory.devices.display.cells();
    let mut lines = Vec::with_capacity(display::ROWS);
    for row in 0..display::ROWS {
        let start = row * display::COLUMNS;
        let text: String = cells[start..start + display::COLUMNS]
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        lines.push(Line::from(text));
    }
    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Display"))
}

fn status_widget(vm: &Vm) -> Paragraph<'static> {
    let mut lines = vec![
        Line::from(format!("pc      = 0x{:08x}", vm.cpu.pc)),
        Line::from(format!("mstatus = 0x{:08x}", vm.cpu.csr.mstatus())),
        Line::from(format!("mcause  = 0x{:08x}", vm.cpu.csr.mcause())),
        Line::from(format!("mepc    = 0x{:08x}", vm.cpu.csr.mepc())),
        Line::from(format!("mtvec   = 0x{:08x}", vm.cpu.csr.mtvec())),
        Line::from(if vm.cpu.wfi { "wfi" } else { "running" }.to_string()),
        Line::from(""),
    ];
    for index in 0..32u8 {
        lines.push(Line::from(format!(
            "{:>4} = 0x{:08x}",
            index_to_name(index),
            vm.cpu.registers.read(index).unwrap()
        )));
    }
    Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("CPU (press q to quit)"))
}
