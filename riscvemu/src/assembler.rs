//! Two-pass assembler: turns the source dialect into a [`Instr`] stream
//! plus a `.data` byte image.
//!
//! Pass 1 ([`compute_layout`]) walks the source once to assign every label
//! an address, counting pseudo-instructions at their expanded length so
//! later instructions land at the right slot. Pass 2 ([`assemble`]'s main
//! loop) walks it again with the label table in hand, resolving every
//! operand and emitting either a decoded [`Instr`] or raw data bytes.
//! Neither pass touches [`crate::interp`]; the interpreter only ever sees
//! the finished [`Instr`] records.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::csr;
use crate::instr::{AluOp, BranchOp, CsrOp, Instr, LoadOp, MulDivOp, StoreOp};
use crate::memory::{DATA_START, TEXT_START};
use crate::registers::name_to_index;

/// Everything assembly failed on. Each variant names the source line so a
/// caller can report it without re-scanning the input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error("line {line}: undefined label {label:?}")]
    UndefinedLabel { line: usize, label: String },

    #[error("line {line}: unknown mnemonic {mnemonic:?}")]
    UnknownMnemonic { line: usize, mnemonic: String },

    #[error("line {line}: {mnemonic} expects {expected} operand(s), found {found}")]
    WrongOperandCount {
        line: usize,
        mnemonic: String,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: invalid register name {name:?}")]
    InvalidRegister { line: usize, name: String },

    #[error("line {line}: immediate {value} does not fit in a {bits}-bit {kind} field")]
    ImmediateOutOfRange {
        line: usize,
        value: i64,
        bits: u32,
        kind: &'static str,
    },

    #[error("line {line}: branch/jump target is not 2-byte aligned (offset {offset})")]
    MisalignedTarget { line: usize, offset: i32 },

    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },

    #[error("line {line}: unknown escape sequence \\{escape}")]
    UnknownEscape { line: usize, escape: char },

    #[error("line {line}: malformed operand {text:?}")]
    MalformedOperand { line: usize, text: String },
}

/// The output of a successful assembly: the instruction stream destined for
/// TEXT, the initial byte image destined for DATA, and the label table
/// (kept around so an exception reporter can resolve a faulting PC back to
/// a name).
#[derive(Debug, Clone, Default)]
pub struct AssembledProgram {
    pub text: Vec<Instr>,
    pub data: Vec<u8>,
    pub symbols: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Text,
    Data,
}

/// One logical line of source after comment-stripping and label splitting.
/// `mnemonic` is the lowercased directive (`.word`) or instruction
/// (`addi`) keyword; `operands_raw` is the untouched remainder so label
/// operands keep their original case.
struct SourceLine {
    line_no: usize,
    label: Option<String>,
    mnemonic: Option<String>,
    operands_raw: String,
}

/// Assemble a complete source string into a [`AssembledProgram`].
pub fn assemble(source: &str) -> Result<AssembledProgram, AssembleError> {
    let lines = lex(source)?;
    let symbols = compute_layout(&lines)?;

    let mut text = Vec::new();
    let mut data = Vec::new();
    let mut text_addr = TEXT_START;

    for line in &lines {
        let Some(mnemonic) = line.mnemonic.as_deref() else {
            continue;
        };
        match mnemonic {
            ".text" | ".data" => {}
            ".word" => {
                for operand in split_operands(&line.operands_raw) {
                    let value = resolve_word_expr(&operand, &symbols, line.line_no)?;
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }
            ".byte" => {
                for operand in split_operands(&line.operands_raw) {
                    let value = parse_int(&operand, line.line_no)?;
                    data.push(value as u8);
                }
            }
            ".string" | ".asciiz" => {
                let mut bytes = parse_string_literal(line.operands_raw.trim(), line.line_no)?;
                bytes.push(0);
                data.extend(bytes);
            }
            mnemonic => {
                let operands = split_operands(&line.operands_raw);
                let encoded = encode(mnemonic, &operands, text_addr, &symbols, line.line_no)?;
                text_addr += 4 * encoded.len() as u32;
                text.extend(encoded);
            }
        }
    }

    Ok(AssembledProgram {
        text,
        data,
        symbols,
    })
}

/// Pass 1: assign every label an address by walking the source once,
/// advancing a text cursor per instruction (pseudo-instructions counted at
/// their expanded length) and a data cursor per directive.
fn compute_layout(lines: &[SourceLine]) -> Result<BTreeMap<String, u32>, AssembleError> {
    let mut symbols = BTreeMap::new();
    let mut section = Section::Text;
    let mut text_cursor = TEXT_START;
    let mut data_cursor = DATA_START;

    for line in lines {
        if let Some(label) = &line.label {
            let addr = if section == Section::Text {
                text_cursor
            } else {
                data_cursor
            };
            symbols.insert(label.clone(), addr);
        }

        let Some(mnemonic) = line.mnemonic.as_deref() else {
            continue;
        };
        match mnemonic {
            ".text" => section = Section::Text,
            ".data" => section = Section::Data,
            ".word" => {
                data_cursor += 4 * split_operands(&line.operands_raw).len() as u32;
            }
            ".byte" => {
                data_cursor += split_operands(&line.operands_raw).len() as u32;
            }
            ".string" | ".asciiz" => {
                let bytes = parse_string_literal(line.operands_raw.trim(), line.line_no)?;
                data_cursor += bytes.len() as u32 + 1;
            }
            other if other.starts_with('.') => {
                return Err(AssembleError::UnknownMnemonic {
                    line: line.line_no,
                    mnemonic: other.to_string(),
                });
            }
            mnemonic => {
                let slots = slot_count(mnemonic).ok_or_else(|| AssembleError::UnknownMnemonic {
                    line: line.line_no,
                    mnemonic: mnemonic.to_string(),
                })?;
                text_cursor += 4 * slots;
            }
        }
    }
    Ok(symbols)
}

/// Number of 4-byte instruction slots a mnemonic expands to. `la` is the
/// only pseudo-instruction wider than one real instruction (`lui` + `addi`).
fn slot_count(mnemonic: &str) -> Option<u32> {
    match mnemonic {
        "la" => Some(2),
        "nop" | "call" | "ret" | "j" | "mv" | "lui" | "auipc" | "jal" | "jalr" | "beq" | "bne"
        | "blt" | "bge" | "bltu" | "bgeu" | "lb" | "lh" | "lw" | "lbu" | "lhu" | "sb" | "sh"
        | "sw" | "addi" | "slti" | "sltiu" | "andi" | "ori" | "xori" | "slli" | "srli"
        | "srai" | "add" | "sub" | "slt" | "sltu" | "and" | "or" | "xor" | "sll" | "srl"
        | "sra" | "mul" | "div" | "divu" | "rem" | "remu" | "csrrw" | "csrrs" | "csrrc"
        | "csrrwi" | "csrrsi" | "csrrci" | "mret" | "wfi" | "halt" => Some(1),
        _ => None,
    }
}

/// A `.word` operand may be a label (its address is emitted) or an integer
/// literal.
fn resolve_word_expr(
    operand: &str,
    symbols: &BTreeMap<String, u32>,
    line: usize,
) -> Result<u32, AssembleError> {
    let trimmed = operand.trim();
    if let Some(&addr) = symbols.get(trimmed) {
        return Ok(addr);
    }
    Ok(parse_int(trimmed, line)? as u32)
}

/// Encode one real or pseudo mnemonic into one or more [`Instr`] records.
/// `addr` is the absolute address of the (first) emitted instruction, used
/// to resolve PC-relative branch/jump offsets and `LA`'s `hi`/`lo` split.
fn encode(
    mnemonic: &str,
    ops: &[String],
    addr: u32,
    symbols: &BTreeMap<String, u32>,
    line: usize,
) -> Result<Vec<Instr>, AssembleError> {
    use Instr::*;

    let instrs = match mnemonic {
        "nop" => {
            expect_operands(mnemonic, ops, 0, line)?;
            vec![RegImm {
                op: AluOp::Add,
                rd: 0,
                rs1: 0,
                imm: 0,
            }]
        }
        "ret" => {
            expect_operands(mnemonic, ops, 0, line)?;
            vec![Jalr {
                rd: 0,
                rs1: 1,
                imm: 0,
            }]
        }
        "halt" => {
            expect_operands(mnemonic, ops, 0, line)?;
            vec![Halt]
        }
        "wfi" => {
            expect_operands(mnemonic, ops, 0, line)?;
            vec![Wfi]
        }
        "mret" => {
            expect_operands(mnemonic, ops, 0, line)?;
            vec![Mret]
        }
        "mv" => {
            expect_operands(mnemonic, ops, 2, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let rs1 = parse_reg(&ops[1], line)?;
            vec![RegImm {
                op: AluOp::Add,
                rd,
                rs1,
                imm: 0,
            }]
        }
        "call" => {
            expect_operands(mnemonic, ops, 1, line)?;
            let offset = pc_relative_offset(&ops[0], symbols, addr, 21, line)?;
            vec![Jal { rd: 1, offset }]
        }
        "j" => {
            expect_operands(mnemonic, ops, 1, line)?;
            let offset = pc_relative_offset(&ops[0], symbols, addr, 21, line)?;
            vec![Jal { rd: 0, offset }]
        }
        "la" => {
            expect_operands(mnemonic, ops, 2, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let target = resolve_label(&ops[1], symbols, line)?;
            vec![
                Lui {
                    rd,
                    imm20: hi(target),
                },
                RegImm {
                    op: AluOp::Add,
                    rd,
                    rs1: rd,
                    imm: lo(target),
                },
            ]
        }
        "lui" => {
            expect_operands(mnemonic, ops, 2, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let imm20 = parse_imm20(&ops[1], line)?;
            vec![Lui { rd, imm20 }]
        }
        "auipc" => {
            expect_operands(mnemonic, ops, 2, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let imm20 = parse_imm20(&ops[1], line)?;
            vec![Auipc { rd, imm20 }]
        }
        "jal" => {
            expect_operands(mnemonic, ops, 2, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let offset = pc_relative_offset(&ops[1], symbols, addr, 21, line)?;
            vec![Jal { rd, offset }]
        }
        "jalr" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let rs1 = parse_reg(&ops[1], line)?;
            let imm = parse_signed_imm(&ops[2], 12, line)?;
            vec![Jalr { rd, rs1, imm }]
        }
        "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rs1 = parse_reg(&ops[0], line)?;
            let rs2 = parse_reg(&ops[1], line)?;
            let offset = pc_relative_offset(&ops[2], symbols, addr, 13, line)?;
            let op = match mnemonic {
                "beq" => BranchOp::Beq,
                "bne" => BranchOp::Bne,
                "blt" => BranchOp::Blt,
                "bge" => BranchOp::Bge,
                "bltu" => BranchOp::Bltu,
                "bgeu" => BranchOp::Bgeu,
                _ => unreachable!(),
            };
            vec![Branch {
                op,
                rs1,
                rs2,
                offset,
            }]
        }
        "lb" | "lh" | "lw" | "lbu" | "lhu" => {
            expect_operands(mnemonic, ops, 2, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let (imm, rs1) = parse_mem_operand(&ops[1], line)?;
            let op = match mnemonic {
                "lb" => LoadOp::Lb,
                "lh" => LoadOp::Lh,
                "lw" => LoadOp::Lw,
                "lbu" => LoadOp::Lbu,
                "lhu" => LoadOp::Lhu,
                _ => unreachable!(),
            };
            vec![Load { op, rd, rs1, imm }]
        }
        "sb" | "sh" | "sw" => {
            expect_operands(mnemonic, ops, 2, line)?;
            let rs2 = parse_reg(&ops[0], line)?;
            let (imm, rs1) = parse_mem_operand(&ops[1], line)?;
            let op = match mnemonic {
                "sb" => StoreOp::Sb,
                "sh" => StoreOp::Sh,
                "sw" => StoreOp::Sw,
                _ => unreachable!(),
            };
            vec![Store { op, rs1, rs2, imm }]
        }
        "addi" | "slti" | "sltiu" | "andi" | "ori" | "xori" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let rs1 = parse_reg(&ops[1], line)?;
            let imm = parse_signed_imm(&ops[2], 12, line)?;
            let op = match mnemonic {
                "addi" => AluOp::Add,
                "slti" => AluOp::Slt,
                "sltiu" => AluOp::Sltu,
                "andi" => AluOp::And,
                "ori" => AluOp::Or,
                "xori" => AluOp::Xor,
                _ => unreachable!(),
            };
            vec![RegImm { op, rd, rs1, imm }]
        }
        "slli" | "srli" | "srai" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let rs1 = parse_reg(&ops[1], line)?;
            let imm = parse_unsigned_imm(&ops[2], 5, line)?;
            let op = match mnemonic {
                "slli" => AluOp::Sll,
                "srli" => AluOp::Srl,
                "srai" => AluOp::Sra,
                _ => unreachable!(),
            };
            vec![RegImm { op, rd, rs1, imm }]
        }
        "add" | "sub" | "slt" | "sltu" | "and" | "or" | "xor" | "sll" | "srl" | "sra" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let rs1 = parse_reg(&ops[1], line)?;
            let rs2 = parse_reg(&ops[2], line)?;
            let op = match mnemonic {
                "add" => AluOp::Add,
                "sub" => AluOp::Sub,
                "slt" => AluOp::Slt,
                "sltu" => AluOp::Sltu,
                "and" => AluOp::And,
                "or" => AluOp::Or,
                "xor" => AluOp::Xor,
                "sll" => AluOp::Sll,
                "srl" => AluOp::Srl,
                "sra" => AluOp::Sra,
                _ => unreachable!(),
            };
            vec![RegReg { op, rd, rs1, rs2 }]
        }
        "mul" | "div" | "divu" | "rem" | "remu" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let rs1 = parse_reg(&ops[1], line)?;
            let rs2 = parse_reg(&ops[2], line)?;
            let op = match mnemonic {
                "mul" => MulDivOp::Mul,
                "div" => MulDivOp::Div,
                "divu" => MulDivOp::Divu,
                "rem" => MulDivOp::Rem,
                "remu" => MulDivOp::Remu,
                _ => unreachable!(),
            };
            vec![MulDiv { op, rd, rs1, rs2 }]
        }
        "csrrw" | "csrrs" | "csrrc" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let csr = parse_csr(&ops[1], line)?;
            let rs1 = parse_reg(&ops[2], line)?;
            let op = match mnemonic {
                "csrrw" => CsrOp::Csrrw,
                "csrrs" => CsrOp::Csrrs,
                "csrrc" => CsrOp::Csrrc,
                _ => unreachable!(),
            };
            vec![Csr { op, rd, rs1, csr }]
        }
        "csrrwi" | "csrrsi" | "csrrci" => {
            expect_operands(mnemonic, ops, 3, line)?;
            let rd = parse_reg(&ops[0], line)?;
            let csr = parse_csr(&ops[1], line)?;
            let uimm = parse_unsigned_imm(&ops[2], 5, line)? as u8;
            let op = match mnemonic {
                "csrrwi" => CsrOp::Csrrw,
                "csrrsi" => CsrOp::Csrrs,
                "csrrci" => CsrOp::Csrrc,
                _ => unreachable!(),
            };
            vec![CsrImm { op, rd, uimm, csr }]
        }
        other => {
            return Err(AssembleError::UnknownMnemonic {
                line,
                mnemonic: other.to_string(),
            })
        }
    };
    Ok(instrs)
}

fn expect_operands(
    mnemonic: &str,
    ops: &[String],
    expected: usize,
    line: usize,
) -> Result<(), AssembleError> {
    if ops.len() != expected {
        return Err(AssembleError::WrongOperandCount {
            line,
            mnemonic: mnemonic.to_string(),
            expected,
            found: ops.len(),
        });
    }
    Ok(())
}

fn parse_reg(s: &str, line: usize) -> Result<u8, AssembleError> {
    name_to_index(s.trim()).map_err(|_| AssembleError::InvalidRegister {
        line,
        name: s.trim().to_string(),
    })
}

fn parse_signed_imm(s: &str, bits: u32, line: usize) -> Result<i32, AssembleError> {
    let value = parse_int(s, line)?;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if value < min || value > max {
        return Err(AssembleError::ImmediateOutOfRange {
            line,
            value,
            bits,
            kind: "signed",
        });
    }
    Ok(value as i32)
}

fn parse_unsigned_imm(s: &str, bits: u32, line: usize) -> Result<i32, AssembleError> {
    let value = parse_int(s, line)?;
    let max = (1i64 << bits) - 1;
    if value < 0 || value > max {
        return Err(AssembleError::ImmediateOutOfRange {
            line,
            value,
            bits,
            kind: "unsigned",
        });
    }
    Ok(value as i32)
}

/// `LUI`/`AUIPC`'s 20-bit field, accepted either as the standard unsigned
/// range or as a negative value that `LA`'s `hi(addr)` never produces but a
/// hand-written program legitimately might.
fn parse_imm20(s: &str, line: usize) -> Result<i32, AssembleError> {
    let value = parse_int(s, line)?;
    if !(-0x8_0000i64..=0xf_ffffi64).contains(&value) {
        return Err(AssembleError::ImmediateOutOfRange {
            line,
            value,
            bits: 20,
            kind: "imm20",
        });
    }
    Ok(value as i32)
}

/// Parse the `imm(reg)` syntax used by loads and stores.
fn parse_mem_operand(s: &str, line: usize) -> Result<(i32, u8), AssembleError> {
    let malformed = || AssembleError::MalformedOperand {
        line,
        text: s.to_string(),
    };
    let open = s.find('(').ok_or_else(malformed)?;
    let close = s.rfind(')').filter(|&c| c > open).ok_or_else(malformed)?;
    let imm = parse_signed_imm(s[..open].trim(), 12, line)?;
    let reg = parse_reg(&s[open + 1..close], line)?;
    Ok((imm, reg))
}

fn parse_csr(s: &str, line: usize) -> Result<u16, AssembleError> {
    if let Some(addr) = csr::name_to_addr(s.trim()) {
        return Ok(addr);
    }
    let value = parse_int(s, line)?;
    if !(0..=0xfff).contains(&value) {
        return Err(AssembleError::ImmediateOutOfRange {
            line,
            value,
            bits: 12,
            kind: "csr address",
        });
    }
    Ok(value as u16)
}

fn resolve_label(
    name: &str,
    symbols: &BTreeMap<String, u32>,
    line: usize,
) -> Result<u32, AssembleError> {
    symbols
        .get(name.trim())
        .copied()
        .ok_or_else(|| AssembleError::UndefinedLabel {
            line,
            label: name.trim().to_string(),
        })
}

/// `addr(L) - current_instruction_address`, checked for the required
/// 2-byte alignment and for fitting the mnemonic's offset field.
///
/// The operand is usually a label, but when it isn't one found in the
/// symbol table it is parsed as an integer and taken to already be the
/// resolved relative offset. This lets a disassembled branch/jump (whose
/// `Display` impl prints the bare offset rather than a label) reassemble
/// back to the same instruction.
fn pc_relative_offset(
    target_label: &str,
    symbols: &BTreeMap<String, u32>,
    current_addr: u32,
    bits: u32,
    line: usize,
) -> Result<i32, AssembleError> {
    let trimmed = target_label.trim();
    let offset = match symbols.get(trimmed) {
        Some(&target) => target as i64 - current_addr as i64,
        None => parse_int(trimmed, line).map_err(|_| AssembleError::UndefinedLabel {
            line,
            label: trimmed.to_string(),
        })?,
    };
    if offset % 2 != 0 {
        return Err(AssembleError::MisalignedTarget {
            line,
            offset: offset as i32,
        });
    }
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if offset < min || offset > max {
        return Err(AssembleError::ImmediateOutOfRange {
            line,
            value: offset,
            bits,
            kind: "pc-relative",
        });
    }
    Ok(offset as i32)
}

/// `hi(x) = (x + 0x800) >> 12`: the 20-bit upper half, adjusted so adding
/// the signed 12-bit `lo(x)` reconstructs `x` exactly.
fn hi(addr: u32) -> i32 {
    (addr.wrapping_add(0x800) >> 12) as i32
}

/// `lo(x) = x - (hi(x) << 12)`, interpreted as a signed 12-bit value.
fn lo(addr: u32) -> i32 {
    (addr as i32).wrapping_sub(hi(addr) << 12)
}

fn parse_escape(c: char) -> Option<char> {
    Some(match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        '\\' => '\\',
        '\'' => '\'',
        '"' => '"',
        _ => return None,
    })
}

fn parse_string_literal(raw: &str, line: usize) -> Result<Vec<u8>, AssembleError> {
    let malformed = || AssembleError::MalformedOperand {
        line,
        text: raw.to_string(),
    };
    let mut chars = raw.chars();
    if chars.next() != Some('"') {
        return Err(malformed());
    }
    let mut bytes = Vec::new();
    let mut closed = false;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                closed = true;
                break;
            }
            '\\' => {
                let escape = chars.next().ok_or(AssembleError::UnterminatedString { line })?;
                let resolved = parse_escape(escape)
                    .ok_or(AssembleError::UnknownEscape { line, escape })?;
                bytes.push(resolved as u8);
            }
            c => bytes.extend(c.to_string().into_bytes()),
        }
    }
    if !closed {
        return Err(AssembleError::UnterminatedString { line });
    }
    Ok(bytes)
}

fn parse_char_literal(raw: &str, line: usize) -> Result<u8, AssembleError> {
    let malformed = || AssembleError::MalformedOperand {
        line,
        text: raw.to_string(),
    };
    let mut chars = raw.chars();
    if chars.next() != Some('\'') {
        return Err(malformed());
    }
    let c = chars.next().ok_or(AssembleError::UnterminatedString { line })?;
    let value = if c == '\\' {
        let escape = chars.next().ok_or(AssembleError::UnterminatedString { line })?;
        parse_escape(escape).ok_or(AssembleError::UnknownEscape { line, escape })? as u8
    } else {
        c as u8
    };
    if chars.next() != Some('\'') {
        return Err(AssembleError::UnterminatedString { line });
    }
    Ok(value)
}

/// Decimal, `0x`/`0X` hex, `0b`/`0B` binary, or a `'c'` character literal,
/// with an optional leading `-`.
fn parse_int(raw: &str, line: usize) -> Result<i64, AssembleError> {
    let raw = raw.trim();
    let (negative, raw) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let malformed = || AssembleError::MalformedOperand {
        line,
        text: raw.to_string(),
    };
    let value: i64 = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).map_err(|_| malformed())?
    } else if let Some(bin) = raw.strip_prefix("0b").or_else(|| raw.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).map_err(|_| malformed())?
    } else if raw.starts_with('\'') {
        parse_char_literal(raw, line)? as i64
    } else {
        raw.parse::<i64>().map_err(|_| malformed())?
    };
    Ok(if negative { -value } else { value })
}

/// Strip a `#`/`;` comment, respecting string and character literals so a
/// `;` inside `.string "a;b"` is not mistaken for one.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut in_char = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string || in_char => escaped = true,
            '"' if !in_char => in_string = !in_string,
            '\'' if !in_string => in_char = !in_char,
            '#' | ';' if !in_string && !in_char => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Split a line into an optional leading `label:` and the remainder.
fn split_label(line: &str) -> (Option<&str>, &str) {
    match line.find(':') {
        Some(idx) => (Some(line[..idx].trim()), line[idx + 1..].trim()),
        None => (None, line.trim()),
    }
}

fn split_first_token(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], s[idx..].trim_start()),
        None => (s, ""),
    }
}

/// Split an operand list on top-level commas: commas inside `(...)` (a
/// load/store's `imm(reg)`) or `"..."` (a string directive) do not split.
fn split_operands(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_string => {
                depth -= 1;
                current.push(c);
            }
            ',' if !in_string && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn lex(source: &str) -> Result<Vec<SourceLine>, AssembleError> {
    let mut lines = Vec::new();
    for (i, raw_line) in source.lines().enumerate() {
        let line_no = i + 1;
        let stripped = strip_comment(raw_line);
        if stripped.trim().is_empty() {
            continue;
        }
        let (label, rest) = split_label(stripped);
        if rest.is_empty() {
            lines.push(SourceLine {
                line_no,
                label: label.map(str::to_string),
                mnemonic: None,
                operands_raw: String::new(),
            });
            continue;
        }
        let (first, remainder) = split_first_token(rest);
        lines.push(SourceLine {
            line_no,
            label: label.map(str::to_string),
            mnemonic: Some(first.to_ascii_lowercase()),
            operands_raw: remainder.to_string(),
        });
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let program = assemble("# a comment\n\n  ; another\nhalt # trailing\n").unwrap();
        assert_eq!(program.text, vec![Instr::Halt]);
    }

    #[test]
    fn nop_expands_to_addi_x0_x0_0() {
        let program = assemble("nop").unwrap();
        assert_eq!(
            program.text,
            vec![Instr::RegImm {
                op: AluOp::Add,
                rd: 0,
                rs1: 0,
                imm: 0
            }]
        );
    }

    #[test]
    fn la_expands_to_lui_then_addi_reconstructing_the_address() {
        let source = "la a0, target\nhalt\n.data\ntarget:\n.word 42\n";
        let program = assemble(source).unwrap();
        let target_addr = program.symbols["target"];
        match program.text[0] {
            Instr::Lui { rd, imm20 } => {
                assert_eq!(rd, 10);
                match program.text[1] {
                    Instr::RegImm { op: AluOp::Add, rd: rd2, rs1, imm } => {
                        assert_eq!(rd2, 10);
                        assert_eq!(rs1, 10);
                        let reconstructed = ((imm20 as u32) << 12).wrapping_add(imm as u32);
                        assert_eq!(reconstructed, target_addr);
                    }
                    other => panic!("expected addi, got {other:?}"),
                }
            }
            other => panic!("expected lui, got {other:?}"),
        }
    }

    #[test]
    fn forward_branch_resolves_to_a_positive_pc_relative_offset() {
        let source = "beq x1, x2, skip\naddi x3, x0, 1\nskip:\nhalt\n";
        let program = assemble(source).unwrap();
        match program.text[0] {
            Instr::Branch { offset, .. } => assert_eq!(offset, 8),
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn backward_loop_resolves_to_a_negative_pc_relative_offset() {
        let source = "loop:\naddi x1, x1, -1\nbne x1, x0, loop\nhalt\n";
        let program = assemble(source).unwrap();
        match program.text[1] {
            Instr::Branch { offset, .. } => assert_eq!(offset, -4),
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn undefined_label_is_reported_with_its_line() {
        let err = assemble("jal ra, nowhere\n").unwrap_err();
        assert_eq!(
            err,
            AssembleError::UndefinedLabel {
                line: 1,
                label: "nowhere".to_string()
            }
        );
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        let err = assemble("frobnicate x1, x2, x3\n").unwrap_err();
        assert!(matches!(err, AssembleError::UnknownMnemonic { .. }));
    }

    #[test]
    fn wrong_operand_count_is_rejected() {
        let err = assemble("add x1, x2\n").unwrap_err();
        assert_eq!(
            err,
            AssembleError::WrongOperandCount {
                line: 1,
                mnemonic: "add".to_string(),
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn out_of_range_immediate_is_rejected() {
        let err = assemble("addi x1, x0, 4096\n").unwrap_err();
        assert!(matches!(err, AssembleError::ImmediateOutOfRange { .. }));
    }

    #[test]
    fn misaligned_branch_target_is_rejected() {
        // A single odd .byte pushes the label one byte off 2-byte alignment.
        let source = ".data\n.byte 1\nskip:\n.text\nbeq x0, x0, skip\n";
        let err = assemble(source).unwrap_err();
        // `skip` lands in DATA at an odd address relative to nothing
        // text-side, but the branch offset itself must still be even: the
        // branch is 4 bytes from its own address to a data label 0x10001,
        // which is not reachable at all, so this resolves as out-of-range
        // or misaligned depending on arithmetic; assert it is rejected.
        assert!(matches!(
            err,
            AssembleError::MisalignedTarget { .. } | AssembleError::ImmediateOutOfRange { .. }
        ));
    }

    #[test]
    fn hex_and_binary_literals_parse() {
        let program = assemble("addi x1, x0, 0x2A\naddi x2, x0, 0b101010\n").unwrap();
        assert_eq!(
            program.text[0],
            Instr::RegImm {
                op: AluOp::Add,
                rd: 1,
                rs1: 0,
                imm: 42
            }
        );
        assert_eq!(
            program.text[1],
            Instr::RegImm {
                op: AluOp::Add,
                rd: 2,
                rs1: 0,
                imm: 42
            }
        );
    }

    #[test]
    fn char_literal_with_escape_parses_as_its_byte_value() {
        let program = assemble("addi x1, x0, '\\n'\n").unwrap();
        assert_eq!(
            program.text[0],
            Instr::RegImm {
                op: AluOp::Add,
                rd: 1,
                rs1: 0,
                imm: 10
            }
        );
    }

    #[test]
    fn word_directive_emits_little_endian_bytes() {
        let program = assemble(".data\n.word 0x11223344\n").unwrap();
        assert_eq!(program.data, vec![0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn word_directive_can_reference_a_label() {
        let program = assemble(".data\nhere:\n.word here\n").unwrap();
        let addr = program.symbols["here"];
        assert_eq!(u32::from_le_bytes(program.data[..4].try_into().unwrap()), addr);
    }

    #[test]
    fn string_directive_emits_bytes_plus_nul() {
        let program = assemble(".data\n.string \"hi\\n\"\n").unwrap();
        assert_eq!(program.data, vec![b'h', b'i', b'\n', 0]);
    }

    #[test]
    fn byte_directive_emits_one_byte_per_operand() {
        let program = assemble(".data\n.byte 1, 2, 0xff\n").unwrap();
        assert_eq!(program.data, vec![1, 2, 0xff]);
    }

    #[test]
    fn unterminated_string_is_rejected() {
        let err = assemble(".data\n.string \"oops\n").unwrap_err();
        assert_eq!(err, AssembleError::UnterminatedString { line: 2 });
    }

    #[test]
    fn load_store_offset_base_syntax_parses() {
        let program = assemble("lw x1, 8(x2)\nsw x3, -4(x2)\n").unwrap();
        assert_eq!(
            program.text[0],
            Instr::Load {
                op: LoadOp::Lw,
                rd: 1,
                rs1: 2,
                imm: 8
            }
        );
        assert_eq!(
            program.text[1],
            Instr::Store {
                op: StoreOp::Sw,
                rs1: 2,
                rs2: 3,
                imm: -4
            }
        );
    }

    #[test]
    fn csr_instruction_accepts_a_named_csr() {
        let program = assemble("csrrs x1, mstatus, x0\n").unwrap();
        assert_eq!(
            program.text[0],
            Instr::Csr {
                op: CsrOp::Csrrs,
                rd: 1,
                rs1: 0,
                csr: csr::MSTATUS
            }
        );
    }

    #[test]
    fn register_names_are_case_insensitive_labels_are_not() {
        let program = assemble("Loop:\nADDI X1, x1, 1\nbne x1, x0, Loop\n").unwrap();
        assert_eq!(program.symbols["Loop"], TEXT_START);
        assert!(!program.symbols.contains_key("loop"));
    }

    #[test]
    fn mnemonics_and_directives_are_case_insensitive() {
        let program = assemble(".DATA\n.WORD 7\n.TEXT\nHALT\n").unwrap();
        assert_eq!(program.data, 7u32.to_le_bytes());
        assert_eq!(program.text, vec![Instr::Halt]);
    }
}
