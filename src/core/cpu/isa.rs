// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reference instruction set
//!
//! The pipeline only needs to know whether an instruction touches memory and
//! how to run its two access phases. Everything else is behind the
//! [`Decoder`] and [`StaticInst`] traits; [`MicroDecoder`] is a small MIPS-I
//! subset that is enough to drive loads, stores, LL/SC and branches through
//! the memory system. There is no branch delay slot.

use std::fmt;

use crate::core::error::{Fault, Result};
use crate::core::mem::{Addr, Packet, RequestFlags};

/// Register index (0-31, r0 reads as zero)
pub type RegIndex = u8;

/// What an instruction can see of the CPU while it executes
pub trait ExecContext {
    fn read_reg(&self, reg: RegIndex) -> u32;

    fn set_reg(&mut self, reg: RegIndex, value: u32);

    /// Address of the executing instruction
    fn pc(&self) -> Addr;

    /// Redirect the instruction that follows this one
    fn set_next_pc(&mut self, pc: Addr);

    /// Start a data read
    ///
    /// # Returns
    ///
    /// A fault if translation failed; otherwise the access is in flight
    fn read(&mut self, vaddr: Addr, size: usize, flags: RequestFlags) -> Result<Option<Fault>>;

    /// Start a data write of the low `size` bytes of `data`
    fn write(&mut self, vaddr: Addr, size: usize, data: u64, flags: RequestFlags)
        -> Result<Option<Fault>>;

    /// Stop the thread after this instruction
    fn halt(&mut self);
}

/// A decoded instruction
pub trait StaticInst: fmt::Debug + fmt::Display {
    /// Whether the instruction accesses data memory
    fn is_mem_ref(&self) -> bool;

    fn is_data_prefetch(&self) -> bool {
        false
    }

    /// Run a non-memory instruction to completion
    fn execute(&self, xc: &mut dyn ExecContext) -> Result<Option<Fault>>;

    /// First phase of a memory instruction: issue the access
    fn initiate_acc(&self, xc: &mut dyn ExecContext) -> Result<Option<Fault>>;

    /// Second phase of a memory instruction: consume the response
    fn complete_acc(&self, pkt: &Packet, xc: &mut dyn ExecContext) -> Result<Option<Fault>>;
}

/// Turns fetched words into instructions
pub trait Decoder {
    fn decode(&self, word: u32, pc: Addr) -> Box<dyn StaticInst>;
}

#[inline(always)]
fn decode_r_type(word: u32) -> (RegIndex, RegIndex, RegIndex, u8, u8) {
    let rs = ((word >> 21) & 0x1F) as u8;
    let rt = ((word >> 16) & 0x1F) as u8;
    let rd = ((word >> 11) & 0x1F) as u8;
    let shamt = ((word >> 6) & 0x1F) as u8;
    let funct = (word & 0x3F) as u8;
    (rs, rt, rd, shamt, funct)
}

#[inline(always)]
fn decode_i_type(word: u32) -> (u8, RegIndex, RegIndex, u16) {
    let op = ((word >> 26) & 0x3F) as u8;
    let rs = ((word >> 21) & 0x1F) as u8;
    let rt = ((word >> 16) & 0x1F) as u8;
    let imm = (word & 0xFFFF) as u16;
    (op, rs, rt, imm)
}

/// Register-register ALU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Addu,
    Subu,
    And,
    Or,
    Xor,
    Slt,
}

impl AluOp {
    fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Addu => a.wrapping_add(b),
            AluOp::Subu => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Slt => ((a as i32) < (b as i32)) as u32,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Addu => "addu",
            AluOp::Subu => "subu",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Slt => "slt",
        }
    }
}

/// Memory access kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    /// Load word
    Lw,
    /// Load byte unsigned
    Lbu,
    /// Store word
    Sw,
    /// Store byte
    Sb,
    /// Load linked
    Ll,
    /// Store conditional
    Sc,
}

impl MemOp {
    fn size(self) -> usize {
        match self {
            MemOp::Lbu | MemOp::Sb => 1,
            _ => 4,
        }
    }

    fn is_store(self) -> bool {
        matches!(self, MemOp::Sw | MemOp::Sb | MemOp::Sc)
    }

    fn flags(self) -> RequestFlags {
        match self {
            MemOp::Ll | MemOp::Sc => RequestFlags::LOCKED,
            _ => RequestFlags::empty(),
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            MemOp::Lw => "lw",
            MemOp::Lbu => "lbu",
            MemOp::Sw => "sw",
            MemOp::Sb => "sb",
            MemOp::Ll => "ll",
            MemOp::Sc => "sc",
        }
    }
}

/// Instructions of the reference ISA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroInst {
    Nop,
    Sll { rd: RegIndex, rt: RegIndex, shamt: u8 },
    Alu { op: AluOp, rd: RegIndex, rs: RegIndex, rt: RegIndex },
    Addiu { rt: RegIndex, rs: RegIndex, imm: i16 },
    Andi { rt: RegIndex, rs: RegIndex, imm: u16 },
    Ori { rt: RegIndex, rs: RegIndex, imm: u16 },
    Lui { rt: RegIndex, imm: u16 },
    Mem { op: MemOp, rt: RegIndex, base: RegIndex, offset: i16 },
    /// Data prefetch hint (retires without a memory access)
    Pref { base: RegIndex, offset: i16 },
    Beq { rs: RegIndex, rt: RegIndex, offset: i16 },
    Bne { rs: RegIndex, rt: RegIndex, offset: i16 },
    J { target: u32 },
    /// Stop the thread
    Break,
    Illegal { word: u32 },
}

impl MicroInst {
    /// Decode one instruction word
    pub fn decode(word: u32) -> Self {
        let (op, rs, rt, imm) = decode_i_type(word);
        let offset = imm as i16;
        let mem = |op| MicroInst::Mem {
            op,
            rt,
            base: rs,
            offset,
        };

        match op {
            0x00 => {
                let (rs, rt, rd, shamt, funct) = decode_r_type(word);
                let alu = |op| MicroInst::Alu { op, rd, rs, rt };
                match funct {
                    0x00 if word == 0 => MicroInst::Nop,
                    0x00 => MicroInst::Sll { rd, rt, shamt },
                    0x0D => MicroInst::Break,
                    0x21 => alu(AluOp::Addu),
                    0x23 => alu(AluOp::Subu),
                    0x24 => alu(AluOp::And),
                    0x25 => alu(AluOp::Or),
                    0x26 => alu(AluOp::Xor),
                    0x2A => alu(AluOp::Slt),
                    _ => MicroInst::Illegal { word },
                }
            }
            0x02 => MicroInst::J {
                target: word & 0x03FF_FFFF,
            },
            0x04 => MicroInst::Beq { rs, rt, offset },
            0x05 => MicroInst::Bne { rs, rt, offset },
            0x09 => MicroInst::Addiu { rt, rs, imm: offset },
            0x0C => MicroInst::Andi { rt, rs, imm },
            0x0D => MicroInst::Ori { rt, rs, imm },
            0x0F => MicroInst::Lui { rt, imm },
            0x23 => mem(MemOp::Lw),
            0x24 => mem(MemOp::Lbu),
            0x28 => mem(MemOp::Sb),
            0x2B => mem(MemOp::Sw),
            0x30 => mem(MemOp::Ll),
            0x33 => MicroInst::Pref { base: rs, offset },
            0x38 => mem(MemOp::Sc),
            _ => MicroInst::Illegal { word },
        }
    }

    fn effective_addr(xc: &dyn ExecContext, base: RegIndex, offset: i16) -> Addr {
        xc.read_reg(base).wrapping_add(offset as i32 as u32) as Addr
    }

    fn branch_target(pc: Addr, offset: i16) -> Addr {
        (pc as u32)
            .wrapping_add(4)
            .wrapping_add(((offset as i32) << 2) as u32) as Addr
    }
}

impl StaticInst for MicroInst {
    fn is_mem_ref(&self) -> bool {
        matches!(self, MicroInst::Mem { .. } | MicroInst::Pref { .. })
    }

    fn is_data_prefetch(&self) -> bool {
        matches!(self, MicroInst::Pref { .. })
    }

    fn execute(&self, xc: &mut dyn ExecContext) -> Result<Option<Fault>> {
        match *self {
            MicroInst::Nop | MicroInst::Pref { .. } => {}
            MicroInst::Sll { rd, rt, shamt } => {
                let value = xc.read_reg(rt) << shamt;
                xc.set_reg(rd, value);
            }
            MicroInst::Alu { op, rd, rs, rt } => {
                let value = op.apply(xc.read_reg(rs), xc.read_reg(rt));
                xc.set_reg(rd, value);
            }
            MicroInst::Addiu { rt, rs, imm } => {
                let value = xc.read_reg(rs).wrapping_add(imm as i32 as u32);
                xc.set_reg(rt, value);
            }
            MicroInst::Andi { rt, rs, imm } => {
                let value = xc.read_reg(rs) & imm as u32;
                xc.set_reg(rt, value);
            }
            MicroInst::Ori { rt, rs, imm } => {
                let value = xc.read_reg(rs) | imm as u32;
                xc.set_reg(rt, value);
            }
            MicroInst::Lui { rt, imm } => xc.set_reg(rt, (imm as u32) << 16),
            MicroInst::Beq { rs, rt, offset } => {
                if xc.read_reg(rs) == xc.read_reg(rt) {
                    let target = Self::branch_target(xc.pc(), offset);
                    xc.set_next_pc(target);
                }
            }
            MicroInst::Bne { rs, rt, offset } => {
                if xc.read_reg(rs) != xc.read_reg(rt) {
                    let target = Self::branch_target(xc.pc(), offset);
                    xc.set_next_pc(target);
                }
            }
            MicroInst::J { target } => {
                let pc = xc.pc() as u32;
                let dest = (pc.wrapping_add(4) & 0xF000_0000) | (target << 2);
                xc.set_next_pc(dest as Addr);
            }
            MicroInst::Break => xc.halt(),
            MicroInst::Illegal { word } => {
                return Ok(Some(Fault::IllegalInstruction { pc: xc.pc(), word }));
            }
            MicroInst::Mem { .. } => return self.initiate_acc(xc),
        }
        Ok(None)
    }

    fn initiate_acc(&self, xc: &mut dyn ExecContext) -> Result<Option<Fault>> {
        let MicroInst::Mem {
            op,
            rt,
            base,
            offset,
        } = *self
        else {
            return self.execute(xc);
        };

        let addr = Self::effective_addr(xc, base, offset);
        if op.is_store() {
            let data = xc.read_reg(rt) as u64;
            xc.write(addr, op.size(), data, op.flags())
        } else {
            xc.read(addr, op.size(), op.flags())
        }
    }

    fn complete_acc(&self, pkt: &Packet, xc: &mut dyn ExecContext) -> Result<Option<Fault>> {
        if let MicroInst::Mem { op, rt, .. } = *self {
            match op {
                MemOp::Lw | MemOp::Ll => xc.set_reg(rt, pkt.get_uint() as u32),
                MemOp::Lbu => xc.set_reg(rt, (pkt.get_uint() & 0xFF) as u32),
                MemOp::Sc => {
                    let result = pkt.req().sc_result().unwrap_or(1);
                    xc.set_reg(rt, result as u32);
                }
                MemOp::Sw | MemOp::Sb => {}
            }
        }
        Ok(None)
    }
}

impl fmt::Display for MicroInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MicroInst::Nop => write!(f, "nop"),
            MicroInst::Sll { rd, rt, shamt } => write!(f, "sll r{}, r{}, {}", rd, rt, shamt),
            MicroInst::Alu { op, rd, rs, rt } => {
                write!(f, "{} r{}, r{}, r{}", op.mnemonic(), rd, rs, rt)
            }
            MicroInst::Addiu { rt, rs, imm } => write!(f, "addiu r{}, r{}, {}", rt, rs, imm),
            MicroInst::Andi { rt, rs, imm } => write!(f, "andi r{}, r{}, 0x{:04X}", rt, rs, imm),
            MicroInst::Ori { rt, rs, imm } => write!(f, "ori r{}, r{}, 0x{:04X}", rt, rs, imm),
            MicroInst::Lui { rt, imm } => write!(f, "lui r{}, 0x{:04X}", rt, imm),
            MicroInst::Mem {
                op,
                rt,
                base,
                offset,
            } => write!(f, "{} r{}, {}(r{})", op.mnemonic(), rt, offset, base),
            MicroInst::Pref { base, offset } => write!(f, "pref {}(r{})", offset, base),
            MicroInst::Beq { rs, rt, offset } => write!(f, "beq r{}, r{}, {}", rs, rt, offset),
            MicroInst::Bne { rs, rt, offset } => write!(f, "bne r{}, r{}, {}", rs, rt, offset),
            MicroInst::J { target } => write!(f, "j 0x{:07X}", target << 2),
            MicroInst::Break => write!(f, "break"),
            MicroInst::Illegal { word } => write!(f, "illegal 0x{:08X}", word),
        }
    }
}

/// Decoder for [`MicroInst`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroDecoder;

impl Decoder for MicroDecoder {
    fn decode(&self, word: u32, _pc: Addr) -> Box<dyn StaticInst> {
        Box::new(MicroInst::decode(word))
    }
}

/// Instruction encoders for building test programs
pub mod asm {
    use super::RegIndex;

    fn r_type(rs: RegIndex, rt: RegIndex, rd: RegIndex, shamt: u8, funct: u8) -> u32 {
        ((rs as u32 & 0x1F) << 21)
            | ((rt as u32 & 0x1F) << 16)
            | ((rd as u32 & 0x1F) << 11)
            | ((shamt as u32 & 0x1F) << 6)
            | (funct as u32 & 0x3F)
    }

    fn i_type(op: u8, rs: RegIndex, rt: RegIndex, imm: u16) -> u32 {
        ((op as u32) << 26) | ((rs as u32 & 0x1F) << 21) | ((rt as u32 & 0x1F) << 16) | imm as u32
    }

    pub fn nop() -> u32 {
        0
    }

    pub fn sll(rd: RegIndex, rt: RegIndex, shamt: u8) -> u32 {
        r_type(0, rt, rd, shamt, 0x00)
    }

    pub fn addu(rd: RegIndex, rs: RegIndex, rt: RegIndex) -> u32 {
        r_type(rs, rt, rd, 0, 0x21)
    }

    pub fn subu(rd: RegIndex, rs: RegIndex, rt: RegIndex) -> u32 {
        r_type(rs, rt, rd, 0, 0x23)
    }

    pub fn or(rd: RegIndex, rs: RegIndex, rt: RegIndex) -> u32 {
        r_type(rs, rt, rd, 0, 0x25)
    }

    pub fn slt(rd: RegIndex, rs: RegIndex, rt: RegIndex) -> u32 {
        r_type(rs, rt, rd, 0, 0x2A)
    }

    pub fn brk() -> u32 {
        0x0D
    }

    pub fn addiu(rt: RegIndex, rs: RegIndex, imm: i16) -> u32 {
        i_type(0x09, rs, rt, imm as u16)
    }

    pub fn ori(rt: RegIndex, rs: RegIndex, imm: u16) -> u32 {
        i_type(0x0D, rs, rt, imm)
    }

    pub fn lui(rt: RegIndex, imm: u16) -> u32 {
        i_type(0x0F, 0, rt, imm)
    }

    pub fn lw(rt: RegIndex, base: RegIndex, offset: i16) -> u32 {
        i_type(0x23, base, rt, offset as u16)
    }

    pub fn lbu(rt: RegIndex, base: RegIndex, offset: i16) -> u32 {
        i_type(0x24, base, rt, offset as u16)
    }

    pub fn sb(rt: RegIndex, base: RegIndex, offset: i16) -> u32 {
        i_type(0x28, base, rt, offset as u16)
    }

    pub fn sw(rt: RegIndex, base: RegIndex, offset: i16) -> u32 {
        i_type(0x2B, base, rt, offset as u16)
    }

    pub fn ll(rt: RegIndex, base: RegIndex, offset: i16) -> u32 {
        i_type(0x30, base, rt, offset as u16)
    }

    pub fn sc(rt: RegIndex, base: RegIndex, offset: i16) -> u32 {
        i_type(0x38, base, rt, offset as u16)
    }

    pub fn pref(base: RegIndex, offset: i16) -> u32 {
        i_type(0x33, base, 0, offset as u16)
    }

    pub fn beq(rs: RegIndex, rt: RegIndex, offset: i16) -> u32 {
        i_type(0x04, rs, rt, offset as u16)
    }

    pub fn bne(rs: RegIndex, rt: RegIndex, offset: i16) -> u32 {
        i_type(0x05, rs, rt, offset as u16)
    }

    /// Jump to `addr` (same 256 MiB region as the jump)
    pub fn j(addr: u32) -> u32 {
        (0x02 << 26) | ((addr >> 2) & 0x03FF_FFFF)
    }

    /// Little-endian image of a program
    pub fn assemble(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
