//! User-mode execution of the emulated hart.
//!
//! User code is a sequence of fixed-width 16-byte instructions living in the
//! process's own address space, fetched and executed here with the register
//! file in the trap frame and the program counter in `trapframe.epc`. Every
//! fetch, load and store is translated through the process page table, so
//! copy-on-write and lazy-allocation faults arise exactly where hardware
//! would raise them; the interpreter reports the cause and leaves `epc`
//! untouched so the instruction retries after the kernel's repair.
//!
//! The encoding: byte 0 opcode, bytes 1-3 register operands, bytes 8-15 a
//! little-endian 64-bit immediate (value, address offset, or branch target).

use core::convert::TryInto;

use crate::addr::UVAddr;
use crate::cpu;
use crate::proc::{KernelCtx, Reg};
use crate::riscv::PGSIZE;
use crate::syscall::{SYS_EXEC, SYS_EXIT};

pub const INSN_SIZE: usize = 16;
static_assertions::const_assert_eq!(PGSIZE % INSN_SIZE, 0);

const OP_LI: u8 = 1;
const OP_ADDI: u8 = 2;
const OP_LD: u8 = 3;
const OP_SD: u8 = 4;
const OP_LB: u8 = 5;
const OP_SB: u8 = 6;
const OP_BEQ: u8 = 7;
const OP_BNE: u8 = 8;
const OP_BLT: u8 = 9;
const OP_JMP: u8 = 10;
const OP_ECALL: u8 = 11;

#[derive(Clone, Copy, Debug)]
pub enum Insn {
    Li { rd: Reg, imm: i64 },
    Addi { rd: Reg, rs: Reg, imm: i64 },
    Ld { rd: Reg, base: Reg, off: i64 },
    Sd { base: Reg, off: i64, rs: Reg },
    Lb { rd: Reg, base: Reg, off: i64 },
    Sb { base: Reg, off: i64, rs: Reg },
    Beq { rs1: Reg, rs2: Reg, target: u64 },
    Bne { rs1: Reg, rs2: Reg, target: u64 },
    Blt { rs1: Reg, rs2: Reg, target: u64 },
    Jmp { target: u64 },
    Ecall,
}

impl Insn {
    pub fn encode(&self) -> [u8; INSN_SIZE] {
        let mut b = [0u8; INSN_SIZE];
        let (op, rd, rs1, rs2, imm) = match *self {
            Insn::Li { rd, imm } => (OP_LI, rd as u8, 0, 0, imm),
            Insn::Addi { rd, rs, imm } => (OP_ADDI, rd as u8, rs as u8, 0, imm),
            Insn::Ld { rd, base, off } => (OP_LD, rd as u8, base as u8, 0, off),
            Insn::Sd { base, off, rs } => (OP_SD, 0, base as u8, rs as u8, off),
            Insn::Lb { rd, base, off } => (OP_LB, rd as u8, base as u8, 0, off),
            Insn::Sb { base, off, rs } => (OP_SB, 0, base as u8, rs as u8, off),
            Insn::Beq { rs1, rs2, target } => (OP_BEQ, 0, rs1 as u8, rs2 as u8, target as i64),
            Insn::Bne { rs1, rs2, target } => (OP_BNE, 0, rs1 as u8, rs2 as u8, target as i64),
            Insn::Blt { rs1, rs2, target } => (OP_BLT, 0, rs1 as u8, rs2 as u8, target as i64),
            Insn::Jmp { target } => (OP_JMP, 0, 0, 0, target as i64),
            Insn::Ecall => (OP_ECALL, 0, 0, 0, 0),
        };
        b[0] = op;
        b[1] = rd;
        b[2] = rs1;
        b[3] = rs2;
        b[8..16].copy_from_slice(&imm.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8; INSN_SIZE]) -> Result<Insn, ()> {
        let rd = Reg::from_index(b[1]).ok_or(())?;
        let rs1 = Reg::from_index(b[2]).ok_or(())?;
        let rs2 = Reg::from_index(b[3]).ok_or(())?;
        let imm = i64::from_le_bytes(b[8..16].try_into().map_err(|_| ())?);
        Ok(match b[0] {
            OP_LI => Insn::Li { rd, imm },
            OP_ADDI => Insn::Addi { rd, rs: rs1, imm },
            OP_LD => Insn::Ld { rd, base: rs1, off: imm },
            OP_SD => Insn::Sd { base: rs1, off: imm, rs: rs2 },
            OP_LB => Insn::Lb { rd, base: rs1, off: imm },
            OP_SB => Insn::Sb { base: rs1, off: imm, rs: rs2 },
            OP_BEQ => Insn::Beq { rs1, rs2, target: imm as u64 },
            OP_BNE => Insn::Bne { rs1, rs2, target: imm as u64 },
            OP_BLT => Insn::Blt { rs1, rs2, target: imm as u64 },
            OP_JMP => Insn::Jmp { target: imm as u64 },
            OP_ECALL => Insn::Ecall,
            _ => return Err(()),
        })
    }
}

/// Why the hart left user mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scause {
    /// environment call from U-mode
    Ecall,
    /// timer interrupt delivered at an instruction boundary
    TimerIntr,
    LoadPageFault(usize),
    StorePageFault(usize),
    InstructionPageFault(usize),
    IllegalInstruction(usize),
}

/// Run the current process in user mode until a trap arises. The cause is
/// returned with all user state saved in the trap frame; on page faults
/// `epc` still points at the faulting instruction so it retries after
/// repair.
pub fn run(ctx: &mut KernelCtx<'_>) -> Scause {
    let kernel = ctx.kernel();

    // the "sret": user mode runs with interrupts enabled
    // SAFETY: no spinlock is held on the way out of the kernel.
    unsafe { cpu::intr_on() };

    loop {
        // A dying machine or a pending timer interrupt preempts the process
        // at the instruction boundary.
        if kernel.is_halted() {
            return Scause::TimerIntr;
        }
        if cpu::intr_get() && kernel.cpus().take_tick(cpu::cpuid()) {
            return Scause::TimerIntr;
        }

        let epc = ctx.proc().trap_frame().epc;
        let mut raw = [0u8; INSN_SIZE];
        if ctx
            .proc()
            .memory()
            .fetch(UVAddr::new(epc as usize), &mut raw)
            .is_err()
        {
            return Scause::InstructionPageFault(epc as usize);
        }
        let insn = match Insn::decode(&raw) {
            Ok(insn) => insn,
            Err(()) => return Scause::IllegalInstruction(epc as usize),
        };

        let mut next = epc.wrapping_add(INSN_SIZE as u64);
        match insn {
            Insn::Li { rd, imm } => {
                ctx.proc_mut().trap_frame_mut().set(rd, imm as u64);
            }
            Insn::Addi { rd, rs, imm } => {
                let v = ctx.proc().trap_frame().get(rs).wrapping_add(imm as u64);
                ctx.proc_mut().trap_frame_mut().set(rd, v);
            }
            Insn::Ld { rd, base, off } => {
                let va = ctx
                    .proc()
                    .trap_frame()
                    .get(base)
                    .wrapping_add(off as u64) as usize;
                match ctx.proc().memory().load_u64(UVAddr::new(va)) {
                    Ok(v) => ctx.proc_mut().trap_frame_mut().set(rd, v),
                    Err(()) => return Scause::LoadPageFault(va),
                }
            }
            Insn::Sd { base, off, rs } => {
                let tf = ctx.proc().trap_frame();
                let va = tf.get(base).wrapping_add(off as u64) as usize;
                let v = tf.get(rs);
                if ctx.proc().memory().store_u64(UVAddr::new(va), v).is_err() {
                    return Scause::StorePageFault(va);
                }
            }
            Insn::Lb { rd, base, off } => {
                let va = ctx
                    .proc()
                    .trap_frame()
                    .get(base)
                    .wrapping_add(off as u64) as usize;
                match ctx.proc().memory().load_u8(UVAddr::new(va)) {
                    Ok(v) => ctx.proc_mut().trap_frame_mut().set(rd, v as u64),
                    Err(()) => return Scause::LoadPageFault(va),
                }
            }
            Insn::Sb { base, off, rs } => {
                let tf = ctx.proc().trap_frame();
                let va = tf.get(base).wrapping_add(off as u64) as usize;
                let v = tf.get(rs) as u8;
                if ctx.proc().memory().store_u8(UVAddr::new(va), v).is_err() {
                    return Scause::StorePageFault(va);
                }
            }
            Insn::Beq { rs1, rs2, target } => {
                let tf = ctx.proc().trap_frame();
                if tf.get(rs1) == tf.get(rs2) {
                    next = target;
                }
            }
            Insn::Bne { rs1, rs2, target } => {
                let tf = ctx.proc().trap_frame();
                if tf.get(rs1) != tf.get(rs2) {
                    next = target;
                }
            }
            Insn::Blt { rs1, rs2, target } => {
                let tf = ctx.proc().trap_frame();
                if (tf.get(rs1) as i64) < (tf.get(rs2) as i64) {
                    next = target;
                }
            }
            Insn::Jmp { target } => {
                next = target;
            }
            Insn::Ecall => {
                // epc stays on the ecall; the trap path advances it
                return Scause::Ecall;
            }
        }
        ctx.proc_mut().trap_frame_mut().epc = next;
    }
}

/// A label in a program under assembly: a branch target or the address of a
/// data item.
#[derive(Clone, Copy)]
pub struct Label(usize);

enum Fixup {
    /// patch the instruction's immediate with the label's address
    Imm(usize, Label),
    /// patch the instruction's branch target with the label's address
    Target(usize, Label),
}

/// A small assembler for user programs: instructions first, data (e.g.
/// strings) placed after the code, labels resolved at `finish`.
pub struct Asm {
    insns: Vec<Insn>,
    labels: Vec<Option<u64>>,
    fixups: Vec<Fixup>,
    data: Vec<(Label, Vec<u8>)>,
}

impl Asm {
    pub fn new() -> Self {
        Self {
            insns: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the address of the next instruction.
    pub fn bind(&mut self, l: Label) {
        assert!(self.labels[l.0].is_none(), "asm: label bound twice");
        self.labels[l.0] = Some((self.insns.len() * INSN_SIZE) as u64);
    }

    /// Bind and return a label here.
    pub fn here(&mut self) -> Label {
        let l = self.new_label();
        self.bind(l);
        l
    }

    /// Append a data item after the code; its address becomes the label's
    /// value. Items are 8-byte aligned so `Ld`/`Sd` can reach them.
    pub fn data_label(&mut self, bytes: &[u8]) -> Label {
        let l = self.new_label();
        self.data.push((l, bytes.to_vec()));
        l
    }

    pub fn li(&mut self, rd: Reg, imm: i64) {
        self.insns.push(Insn::Li { rd, imm });
    }

    /// Load a label's address into a register.
    pub fn la(&mut self, rd: Reg, l: Label) {
        self.fixups.push(Fixup::Imm(self.insns.len(), l));
        self.insns.push(Insn::Li { rd, imm: 0 });
    }

    pub fn addi(&mut self, rd: Reg, rs: Reg, imm: i64) {
        self.insns.push(Insn::Addi { rd, rs, imm });
    }

    pub fn ld(&mut self, rd: Reg, base: Reg, off: i64) {
        self.insns.push(Insn::Ld { rd, base, off });
    }

    pub fn sd(&mut self, base: Reg, off: i64, rs: Reg) {
        self.insns.push(Insn::Sd { base, off, rs });
    }

    pub fn lb(&mut self, rd: Reg, base: Reg, off: i64) {
        self.insns.push(Insn::Lb { rd, base, off });
    }

    pub fn sb(&mut self, base: Reg, off: i64, rs: Reg) {
        self.insns.push(Insn::Sb { base, off, rs });
    }

    pub fn beq(&mut self, rs1: Reg, rs2: Reg, l: Label) {
        self.fixups.push(Fixup::Target(self.insns.len(), l));
        self.insns.push(Insn::Beq { rs1, rs2, target: 0 });
    }

    pub fn bne(&mut self, rs1: Reg, rs2: Reg, l: Label) {
        self.fixups.push(Fixup::Target(self.insns.len(), l));
        self.insns.push(Insn::Bne { rs1, rs2, target: 0 });
    }

    pub fn blt(&mut self, rs1: Reg, rs2: Reg, l: Label) {
        self.fixups.push(Fixup::Target(self.insns.len(), l));
        self.insns.push(Insn::Blt { rs1, rs2, target: 0 });
    }

    pub fn jmp(&mut self, l: Label) {
        self.fixups.push(Fixup::Target(self.insns.len(), l));
        self.insns.push(Insn::Jmp { target: 0 });
    }

    pub fn ecall(&mut self) {
        self.insns.push(Insn::Ecall);
    }

    /// Resolve labels and produce the program bytes: code, then data.
    pub fn finish(mut self) -> Vec<u8> {
        // place data items after the code, 8-byte aligned
        let mut end = self.insns.len() * INSN_SIZE;
        for (l, bytes) in &self.data {
            self.labels[l.0] = Some(end as u64);
            end += (bytes.len() + 7) & !7;
        }

        for fixup in &self.fixups {
            match fixup {
                Fixup::Imm(i, l) => {
                    let addr = self.labels[l.0].expect("asm: unbound label");
                    if let Insn::Li { imm, .. } = &mut self.insns[*i] {
                        *imm = addr as i64;
                    } else {
                        panic!("asm: bad fixup");
                    }
                }
                Fixup::Target(i, l) => {
                    let addr = self.labels[l.0].expect("asm: unbound label");
                    match &mut self.insns[*i] {
                        Insn::Beq { target, .. }
                        | Insn::Bne { target, .. }
                        | Insn::Blt { target, .. }
                        | Insn::Jmp { target } => *target = addr,
                        _ => panic!("asm: bad fixup"),
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(end);
        for insn in &self.insns {
            out.extend_from_slice(&insn.encode());
        }
        for (_, bytes) in &self.data {
            out.extend_from_slice(bytes);
            while out.len() % 8 != 0 {
                out.push(0);
            }
        }
        out
    }
}

/// The first user program: exec("/init"); exit(-1) if that fails.
pub fn initcode() -> Vec<u8> {
    let mut a = Asm::new();
    let path = a.data_label(b"/init\0");
    a.la(Reg::A0, path);
    a.li(Reg::A1, 0);
    a.li(Reg::A7, SYS_EXEC as i64);
    a.ecall();
    // exec failed
    let spin = a.here();
    a.li(Reg::A7, SYS_EXIT as i64);
    a.li(Reg::A0, -1);
    a.ecall();
    a.jmp(spin);
    a.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let insns = [
            Insn::Li { rd: Reg::A0, imm: -7 },
            Insn::Sd { base: Reg::Sp, off: 16, rs: Reg::A1 },
            Insn::Beq { rs1: Reg::A0, rs2: Reg::Zero, target: 0x40 },
            Insn::Ecall,
        ];
        for insn in &insns {
            let decoded = Insn::decode(&insn.encode()).expect("decode");
            assert_eq!(insn.encode(), decoded.encode());
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut b = [0u8; INSN_SIZE];
        b[0] = 0xff;
        assert!(Insn::decode(&b).is_err());
        // bad register index
        b[0] = OP_LI;
        b[1] = 77;
        assert!(Insn::decode(&b).is_err());
    }

    #[test]
    fn asm_resolves_forward_and_data_labels() {
        let mut a = Asm::new();
        let end = a.new_label();
        let msg = a.data_label(b"hi\0");
        a.la(Reg::A0, msg);
        a.jmp(end);
        a.li(Reg::A0, 99);
        a.bind(end);
        a.ecall();
        let bytes = a.finish();

        // 4 instructions, then the string
        assert_eq!(&bytes[4 * INSN_SIZE..4 * INSN_SIZE + 3], b"hi\0");

        // la got the data address, jmp skips the li
        let la = Insn::decode(bytes[..INSN_SIZE].try_into().unwrap()).unwrap();
        match la {
            Insn::Li { imm, .. } => assert_eq!(imm as usize, 4 * INSN_SIZE),
            _ => panic!("expected li"),
        }
        let jmp = Insn::decode(bytes[INSN_SIZE..2 * INSN_SIZE].try_into().unwrap()).unwrap();
        match jmp {
            Insn::Jmp { target } => assert_eq!(target as usize, 3 * INSN_SIZE),
            _ => panic!("expected jmp"),
        }
    }
}
