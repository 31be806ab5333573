//! The saved user register state of one process.

use crate::riscv::PGSIZE;

/// The RISC-V integer register file, by ABI name. x0 is hardwired to zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reg {
    Zero,
    Ra,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
    T3,
    T4,
    T5,
    T6,
}

impl Reg {
    /// Decode a 5-bit register index.
    pub fn from_index(i: u8) -> Option<Reg> {
        use Reg::*;
        Some(match i {
            0 => Zero,
            1 => Ra,
            2 => Sp,
            3 => Gp,
            4 => Tp,
            5 => T0,
            6 => T1,
            7 => T2,
            8 => S0,
            9 => S1,
            10 => A0,
            11 => A1,
            12 => A2,
            13 => A3,
            14 => A4,
            15 => A5,
            16 => A6,
            17 => A7,
            18 => S2,
            19 => S3,
            20 => S4,
            21 => S5,
            22 => S6,
            23 => S7,
            24 => S8,
            25 => S9,
            26 => S10,
            27 => S11,
            28 => T3,
            29 => T4,
            30 => T5,
            31 => T6,
            _ => return None,
        })
    }
}

/// Per-process data for the trap handling code. Sits in a page by itself,
/// mapped at TRAPFRAME in the user page table (not user-accessible), so the
/// trap path can always locate the saved state of the interrupted process.
#[derive(Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// saved user program counter
    pub epc: u64,

    /// the hart that most recently entered the kernel for this process
    pub kernel_hartid: u64,

    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

static_assertions::const_assert!(core::mem::size_of::<TrapFrame>() <= PGSIZE);

impl TrapFrame {
    pub fn new() -> Self {
        // SAFETY: TrapFrame is all plain integers.
        unsafe { core::mem::zeroed() }
    }

    pub fn get(&self, r: Reg) -> u64 {
        use Reg::*;
        match r {
            Zero => 0,
            Ra => self.ra,
            Sp => self.sp,
            Gp => self.gp,
            Tp => self.tp,
            T0 => self.t0,
            T1 => self.t1,
            T2 => self.t2,
            S0 => self.s0,
            S1 => self.s1,
            A0 => self.a0,
            A1 => self.a1,
            A2 => self.a2,
            A3 => self.a3,
            A4 => self.a4,
            A5 => self.a5,
            A6 => self.a6,
            A7 => self.a7,
            S2 => self.s2,
            S3 => self.s3,
            S4 => self.s4,
            S5 => self.s5,
            S6 => self.s6,
            S7 => self.s7,
            S8 => self.s8,
            S9 => self.s9,
            S10 => self.s10,
            S11 => self.s11,
            T3 => self.t3,
            T4 => self.t4,
            T5 => self.t5,
            T6 => self.t6,
        }
    }

    pub fn set(&mut self, r: Reg, v: u64) {
        use Reg::*;
        match r {
            // writes to x0 are discarded
            Zero => {}
            Ra => self.ra = v,
            Sp => self.sp = v,
            Gp => self.gp = v,
            Tp => self.tp = v,
            T0 => self.t0 = v,
            T1 => self.t1 = v,
            T2 => self.t2 = v,
            S0 => self.s0 = v,
            S1 => self.s1 = v,
            A0 => self.a0 = v,
            A1 => self.a1 = v,
            A2 => self.a2 = v,
            A3 => self.a3 = v,
            A4 => self.a4 = v,
            A5 => self.a5 = v,
            A6 => self.a6 = v,
            A7 => self.a7 = v,
            S2 => self.s2 = v,
            S3 => self.s3 = v,
            S4 => self.s4 = v,
            S5 => self.s5 = v,
            S6 => self.s6 = v,
            S7 => self.s7 = v,
            S8 => self.s8 = v,
            S9 => self.s9 = v,
            S10 => self.s10 = v,
            S11 => self.s11 = v,
            T3 => self.t3 = v,
            T4 => self.t4 = v,
            T5 => self.t5 = v,
            T6 => self.t6 = v,
        }
    }
}
