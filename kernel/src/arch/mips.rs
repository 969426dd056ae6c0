// kernel/src/arch/mips.rs
//
// MIPS32r2 固有の定義。
// - CP0 Status / Cause のビット配置
// - ExcCode <-> Exception の変換
// - o32 の syscall 規約（v0 = 番号 / 戻り値、a3 = エラーフラグ）
// - sigcode の命令語

use crate::arch::{Exception, HwTrap, RegConv, Vector};
use crate::kernel::context::{TrapFrame, SF_UC};
use crate::kernel::syscall::{SyscallResult, SYS_SIGRETURN};
use crate::types::{Access, IrqLine, Mode};

pub const TLB_ENTRIES: usize = 16;
pub const ASID_BITS: u32 = 8;
/// IP0..IP7（IP0/IP1 はソフトウェア割り込み）
pub const IRQ_LINES: u32 = 8;
/// CP0 Count/Compare は IP7 に繋がっている
pub const TIMER_IRQ: IrqLine = 7;

// --- Status ---
pub const SR_IE: u64 = 1 << 0;
pub const SR_EXL: u64 = 1 << 1;
pub const SR_ERL: u64 = 1 << 2;
pub const SR_KSU_MASK: u64 = 0x18;
pub const SR_KSU_USER: u64 = 0x10;
pub const SR_IM_MASK: u64 = 0xff00;
pub const SR_CU0: u64 = 1 << 28;
pub const SR_CU1: u64 = 1 << 29;

// --- Cause ---
pub const CR_EXC_CODE_SHIFT: u64 = 2;
pub const CR_EXC_CODE_MASK: u64 = 0x1f << CR_EXC_CODE_SHIFT;
pub const CR_IP_SHIFT: u64 = 8;
pub const CR_IP_MASK: u64 = 0xff << CR_IP_SHIFT;
pub const CR_CE_SHIFT: u64 = 28;
pub const CR_CE_MASK: u64 = 0x3 << CR_CE_SHIFT;

// --- ExcCode ---
pub const EXC_INT: u64 = 0;
pub const EXC_MOD: u64 = 1;
pub const EXC_TLBL: u64 = 2;
pub const EXC_TLBS: u64 = 3;
pub const EXC_ADEL: u64 = 4;
pub const EXC_ADES: u64 = 5;
pub const EXC_IBE: u64 = 6;
pub const EXC_DBE: u64 = 7;
pub const EXC_SYS: u64 = 8;
pub const EXC_BP: u64 = 9;
pub const EXC_RI: u64 = 10;
pub const EXC_CPU: u64 = 11;
pub const EXC_OV: u64 = 12;
pub const EXC_TR: u64 = 13;
pub const EXC_FPE: u64 = 15;
pub const EXC_TLBRI: u64 = 19;
pub const EXC_TLBXI: u64 = 20;

// --- レジスタ番号 ---
pub const ZERO: usize = 0;
pub const V0: usize = 2;
pub const A0: usize = 4;
pub const A1: usize = 5;
pub const A2: usize = 6;
pub const A3: usize = 7;
pub const T9: usize = 25;
pub const GP: usize = 28;
pub const SP: usize = 29;
pub const FP: usize = 30;
pub const RA: usize = 31;

pub static CONV: RegConv = RegConv {
    sp: SP,
    fp: FP,
    gp: Some(GP),
    ra: RA,
    sysno: V0,
    args: &[A0, A1, A2, A3],
    ret: V0,
    err: Some(A3),
    call_target: Some(T9),
};

// --- sigcode ---
const OP_ADDIU: u32 = 0x09 << 26;
const INSN_SYSCALL: u32 = 0x0000_000c;
const INSN_BREAK: u32 = 0x0000_000d;

const fn addiu(rt: usize, rs: usize, imm: u16) -> u32 {
    OP_ADDIU | ((rs as u32) << 21) | ((rt as u32) << 16) | imm as u32
}

/// addiu a0, sp, SF_UC ; addiu v0, zero, SYS_SIGRETURN ; syscall ; break
pub const SIGCODE: [u32; 4] = [
    addiu(A0, SP, SF_UC as u16),
    addiu(V0, ZERO, SYS_SIGRETURN as u16),
    INSN_SYSCALL,
    INSN_BREAK,
];

pub fn user_status() -> u64 {
    SR_KSU_USER | SR_IM_MASK | SR_IE
}

pub fn kernel_status() -> u64 {
    SR_IM_MASK | SR_CU0
}

pub fn mode_of(sr: u64) -> Mode {
    if (sr & SR_KSU_MASK) == SR_KSU_USER && (sr & (SR_EXL | SR_ERL)) == 0 {
        Mode::User
    } else {
        Mode::Kernel
    }
}

pub fn irq_enabled(sr: u64) -> bool {
    (sr & SR_IE) != 0 && (sr & (SR_EXL | SR_ERL)) == 0
}

pub fn with_irq(sr: u64, enabled: bool) -> u64 {
    if enabled {
        sr | SR_IE
    } else {
        sr & !SR_IE
    }
}

/// ユーザは Status のどのビットも選べない。常にユーザモード・割り込み許可に戻す。
pub fn sanitize_user_status(_sr: u64) -> u64 {
    user_status()
}

pub fn status_is_sane(sr: u64) -> bool {
    let ksu = sr & SR_KSU_MASK;
    if ksu != 0 && ksu != SR_KSU_USER {
        return false;
    }
    if (sr & SR_ERL) != 0 {
        return false;
    }
    if ksu == SR_KSU_USER {
        // ユーザは必ず割り込み許可・EXL クリアで走る
        return (sr & SR_EXL) == 0 && (sr & SR_IE) != 0;
    }
    true
}

fn cause(code: u64) -> u64 {
    (code << CR_EXC_CODE_SHIFT) & CR_EXC_CODE_MASK
}

pub fn encode(exc: Exception, pending: u64) -> HwTrap {
    let general = |syndrome: u64, badvaddr: u64| HwTrap {
        vector: Vector::General,
        syndrome,
        badvaddr,
    };

    match exc {
        Exception::TlbMiss { va, access } => HwTrap {
            vector: Vector::TlbRefill,
            syndrome: cause(if access.is_write() { EXC_TLBS } else { EXC_TLBL }),
            badvaddr: va,
        },
        Exception::TlbModified { va } => general(cause(EXC_MOD), va),
        Exception::ReadInhibit { va } => general(cause(EXC_TLBRI), va),
        Exception::ExecInhibit { va } => general(cause(EXC_TLBXI), va),
        Exception::AddressError { va, access } => general(
            cause(if access.is_write() { EXC_ADES } else { EXC_ADEL }),
            va,
        ),
        Exception::BusError { va, access } => general(
            cause(if access == Access::Fetch { EXC_IBE } else { EXC_DBE }),
            va,
        ),
        Exception::Syscall => general(cause(EXC_SYS), 0),
        Exception::Breakpoint => general(cause(EXC_BP), 0),
        Exception::ReservedInstruction => general(cause(EXC_RI), 0),
        Exception::TrapInstruction => general(cause(EXC_TR), 0),
        Exception::CopUnusable(n) => general(
            cause(EXC_CPU) | (((n as u64) << CR_CE_SHIFT) & CR_CE_MASK),
            0,
        ),
        Exception::FpuException => general(cause(EXC_FPE), 0),
        Exception::Overflow => general(cause(EXC_OV), 0),
        Exception::Interrupt => general(
            cause(EXC_INT) | ((pending << CR_IP_SHIFT) & CR_IP_MASK),
            0,
        ),
        Exception::Unknown(code) => general(cause(code), 0),
    }
}

/// TLBL / AdEL は load と fetch を区別しない。BadVAddr == EPC なら命令フェッチ。
fn load_or_fetch(tf: &TrapFrame) -> Access {
    if tf.badvaddr == tf.regs.pc {
        Access::Fetch
    } else {
        Access::Load
    }
}

pub fn decode(tf: &TrapFrame) -> Exception {
    let code = (tf.cause & CR_EXC_CODE_MASK) >> CR_EXC_CODE_SHIFT;
    let va = tf.badvaddr;
    match code {
        EXC_INT => Exception::Interrupt,
        EXC_MOD => Exception::TlbModified { va },
        EXC_TLBL => Exception::TlbMiss {
            va,
            access: load_or_fetch(tf),
        },
        EXC_TLBS => Exception::TlbMiss {
            va,
            access: Access::Store,
        },
        EXC_ADEL => Exception::AddressError {
            va,
            access: load_or_fetch(tf),
        },
        EXC_ADES => Exception::AddressError {
            va,
            access: Access::Store,
        },
        EXC_IBE => Exception::BusError {
            va,
            access: Access::Fetch,
        },
        EXC_DBE => Exception::BusError {
            va,
            access: Access::Load,
        },
        EXC_SYS => Exception::Syscall,
        EXC_BP => Exception::Breakpoint,
        EXC_RI => Exception::ReservedInstruction,
        EXC_CPU => Exception::CopUnusable(((tf.cause & CR_CE_MASK) >> CR_CE_SHIFT) as u8),
        EXC_OV => Exception::Overflow,
        EXC_TR => Exception::TrapInstruction,
        EXC_FPE => Exception::FpuException,
        EXC_TLBRI => Exception::ReadInhibit { va },
        EXC_TLBXI => Exception::ExecInhibit { va },
        other => Exception::Unknown(other),
    }
}

/// Cause.IP に載っている保留線
pub fn pending_lines(cause_word: u64) -> u64 {
    (cause_word & CR_IP_MASK) >> CR_IP_SHIFT
}

/// EPC は syscall 命令自身を指すので、完了時は 4 進める。再実行時はそのまま。
pub fn set_syscall_result(regs: &mut crate::kernel::context::CpuRegs, res: SyscallResult) {
    match res {
        SyscallResult::Ok(v) => {
            regs.gpr[V0] = v;
            regs.gpr[A3] = 0;
            regs.pc = regs.pc.wrapping_add(4);
        }
        SyscallResult::Err(errno) => {
            regs.gpr[V0] = errno as u64;
            regs.gpr[A3] = 1;
            regs.pc = regs.pc.wrapping_add(4);
        }
        SyscallResult::Restart => {}
        SyscallResult::JustReturn => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::context::CpuRegs;

    fn frame_for(exc: Exception, pc: u64) -> TrapFrame {
        let hw = encode(exc, 0);
        let mut tf = TrapFrame::default();
        tf.cause = hw.syndrome;
        tf.badvaddr = hw.badvaddr;
        tf.vector = hw.vector.as_u64();
        tf.regs.pc = pc;
        tf
    }

    #[test]
    fn sigcode_words_match_hand_assembly() {
        assert_eq!(SIGCODE[0], 0x27a4_0018);
        assert_eq!(SIGCODE[1], 0x2402_0000 | SYS_SIGRETURN);
        assert_eq!(SIGCODE[2], 0x0000_000c);
        assert_eq!(SIGCODE[3], 0x0000_000d);
    }

    #[test]
    fn tlbl_at_epc_is_instruction_fetch() {
        let tf = frame_for(Exception::TlbMiss { va: 0x40_0000, access: Access::Fetch }, 0x40_0000);
        assert_eq!(tf.vector, Vector::TlbRefill.as_u64());
        assert_eq!(
            decode(&tf),
            Exception::TlbMiss { va: 0x40_0000, access: Access::Fetch }
        );

        let tf = frame_for(Exception::TlbMiss { va: 0x50_0000, access: Access::Load }, 0x40_0000);
        assert_eq!(
            decode(&tf),
            Exception::TlbMiss { va: 0x50_0000, access: Access::Load }
        );
    }

    #[test]
    fn coprocessor_number_travels_in_ce() {
        let tf = frame_for(Exception::CopUnusable(1), 0);
        assert_eq!(tf.cause, (EXC_CPU << 2) | (1 << 28));
        assert_eq!(decode(&tf), Exception::CopUnusable(1));
    }

    #[test]
    fn interrupt_carries_pending_lines_in_ip() {
        let hw = encode(Exception::Interrupt, 0b1000_0100);
        assert_eq!(pending_lines(hw.syndrome), 0b1000_0100);
    }

    #[test]
    fn status_words() {
        assert_eq!(mode_of(user_status()), Mode::User);
        assert!(irq_enabled(user_status()));
        assert_eq!(mode_of(user_status() | SR_EXL), Mode::Kernel);
        assert!(!irq_enabled(user_status() | SR_EXL));
        assert_eq!(mode_of(kernel_status()), Mode::Kernel);
        assert!(status_is_sane(kernel_status()));
        assert!(!status_is_sane(0x08));
        assert!(!status_is_sane(SR_KSU_USER));
        assert_eq!(sanitize_user_status(SR_ERL | SR_CU0), user_status());
    }

    #[test]
    fn syscall_error_sets_a3_and_skips_instruction() {
        let mut regs = CpuRegs::zeroed();
        regs.pc = 0x40_0010;
        set_syscall_result(&mut regs, SyscallResult::Err(14));
        assert_eq!(regs.gpr[V0], 14);
        assert_eq!(regs.gpr[A3], 1);
        assert_eq!(regs.pc, 0x40_0014);

        let mut regs = CpuRegs::zeroed();
        regs.pc = 0x40_0010;
        set_syscall_result(&mut regs, SyscallResult::Restart);
        assert_eq!(regs.pc, 0x40_0010);
    }
}
