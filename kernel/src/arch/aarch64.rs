// kernel/src/arch/aarch64.rs
//
// AArch64 固有の定義。
// - PSTATE / SPSR のビット配置（EL0t / EL1h、DAIF）
// - ESR の EC / ISS と Exception の変換（WnR、DFSC）
// - syscall 規約（x8 = 番号、x0..x5 = 引数、x0 = 戻り値 / -errno）
// - sigcode の命令語
//
// 変換キャッシュは MIPS と同じソフトウェア管理 TLB としてモデル化する。
// 整数オーバーフロー例外はこのアーキに存在しないので Unknown EC として表す。

use crate::arch::{Exception, HwTrap, RegConv, Vector};
use crate::kernel::context::{CpuRegs, TrapFrame, SF_UC};
use crate::kernel::syscall::{SyscallResult, SYS_SIGRETURN};
use crate::types::{Access, IrqLine, Mode};

pub const TLB_ENTRIES: usize = 64;
pub const ASID_BITS: u32 = 8;
pub const IRQ_LINES: u32 = 64;
/// 非セキュア物理タイマ（CNTPNSIRQ）の線番号
pub const TIMER_IRQ: IrqLine = 30;

// --- PSTATE ---
pub const PSR_M_MASK: u64 = 0xf;
pub const PSR_M_EL0T: u64 = 0x0;
pub const PSR_M_EL1H: u64 = 0x5;
pub const PSR_F: u64 = 1 << 6;
pub const PSR_I: u64 = 1 << 7;
pub const PSR_A: u64 = 1 << 8;
pub const PSR_D: u64 = 1 << 9;
pub const PSR_DAIF: u64 = PSR_D | PSR_A | PSR_I | PSR_F;
pub const PSR_NZCV: u64 = 0xf << 28;

// --- ESR ---
pub const ESR_EC_SHIFT: u64 = 26;
pub const ESR_EC_MASK: u64 = 0x3f << ESR_EC_SHIFT;
pub const ESR_IL: u64 = 1 << 25;
pub const ESR_ISS_MASK: u64 = 0x01ff_ffff;

pub const EC_UNKNOWN: u64 = 0x00;
pub const EC_FP_ACCESS: u64 = 0x07;
pub const EC_SVC64: u64 = 0x15;
pub const EC_IABT_LOW: u64 = 0x20;
pub const EC_IABT_CUR: u64 = 0x21;
pub const EC_PC_ALIGN: u64 = 0x22;
pub const EC_DABT_LOW: u64 = 0x24;
pub const EC_DABT_CUR: u64 = 0x25;
pub const EC_SP_ALIGN: u64 = 0x26;
pub const EC_FP_EXC64: u64 = 0x2c;
pub const EC_BRK: u64 = 0x3c;

/// ISS の WnR（書き込みで起きた data abort）
pub const ISS_WNR: u64 = 1 << 6;
pub const ISS_FSC_MASK: u64 = 0x3f;

// --- DFSC / IFSC ---
pub const FSC_ADDR_SIZE_L0: u64 = 0x00;
pub const FSC_TRANSLATION_L3: u64 = 0x07;
pub const FSC_PERMISSION_L3: u64 = 0x0f;
pub const FSC_SYNC_EXTERNAL: u64 = 0x10;
pub const FSC_ALIGNMENT: u64 = 0x21;

/// brk #1 は trap 命令扱い（SIGTRAP ではなく条件トラップ）
pub const BRK_TRAP_IMM: u64 = 1;

// --- レジスタ番号 ---
pub const X0: usize = 0;
pub const X8: usize = 8;
pub const FP: usize = 29;
pub const LR: usize = 30;
/// sp_el0 は gpr[31] に置く
pub const SP: usize = 31;

pub static CONV: RegConv = RegConv {
    sp: SP,
    fp: FP,
    gp: None,
    ra: LR,
    sysno: X8,
    args: &[0, 1, 2, 3, 4, 5],
    ret: X0,
    err: None,
    call_target: None,
};

// --- sigcode ---
const fn add_x0_sp(imm: u32) -> u32 {
    0x9100_03e0 | ((imm & 0xfff) << 10)
}

const fn movz_x8(imm: u32) -> u32 {
    0xd280_0000 | ((imm & 0xffff) << 5) | 8
}

const INSN_SVC0: u32 = 0xd400_0001;
const INSN_BRK0: u32 = 0xd420_0000;

/// add x0, sp, #SF_UC ; movz x8, #SYS_SIGRETURN ; svc #0 ; brk #0
pub const SIGCODE: [u32; 4] = [
    add_x0_sp(SF_UC as u32),
    movz_x8(SYS_SIGRETURN),
    INSN_SVC0,
    INSN_BRK0,
];

pub fn user_status() -> u64 {
    PSR_M_EL0T
}

pub fn kernel_status() -> u64 {
    PSR_M_EL1H | PSR_DAIF
}

pub fn mode_of(sr: u64) -> Mode {
    if (sr & PSR_M_MASK) == PSR_M_EL0T {
        Mode::User
    } else {
        Mode::Kernel
    }
}

pub fn irq_enabled(sr: u64) -> bool {
    (sr & PSR_I) == 0
}

pub fn with_irq(sr: u64, enabled: bool) -> u64 {
    if enabled {
        sr & !PSR_I
    } else {
        sr | PSR_I
    }
}

/// ユーザが変えてよいのは条件フラグだけ
pub fn sanitize_user_status(sr: u64) -> u64 {
    (sr & PSR_NZCV) | PSR_M_EL0T
}

pub fn status_is_sane(sr: u64) -> bool {
    let m = sr & PSR_M_MASK;
    if m != PSR_M_EL0T && m != PSR_M_EL1H {
        return false;
    }
    if (sr & !(PSR_M_MASK | PSR_DAIF | PSR_NZCV)) != 0 {
        return false;
    }
    if m == PSR_M_EL0T {
        return (sr & PSR_DAIF) == 0;
    }
    true
}

fn esr(ec: u64, iss: u64) -> u64 {
    ((ec << ESR_EC_SHIFT) & ESR_EC_MASK) | ESR_IL | (iss & ESR_ISS_MASK)
}

pub fn encode(exc: Exception, from_user: bool) -> HwTrap {
    let dabt = if from_user { EC_DABT_LOW } else { EC_DABT_CUR };
    let iabt = if from_user { EC_IABT_LOW } else { EC_IABT_CUR };
    let sync = |syndrome: u64, badvaddr: u64| HwTrap {
        vector: Vector::General,
        syndrome,
        badvaddr,
    };
    let wnr = |access: Access| if access.is_write() { ISS_WNR } else { 0 };
    let abort = |va: u64, access: Access, fsc: u64| {
        if access == Access::Fetch {
            sync(esr(iabt, fsc), va)
        } else {
            sync(esr(dabt, fsc | wnr(access)), va)
        }
    };

    match exc {
        Exception::TlbMiss { va, access } => abort(va, access, FSC_TRANSLATION_L3),
        Exception::TlbModified { va } => abort(va, Access::Store, FSC_PERMISSION_L3),
        Exception::ReadInhibit { va } => abort(va, Access::Load, FSC_PERMISSION_L3),
        Exception::ExecInhibit { va } => abort(va, Access::Fetch, FSC_PERMISSION_L3),
        Exception::AddressError { va, access } => {
            if access == Access::Fetch {
                sync(esr(EC_PC_ALIGN, 0), va)
            } else if va % 8 != 0 {
                abort(va, access, FSC_ALIGNMENT)
            } else {
                abort(va, access, FSC_ADDR_SIZE_L0)
            }
        }
        Exception::BusError { va, access } => abort(va, access, FSC_SYNC_EXTERNAL),
        Exception::Syscall => sync(esr(EC_SVC64, 0), 0),
        Exception::Breakpoint => sync(esr(EC_BRK, 0), 0),
        Exception::TrapInstruction => sync(esr(EC_BRK, BRK_TRAP_IMM), 0),
        Exception::ReservedInstruction | Exception::Overflow => sync(esr(EC_UNKNOWN, 0), 0),
        Exception::CopUnusable(_) => sync(esr(EC_FP_ACCESS, 0), 0),
        Exception::FpuException => sync(esr(EC_FP_EXC64, 0), 0),
        Exception::Interrupt => HwTrap {
            vector: Vector::Irq,
            syndrome: 0,
            badvaddr: 0,
        },
        Exception::Unknown(ec) => sync(esr(ec, 0), 0),
    }
}

fn decode_abort(va: u64, iss: u64, access: Access) -> Exception {
    let fsc = iss & ISS_FSC_MASK;
    match fsc {
        0x04..=0x07 => Exception::TlbMiss { va, access },
        0x0c..=0x0f => match access {
            Access::Fetch => Exception::ExecInhibit { va },
            Access::Store => Exception::TlbModified { va },
            Access::Load => Exception::ReadInhibit { va },
        },
        0x00..=0x03 | FSC_ALIGNMENT => Exception::AddressError { va, access },
        FSC_SYNC_EXTERNAL => Exception::BusError { va, access },
        other => Exception::Unknown(other),
    }
}

pub fn decode(tf: &TrapFrame) -> Exception {
    if Vector::from_u64(tf.vector) == Vector::Irq {
        return Exception::Interrupt;
    }

    let ec = (tf.cause & ESR_EC_MASK) >> ESR_EC_SHIFT;
    let iss = tf.cause & ESR_ISS_MASK;
    let va = tf.badvaddr;
    match ec {
        EC_SVC64 => Exception::Syscall,
        EC_DABT_LOW | EC_DABT_CUR => {
            let access = if (iss & ISS_WNR) != 0 {
                Access::Store
            } else {
                Access::Load
            };
            decode_abort(va, iss, access)
        }
        EC_IABT_LOW | EC_IABT_CUR => decode_abort(va, iss, Access::Fetch),
        EC_PC_ALIGN => Exception::AddressError {
            va,
            access: Access::Fetch,
        },
        EC_SP_ALIGN => Exception::AddressError {
            va,
            access: Access::Load,
        },
        EC_BRK => {
            if (iss & 0xffff) == BRK_TRAP_IMM {
                Exception::TrapInstruction
            } else {
                Exception::Breakpoint
            }
        }
        EC_UNKNOWN => Exception::ReservedInstruction,
        EC_FP_ACCESS => Exception::CopUnusable(1),
        EC_FP_EXC64 => Exception::FpuException,
        other => Exception::Unknown(other),
    }
}

/// 例外からの戻り先（ELR）。svc だけは次の命令を指す。
pub fn exception_return_pc(regs: &CpuRegs, syndrome: u64) -> u64 {
    let ec = (syndrome & ESR_EC_MASK) >> ESR_EC_SHIFT;
    if ec == EC_SVC64 {
        regs.pc.wrapping_add(4)
    } else {
        regs.pc
    }
}

/// ELR はすでに svc の次を指している。再実行は 4 戻す。
pub fn set_syscall_result(regs: &mut CpuRegs, res: SyscallResult) {
    match res {
        SyscallResult::Ok(v) => regs.gpr[X0] = v,
        SyscallResult::Err(errno) => regs.gpr[X0] = (errno as i64).wrapping_neg() as u64,
        SyscallResult::Restart => regs.pc = regs.pc.wrapping_sub(4),
        SyscallResult::JustReturn => {}
    }
}
