// kernel/src/arch/mod.rs
//
// アーキ依存部。サポートするアーキは閉じた集合（Arch）で表し、
// 入口/出口コードの能力 {capture_trap, restore_context, install_signal_trampoline}
// を Arch の match で 1 回ずつ実装する（継承ではなくタグ付き分岐）。
//
// - mips / aarch64: ステータスワード、例外コード、syscall 規約、sigcode
// - cpu: レジスタファイル・割り込み禁止区間・IRQ 線のモデル
// - tlb: ソフトウェア管理 TLB のモデル
// - virt_layout: カーネル側の仮想アドレス窓

pub mod aarch64;
pub mod cpu;
pub mod mips;
pub mod tlb;
pub mod virt_layout;

use core::fmt;

use crate::kernel::context::{CpuRegs, TrapFrame};
use crate::kernel::syscall::{SyscallArgs, SyscallResult};
use crate::mem::addr::PhysFrame;
use crate::mm::{BusError, PhysMemory};
use crate::types::{Access, IrqLine, Mode};

use self::cpu::Cpu;

/// サポートするアーキテクチャ
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    /// MIPS32r2（Malta 相当）
    Mips32,
    /// AArch64（RPi3 相当）
    AArch64,
}

/// 例外ベクタ（どこから入ったか）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vector {
    /// MIPS の TLB refill 専用ベクタ
    TlbRefill,
    /// 同期例外（MIPS general / AArch64 sync）
    General,
    /// 非同期割り込み
    Irq,
}

impl Vector {
    pub const fn as_u64(self) -> u64 {
        match self {
            Vector::TlbRefill => 0,
            Vector::General => 1,
            Vector::Irq => 2,
        }
    }

    pub const fn from_u64(v: u64) -> Vector {
        match v {
            0 => Vector::TlbRefill,
            2 => Vector::Irq,
            _ => Vector::General,
        }
    }
}

/// ハードウェアが例外時に見せる生の値
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwTrap {
    pub vector: Vector,
    /// MIPS Cause / AArch64 ESR
    pub syndrome: u64,
    /// MIPS BadVAddr / AArch64 FAR
    pub badvaddr: u64,
}

/// アーキ非依存に分類した例外原因
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    /// TLB に該当エントリが無い（refill 対象）
    TlbMiss { va: u64, access: Access },
    /// dirty でないエントリへの書き込み
    TlbModified { va: u64 },
    /// 読み出し禁止ページからの load
    ReadInhibit { va: u64 },
    /// 実行禁止ページからの fetch
    ExecInhibit { va: u64 },
    /// アラインメント違反 / 特権外アドレス
    AddressError { va: u64, access: Access },
    BusError { va: u64, access: Access },
    Syscall,
    Breakpoint,
    ReservedInstruction,
    TrapInstruction,
    /// コプロセッサ使用不可（1 = FPU）
    CopUnusable(u8),
    FpuException,
    /// 整数オーバーフロー（MIPS add/sub）
    Overflow,
    Interrupt,
    /// 分類できなかった生の原因コード
    Unknown(u64),
}

impl Exception {
    /// 障害アドレスを持つ例外ならそれを返す
    pub fn fault_va(&self) -> Option<u64> {
        match *self {
            Exception::TlbMiss { va, .. }
            | Exception::TlbModified { va }
            | Exception::ReadInhibit { va }
            | Exception::ExecInhibit { va }
            | Exception::AddressError { va, .. }
            | Exception::BusError { va, .. } => Some(va),
            _ => None,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::TlbMiss { va, access } => write!(f, "tlb miss ({}) va={:#x}", access, va),
            Exception::TlbModified { va } => write!(f, "tlb modified va={:#x}", va),
            Exception::ReadInhibit { va } => write!(f, "read inhibit va={:#x}", va),
            Exception::ExecInhibit { va } => write!(f, "exec inhibit va={:#x}", va),
            Exception::AddressError { va, access } => {
                write!(f, "address error ({}) va={:#x}", access, va)
            }
            Exception::BusError { va, access } => write!(f, "bus error ({}) va={:#x}", access, va),
            Exception::Syscall => write!(f, "syscall"),
            Exception::Breakpoint => write!(f, "breakpoint"),
            Exception::ReservedInstruction => write!(f, "reserved instruction"),
            Exception::TrapInstruction => write!(f, "trap instruction"),
            Exception::CopUnusable(n) => write!(f, "coprocessor {} unusable", n),
            Exception::FpuException => write!(f, "fpu exception"),
            Exception::Overflow => write!(f, "integer overflow"),
            Exception::Interrupt => write!(f, "interrupt"),
            Exception::Unknown(code) => write!(f, "unknown cause {:#x}", code),
        }
    }
}

/// レジスタ使用規約（呼び出し規約 + syscall 規約）
#[derive(Debug)]
pub struct RegConv {
    pub sp: usize,
    pub fp: usize,
    /// MIPS の gp（AArch64 には無い）
    pub gp: Option<usize>,
    /// 戻りアドレス（MIPS ra / AArch64 lr）
    pub ra: usize,
    pub sysno: usize,
    pub args: &'static [usize],
    pub ret: usize,
    /// MIPS の a3（エラーフラグ）
    pub err: Option<usize>,
    /// PIC 呼び出しで関数アドレスを期待するレジスタ（MIPS t9）
    pub call_target: Option<usize>,
}

impl Arch {
    pub const ALL: [Arch; 2] = [Arch::Mips32, Arch::AArch64];

    pub fn name(self) -> &'static str {
        match self {
            Arch::Mips32 => "mips32",
            Arch::AArch64 => "aarch64",
        }
    }

    pub fn conv(self) -> &'static RegConv {
        match self {
            Arch::Mips32 => &mips::CONV,
            Arch::AArch64 => &aarch64::CONV,
        }
    }

    /// ハードウェア TLB のエントリ数
    pub fn tlb_entries(self) -> usize {
        match self {
            Arch::Mips32 => mips::TLB_ENTRIES,
            Arch::AArch64 => aarch64::TLB_ENTRIES,
        }
    }

    /// ASID のビット幅
    pub fn asid_bits(self) -> u32 {
        match self {
            Arch::Mips32 => mips::ASID_BITS,
            Arch::AArch64 => aarch64::ASID_BITS,
        }
    }

    /// 割り込み線の本数
    pub fn irq_lines(self) -> u32 {
        match self {
            Arch::Mips32 => mips::IRQ_LINES,
            Arch::AArch64 => aarch64::IRQ_LINES,
        }
    }

    /// タイマが繋がっている割り込み線
    pub fn timer_irq(self) -> IrqLine {
        match self {
            Arch::Mips32 => mips::TIMER_IRQ,
            Arch::AArch64 => aarch64::TIMER_IRQ,
        }
    }

    // ─────────────────────────────────────────
    // ステータスワード
    // ─────────────────────────────────────────

    /// ユーザに戻るときの初期ステータス（割り込み許可）
    pub fn user_status(self) -> u64 {
        match self {
            Arch::Mips32 => mips::user_status(),
            Arch::AArch64 => aarch64::user_status(),
        }
    }

    /// カーネルモード・割り込み禁止のステータス
    pub fn kernel_status(self) -> u64 {
        match self {
            Arch::Mips32 => mips::kernel_status(),
            Arch::AArch64 => aarch64::kernel_status(),
        }
    }

    pub fn mode_of(self, sr: u64) -> Mode {
        match self {
            Arch::Mips32 => mips::mode_of(sr),
            Arch::AArch64 => aarch64::mode_of(sr),
        }
    }

    pub fn irq_enabled(self, sr: u64) -> bool {
        match self {
            Arch::Mips32 => mips::irq_enabled(sr),
            Arch::AArch64 => aarch64::irq_enabled(sr),
        }
    }

    /// sr の割り込み許可ビットだけを差し替える
    pub fn with_irq(self, sr: u64, enabled: bool) -> u64 {
        match self {
            Arch::Mips32 => mips::with_irq(sr, enabled),
            Arch::AArch64 => aarch64::with_irq(sr, enabled),
        }
    }

    /// ユーザから渡されたステータスワードを、ユーザが変えてよいビットだけに絞る
    pub fn sanitize_user_status(self, sr: u64) -> u64 {
        match self {
            Arch::Mips32 => mips::sanitize_user_status(sr),
            Arch::AArch64 => aarch64::sanitize_user_status(sr),
        }
    }

    /// 復元してよいステータスワードか（switch 時の整合性チェック）
    pub fn status_is_sane(self, sr: u64) -> bool {
        match self {
            Arch::Mips32 => mips::status_is_sane(sr),
            Arch::AArch64 => aarch64::status_is_sane(sr),
        }
    }

    // ─────────────────────────────────────────
    // 例外コード
    // ─────────────────────────────────────────

    /// 例外をこのアーキのハードウェア表現にする。
    ///
    /// pending は割り込み時に Cause.IP へ載せる保留線（MIPS のみ使用）。
    pub fn encode(self, exc: Exception, from_user: bool, pending: u64) -> HwTrap {
        match self {
            Arch::Mips32 => mips::encode(exc, pending),
            Arch::AArch64 => aarch64::encode(exc, from_user),
        }
    }

    /// 捕捉フレームから例外原因を復元する
    pub fn decode(self, tf: &TrapFrame) -> Exception {
        match self {
            Arch::Mips32 => mips::decode(tf),
            Arch::AArch64 => aarch64::decode(tf),
        }
    }

    // ─────────────────────────────────────────
    // syscall 規約
    // ─────────────────────────────────────────

    pub fn syscall_args(self, regs: &CpuRegs) -> SyscallArgs {
        let conv = self.conv();
        let mut args = [0u64; 6];
        for (dst, &r) in args.iter_mut().zip(conv.args.iter()) {
            *dst = regs.gpr[r];
        }
        SyscallArgs {
            code: regs.gpr[conv.sysno],
            args,
        }
    }

    /// syscall の結果をレジスタに書き、pc を進める / 巻き戻す
    pub fn set_syscall_result(self, regs: &mut CpuRegs, res: SyscallResult) {
        match self {
            Arch::Mips32 => mips::set_syscall_result(regs, res),
            Arch::AArch64 => aarch64::set_syscall_result(regs, res),
        }
    }

    // ─────────────────────────────────────────
    // 入口/出口コードの能力集合
    // ─────────────────────────────────────────

    /// 例外入口: ライブのレジスタファイルを TrapFrame に捕捉し、
    /// CPU をカーネルモード・割り込み禁止に切り替える。
    pub fn capture_trap(self, cpu: &mut Cpu, hw: &HwTrap) -> TrapFrame {
        let prev_mode = self.mode_of(cpu.regs.sr);
        let mut regs = cpu.regs;
        if self == Arch::AArch64 {
            // ELR は svc の次の命令を指す
            regs.pc = aarch64::exception_return_pc(&regs, hw.syndrome);
        }

        cpu.regs.sr = self.kernel_status();

        TrapFrame {
            regs,
            cause: hw.syndrome,
            badvaddr: hw.badvaddr,
            vector: hw.vector.as_u64(),
            prev_mode: prev_mode.as_u64(),
        }
    }

    /// 例外出口（eret）:TrapFrame の状態をそのままライブに戻す。
    pub fn restore_context(self, cpu: &mut Cpu, tf: &TrapFrame) {
        cpu.regs = tf.regs;
        if self == Arch::Mips32 {
            cpu.regs.gpr[0] = 0;
        }
    }

    /// sigcode をこのアーキの命令列で物理フレームに書き込む。
    pub fn install_signal_trampoline(
        self,
        mem: &mut dyn PhysMemory,
        frame: PhysFrame,
    ) -> Result<(), BusError> {
        mem.zero_frame(frame)?;
        for (i, word) in self.sigcode().iter().enumerate() {
            mem.write_u32(frame.at(i as u64 * 4), *word)?;
        }
        Ok(())
    }

    /// シグナル復帰トランポリンの命令語
    pub fn sigcode(self) -> [u32; 4] {
        match self {
            Arch::Mips32 => mips::SIGCODE,
            Arch::AArch64 => aarch64::SIGCODE,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// CPU を停止させるループ
pub fn halt_loop() -> ! {
    cpu::halt_loop()
}
