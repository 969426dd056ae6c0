// src/arch/cpu.rs
//
// プロセッサのモデル。
// - ライブのレジスタファイル（整数 + FPU）と、ステータスワードが表すモード/割り込み許可
// - 割り込み禁止区間（CriticalSection トークン）
// - 割り込み線（IrqController）
//
// このレイヤの唯一の並行制御は「割り込み禁止」。ロックではない。
// TLB / ASID 表の変更は CriticalSection を持っている間だけ許す。

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::Arch;
use crate::kernel::context::{CpuRegs, FpuState};
use crate::types::{IrqLine, Mode};

/// 割り込み禁止区間に入っていることの証明。
///
/// - Cpu::mask() でしか作れない
/// - Copy / Clone ではないので、区間の出口（Cpu::restore）で 1 回だけ消費される
#[derive(Debug)]
pub struct CriticalSection {
    prev_sr: u64,
}

impl CriticalSection {
    /// 区間に入る前のステータスワード
    pub fn prev_status(&self) -> u64 {
        self.prev_sr
    }
}

pub struct Cpu {
    arch: Arch,
    /// ライブの整数レジスタ（sr = Status / PSTATE）
    pub regs: CpuRegs,
    /// ライブの FPU レジスタ
    pub fpu: FpuState,
    /// FPU が使用可能か（MIPS CU1 / AArch64 CPACR.FPEN）
    pub fpu_enabled: bool,
    /// 最後の保存以降に FPU が書き換えられたか
    pub fpu_dirty: bool,
    halted: bool,
}

impl Cpu {
    /// リセット直後: カーネルモード・割り込み禁止・FPU 有効
    pub fn new(arch: Arch) -> Self {
        let mut regs = CpuRegs::zeroed();
        regs.sr = arch.kernel_status();
        Cpu {
            arch,
            regs,
            fpu: FpuState::zeroed(),
            fpu_enabled: true,
            fpu_dirty: false,
            halted: false,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn mode(&self) -> Mode {
        self.arch.mode_of(self.regs.sr)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.arch.irq_enabled(self.regs.sr)
    }

    /// 割り込みを禁止して区間に入る（入れ子可）
    pub fn mask(&mut self) -> CriticalSection {
        let prev_sr = self.regs.sr;
        self.regs.sr = self.arch.with_irq(prev_sr, false);
        CriticalSection { prev_sr }
    }

    /// 区間を出て、入る前の割り込み許可状態に戻す
    pub fn restore(&mut self, cs: CriticalSection) {
        let was_enabled = self.arch.irq_enabled(cs.prev_sr);
        self.regs.sr = self.arch.with_irq(self.regs.sr, was_enabled);
    }

    /// 区間を出て、ステータスワードを丸ごと差し替える（コンテキスト切り替えの出口）
    pub fn restore_status(&mut self, cs: CriticalSection, sr: u64) {
        let CriticalSection { .. } = cs;
        self.regs.sr = sr;
    }

    /// クロージャ版。区間の中で Cpu と CriticalSection の両方を渡す。
    pub fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Cpu, &CriticalSection) -> R) -> R {
        let cs = self.mask();
        let r = f(self, &cs);
        self.restore(cs);
        r
    }

    pub fn halt(&mut self) {
        self.regs.sr = self.arch.with_irq(self.regs.sr, false);
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

/// 割り込み線の保留状態。デバイス側（別コンテキスト）からも立てられる。
///
/// - assert: 線を立てる（割り込み禁止中でも失われない）
/// - pending: 保留中の線のビットマスク
/// - ack: 線を下ろす
pub struct IrqController {
    pending: AtomicU64,
    lines: u32,
}

impl IrqController {
    pub const fn new(lines: u32) -> Self {
        IrqController {
            pending: AtomicU64::new(0),
            lines,
        }
    }

    pub fn lines(&self) -> u32 {
        self.lines
    }

    /// 範囲外の線は無視して false を返す
    pub fn assert(&self, line: IrqLine) -> bool {
        if line >= self.lines || line >= 64 {
            return false;
        }
        self.pending.fetch_or(1u64 << line, Ordering::AcqRel);
        true
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn ack(&self, line: IrqLine) {
        if line < 64 {
            self.pending.fetch_and(!(1u64 << line), Ordering::AcqRel);
        }
    }
}

pub fn halt_loop() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
