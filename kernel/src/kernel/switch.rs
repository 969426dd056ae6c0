// kernel/src/kernel/switch.rs
//
// コンテキスト切り替え。
//
// - 割り込み禁止区間の中で、from のライブ状態を SavedContext に保存し、to の SavedContext をライブにする
// - 保存するステータスワードは区間に入る前のもの（割り込み許可状態もそのまま戻る）
// - to のコンテキストは Saved で、ステータスワードが健全でなければならない（違反は致命的）
// - アドレス空間の切り替え（activate）は別操作
//
// FPU:
// - 既定は eager: 毎回保存して毎回復元する
// - feature "lazy_fpu": dirty のときだけ保存し、FPU を無効にして戻る。
//   最初の FPU 命令の CpU 例外で、そのスレッドの状態を載せる。

use crate::kernel::context::FpuState;
use crate::kernel::thread::{ContextState, Thread};
use crate::kernel::{KernelFault, LogEvent, Processor};
use crate::types::Tid;

const LAZY_FPU: bool = cfg!(feature = "lazy_fpu");

impl Processor {
    /// 最初のスレッドを載せる（どのスレッドも走っていないプロセッサで 1 回だけ）
    pub fn start(&mut self, to: &mut Thread) -> Result<(), KernelFault> {
        if self.cpu.is_halted() {
            return Err(KernelFault::Halted);
        }
        let cs = self.cpu.mask();
        if self.current.is_some() || !self.can_resume(to) {
            self.cpu.restore(cs);
            let k = KernelFault::CorruptedContext { tid: to.tid };
            self.fatal_here(k);
            return Err(k);
        }
        self.install(to, cs, None);
        Ok(())
    }

    /// from（いま走っている）から to（保存済み）へ切り替える
    pub fn switch(&mut self, from: &mut Thread, to: &mut Thread) -> Result<(), KernelFault> {
        if self.cpu.is_halted() {
            return Err(KernelFault::Halted);
        }
        let cs = self.cpu.mask();

        let bad = if self.current != Some(from.tid) || !from.is_live() {
            Some(from.tid)
        } else if !self.can_resume(to) {
            Some(to.tid)
        } else {
            None
        };
        if let Some(tid) = bad {
            self.cpu.restore(cs);
            let k = KernelFault::CorruptedContext { tid };
            self.fatal_here(k);
            return Err(k);
        }

        from.ctx.regs = self.cpu.regs;
        from.ctx.regs.sr = cs.prev_status();
        self.fpu_save(from);
        from.state = ContextState::Saved;

        self.install(to, cs, Some(from.tid));
        Ok(())
    }

    fn can_resume(&self, t: &Thread) -> bool {
        t.state == ContextState::Saved && self.arch.status_is_sane(t.ctx.regs.sr)
    }

    fn install(&mut self, to: &mut Thread, cs: crate::arch::cpu::CriticalSection, from: Option<Tid>) {
        self.cpu.regs = to.ctx.regs;
        self.fpu_load(to);
        to.state = ContextState::Live;
        self.current = Some(to.tid);

        self.timer.reset_slice();
        self.need_resched = false;
        self.stats.switches += 1;
        self.push_event(LogEvent::Switched { from, to: to.tid });

        // 区間の出口: 割り込み許可状態は to のステータスワードに従う
        self.cpu.restore_status(cs, to.ctx.regs.sr);
    }

    fn fpu_save(&mut self, from: &mut Thread) {
        let owned = self.fpu_owner == Some(from.tid) && self.cpu.fpu_enabled;
        if owned && (!LAZY_FPU || self.cpu.fpu_dirty) {
            from.ctx.fpu = self.cpu.fpu;
        }
        self.fpu_owner = None;
        self.cpu.fpu_dirty = false;
    }

    fn fpu_load(&mut self, to: &Thread) {
        if LAZY_FPU {
            self.cpu.fpu_enabled = false;
        } else {
            self.cpu.fpu = to.ctx.fpu;
            self.cpu.fpu_enabled = true;
            self.fpu_owner = Some(to.tid);
        }
        self.cpu.fpu_dirty = false;
    }

    /// CpU 例外（コプロセッサ 1）: FPU を有効にして t の状態を載せる
    pub(crate) fn fpu_acquire(&mut self, t: &Thread) {
        if self.fpu_owner != Some(t.tid) {
            self.cpu.fpu = t.ctx.fpu;
            self.fpu_owner = Some(t.tid);
            self.cpu.fpu_dirty = false;
        }
        self.cpu.fpu_enabled = true;
    }

    /// スレッドの FPU 状態（プロセッサが持っていればライブの値）
    pub fn fpu_snapshot(&self, t: &Thread) -> FpuState {
        if self.fpu_owner == Some(t.tid) && self.cpu.fpu_enabled {
            self.cpu.fpu
        } else {
            t.ctx.fpu
        }
    }

    /// スレッドの FPU 状態を差し替える（sigreturn）
    pub fn fpu_store(&mut self, t: &mut Thread, st: FpuState) {
        if self.fpu_owner == Some(t.tid) && self.cpu.fpu_enabled {
            self.cpu.fpu = st;
            self.cpu.fpu_dirty = true;
        }
        t.ctx.fpu = st;
    }
}
