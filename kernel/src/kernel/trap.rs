// kernel/src/kernel/trap.rs
//
// トラップディスパッチャ。
//
// 1 回のトラップ:
//   capture_trap（ライブ → TrapFrame、割り込み禁止・カーネルモード）
//   → 原因の分類（TrapClass）と入れ子検査
//   → 処理（refill / syscall / フォルト → シグナル / 割り込み線）
//   → ユーザへ戻るなら AST（シグナル配送・再スケジュール判定）
//   → restore_context（TrapFrame → ライブ）
//
// 割り込み禁止区間で立った線は保留のまま残り、
// 出口で割り込みが許可された時点でまとめて取る（失われない）。
//
// ユーザ命令のモデル（user_load / user_store / user_fetch / user_fpu_write）は、
// アドレス変換に失敗したらそのまま例外を起こし、解決したら命令を再実行する。

use crate::arch::{virt_layout, Exception, HwTrap};
use crate::kernel::context::{TrapFrame, NFPR};
use crate::kernel::signal::{self, post_trap_signal, Signal};
use crate::kernel::{
    trace, FaultError, HookCtx, KernelFault, LogEvent, PageFault, Processor, TrapClass, TrapEnv,
    TrapOutcome,
};
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::address_space::{Pmap, PmapError, Refill};
use crate::mem::layout::USER_SPACE_END;
use crate::mm::PhysMemory;
use crate::types::{Access, IrqLine, Mode};

/// 1 命令あたりの再実行の上限（refill → Modified → ... の連鎖を打ち切る）
///
/// デマンドゼロのストアは 4 回で完了する（未マップ → VM、miss → refill、Modified、完了）。
pub const MAX_FAULT_RETRIES: usize = 8;

/// ユーザ命令を 1 つ実行した結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserOp<T> {
    /// 命令は完了した
    Done(T),
    /// 命令は例外で中断された（スケジューラへの指示付き）
    Trapped(TrapOutcome),
}

impl Processor {
    /// トラップの入口。処理中に保留になった割り込みも、出口で続けて処理する。
    pub fn trap(&mut self, env: &mut TrapEnv<'_>, hw: &HwTrap) -> Result<TrapOutcome, KernelFault> {
        let mut outcome = self.trap_once(env, hw)?;
        while !self.cpu.is_halted() && self.cpu.interrupts_enabled() && self.irq.pending() != 0 {
            let irq = self
                .arch
                .encode(Exception::Interrupt, self.cpu.mode().is_user(), self.irq.pending());
            let o = self.trap_once(env, &irq)?;
            outcome = outcome.merge(o);
        }
        Ok(outcome)
    }

    fn trap_once(&mut self, env: &mut TrapEnv<'_>, hw: &HwTrap) -> Result<TrapOutcome, KernelFault> {
        if self.cpu.is_halted() {
            return Err(KernelFault::Halted);
        }

        let mut tf = self.arch.capture_trap(&mut self.cpu, hw);
        self.stats.traps += 1;
        trace::trace_trap(tf.cause, tf.badvaddr, tf.prev_mode());
        self.push_event(LogEvent::TrapEntered {
            cause: tf.cause,
            from_user: tf.from_user(),
        });

        if tf.from_user() {
            self.ensure_active(env.space);
        }

        let res = match self.dispatch(env, &mut tf) {
            Ok(()) if tf.from_user() => self.userret(env, &mut tf),
            Ok(()) => Ok(TrapOutcome::Resume),
            Err(k) => Err(k),
        };

        match res {
            Ok(outcome) => {
                self.arch.restore_context(&mut self.cpu, &tf);
                Ok(outcome)
            }
            Err(fault) => {
                self.fatal(&tf, fault);
                Err(fault)
            }
        }
    }

    fn dispatch(&mut self, env: &mut TrapEnv<'_>, tf: &mut TrapFrame) -> Result<(), KernelFault> {
        let exc = self.arch.decode(tf);
        let class = TrapClass::of(&exc);

        self.nest.enter(class)?;
        let escalate = self.handle(env, tf, exc);
        self.nest.exit(class);

        // TLB で解決できなかったユーザのフォルトは、一般例外として VM に回す
        if let Some(fault) = escalate? {
            self.nest.enter(TrapClass::Fault)?;
            self.user_page_fault(env, fault);
            self.nest.exit(TrapClass::Fault);
        }
        Ok(())
    }

    fn handle(
        &mut self,
        env: &mut TrapEnv<'_>,
        tf: &mut TrapFrame,
        exc: Exception,
    ) -> Result<Option<PageFault>, KernelFault> {
        let from_user = tf.from_user();
        match exc {
            Exception::Interrupt => {
                self.handle_interrupts(env);
                Ok(None)
            }
            Exception::Syscall if from_user => {
                self.handle_syscall(env, tf)?;
                Ok(None)
            }
            Exception::TlbMiss { va, .. } if !from_user => {
                // onfault の無いカーネルの参照: 表にあれば refill、無ければ致命的
                if self.resolve_tlb(env.space, env.mem, exc)? {
                    return Ok(None);
                }
                Err(KernelFault::KernelPageFault { va })
            }
            Exception::TlbMiss { va, access } => {
                if self.resolve_tlb(env.space, env.mem, exc)? {
                    return Ok(None);
                }
                Ok(Some(PageFault {
                    va,
                    access,
                    mode: Mode::User,
                    kind: FaultError::NotMapped,
                }))
            }
            Exception::TlbModified { va } => {
                if self.resolve_tlb(env.space, env.mem, exc)? {
                    return Ok(None);
                }
                if !from_user {
                    return Err(KernelFault::KernelPageFault { va });
                }
                Ok(Some(PageFault {
                    va,
                    access: Access::Store,
                    mode: Mode::User,
                    kind: FaultError::Protection,
                }))
            }
            Exception::ReadInhibit { va } | Exception::ExecInhibit { va } if from_user => {
                let access = if matches!(exc, Exception::ReadInhibit { .. }) {
                    Access::Load
                } else {
                    Access::Fetch
                };
                Ok(Some(PageFault {
                    va,
                    access,
                    mode: Mode::User,
                    kind: FaultError::Protection,
                }))
            }
            _ if from_user => {
                self.user_exception(env, tf, exc);
                Ok(None)
            }
            _ => Err(KernelFault::UnexpectedKernelTrap(exc)),
        }
    }

    /// TLB refill / Modified のエミュレーション。解決したら true。
    ///
    /// カーネル窓はカーネル pmap、ユーザ空間は space の表を引く。
    pub(crate) fn resolve_tlb(
        &mut self,
        space: &Pmap,
        mem: &mut dyn PhysMemory,
        exc: Exception,
    ) -> Result<bool, KernelFault> {
        let (va, modified) = match exc {
            Exception::TlbMiss { va, .. } => (VirtAddr(va), false),
            Exception::TlbModified { va } => (VirtAddr(va), true),
            _ => return Ok(false),
        };

        let cs = self.cpu.mask();
        let pmap = if virt_layout::is_kernel_mapped(self.arch, va) {
            self.kernel_pmap.as_ref()
        } else if va.0 < USER_SPACE_END {
            Some(space)
        } else {
            None
        };
        let r = match pmap {
            None => Ok(false),
            Some(p) if modified => self.mmu.emulate_modified(&cs, p, mem, va),
            Some(p) => self
                .mmu
                .refill(&cs, p, mem, va)
                .map(|r| matches!(r, Refill::Installed(_))),
        };
        self.cpu.restore(cs);

        match r {
            Ok(done) => Ok(done),
            Err(PmapError::TableCorrupted) => Err(KernelFault::TableCorrupted),
            Err(_) => Ok(false),
        }
    }

    /// VM のフックを呼ぶ。結果はそのまま返す。
    pub(crate) fn call_page_fault_hook(
        &mut self,
        env: &mut TrapEnv<'_>,
        fault: PageFault,
    ) -> Result<(), FaultError> {
        self.stats.page_faults += 1;
        let res = {
            let cx = HookCtx {
                arch: self.arch,
                irq: &self.irq,
                ticks: self.timer.ticks(),
            };
            env.hooks.page_fault(&cx, &fault, env.space, env.mem)
        };
        self.push_event(LogEvent::PageFault {
            va: fault.va,
            access: fault.access,
            resolved: res.is_ok(),
        });
        res
    }

    /// ユーザのページフォルト。VM が解決できなければ SIGSEGV / SIGBUS。
    fn user_page_fault(&mut self, env: &mut TrapEnv<'_>, fault: PageFault) {
        if let Err(kind) = self.call_page_fault_hook(env, fault) {
            let (sig, code) = match kind {
                FaultError::NotMapped => (Signal::SIGSEGV, signal::SEGV_MAPERR),
                FaultError::Protection => (Signal::SIGSEGV, signal::SEGV_ACCERR),
                FaultError::BusError => (Signal::SIGBUS, signal::BUS_OBJERR),
            };
            post_trap_signal(env.thread, sig, code, fault.va);
        }
    }

    /// ページフォルト以外のユーザ例外 → 同期シグナル
    fn user_exception(&mut self, env: &mut TrapEnv<'_>, tf: &TrapFrame, exc: Exception) {
        let pc = tf.regs.pc;
        let (sig, code, addr) = match exc {
            Exception::AddressError { va, .. } if va >= USER_SPACE_END => {
                (Signal::SIGSEGV, signal::SEGV_ACCERR, va)
            }
            Exception::AddressError { va, .. } => (Signal::SIGBUS, signal::BUS_ADRALN, va),
            Exception::BusError { va, .. } => (Signal::SIGBUS, signal::BUS_ADRERR, va),
            Exception::Breakpoint => (Signal::SIGTRAP, signal::TRAP_BRKPT, pc),
            Exception::TrapInstruction => (Signal::SIGILL, signal::ILL_ILLTRP, pc),
            Exception::ReservedInstruction | Exception::Unknown(_) => {
                (Signal::SIGILL, signal::ILL_ILLOPC, pc)
            }
            Exception::CopUnusable(1) => {
                self.fpu_acquire(env.thread);
                return;
            }
            Exception::CopUnusable(_) => (Signal::SIGILL, signal::ILL_COPROC, pc),
            Exception::FpuException => (Signal::SIGFPE, signal::FPE_FLTINV, pc),
            Exception::Overflow => (Signal::SIGFPE, signal::FPE_INTOVF, pc),
            // 残りは handle() で処理済み
            Exception::TlbMiss { .. }
            | Exception::TlbModified { .. }
            | Exception::ReadInhibit { .. }
            | Exception::ExecInhibit { .. }
            | Exception::Syscall
            | Exception::Interrupt => return,
        };
        post_trap_signal(env.thread, sig, code, addr);
    }

    /// 入口の時点で保留だった線を、番号の小さい順に処理する。
    ///
    /// 処理中に新しく立った線はここでは取らない（出口で改めて取る）。
    fn handle_interrupts(&mut self, env: &mut TrapEnv<'_>) {
        let snapshot = self.irq.pending();
        let timer_line = self.arch.timer_irq();

        let mut bits = snapshot;
        while bits != 0 {
            let line: IrqLine = bits.trailing_zeros();
            bits &= !(1u64 << line);
            self.irq.ack(line);
            self.stats.interrupts += 1;

            let handled = if line == timer_line {
                if self.timer.tick() {
                    self.need_resched = true;
                }
                true
            } else {
                let cx = HookCtx {
                    arch: self.arch,
                    irq: &self.irq,
                    ticks: self.timer.ticks(),
                };
                env.hooks.interrupt(&cx, line)
            };

            if !handled {
                // 取り手のいない線は数えて捨てる
                self.stats.stray_interrupts += 1;
                logging::warn("stray interrupt");
                logging::info_u64("line", line as u64);
            }
            trace::trace_irq(line, handled);
            self.push_event(LogEvent::IrqServiced { line, handled });
        }
    }

    // ─────────────────────────────────────────
    // 例外の発生源（命令実行のモデル）
    // ─────────────────────────────────────────

    /// 現在のモードで例外を起こす
    pub fn raise(&mut self, env: &mut TrapEnv<'_>, exc: Exception) -> Result<TrapOutcome, KernelFault> {
        let hw = self.arch.encode(exc, self.cpu.mode().is_user(), self.irq.pending());
        self.trap(env, &hw)
    }

    /// syscall 命令（番号と引数はライブのレジスタに置いておく）
    pub fn syscall(&mut self, env: &mut TrapEnv<'_>) -> Result<TrapOutcome, KernelFault> {
        self.raise(env, Exception::Syscall)
    }

    /// デバイスが線を立てる。割り込みが許可されていればすぐトラップし、
    /// 禁止中なら保留のまま（Ok(None)）。
    pub fn assert_irq(
        &mut self,
        env: &mut TrapEnv<'_>,
        line: IrqLine,
    ) -> Result<Option<TrapOutcome>, KernelFault> {
        if !self.irq.assert(line) {
            return Ok(None);
        }
        if self.cpu.is_halted() || !self.cpu.interrupts_enabled() {
            return Ok(None);
        }
        self.raise(env, Exception::Interrupt).map(Some)
    }

    /// アドレス変換。失敗したら例外を起こし、解決したら再実行する。
    fn user_translate(
        &mut self,
        env: &mut TrapEnv<'_>,
        va: u64,
        access: Access,
        width: u64,
    ) -> Result<UserOp<PhysAddr>, KernelFault> {
        for _ in 0..MAX_FAULT_RETRIES {
            let res = if va % width != 0 {
                Err(Exception::AddressError { va, access })
            } else {
                self.mmu.translate(self.cpu.mode(), VirtAddr(va), access)
            };
            match res {
                Ok(pa) => return Ok(UserOp::Done(pa)),
                Err(exc) => {
                    let outcome = self.raise(env, exc)?;
                    if outcome != TrapOutcome::Resume {
                        return Ok(UserOp::Trapped(outcome));
                    }
                }
            }
        }
        // 解決したはずのフォルトが繰り返す。進まない命令のスレッドは SIGSEGV で落とす
        logging::warn("user access makes no progress; killing thread");
        logging::info_u64("tid", env.thread.tid.0 as u64);
        logging::info_u64("va", va);
        Ok(UserOp::Trapped(self.kill(env.thread, Signal::SIGSEGV, true)))
    }

    /// 整列したロード（width = 1, 2, 4, 8 バイト、リトルエンディアン）
    pub fn user_load(
        &mut self,
        env: &mut TrapEnv<'_>,
        va: u64,
        width: u64,
    ) -> Result<UserOp<u64>, KernelFault> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return self.raise(env, Exception::ReservedInstruction).map(UserOp::Trapped);
        }
        let pa = match self.user_translate(env, va, Access::Load, width)? {
            UserOp::Done(pa) => pa,
            UserOp::Trapped(o) => return Ok(UserOp::Trapped(o)),
        };
        let mut buf = [0u8; 8];
        if env.mem.read(pa, &mut buf[..width as usize]).is_err() {
            let o = self.raise(env, Exception::BusError { va, access: Access::Load })?;
            return Ok(UserOp::Trapped(o));
        }
        Ok(UserOp::Done(u64::from_le_bytes(buf)))
    }

    /// 整列したストア
    pub fn user_store(
        &mut self,
        env: &mut TrapEnv<'_>,
        va: u64,
        width: u64,
        value: u64,
    ) -> Result<UserOp<()>, KernelFault> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return self.raise(env, Exception::ReservedInstruction).map(UserOp::Trapped);
        }
        let pa = match self.user_translate(env, va, Access::Store, width)? {
            UserOp::Done(pa) => pa,
            UserOp::Trapped(o) => return Ok(UserOp::Trapped(o)),
        };
        let bytes = value.to_le_bytes();
        if env.mem.write(pa, &bytes[..width as usize]).is_err() {
            let o = self.raise(env, Exception::BusError { va, access: Access::Store })?;
            return Ok(UserOp::Trapped(o));
        }
        Ok(UserOp::Done(()))
    }

    /// 命令フェッチ（4 バイト）
    pub fn user_fetch(&mut self, env: &mut TrapEnv<'_>, va: u64) -> Result<UserOp<u32>, KernelFault> {
        let pa = match self.user_translate(env, va, Access::Fetch, 4)? {
            UserOp::Done(pa) => pa,
            UserOp::Trapped(o) => return Ok(UserOp::Trapped(o)),
        };
        match env.mem.read_u32(pa) {
            Ok(insn) => Ok(UserOp::Done(insn)),
            Err(_) => {
                let o = self.raise(env, Exception::BusError { va, access: Access::Fetch })?;
                Ok(UserOp::Trapped(o))
            }
        }
    }

    /// FPU レジスタへの書き込み。FPU が使えなければ CpU 例外を起こしてから再実行する。
    pub fn user_fpu_write(
        &mut self,
        env: &mut TrapEnv<'_>,
        reg: usize,
        value: u64,
    ) -> Result<UserOp<()>, KernelFault> {
        for _ in 0..MAX_FAULT_RETRIES {
            if self.cpu.fpu_enabled {
                self.cpu.fpu.fpr[reg % NFPR] = value;
                self.cpu.fpu_dirty = true;
                return Ok(UserOp::Done(()));
            }
            let o = self.raise(env, Exception::CopUnusable(1))?;
            if o != TrapOutcome::Resume {
                return Ok(UserOp::Trapped(o));
            }
        }
        logging::warn("FPU never became usable; killing thread");
        logging::info_u64("tid", env.thread.tid.0 as u64);
        Ok(UserOp::Trapped(self.kill(env.thread, Signal::SIGILL, true)))
    }
}
