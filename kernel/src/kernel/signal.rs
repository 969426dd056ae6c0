// kernel/src/kernel/signal.rs
//
// シグナル（BSD の番号付け）
// - Signal / SigSet / SigAction と、既定動作の表
// - 同期フォルトの投函（post_trap_signal）
// - ユーザへ戻る直前の配送（userret → sendsig）と、sigreturn による復元
//
// 配送の流れ:
//   トラップ処理の最後（ユーザへ戻る直前）に userret が 1 回だけ呼ばれ、
//   配送可能なシグナルを 1 つ選んで、既定動作かハンドラ起動のどちらかを行う。
//   ハンドラ起動時はユーザスタックにシグナルフレームを積み、
//   戻り先を sigcode（全ユーザ空間に読み取り/実行専用で貼ってあるページ）にする。

use core::fmt;

use crate::kernel::context::{
    as_bytes, from_bytes, SavedContext, SigFrame, SigInfo, TrapFrame, UContext, SF_INFO,
    SF_STACK_SIZE, SF_UC,
};
use crate::kernel::copy::CopyError;
use crate::kernel::thread::{ExitStatus, Thread};
use crate::kernel::{trace, KernelFault, LogEvent, Processor, TrapEnv, TrapOutcome};
use crate::logging;
use crate::mem::layout::SIGCODE_VA;

/// シグナル番号の上限（0 は欠番）
pub const NSIG: usize = 32;

// si_code（BSD）
pub const ILL_ILLOPC: u64 = 1;
pub const ILL_ILLTRP: u64 = 4;
pub const ILL_COPROC: u64 = 7;
pub const FPE_INTOVF: u64 = 2;
pub const FPE_FLTINV: u64 = 7;
pub const SEGV_MAPERR: u64 = 1;
pub const SEGV_ACCERR: u64 = 2;
pub const BUS_ADRALN: u64 = 1;
pub const BUS_ADRERR: u64 = 2;
pub const BUS_OBJERR: u64 = 3;
pub const TRAP_BRKPT: u64 = 1;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(u8);

impl Signal {
    pub const SIGHUP: Signal = Signal(1);
    pub const SIGINT: Signal = Signal(2);
    pub const SIGQUIT: Signal = Signal(3);
    pub const SIGILL: Signal = Signal(4);
    pub const SIGTRAP: Signal = Signal(5);
    pub const SIGABRT: Signal = Signal(6);
    pub const SIGEMT: Signal = Signal(7);
    pub const SIGFPE: Signal = Signal(8);
    pub const SIGKILL: Signal = Signal(9);
    pub const SIGBUS: Signal = Signal(10);
    pub const SIGSEGV: Signal = Signal(11);
    pub const SIGSYS: Signal = Signal(12);
    pub const SIGPIPE: Signal = Signal(13);
    pub const SIGALRM: Signal = Signal(14);
    pub const SIGTERM: Signal = Signal(15);
    pub const SIGURG: Signal = Signal(16);
    pub const SIGSTOP: Signal = Signal(17);
    pub const SIGTSTP: Signal = Signal(18);
    pub const SIGCONT: Signal = Signal(19);
    pub const SIGCHLD: Signal = Signal(20);
    pub const SIGTTIN: Signal = Signal(21);
    pub const SIGTTOU: Signal = Signal(22);
    pub const SIGIO: Signal = Signal(23);
    pub const SIGXCPU: Signal = Signal(24);
    pub const SIGXFSZ: Signal = Signal(25);
    pub const SIGVTALRM: Signal = Signal(26);
    pub const SIGPROF: Signal = Signal(27);
    pub const SIGWINCH: Signal = Signal(28);
    pub const SIGINFO: Signal = Signal(29);
    pub const SIGUSR1: Signal = Signal(30);
    pub const SIGUSR2: Signal = Signal(31);

    /// 番号から作る。0 や範囲外は None。
    pub const fn new(signo: u8) -> Option<Signal> {
        if signo >= 1 && (signo as usize) < NSIG {
            Some(Signal(signo))
        } else {
            None
        }
    }

    pub const fn number(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// SIGKILL / SIGSTOP はハンドラもマスクも効かない
    pub fn is_uncatchable(self) -> bool {
        self == Signal::SIGKILL || self == Signal::SIGSTOP
    }

    pub fn name(self) -> &'static str {
        NAMES[self.index()]
    }

    pub fn default_action(self) -> DefaultAction {
        match self {
            Signal::SIGQUIT
            | Signal::SIGILL
            | Signal::SIGTRAP
            | Signal::SIGABRT
            | Signal::SIGEMT
            | Signal::SIGFPE
            | Signal::SIGBUS
            | Signal::SIGSEGV
            | Signal::SIGSYS
            | Signal::SIGXCPU
            | Signal::SIGXFSZ => DefaultAction::Core,
            Signal::SIGURG | Signal::SIGCHLD | Signal::SIGIO | Signal::SIGWINCH | Signal::SIGINFO => {
                DefaultAction::Ignore
            }
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                DefaultAction::Stop
            }
            Signal::SIGCONT => DefaultAction::Continue,
            _ => DefaultAction::Terminate,
        }
    }
}

static NAMES: [&str; NSIG] = [
    "SIG0", "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGEMT", "SIGFPE",
    "SIGKILL", "SIGBUS", "SIGSEGV", "SIGSYS", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGURG",
    "SIGSTOP", "SIGTSTP", "SIGCONT", "SIGCHLD", "SIGTTIN", "SIGTTOU", "SIGIO", "SIGXCPU",
    "SIGXFSZ", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGINFO", "SIGUSR1", "SIGUSR2",
];

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ハンドラが無いときの動作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    /// 終了 + コアダンプ相当
    Core,
    Ignore,
    Stop,
    Continue,
}

/// シグナル集合（bit n = シグナル n）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SigSet(u64);

const ALL_BITS: u64 = ((1u64 << NSIG) - 1) & !1;

impl SigSet {
    pub const fn empty() -> Self {
        SigSet(0)
    }

    pub const fn full() -> Self {
        SigSet(ALL_BITS)
    }

    /// マスクできない集合
    pub const fn cantmask() -> Self {
        SigSet((1 << Signal::SIGKILL.0) | (1 << Signal::SIGSTOP.0))
    }

    /// ユーザから来たビット列。範囲外のビットは捨てる。
    pub const fn from_bits(bits: u64) -> Self {
        SigSet(bits & ALL_BITS)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn of(sig: Signal) -> Self {
        SigSet(1 << sig.0)
    }

    pub fn add(&mut self, sig: Signal) {
        self.0 |= 1 << sig.0;
    }

    pub fn remove(&mut self, sig: Signal) {
        self.0 &= !(1 << sig.0);
    }

    pub fn contains(self, sig: Signal) -> bool {
        (self.0 & (1 << sig.0)) != 0
    }

    pub fn union(self, other: SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    pub fn difference(self, other: SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// 番号の小さいものから 1 つ
    pub fn first(self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        Some(Signal(self.0.trailing_zeros() as u8))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    /// ユーザ空間のハンドラ関数のアドレス
    Catch(u64),
}

bitflags::bitflags! {
    /// sigaction のフラグ（BSD の値）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SigActFlags: u32 {
        const RESETHAND = 0x4;
        const NODEFER = 0x10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigAction {
    pub handler: SigHandler,
    /// ハンドラ実行中に追加でマスクする集合
    pub mask: SigSet,
    pub flags: SigActFlags,
}

impl SigAction {
    pub const DEFAULT: SigAction = SigAction {
        handler: SigHandler::Default,
        mask: SigSet::empty(),
        flags: SigActFlags::empty(),
    };

    pub const fn ignore() -> Self {
        SigAction {
            handler: SigHandler::Ignore,
            mask: SigSet::empty(),
            flags: SigActFlags::empty(),
        }
    }

    pub const fn catch(handler: u64) -> Self {
        SigAction {
            handler: SigHandler::Catch(handler),
            mask: SigSet::empty(),
            flags: SigActFlags::empty(),
        }
    }

    pub const fn with_mask(mut self, mask: SigSet) -> Self {
        self.mask = mask;
        self
    }

    pub const fn with_flags(mut self, flags: SigActFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl Default for SigAction {
    fn default() -> Self {
        SigAction::DEFAULT
    }
}

/// シグナルフレームを積めなかった理由
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigError {
    /// フレームがスタックの下端を越える
    StackOverflow { sp: u64 },
    /// スタックのページに書けなかった
    BadStack,
    /// ユーザへ戻る途中ではない
    NotUserReturn,
    /// フレームを書く途中でカーネルが致命的なフォルトを起こした
    Fatal(KernelFault),
}

impl fmt::Display for SigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigError::StackOverflow { sp } => write!(f, "signal frame overflows user stack (sp={:#x})", sp),
            SigError::BadStack => f.write_str("user stack not writable"),
            SigError::NotUserReturn => f.write_str("signal delivery outside of user return"),
            SigError::Fatal(k) => write!(f, "kernel fault while writing signal frame: {}", k),
        }
    }
}

/// 同期フォルト（SIGSEGV 等）を投函する。
///
/// 対象シグナルがブロック中または無視中なら、既定動作に戻してブロックも外す。
/// 同じフォルトを無限に繰り返さないため。
pub fn post_trap_signal(thread: &mut Thread, sig: Signal, code: u64, addr: u64) {
    let act = thread.action(sig);
    if thread.sigmask.contains(sig) || act.handler == SigHandler::Ignore {
        thread.actions[sig.index()] = SigAction::DEFAULT;
        thread.sigmask.remove(sig);
    }
    thread.post(
        sig,
        SigInfo {
            signo: sig.number() as u64,
            code,
            addr,
        },
    );
}

impl Processor {
    /// ユーザへ戻る直前の処理（AST）。
    ///
    /// - 終了済みならそれを返す
    /// - 配送可能なシグナルを 1 つ処理する（ハンドラ起動は 1 回のトラップにつき 1 つ）
    /// - 再スケジュール要求があれば Reschedule
    pub(crate) fn userret(
        &mut self,
        env: &mut TrapEnv<'_>,
        tf: &mut TrapFrame,
    ) -> Result<TrapOutcome, KernelFault> {
        if let Some(status) = env.thread.exit {
            return Ok(TrapOutcome::Exit(status));
        }

        let mut outcome = TrapOutcome::Resume;
        loop {
            let ready = env.thread.deliverable();
            let sig = if ready.contains(Signal::SIGKILL) {
                Signal::SIGKILL
            } else {
                match ready.first() {
                    Some(s) => s,
                    None => break,
                }
            };
            env.thread.pending.remove(sig);

            let act = env.thread.action(sig);
            match act.handler {
                SigHandler::Ignore if !sig.is_uncatchable() => continue,
                SigHandler::Catch(handler) if !sig.is_uncatchable() => {
                    match self.sendsig(env, tf, sig, act, handler) {
                        Ok(()) => outcome = TrapOutcome::Delivered(sig),
                        Err(SigError::Fatal(k)) => return Err(k),
                        Err(e) => {
                            // スタックを壊したスレッドは SIGILL で落とす
                            logging::warn("sendsig failed; killing thread");
                            logging::info_u64("tid", env.thread.tid.0 as u64);
                            logging::info_u64("signo", sig.number() as u64);
                            if let SigError::StackOverflow { sp } = e {
                                logging::info_u64("sp", sp);
                            }
                            outcome = self.kill(env.thread, Signal::SIGILL, true);
                        }
                    }
                    break;
                }
                _ => match sig.default_action() {
                    DefaultAction::Ignore => continue,
                    DefaultAction::Continue => {
                        env.thread.stopped = false;
                        continue;
                    }
                    DefaultAction::Stop => {
                        env.thread.stopped = true;
                        self.push_event(LogEvent::ThreadStopped {
                            tid: env.thread.tid,
                            sig,
                        });
                        outcome = TrapOutcome::Stop(sig);
                        break;
                    }
                    DefaultAction::Terminate => {
                        outcome = self.kill(env.thread, sig, false);
                        break;
                    }
                    DefaultAction::Core => {
                        outcome = self.kill(env.thread, sig, true);
                        break;
                    }
                },
            }
        }

        if self.need_resched {
            self.need_resched = false;
            outcome = outcome.merge(TrapOutcome::Reschedule);
        }
        Ok(outcome)
    }

    pub(crate) fn kill(&mut self, thread: &mut Thread, sig: Signal, core: bool) -> TrapOutcome {
        let status = ExitStatus::Signaled { sig, core };
        thread.exit = Some(status);
        self.push_event(LogEvent::ThreadKilled {
            tid: thread.tid,
            sig,
        });
        TrapOutcome::Exit(status)
    }

    /// ハンドラを起動するためにシグナルフレームを積み、レジスタを書き換える。
    ///
    /// フレームを書く前にスタックの範囲とページを全部確かめる。
    /// 失敗したらユーザメモリもレジスタも変えない。
    pub fn sendsig(
        &mut self,
        env: &mut TrapEnv<'_>,
        tf: &mut TrapFrame,
        sig: Signal,
        act: SigAction,
        handler: u64,
    ) -> Result<(), SigError> {
        if !tf.from_user() {
            return Err(SigError::NotUserReturn);
        }
        let conv = self.arch.conv();
        let sp = tf.regs.gpr[conv.sp];
        let frame_sp = sp.wrapping_sub(SF_STACK_SIZE as u64) & !15;
        if frame_sp > sp || frame_sp < env.thread.stack_base {
            return Err(SigError::StackOverflow { sp });
        }

        let mut info = env.thread.siginfo[sig.index()];
        info.signo = sig.number() as u64;
        let frame = SigFrame {
            info,
            uc: UContext {
                mask: env.thread.sigmask.bits(),
                ctx: SavedContext {
                    regs: tf.regs,
                    fpu: self.fpu_snapshot(env.thread),
                },
            },
        };

        match self.copyout(env, as_bytes(&frame), frame_sp) {
            Ok(()) => {}
            Err(CopyError::Efault) => return Err(SigError::BadStack),
            Err(CopyError::Fatal(k)) => return Err(SigError::Fatal(k)),
        }

        tf.regs.pc = handler;
        tf.regs.gpr[conv.args[0]] = sig.number() as u64;
        tf.regs.gpr[conv.args[1]] = frame_sp + SF_INFO as u64;
        tf.regs.gpr[conv.args[2]] = frame_sp + SF_UC as u64;
        tf.regs.gpr[conv.sp] = frame_sp;
        tf.regs.gpr[conv.ra] = SIGCODE_VA;
        if let Some(t9) = conv.call_target {
            tf.regs.gpr[t9] = handler;
        }

        let t = &mut *env.thread;
        let mut mask = t.sigmask.union(act.mask);
        if !act.flags.contains(SigActFlags::NODEFER) {
            mask.add(sig);
        }
        t.set_mask(mask);
        if act.flags.contains(SigActFlags::RESETHAND) {
            t.actions[sig.index()] = SigAction::DEFAULT;
        }

        self.stats.signals_delivered += 1;
        self.push_event(LogEvent::SignalDelivered { tid: t.tid, sig });
        trace::trace_signal_deliver(t.tid.0, sig.number(), frame_sp);
        Ok(())
    }

    /// sigreturn: ハンドラ前のコンテキストとマスクをそのまま戻す。
    ///
    /// ステータスワードはユーザが変えてよいビットだけを採用する。
    pub fn sigreturn(
        &mut self,
        env: &mut TrapEnv<'_>,
        tf: &mut TrapFrame,
        uc_addr: u64,
    ) -> Result<(), CopyError> {
        if uc_addr % 8 != 0 {
            return Err(CopyError::Efault);
        }
        let mut buf = [0u8; core::mem::size_of::<UContext>()];
        self.copyin(env, uc_addr, &mut buf)?;
        let uc: UContext = from_bytes(&buf).ok_or(CopyError::Efault)?;

        tf.regs = uc.ctx.regs;
        tf.regs.sr = self.arch.sanitize_user_status(uc.ctx.regs.sr);
        self.fpu_store(env.thread, uc.ctx.fpu);
        env.thread.set_mask(SigSet::from_bits(uc.mask));

        trace::trace_signal_return(env.thread.tid.0, tf.regs.pc);
        Ok(())
    }
}
