// kernel/src/kernel/mod.rs
//
// 1 プロセッサ分の機械依存層。
//
// - Processor: CPU モデル・MMU（TLB + ASID）・割り込み線・タイマ・トラップの入れ子状態を持つ
// - トラップ（trap.rs）: 捕捉 → 分類 → 処理 → ユーザ復帰前の AST → 復元
// - コピー（copy.rs）: copyin / copyout（onfault 付き）
// - 切り替え（switch.rs）: SavedContext の保存と復元、FPU
// - シグナル（signal.rs）: sendsig / sigreturn
// - 立ち上げ（entry.rs）: bring_up / shutdown
//
// [不変条件]
//
// 1. トラップの入れ子
//    - 同じ種類（TrapClass）のトラップが入れ子になったら二重フォルト（致命的）。
//    - 違う種類の入れ子は許す（syscall 中の copyin が TLB refill を起こす等）。
//    - トラップの外では入れ子状態は空。
//
// 2. スレッドのコンテキスト
//    - current のスレッドだけが Live。それ以外は Saved。
//
// 3. MMU
//    - kernel_pmap があるのは bring_up 後 shutdown 前だけで、その間 MMU は online。
//
// これらは debug_check_invariants() でログ出力ベースで検証される。
//
// 上位（スケジューラ・VM・syscall 本体・ドライバ）は KernelHooks として外から差し込む。

pub mod context;
pub mod copy;
pub mod devhint;
pub mod entry;
pub mod signal;
pub mod switch;
pub mod syscall;
pub mod thread;
pub mod timer;
pub mod trace;
pub mod trap;

use core::fmt;

use crate::arch::cpu::{Cpu, IrqController};
use crate::arch::{Arch, Exception};
use crate::logging;
use crate::mem::addr::PhysFrame;
use crate::mem::address_space::{Mmu, Pmap};
use crate::mm::PhysMemory;
use crate::types::{Access, IrqLine, Mode, Tid};

use self::context::{TrapFrame, LAYOUT};
use self::signal::Signal;
use self::syscall::{SyscallArgs, SyscallResult, ENOSYS};
use self::thread::{ExitStatus, Thread};
use self::timer::Timer;

const EVENT_LOG_CAP: usize = 64;

// ──────────────────────────────────────────────
// 上位層との接点
// ──────────────────────────────────────────────

/// フックに渡す読み取り専用の状況
pub struct HookCtx<'a> {
    pub arch: Arch,
    /// ハンドラの中から別の線を立てる場合に使う（立てた線はトラップ出口まで待たされる）
    pub irq: &'a IrqController,
    pub ticks: u64,
}

/// 解決できなかったフォルトの種類（シグナルに変換される）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    NotMapped,
    Protection,
    BusError,
}

/// VM 層に渡すページフォルト
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub va: u64,
    pub access: Access,
    /// フォルトを起こしたモード（copyin 中ならカーネル）
    pub mode: Mode,
    pub kind: FaultError,
}

/// 上位層（スケジューラ・VM・syscall・ドライバ）のフック。
///
/// 既定の実装は「何もしない」: syscall は ENOSYS、フォルトは解決しない、割り込みは誰も取らない。
pub trait KernelHooks {
    fn syscall(&mut self, cx: &HookCtx<'_>, thread: &mut Thread, args: &SyscallArgs) -> SyscallResult {
        let _ = (cx, thread, args);
        SyscallResult::Err(ENOSYS)
    }

    /// 解決できたら Ok。命令は再実行される。
    fn page_fault(
        &mut self,
        cx: &HookCtx<'_>,
        fault: &PageFault,
        space: &mut Pmap,
        mem: &mut dyn PhysMemory,
    ) -> Result<(), FaultError> {
        let _ = (cx, space, mem);
        Err(fault.kind)
    }

    /// 線を処理したら true
    fn interrupt(&mut self, cx: &HookCtx<'_>, line: IrqLine) -> bool {
        let _ = (cx, line);
        false
    }
}

/// フックを持たない上位層
pub struct NoHooks;

impl KernelHooks for NoHooks {}

/// トラップを処理するのに必要な外部状態（現在のスレッドとそのアドレス空間）
pub struct TrapEnv<'a> {
    pub thread: &'a mut Thread,
    pub space: &'a mut Pmap,
    pub mem: &'a mut dyn PhysMemory,
    pub hooks: &'a mut dyn KernelHooks,
}

/// トラップ 1 回の結果（スケジューラへの指示）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// そのまま同じスレッドに戻る
    Resume,
    /// シグナルハンドラを起動するフレームを積んだ
    Delivered(Signal),
    /// 量子切れ。別のスレッドに切り替えるべき
    Reschedule,
    /// 停止シグナルで止まった
    Stop(Signal),
    /// スレッドは終了した
    Exit(ExitStatus),
}

impl TrapOutcome {
    fn rank(self) -> u8 {
        match self {
            TrapOutcome::Resume => 0,
            TrapOutcome::Delivered(_) => 1,
            TrapOutcome::Reschedule => 2,
            TrapOutcome::Stop(_) => 3,
            TrapOutcome::Exit(_) => 4,
        }
    }

    /// 2 つの結果のうち、スケジューラにとって強い方
    pub fn merge(self, other: TrapOutcome) -> TrapOutcome {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

// ──────────────────────────────────────────────
// 致命的なフォルト
// ──────────────────────────────────────────────

/// トラップの種類（入れ子検出の単位）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapClass {
    Refill,
    Syscall,
    Fault,
    Interrupt,
}

impl TrapClass {
    pub fn of(exc: &Exception) -> TrapClass {
        match exc {
            Exception::TlbMiss { .. } => TrapClass::Refill,
            Exception::Syscall => TrapClass::Syscall,
            Exception::Interrupt => TrapClass::Interrupt,
            _ => TrapClass::Fault,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelFault {
    /// 同じ種類のトラップの処理中に、またそれが起きた
    DoubleFault(TrapClass),
    /// カーネルモードで起きてはいけない例外
    UnexpectedKernelTrap(Exception),
    /// カーネル窓の未マップ参照、または onfault の無いユーザ参照
    KernelPageFault { va: u64 },
    /// 切り替え対象のコンテキストが壊れている
    CorruptedContext { tid: Tid },
    /// ページテーブルが壊れている
    TableCorrupted,
    /// すでに停止している
    Halted,
}

impl KernelFault {
    pub fn name(&self) -> &'static str {
        match self {
            KernelFault::DoubleFault(_) => "double fault",
            KernelFault::UnexpectedKernelTrap(_) => "unexpected trap in kernel mode",
            KernelFault::KernelPageFault { .. } => "kernel page fault",
            KernelFault::CorruptedContext { .. } => "corrupted saved context",
            KernelFault::TableCorrupted => "page table corrupted",
            KernelFault::Halted => "processor halted",
        }
    }
}

impl fmt::Display for KernelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelFault::DoubleFault(c) => write!(f, "double fault ({:?})", c),
            KernelFault::UnexpectedKernelTrap(e) => write!(f, "unexpected trap in kernel mode: {}", e),
            KernelFault::KernelPageFault { va } => write!(f, "kernel page fault at {:#x}", va),
            KernelFault::CorruptedContext { tid } => write!(f, "corrupted saved context of tid {}", tid.0),
            other => f.write_str(other.name()),
        }
    }
}

/// 入れ子になっているトラップの種類
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TrapNest {
    active: u8,
    depth: u8,
}

impl TrapNest {
    pub(crate) fn enter(&mut self, class: TrapClass) -> Result<(), KernelFault> {
        if self.active & class.bit() != 0 {
            return Err(KernelFault::DoubleFault(class));
        }
        self.active |= class.bit();
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn exit(&mut self, class: TrapClass) {
        if self.active & class.bit() != 0 {
            self.active &= !class.bit();
            self.depth -= 1;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub(crate) fn depth(&self) -> u8 {
        self.depth
    }
}

// ──────────────────────────────────────────────
// 統計とイベントログ
// ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcStats {
    pub traps: u64,
    pub syscalls: u64,
    pub interrupts: u64,
    pub stray_interrupts: u64,
    pub page_faults: u64,
    pub signals_delivered: u64,
    pub switches: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    TrapEntered { cause: u64, from_user: bool },
    SyscallIssued { tid: Tid, code: u64 },
    IrqServiced { line: IrqLine, handled: bool },
    PageFault { va: u64, access: Access, resolved: bool },
    SignalDelivered { tid: Tid, sig: Signal },
    ThreadStopped { tid: Tid, sig: Signal },
    ThreadKilled { tid: Tid, sig: Signal },
    Switched { from: Option<Tid>, to: Tid },
    AsidRollover { generation: u64 },
    Fatal(KernelFault),
}

/// 1 プロセッサ分の状態
pub struct Processor {
    pub(crate) arch: Arch,
    pub cpu: Cpu,
    pub mmu: Mmu,
    pub irq: IrqController,
    pub timer: Timer,

    pub(crate) nest: TrapNest,
    pub(crate) need_resched: bool,
    /// copyin / copyout 中（ユーザアドレスのフォルトを EFAULT にしてよい）
    pub(crate) onfault: bool,

    pub(crate) current: Option<Tid>,
    /// FPU レジスタを今持っているスレッド
    pub(crate) fpu_owner: Option<Tid>,

    pub(crate) kernel_pmap: Option<Pmap>,
    pub(crate) sigcode: Option<PhysFrame>,

    pub(crate) stats: ProcStats,

    // 直近のイベント（リングバッファ）
    events: [Option<LogEvent>; EVENT_LOG_CAP],
    events_head: usize,
    events_len: usize,
}

impl Processor {
    pub(crate) fn new(arch: Arch, cpu: Cpu, mmu: Mmu) -> Self {
        Processor {
            arch,
            cpu,
            mmu,
            irq: IrqController::new(arch.irq_lines()),
            timer: Timer::new(),
            nest: TrapNest::default(),
            need_resched: false,
            onfault: false,
            current: None,
            fpu_owner: None,
            kernel_pmap: None,
            sigcode: None,
            stats: ProcStats::default(),
            events: [None; EVENT_LOG_CAP],
            events_head: 0,
            events_len: 0,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    pub fn stats(&self) -> ProcStats {
        self.stats
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched
    }

    pub fn is_halted(&self) -> bool {
        self.cpu.is_halted()
    }

    /// 入れ子になっているトラップの数（トラップの外では 0）
    pub fn trap_depth(&self) -> u8 {
        self.nest.depth()
    }

    pub fn kernel_pmap(&self) -> Option<&Pmap> {
        self.kernel_pmap.as_ref()
    }

    pub fn sigcode_frame(&self) -> Option<PhysFrame> {
        self.sigcode
    }

    pub(crate) fn push_event(&mut self, ev: LogEvent) {
        let idx = (self.events_head + self.events_len) % EVENT_LOG_CAP;
        self.events[idx] = Some(ev);
        if self.events_len < EVENT_LOG_CAP {
            self.events_len += 1;
        } else {
            self.events_head = (self.events_head + 1) % EVENT_LOG_CAP;
        }
    }

    /// 古い順に直近のイベントを渡す
    pub fn for_each_event<F: FnMut(&LogEvent)>(&self, mut f: F) {
        for i in 0..self.events_len {
            if let Some(ev) = &self.events[(self.events_head + i) % EVENT_LOG_CAP] {
                f(ev);
            }
        }
    }

    pub fn dump_events(&self) {
        logging::info("=== Processor Event Log Dump ===");
        self.for_each_event(|ev| log_event(*ev));
        logging::info("=== End of Event Log ===");
    }

    /// 致命的なフォルト: 捕捉フレームと配置表をダンプしてプロセッサを止める
    pub(crate) fn fatal(&mut self, tf: &TrapFrame, fault: KernelFault) {
        // 入れ子の中で先にダンプ済み
        if self.cpu.is_halted() {
            return;
        }
        logging::error("KERNEL FAULT");
        logging::error(fault.name());
        log::error!("{}", fault);
        logging::info_str("arch", self.arch.name());
        logging::info_u64("cause", tf.cause);
        logging::info_u64("badvaddr", tf.badvaddr);
        logging::info_u64("vector", tf.vector);
        logging::info_u64("prev_mode", tf.prev_mode);
        logging::info_u64("pc", tf.regs.pc);
        logging::info_u64("sr", tf.regs.sr);
        for (i, v) in tf.regs.gpr.iter().enumerate() {
            log::error!("  r{:02} = {:#018x}", i, v);
        }
        logging::info("layout:");
        for (name, off) in LAYOUT {
            logging::info_u64(name, *off as u64);
        }

        self.push_event(LogEvent::Fatal(fault));
        self.dump_events();
        self.cpu.halt();
    }

    /// トラップの外で見つかった致命的な状態（ライブのレジスタをダンプする）
    pub(crate) fn fatal_here(&mut self, fault: KernelFault) {
        let tf = TrapFrame {
            regs: self.cpu.regs,
            prev_mode: self.cpu.mode().as_u64(),
            ..TrapFrame::default()
        };
        self.fatal(&tf, fault);
    }

    /// 簡易的な不変条件チェック（デバッグ用）。違反の数を返す。
    pub fn debug_check_invariants(&self) -> usize {
        let mut violations = 0;

        if self.kernel_pmap.is_some() != self.mmu.is_online() {
            logging::error("INVARIANT VIOLATION: kernel pmap and MMU online state disagree");
            violations += 1;
        }

        if !self.nest.is_empty() {
            logging::error("INVARIANT VIOLATION: trap nest not empty outside of a trap");
            logging::info_u64(" depth", self.nest.depth() as u64);
            violations += 1;
        }

        if self.onfault {
            logging::error("INVARIANT VIOLATION: onfault left set");
            violations += 1;
        }

        if self.current.is_some() && !self.arch.status_is_sane(self.cpu.regs.sr) {
            logging::error("INVARIANT VIOLATION: live status word is not sane");
            logging::info_u64(" sr", self.cpu.regs.sr);
            violations += 1;
        }

        // lazy のときは無効化中なら前の持ち主が残っていてよい
        if let (true, Some(owner), Some(cur)) = (self.cpu.fpu_enabled, self.fpu_owner, self.current) {
            if owner != cur {
                logging::error("INVARIANT VIOLATION: FPU owned by a thread that is not running");
                logging::info_u64(" owner", owner.0 as u64);
                violations += 1;
            }
        }

        violations
    }
}

fn log_event(ev: LogEvent) {
    match ev {
        LogEvent::TrapEntered { cause, from_user } => {
            logging::info(if from_user {
                "EVENT: TrapEntered (user)"
            } else {
                "EVENT: TrapEntered (kernel)"
            });
            logging::info_u64(" cause", cause);
        }
        LogEvent::SyscallIssued { tid, code } => {
            logging::info("EVENT: SyscallIssued");
            logging::info_u64(" tid", tid.0 as u64);
            logging::info_u64(" code", code);
        }
        LogEvent::IrqServiced { line, handled } => {
            logging::info(if handled {
                "EVENT: IrqServiced"
            } else {
                "EVENT: IrqStray"
            });
            logging::info_u64(" line", line as u64);
        }
        LogEvent::PageFault { va, access, resolved } => {
            logging::info(if resolved {
                "EVENT: PageFault (resolved)"
            } else {
                "EVENT: PageFault (unresolved)"
            });
            logging::info_u64(" va", va);
            logging::info_str(" access", access.name());
        }
        LogEvent::SignalDelivered { tid, sig } => {
            logging::info("EVENT: SignalDelivered");
            logging::info_u64(" tid", tid.0 as u64);
            logging::info_str(" sig", sig.name());
        }
        LogEvent::ThreadStopped { tid, sig } => {
            logging::info("EVENT: ThreadStopped");
            logging::info_u64(" tid", tid.0 as u64);
            logging::info_str(" sig", sig.name());
        }
        LogEvent::ThreadKilled { tid, sig } => {
            logging::info("EVENT: ThreadKilled");
            logging::info_u64(" tid", tid.0 as u64);
            logging::info_str(" sig", sig.name());
        }
        LogEvent::Switched { from, to } => {
            logging::info("EVENT: Switched");
            if let Some(f) = from {
                logging::info_u64(" from", f.0 as u64);
            }
            logging::info_u64(" to", to.0 as u64);
        }
        LogEvent::AsidRollover { generation } => {
            logging::info("EVENT: AsidRollover");
            logging::info_u64(" generation", generation);
        }
        LogEvent::Fatal(fault) => {
            logging::info("EVENT: Fatal");
            logging::info_str(" fault", fault.name());
        }
    }
}
