// kernel/src/kernel/thread.rs
//
// スレッド（このレイヤから見える部分だけ）
// - 保存コンテキスト（SavedContext）と、それが live / saved のどちらか
// - シグナル状態（マスク、保留、ハンドラ表、同期シグナルの付帯情報）
// - ユーザスタックの範囲（シグナルフレームのオーバーフロー検出用）
//
// スケジューリング方針（誰を次に走らせるか）は外部の責務。

use crate::arch::Arch;
use crate::kernel::context::{SavedContext, SigInfo};
use crate::kernel::signal::{SigAction, SigSet, Signal, NSIG};
use crate::mem::layout::{USER_STACK_SIZE, USER_STACK_TOP};
use crate::types::Tid;

/// SavedContext はいつでも live か saved のどちらか一方
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// レジスタはプロセッサ上にある（ctx は古い）
    Live,
    /// レジスタは ctx に保存されている
    Saved,
}

/// スレッドの終わり方
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// シグナルで強制終了（core = コアダンプ相当）
    Signaled { sig: Signal, core: bool },
    Exited(u32),
}

pub struct Thread {
    pub tid: Tid,
    pub(crate) state: ContextState,
    pub ctx: SavedContext,

    pub sigmask: SigSet,
    pub pending: SigSet,
    pub actions: [SigAction; NSIG],
    /// 保留中シグナルごとの付帯情報（同期フォルトの code / addr）
    pub siginfo: [SigInfo; NSIG],

    /// ユーザスタックの下端（これより下にフレームを積んだらオーバーフロー）
    pub stack_base: u64,
    pub stack_top: u64,

    pub exit: Option<ExitStatus>,
    pub stopped: bool,
}

impl Thread {
    /// ユーザスレッドを作る。最初の実行は entry から、sp = stack_top。
    pub fn new_user(arch: Arch, tid: Tid, entry: u64, stack_top: u64, stack_size: u64) -> Self {
        let mut ctx = SavedContext::zeroed();
        let conv = arch.conv();
        ctx.regs.pc = entry;
        ctx.regs.sr = arch.user_status();
        ctx.regs.gpr[conv.sp] = stack_top;
        if let Some(t9) = conv.call_target {
            ctx.regs.gpr[t9] = entry;
        }

        Thread {
            tid,
            state: ContextState::Saved,
            ctx,
            sigmask: SigSet::empty(),
            pending: SigSet::empty(),
            actions: [SigAction::DEFAULT; NSIG],
            siginfo: [SigInfo::default(); NSIG],
            stack_base: stack_top.saturating_sub(stack_size),
            stack_top,
            exit: None,
            stopped: false,
        }
    }

    /// 既定のスタック配置で作る
    pub fn with_default_stack(arch: Arch, tid: Tid, entry: u64) -> Self {
        Self::new_user(arch, tid, entry, USER_STACK_TOP, USER_STACK_SIZE)
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == ContextState::Live
    }

    pub fn is_exited(&self) -> bool {
        self.exit.is_some()
    }

    pub fn action(&self, sig: Signal) -> SigAction {
        self.actions[sig.index()]
    }

    /// ハンドラを設定する。SIGKILL / SIGSTOP は変更できない。
    pub fn set_action(&mut self, sig: Signal, act: SigAction) -> bool {
        if sig.is_uncatchable() {
            return false;
        }
        self.actions[sig.index()] = act;
        true
    }

    /// マスクを設定する。SIGKILL / SIGSTOP はマスクできない。
    pub fn set_mask(&mut self, mask: SigSet) {
        self.sigmask = mask.difference(SigSet::cantmask());
    }

    /// シグナルを保留にする（付帯情報付き）
    pub fn post(&mut self, sig: Signal, info: SigInfo) {
        self.pending.add(sig);
        self.siginfo[sig.index()] = info;
    }

    /// マスクされておらず、配送待ちのシグナル
    pub fn deliverable(&self) -> SigSet {
        self.pending.difference(self.sigmask)
    }
}
