// kernel/src/kernel/syscall.rs
//
// syscall 境界（このレイヤが見る部分だけ）
// - 引数はアーキの規約（RegConv）でレジスタから取り出す
// - 結果は SyscallResult で返し、アーキ側がレジスタと pc に反映する
// - このレイヤ自身が実装するのは sigreturn だけ。残りは KernelHooks::syscall へ。

use crate::kernel::context::TrapFrame;
use crate::kernel::copy::CopyError;
use crate::kernel::{HookCtx, KernelFault, LogEvent, Processor, TrapEnv};

/// sigcode が呼ぶ番号（トランポリンの即値に焼き込まれる）
pub const SYS_SIGRETURN: u32 = 103;

// errno（BSD）
pub const EFAULT: u32 = 14;
pub const ENOSYS: u32 = 78;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallArgs {
    pub code: u64,
    pub args: [u64; 6],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallResult {
    Ok(u64),
    Err(u32),
    /// 同じ syscall 命令をもう一度実行させる
    Restart,
    /// レジスタに触れない（sigreturn のようにコンテキストごと差し替えた場合）
    JustReturn,
}

impl Processor {
    /// syscall 例外の本体
    pub(crate) fn handle_syscall(
        &mut self,
        env: &mut TrapEnv<'_>,
        tf: &mut TrapFrame,
    ) -> Result<(), KernelFault> {
        let args = self.arch.syscall_args(&tf.regs);
        self.stats.syscalls += 1;
        self.push_event(LogEvent::SyscallIssued {
            tid: env.thread.tid,
            code: args.code,
        });

        let res = if args.code == SYS_SIGRETURN as u64 {
            match self.sigreturn(env, tf, args.args[0]) {
                Ok(()) => SyscallResult::JustReturn,
                Err(CopyError::Efault) => SyscallResult::Err(EFAULT),
                Err(CopyError::Fatal(k)) => return Err(k),
            }
        } else {
            let cx = HookCtx {
                arch: self.arch,
                irq: &self.irq,
                ticks: self.timer.ticks(),
            };
            env.hooks.syscall(&cx, env.thread, &args)
        };

        self.arch.set_syscall_result(&mut tf.regs, res);
        Ok(())
    }
}
