// kernel/src/lib.rs
//
// trapcore: 教育用カーネルの機械依存層（MIPS32 / AArch64）
//
// - arch: アーキごとのステータスワード・例外・syscall 規約・sigcode、CPU と TLB のモデル
// - kernel: Processor（トラップ・切り替え・シグナル・copyin/out・立ち上げ）
// - mem / mm: pmap（ソフトウェアページテーブル + ASID）と物理メモリの窓
// - logging: log クレートの出力先
//
// ターゲットでは no_std。ホストでは同じコードをハードウェアモデルの上でテストする。

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod kernel;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod types;

mod panic;

pub use arch::Arch;
pub use kernel::entry::BringUpError;
pub use kernel::{HookCtx, KernelFault, KernelHooks, NoHooks, Processor, TrapEnv, TrapOutcome};
