// kernel/src/kernel/context.rs
//
// レジスタファイルのスナップショット（SavedContext / TrapFrame）と、
// シグナルフレームのバイト配置。
//
// 重要:
// - ここで定義する構造体の配置は、入口/出口コード（トランポリン）が直接読む。
// - 配置はすべて u64 の並びで、パディングは無い。
// - CTX_* / TF_* / SF_* 定数は offset_of! でこの定義から導出し、
//   期待値との一致を const assert で固定する（ずれたらビルドが落ちる）。

use core::mem::{offset_of, size_of};

use crate::types::Mode;

/// 汎用レジスタ本数（両アーキ共通で 32 本分の枠を持つ）
pub const NGPR: usize = 32;

/// FPU レジスタ本数
pub const NFPR: usize = 32;

/// 整数レジスタ + pc + ステータスワード
///
/// - MIPS: gpr[0] は常に 0（zero レジスタ）。sr は CP0 Status。
/// - AArch64: gpr[0..31] = x0..x30、gpr[31] = sp_el0。sr は SPSR（PSTATE）。
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuRegs {
    pub gpr: [u64; NGPR],
    pub pc: u64,
    pub sr: u64,
}

impl CpuRegs {
    pub const fn zeroed() -> Self {
        CpuRegs {
            gpr: [0; NGPR],
            pc: 0,
            sr: 0,
        }
    }
}

impl Default for CpuRegs {
    fn default() -> Self {
        CpuRegs::zeroed()
    }
}

/// 浮動小数点レジスタ + 制御/状態レジスタ（MIPS FCSR / AArch64 FPSR|FPCR）
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FpuState {
    pub fpr: [u64; NFPR],
    pub fcsr: u64,
}

impl FpuState {
    pub const fn zeroed() -> Self {
        FpuState {
            fpr: [0; NFPR],
            fcsr: 0,
        }
    }
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState::zeroed()
    }
}

/// 中断中の実行 1 本分の完全なスナップショット
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SavedContext {
    pub regs: CpuRegs,
    pub fpu: FpuState,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        SavedContext {
            regs: CpuRegs::zeroed(),
            fpu: FpuState::zeroed(),
        }
    }
}

/// カーネル入口で取られる捕捉フレーム。
///
/// - regs: 例外時点の整数レジスタ（pc は EPC / ELR、sr は例外前の Status / SPSR）
/// - cause: MIPS Cause / AArch64 ESR をそのまま
/// - badvaddr: MIPS BadVAddr / AArch64 FAR
/// - vector: どのベクタから入ったか（arch::Vector の数値）
/// - prev_mode: 例外前の実行モード
///
/// FPU はここには含めない（スイッチ/シグナル側が必要に応じて退避する）。
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TrapFrame {
    pub regs: CpuRegs,
    pub cause: u64,
    pub badvaddr: u64,
    pub vector: u64,
    pub prev_mode: u64,
}

impl TrapFrame {
    pub fn prev_mode(&self) -> Mode {
        Mode::from_u64(self.prev_mode)
    }

    pub fn from_user(&self) -> bool {
        self.prev_mode().is_user()
    }
}

/// ハンドラに渡すシグナル情報
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SigInfo {
    pub signo: u64,
    pub code: u64,
    pub addr: u64,
}

/// sigreturn で読み戻されるユーザコンテキスト
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct UContext {
    /// ハンドラ起動前のシグナルマスク
    pub mask: u64,
    pub ctx: SavedContext,
}

/// ユーザスタック上に置かれるシグナルフレーム
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SigFrame {
    pub info: SigInfo,
    pub uc: UContext,
}

// ─────────────────────────────────────────────
// 配置定数（入口/出口コードと sigcode が使う）
// ─────────────────────────────────────────────

pub const CTX_GPR: usize = offset_of!(CpuRegs, gpr);
pub const CTX_PC: usize = offset_of!(CpuRegs, pc);
pub const CTX_SR: usize = offset_of!(CpuRegs, sr);
pub const CTX_FPU: usize = offset_of!(SavedContext, fpu);
pub const CTX_FPR: usize = CTX_FPU + offset_of!(FpuState, fpr);
pub const CTX_FCSR: usize = CTX_FPU + offset_of!(FpuState, fcsr);
pub const CTX_SIZE: usize = size_of::<SavedContext>();

pub const TF_CAUSE: usize = offset_of!(TrapFrame, cause);
pub const TF_BADVADDR: usize = offset_of!(TrapFrame, badvaddr);
pub const TF_VECTOR: usize = offset_of!(TrapFrame, vector);
pub const TF_PREV_MODE: usize = offset_of!(TrapFrame, prev_mode);
pub const TF_SIZE: usize = size_of::<TrapFrame>();

pub const SF_INFO: usize = offset_of!(SigFrame, info);
pub const SF_UC: usize = offset_of!(SigFrame, uc);
pub const SF_UC_MASK: usize = SF_UC + offset_of!(UContext, mask);
pub const SF_UC_CTX: usize = SF_UC + offset_of!(UContext, ctx);
pub const SF_SIZE: usize = size_of::<SigFrame>();

/// スタックに積むときのシグナルフレームの大きさ（16 バイト境界）
pub const SF_STACK_SIZE: usize = (SF_SIZE + 15) & !15;

// 固定 ABI: ここの数値はトランポリン側に焼き込まれている
const _: () = assert!(CTX_GPR == 0);
const _: () = assert!(CTX_PC == 256);
const _: () = assert!(CTX_SR == 264);
const _: () = assert!(CTX_FPU == 272);
const _: () = assert!(CTX_FPR == 272);
const _: () = assert!(CTX_FCSR == 528);
const _: () = assert!(CTX_SIZE == 536);
const _: () = assert!(TF_CAUSE == 272);
const _: () = assert!(TF_BADVADDR == 280);
const _: () = assert!(TF_VECTOR == 288);
const _: () = assert!(TF_PREV_MODE == 296);
const _: () = assert!(TF_SIZE == 304);
const _: () = assert!(SF_INFO == 0);
const _: () = assert!(SF_UC == 24);
const _: () = assert!(SF_UC_MASK == 24);
const _: () = assert!(SF_UC_CTX == 32);
const _: () = assert!(SF_SIZE == 568);
const _: () = assert!(SF_STACK_SIZE % 16 == 0);
// sigcode の即値に収まること（MIPS addiu: 符号付き 16bit、AArch64 add: 12bit）
const _: () = assert!(SF_UC < 0x1000);

/// 診断ダンプ用の配置表（名前, オフセット）
pub const LAYOUT: &[(&str, usize)] = &[
    ("CTX_GPR", CTX_GPR),
    ("CTX_PC", CTX_PC),
    ("CTX_SR", CTX_SR),
    ("CTX_FPR", CTX_FPR),
    ("CTX_FCSR", CTX_FCSR),
    ("CTX_SIZE", CTX_SIZE),
    ("TF_CAUSE", TF_CAUSE),
    ("TF_BADVADDR", TF_BADVADDR),
    ("TF_VECTOR", TF_VECTOR),
    ("TF_PREV_MODE", TF_PREV_MODE),
    ("TF_SIZE", TF_SIZE),
    ("SF_INFO", SF_INFO),
    ("SF_UC", SF_UC),
    ("SF_UC_MASK", SF_UC_MASK),
    ("SF_UC_CTX", SF_UC_CTX),
    ("SF_SIZE", SF_SIZE),
];

// ─────────────────────────────────────────────
// バイト列との相互変換（ユーザメモリへの copyin / copyout 用）
// ─────────────────────────────────────────────

/// u64 だけで構成された #[repr(C)] 構造体の印。
///
/// # Safety
/// - パディングを含まないこと
/// - どんなビット列も有効な値であること
pub(crate) unsafe trait Plain: Copy + Default {}

unsafe impl Plain for CpuRegs {}
unsafe impl Plain for FpuState {}
unsafe impl Plain for SavedContext {}
unsafe impl Plain for TrapFrame {}
unsafe impl Plain for SigInfo {}
unsafe impl Plain for UContext {}
unsafe impl Plain for SigFrame {}

/// 値のメモリ表現（raw bytes）を借用する。
pub(crate) fn as_bytes<T: Plain>(v: &T) -> &[u8] {
    let p = (v as *const T) as *const u8;
    // Plain はパディング無しなので、全バイトが初期化済み
    unsafe { core::slice::from_raw_parts(p, size_of::<T>()) }
}

/// バイト列から値を組み立てる（長さ不足なら None）
pub(crate) fn from_bytes<T: Plain>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < size_of::<T>() {
        return None;
    }
    let mut v = T::default();
    let p = (&mut v as *mut T) as *mut u8;
    // Plain はどのビット列も有効。領域は重ならない。
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), p, size_of::<T>());
    }
    Some(v)
}
