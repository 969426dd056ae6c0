// kernel/src/kernel/devhint.rs
//
// デバイスヒント表（静的）。
// - デバイスのパス、メモリ/ポート範囲（開始,終了 の組、両端含む）、割り込み線。
// - ドライバの attach（外部）が読む。割り込み線はディスパッチャと同じ番号空間。
// - ブリングアップ時に、線番号がアーキの範囲内でタイマ線と衝突しないことを確かめる。

use core::fmt;

use crate::arch::Arch;
use crate::types::IrqLine;

/// 1 デバイスあたりの範囲の上限（開始,終了 の組）
pub const MAX_RANGES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevHint {
    pub path: &'static str,
    pub iomem: &'static [(u64, u64)],
    pub ioport: &'static [(u64, u64)],
    pub irq: IrqLine,
}

pub static HINTS: &[DevHint] = &[
    DevHint {
        path: "/rootdev/pci@0/isab@0/isa@0/uart@0",
        iomem: &[(1016, 1023), (760, 767)],
        ioport: &[],
        irq: 4,
    },
    DevHint {
        path: "/rootdev/pci@0/isab@0/isa@0/uart@1",
        iomem: &[(760, 767)],
        ioport: &[(96, 96), (100, 100)],
        irq: 3,
    },
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HintError {
    /// アーキの割り込み線の範囲外
    IrqOutOfRange { path: &'static str, irq: IrqLine },
    /// タイマ線と同じ番号
    IrqIsTimer { path: &'static str, irq: IrqLine },
    /// 開始 > 終了 の範囲、または範囲の数が多すぎる
    BadRange { path: &'static str },
}

impl fmt::Display for HintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HintError::IrqOutOfRange { path, irq } => {
                write!(f, "{}: irq {} outside of interrupt lines", path, irq)
            }
            HintError::IrqIsTimer { path, irq } => {
                write!(f, "{}: irq {} collides with the timer line", path, irq)
            }
            HintError::BadRange { path } => write!(f, "{}: malformed resource range", path),
        }
    }
}

/// パスでヒントを引く
pub fn lookup(path: &str) -> Option<&'static DevHint> {
    HINTS.iter().find(|h| h.path == path)
}

/// 表全体を検査する（最初に見つかった問題を返す）
pub fn validate(arch: Arch, hints: &[DevHint]) -> Result<(), HintError> {
    for h in hints {
        if h.irq >= arch.irq_lines() {
            return Err(HintError::IrqOutOfRange {
                path: h.path,
                irq: h.irq,
            });
        }
        if h.irq == arch.timer_irq() {
            return Err(HintError::IrqIsTimer {
                path: h.path,
                irq: h.irq,
            });
        }
        let ranges_ok = |r: &[(u64, u64)]| r.len() <= MAX_RANGES && r.iter().all(|(s, e)| s <= e);
        if !ranges_ok(h.iomem) || !ranges_ok(h.ioport) {
            return Err(HintError::BadRange { path: h.path });
        }
    }
    Ok(())
}
