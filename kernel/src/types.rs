/*!
 * types
 *
 * 役割:
 *   - マシン層全体で共有する素朴な型を集約する。
 *
 * やること:
 *   - スレッド ID、実行モード、メモリアクセス種別、IRQ 番号。
 *
 * やらないこと:
 *   - レジスタ配置やページテーブル形式などの arch 依存の定義。
 *
 * 設計方針:
 *   - 依存を増やさず、どのモジュールからも参照できる位置に置く。
 */

use core::fmt;

/// スレッド識別子（スケジューラ側が採番する）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

/// IRQ 番号。デバイスヒント表とディスパッチャで同じ番号空間を使う。
pub type IrqLine = u32;

/// 実行モード（特権レベル）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Kernel,
    User,
}

impl Mode {
    pub fn is_user(self) -> bool {
        self == Mode::User
    }

    /// TrapFrame に格納するときの数値表現
    pub const fn as_u64(self) -> u64 {
        match self {
            Mode::Kernel => 0,
            Mode::User => 1,
        }
    }

    pub const fn from_u64(v: u64) -> Mode {
        if v == 1 {
            Mode::User
        } else {
            Mode::Kernel
        }
    }
}

/// メモリアクセスの種類
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
    Fetch,
}

impl Access {
    pub fn is_write(self) -> bool {
        self == Access::Store
    }

    pub fn name(self) -> &'static str {
        match self {
            Access::Load => "load",
            Access::Store => "store",
            Access::Fetch => "fetch",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Kernel => write!(f, "kernel"),
            Mode::User => write!(f, "user"),
        }
    }
}
