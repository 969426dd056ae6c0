// src/mem/addr.rs
//
// 役割:
// - 物理アドレス / 仮想アドレス / フレーム / ページなど、メモリ関連の基本型を定義する。
// - TLB とソフトウェアページテーブルは「番号（VPN / PFN）」で話すので、その変換をここに集める。
// やること:
// - u64 の生アドレス値に型を付け、ページ境界・オフセット計算を提供する。
// やらないこと:
// - TLB やページテーブルエントリを直接触る処理（arch::tlb / mem::address_space 側）。

use core::fmt;

/// 物理アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u64);

/// 仮想アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u64);

/// ページサイズ（4KiB 固定）
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u64 = 12;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// 物理フレーム（PFN）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysFrame {
    pub number: u64, // pfn = phys_addr >> PAGE_SHIFT
}

/// 仮想ページ（VPN）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtPage {
    pub number: u64, // vpn = virt_addr >> PAGE_SHIFT
}

impl PhysAddr {
    pub fn align_down(self) -> PhysAddr {
        PhysAddr(self.0 & !PAGE_MASK)
    }

    /// このアドレスが含まれる物理フレーム
    pub fn frame(self) -> PhysFrame {
        PhysFrame {
            number: self.0 >> PAGE_SHIFT,
        }
    }

    pub fn add(self, off: u64) -> PhysAddr {
        PhysAddr(self.0.wrapping_add(off))
    }
}

impl VirtAddr {
    pub const fn new(v: u64) -> Self {
        VirtAddr(v)
    }

    pub fn align_down(self) -> VirtAddr {
        VirtAddr(self.0 & !PAGE_MASK)
    }

    pub fn page(self) -> VirtPage {
        VirtPage {
            number: self.0 >> PAGE_SHIFT,
        }
    }

    /// ページ内オフセット
    pub fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    pub fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// size バイト境界に揃っているか（size は 2 の冪）
    pub fn is_aligned_to(self, size: u64) -> bool {
        size == 0 || (self.0 & (size - 1)) == 0
    }

    pub fn add(self, off: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(off))
    }
}

impl PhysFrame {
    pub fn start_address(self) -> PhysAddr {
        PhysAddr(self.number << PAGE_SHIFT)
    }

    pub const fn from_index(number: u64) -> Self {
        PhysFrame { number }
    }

    /// フレーム内の offset を物理アドレスにする
    pub fn at(self, offset: u64) -> PhysAddr {
        PhysAddr((self.number << PAGE_SHIFT) | (offset & PAGE_MASK))
    }
}

impl VirtPage {
    pub fn start_address(self) -> VirtAddr {
        VirtAddr(self.number << PAGE_SHIFT)
    }

    pub const fn from_index(number: u64) -> Self {
        VirtPage { number }
    }

    pub fn next(self) -> VirtPage {
        VirtPage {
            number: self.number + 1,
        }
    }
}

// --- Debug 実装（ダンプで 0x... 表示にそろえる） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.start_address().0)
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPage({:#x})", self.start_address().0)
    }
}
