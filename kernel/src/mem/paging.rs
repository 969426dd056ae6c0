// kernel/src/mem/paging.rs
//
// ソフトウェアページテーブルのエントリ形式と、保護属性の定義。
// - PTE は 32bit: [31..12] = PFN, [11..0] = PteFlags
// - TLB はこの表のキャッシュでしかないので、真の状態は常にここにある。

use crate::mem::addr::{PhysFrame, VirtPage, PAGE_SHIFT};

bitflags::bitflags! {
    /// 要求される保護属性（VM 層から渡される）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// PTE の下位ビット
    ///
    /// - VALID: マッピングが存在する
    /// - READ/WRITE/EXEC: 保護属性
    /// - USER: ユーザモードから参照可能
    /// - GLOBAL: ASID に関係なく一致する（カーネル用）
    /// - REFERENCED/MODIFIED: refill と TLB Modified 例外でエミュレートする
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXEC = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const REFERENCED = 1 << 6;
        const MODIFIED = 1 << 7;
    }
}

const PTE_FLAGS_MASK: u32 = (1 << PAGE_SHIFT) - 1;

impl PteFlags {
    pub fn from_prot(prot: Prot) -> PteFlags {
        let mut f = PteFlags::empty();
        if prot.contains(Prot::READ) {
            f |= PteFlags::READ;
        }
        if prot.contains(Prot::WRITE) {
            f |= PteFlags::WRITE;
        }
        if prot.contains(Prot::EXEC) {
            f |= PteFlags::EXEC;
        }
        f
    }

    pub fn prot(self) -> Prot {
        let mut p = Prot::empty();
        if self.contains(PteFlags::READ) {
            p |= Prot::READ;
        }
        if self.contains(PteFlags::WRITE) {
            p |= Prot::WRITE;
        }
        if self.contains(PteFlags::EXEC) {
            p |= Prot::EXEC;
        }
        p
    }
}

/// ページテーブルエントリ（物理メモリ上の 32bit 値そのもの）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte(pub u32);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: PhysFrame, flags: PteFlags) -> Pte {
        Pte(((frame.number as u32) << PAGE_SHIFT) | (flags.bits() & PTE_FLAGS_MASK))
    }

    pub fn frame(self) -> PhysFrame {
        PhysFrame::from_index((self.0 >> PAGE_SHIFT) as u64)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAGS_MASK)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    pub fn with_flags(self, flags: PteFlags) -> Pte {
        Pte::new(self.frame(), flags)
    }

    /// このアクセスが PTE の保護属性で許されるか
    pub fn permits(self, access: crate::types::Access) -> bool {
        use crate::types::Access;
        let f = self.flags();
        match access {
            Access::Load => f.contains(PteFlags::READ),
            Access::Store => f.contains(PteFlags::WRITE),
            Access::Fetch => f.contains(PteFlags::EXEC),
        }
    }
}

/// ページ単位のメモリ操作を表現する抽象イベント（trace 用）。
///
/// - Map: この仮想ページを、この物理フレームに、この属性でマップした
/// - Unmap: この仮想ページのマッピングを解除した
/// - Protect: 保護属性を変更した
#[derive(Clone, Copy, Debug)]
pub enum MemAction {
    Map {
        page: VirtPage,
        frame: PhysFrame,
        prot: Prot,
    },
    Unmap {
        page: VirtPage,
    },
    Protect {
        page: VirtPage,
        prot: Prot,
    },
}
