// kernel/src/arch/virt_layout.rs
//
// 役割:
// - アーキごとのカーネル側仮想アドレス窓と、その計算を行う純粋関数を提供する。
//
// やること:
// - 直接マップ窓（MIPS KSEG0/KSEG1、AArch64 DMAP）<-> 物理アドレスの変換
// - カーネル pmap がカバーする「TLB 経由の窓」（MIPS KSEG2、AArch64 kernel window）
//
// やらないこと:
// - TLB やページテーブルを触る（arch::tlb / mem::address_space 側の責務）
//
// MIPS:
//   0x8000_0000 ..  0xa000_0000  KSEG0（cached、直接マップ、TLB を通らない）
//   0xa000_0000 ..  0xc000_0000  KSEG1（uncached、直接マップ）
//   0xc000_0000 .. 0x1_0000_0000 KSEG2（TLB 経由、カーネル pmap）
//
// AArch64:
//   0xffff_0000_0000_0000 .. +4GiB       DMAP（直接マップ）
//   0xffff_ffff_8000_0000 .. +1GiB       kernel window（カーネル pmap）

use crate::arch::Arch;
use crate::mem::addr::{PhysAddr, VirtAddr};

pub const MIPS_KSEG0_BASE: u64 = 0x8000_0000;
pub const MIPS_KSEG1_BASE: u64 = 0xa000_0000;
pub const MIPS_KSEG2_BASE: u64 = 0xc000_0000;
pub const MIPS_KSEG2_END: u64 = 0x1_0000_0000;
/// KSEG0 / KSEG1 は物理下位 512MiB だけを見せる
pub const MIPS_KSEG_DIRECT_SIZE: u64 = 0x2000_0000;
const _: () = assert!(MIPS_KSEG1_BASE - MIPS_KSEG0_BASE == MIPS_KSEG_DIRECT_SIZE);
const _: () = assert!(MIPS_KSEG2_BASE - MIPS_KSEG1_BASE == MIPS_KSEG_DIRECT_SIZE);

pub const AARCH64_DMAP_BASE: u64 = 0xffff_0000_0000_0000;
pub const AARCH64_DMAP_SIZE: u64 = 1u64 << 32;
pub const AARCH64_KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;
pub const AARCH64_KERNEL_END: u64 = 0xffff_ffff_c000_0000;

/// TLB を通るカーネル窓 [start, end)
pub const fn kernel_window(arch: Arch) -> (u64, u64) {
    match arch {
        Arch::Mips32 => (MIPS_KSEG2_BASE, MIPS_KSEG2_END),
        Arch::AArch64 => (AARCH64_KERNEL_BASE, AARCH64_KERNEL_END),
    }
}

pub fn is_kernel_mapped(arch: Arch, va: VirtAddr) -> bool {
    let (start, end) = kernel_window(arch);
    va.0 >= start && va.0 < end
}

/// 直接マップ窓のアドレスなら、対応する物理アドレス
pub fn direct_to_phys(arch: Arch, va: VirtAddr) -> Option<PhysAddr> {
    match arch {
        Arch::Mips32 => {
            if va.0 >= MIPS_KSEG0_BASE && va.0 < MIPS_KSEG1_BASE {
                Some(PhysAddr(va.0 - MIPS_KSEG0_BASE))
            } else if va.0 >= MIPS_KSEG1_BASE && va.0 < MIPS_KSEG2_BASE {
                Some(PhysAddr(va.0 - MIPS_KSEG1_BASE))
            } else {
                None
            }
        }
        Arch::AArch64 => {
            let off = va.0.checked_sub(AARCH64_DMAP_BASE)?;
            if off < AARCH64_DMAP_SIZE {
                Some(PhysAddr(off))
            } else {
                None
            }
        }
    }
}
