// kernel/src/kernel/entry.rs
//
// プロセッサの立ち上げと、pmap の MMU 側の操作。
//
// 役割:
// - bring_up: デバイスヒント検査 → sigcode フレーム → カーネル pmap → MMU 初期化
// - new_user_pmap: sigcode ページ（READ|EXEC）を載せたユーザ pmap を作る
// - activate / unmap / protect など、TLB に触る操作を割り込み禁止区間で包む
//
// やらないこと:
// - どのスレッドをいつ走らせるか（それは上位のスケジューラの責務）

use core::fmt;

use crate::arch::cpu::Cpu;
use crate::arch::Arch;
use crate::kernel::devhint::{self, HintError};
use crate::kernel::{LogEvent, Processor};
use crate::logging;
use crate::mem::addr::{PhysFrame, VirtAddr};
use crate::mem::address_space::{Mmu, Pmap, PmapError};
use crate::mem::layout::SIGCODE_VA;
use crate::mem::paging::Prot;
use crate::mm::{BusError, FrameAllocator, PhysMemory};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BringUpError {
    OutOfFrames,
    Pmap(PmapError),
    Bus(BusError),
    DeviceHints(HintError),
}

impl From<PmapError> for BringUpError {
    fn from(e: PmapError) -> Self {
        BringUpError::Pmap(e)
    }
}

impl fmt::Display for BringUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BringUpError::OutOfFrames => f.write_str("out of physical frames"),
            BringUpError::Pmap(e) => write!(f, "kernel pmap: {}", e),
            BringUpError::Bus(e) => write!(f, "signal trampoline: {}", e),
            BringUpError::DeviceHints(e) => write!(f, "device hints: {}", e),
        }
    }
}

impl Processor {
    /// プロセッサを使える状態にする。
    ///
    /// 戻ったとき: MMU は online、カーネル pmap が active、どのスレッドも走っていない。
    pub fn bring_up(
        arch: Arch,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
    ) -> Result<Processor, BringUpError> {
        logging::info_str("bring_up: arch", arch.name());

        devhint::validate(arch, devhint::HINTS).map_err(BringUpError::DeviceHints)?;

        let sigcode = frames.allocate_frame().ok_or(BringUpError::OutOfFrames)?;
        if let Err(e) = arch.install_signal_trampoline(mem, sigcode) {
            frames.free_frame(sigcode);
            return Err(BringUpError::Bus(e));
        }

        let mut kernel = match Pmap::new_kernel(arch, mem, frames) {
            Ok(k) => k,
            Err(e) => {
                frames.free_frame(sigcode);
                return Err(e.into());
            }
        };

        let mut p = Processor::new(arch, Cpu::new(arch), Mmu::new(arch));
        let cs = p.cpu.mask();
        p.mmu.init(&cs);
        p.mmu.activate(&cs, &mut kernel);
        p.cpu.restore(cs);

        p.kernel_pmap = Some(kernel);
        p.sigcode = Some(sigcode);

        logging::info_u64("bring_up: tlb entries", arch.tlb_entries() as u64);
        logging::info_u64("bring_up: asid bits", arch.asid_bits() as u64);
        logging::info_u64("bring_up: sigcode pa", sigcode.start_address().0);

        let v = p.debug_check_invariants();
        if v != 0 {
            logging::warn("bring_up: invariant violations");
            logging::info_u64("violations", v as u64);
        }
        logging::info("bring_up: done");
        Ok(p)
    }

    /// カーネル pmap と sigcode フレームを返し、MMU を止める。2 回目以降は何もしない。
    pub fn shutdown(
        &mut self,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), PmapError> {
        let kernel = match self.kernel_pmap.take() {
            Some(k) => k,
            None => return Ok(()),
        };

        let cs = self.cpu.mask();
        let r = kernel.destroy(mem, frames, &mut self.mmu, &cs);
        self.mmu.teardown(&cs);
        self.cpu.restore(cs);

        if let Some(f) = self.sigcode.take() {
            frames.free_frame(f);
        }
        self.current = None;
        self.fpu_owner = None;

        logging::info("shutdown: MMU offline");
        r
    }

    /// ユーザ pmap を作り、sigcode ページを READ|EXEC で載せる
    pub fn new_user_pmap(
        &mut self,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
    ) -> Result<Pmap, PmapError> {
        let sigcode: PhysFrame = self.sigcode.ok_or(PmapError::NotMapped)?;

        let mut pmap = Pmap::new_user(mem, frames)?;
        if let Err(e) = pmap.map(mem, frames, VirtAddr(SIGCODE_VA), sigcode, Prot::READ | Prot::EXEC) {
            let cs = self.cpu.mask();
            let r = pmap.destroy(mem, frames, &mut self.mmu, &cs);
            self.cpu.restore(cs);
            // 呼び出し側に返すのは map の失敗の方
            if let Err(d) = r {
                log::warn!("new_user_pmap: cleanup after failed sigcode map: {}", d);
            }
            return Err(e);
        }
        Ok(pmap)
    }

    /// pmap を捨てる（TLB から追い出してテーブルフレームを返す）
    pub fn destroy_pmap(
        &mut self,
        pmap: Pmap,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), PmapError> {
        let cs = self.cpu.mask();
        let r = pmap.destroy(mem, frames, &mut self.mmu, &cs);
        self.cpu.restore(cs);
        r
    }

    /// pmap を現在のアドレス空間にする。ASID の世代が進んで全体フラッシュしたら true。
    pub fn activate(&mut self, pmap: &mut Pmap) -> bool {
        let cs = self.cpu.mask();
        let flushed = self.mmu.activate(&cs, pmap);
        self.cpu.restore(cs);

        if flushed {
            let generation = self.mmu.asid_generation();
            self.push_event(LogEvent::AsidRollover { generation });
            logging::info_u64("asid rollover: generation", generation);
        }
        flushed
    }

    /// トラップ処理やコピーの前に、対象の空間が active であることを保証する
    pub(crate) fn ensure_active(&mut self, pmap: &mut Pmap) {
        if self.mmu.active() != Some(pmap.id()) {
            self.activate(pmap);
        }
    }

    /// カーネル窓にフレームを載せる
    pub fn map_kernel(
        &mut self,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
        va: VirtAddr,
        frame: PhysFrame,
        prot: Prot,
    ) -> Result<(), PmapError> {
        let kernel = self.kernel_pmap.as_mut().ok_or(PmapError::NotMapped)?;
        kernel.map(mem, frames, va, frame, prot)
    }

    /// カーネルページを TLB に固定する。固定スロットが足りなければ Ok(None)。
    pub fn pin_kernel_page(
        &mut self,
        mem: &dyn PhysMemory,
        va: VirtAddr,
    ) -> Result<Option<usize>, PmapError> {
        let cs = self.cpu.mask();
        let r = match self.kernel_pmap.as_ref() {
            Some(kernel) => self.mmu.wire(&cs, kernel, mem, va),
            None => Err(PmapError::NotMapped),
        };
        self.cpu.restore(cs);
        r
    }

    /// カーネル窓のマッピングを外す。固定されていたページは固定も外れる。
    pub fn unmap_kernel(
        &mut self,
        mem: &mut dyn PhysMemory,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<u64, PmapError> {
        let kernel = self.kernel_pmap.as_mut().ok_or(PmapError::NotMapped)?;
        let cs = self.cpu.mask();
        let r = kernel.unmap(mem, &mut self.mmu, &cs, start, end);
        self.cpu.restore(cs);
        r
    }

    /// カーネル窓の保護を変える。固定されていたページは固定が外れ、次の参照で refill される。
    pub fn protect_kernel(
        &mut self,
        mem: &mut dyn PhysMemory,
        start: VirtAddr,
        end: VirtAddr,
        prot: Prot,
    ) -> Result<(), PmapError> {
        let kernel = self.kernel_pmap.as_mut().ok_or(PmapError::NotMapped)?;
        let cs = self.cpu.mask();
        let r = kernel.protect(mem, &mut self.mmu, &cs, start, end, prot);
        self.cpu.restore(cs);
        r
    }

    pub fn unmap(
        &mut self,
        pmap: &mut Pmap,
        mem: &mut dyn PhysMemory,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<u64, PmapError> {
        let cs = self.cpu.mask();
        let r = pmap.unmap(mem, &mut self.mmu, &cs, start, end);
        self.cpu.restore(cs);
        r
    }

    pub fn protect(
        &mut self,
        pmap: &mut Pmap,
        mem: &mut dyn PhysMemory,
        start: VirtAddr,
        end: VirtAddr,
        prot: Prot,
    ) -> Result<(), PmapError> {
        let cs = self.cpu.mask();
        let r = pmap.protect(mem, &mut self.mmu, &cs, start, end, prot);
        self.cpu.restore(cs);
        r
    }

    pub fn clear_modified(
        &mut self,
        pmap: &mut Pmap,
        mem: &mut dyn PhysMemory,
        va: VirtAddr,
    ) -> Result<bool, PmapError> {
        let cs = self.cpu.mask();
        let r = pmap.clear_modified(mem, &mut self.mmu, &cs, va);
        self.cpu.restore(cs);
        r
    }

    pub fn clear_referenced(
        &mut self,
        pmap: &mut Pmap,
        mem: &mut dyn PhysMemory,
        va: VirtAddr,
    ) -> Result<bool, PmapError> {
        let cs = self.cpu.mask();
        let r = pmap.clear_referenced(mem, &mut self.mmu, &cs, va);
        self.cpu.restore(cs);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Exception;
    use crate::mem::addr::{PhysAddr, PAGE_SIZE};
    use crate::mm::{FlatRam, RangeFrameAllocator};
    use crate::types::{Access, Mode};
    use pretty_assertions::assert_eq;

    const RAM: usize = 64 * 4096;

    #[test]
    fn bring_up_installs_trampoline_and_goes_online() {
        for arch in Arch::ALL {
            let mut buf = vec![0u8; RAM];
            let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
            let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64));

            let p = Processor::bring_up(arch, &mut ram, &mut frames).unwrap();
            assert!(p.mmu.is_online());
            assert!(p.kernel_pmap().is_some());
            assert_eq!(p.current(), None);
            assert_eq!(p.debug_check_invariants(), 0);

            let f = p.sigcode_frame().unwrap();
            for (i, w) in arch.sigcode().iter().enumerate() {
                assert_eq!(ram.read_u32(f.at(i as u64 * 4)).unwrap(), *w);
            }
        }
    }

    #[test]
    fn user_pmap_carries_read_exec_sigcode() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64));
        let mut p = Processor::bring_up(Arch::Mips32, &mut ram, &mut frames).unwrap();

        let space = p.new_user_pmap(&mut ram, &mut frames).unwrap();
        let pte = space.pte(&ram, VirtAddr(SIGCODE_VA)).unwrap();
        assert!(pte.is_valid());
        assert_eq!(pte.flags().prot(), Prot::READ | Prot::EXEC);
        assert_eq!(Some(pte.frame()), p.sigcode_frame());
    }

    #[test]
    fn failed_sigcode_map_returns_the_directory_frame() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64 / 2));
        let mut p = Processor::bring_up(Arch::Mips32, &mut ram, &mut frames).unwrap();

        // ディレクトリ分の 1 枚だけ。葉テーブルが取れずに失敗する
        let mut one = RangeFrameAllocator::new(PhysAddr(RAM as u64 - 0x1000), PhysAddr(RAM as u64));
        assert_eq!(p.new_user_pmap(&mut ram, &mut one).err(), Some(PmapError::OutOfFrames));
        assert_eq!(one.remaining(), 1);
    }

    #[test]
    fn asid_exhaustion_flushes_exactly_once() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64));
        let mut p = Processor::bring_up(Arch::Mips32, &mut ram, &mut frames).unwrap();

        let capacity = (1u32 << Arch::Mips32.asid_bits()) - 1;
        let mut flushes = 0;
        for _ in 0..capacity + 1 {
            let mut space = p.new_user_pmap(&mut ram, &mut frames).unwrap();
            if p.activate(&mut space) {
                flushes += 1;
            }
            p.destroy_pmap(space, &mut ram, &mut frames).unwrap();
        }
        assert_eq!(flushes, 1);
        assert_eq!(p.mmu.asid_generation(), 1);

        let mut rollovers = 0;
        p.for_each_event(|ev| {
            if let LogEvent::AsidRollover { .. } = ev {
                rollovers += 1;
            }
        });
        assert_eq!(rollovers, 1);
    }

    #[test]
    fn shutdown_returns_every_frame() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64));
        let before = frames.remaining();

        let mut p = Processor::bring_up(Arch::AArch64, &mut ram, &mut frames).unwrap();
        let space = p.new_user_pmap(&mut ram, &mut frames).unwrap();
        p.destroy_pmap(space, &mut ram, &mut frames).unwrap();
        p.shutdown(&mut ram, &mut frames).unwrap();

        assert_eq!(frames.remaining(), before);
        assert!(!p.mmu.is_online());
        assert_eq!(p.debug_check_invariants(), 0);
        assert_eq!(p.new_user_pmap(&mut ram, &mut frames).err(), Some(PmapError::NotMapped));
        p.shutdown(&mut ram, &mut frames).unwrap();
    }

    const KVA: VirtAddr = VirtAddr(0xc000_0000);

    fn pinned_kernel_page(ram: &mut FlatRam<'_>, frames: &mut RangeFrameAllocator) -> Processor {
        let mut p = Processor::bring_up(Arch::Mips32, ram, frames).unwrap();
        let frame = frames.allocate_frame().unwrap();
        p.map_kernel(ram, frames, KVA, frame, Prot::READ | Prot::WRITE).unwrap();
        assert_eq!(p.pin_kernel_page(ram, KVA).unwrap(), Some(0));
        assert_eq!(
            p.mmu.translate(Mode::Kernel, KVA, Access::Load),
            Ok(frame.start_address())
        );
        p
    }

    #[test]
    fn unmapping_a_pinned_kernel_page_drops_the_wired_entry() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64));
        let mut p = pinned_kernel_page(&mut ram, &mut frames);

        assert_eq!(p.unmap_kernel(&mut ram, KVA, KVA.add(PAGE_SIZE)), Ok(1));
        assert!(matches!(
            p.mmu.translate(Mode::Kernel, KVA, Access::Load),
            Err(Exception::TlbMiss { .. })
        ));
        assert_eq!(p.mmu.tlb().wired(), 0);
        assert_eq!(p.kernel_pmap().unwrap().extract(&ram, KVA), Ok(None));
    }

    #[test]
    fn protecting_a_pinned_kernel_page_takes_effect_at_once() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64));
        let mut p = pinned_kernel_page(&mut ram, &mut frames);

        // 固定エントリへの最初の書き込み: その場で dirty に差し替わり、重複は作らない
        {
            let cs = p.cpu.mask();
            let kernel = p.kernel_pmap.as_ref().unwrap();
            assert_eq!(p.mmu.emulate_modified(&cs, kernel, &mut ram, KVA), Ok(true));
            p.cpu.restore(cs);
        }
        assert!(p.mmu.translate(Mode::Kernel, KVA, Access::Store).is_ok());
        assert_eq!(p.mmu.tlb().occupancy(), 1);

        p.protect_kernel(&mut ram, KVA, KVA.add(PAGE_SIZE), Prot::READ).unwrap();
        assert!(p.mmu.translate(Mode::Kernel, KVA, Access::Store).is_err());
        assert_eq!(p.mmu.tlb().wired(), 0);
        assert_eq!(p.kernel_pmap().unwrap().pte(&ram, KVA).unwrap().flags().prot(), Prot::READ);
    }

    #[test]
    fn kernel_window_ops_need_a_kernel_pmap() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(RAM as u64));
        let mut p = Processor::bring_up(Arch::AArch64, &mut ram, &mut frames).unwrap();
        p.shutdown(&mut ram, &mut frames).unwrap();
        assert_eq!(
            p.unmap_kernel(&mut ram, KVA, KVA.add(PAGE_SIZE)),
            Err(PmapError::NotMapped)
        );
    }

    #[test]
    fn bring_up_without_frames_fails_cleanly() {
        let mut buf = vec![0u8; RAM];
        let mut ram = FlatRam::new(PhysAddr(0), buf.as_mut_slice());
        let mut frames = RangeFrameAllocator::new(PhysAddr(0x1000), PhysAddr(0x2000));
        assert_eq!(
            Processor::bring_up(Arch::Mips32, &mut ram, &mut frames).err(),
            Some(BringUpError::Pmap(PmapError::OutOfFrames))
        );
        assert_eq!(frames.remaining(), 1);
    }
}
