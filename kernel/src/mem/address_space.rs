// kernel/src/mem/address_space.rs
//
// 役割:
// - pmap: 1 つのアドレス空間の「仮想ページ → (物理フレーム, 保護, 属性)」を保持する。
//   実体は物理フレーム上の 2 段のソフトウェアページテーブル。
// - Mmu: プロセッサに 1 つだけの TLB と ASID 表。pmap コンポーネントが所有し、
//   割り込み禁止区間（CriticalSection）からしか変更しない。
//
// テーブル形式:
// - ディレクトリ: 1024 × u32。エントリ = (リーフの PFN << 12) | VALID
// - リーフ:       1024 × u32。エントリ = Pte（mem::paging）
// - 1 エントリ 4KiB、ディレクトリ 1 枚で 4GiB の窓をカバーする
//
// 不変条件:
// - 1 つの pmap の中で、有効なマッピングが同じ物理フレームを 2 回指すことはない
// - TLB はこの表のキャッシュでしかない（いつ捨てても refill で戻る）
// - unmap / protect は、戻る前に (ASID, va) の TLB エントリを無効化する
// - refill は表を読む（と REFERENCED を立てる）だけで、フレームアロケータには触らない

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::cpu::CriticalSection;
use crate::arch::tlb::{Tlb, TlbEntry, TlbStats};
use crate::arch::{virt_layout, Arch, Exception};
use crate::kernel::trace;
use crate::mem::addr::{PhysAddr, PhysFrame, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use crate::mem::asid::{AllocatedAsid, AsidAllocator, KERNEL_ASID};
use crate::mem::layout::{USER_SPACE_END, USER_SPACE_START};
use crate::mem::paging::{MemAction, Prot, Pte, PteFlags};
use crate::mm::pagetable_init::allocate_zeroed_table;
use crate::mm::{FrameAllocator, PhysMemory};
use crate::types::{Access, Mode};

const ENTRIES_PER_TABLE: u64 = 1024;
const PDE_SHIFT: u64 = 22;
const PDE_VALID: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceKind {
    Kernel,
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(pub u32);

static NEXT_PMAP_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmapError {
    AlreadyMapped,
    NotMapped,
    /// 同じ物理フレームがこの空間ですでにマップされている
    FrameAliased,
    OutOfFrames,
    OutOfRange,
    Misaligned,
    /// テーブルが物理メモリの外を指している
    TableCorrupted,
}

impl fmt::Display for PmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PmapError::AlreadyMapped => "already mapped",
            PmapError::NotMapped => "not mapped",
            PmapError::FrameAliased => "frame already mapped in this space",
            PmapError::OutOfFrames => "out of frames",
            PmapError::OutOfRange => "address outside of pmap window",
            PmapError::Misaligned => "address not page aligned",
            PmapError::TableCorrupted => "page table corrupted",
        };
        f.write_str(s)
    }
}

pub struct Pmap {
    id: PmapId,
    kind: AddressSpaceKind,
    /// マップを許す範囲 [start, end)
    start: u64,
    end: u64,
    /// テーブル添字の基準アドレス
    base: u64,
    directory: PhysFrame,
    asid: Option<AllocatedAsid>,
    resident: u64,
}

impl Pmap {
    /// ユーザ空間用 pmap
    pub fn new_user(
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
    ) -> Result<Self, PmapError> {
        Self::new_with_kind(AddressSpaceKind::User, 0, USER_SPACE_START, USER_SPACE_END, mem, frames)
    }

    /// カーネル用 pmap（TLB を通るカーネル窓をカバー）
    pub fn new_kernel(
        arch: Arch,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
    ) -> Result<Self, PmapError> {
        let (start, end) = virt_layout::kernel_window(arch);
        Self::new_with_kind(AddressSpaceKind::Kernel, start, start, end, mem, frames)
    }

    fn new_with_kind(
        kind: AddressSpaceKind,
        base: u64,
        start: u64,
        end: u64,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
    ) -> Result<Self, PmapError> {
        let directory = allocate_zeroed_table(mem, frames).ok_or(PmapError::OutOfFrames)?;
        Ok(Pmap {
            id: PmapId(NEXT_PMAP_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            start,
            end,
            base,
            directory,
            asid: None,
            resident: 0,
        })
    }

    pub fn id(&self) -> PmapId {
        self.id
    }

    pub fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    pub fn asid(&self) -> Option<AllocatedAsid> {
        self.asid
    }

    /// 有効なマッピングの数
    pub fn mapping_count(&self) -> u64 {
        self.resident
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va.0 >= self.start && va.0 < self.end
    }

    fn check_page(&self, va: VirtAddr) -> Result<(), PmapError> {
        if !va.is_page_aligned() {
            return Err(PmapError::Misaligned);
        }
        if !self.contains(va) {
            return Err(PmapError::OutOfRange);
        }
        Ok(())
    }

    fn check_range(&self, start: VirtAddr, end: VirtAddr) -> Result<(), PmapError> {
        if !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(PmapError::Misaligned);
        }
        if start.0 > end.0 || start.0 < self.start || end.0 > self.end {
            return Err(PmapError::OutOfRange);
        }
        Ok(())
    }

    fn pde_addr(&self, va: VirtAddr) -> PhysAddr {
        let idx = ((va.0 - self.base) >> PDE_SHIFT) & (ENTRIES_PER_TABLE - 1);
        self.directory.at(idx * 4)
    }

    fn pte_index(&self, va: VirtAddr) -> u64 {
        ((va.0 - self.base) >> PAGE_SHIFT) & (ENTRIES_PER_TABLE - 1)
    }

    /// va の PTE の物理アドレス。リーフが無ければ None。
    fn pte_addr(&self, mem: &dyn PhysMemory, va: VirtAddr) -> Result<Option<PhysAddr>, PmapError> {
        let pde = mem
            .read_u32(self.pde_addr(va))
            .map_err(|_| PmapError::TableCorrupted)?;
        if pde & PDE_VALID == 0 {
            return Ok(None);
        }
        let leaf = Pte(pde).frame();
        Ok(Some(leaf.at(self.pte_index(va) * 4)))
    }

    /// va の PTE の物理アドレス。リーフが無ければ確保する。
    fn pte_addr_alloc(
        &self,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
        va: VirtAddr,
    ) -> Result<PhysAddr, PmapError> {
        if let Some(pa) = self.pte_addr(mem, va)? {
            return Ok(pa);
        }
        let leaf = allocate_zeroed_table(mem, frames).ok_or(PmapError::OutOfFrames)?;
        let pde = ((leaf.number as u32) << PAGE_SHIFT) | PDE_VALID;
        mem.write_u32(self.pde_addr(va), pde)
            .map_err(|_| PmapError::TableCorrupted)?;
        Ok(leaf.at(self.pte_index(va) * 4))
    }

    /// va の PTE を読む（表を歩くだけ）
    pub fn pte(&self, mem: &dyn PhysMemory, va: VirtAddr) -> Result<Pte, PmapError> {
        if !self.contains(va) {
            return Ok(Pte::EMPTY);
        }
        let va = va.align_down();
        match self.pte_addr(mem, va)? {
            Some(pa) => mem.read_u32(pa).map(Pte).map_err(|_| PmapError::TableCorrupted),
            None => Ok(Pte::EMPTY),
        }
    }

    fn write_pte(&self, mem: &mut dyn PhysMemory, va: VirtAddr, pte: Pte) -> Result<(), PmapError> {
        let pa = self.pte_addr(mem, va)?.ok_or(PmapError::NotMapped)?;
        mem.write_u32(pa, pte.0).map_err(|_| PmapError::TableCorrupted)
    }

    /// 有効なマッピングを順に f に渡す
    pub fn for_each_mapping<F>(&self, mem: &dyn PhysMemory, mut f: F) -> Result<(), PmapError>
    where
        F: FnMut(VirtAddr, Pte),
    {
        for d in 0..ENTRIES_PER_TABLE {
            let pde = mem
                .read_u32(self.directory.at(d * 4))
                .map_err(|_| PmapError::TableCorrupted)?;
            if pde & PDE_VALID == 0 {
                continue;
            }
            let leaf = Pte(pde).frame();
            for i in 0..ENTRIES_PER_TABLE {
                let pte = mem
                    .read_u32(leaf.at(i * 4))
                    .map(Pte)
                    .map_err(|_| PmapError::TableCorrupted)?;
                if pte.is_valid() {
                    let va = self.base + (d << PDE_SHIFT) + (i << PAGE_SHIFT);
                    f(VirtAddr(va), pte);
                }
            }
        }
        Ok(())
    }

    fn is_frame_mapped(&self, mem: &dyn PhysMemory, frame: PhysFrame) -> Result<bool, PmapError> {
        let mut found = false;
        self.for_each_mapping(mem, |_, pte| {
            if pte.frame() == frame {
                found = true;
            }
        })?;
        Ok(found)
    }

    /// va → frame を prot でマップする。
    ///
    /// - 既存のマッピングは上書きしない（AlreadyMapped）
    /// - 同じフレームの二重マップは拒否する（FrameAliased）
    /// - 新しいマッピングなので TLB に古いエントリは居ない
    pub fn map(
        &mut self,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
        va: VirtAddr,
        frame: PhysFrame,
        prot: Prot,
    ) -> Result<(), PmapError> {
        self.check_page(va)?;
        if self.pte(mem, va)?.is_valid() {
            return Err(PmapError::AlreadyMapped);
        }
        if self.is_frame_mapped(mem, frame)? {
            return Err(PmapError::FrameAliased);
        }

        let mut flags = PteFlags::VALID | PteFlags::from_prot(prot);
        flags |= match self.kind {
            AddressSpaceKind::User => PteFlags::USER,
            AddressSpaceKind::Kernel => PteFlags::GLOBAL,
        };

        let pa = self.pte_addr_alloc(mem, frames, va)?;
        mem.write_u32(pa, Pte::new(frame, flags).0)
            .map_err(|_| PmapError::TableCorrupted)?;
        self.resident += 1;

        trace::trace_mem(MemAction::Map {
            page: va.page(),
            frame,
            prot,
        });
        Ok(())
    }

    /// [start, end) のマッピングを外す。穴は飛ばす。外したページ数を返す。
    pub fn unmap(
        &mut self,
        mem: &mut dyn PhysMemory,
        mmu: &mut Mmu,
        cs: &CriticalSection,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<u64, PmapError> {
        self.check_range(start, end)?;
        let mut removed = 0;
        let mut va = start;
        while va.0 < end.0 {
            if self.pte(mem, va)?.is_valid() {
                self.write_pte(mem, va, Pte::EMPTY)?;
                mmu.invalidate_page(cs, self, va);
                self.resident -= 1;
                removed += 1;
                trace::trace_mem(MemAction::Unmap { page: va.page() });
            }
            va = va.add(PAGE_SIZE);
        }
        Ok(removed)
    }

    /// [start, end) の保護属性を prot に変える。prot が空なら unmap と同じ。
    pub fn protect(
        &mut self,
        mem: &mut dyn PhysMemory,
        mmu: &mut Mmu,
        cs: &CriticalSection,
        start: VirtAddr,
        end: VirtAddr,
        prot: Prot,
    ) -> Result<(), PmapError> {
        if prot.is_empty() {
            return self.unmap(mem, mmu, cs, start, end).map(|_| ());
        }
        self.check_range(start, end)?;

        let keep = PteFlags::VALID
            | PteFlags::USER
            | PteFlags::GLOBAL
            | PteFlags::REFERENCED
            | PteFlags::MODIFIED;
        let mut va = start;
        while va.0 < end.0 {
            let pte = self.pte(mem, va)?;
            if pte.is_valid() {
                let flags = (pte.flags() & keep) | PteFlags::from_prot(prot);
                self.write_pte(mem, va, pte.with_flags(flags))?;
                mmu.invalidate_page(cs, self, va);
                trace::trace_mem(MemAction::Protect {
                    page: va.page(),
                    prot,
                });
            }
            va = va.add(PAGE_SIZE);
        }
        Ok(())
    }

    /// va → 物理アドレス（ページ内オフセット込み）
    pub fn extract(&self, mem: &dyn PhysMemory, va: VirtAddr) -> Result<Option<PhysAddr>, PmapError> {
        let pte = self.pte(mem, va)?;
        if !pte.is_valid() {
            return Ok(None);
        }
        Ok(Some(pte.frame().at(va.page_offset())))
    }

    pub fn is_referenced(&self, mem: &dyn PhysMemory, va: VirtAddr) -> Result<bool, PmapError> {
        Ok(self.pte(mem, va)?.flags().contains(PteFlags::REFERENCED))
    }

    pub fn is_modified(&self, mem: &dyn PhysMemory, va: VirtAddr) -> Result<bool, PmapError> {
        Ok(self.pte(mem, va)?.flags().contains(PteFlags::MODIFIED))
    }

    /// REFERENCED を落とす。次のアクセスで refill が立て直せるよう TLB からも外す。
    pub fn clear_referenced(
        &mut self,
        mem: &mut dyn PhysMemory,
        mmu: &mut Mmu,
        cs: &CriticalSection,
        va: VirtAddr,
    ) -> Result<bool, PmapError> {
        self.clear_flag(mem, mmu, cs, va, PteFlags::REFERENCED)
    }

    /// MODIFIED を落とす。次の書き込みで TLB Modified 例外が再び起きる。
    pub fn clear_modified(
        &mut self,
        mem: &mut dyn PhysMemory,
        mmu: &mut Mmu,
        cs: &CriticalSection,
        va: VirtAddr,
    ) -> Result<bool, PmapError> {
        self.clear_flag(mem, mmu, cs, va, PteFlags::MODIFIED)
    }

    fn clear_flag(
        &mut self,
        mem: &mut dyn PhysMemory,
        mmu: &mut Mmu,
        cs: &CriticalSection,
        va: VirtAddr,
        flag: PteFlags,
    ) -> Result<bool, PmapError> {
        let va = va.align_down();
        let pte = self.pte(mem, va)?;
        if !pte.is_valid() {
            return Err(PmapError::NotMapped);
        }
        let was_set = pte.flags().contains(flag);
        if was_set {
            self.write_pte(mem, va, pte.with_flags(pte.flags() - flag))?;
            mmu.invalidate_page(cs, self, va);
        }
        Ok(was_set)
    }

    /// pmap を破棄する。TLB から追い出し、テーブル用フレームを返す。
    ///
    /// マップされていたデータフレーム自体は VM 層の持ち物なので返さない。
    pub fn destroy(
        self,
        mem: &mut dyn PhysMemory,
        frames: &mut dyn FrameAllocator,
        mmu: &mut Mmu,
        cs: &CriticalSection,
    ) -> Result<(), PmapError> {
        mmu.forget(cs, &self);
        for d in 0..ENTRIES_PER_TABLE {
            let pde = mem
                .read_u32(self.directory.at(d * 4))
                .map_err(|_| PmapError::TableCorrupted)?;
            if pde & PDE_VALID != 0 {
                frames.free_frame(Pte(pde).frame());
            }
        }
        frames.free_frame(self.directory);
        Ok(())
    }
}

/// refill の結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refill {
    /// TLB に入れた（スロット番号）
    Installed(usize),
    /// 表にマッピングが無い（本物のページフォールト）
    NotMapped,
}

/// プロセッサに 1 つの TLB + ASID 表
pub struct Mmu {
    arch: Arch,
    tlb: Tlb,
    asids: AsidAllocator,
    /// 現在の ASID（EntryHi.ASID / TTBR0.ASID）
    current_asid: u16,
    active: Option<PmapId>,
    online: bool,
}

impl Mmu {
    pub fn new(arch: Arch) -> Self {
        Mmu {
            arch,
            tlb: Tlb::new(arch.tlb_entries()),
            asids: AsidAllocator::new(arch.asid_bits()),
            current_asid: KERNEL_ASID,
            active: None,
            online: false,
        }
    }

    /// プロセッサ起動時: TLB を空にして使用可能にする
    pub fn init(&mut self, cs: &CriticalSection) {
        self.tlb.reset(cs);
        self.current_asid = KERNEL_ASID;
        self.active = None;
        self.online = true;
    }

    /// プロセッサ停止時: 固定エントリも含めて空にする
    pub fn teardown(&mut self, cs: &CriticalSection) {
        self.tlb.flush(cs);
        self.tlb.reset(cs);
        self.active = None;
        self.current_asid = KERNEL_ASID;
        self.online = false;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    pub fn stats(&self) -> TlbStats {
        self.tlb.stats()
    }

    pub fn asid_generation(&self) -> u64 {
        self.asids.generation()
    }

    pub fn current_asid(&self) -> u16 {
        self.current_asid
    }

    pub fn active(&self) -> Option<PmapId> {
        self.active
    }

    fn live_asid(&self, pmap: &Pmap) -> Option<u16> {
        match pmap.kind {
            AddressSpaceKind::Kernel => Some(KERNEL_ASID),
            AddressSpaceKind::User => pmap
                .asid
                .filter(|a| a.is_valid(self.asids.generation()))
                .map(|a| a.asid),
        }
    }

    /// pmap を現在のアドレス空間にする。
    ///
    /// ASID を使い切っていたら、ここで 1 回だけ全体フラッシュしてから再利用する。
    /// フラッシュしたら true。
    pub fn activate(&mut self, cs: &CriticalSection, pmap: &mut Pmap) -> bool {
        if pmap.kind == AddressSpaceKind::Kernel {
            self.current_asid = KERNEL_ASID;
            self.active = Some(pmap.id);
            return false;
        }

        let mut flushed = false;
        let asid = match self.live_asid(pmap) {
            Some(a) => a,
            None => {
                let grant = self.asids.allocate();
                if grant.rolled_over {
                    self.tlb.flush(cs);
                    flushed = true;
                    trace::trace_tlb_flush(grant.asid.generation);
                }
                pmap.asid = Some(grant.asid);
                grant.asid.asid
            }
        };

        self.current_asid = asid;
        self.active = Some(pmap.id);
        flushed
    }

    /// (pmap の ASID, va) の TLB エントリを捨てる。現世代の ASID を持たない pmap は何もしない。
    pub fn invalidate_page(&mut self, cs: &CriticalSection, pmap: &Pmap, va: VirtAddr) {
        if let Some(asid) = self.live_asid(pmap) {
            if self.tlb.invalidate(cs, asid, va.page().number) {
                trace::trace_tlb_invalidate(asid, va.0);
            }
        }
    }

    /// pmap のエントリを TLB からすべて追い出し、active なら外す
    fn forget(&mut self, cs: &CriticalSection, pmap: &Pmap) {
        if pmap.kind == AddressSpaceKind::User {
            if let Some(asid) = self.live_asid(pmap) {
                self.tlb.invalidate_asid(cs, asid);
            }
        }
        if self.active == Some(pmap.id) {
            self.active = None;
            self.current_asid = KERNEL_ASID;
        }
    }

    fn entry_for(asid: u16, va: VirtAddr, pte: Pte) -> TlbEntry {
        let f = pte.flags();
        TlbEntry {
            asid,
            vpn: va.page().number,
            pfn: pte.frame().number,
            dirty: f.contains(PteFlags::WRITE) && f.contains(PteFlags::MODIFIED),
            global: f.contains(PteFlags::GLOBAL),
            read_inhibit: !f.contains(PteFlags::READ),
            exec_inhibit: !f.contains(PteFlags::EXEC),
            user: f.contains(PteFlags::USER),
        }
    }

    /// TLB refill: 表を歩いて有効なら置換スロットに入れる。
    ///
    /// 物理メモリの読み出しと REFERENCED の書き込みしかしない。
    pub fn refill(
        &mut self,
        cs: &CriticalSection,
        pmap: &Pmap,
        mem: &mut dyn PhysMemory,
        va: VirtAddr,
    ) -> Result<Refill, PmapError> {
        let asid = match self.live_asid(pmap) {
            Some(a) => a,
            None => return Ok(Refill::NotMapped),
        };
        let page = va.align_down();
        let pte = pmap.pte(mem, page)?;
        if !pte.is_valid() {
            return Ok(Refill::NotMapped);
        }

        let pte = if pte.flags().contains(PteFlags::REFERENCED) {
            pte
        } else {
            let p = pte.with_flags(pte.flags() | PteFlags::REFERENCED);
            pmap.write_pte(mem, page, p)?;
            p
        };

        let slot = self.tlb.write_random(cs, Self::entry_for(asid, page, pte));
        trace::trace_tlb_refill(asid, page.0, slot);
        Ok(Refill::Installed(slot))
    }

    /// 書き込み可能だがまだ MODIFIED でないページへの書き込み（TLB Modified）。
    ///
    /// 書き込み可なら MODIFIED を立てて dirty なエントリに差し替え true。
    /// 書き込み不可なら false（保護違反）。
    pub fn emulate_modified(
        &mut self,
        cs: &CriticalSection,
        pmap: &Pmap,
        mem: &mut dyn PhysMemory,
        va: VirtAddr,
    ) -> Result<bool, PmapError> {
        let asid = match self.live_asid(pmap) {
            Some(a) => a,
            None => return Ok(false),
        };
        let page = va.align_down();
        let pte = pmap.pte(mem, page)?;
        if !pte.is_valid() || !pte.flags().contains(PteFlags::WRITE) {
            return Ok(false);
        }
        let p = pte.with_flags(pte.flags() | PteFlags::REFERENCED | PteFlags::MODIFIED);
        pmap.write_pte(mem, page, p)?;
        let e = Self::entry_for(asid, page, p);
        // 固定スロットに居ればその場で差し替える（置換領域に重複を作らない）
        match self.tlb.lookup(asid, e.vpn) {
            Some((i, _)) => {
                self.tlb.overwrite(cs, i, e);
            }
            None => {
                self.tlb.write_random(cs, e);
            }
        }
        Ok(true)
    }

    /// カーネルページを GLOBAL で TLB に固定する
    pub fn wire(
        &mut self,
        cs: &CriticalSection,
        kernel: &Pmap,
        mem: &dyn PhysMemory,
        va: VirtAddr,
    ) -> Result<Option<usize>, PmapError> {
        let page = va.align_down();
        let pte = kernel.pte(mem, page)?;
        if !pte.is_valid() {
            return Err(PmapError::NotMapped);
        }
        Ok(self.tlb.write_wired(cs, Self::entry_for(KERNEL_ASID, page, pte)))
    }

    /// ハードウェアのアドレス変換。失敗は例外として返す。
    ///
    /// - 直接マップ窓（KSEG0/KSEG1、DMAP）はカーネルモードなら TLB を通らない
    /// - ユーザモードからユーザ空間外への参照はアドレスエラー
    pub fn translate(&self, mode: Mode, va: VirtAddr, access: Access) -> Result<PhysAddr, Exception> {
        let user = mode.is_user();
        if user && va.0 >= USER_SPACE_END {
            return Err(Exception::AddressError { va: va.0, access });
        }
        if !user {
            if let Some(pa) = virt_layout::direct_to_phys(self.arch, va) {
                return Ok(pa);
            }
        }

        let (_, e) = self
            .tlb
            .lookup(self.current_asid, va.page().number)
            .ok_or(Exception::TlbMiss { va: va.0, access })?;

        if user && !e.user {
            return Err(Exception::AddressError { va: va.0, access });
        }
        match access {
            Access::Load if e.read_inhibit => return Err(Exception::ReadInhibit { va: va.0 }),
            Access::Fetch if e.exec_inhibit => return Err(Exception::ExecInhibit { va: va.0 }),
            Access::Store if !e.dirty => return Err(Exception::TlbModified { va: va.0 }),
            _ => {}
        }
        Ok(PhysFrame::from_index(e.pfn).at(va.page_offset()))
    }
}
