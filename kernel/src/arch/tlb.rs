// kernel/src/arch/tlb.rs
//
// ソフトウェア管理 TLB のモデル。
//
// - エントリ数はアーキ依存（MIPS 16 / AArch64 64）。
// - 先頭 `wired` 個は固定（カーネルの常駐ページ）。置換は wired より後ろだけ。
// - 一致条件: vpn が等しく、かつ (global || asid が等しい)。
// - 同じ (asid, vpn) のエントリを 2 つ持たない（MIPS では machine check になる）。
//
// TLB はソフトウェアページテーブルのキャッシュでしかない。
// いつ全部捨てても refill で元に戻る。

use crate::arch::cpu::CriticalSection;

/// どのアーキでもこれ以上のエントリは持たない
pub const MAX_TLB_ENTRIES: usize = 64;

/// 固定エントリの上限
pub const MAX_WIRED: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub asid: u16,
    pub vpn: u64,
    pub pfn: u64,
    /// 書き込み可（MIPS の D ビット）
    pub dirty: bool,
    pub global: bool,
    pub read_inhibit: bool,
    pub exec_inhibit: bool,
    /// ユーザモードから参照可能
    pub user: bool,
}

impl TlbEntry {
    fn matches(&self, asid: u16, vpn: u64) -> bool {
        self.vpn == vpn && (self.global || self.asid == asid)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlbStats {
    pub refills: u64,
    pub invalidations: u64,
    pub global_flushes: u64,
}

pub struct Tlb {
    entries: [Option<TlbEntry>; MAX_TLB_ENTRIES],
    size: usize,
    wired: usize,
    next_victim: usize,
    stats: TlbStats,
}

impl Tlb {
    pub fn new(size: usize) -> Self {
        let size = size.clamp(MAX_WIRED + 1, MAX_TLB_ENTRIES);
        Tlb {
            entries: [None; MAX_TLB_ENTRIES],
            size,
            wired: 0,
            next_victim: 0,
            stats: TlbStats::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn wired(&self) -> usize {
        self.wired
    }

    pub fn stats(&self) -> TlbStats {
        self.stats
    }

    pub fn entry(&self, index: usize) -> Option<TlbEntry> {
        if index < self.size {
            self.entries[index]
        } else {
            None
        }
    }

    /// 有効なエントリ数
    pub fn occupancy(&self) -> usize {
        self.entries[..self.size].iter().filter(|e| e.is_some()).count()
    }

    /// (asid, vpn) に一致するエントリを探す（tlbp）
    pub fn lookup(&self, asid: u16, vpn: u64) -> Option<(usize, TlbEntry)> {
        self.entries[..self.size]
            .iter()
            .enumerate()
            .find_map(|(i, e)| match e {
                Some(e) if e.matches(asid, vpn) => Some((i, *e)),
                _ => None,
            })
    }

    /// 置換対象スロット（wired より後ろ）にエントリを書く（tlbwr）
    pub fn write_random(&mut self, _cs: &CriticalSection, entry: TlbEntry) -> usize {
        // 重複を作らない
        if let Some((i, _)) = self.lookup(entry.asid, entry.vpn) {
            if i >= self.wired {
                self.entries[i] = Some(entry);
                self.stats.refills += 1;
                return i;
            }
        }

        if self.next_victim < self.wired || self.next_victim >= self.size {
            self.next_victim = self.wired;
        }
        let slot = self.next_victim;
        self.next_victim += 1;

        self.entries[slot] = Some(entry);
        self.stats.refills += 1;
        slot
    }

    /// 既存スロットを書き換える（tlbwi）
    pub fn overwrite(&mut self, _cs: &CriticalSection, index: usize, entry: TlbEntry) -> bool {
        if index >= self.size {
            return false;
        }
        self.entries[index] = Some(entry);
        true
    }

    /// 固定エントリを追加する。上限に達していたら None。
    pub fn write_wired(&mut self, cs: &CriticalSection, entry: TlbEntry) -> Option<usize> {
        if self.wired >= MAX_WIRED {
            return None;
        }
        // 置換領域に同じページが居たら先に消す
        self.invalidate(cs, entry.asid, entry.vpn);

        let slot = self.wired;
        self.entries[slot] = Some(entry);
        self.wired += 1;
        if self.next_victim < self.wired {
            self.next_victim = self.wired;
        }
        Some(slot)
    }

    /// (asid, vpn) のエントリを無効化する。
    ///
    /// 固定エントリも対象。固定スロットが当たったらその固定を外し、固定領域を詰める。
    pub fn invalidate(&mut self, _cs: &CriticalSection, asid: u16, vpn: u64) -> bool {
        let mut hit = false;
        for e in self.entries[self.wired..self.size].iter_mut() {
            if matches!(e, Some(x) if x.matches(asid, vpn)) {
                *e = None;
                hit = true;
            }
        }
        // 後ろから見れば、詰めて動くのは見終わったスロットだけ
        for i in (0..self.wired).rev() {
            if matches!(self.entries[i], Some(x) if x.matches(asid, vpn)) {
                self.unwire(i);
                hit = true;
            }
        }
        if hit {
            self.stats.invalidations += 1;
        }
        hit
    }

    fn unwire(&mut self, index: usize) {
        self.entries.copy_within(index + 1..self.wired, index);
        self.wired -= 1;
        self.entries[self.wired] = None;
    }

    /// asid のエントリ（global 以外）をすべて無効化する
    pub fn invalidate_asid(&mut self, _cs: &CriticalSection, asid: u16) {
        for e in self.entries[self.wired..self.size].iter_mut() {
            if matches!(e, Some(x) if !x.global && x.asid == asid) {
                *e = None;
                self.stats.invalidations += 1;
            }
        }
        for i in (0..self.wired).rev() {
            if matches!(self.entries[i], Some(x) if !x.global && x.asid == asid) {
                self.unwire(i);
                self.stats.invalidations += 1;
            }
        }
    }

    /// 固定エントリ以外をすべて捨てる（全体フラッシュ）
    pub fn flush(&mut self, _cs: &CriticalSection) {
        for e in self.entries[self.wired..self.size].iter_mut() {
            *e = None;
        }
        self.next_victim = self.wired;
        self.stats.global_flushes += 1;
    }

    /// 固定エントリも含めて空にする（シャットダウン用）
    pub fn reset(&mut self, _cs: &CriticalSection) {
        self.entries = [None; MAX_TLB_ENTRIES];
        self.wired = 0;
        self.next_victim = 0;
    }
}
