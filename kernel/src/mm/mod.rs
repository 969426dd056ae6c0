// src/mm/mod.rs
//
// 物理メモリ管理の入り口（このレイヤから見た外部協力者）。
// - PhysMemory: 物理アドレスでバイト列を読み書きする窓（KSEG0 / DMAP 相当）。
// - FrameAllocator: 4KiB 物理フレームの確保/解放。独立に同期される外部資源。
// - FlatRam / RangeFrameAllocator: 上の 2 つの最小実装。テストボードとブリングアップで使う。
//
// 方針:
// - 外部 API はすべて safe にする。生ポインタは使わず、バイトスライスに閉じ込める。
// - 状態は構造体 + カウンタに閉じ込める（検証しやすさ優先）。

pub mod pagetable_init;

use core::fmt;

use crate::mem::addr::{PhysAddr, PhysFrame, PAGE_SIZE};

/// 物理メモリアクセスの失敗（存在しないアドレス）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusError {
    pub addr: PhysAddr,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus error at pa={:#x}", self.addr.0)
    }
}

/// 物理メモリの読み書き窓
pub trait PhysMemory {
    fn read(&self, pa: PhysAddr, buf: &mut [u8]) -> Result<(), BusError>;
    fn write(&mut self, pa: PhysAddr, buf: &[u8]) -> Result<(), BusError>;

    fn read_u32(&self, pa: PhysAddr) -> Result<u32, BusError> {
        let mut b = [0u8; 4];
        self.read(pa, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn write_u32(&mut self, pa: PhysAddr, v: u32) -> Result<(), BusError> {
        self.write(pa, &v.to_le_bytes())
    }

    fn read_u64(&self, pa: PhysAddr) -> Result<u64, BusError> {
        let mut b = [0u8; 8];
        self.read(pa, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u64(&mut self, pa: PhysAddr, v: u64) -> Result<(), BusError> {
        self.write(pa, &v.to_le_bytes())
    }

    /// フレーム全体を 0 で埋める
    fn zero_frame(&mut self, frame: PhysFrame) -> Result<(), BusError> {
        let zeros = [0u8; 256];
        let base = frame.start_address();
        let mut off = 0;
        while off < PAGE_SIZE {
            self.write(base.add(off), &zeros)?;
            off += zeros.len() as u64;
        }
        Ok(())
    }
}

/// 4KiB 物理フレームの確保/解放
pub trait FrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
    fn free_frame(&mut self, frame: PhysFrame);
}

/// 連続したバイト列を物理メモリとして見せる。
///
/// - base: bytes[0] に対応する物理アドレス
/// - 範囲外アクセスは BusError
pub struct FlatRam<'a> {
    base: PhysAddr,
    bytes: &'a mut [u8],
}

impl<'a> FlatRam<'a> {
    pub fn new(base: PhysAddr, bytes: &'a mut [u8]) -> Self {
        FlatRam { base, bytes }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, pa: PhysAddr, len: usize) -> Result<core::ops::Range<usize>, BusError> {
        let err = BusError { addr: pa };
        let off = pa.0.checked_sub(self.base.0).ok_or(err)?;
        let start = usize::try_from(off).map_err(|_| err)?;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.bytes.len() {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl PhysMemory for FlatRam<'_> {
    fn read(&self, pa: PhysAddr, buf: &mut [u8]) -> Result<(), BusError> {
        let r = self.range(pa, buf.len())?;
        buf.copy_from_slice(&self.bytes[r]);
        Ok(())
    }

    fn write(&mut self, pa: PhysAddr, buf: &[u8]) -> Result<(), BusError> {
        let r = self.range(pa, buf.len())?;
        self.bytes[r].copy_from_slice(buf);
        Ok(())
    }
}

const FREE_LIST_LEN: usize = 64;

/// [start, end) の物理フレームを順番に返すアロケータ。
///
/// - 状態: `next`（何番目まで使ったか）と小さな固定長の free list
/// - 解放されたフレームは free list から優先して再利用する
/// - allocations は「何回確保が呼ばれたか」。refill がアロケータを触らないことの確認に使う
pub struct RangeFrameAllocator {
    start: PhysFrame,
    end: PhysFrame,
    next: u64,
    free: [Option<PhysFrame>; FREE_LIST_LEN],
    allocations: u64,
}

impl RangeFrameAllocator {
    /// [start, end) の物理アドレス範囲からアロケータを作る（ページ境界に丸める）
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        let first = PhysAddr(start.0 + (PAGE_SIZE - 1)).frame();
        RangeFrameAllocator {
            start: first,
            end: end.frame(),
            next: 0,
            free: [None; FREE_LIST_LEN],
            allocations: 0,
        }
    }

    /// 累計の確保要求回数
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// まだ返せるフレーム数
    pub fn remaining(&self) -> u64 {
        let fresh = (self.end.number - self.start.number).saturating_sub(self.next);
        fresh + self.free.iter().filter(|f| f.is_some()).count() as u64
    }
}

impl FrameAllocator for RangeFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocations += 1;

        for slot in self.free.iter_mut() {
            if let Some(f) = slot.take() {
                return Some(f);
            }
        }

        let n = self.start.number + self.next;
        if n >= self.end.number {
            return None;
        }
        self.next += 1;
        Some(PhysFrame::from_index(n))
    }

    fn free_frame(&mut self, frame: PhysFrame) {
        if frame < self.start || frame >= self.end {
            return;
        }
        for slot in self.free.iter_mut() {
            if slot.is_none() {
                *slot = Some(frame);
                return;
            }
        }
        // free list が溢れたフレームは捨てる（リークするが二重割り当てはしない）
    }
}
