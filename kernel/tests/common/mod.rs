// kernel/tests/common/mod.rs
//
// 統合テスト用のボード。
// - RAM: ホストのバイト列（FlatRam）
// - フレーム: 前半はプロセッサ用、後半はテスト用 VM（TestHooks）用
// - TestHooks: 範囲を決めたデマンドゼロ VM、固定値を返す syscall、線ごとの割り込みハンドラ

#![allow(dead_code)]

use trapcore::kernel::context::SigInfo;
use trapcore::kernel::signal::Signal;
use trapcore::kernel::syscall::{SyscallArgs, SyscallResult};
use trapcore::kernel::thread::Thread;
use trapcore::kernel::{FaultError, HookCtx, KernelHooks, PageFault};
use trapcore::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use trapcore::mem::address_space::Pmap;
use trapcore::mem::paging::Prot;
use trapcore::mm::{FlatRam, FrameAllocator, PhysMemory, RangeFrameAllocator};
use trapcore::types::IrqLine;
use trapcore::{Arch, Processor};

pub const RAM_BYTES: usize = 512 * PAGE_SIZE as usize;
/// ここから上はテスト用 VM のフレーム
pub const VM_FRAMES_START: u64 = 256 * PAGE_SIZE;

pub const TEXT_VA: u64 = 0x0040_0000;
pub const HEAP_VA: u64 = 0x1000_0000;

pub fn ram(buf: &mut [u8]) -> FlatRam<'_> {
    FlatRam::new(PhysAddr(0), buf)
}

pub fn kernel_frames() -> RangeFrameAllocator {
    RangeFrameAllocator::new(PhysAddr(PAGE_SIZE), PhysAddr(VM_FRAMES_START))
}

pub fn processor(arch: Arch, mem: &mut dyn PhysMemory, frames: &mut RangeFrameAllocator) -> Processor {
    Processor::bring_up(arch, mem, frames).unwrap()
}

/// 上位層の代役
pub struct TestHooks {
    pub frames: RangeFrameAllocator,
    /// デマンドゼロで埋める範囲 [start, end)
    pub demand: Option<(u64, u64)>,
    pub syscall_ret: u64,
    /// syscall の最中に自スレッドへ送るシグナル
    pub post_on_syscall: Option<Signal>,
    pub syscalls: Vec<u64>,
    pub faults: Vec<PageFault>,
    pub irqs: Vec<IrqLine>,
    /// 割り込みハンドラの中で別の線を立てる (処理中の線, 立てる線)
    pub raise_inside: Option<(IrqLine, IrqLine)>,
    /// ハンドラを持つ線
    pub owned_lines: Vec<IrqLine>,
    /// 何も張らずに「解決した」と答える VM（壊れた上位層の代役）
    pub claim_without_mapping: bool,
}

impl TestHooks {
    pub fn new() -> Self {
        TestHooks {
            frames: RangeFrameAllocator::new(
                PhysAddr(VM_FRAMES_START),
                PhysAddr(RAM_BYTES as u64),
            ),
            demand: None,
            syscall_ret: 0,
            post_on_syscall: None,
            syscalls: Vec::new(),
            faults: Vec::new(),
            irqs: Vec::new(),
            raise_inside: None,
            owned_lines: Vec::new(),
            claim_without_mapping: false,
        }
    }

    /// テストの前準備としてページを張る
    pub fn map_zeroed(&mut self, space: &mut Pmap, mem: &mut dyn PhysMemory, va: u64, prot: Prot) {
        let frame = self.frames.allocate_frame().unwrap();
        mem.zero_frame(frame).unwrap();
        space
            .map(mem, &mut self.frames, VirtAddr(va).align_down(), frame, prot)
            .unwrap();
    }
}

impl KernelHooks for TestHooks {
    fn syscall(&mut self, _cx: &HookCtx<'_>, thread: &mut Thread, args: &SyscallArgs) -> SyscallResult {
        self.syscalls.push(args.code);
        if let Some(sig) = self.post_on_syscall.take() {
            thread.post(sig, SigInfo::default());
        }
        SyscallResult::Ok(self.syscall_ret)
    }

    fn page_fault(
        &mut self,
        _cx: &HookCtx<'_>,
        fault: &PageFault,
        space: &mut Pmap,
        mem: &mut dyn PhysMemory,
    ) -> Result<(), FaultError> {
        self.faults.push(*fault);
        if self.claim_without_mapping {
            return Ok(());
        }
        match self.demand {
            Some((start, end))
                if fault.kind == FaultError::NotMapped && (start..end).contains(&fault.va) =>
            {
                let frame = self.frames.allocate_frame().ok_or(FaultError::BusError)?;
                mem.zero_frame(frame).map_err(|_| FaultError::BusError)?;
                space
                    .map(
                        mem,
                        &mut self.frames,
                        VirtAddr(fault.va).align_down(),
                        frame,
                        Prot::READ | Prot::WRITE,
                    )
                    .map_err(|_| FaultError::BusError)
            }
            _ => Err(fault.kind),
        }
    }

    fn interrupt(&mut self, cx: &HookCtx<'_>, line: IrqLine) -> bool {
        self.irqs.push(line);
        if let Some((during, raise)) = self.raise_inside {
            if during == line {
                self.raise_inside = None;
                cx.irq.assert(raise);
            }
        }
        self.owned_lines.contains(&line)
    }
}
