// kernel/src/kernel/trace.rs
//
// 低コスト trace（観測性）を 1 箇所に集約する。
// - トラップ入口（原因・モード）
// - TLB の refill / 無効化 / 全体フラッシュ、pmap の MemAction
// - シグナルの配送 / sigreturn
//
// 設計方針:
// - logging 側の info / info_u64 だけで完結させる
// - no_std 前提で heap 確保なし（固定文字列 + u64）
// - 関数は常に存在させ、feature off のときは何もしない（呼び出し側に cfg を撒かない）
//
// feature:
// - trace_trap:   トラップ入口
// - trace_tlb:    TLB / pmap
// - trace_signal: シグナル
// - trace_all:    全部

use crate::mem::paging::MemAction;
use crate::types::Mode;

/// トラップ入口
#[inline(always)]
pub fn trace_trap(cause: u64, badvaddr: u64, mode: Mode) {
    #[cfg(feature = "trace_trap")]
    {
        crate::logging::info(if mode.is_user() {
            "trap_trace from=user"
        } else {
            "trap_trace from=kernel"
        });
        crate::logging::info_u64("cause", cause);
        crate::logging::info_u64("badvaddr", badvaddr);
    }
    #[cfg(not(feature = "trace_trap"))]
    {
        let _ = cause;
        let _ = badvaddr;
        let _ = mode;
    }
}

/// 割り込み線のサービス
#[inline(always)]
pub fn trace_irq(line: u32, handled: bool) {
    #[cfg(feature = "trace_trap")]
    {
        crate::logging::info(if handled {
            "trap_trace irq=handled"
        } else {
            "trap_trace irq=stray"
        });
        crate::logging::info_u64("line", line as u64);
    }
    #[cfg(not(feature = "trace_trap"))]
    {
        let _ = line;
        let _ = handled;
    }
}

#[inline(always)]
pub fn trace_tlb_refill(asid: u16, va: u64, slot: usize) {
    #[cfg(feature = "trace_tlb")]
    {
        crate::logging::info("tlb_trace refill");
        crate::logging::info_u64("asid", asid as u64);
        crate::logging::info_u64("va", va);
        crate::logging::info_u64("slot", slot as u64);
    }
    #[cfg(not(feature = "trace_tlb"))]
    {
        let _ = asid;
        let _ = va;
        let _ = slot;
    }
}

#[inline(always)]
pub fn trace_tlb_invalidate(asid: u16, va: u64) {
    #[cfg(feature = "trace_tlb")]
    {
        crate::logging::info("tlb_trace invalidate");
        crate::logging::info_u64("asid", asid as u64);
        crate::logging::info_u64("va", va);
    }
    #[cfg(not(feature = "trace_tlb"))]
    {
        let _ = asid;
        let _ = va;
    }
}

#[inline(always)]
pub fn trace_tlb_flush(generation: u64) {
    #[cfg(feature = "trace_tlb")]
    {
        crate::logging::info("tlb_trace global_flush");
        crate::logging::info_u64("asid_generation", generation);
    }
    #[cfg(not(feature = "trace_tlb"))]
    {
        let _ = generation;
    }
}

/// pmap に対するページ単位の操作
#[inline(always)]
pub fn trace_mem(action: MemAction) {
    #[cfg(feature = "trace_tlb")]
    match action {
        MemAction::Map { page, frame, .. } => {
            crate::logging::info("tlb_trace map");
            crate::logging::info_u64("vpn", page.number);
            crate::logging::info_u64("pfn", frame.number);
        }
        MemAction::Unmap { page } => {
            crate::logging::info("tlb_trace unmap");
            crate::logging::info_u64("vpn", page.number);
        }
        MemAction::Protect { page, prot } => {
            crate::logging::info("tlb_trace protect");
            crate::logging::info_u64("vpn", page.number);
            crate::logging::info_u64("prot", prot.bits() as u64);
        }
    }
    #[cfg(not(feature = "trace_tlb"))]
    {
        let _ = action;
    }
}

#[inline(always)]
pub fn trace_signal_deliver(tid: u32, signo: u8, frame_sp: u64) {
    #[cfg(feature = "trace_signal")]
    {
        crate::logging::info("signal_trace deliver");
        crate::logging::info_u64("tid", tid as u64);
        crate::logging::info_u64("signo", signo as u64);
        crate::logging::info_u64("frame_sp", frame_sp);
    }
    #[cfg(not(feature = "trace_signal"))]
    {
        let _ = tid;
        let _ = signo;
        let _ = frame_sp;
    }
}

#[inline(always)]
pub fn trace_signal_return(tid: u32, pc: u64) {
    #[cfg(feature = "trace_signal")]
    {
        crate::logging::info("signal_trace sigreturn");
        crate::logging::info_u64("tid", tid as u64);
        crate::logging::info_u64("pc", pc);
    }
    #[cfg(not(feature = "trace_signal"))]
    {
        let _ = tid;
        let _ = pc;
    }
}
