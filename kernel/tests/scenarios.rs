// kernel/tests/scenarios.rs
//
// 端から端までのシナリオ（ボード 1 枚 + 上位層の代役）

mod common;

use pretty_assertions::assert_eq;

use common::*;
use trapcore::arch::Exception;
use trapcore::kernel::context::{CpuRegs, FpuState, SigInfo, CTX_SIZE, NGPR, SF_STACK_SIZE, SF_UC, SF_UC_CTX};
use trapcore::kernel::signal::{SigAction, SigSet, Signal};
use trapcore::kernel::syscall::SYS_SIGRETURN;
use trapcore::kernel::thread::{ContextState, ExitStatus, Thread};
use trapcore::kernel::trap::UserOp;
use trapcore::mem::addr::{VirtAddr, PAGE_SIZE};
use trapcore::mem::layout::{SIGCODE_VA, USER_STACK_TOP};
use trapcore::mem::paging::Prot;
use trapcore::mm::PhysMemory;
use trapcore::types::Tid;
use trapcore::kernel::LogEvent;
use trapcore::{Arch, KernelFault, TrapEnv, TrapOutcome};

const HANDLER_VA: u64 = TEXT_VA + 0x100;

fn regs_from_bytes(b: &[u8]) -> CpuRegs {
    let word = |i: usize| u64::from_le_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());
    let mut r = CpuRegs::zeroed();
    for i in 0..NGPR {
        r.gpr[i] = word(i);
    }
    r.pc = word(NGPR);
    r.sr = word(NGPR + 1);
    r
}

#[test]
fn switch_exposes_exactly_the_saved_registers_of_the_next_thread() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);

        let mut a = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        let mut b = Thread::with_default_stack(arch, Tid(2), TEXT_VA + 0x2000);
        for (i, r) in b.ctx.regs.gpr.iter_mut().enumerate().skip(1) {
            *r = 0xb000_0000 + i as u64;
        }
        b.ctx.fpu.fpr[7] = 0x3ff0_0000_0000_0000;
        b.ctx.fpu.fcsr = 0x1;
        let expected_regs = b.ctx.regs;
        let expected_fpu = b.ctx.fpu;

        p.start(&mut a).unwrap();
        p.cpu.regs.gpr[4] = 0xaaaa;
        p.switch(&mut a, &mut b).unwrap();

        assert_eq!(p.cpu.regs, expected_regs);
        assert_eq!(p.fpu_snapshot(&b), expected_fpu);
        assert_eq!(a.ctx.regs.gpr[4], 0xaaaa);
        assert_eq!(a.state(), ContextState::Saved);
        assert_eq!(p.current(), Some(Tid(2)));
    }
}

#[test]
fn unmapped_dereference_kills_only_the_faulting_thread() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();

        let mut space_a = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        let mut space_b = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        let mut a = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        let mut b = Thread::with_default_stack(arch, Tid(2), TEXT_VA);

        p.start(&mut a).unwrap();
        let op = {
            let mut env = TrapEnv {
                thread: &mut a,
                space: &mut space_a,
                mem: &mut mem,
                hooks: &mut hooks,
            };
            p.user_load(&mut env, HEAP_VA + 0x10, 4).unwrap()
        };

        let status = ExitStatus::Signaled {
            sig: Signal::SIGSEGV,
            core: true,
        };
        assert_eq!(op, UserOp::Trapped(TrapOutcome::Exit(status)));
        assert_eq!(a.exit, Some(status));
        assert_eq!(hooks.faults.len(), 1);
        assert_eq!(hooks.faults[0].va, HEAP_VA + 0x10);
        assert!(!p.is_halted());

        // 残りのスレッドは普通に動く
        p.switch(&mut a, &mut b).unwrap();
        p.activate(&mut space_b);
        hooks.map_zeroed(&mut space_b, &mut mem, HEAP_VA, Prot::READ | Prot::WRITE);
        let mut env = TrapEnv {
            thread: &mut b,
            space: &mut space_b,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        assert_eq!(p.user_store(&mut env, HEAP_VA + 8, 8, 0x1234).unwrap(), UserOp::Done(()));
        assert_eq!(p.user_load(&mut env, HEAP_VA + 8, 8).unwrap(), UserOp::Done(0x1234));
        assert_eq!(p.debug_check_invariants(), 0);
    }
}

#[test]
fn signal_posted_during_syscall_is_delivered_on_return_and_sigreturn_restores_context() {
    for arch in Arch::ALL {
        let conv = arch.conv();
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        hooks.syscall_ret = 42;
        hooks.post_on_syscall = Some(Signal::SIGUSR1);

        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        hooks.map_zeroed(&mut space, &mut mem, USER_STACK_TOP - PAGE_SIZE, Prot::READ | Prot::WRITE);

        let mut t = Thread::with_default_stack(arch, Tid(7), TEXT_VA);
        t.set_action(Signal::SIGUSR1, SigAction::catch(HANDLER_VA));
        p.start(&mut t).unwrap();

        let mut fpu = FpuState::zeroed();
        fpu.fpr[2] = 0x4000_0000_0000_0000;
        p.fpu_store(&mut t, fpu);
        p.cpu.regs.gpr[conv.sysno] = 5;
        p.cpu.regs.gpr[conv.args[0]] = 0x1111;
        p.cpu.regs.gpr[conv.fp] = 0x7ffe_ff00;

        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };

        // syscall は完了し、その戻り道でハンドラが起動される
        let outcome = p.syscall(&mut env).unwrap();
        assert_eq!(outcome, TrapOutcome::Delivered(Signal::SIGUSR1));

        let frame_sp = p.cpu.regs.gpr[conv.sp];
        assert_eq!(frame_sp, (USER_STACK_TOP - SF_STACK_SIZE as u64) & !15);
        assert_eq!(p.cpu.regs.pc, HANDLER_VA);
        assert_eq!(p.cpu.regs.gpr[conv.args[0]], Signal::SIGUSR1.number() as u64);
        assert_eq!(p.cpu.regs.gpr[conv.args[2]], frame_sp + SF_UC as u64);
        assert_eq!(p.cpu.regs.gpr[conv.ra], SIGCODE_VA);
        assert!(env.thread.sigmask.contains(Signal::SIGUSR1));

        let mut raw = vec![0u8; CTX_SIZE];
        p.copyin(&mut env, frame_sp + SF_UC_CTX as u64, &mut raw).unwrap();
        let saved = regs_from_bytes(&raw);
        assert_eq!(saved.gpr[conv.ret], 42);
        assert_eq!(saved.gpr[conv.fp], 0x7ffe_ff00);

        // ハンドラがレジスタと FPU を荒らす
        for r in [conv.fp, conv.ret, conv.args[1]] {
            p.cpu.regs.gpr[r] = 0xdead_beef;
        }
        assert_eq!(p.user_fpu_write(&mut env, 2, 0).unwrap(), UserOp::Done(()));

        // ra に戻ると sigcode に入る（読めて実行できるが書けない）
        match p.user_fetch(&mut env, SIGCODE_VA).unwrap() {
            UserOp::Done(insn) => assert_eq!(insn, arch.sigcode()[0]),
            other => panic!("trampoline not executable: {:?}", other),
        }
        p.cpu.regs.gpr[conv.args[0]] = p.cpu.regs.gpr[conv.sp] + SF_UC as u64;
        p.cpu.regs.gpr[conv.sysno] = SYS_SIGRETURN as u64;
        p.cpu.regs.pc = SIGCODE_VA + 8;

        let outcome = p.syscall(&mut env).unwrap();
        assert_eq!(outcome, TrapOutcome::Resume);
        assert_eq!(p.cpu.regs, saved);
        assert_eq!(p.fpu_snapshot(env.thread), fpu);
        assert_eq!(env.thread.sigmask, SigSet::empty());
        assert_eq!(p.stats().signals_delivered, 1);
        assert_eq!(p.debug_check_invariants(), 0);
    }
}

#[test]
fn signal_trampoline_page_is_never_writable() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        p.start(&mut t).unwrap();

        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        let op = p.user_store(&mut env, SIGCODE_VA, 4, 0).unwrap();
        assert!(matches!(
            op,
            UserOp::Trapped(TrapOutcome::Exit(ExitStatus::Signaled {
                sig: Signal::SIGSEGV,
                ..
            }))
        ));
        let f = p.sigcode_frame().unwrap();
        assert_eq!(mem.read_u32(f.start_address()).unwrap(), arch.sigcode()[0]);
    }
}

#[test]
fn asid_exhaustion_triggers_one_global_flush_and_activation_succeeds() {
    let arch = Arch::Mips32;
    let mut buf = vec![0u8; RAM_BYTES];
    let mut mem = ram(&mut buf);
    let mut frames = kernel_frames();
    let mut p = processor(arch, &mut mem, &mut frames);

    let n = (1u64 << arch.asid_bits()) - 1;
    let mut flushes = 0;
    for _ in 0..n {
        let mut s = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        if p.activate(&mut s) {
            flushes += 1;
        }
        p.destroy_pmap(s, &mut mem, &mut frames).unwrap();
    }
    assert_eq!(flushes, 0);
    assert_eq!(p.mmu.stats().global_flushes, 0);

    let mut hooks = TestHooks::new();
    let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
    hooks.map_zeroed(&mut space, &mut mem, HEAP_VA, Prot::READ | Prot::WRITE);
    assert!(p.activate(&mut space));
    assert_eq!(p.mmu.stats().global_flushes, 1);
    assert_eq!(p.mmu.asid_generation(), 1);

    // 新しい世代の ASID で普通に使える
    let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
    p.start(&mut t).unwrap();
    let mut env = TrapEnv {
        thread: &mut t,
        space: &mut space,
        mem: &mut mem,
        hooks: &mut hooks,
    };
    assert_eq!(p.user_store(&mut env, HEAP_VA, 4, 7).unwrap(), UserOp::Done(()));
    assert_eq!(p.user_load(&mut env, HEAP_VA, 4).unwrap(), UserOp::Done(7));
    assert_eq!(p.mmu.stats().global_flushes, 1);
}

#[test]
fn interrupt_raised_inside_a_trap_is_serviced_on_the_way_out() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        hooks.owned_lines = vec![2, 3];
        hooks.raise_inside = Some((2, 3));

        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        p.start(&mut t).unwrap();
        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };

        let outcome = p.assert_irq(&mut env, 2).unwrap();
        assert_eq!(outcome, Some(TrapOutcome::Resume));
        assert_eq!(hooks.irqs, vec![2, 3]);
        assert_eq!(p.irq.pending(), 0);
        assert_eq!(p.stats().stray_interrupts, 0);
        assert!(p.cpu.interrupts_enabled());
    }
}

#[test]
fn timer_quantum_expiry_requests_reschedule() {
    let arch = Arch::AArch64;
    let mut buf = vec![0u8; RAM_BYTES];
    let mut mem = ram(&mut buf);
    let mut frames = kernel_frames();
    let mut p = processor(arch, &mut mem, &mut frames);
    let mut hooks = TestHooks::new();
    let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
    let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
    p.start(&mut t).unwrap();
    let mut env = TrapEnv {
        thread: &mut t,
        space: &mut space,
        mem: &mut mem,
        hooks: &mut hooks,
    };

    let timer = arch.timer_irq();
    let quantum = p.timer.quantum();
    for _ in 1..quantum {
        assert_eq!(p.assert_irq(&mut env, timer).unwrap(), Some(TrapOutcome::Resume));
    }
    assert_eq!(p.assert_irq(&mut env, timer).unwrap(), Some(TrapOutcome::Reschedule));
    assert_eq!(p.timer.ticks(), quantum);
    assert!(!p.need_resched());
}

#[test]
fn unmapped_then_accessed_page_faults_instead_of_reading_stale_frame() {
    let arch = Arch::Mips32;
    let mut buf = vec![0u8; RAM_BYTES];
    let mut mem = ram(&mut buf);
    let mut frames = kernel_frames();
    let mut p = processor(arch, &mut mem, &mut frames);
    let mut hooks = TestHooks::new();
    let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
    hooks.map_zeroed(&mut space, &mut mem, HEAP_VA, Prot::READ | Prot::WRITE);

    let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
    p.start(&mut t).unwrap();
    {
        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        assert_eq!(p.user_store(&mut env, HEAP_VA, 4, 9).unwrap(), UserOp::Done(()));
    }
    let removed = p
        .unmap(&mut space, &mut mem, VirtAddr(HEAP_VA), VirtAddr(HEAP_VA + PAGE_SIZE))
        .unwrap();
    assert_eq!(removed, 1);

    let mut env = TrapEnv {
        thread: &mut t,
        space: &mut space,
        mem: &mut mem,
        hooks: &mut hooks,
    };
    let op = p.user_load(&mut env, HEAP_VA, 4).unwrap();
    assert!(matches!(op, UserOp::Trapped(TrapOutcome::Exit(_))));
}

#[test]
fn demand_zero_page_is_populated_and_the_access_retried() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        hooks.demand = Some((HEAP_VA, HEAP_VA + 4 * PAGE_SIZE));
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        let vm_allocs = hooks.frames.allocations();

        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        p.start(&mut t).unwrap();
        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        let va = HEAP_VA + PAGE_SIZE + 0x20;
        assert_eq!(p.user_store(&mut env, va, 8, 0xfeed).unwrap(), UserOp::Done(()));
        assert_eq!(p.user_load(&mut env, va, 8).unwrap(), UserOp::Done(0xfeed));
        assert_eq!(p.user_load(&mut env, va + 8, 8).unwrap(), UserOp::Done(0));
        assert_eq!(env.thread.exit, None);

        // フォルトは最初の 1 回だけ。フレームも 1 枚だけ（リーフテーブルは別）
        assert_eq!(hooks.faults.len(), 1);
        assert_eq!(hooks.faults[0].va, va);
        assert!(hooks.frames.allocations() >= vm_allocs + 1);
        assert!(space.is_modified(&mem, VirtAddr(va).align_down()).unwrap());
        assert_eq!(p.stats().page_faults, 1);
    }
}

#[test]
fn fault_that_never_resolves_kills_the_thread_instead_of_skipping_the_access() {
    let arch = Arch::Mips32;
    let mut buf = vec![0u8; RAM_BYTES];
    let mut mem = ram(&mut buf);
    let mut frames = kernel_frames();
    let mut p = processor(arch, &mut mem, &mut frames);
    let mut hooks = TestHooks::new();
    hooks.claim_without_mapping = true;
    let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();

    let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
    p.start(&mut t).unwrap();
    let mut env = TrapEnv {
        thread: &mut t,
        space: &mut space,
        mem: &mut mem,
        hooks: &mut hooks,
    };
    let op = p.user_store(&mut env, HEAP_VA, 4, 1).unwrap();
    let status = ExitStatus::Signaled {
        sig: Signal::SIGSEGV,
        core: true,
    };
    assert_eq!(op, UserOp::Trapped(TrapOutcome::Exit(status)));
    assert_eq!(env.thread.exit, Some(status));
    assert!(hooks.faults.len() > 1);
    assert!(!p.is_halted());
}

#[test]
fn signal_frame_below_the_stack_limit_kills_with_sigill() {
    for arch in Arch::ALL {
        let conv = arch.conv();
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        hooks.map_zeroed(&mut space, &mut mem, USER_STACK_TOP - PAGE_SIZE, Prot::READ | Prot::WRITE);

        let mut t = Thread::with_default_stack(arch, Tid(3), TEXT_VA);
        t.set_action(Signal::SIGUSR1, SigAction::catch(HANDLER_VA));
        // 残りのスタックはフレーム 1 つ分に足りない
        t.stack_base = USER_STACK_TOP - 64;
        t.post(Signal::SIGUSR1, SigInfo::default());
        p.start(&mut t).unwrap();
        let before = p.cpu.regs;

        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        let outcome = p.syscall(&mut env).unwrap();
        let status = ExitStatus::Signaled {
            sig: Signal::SIGILL,
            core: true,
        };
        assert_eq!(outcome, TrapOutcome::Exit(status));
        assert_eq!(env.thread.exit, Some(status));
        assert_eq!(p.stats().signals_delivered, 0);
        // ハンドラには入っていないし、スタックにも何も書いていない
        assert_ne!(p.cpu.regs.pc, HANDLER_VA);
        assert_eq!(p.cpu.regs.gpr[conv.sp], before.gpr[conv.sp]);
        let mut top = vec![0u8; 256];
        p.copyin(&mut env, USER_STACK_TOP - 256, &mut top).unwrap();
        assert!(top.iter().all(|b| *b == 0));
    }
}

#[test]
fn signal_frame_on_an_unmapped_stack_kills_with_sigill() {
    let arch = Arch::AArch64;
    let mut buf = vec![0u8; RAM_BYTES];
    let mut mem = ram(&mut buf);
    let mut frames = kernel_frames();
    let mut p = processor(arch, &mut mem, &mut frames);
    let mut hooks = TestHooks::new();
    let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();

    let mut t = Thread::with_default_stack(arch, Tid(4), TEXT_VA);
    t.set_action(Signal::SIGUSR2, SigAction::catch(HANDLER_VA));
    t.post(Signal::SIGUSR2, SigInfo::default());
    p.start(&mut t).unwrap();

    let mut env = TrapEnv {
        thread: &mut t,
        space: &mut space,
        mem: &mut mem,
        hooks: &mut hooks,
    };
    let outcome = p.syscall(&mut env).unwrap();
    assert_eq!(
        outcome,
        TrapOutcome::Exit(ExitStatus::Signaled {
            sig: Signal::SIGILL,
            core: true,
        })
    );
    assert_eq!(p.stats().signals_delivered, 0);
    assert!(!p.is_halted());
}

#[test]
fn unexpected_trap_in_kernel_mode_halts_with_a_dump() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);

        // 立ち上げ直後はカーネルモード
        assert!(!p.cpu.mode().is_user());
        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        let k = KernelFault::UnexpectedKernelTrap(Exception::ReservedInstruction);
        assert_eq!(p.raise(&mut env, Exception::ReservedInstruction), Err(k));
        assert!(p.is_halted());

        let mut fatal = 0;
        p.for_each_event(|ev| {
            if let LogEvent::Fatal(f) = ev {
                assert_eq!(*f, k);
                fatal += 1;
            }
        });
        assert_eq!(fatal, 1);

        // 止まったプロセッサはもうトラップを受けない
        assert_eq!(p.syscall(&mut env), Err(KernelFault::Halted));
        assert_eq!(hooks.syscalls.len(), 0);
    }
}

#[test]
fn stop_signal_with_default_action_stops_the_thread() {
    let arch = Arch::Mips32;
    let mut buf = vec![0u8; RAM_BYTES];
    let mut mem = ram(&mut buf);
    let mut frames = kernel_frames();
    let mut p = processor(arch, &mut mem, &mut frames);
    let mut hooks = TestHooks::new();
    hooks.post_on_syscall = Some(Signal::SIGTSTP);
    let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();

    let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
    p.start(&mut t).unwrap();
    let mut env = TrapEnv {
        thread: &mut t,
        space: &mut space,
        mem: &mut mem,
        hooks: &mut hooks,
    };
    assert_eq!(p.syscall(&mut env).unwrap(), TrapOutcome::Stop(Signal::SIGTSTP));
    assert!(env.thread.stopped);
    assert_eq!(env.thread.exit, None);

    // SIGCONT で再開（既定動作は「続行」で、トランポリンは通らない）
    env.thread.post(Signal::SIGCONT, SigInfo::default());
    assert_eq!(p.syscall(&mut env).unwrap(), TrapOutcome::Resume);
    assert!(!env.thread.stopped);
    assert!(env.thread.pending.is_empty());
}

#[test]
fn sigkill_wins_over_other_pending_signals_and_any_mask() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        hooks.map_zeroed(&mut space, &mut mem, USER_STACK_TOP - PAGE_SIZE, Prot::READ | Prot::WRITE);

        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        t.set_action(Signal::SIGHUP, SigAction::catch(HANDLER_VA));
        t.set_mask(SigSet::full());
        assert!(!t.sigmask.contains(Signal::SIGKILL));
        t.post(Signal::SIGHUP, SigInfo::default());
        t.post(Signal::SIGKILL, SigInfo::default());
        p.start(&mut t).unwrap();

        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        let status = ExitStatus::Signaled {
            sig: Signal::SIGKILL,
            core: false,
        };
        assert_eq!(p.syscall(&mut env).unwrap(), TrapOutcome::Exit(status));
        assert_eq!(env.thread.exit, Some(status));
        assert_eq!(p.stats().signals_delivered, 0);

        // マスクが無くても、番号の小さい SIGHUP より先に SIGKILL
        let mut u = Thread::with_default_stack(arch, Tid(2), TEXT_VA);
        u.set_action(Signal::SIGHUP, SigAction::catch(HANDLER_VA));
        u.post(Signal::SIGHUP, SigInfo::default());
        u.post(Signal::SIGKILL, SigInfo::default());
        let mut env = TrapEnv {
            thread: &mut u,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        assert_eq!(p.syscall(&mut env).unwrap(), TrapOutcome::Exit(status));
        assert_eq!(p.stats().signals_delivered, 0);
    }
}

#[test]
fn ignored_signals_are_dropped_without_touching_the_thread() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        hooks.syscall_ret = 5;
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();

        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        t.set_action(Signal::SIGTERM, SigAction::ignore());
        t.post(Signal::SIGTERM, SigInfo::default());
        // 既定で無視されるシグナル
        t.post(Signal::SIGCHLD, SigInfo::default());
        p.start(&mut t).unwrap();

        let mut env = TrapEnv {
            thread: &mut t,
            space: &mut space,
            mem: &mut mem,
            hooks: &mut hooks,
        };
        assert_eq!(p.syscall(&mut env).unwrap(), TrapOutcome::Resume);
        assert!(env.thread.pending.is_empty());
        assert_eq!(env.thread.exit, None);
        assert_eq!(p.cpu.regs.gpr[arch.conv().ret], 5);
        assert_eq!(p.stats().signals_delivered, 0);
    }
}

#[cfg(feature = "lazy_fpu")]
#[test]
fn first_fpu_use_after_a_switch_traps_and_loads_that_threads_state() {
    for arch in Arch::ALL {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();

        let mut a = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        let mut b = Thread::with_default_stack(arch, Tid(2), TEXT_VA);
        b.ctx.fpu.fpr[4] = 0xbbbb;

        p.start(&mut a).unwrap();
        assert!(!p.cpu.fpu_enabled);
        let traps = p.stats().traps;
        {
            let mut env = TrapEnv {
                thread: &mut a,
                space: &mut space,
                mem: &mut mem,
                hooks: &mut hooks,
            };
            assert_eq!(p.user_fpu_write(&mut env, 4, 0xaaaa).unwrap(), UserOp::Done(()));
        }
        assert_eq!(p.stats().traps, traps + 1);

        p.switch(&mut a, &mut b).unwrap();
        assert_eq!(a.ctx.fpu.fpr[4], 0xaaaa);
        assert!(!p.cpu.fpu_enabled);
        {
            let mut env = TrapEnv {
                thread: &mut b,
                space: &mut space,
                mem: &mut mem,
                hooks: &mut hooks,
            };
            assert_eq!(p.user_fpu_write(&mut env, 5, 1).unwrap(), UserOp::Done(()));
        }
        assert_eq!(p.cpu.fpu.fpr[4], 0xbbbb);
        assert_eq!(p.fpu_snapshot(&b).fpr[5], 1);
        assert_eq!(p.debug_check_invariants(), 0);
    }
}
