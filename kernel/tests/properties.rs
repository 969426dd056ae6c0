// kernel/tests/properties.rs
//
// 「すべての〜について」系の性質を proptest で確かめる

mod common;

use proptest::prelude::*;

use common::*;
use trapcore::kernel::context::{FpuState, NFPR, NGPR};
use trapcore::kernel::thread::Thread;
use trapcore::kernel::trap::UserOp;
use trapcore::mem::addr::{VirtAddr, PAGE_SIZE};
use trapcore::mem::paging::Prot;
use trapcore::types::Tid;
use trapcore::{Arch, TrapEnv, TrapOutcome};

fn arch_strategy() -> impl Strategy<Value = Arch> {
    prop_oneof![Just(Arch::Mips32), Just(Arch::AArch64)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn switch_round_trip_reproduces_registers_and_fpu(
        arch in arch_strategy(),
        gpr in proptest::array::uniform32(any::<u64>()),
        pc in any::<u64>(),
        fpr in proptest::array::uniform32(any::<u64>()),
        fcsr in any::<u64>(),
    ) {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);

        let mut a = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        let mut b = Thread::with_default_stack(arch, Tid(2), TEXT_VA);
        p.start(&mut a).unwrap();

        p.cpu.regs.gpr[..NGPR].copy_from_slice(&gpr);
        p.cpu.regs.pc = pc;
        let mut st = FpuState::zeroed();
        st.fpr[..NFPR].copy_from_slice(&fpr);
        st.fcsr = fcsr;
        p.fpu_store(&mut a, st);
        let live = p.cpu.regs;

        p.switch(&mut a, &mut b).unwrap();
        p.switch(&mut b, &mut a).unwrap();

        prop_assert_eq!(p.cpu.regs, live);
        prop_assert_eq!(p.fpu_snapshot(&a), st);
    }

    #[test]
    fn unmapped_page_is_never_read_through_a_stale_entry(
        arch in arch_strategy(),
        page in 0u64..64,
        word in 0u64..(PAGE_SIZE / 8),
    ) {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        let va = HEAP_VA + page * PAGE_SIZE;
        hooks.map_zeroed(&mut space, &mut mem, va, Prot::READ | Prot::WRITE);

        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        p.start(&mut t).unwrap();
        {
            let mut env = TrapEnv { thread: &mut t, space: &mut space, mem: &mut mem, hooks: &mut hooks };
            prop_assert_eq!(p.user_load(&mut env, va + word * 8, 8).unwrap(), UserOp::Done(0));
        }

        p.unmap(&mut space, &mut mem, VirtAddr(va), VirtAddr(va + PAGE_SIZE)).unwrap();

        let mut env = TrapEnv { thread: &mut t, space: &mut space, mem: &mut mem, hooks: &mut hooks };
        let op = p.user_load(&mut env, va + word * 8, 8).unwrap();
        prop_assert!(matches!(op, UserOp::Trapped(TrapOutcome::Exit(_))));
    }

    #[test]
    fn refill_never_touches_the_frame_allocator(
        arch in arch_strategy(),
        pages in proptest::collection::btree_set(0u64..128, 1..16),
    ) {
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();
        for pg in &pages {
            hooks.map_zeroed(&mut space, &mut mem, HEAP_VA + pg * PAGE_SIZE, Prot::READ);
        }
        let kernel_allocs = frames.allocations();
        let vm_allocs = hooks.frames.allocations();
        let refills = p.mmu.stats().refills;

        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        p.start(&mut t).unwrap();
        let mut env = TrapEnv { thread: &mut t, space: &mut space, mem: &mut mem, hooks: &mut hooks };
        for pg in &pages {
            prop_assert_eq!(p.user_load(&mut env, HEAP_VA + pg * PAGE_SIZE, 4).unwrap(), UserOp::Done(0));
        }

        prop_assert!(p.mmu.stats().refills >= refills + pages.len() as u64);
        prop_assert_eq!(frames.allocations(), kernel_allocs);
        prop_assert_eq!(hooks.frames.allocations(), vm_allocs);
        prop_assert!(hooks.faults.is_empty());
    }

    #[test]
    fn interrupt_raised_while_masked_is_deferred_not_lost(
        first in 0u32..7,
        second in 0u32..7,
    ) {
        prop_assume!(first != second);
        let arch = Arch::Mips32;
        let mut buf = vec![0u8; RAM_BYTES];
        let mut mem = ram(&mut buf);
        let mut frames = kernel_frames();
        let mut p = processor(arch, &mut mem, &mut frames);
        let mut hooks = TestHooks::new();
        hooks.owned_lines = vec![first, second];
        hooks.raise_inside = Some((first, second));
        let mut space = p.new_user_pmap(&mut mem, &mut frames).unwrap();

        let mut t = Thread::with_default_stack(arch, Tid(1), TEXT_VA);
        p.start(&mut t).unwrap();
        let mut env = TrapEnv { thread: &mut t, space: &mut space, mem: &mut mem, hooks: &mut hooks };
        prop_assert_eq!(p.assert_irq(&mut env, first).unwrap(), Some(TrapOutcome::Resume));

        prop_assert_eq!(hooks.irqs.clone(), vec![first, second]);
        prop_assert_eq!(p.irq.pending(), 0);
        prop_assert!(p.cpu.interrupts_enabled());
    }
}
