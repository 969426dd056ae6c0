// kernel/src/kernel/copy.rs
//
// copyin / copyout: カーネルからユーザアドレスへのアクセス。
//
// - 範囲はまるごとユーザ空間に入っていなければ EFAULT
// - 書き込み（読み出し）の前に、範囲の全ページが解決できることを確かめる
//   （途中まで書いてから失敗する、ということを起こさない）
// - コピー中のフォルトはカーネルモードのトラップとして入れ子で処理する
//   refill で直れば続行、VM でも直らなければ onfault により EFAULT
// - カーネル窓の未マップ参照は onfault でも救わない（致命的）

use crate::arch::Exception;
use crate::kernel::{FaultError, KernelFault, PageFault, Processor, TrapClass, TrapEnv};
use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mem::layout::{is_user_range, USER_SPACE_END};
use crate::mm::PhysMemory;
use crate::types::{Access, Mode};

use super::trap::MAX_FAULT_RETRIES;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyError {
    /// ユーザアドレスが不正（syscall は EFAULT を返す）
    Efault,
    /// コピー中にカーネルが致命的なフォルトを起こした（プロセッサは停止済み）
    Fatal(KernelFault),
}

impl Processor {
    /// ユーザ空間 [uaddr, uaddr + dst.len()) から読む
    pub fn copyin(&mut self, env: &mut TrapEnv<'_>, uaddr: u64, dst: &mut [u8]) -> Result<(), CopyError> {
        let len = dst.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if !is_user_range(uaddr, len) {
            return Err(CopyError::Efault);
        }

        self.ensure_active(env.space);
        self.onfault = true;
        let r = self.copy_pages(env, uaddr, len, Access::Load, |mem, pa, off, n| {
            mem.read(pa, &mut dst[off..off + n]).is_ok()
        });
        self.onfault = false;
        r
    }

    /// ユーザ空間 [uaddr, uaddr + src.len()) に書く
    pub fn copyout(&mut self, env: &mut TrapEnv<'_>, src: &[u8], uaddr: u64) -> Result<(), CopyError> {
        let len = src.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if !is_user_range(uaddr, len) {
            return Err(CopyError::Efault);
        }

        self.ensure_active(env.space);
        self.onfault = true;
        let r = self.copy_pages(env, uaddr, len, Access::Store, |mem, pa, off, n| {
            mem.write(pa, &src[off..off + n]).is_ok()
        });
        self.onfault = false;
        r
    }

    fn copy_pages<F>(
        &mut self,
        env: &mut TrapEnv<'_>,
        uaddr: u64,
        len: u64,
        access: Access,
        mut xfer: F,
    ) -> Result<(), CopyError>
    where
        F: FnMut(&mut dyn PhysMemory, PhysAddr, usize, usize) -> bool,
    {
        if self.cpu.is_halted() {
            return Err(CopyError::Fatal(KernelFault::Halted));
        }

        // 先に全ページを検査する
        let mut page = VirtAddr(uaddr).align_down().0;
        while page < uaddr + len {
            self.kernel_access(env, page, access)?;
            page += PAGE_SIZE;
        }

        let mut done = 0u64;
        while done < len {
            let va = uaddr + done;
            let n = (PAGE_SIZE - VirtAddr(va).page_offset()).min(len - done);
            let pa = self.kernel_access(env, va, access)?;
            if !xfer(&mut *env.mem, pa, done as usize, n as usize) {
                return Err(CopyError::Efault);
            }
            done += n;
        }
        Ok(())
    }

    /// カーネルモードでの変換。フォルトは入れ子のトラップとして処理し、直ったら再試行する。
    fn kernel_access(&mut self, env: &mut TrapEnv<'_>, va: u64, access: Access) -> Result<PhysAddr, CopyError> {
        for _ in 0..MAX_FAULT_RETRIES {
            match self.mmu.translate(Mode::Kernel, VirtAddr(va), access) {
                Ok(pa) => return Ok(pa),
                Err(exc) => self.kernel_fault(env, exc)?,
            }
        }
        if self.onfault {
            Err(CopyError::Efault)
        } else {
            self.fatal_here(KernelFault::KernelPageFault { va });
            Err(CopyError::Fatal(KernelFault::KernelPageFault { va }))
        }
    }

    /// カーネルモードのトラップ（copyin / copyout / kernel_read の中）
    fn kernel_fault(&mut self, env: &mut TrapEnv<'_>, exc: Exception) -> Result<(), CopyError> {
        let hw = self.arch.encode(exc, false, 0);
        let tf = self.arch.capture_trap(&mut self.cpu, &hw);
        let class = TrapClass::of(&exc);

        let r = match self.nest.enter(class) {
            Err(k) => Err(CopyError::Fatal(k)),
            Ok(()) => {
                let r = self.kernel_fault_inner(env, exc);
                self.nest.exit(class);
                r
            }
        };

        // TLB で直らなかったユーザページは VM に回す
        let r = match r {
            Ok(Some(fault)) => match self.nest.enter(TrapClass::Fault) {
                Err(k) => Err(CopyError::Fatal(k)),
                Ok(()) => {
                    let res = self.call_page_fault_hook(env, fault);
                    self.nest.exit(TrapClass::Fault);
                    res.map_err(|_| CopyError::Efault)
                }
            },
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        match r {
            Err(CopyError::Fatal(k)) => {
                self.fatal(&tf, k);
                Err(CopyError::Fatal(k))
            }
            other => {
                self.arch.restore_context(&mut self.cpu, &tf);
                other
            }
        }
    }

    fn kernel_fault_inner(
        &mut self,
        env: &mut TrapEnv<'_>,
        exc: Exception,
    ) -> Result<Option<PageFault>, CopyError> {
        let (va, access, kind) = match exc {
            Exception::TlbMiss { va, access } => (va, access, FaultError::NotMapped),
            Exception::TlbModified { va } => (va, Access::Store, FaultError::Protection),
            Exception::ReadInhibit { va } | Exception::ExecInhibit { va } | Exception::AddressError { va, .. } => {
                return if self.onfault && va < USER_SPACE_END {
                    Err(CopyError::Efault)
                } else {
                    Err(CopyError::Fatal(KernelFault::KernelPageFault { va }))
                };
            }
            other => return Err(CopyError::Fatal(KernelFault::UnexpectedKernelTrap(other))),
        };

        if self.resolve_tlb(env.space, env.mem, exc).map_err(CopyError::Fatal)? {
            return Ok(None);
        }
        if !self.onfault || va >= USER_SPACE_END {
            return Err(CopyError::Fatal(KernelFault::KernelPageFault { va }));
        }
        Ok(Some(PageFault {
            va,
            access,
            mode: Mode::Kernel,
            kind,
        }))
    }

    /// カーネル窓からの読み出し（onfault なし）。未マップは致命的。
    pub fn kernel_read(&mut self, env: &mut TrapEnv<'_>, va: u64, buf: &mut [u8]) -> Result<(), KernelFault> {
        if self.cpu.is_halted() {
            return Err(KernelFault::Halted);
        }
        let len = buf.len() as u64;
        let mut done = 0u64;
        while done < len {
            let cur = va.wrapping_add(done);
            let n = (PAGE_SIZE - VirtAddr(cur).page_offset()).min(len - done);
            let pa = match self.kernel_access(env, cur, Access::Load) {
                Ok(pa) => pa,
                Err(CopyError::Fatal(k)) => return Err(k),
                Err(CopyError::Efault) => return Err(KernelFault::KernelPageFault { va: cur }),
            };
            if env.mem.read(pa, &mut buf[done as usize..(done + n) as usize]).is_err() {
                let k = KernelFault::KernelPageFault { va: cur };
                self.fatal_here(k);
                return Err(k);
            }
            done += n;
        }
        Ok(())
    }
}
