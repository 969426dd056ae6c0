// kernel/src/panic.rs
//
// no_std ターゲット用 panic ハンドラ。
// - 挙動は「ログに 1 行 → CPU 停止」に固定する。
// - 二重 panic は即停止（ログ経路で再入すると抜けられない）
// - ホスト（テスト / std）では std のハンドラを使うので何もしない。

#![cfg(all(not(test), target_os = "none"))]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        arch::halt_loop();
    }

    match info.location() {
        Some(loc) => log::error!("[PANIC] {} at line {}", info.message(), loc.line()),
        None => log::error!("[PANIC] {}", info.message()),
    }

    arch::halt_loop()
}
