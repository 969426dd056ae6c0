// kernel/src/kernel/timer.rs
//
// 単調増加の tick 源。
// - 所有者はプロセッサ 1 つだけ（Processor が持つ）
// - 進めるのはタイマ割り込み線のハンドラだけ。ディスパッチャからは読むだけ。
// - 量子（quantum）の消費もここで数え、使い切ったら再スケジュール要求を返す。

/// 1 秒あたりの tick 数
pub const HZ: u64 = 100;

/// 1 スレッドが連続して走れる tick 数
pub const DEFAULT_QUANTUM_TICKS: u64 = 5;

pub struct Timer {
    ticks: u64,
    quantum: u64,
    slice_used: u64,
}

impl Timer {
    pub const fn new() -> Self {
        Timer {
            ticks: 0,
            quantum: DEFAULT_QUANTUM_TICKS,
            slice_used: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn uptime_ms(&self) -> u64 {
        self.ticks * 1000 / HZ
    }

    pub fn quantum(&self) -> u64 {
        self.quantum
    }

    pub fn slice_used(&self) -> u64 {
        self.slice_used
    }

    /// tick を 1 進め、現在のスレッドに量子を 1 課金する。
    /// 量子を使い切ったら true（再スケジュール要求）。
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        self.slice_used += 1;
        if self.slice_used >= self.quantum {
            self.slice_used = 0;
            return true;
        }
        false
    }

    /// スレッドが切り替わったら量子を満タンに戻す
    pub fn reset_slice(&mut self) {
        self.slice_used = 0;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}
