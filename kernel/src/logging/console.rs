// kernel/src/logging/console.rs
//
// log クレートの出力先。
// - Console: 1 行ずつ書ければよい（UART / テスト用バッファなど、ボード側が実装する）
// - ConsoleLogger: "[LEVEL] message\r\n" の形で Console に書く
// - 書き込みは spin::Mutex で直列化する（割り込みハンドラからのログは想定しない）

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// 文字列を出せる先
pub trait Console: Sync {
    fn write_str(&self, s: &str);
}

static CONSOLE: Mutex<Option<&'static dyn Console>> = Mutex::new(None);

struct Adapter<'a>(&'a dyn Console);

impl Write for Adapter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

pub struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl ConsoleLogger {
    fn prefix(level: Level) -> &'static str {
        match level {
            Level::Error => "[ERROR] ",
            Level::Warn => "[WARN] ",
            Level::Info => "[INFO] ",
            Level::Debug => "[DEBUG] ",
            Level::Trace => "[TRACE] ",
        }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let guard = CONSOLE.lock();
        if let Some(con) = *guard {
            let mut w = Adapter(con);
            let _ = write!(w, "{}{}\r\n", Self::prefix(record.level()), record.args());
        }
    }

    fn flush(&self) {}
}

/// 出力先を差し込み、ロガーを登録する。2 回目以降は出力先の差し替えだけ。
pub fn init(console: &'static dyn Console) {
    *CONSOLE.lock() = Some(console);
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Info))
        .ok();
}
