// kernel/src/logging/mod.rs
//
// ログの入口。
// - 呼び出し側はこの関数群（info / warn / error / info_kv ...）だけを使う
// - 中身は log クレートに流す。出力先は console::init で差し込んだ Console
// - ロガー未設定なら何も出ない（ホストのテストでは黙る）

pub mod console;

pub use console::{init, Console, ConsoleLogger};

pub fn info(msg: &str) {
    log::info!("{}", msg);
}

pub fn warn(msg: &str) {
    log::warn!("{}", msg);
}

pub fn error(msg: &str) {
    log::error!("{}", msg);
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

/// key = 値（16 進）。key が空なら値だけ。
pub fn info_kv(key: &str, value: u64) {
    if key.is_empty() {
        log::info!("{:#x}", value);
    } else {
        log::info!("{} = {:#x}", key, value);
    }
}

pub fn info_str(key: &str, value: &str) {
    log::info!("{} = {}", key, value);
}
