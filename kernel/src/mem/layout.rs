// kernel/src/mem/layout.rs
//
// ユーザ仮想アドレス空間のレイアウト（両アーキ共通）
//
// 目的:
// - 「ユーザ空間」の境界と、固定配置されるページ（sigcode、スタック上端）を固定しておく。
// - カーネル側の窓（KSEG0 / DMAP など）はアーキ依存なので arch::virt_layout に置く。
//
// 想定レイアウト:
//
//   0x0000_0000 ..= 0x0000_0fff
//     - NULL ページ（常に未マップ。NULL 参照は必ず SIGSEGV になる）
//
//   0x0000_1000 ..  0x7fff_0000
//     - ユーザのテキスト / データ / ヒープ / スタック
//
//   0x7fff_f000 ..= 0x7fff_ffff
//     - sigcode ページ（READ|EXEC|USER、書き込み不可）
//

use crate::mem::addr::PAGE_SIZE;

/// ユーザ空間の開始アドレス（NULL ページの直後）
pub const USER_SPACE_START: u64 = 0x0000_1000;

/// ユーザ空間の終了アドレス（排他的）
pub const USER_SPACE_END: u64 = 0x8000_0000;

/// ユーザスタックの上端（初期 sp）
pub const USER_STACK_TOP: u64 = 0x7fff_0000;

/// デフォルトのユーザスタックサイズ
pub const USER_STACK_SIZE: u64 = 16 * PAGE_SIZE;

/// sigcode（シグナル復帰トランポリン）を置く仮想アドレス
pub const SIGCODE_VA: u64 = USER_SPACE_END - PAGE_SIZE;

/// ソフトウェアページテーブルが 1 つの pmap でカバーする窓の大きさ（4GiB）
pub const PMAP_WINDOW_SIZE: u64 = 1u64 << 32;

/// [start, start+len) がまるごとユーザ空間に入っているか
pub fn is_user_range(start: u64, len: u64) -> bool {
    match start.checked_add(len) {
        Some(end) => start >= USER_SPACE_START && end <= USER_SPACE_END,
        None => false,
    }
}

// レイアウトの整合性
const _: () = assert!(USER_STACK_TOP < SIGCODE_VA);
const _: () = assert!(USER_STACK_TOP % PAGE_SIZE == 0);
const _: () = assert!(USER_SPACE_END <= PMAP_WINDOW_SIZE);
