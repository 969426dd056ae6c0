// src/mm/pagetable_init.rs
//
// 役割：
// - pmap のソフトウェアページテーブル（ディレクトリ / リーフ）用に、
//   「ゼロクリアされた 1 フレーム」を確保する処理をまとめる。
// - 全エントリ 0 = 全ページ無効、なので確保直後のテーブルはそのまま使える。

use crate::mem::addr::PhysFrame;
use crate::mm::{FrameAllocator, PhysMemory};

/// ゼロクリア済みのテーブル用フレームを 1 つ確保する。
///
/// - 成功: Some(PhysFrame)
/// - フレーム不足 / ゼロクリア失敗: None（失敗時は確保したフレームを返却する）
pub fn allocate_zeroed_table(
    mem: &mut dyn PhysMemory,
    frames: &mut dyn FrameAllocator,
) -> Option<PhysFrame> {
    let frame = frames.allocate_frame()?;

    if mem.zero_frame(frame).is_err() {
        frames.free_frame(frame);
        return None;
    }

    Some(frame)
}
