// kernel/src/mem/mod.rs
//
// 役割:
// - 仮想メモリ関連のサブモジュールをまとめる中継点。
// - addr.rs / paging.rs / asid.rs / address_space.rs / layout.rs を公開する。

pub mod addr;
pub mod address_space;
pub mod asid;
pub mod layout;
pub mod paging;
