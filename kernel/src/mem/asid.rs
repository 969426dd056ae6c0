// kernel/src/mem/asid.rs
//
// ASID（アドレス空間識別子）の割り当て。
//
// - ASID 0 はカーネル（global エントリ）用に予約。ユーザは 1..=max。
// - 使い切ったら世代（generation）を 1 進めて 1 から再利用する。
// - 世代が変わった瞬間に、古い世代の ASID で入っている TLB エントリを
//   全体フラッシュで 1 回だけ捨てる（フラッシュするのは呼び出し側）。
// - 古い世代の ASID を持つ pmap は、次の activate で新しい ASID を取り直す。

/// カーネル用 ASID
pub const KERNEL_ASID: u16 = 0;

const MIN_ASID: u16 = 1;

/// 世代付きの ASID
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatedAsid {
    pub asid: u16,
    pub generation: u64,
}

impl AllocatedAsid {
    pub const fn new(asid: u16, generation: u64) -> Self {
        AllocatedAsid { asid, generation }
    }

    /// 現世代の ASID か
    pub fn is_valid(&self, current_gen: u64) -> bool {
        self.generation == current_gen
    }
}

/// allocate の結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsidGrant {
    pub asid: AllocatedAsid,
    /// この割り当てで世代が進んだ（= TLB 全体フラッシュが必要）
    pub rolled_over: bool,
}

pub struct AsidAllocator {
    next_asid: u16,
    generation: u64,
    max_asid: u16,
    rollovers: u64,
}

impl AsidAllocator {
    /// asid_bits: ハードウェアの ASID ビット幅（8 / 16）
    pub const fn new(asid_bits: u32) -> Self {
        let max_asid = if asid_bits >= 16 {
            u16::MAX
        } else {
            ((1u32 << asid_bits) - 1) as u16
        };

        AsidAllocator {
            next_asid: MIN_ASID,
            generation: 0,
            max_asid,
            rollovers: 0,
        }
    }

    /// 次の ASID を割り当てる。
    ///
    /// 1..=max を配り切った後の最初の要求で世代を進め、rolled_over = true を返す。
    pub fn allocate(&mut self) -> AsidGrant {
        let mut rolled_over = false;
        if self.next_asid > self.max_asid || self.next_asid < MIN_ASID {
            self.next_asid = MIN_ASID;
            self.generation += 1;
            self.rollovers += 1;
            rolled_over = true;
        }

        let asid = self.next_asid;
        // max == u16::MAX のときは wrap して 0 になり、次回 < MIN で世代が進む
        self.next_asid = self.next_asid.wrapping_add(1);

        AsidGrant {
            asid: AllocatedAsid::new(asid, self.generation),
            rolled_over,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn max_asid(&self) -> u16 {
        self.max_asid
    }

    /// 世代を跨がずに配れる ASID の数
    pub fn capacity(&self) -> u16 {
        self.max_asid - MIN_ASID + 1
    }

    pub fn rollovers(&self) -> u64 {
        self.rollovers
    }
}
