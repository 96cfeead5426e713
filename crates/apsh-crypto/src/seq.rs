//! 送信シーケンス番号の採番

use std::sync::atomic::{AtomicU64, Ordering};

use crate::SEQUENCE_MASK;

/// 送信パケットの一意なシーケンス番号を払い出すカウンタ
///
/// プロセス全体のグローバル変数にはせず、セッションが所有して `Connection` に渡す。
/// 同じ鍵を使う限り、値が重複してはならない（nonce の再利用になる）。
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicU64);

impl SeqCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 次に払い出す値が `start + 1` になるカウンタ（テスト用）
    pub fn starting_at(start: u64) -> Self {
        SeqCounter(AtomicU64::new(start))
    }

    /// 次のシーケンス番号（direction ビットを除いた 63 ビット）
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & SEQUENCE_MASK
    }
}
