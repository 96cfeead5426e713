//! 16 ビットのワイヤ時計
//!
//! パケットにはミリ秒時刻の下位 16 ビットを載せ、相手はそれを
//! `timestamp_reply` としてエコーバックする。RTT はこの往復から求める。
//! 0 は「タイムスタンプなし」の予約値なので、計算結果が 0 になった場合は 1 を使う。

use std::time::{SystemTime, UNIX_EPOCH};

/// 現在時刻（UNIX エポックからのミリ秒）
///
/// `Connection` はこの関数で実時間を読む。状態機械（sender / transport）には
/// 呼び出し側が `now_ms` として注入する。
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// パケットのタイムスタンプ（16ビット、ミリ秒の下位16ビット）
///
/// オーバーフローは mod 2^16 として扱う（約 65 秒で一周）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp16(pub u16);

impl Timestamp16 {
    /// 「タイムスタンプなし」を表す予約値
    pub const NONE: Self = Timestamp16(0);

    /// ミリ秒時刻から Timestamp16 を生成する
    ///
    /// # 引数
    /// - `now_ms`: 現在時刻（ミリ秒）
    pub fn from_ms(now_ms: u64) -> Self {
        Self::non_zero((now_ms & 0xFFFF) as u16)
    }

    /// 経過ミリ秒を足したタイムスタンプ（保持していた時間の補正用）
    pub fn advanced_by(self, elapsed_ms: u64) -> Self {
        Self::non_zero(self.0.wrapping_add((elapsed_ms & 0xFFFF) as u16))
    }

    /// ミリ秒を引いたタイムスタンプ（輻輳ペナルティ用）
    pub fn retarded_by(self, ms: u16) -> Self {
        Self::non_zero(self.0.wrapping_sub(ms))
    }

    /// 2 つのタイムスタンプの差を計算する（newer - older、ラップアラウンド考慮）
    pub fn diff(newer: Self, older: Self) -> u16 {
        newer.0.wrapping_sub(older.0)
    }

    /// 生の u16 値
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// 予約値（タイムスタンプなし）か
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    fn non_zero(raw: u16) -> Self {
        if raw == 0 {
            Timestamp16(1)
        } else {
            Timestamp16(raw)
        }
    }
}

impl From<u16> for Timestamp16 {
    fn from(val: u16) -> Self {
        Timestamp16(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_ms() {
        assert_eq!(Timestamp16::from_ms(1000).raw(), 1000);
    }

    #[test]
    fn test_timestamp_wraps_but_never_yields_none() {
        // 65536 ms → 0 になるはずが、予約値を避けて 1
        assert_eq!(Timestamp16::from_ms(65536).raw(), 1);
        assert_eq!(Timestamp16::from_ms(65537).raw(), 1);
        assert_eq!(Timestamp16::from_ms(65538).raw(), 2);
        assert!(!Timestamp16::from_ms(0).is_none());
    }

    #[test]
    fn test_timestamp_diff_wraparound() {
        let older = Timestamp16(65000);
        let newer = Timestamp16(100);
        assert_eq!(Timestamp16::diff(newer, older), 636);
        assert_eq!(Timestamp16::diff(Timestamp16(200), Timestamp16(100)), 100);
    }

    #[test]
    fn test_advanced_and_retarded() {
        assert_eq!(Timestamp16(65535).advanced_by(10).raw(), 9);
        assert_eq!(Timestamp16(300).retarded_by(500).raw(), 65336);
        assert_eq!(Timestamp16(500).retarded_by(500).raw(), 1);
    }

    #[test]
    fn test_none_sentinel() {
        assert!(Timestamp16::NONE.is_none());
        assert!(!Timestamp16(100).is_none());
    }
}
