//! 休止（スリープ・NAT タイムアウト）からの復帰判定
//!
//! 送信履歴と受信履歴の時刻をそれぞれ独立に分類し、両方が「起きたばかり」の
//! ときだけ復帰とみなす。閾値は経験的に決めた値なので変更しないこと。

use serde::Serialize;

/// これより新しい要素は「最近」とみなす（ms）
pub const ACTIVE_GAP: i64 = 5100;

/// 最新要素が古いのに履歴がこれだけ溜まっていたら、相手は応答していない
pub const NO_RESPONSE_ENTRIES: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AwakenState {
    /// 最新要素もその前も最近
    KeepAlive,
    /// 最新要素が古く、履歴はまだ少ない
    JustAwaken,
    /// 最新要素は最近だが、その前とは `2 * ACTIVE_GAP` 以上離れている
    OneAwaken,
    /// 履歴が 2 件未満
    LackState,
    /// 最新要素が古く、履歴が `NO_RESPONSE_ENTRIES` 件以上
    NoResponse,
}

impl AwakenState {
    /// 1 つの履歴の時刻（num の昇順）を分類する
    pub fn classify(timestamps: &[u64], now: u64) -> Self {
        let n = timestamps.len();
        if n < 2 {
            return AwakenState::LackState;
        }

        let latest = timestamps[n - 1] as i64;
        let prior = timestamps[n - 2] as i64;
        let now = now as i64;

        // now より未来の時刻（負の経過時間）も「最近」扱い
        if now - latest < ACTIVE_GAP {
            if latest - prior > 2 * ACTIVE_GAP {
                AwakenState::OneAwaken
            } else {
                AwakenState::KeepAlive
            }
        } else if n >= NO_RESPONSE_ENTRIES {
            AwakenState::NoResponse
        } else {
            AwakenState::JustAwaken
        }
    }

    fn is_waking(self) -> bool {
        matches!(self, AwakenState::OneAwaken | AwakenState::JustAwaken)
    }
}

/// 送信・受信の両方の履歴が復帰を示しているか
pub fn awaken(sent: &[u64], received: &[u64], now: u64) -> bool {
    AwakenState::classify(sent, now).is_waking() && AwakenState::classify(received, now).is_waking()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_few_samples() {
        assert_eq!(AwakenState::classify(&[3100], 3225), AwakenState::LackState);
        assert!(!awaken(&[3100], &[3220], 3225));
    }

    #[test]
    fn test_wake_after_long_sleep() {
        let sent = [90_681_162, 91_734_999];
        let received = [90_678_716, 90_681_748];
        let now = 91_734_985;

        assert_eq!(AwakenState::classify(&sent, now), AwakenState::OneAwaken);
        assert_eq!(AwakenState::classify(&received, now), AwakenState::JustAwaken);
        assert!(awaken(&sent, &received, now));
    }

    #[test]
    fn test_dead_peer_is_not_a_wake() {
        let sent: Vec<u64> = (1..=14).map(|i| i * 100).collect();
        let received = [150, 250];
        let now = 10_000_000;

        assert_eq!(AwakenState::classify(&sent, now), AwakenState::NoResponse);
        assert!(!awaken(&sent, &received, now));
    }

    #[test]
    fn test_keep_alive_forces_false() {
        let busy = [10_000, 12_000];
        let stale = [1_000, 2_000];
        assert_eq!(AwakenState::classify(&busy, 13_000), AwakenState::KeepAlive);
        assert!(!awaken(&busy, &stale, 13_000));
        assert!(!awaken(&stale, &busy, 13_000));
    }

    #[test]
    fn test_boundaries() {
        // 経過 5099 ms は最近、5100 ms は古い
        assert_eq!(AwakenState::classify(&[0, 100], 5_199), AwakenState::KeepAlive);
        assert_eq!(AwakenState::classify(&[0, 100], 5_200), AwakenState::JustAwaken);
        // 間隔 10200 ms ちょうどは OneAwaken にならない
        assert_eq!(AwakenState::classify(&[0, 10_200], 10_200), AwakenState::KeepAlive);
        assert_eq!(AwakenState::classify(&[0, 10_201], 10_201), AwakenState::OneAwaken);
    }
}
