//! apsh-ssp エラー型

use apsh_network::NetworkError;
use thiserror::Error;

/// `State::apply_string` に壊れた diff が渡された
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Corrupt diff: {0}")]
    CorruptDiff(String),
}

/// SSP トランスポートのエラー
///
/// 壊れたデータグラム（復号・展開・デコード失敗）はここまで上がってこない。
/// 呼び出し側が対処すべきプロトコル違反と送信失敗だけを返す。
#[derive(Debug, Error)]
pub enum TransportError {
    /// プロトコルバージョンが一致しない（ネゴシエーションなし）
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    /// diff の起点となる状態を保持していない（順序外、または偽造）
    #[error("Reference state {old_num} for new state {new_num} not found")]
    MissingReference { old_num: u64, new_num: u64 },

    /// diff の適用に失敗した
    #[error(transparent)]
    State(#[from] StateError),

    /// 送受信の失敗
    #[error(transparent)]
    Network(#[from] NetworkError),
}

pub type Result<T> = std::result::Result<T, TransportError>;
