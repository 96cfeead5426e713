//! 同期される状態の契約
//!
//! 送信側・受信側それぞれの「生きた状態」はこのトレイトを実装する。
//! トランスポートは状態の中身を知らず、diff の生成と適用だけを依頼する。

use crate::error::StateError;

/// 差分同期できる状態
///
/// `a.apply_string(&b.diff_from(&a))` の後は `a == b` でなければならない。
pub trait State: Clone + PartialEq {
    /// 共通の起点 `other` を取り除く（以後の diff を小さくする）
    fn subtract(&mut self, other: &Self);

    /// `existing` から `self` へ変換する diff（同じなら空）
    fn diff_from(&self, existing: &Self) -> Vec<u8>;

    /// 初期状態からの diff（検証用）
    fn init_diff(&self) -> Vec<u8>;

    /// diff を適用する
    ///
    /// # エラー
    /// - `StateError::CorruptDiff`: diff が壊れている（状態は変更しない）
    fn apply_string(&mut self, diff: &[u8]) -> Result<(), StateError>;

    /// tick ごとの一時的な入力情報を消す
    fn reset_input(&mut self) {}

    /// 状態を初期状態に戻す
    fn reset(&mut self) {}

    /// 画面サイズを設定する
    fn init_size(&mut self, _cols: u16, _rows: u16) {}
}

/// 番号と時刻の付いた状態のスナップショット
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedState<T> {
    /// 送信（受信）した時刻（ms）
    pub timestamp: u64,
    pub num: u64,
    pub state: T,
}

impl<T> TimestampedState<T> {
    pub fn new(timestamp: u64, num: u64, state: T) -> Self {
        TimestampedState { timestamp, num, state }
    }
}
