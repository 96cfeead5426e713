//! 状態履歴（num の昇順、常に 1 件以上）
//!
//! 送信側の `sent_states` と受信側の `received_states` の両方に使う。
//! 同じ num の追加は新しい要素を作らず、既存要素の時刻と状態を更新する。

use std::collections::VecDeque;

use crate::state::TimestampedState;

#[derive(Debug, Clone)]
pub struct StateHistory<T> {
    entries: VecDeque<TimestampedState<T>>,
}

impl<T> StateHistory<T> {
    pub fn new(initial: TimestampedState<T>) -> Self {
        StateHistory {
            entries: VecDeque::from([initial]),
        }
    }

    /// 最も古い（num が最小の）要素
    pub fn front(&self) -> &TimestampedState<T> {
        &self.entries[0]
    }

    /// 最も新しい（num が最大の）要素
    pub fn back(&self) -> &TimestampedState<T> {
        &self.entries[self.entries.len() - 1]
    }

    pub fn back_mut(&mut self) -> &mut TimestampedState<T> {
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 常に `false`（空にはならない）
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TimestampedState<T>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut TimestampedState<T>> {
        self.entries.iter_mut()
    }

    fn position(&self, num: u64) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&num, |e| e.num)
    }

    pub fn find(&self, num: u64) -> Option<&TimestampedState<T>> {
        self.position(num).ok().map(|idx| &self.entries[idx])
    }

    pub fn contains(&self, num: u64) -> bool {
        self.position(num).is_ok()
    }

    /// 昇順を保つ位置に挿入する
    ///
    /// # 戻り値
    /// 新しい要素として挿入したら `true`、同じ num があって更新しただけなら `false`
    pub fn insert(&mut self, entry: TimestampedState<T>) -> bool {
        match self.position(entry.num) {
            Ok(idx) => {
                self.entries[idx] = entry;
                false
            }
            Err(idx) => {
                self.entries.insert(idx, entry);
                true
            }
        }
    }

    /// num が `num` 未満の要素を捨てる（最新の要素は残す）
    pub fn drop_below(&mut self, num: u64) {
        while self.entries.len() > 1 && self.entries[0].num < num {
            self.entries.pop_front();
        }
    }

    /// `cap` を超えたら、後ろから `offset` 番目の要素を取り除く
    ///
    /// 最古（確認済み）と直近の送信は残る。
    pub fn prune_middle(&mut self, cap: usize, offset: usize) {
        while self.entries.len() > cap && self.entries.len() > offset {
            let idx = self.entries.len() - offset;
            self.entries.remove(idx);
        }
    }

    /// 各要素の時刻（num の昇順）
    pub fn timestamps(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.timestamp).collect()
    }
}
