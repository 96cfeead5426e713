//! 送信側の状態機械
//!
//! 手元の「生きた状態」と、送信済みスナップショットの履歴を持つ。
//! いつ diff を送るか、いつ空の ack を送るかを決め、シャットダウン手順も担当する。
//!
//! 時刻はすべて呼び出し側から `now`（ms）で渡す。ネットワークは `Link` として
//! 呼び出しごとに借りる。

use apsh_crypto::CryptoSession;
use apsh_network::{Connection, Fragmenter, Link, NetworkError};
use apsh_proto::{Instruction, SHUTDOWN_NUM};
use tracing::{debug, trace, warn};

use crate::history::StateHistory;
use crate::state::{State, TimestampedState};
use crate::{
    ACK_DELAY, ACK_INTERVAL, ACTIVE_RETRY_TIMEOUT, SEND_INTERVAL_MAX, SEND_INTERVAL_MIN, SEND_MINDELAY,
    SENT_STATES_CAP, SHUTDOWN_RETRIES, SHUTDOWN_TIMEOUT,
};

/// 送信履歴が上限を超えたとき、後ろから何番目を捨てるか
const PRUNE_OFFSET: usize = 16;

/// chaff の最大長
const CHAFF_MAX: usize = 16;

/// 予定のないタイマー
const NEVER: u64 = u64::MAX;

pub struct TransportSender<S: State> {
    current_state: S,

    /// 先頭: 相手が受け取ったと確認できた状態。末尾: 最後に送った状態
    sent_states: StateHistory<S>,
    /// 相手が持っていると仮定する状態の num（`sent_states` の中を指す）
    assumed_receiver_num: u64,

    fragmenter: Fragmenter,

    next_ack_time: u64,
    next_send_time: u64,

    verbose: bool,
    shutdown_in_progress: bool,
    shutdown_tries: u32,
    shutdown_start: Option<u64>,

    /// 相手から受信済みの最新状態の num
    ack_num: u64,
    pending_data_ack: bool,
    send_mindelay: u64,
    /// 相手の新しい状態を最後に受け取った時刻
    last_heard: u64,

    /// 未送信の変更が最初に起きた時刻
    mindelay_clock: Option<u64>,
}

impl<S: State> TransportSender<S> {
    /// 送信側を作る
    ///
    /// # 引数
    /// - `initial_state`: 両端が最初から共有している状態（num 0）
    /// - `now`: 現在時刻（ms）。最初の ack はすぐに送られる
    pub fn new(initial_state: S, now: u64) -> Self {
        TransportSender {
            current_state: initial_state.clone(),
            sent_states: StateHistory::new(TimestampedState::new(now, 0, initial_state)),
            assumed_receiver_num: 0,
            fragmenter: Fragmenter::new(),
            next_ack_time: now,
            next_send_time: now,
            verbose: false,
            shutdown_in_progress: false,
            shutdown_tries: 0,
            shutdown_start: None,
            ack_num: 0,
            pending_data_ack: false,
            send_mindelay: SEND_MINDELAY,
            last_heard: 0,
            mindelay_clock: None,
        }
    }

    /// 必要なら diff か空の ack を送る
    ///
    /// 送信先が未定、またはどちらのタイマーも満了していなければ何もしない。
    ///
    /// # エラー
    /// - `NetworkError`: 分割か送信に失敗した。送信の失敗でも履歴とタイマーは送ったものとして進む
    pub fn tick<L: Link>(&mut self, link: &mut L, now: u64) -> Result<(), NetworkError> {
        self.calculate_timers(&*link, now);

        if !link.has_remote_addr() {
            return Ok(());
        }
        if now < self.next_ack_time && now < self.next_send_time {
            return Ok(());
        }

        let mut diff = self.current_state.diff_from(&self.assumed_state().state);
        self.attempt_prospective_resend_optimization(&mut diff);

        if self.verbose {
            self.verify_diff(&diff);
        }

        if diff.is_empty() {
            if now >= self.next_ack_time {
                self.send_empty_ack(link, now)?;
                self.mindelay_clock = None;
            }
            if now >= self.next_send_time {
                self.next_send_time = NEVER;
                self.mindelay_clock = None;
            }
        } else if now >= self.next_send_time || now >= self.next_ack_time {
            self.send_to_receiver(link, diff, now)?;
            self.mindelay_clock = None;
        }

        Ok(())
    }

    /// 次に `tick` すべきまでの待ち時間（ms）
    ///
    /// 送信先が未定なら `u64::MAX`。
    pub fn wait_time<L: Link>(&mut self, link: &L, now: u64) -> u64 {
        self.calculate_timers(link, now);

        if !link.has_remote_addr() {
            return u64::MAX;
        }

        self.next_ack_time.min(self.next_send_time).saturating_sub(now)
    }

    /// 仮定状態の更新・履歴の整理の後、次の送信時刻と ack 時刻を決める
    pub fn calculate_timers<L: Link>(&mut self, link: &L, now: u64) {
        self.update_assumed_receiver_state(link, now);
        self.rationalize_states();

        if self.pending_data_ack && self.next_ack_time > now.saturating_add(ACK_DELAY) {
            self.next_ack_time = now + ACK_DELAY;
        }

        let interval = send_interval(link);
        let back = self.sent_states.back();
        let peer_active = self.last_heard.saturating_add(ACTIVE_RETRY_TIMEOUT) > now;

        if self.current_state != back.state {
            // 最初の変更から mindelay 待ち、かつ送信間隔も守る（min ではなく max）
            let clock = *self.mindelay_clock.get_or_insert(now);
            self.next_send_time = (clock + self.send_mindelay).max(back.timestamp + interval);
        } else if self.current_state != self.assumed_state().state && peer_active {
            let mut next = back.timestamp + interval;
            if let Some(clock) = self.mindelay_clock {
                next = next.max(clock + self.send_mindelay);
            }
            self.next_send_time = next;
        } else if self.current_state != self.sent_states.front().state && peer_active {
            self.next_send_time = back.timestamp + link.timeout() + ACK_DELAY;
        } else {
            self.next_send_time = NEVER;
        }

        // シャットダウン中は ack を急かして手順を早く終わらせる
        if self.shutdown_in_progress || self.ack_num == SHUTDOWN_NUM {
            self.next_ack_time = self.sent_states.back().timestamp + interval;
        }
    }

    /// 確認済みの状態から始めて、最近送ったものは届いたと仮定する
    fn update_assumed_receiver_state<L: Link>(&mut self, link: &L, now: u64) {
        let window = link.timeout() + ACK_DELAY;
        self.assumed_receiver_num = self.sent_states.front().num;

        for entry in self.sent_states.iter().skip(1) {
            if now.saturating_sub(entry.timestamp) < window {
                self.assumed_receiver_num = entry.num;
            } else {
                break;
            }
        }
    }

    /// 確認済みの状態を共通部分として差し引く
    fn rationalize_states(&mut self) {
        let known = self.sent_states.front().state.clone();
        self.current_state.subtract(&known);
        for entry in self.sent_states.iter_mut().rev() {
            entry.state.subtract(&known);
        }
    }

    fn assumed_state(&self) -> &TimestampedState<S> {
        self.sent_states
            .find(self.assumed_receiver_num)
            .unwrap_or_else(|| self.sent_states.front())
    }

    /// 確認済みの状態からの diff がほぼ同じ長さなら、そちらを送り直す
    fn attempt_prospective_resend_optimization(&mut self, proposed_diff: &mut Vec<u8>) {
        if self.assumed_receiver_num == self.sent_states.front().num {
            return;
        }

        let resend_diff = self.current_state.diff_from(&self.sent_states.front().state);

        if resend_diff.len() <= proposed_diff.len()
            || (resend_diff.len() < 1000 && resend_diff.len() - proposed_diff.len() < 100)
        {
            trace!(
                from = self.sent_states.front().num,
                len = resend_diff.len(),
                "prospective resend from acknowledged state"
            );
            self.assumed_receiver_num = self.sent_states.front().num;
            *proposed_diff = resend_diff;
        }
    }

    /// diff を仮定状態に当てて、現在の状態に戻るか確かめる
    fn verify_diff(&self, diff: &[u8]) {
        let mut rebuilt = self.assumed_state().state.clone();
        if let Err(e) = rebuilt.apply_string(diff) {
            warn!(error = %e, "round-trip instruction verification failed: diff does not apply");
            return;
        }
        if rebuilt != self.current_state {
            warn!("round-trip instruction verification failed");
        }
        if rebuilt.init_diff() != self.current_state.init_diff() {
            warn!("round-trip instruction verification failed: initial diffs differ");
        }
    }

    fn send_empty_ack<L: Link>(&mut self, link: &mut L, now: u64) -> Result<(), NetworkError> {
        let new_num = if self.shutdown_in_progress {
            SHUTDOWN_NUM
        } else {
            self.sent_states.back().num.saturating_add(1)
        };

        self.add_sent_state(now, new_num, self.current_state.clone());
        let sent = self.send_in_fragments(link, Vec::new(), new_num);

        self.next_ack_time = now + ACK_INTERVAL;
        self.next_send_time = NEVER;
        sent
    }

    fn send_to_receiver<L: Link>(&mut self, link: &mut L, diff: Vec<u8>, now: u64) -> Result<(), NetworkError> {
        let back_num = self.sent_states.back().num;
        let mut new_num = if self.current_state == self.sent_states.back().state {
            back_num
        } else {
            back_num.saturating_add(1)
        };
        if self.shutdown_in_progress {
            new_num = SHUTDOWN_NUM;
        }

        if new_num == back_num {
            self.sent_states.back_mut().timestamp = now;
        } else {
            self.add_sent_state(now, new_num, self.current_state.clone());
        }

        // 送信に失敗しても届いたと仮定して進める（失われたものは再送で回復する）
        let sent = self.send_in_fragments(link, diff, new_num);

        self.assumed_receiver_num = self.sent_states.back().num;
        self.next_ack_time = now + ACK_INTERVAL;
        self.next_send_time = NEVER;
        sent
    }

    fn add_sent_state(&mut self, timestamp: u64, num: u64, state: S) {
        self.sent_states.insert(TimestampedState::new(timestamp, num, state));
        self.sent_states.prune_middle(SENT_STATES_CAP, PRUNE_OFFSET);
    }

    fn send_in_fragments<L: Link>(&mut self, link: &mut L, diff: Vec<u8>, new_num: u64) -> Result<(), NetworkError> {
        let inst = Instruction::new(
            self.assumed_receiver_num,
            new_num,
            self.ack_num,
            self.sent_states.front().num,
            diff,
            make_chaff(),
        );

        if new_num == SHUTDOWN_NUM {
            self.shutdown_tries += 1;
        }

        let mtu = link
            .mtu()
            .saturating_sub(Connection::ADDED_BYTES + CryptoSession::ADDED_BYTES);
        let fragments = self.fragmenter.make_fragments(&inst, mtu)?;

        debug!(
            old = inst.old_num,
            new = inst.new_num,
            ack = inst.ack_num,
            throwaway = inst.throwaway_num,
            diff_len = inst.diff_bytes().len(),
            fragments = fragments.len(),
            "sending instruction"
        );

        let mut result = Ok(());
        for fragment in &fragments {
            if let Err(e) = link.send(&fragment.to_bytes()) {
                warn!(error = %e, new = inst.new_num, fragment = fragment.fragment_num, "failed to send fragment");
                result = Err(e);
                break;
            }
        }

        self.pending_data_ack = false;
        result
    }

    /// 相手が `ack_num` まで受け取ったので、それより古い送信済み状態を捨てる
    ///
    /// 既に捨てた状態への ack は無視する。
    pub fn process_acknowledgment_through(&mut self, ack_num: u64) {
        if self.sent_states.contains(ack_num) {
            self.sent_states.drop_below(ack_num);
        } else {
            trace!(ack_num, "ignoring ack for unknown state");
        }
    }

    /// シャットダウン手順を始める（2 回目以降は何もしない）
    pub fn start_shutdown(&mut self, now: u64) {
        if !self.shutdown_in_progress {
            self.shutdown_start = Some(now);
            self.shutdown_in_progress = true;
        }
    }

    pub fn shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress
    }

    /// 相手がシャットダウンを受け取った
    pub fn shutdown_acknowledged(&self) -> bool {
        self.sent_states.front().num == SHUTDOWN_NUM
    }

    /// 相手のシャットダウンに ack を送った
    pub fn counterparty_shutdown_ack_sent(&self) -> bool {
        self.fragmenter.last_ack_sent() == SHUTDOWN_NUM
    }

    /// シャットダウンの試行回数か経過時間が上限を超えた
    pub fn shutdown_ack_timed_out(&self, now: u64) -> bool {
        if !self.shutdown_in_progress {
            return false;
        }
        if self.shutdown_tries > SHUTDOWN_RETRIES {
            return true;
        }
        self.shutdown_start
            .is_some_and(|start| now.saturating_sub(start) >= SHUTDOWN_TIMEOUT)
    }

    pub fn shutdown_tries(&self) -> u32 {
        self.shutdown_tries
    }

    pub fn set_ack_num(&mut self, ack_num: u64) {
        self.ack_num = ack_num;
    }

    pub fn ack_num(&self) -> u64 {
        self.ack_num
    }

    /// 中身のある状態を受け取ったので、ack を早めに返す
    pub fn set_data_ack(&mut self) {
        self.pending_data_ack = true;
    }

    pub fn remote_heard(&mut self, now: u64) {
        self.last_heard = now;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn set_send_delay(&mut self, delay_ms: u64) {
        self.send_mindelay = delay_ms;
    }

    pub fn current_state(&self) -> &S {
        &self.current_state
    }

    /// 現在の状態を直接書き換える
    pub fn current_state_mut(&mut self) -> &mut S {
        &mut self.current_state
    }

    /// 現在の状態を置き換える（一時的な入力情報は消える）
    pub fn set_current_state(&mut self, state: S) {
        self.current_state = state;
        self.current_state.reset_input();
    }

    /// 相手が受け取ったと確認できた最新の送信時刻
    pub fn sent_state_acked_timestamp(&self) -> u64 {
        self.sent_states.front().timestamp
    }

    pub fn sent_states(&self) -> &StateHistory<S> {
        &self.sent_states
    }

    pub fn assumed_receiver_num(&self) -> u64 {
        self.assumed_receiver_num
    }

    pub fn next_ack_time(&self) -> u64 {
        self.next_ack_time
    }

    pub fn next_send_time(&self) -> u64 {
        self.next_send_time
    }
}

/// 送信間隔: SRTT の半分を [20, 250] ms に丸める
pub fn send_interval<L: Link + ?Sized>(link: &L) -> u64 {
    let half = (link.srtt() / 2.0).ceil();
    if half.is_nan() {
        return SEND_INTERVAL_MAX;
    }
    (half as u64).clamp(SEND_INTERVAL_MIN, SEND_INTERVAL_MAX)
}

/// 0〜16 バイトの乱数。乱数源が使えなければ空
fn make_chaff() -> Vec<u8> {
    let mut buf = [0u8; CHAFF_MAX + 1];
    if getrandom::getrandom(&mut buf).is_err() {
        return Vec::new();
    }
    let len = buf[0] as usize % (CHAFF_MAX + 1);
    buf[1..=len].to_vec()
}
