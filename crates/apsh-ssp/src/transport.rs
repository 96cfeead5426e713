//! トランスポート: 送信側・受信側をまとめたセッションの入口
//!
//! `Link` と `TransportSender`、Fragment の再組み立て、相手の状態の履歴を持つ。
//! 受信した Instruction を参照状態に適用し、ack と throwaway の管理をする。

use apsh_network::{timestamp, Connection, Fragment, FragmentAssembly, Link};
use apsh_proto::{Instruction, PROTOCOL_VERSION};
use serde::Serialize;
use tracing::{debug, warn};

use crate::awaken;
use crate::error::{Result, TransportError};
use crate::history::StateHistory;
use crate::sender::TransportSender;
use crate::state::{State, TimestampedState};
use crate::{RECEIVER_QUENCH_MS, RECEIVE_QUEUE_CAP};

/// 統計情報（ログ・デバッグ表示用）
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub srtt_ms: f64,
    pub timeout_ms: u64,
    pub mtu: usize,
    /// 相手が受け取ったと確認できた自分の状態
    pub acked_num: u64,
    pub last_sent_num: u64,
    pub sent_queue_len: usize,
    /// 受け取った相手の最新状態
    pub remote_num: u64,
    pub received_queue_len: usize,
    pub shutdown_in_progress: bool,
}

/// SSP セッション
///
/// # 型パラメータ
/// - `S`: 自分が送る状態
/// - `R`: 相手から受け取る状態
/// - `L`: 下位のリンク（通常は `Connection`）
pub struct Transport<S: State, R: State, L: Link = Connection> {
    link: L,
    sender: TransportSender<S>,
    fragments: FragmentAssembly,

    received_states: StateHistory<R>,
    receiver_quench_timer: u64,
    /// `get_remote_diff` で最後に報告した状態
    last_receiver_state: R,

    verbose: bool,
}

impl<S: State, R: State, L: Link> Transport<S, R, L> {
    /// # 引数
    /// - `link`: 開いたコネクション
    /// - `initial_state`: 自分の初期状態
    /// - `initial_remote`: 相手の初期状態
    /// - `now`: 現在時刻（ms）
    pub fn new(link: L, initial_state: S, initial_remote: R, now: u64) -> Self {
        Transport {
            link,
            sender: TransportSender::new(initial_state, now),
            fragments: FragmentAssembly::new(),
            received_states: StateHistory::new(TimestampedState::new(now, 0, initial_remote.clone())),
            receiver_quench_timer: 0,
            last_receiver_state: initial_remote,
            verbose: false,
        }
    }

    /// 必要なら diff か ack を送る
    ///
    /// # エラー
    /// - `TransportError::Network`: 送信に失敗した
    pub fn tick(&mut self, now: u64) -> Result<()> {
        self.sender.tick(&mut self.link, now)?;
        Ok(())
    }

    /// 次に `tick` すべきまでの待ち時間（ms）
    pub fn wait_time(&mut self, now: u64) -> u64 {
        self.sender.wait_time(&self.link, now)
    }

    /// 最大 `timeout_ms` 待ってデータグラムを 1 つ受け取り、処理する
    ///
    /// # 戻り値
    /// データグラムを受け取ったら `true`（Instruction が揃ったとは限らない）
    ///
    /// # エラー
    /// - `TransportError::VersionMismatch` / `MissingReference`: 適用を拒否した
    /// - `TransportError::Network`: ソケットのエラー
    pub fn recv(&mut self, timeout_ms: u64) -> Result<bool> {
        match self.link.recv(timeout_ms)? {
            Some(payload) => {
                self.process_payload(&payload, timestamp::now_ms())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 復号済みのペイロード（Fragment 1 つ）を処理する
    pub fn process_payload(&mut self, payload: &[u8], now: u64) -> Result<()> {
        let fragment = match Fragment::from_bytes(payload) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping malformed fragment");
                return Ok(());
            }
        };

        if !self.fragments.add_fragment(fragment) {
            return Ok(());
        }

        match self.fragments.get_assembly() {
            Some(inst) => self.process_instruction(inst, now),
            None => Ok(()),
        }
    }

    fn process_instruction(&mut self, inst: Instruction, now: u64) -> Result<()> {
        if inst.protocol_version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: inst.protocol_version,
            });
        }

        self.sender.process_acknowledgment_through(inst.ack_num);

        // 往復（こちら → 相手 → こちら）が確認できたことを伝える
        self.link
            .set_last_roundtrip_success(self.sender.sent_state_acked_timestamp());

        if self.received_states.contains(inst.new_num) {
            debug!(new_num = inst.new_num, "ignoring duplicate state");
            return Ok(());
        }

        let Some(reference) = self.received_states.find(inst.old_num) else {
            warn!(
                old_num = inst.old_num,
                new_num = inst.new_num,
                "ignoring instruction: reference state not found"
            );
            return Err(TransportError::MissingReference {
                old_num: inst.old_num,
                new_num: inst.new_num,
            });
        };
        // 履歴に触る前に diff を当てる（失敗したら何も変えない）
        let mut new_state = reference.state.clone();
        if inst.has_diff() {
            new_state.apply_string(inst.diff_bytes())?;
        }

        self.received_states.drop_below(inst.throwaway_num);

        // 受け取った状態を後で捨てると ack と食い違うので、溢れたら新しい方を断る
        if self.received_states.len() > RECEIVE_QUEUE_CAP {
            if now < self.receiver_quench_timer {
                debug!(
                    new_num = inst.new_num,
                    queue = self.received_states.len(),
                    "receive queue full, dropping state"
                );
                return Ok(());
            }
            self.receiver_quench_timer = now + RECEIVER_QUENCH_MS;
            warn!(
                queue = self.received_states.len(),
                "receive queue full, quenching new states for {RECEIVER_QUENCH_MS} ms"
            );
        }

        let new_num = inst.new_num;
        self.received_states
            .insert(TimestampedState::new(now, new_num, new_state));

        if self.received_states.back().num != new_num {
            debug!(new_num, ack = inst.ack_num, "received out-of-order state");
            return Ok(());
        }

        if self.verbose {
            debug!(new_num, ack = inst.ack_num, diff_len = inst.diff_bytes().len(), "received state");
        }

        self.sender.set_ack_num(new_num);
        self.sender.remote_heard(now);
        if inst.has_diff() {
            self.sender.set_data_ack();
        }
        Ok(())
    }

    /// 前回の呼び出し以降に相手の状態がどう変わったか
    ///
    /// 最古の受信状態を共通部分として差し引き、最新の状態を次の基準にする。
    pub fn get_remote_diff(&mut self) -> Vec<u8> {
        let diff = self.received_states.back().state.diff_from(&self.last_receiver_state);

        let oldest = self.received_states.front().state.clone();
        for entry in self.received_states.iter_mut().rev() {
            entry.state.subtract(&oldest);
        }
        self.last_receiver_state = self.received_states.back().state.clone();

        diff
    }

    /// 休止から復帰した直後か
    pub fn awaken(&self, now: u64) -> bool {
        awaken::awaken(
            &self.sender.sent_states().timestamps(),
            &self.received_states.timestamps(),
            now,
        )
    }

    pub fn latest_remote_state(&self) -> &TimestampedState<R> {
        self.received_states.back()
    }

    pub fn remote_state_num(&self) -> u64 {
        self.received_states.back().num
    }

    pub fn received_states(&self) -> &StateHistory<R> {
        &self.received_states
    }

    pub fn current_state(&self) -> &S {
        self.sender.current_state()
    }

    pub fn current_state_mut(&mut self) -> &mut S {
        self.sender.current_state_mut()
    }

    pub fn set_current_state(&mut self, state: S) {
        self.sender.set_current_state(state);
    }

    pub fn start_shutdown(&mut self, now: u64) {
        self.sender.start_shutdown(now);
    }

    pub fn shutdown_in_progress(&self) -> bool {
        self.sender.shutdown_in_progress()
    }

    pub fn shutdown_acknowledged(&self) -> bool {
        self.sender.shutdown_acknowledged()
    }

    pub fn shutdown_ack_timed_out(&self, now: u64) -> bool {
        self.sender.shutdown_ack_timed_out(now)
    }

    /// 相手のシャットダウン（終端状態）への ack を送った
    pub fn counterparty_shutdown_ack_sent(&self) -> bool {
        self.sender.counterparty_shutdown_ack_sent()
    }

    pub fn has_remote_addr(&self) -> bool {
        self.link.has_remote_addr()
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
        self.sender.set_verbose(verbose);
    }

    pub fn set_send_delay(&mut self, delay_ms: u64) {
        self.sender.set_send_delay(delay_ms);
    }

    pub fn sender(&self) -> &TransportSender<S> {
        &self.sender
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            srtt_ms: self.link.srtt(),
            timeout_ms: self.link.timeout(),
            mtu: self.link.mtu(),
            acked_num: self.sender.sent_states().front().num,
            last_sent_num: self.sender.sent_states().back().num,
            sent_queue_len: self.sender.sent_states().len(),
            remote_num: self.received_states.back().num,
            received_queue_len: self.received_states.len(),
            shutdown_in_progress: self.sender.shutdown_in_progress(),
        }
    }
}
