//! セッションのイベントループ
//!
//! `Transport` を 1 つのタスクから駆動する。1 回の `run_once` で
//! 「待つ → 受信して適用 → 必要なら送信」を行う。ソケットの追加・削除
//! （ポートホップ）もこのループの中でしか起きない。

use std::net::SocketAddr;

use apsh_network::{timestamp, Connection, NetworkError};
use apsh_ssp::{State, Transport, TransportError, TransportStats};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;

pub struct Session<S: State, R: State> {
    transport: Transport<S, R, Connection>,
    config: SessionConfig,
}

impl<S: State, R: State> Session<S, R> {
    /// サーバー側のセッションを開く（鍵は乱数で生成）
    ///
    /// # エラー
    /// - `ApshError::Network`: 範囲内のどのポートにもバインドできない
    pub fn server(config: SessionConfig, initial_state: S, initial_remote: R) -> Result<Self> {
        let connection = Connection::server(&config.network)?;
        info!(local = ?connection.local_addr(), "server session listening");
        Ok(Self::with_connection(connection, config, initial_state, initial_remote))
    }

    /// クライアント側のセッションを開く
    ///
    /// # 引数
    /// - `key`: サーバーが表示した印字可能な鍵
    /// - `remote`: サーバーのアドレス
    pub fn client(
        config: SessionConfig,
        key: &str,
        remote: SocketAddr,
        initial_state: S,
        initial_remote: R,
    ) -> Result<Self> {
        let connection = Connection::client(key, remote)?;
        info!(%remote, "client session started");
        Ok(Self::with_connection(connection, config, initial_state, initial_remote))
    }

    /// 開いたコネクションからセッションを作る
    pub fn with_connection(connection: Connection, config: SessionConfig, initial_state: S, initial_remote: R) -> Self {
        let mut transport = Transport::new(connection, initial_state, initial_remote, timestamp::now_ms());
        transport.set_verbose(config.verbose);
        transport.set_send_delay(config.send_mindelay_ms);
        Session { transport, config }
    }

    /// ループを 1 回まわす
    ///
    /// 参照状態の欠落と壊れた diff はログに残して捨てる（相手の再送で回復する）。
    /// 送信の失敗も捨てる（最後のエラーは `Connection::send_error` に残る）。
    ///
    /// # 戻り値
    /// データグラムを受け取ったら `true`
    ///
    /// # エラー
    /// - `ApshError::Transport`: バージョン不一致、受信待ちの失敗、Instruction を分割できない
    pub fn run_once(&mut self) -> Result<bool> {
        let wait = self
            .transport
            .wait_time(timestamp::now_ms())
            .min(self.config.max_wait_ms);

        let received = match self.transport.recv(wait) {
            Ok(received) => received,
            Err(e @ (TransportError::MissingReference { .. } | TransportError::State(_))) => {
                warn!(error = %e, "instruction rejected");
                true
            }
            Err(e) => return Err(e.into()),
        };

        match self.transport.tick(timestamp::now_ms()) {
            Ok(()) => {}
            Err(TransportError::Network(e @ (NetworkError::Io(_) | NetworkError::ShortWrite { .. }))) => {
                debug!(error = %e, "send failed, will retransmit");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(received)
    }

    /// シャットダウンを始める（2 回目以降は何もしない）
    pub fn start_shutdown(&mut self) {
        if !self.transport.shutdown_in_progress() {
            debug!("starting shutdown");
        }
        self.transport.start_shutdown(timestamp::now_ms());
    }

    /// シャットダウンが終わった（相手の ack を受け取ったか、諦めた）
    pub fn shutdown_finished(&self) -> bool {
        self.transport.shutdown_acknowledged() || self.transport.shutdown_ack_timed_out(timestamp::now_ms())
    }

    /// シャットダウンを始めて、終わるまでループをまわす
    ///
    /// # 戻り値
    /// 相手が ack を返したら `true`、タイムアウトなら `false`
    pub fn shutdown(&mut self) -> Result<bool> {
        self.start_shutdown();
        while !self.shutdown_finished() {
            self.run_once()?;
        }

        let acknowledged = self.transport.shutdown_acknowledged();
        if acknowledged {
            debug!("shutdown acknowledged");
        } else {
            warn!(tries = self.transport.sender().shutdown_tries(), "shutdown ack timed out");
        }
        Ok(acknowledged)
    }

    /// 前回の呼び出し以降の相手の状態の変化
    pub fn get_remote_diff(&mut self) -> Vec<u8> {
        self.transport.get_remote_diff()
    }

    pub fn current_state(&self) -> &S {
        self.transport.current_state()
    }

    pub fn current_state_mut(&mut self) -> &mut S {
        self.transport.current_state_mut()
    }

    pub fn set_current_state(&mut self, state: S) {
        self.transport.set_current_state(state);
    }

    /// 休止から復帰した直後か
    pub fn awaken(&self) -> bool {
        self.transport.awaken(timestamp::now_ms())
    }

    /// クライアントに渡す印字可能な鍵
    pub fn key(&self) -> String {
        self.transport.link().key()
    }

    pub fn port(&self) -> Option<u16> {
        self.transport.link().port()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.link().local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.link().remote_addr()
    }

    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport<S, R, Connection> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport<S, R, Connection> {
        &mut self.transport
    }
}
