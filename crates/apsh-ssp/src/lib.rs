//! # apsh-ssp
//!
//! SSP (State Synchronization Protocol) の送受信状態機械。
//!
//! ## SSP の概要
//!
//! SSP はバイトストリームではなく「状態」を同期する。途中の状態は飛ばしてよく、
//! 相手が最終的に最新の状態に追いつくことだけを保証する。
//!
//! ### キーコンセプト
//!
//! - **状態番号 (num)**: 送信した状態のスナップショットに振る単調増加の番号
//! - **Instruction**: `old_num` の状態から `new_num` の状態への diff
//! - **ack_num**: 相手から受け取った最新の状態番号
//! - **throwaway_num**: これより古い状態は参照されないので捨ててよい
//! - **仮定状態**: 最近送った状態は ack がなくても届いたと仮定して diff を小さくする
//! - **シャットダウン**: `new_num = u64::MAX` の状態を送り、その ack を待つ
//!
//! ## 時間の扱い
//!
//! 状態機械は時計を持たない。`tick(now)` / `wait_time(now)` のように
//! 呼び出し側が現在時刻（ms）を渡す。
//!
//! ```text
//! loop {
//!     wait = transport.wait_time(now)
//!     transport.recv(min(wait, 上限))   // 受信して適用
//!     transport.tick(now)               // 必要なら送信
//! }
//! ```

pub mod awaken;
pub mod error;
pub mod history;
pub mod sender;
pub mod state;
pub mod transport;

pub use awaken::AwakenState;
pub use error::{StateError, TransportError};
pub use history::StateHistory;
pub use sender::TransportSender;
pub use state::{State, TimestampedState};
pub use transport::{Transport, TransportStats};

pub use apsh_proto::{PROTOCOL_VERSION, SHUTDOWN_NUM};

/// 送信間隔の下限（ms）
pub const SEND_INTERVAL_MIN: u64 = 20;

/// 送信間隔の上限（ms）
pub const SEND_INTERVAL_MAX: u64 = 250;

/// ハートビート（空の ack）の間隔（ms）
pub const ACK_INTERVAL: u64 = 3000;

/// データを受け取ってから ack を返すまでの猶予（ms）
pub const ACK_DELAY: u64 = 100;

/// シャットダウンを送り直す回数の上限
pub const SHUTDOWN_RETRIES: u32 = 16;

/// シャットダウンの ack を待つ時間の上限（ms）
pub const SHUTDOWN_TIMEOUT: u64 = 10_000;

/// 相手から最後に聞いてからこの時間内なら再送を続ける（ms）
pub const ACTIVE_RETRY_TIMEOUT: u64 = 10_000;

/// 連続した変更をまとめるための最小待ち時間（ms）
pub const SEND_MINDELAY: u64 = 8;

/// 送信済み状態の履歴の上限
pub const SENT_STATES_CAP: usize = 32;

/// 受信状態の履歴の上限
pub const RECEIVE_QUEUE_CAP: usize = 1024;

/// 受信履歴が溢れたとき、新しい状態を断る時間（ms）
pub const RECEIVER_QUENCH_MS: u64 = 15_000;

#[cfg(test)]
pub(crate) mod testing {
    //! テスト用のメモリ上のリンクと、文字列を全置換する状態

    use std::collections::VecDeque;

    use apsh_network::{Fragment, FragmentAssembly, Link, NetworkError};
    use apsh_proto::Instruction;

    use crate::error::StateError;
    use crate::state::State;

    pub struct MockLink {
        pub sent: Vec<Vec<u8>>,
        pub inbox: VecDeque<Vec<u8>>,
        pub srtt: f64,
        pub timeout: u64,
        pub mtu: usize,
        pub has_remote: bool,
        pub last_roundtrip: u64,
        pub fail_send: bool,
    }

    impl MockLink {
        pub fn new() -> Self {
            MockLink {
                sent: Vec::new(),
                inbox: VecDeque::new(),
                srtt: 100.0,
                timeout: 1000,
                mtu: 1280,
                has_remote: true,
                last_roundtrip: 0,
                fail_send: false,
            }
        }

        /// 送られた Fragment を Instruction に組み立て直す
        pub fn sent_instructions(&self) -> Vec<Instruction> {
            let mut assembly = FragmentAssembly::new();
            let mut out = Vec::new();
            for payload in &self.sent {
                let frag = Fragment::from_bytes(payload).unwrap();
                if assembly.add_fragment(frag) {
                    out.push(assembly.get_assembly().unwrap());
                }
            }
            out
        }
    }

    impl Link for MockLink {
        fn send(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
            if self.fail_send {
                return Err(NetworkError::Io(std::io::ErrorKind::ConnectionRefused.into()));
            }
            self.sent.push(payload.to_vec());
            Ok(())
        }

        fn recv(&mut self, _timeout_ms: u64) -> Result<Option<Vec<u8>>, NetworkError> {
            Ok(self.inbox.pop_front())
        }

        fn timeout(&self) -> u64 {
            self.timeout
        }

        fn srtt(&self) -> f64 {
            self.srtt
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        fn has_remote_addr(&self) -> bool {
            self.has_remote
        }

        fn set_last_roundtrip_success(&mut self, timestamp_ms: u64) {
            self.last_roundtrip = timestamp_ms;
        }
    }

    /// diff は `=` に続く全文（変化がなければ空）
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct Text(pub String);

    impl From<&str> for Text {
        fn from(s: &str) -> Self {
            Text(s.to_string())
        }
    }

    impl State for Text {
        fn subtract(&mut self, _other: &Self) {}

        fn diff_from(&self, existing: &Self) -> Vec<u8> {
            if self == existing {
                return Vec::new();
            }
            self.init_diff()
        }

        fn init_diff(&self) -> Vec<u8> {
            let mut out = b"=".to_vec();
            out.extend_from_slice(self.0.as_bytes());
            out
        }

        fn apply_string(&mut self, diff: &[u8]) -> Result<(), StateError> {
            if diff.is_empty() {
                return Ok(());
            }
            let body = diff
                .strip_prefix(b"=")
                .ok_or_else(|| StateError::CorruptDiff("missing marker".into()))?;
            let text = std::str::from_utf8(body).map_err(|e| StateError::CorruptDiff(e.to_string()))?;
            self.0 = text.to_string();
            Ok(())
        }
    }
}
