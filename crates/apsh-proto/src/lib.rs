//! # apsh-proto
//!
//! SSP (State Synchronization Protocol) の Instruction メッセージ定義と
//! エンコード/デコードユーティリティ。
//!
//! ## Instruction の役割
//!
//! SSP の Instruction は、以下の情報を一つのメッセージに格納する：
//! - `old_num` / `new_num`: 送信側の状態番号（差分の起点と終点）
//! - `ack_num`: 受信確認済みの相手側状態番号
//! - `throwaway_num`: これより古い状態は破棄可能
//! - `diff`: 状態差分データ
//! - `chaff`: 長さを散らすための乱数バイト（意味なし、0〜16バイト）
//!
//! ```protobuf
//! message Instruction {
//!   uint32 protocol_version = 1;
//!   uint64 old_num = 2;
//!   uint64 new_num = 3;
//!   uint64 ack_num = 4;
//!   uint64 throwaway_num = 5;
//!   optional bytes diff = 6;
//!   optional bytes chaff = 7;
//! }
//! ```

use prost::Message as _;

pub mod error;

pub use error::ProtoError;

/// SSP プロトコルバージョン（完全一致のみ受け付ける。ネゴシエーションなし）
pub const PROTOCOL_VERSION: u32 = 2;

/// `new_num` の予約値：接続のシャットダウンを表す
pub const SHUTDOWN_NUM: u64 = u64::MAX;

/// SSP の転送単位
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Instruction {
    #[prost(uint32, tag = "1")]
    pub protocol_version: u32,
    #[prost(uint64, tag = "2")]
    pub old_num: u64,
    #[prost(uint64, tag = "3")]
    pub new_num: u64,
    #[prost(uint64, tag = "4")]
    pub ack_num: u64,
    #[prost(uint64, tag = "5")]
    pub throwaway_num: u64,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub diff: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub chaff: Option<Vec<u8>>,
}

impl Instruction {
    /// 現在のプロトコルバージョンで Instruction を組み立てる
    ///
    /// # 引数
    /// - `old_num`: 差分の起点となる状態番号
    /// - `new_num`: 差分適用後の状態番号（`SHUTDOWN_NUM` はシャットダウン）
    /// - `ack_num`: 相手から受信済みの最新状態番号
    /// - `throwaway_num`: これより古い状態は破棄可能
    pub fn new(
        old_num: u64,
        new_num: u64,
        ack_num: u64,
        throwaway_num: u64,
        diff: Vec<u8>,
        chaff: Vec<u8>,
    ) -> Self {
        Instruction {
            protocol_version: PROTOCOL_VERSION,
            old_num,
            new_num,
            ack_num,
            throwaway_num,
            diff: Some(diff),
            chaff: Some(chaff),
        }
    }

    /// バイト列から Instruction をデコードする
    ///
    /// プロトコルバージョンの検査は行わない（呼び出し側の責務）。
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(Instruction::decode(bytes)?)
    }

    /// Instruction をバイト列にエンコードする
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// diff フィールドの参照を返す（None の場合は空スライス）
    pub fn diff_bytes(&self) -> &[u8] {
        self.diff.as_deref().unwrap_or(&[])
    }

    /// 空でない diff を持つか
    pub fn has_diff(&self) -> bool {
        !self.diff_bytes().is_empty()
    }

    /// シャットダウン（`new_num == SHUTDOWN_NUM`）の Instruction か
    pub fn is_shutdown(&self) -> bool {
        self.new_num == SHUTDOWN_NUM
    }
}
