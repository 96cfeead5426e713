//! 送受信 1 回ぶんのパケット
//!
//! ## 平文（`Message::text`）の構造
//! ```text
//! [timestamp: u16 BE][timestamp_reply: u16 BE][payload: variable]
//! ```
//!
//! シーケンス番号と方向は nonce（`Message::nonce`）側に載る。

use apsh_crypto::{Direction, Message, SEQUENCE_MASK};

use crate::error::{NetworkError, Result};
use crate::timestamp::Timestamp16;

/// 平文先頭のタイムスタンプ 2 つぶんのバイト長
pub const TIMESTAMPS_LEN: usize = 4;

/// 暗号化前 / 復号後のパケット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// プロセス内で一意なシーケンス番号（direction ビットを含まない）
    pub seq: u64,
    pub direction: Direction,
    pub timestamp: Timestamp16,
    /// 相手の最新タイムスタンプのエコー（`Timestamp16::NONE` ならなし）
    pub timestamp_reply: Timestamp16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(
        seq: u64,
        direction: Direction,
        timestamp: Timestamp16,
        timestamp_reply: Timestamp16,
        payload: Vec<u8>,
    ) -> Self {
        Packet {
            seq: seq & SEQUENCE_MASK,
            direction,
            timestamp,
            timestamp_reply,
            payload,
        }
    }

    /// 復号済み Message からパケットを復元する
    ///
    /// # エラー
    /// - `NetworkError::PacketTooShort`: 平文がタイムスタンプ分（4 バイト）未満
    pub fn from_message(message: Message) -> Result<Self> {
        let text = message.text;
        if text.len() < TIMESTAMPS_LEN {
            return Err(NetworkError::PacketTooShort(text.len()));
        }

        let nonce_val = message.nonce.val();
        let timestamp = Timestamp16(u16::from_be_bytes([text[0], text[1]]));
        let timestamp_reply = Timestamp16(u16::from_be_bytes([text[2], text[3]]));

        Ok(Packet {
            seq: nonce_val & SEQUENCE_MASK,
            direction: Direction::from_seq(nonce_val),
            timestamp,
            timestamp_reply,
            payload: text[TIMESTAMPS_LEN..].to_vec(),
        })
    }

    /// 暗号化に渡す Message を組み立てる
    pub fn to_message(&self) -> Message {
        let mut text = Vec::with_capacity(TIMESTAMPS_LEN + self.payload.len());
        text.extend_from_slice(&self.timestamp.raw().to_be_bytes());
        text.extend_from_slice(&self.timestamp_reply.raw().to_be_bytes());
        text.extend_from_slice(&self.payload);

        Message::new(self.direction.apply_to_seq(self.seq), text)
    }
}
