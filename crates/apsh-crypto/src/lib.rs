//! # apsh-crypto
//!
//! AES-128-OCB3 暗号プリミティブ実装
//!
//! ## 暗号化仕様
//!
//! ```text
//! UDP ペイロード構造:
//!   [nonce_tail: 8bytes][ciphertext + auth_tag: variable]
//!
//! Nonce（12バイト）:
//!   bytes[0..4]  = 0x00000000 (ゼロパディング、送信時省略)
//!   bytes[4..12] = direction_seq as u64, big-endian
//!
//! direction_seq:
//!   bit 63       = direction (TO_SERVER=0, TO_CLIENT=1)
//!   bit 0..62    = SeqCounter が払い出すシーケンス番号
//! ```
//!
//! 平文（`Message::text`）の中身はネットワーク層（apsh-network）が組み立てる。

mod error;
mod key;
mod nonce;
mod seq;
mod session;

pub use error::CryptoError;
pub use key::{Base64Key, KEY_LEN};
pub use nonce::{Message, Nonce, NONCE_LEN, NONCE_TAIL_LEN};
pub use seq::SeqCounter;
pub use session::CryptoSession;

/// direction_seq の direction ビット
pub const DIRECTION_MASK: u64 = 1u64 << 63;

/// direction_seq のシーケンス番号部分
pub const SEQUENCE_MASK: u64 = !DIRECTION_MASK;

/// パケットの方向（TO_SERVER or TO_CLIENT）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// クライアント → サーバー (bit 63 = 0)
    ToServer = 0,
    /// サーバー → クライアント (bit 63 = 1)
    ToClient = 1,
}

impl Direction {
    /// direction_seq の MSB から方向を判定する
    pub fn from_seq(direction_seq: u64) -> Self {
        if direction_seq & DIRECTION_MASK == 0 {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// direction を seq の MSB に適用する
    pub fn apply_to_seq(&self, seq: u64) -> u64 {
        match self {
            Direction::ToServer => seq & SEQUENCE_MASK,
            Direction::ToClient => (seq & SEQUENCE_MASK) | DIRECTION_MASK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_to_server() {
        assert_eq!(Direction::from_seq(0x0000_0000_0000_0001), Direction::ToServer);
    }

    #[test]
    fn test_direction_to_client() {
        assert_eq!(Direction::from_seq(0x8000_0000_0000_0001), Direction::ToClient);
    }

    #[test]
    fn test_direction_apply_to_seq() {
        let seq: u64 = 42;
        let ts = Direction::ToServer.apply_to_seq(seq);
        assert_eq!(ts >> 63, 0);
        assert_eq!(ts & SEQUENCE_MASK, 42);

        let tc = Direction::ToClient.apply_to_seq(seq);
        assert_eq!(tc >> 63, 1);
        assert_eq!(tc & SEQUENCE_MASK, 42);
        assert_eq!(Direction::from_seq(tc), Direction::ToClient);
    }

    #[test]
    fn test_direction_bit_never_leaks_into_seq() {
        // seq 側に MSB が立っていても ToServer では落とされる
        let ts = Direction::ToServer.apply_to_seq(u64::MAX);
        assert_eq!(ts, SEQUENCE_MASK);
    }
}
